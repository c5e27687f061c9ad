//! Trigger matching: a pure predicate over events and rules.

use crate::glob::any_match;
use crate::pipeline::{TriggerEvent, TriggerRule, TriggerType};

/// True when any rule matches the event.
pub fn matches(event: &TriggerEvent, rules: &[TriggerRule]) -> bool {
    rules.iter().any(|rule| rule_matches(event, rule))
}

/// True when the single rule matches the event.
///
/// A rule matches only if its type matches the event's kind and every
/// positive filter succeeds. Ignore filters dominate their positive
/// counterparts: a branch matching `branches_ignore` never matches, and a
/// changed file matching `paths_ignore` never counts toward `paths`.
pub fn rule_matches(event: &TriggerEvent, rule: &TriggerRule) -> bool {
    match event {
        TriggerEvent::Push {
            branch,
            changed_paths,
        } => {
            rule.trigger_type == TriggerType::Push
                && branch_allowed(rule, branch)
                && paths_allowed(rule, changed_paths)
        }
        TriggerEvent::PullRequest {
            action,
            branch,
            changed_paths,
        } => {
            rule.trigger_type == TriggerType::PullRequest
                && rule.pr_events.iter().any(|e| e == action)
                && branch_allowed(rule, branch)
                && paths_allowed(rule, changed_paths)
        }
        TriggerEvent::Tag { name } => {
            rule.trigger_type == TriggerType::Tag
                && (rule.tags.is_empty() || any_match(&rule.tags, name))
        }
        TriggerEvent::Schedule => rule.trigger_type == TriggerType::Schedule,
        TriggerEvent::Manual => rule.trigger_type == TriggerType::Manual,
    }
}

fn branch_allowed(rule: &TriggerRule, branch: &str) -> bool {
    if any_match(&rule.branches_ignore, branch) {
        return false;
    }
    rule.branches.is_empty() || any_match(&rule.branches, branch)
}

fn paths_allowed(rule: &TriggerRule, changed: &[String]) -> bool {
    if rule.paths.is_empty() && rule.paths_ignore.is_empty() {
        return true;
    }
    let surviving: Vec<&String> = changed
        .iter()
        .filter(|path| !any_match(&rule.paths_ignore, path))
        .collect();
    if rule.paths.is_empty() {
        // Ignore-only filter: at least one changed file must survive.
        !surviving.is_empty()
    } else {
        surviving.iter().any(|path| any_match(&rule.paths, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_rule() -> TriggerRule {
        TriggerRule {
            trigger_type: TriggerType::Push,
            branches: vec!["main".to_string(), "develop".to_string()],
            branches_ignore: vec![],
            paths: vec!["src/**".to_string()],
            paths_ignore: vec!["**/*.md".to_string()],
            tags: vec![],
            pr_events: crate::pipeline::default_pr_events(),
        }
    }

    fn push(branch: &str, paths: &[&str]) -> TriggerEvent {
        TriggerEvent::Push {
            branch: branch.to_string(),
            changed_paths: paths.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn push_to_main_changing_source_matches() {
        assert!(rule_matches(&push("main", &["src/x.ts"]), &push_rule()));
    }

    #[test]
    fn push_changing_only_docs_does_not_match() {
        assert!(!rule_matches(&push("main", &["docs/README.md"]), &push_rule()));
    }

    #[test]
    fn push_to_unlisted_branch_does_not_match() {
        assert!(!rule_matches(&push("feature/x", &["src/x.ts"]), &push_rule()));
    }

    #[test]
    fn branches_ignore_dominates_branches() {
        let mut rule = push_rule();
        rule.branches_ignore = vec!["main".to_string()];
        assert!(!rule_matches(&push("main", &["src/x.ts"]), &rule));
        assert!(rule_matches(&push("develop", &["src/x.ts"]), &rule));
    }

    #[test]
    fn paths_ignore_dominates_paths() {
        let rule = push_rule();
        // src/notes.md matches both src/** and **/*.md; ignore wins.
        assert!(!rule_matches(&push("main", &["src/notes.md"]), &rule));
        // A second non-ignored file still satisfies the positive filter.
        assert!(rule_matches(&push("main", &["src/notes.md", "src/a.ts"]), &rule));
    }

    #[test]
    fn ignore_only_rule_requires_a_surviving_file() {
        let rule = TriggerRule {
            trigger_type: TriggerType::Push,
            branches: vec![],
            branches_ignore: vec![],
            paths: vec![],
            paths_ignore: vec!["**/*.md".to_string()],
            tags: vec![],
            pr_events: crate::pipeline::default_pr_events(),
        };
        assert!(!rule_matches(&push("main", &["README.md"]), &rule));
        assert!(rule_matches(&push("main", &["README.md", "src/a.ts"]), &rule));
    }

    #[test]
    fn type_must_match_event_kind() {
        let rule = push_rule();
        let pr = TriggerEvent::PullRequest {
            action: "opened".to_string(),
            branch: "main".to_string(),
            changed_paths: vec!["src/x.ts".to_string()],
        };
        assert!(!rule_matches(&pr, &rule));
    }

    #[test]
    fn pr_action_filter_defaults() {
        let rule = TriggerRule {
            trigger_type: TriggerType::PullRequest,
            branches: vec![],
            branches_ignore: vec![],
            paths: vec![],
            paths_ignore: vec![],
            tags: vec![],
            pr_events: crate::pipeline::default_pr_events(),
        };
        let event = |action: &str| TriggerEvent::PullRequest {
            action: action.to_string(),
            branch: "main".to_string(),
            changed_paths: vec![],
        };
        assert!(rule_matches(&event("opened"), &rule));
        assert!(rule_matches(&event("synchronize"), &rule));
        assert!(rule_matches(&event("reopened"), &rule));
        assert!(!rule_matches(&event("closed"), &rule));
    }

    #[test]
    fn tag_rule_matches_by_glob() {
        let rule = TriggerRule {
            trigger_type: TriggerType::Tag,
            branches: vec![],
            branches_ignore: vec![],
            paths: vec![],
            paths_ignore: vec![],
            tags: vec!["v*".to_string()],
            pr_events: crate::pipeline::default_pr_events(),
        };
        assert!(rule_matches(&TriggerEvent::Tag { name: "v1.2.3".to_string() }, &rule));
        assert!(!rule_matches(&TriggerEvent::Tag { name: "nightly".to_string() }, &rule));
    }

    #[test]
    fn any_rule_suffices() {
        let rules = vec![
            TriggerRule {
                trigger_type: TriggerType::Manual,
                branches: vec![],
                branches_ignore: vec![],
                paths: vec![],
                paths_ignore: vec![],
                tags: vec![],
                pr_events: crate::pipeline::default_pr_events(),
            },
            push_rule(),
        ];
        assert!(matches(&push("main", &["src/x.ts"]), &rules));
        assert!(matches(&TriggerEvent::Manual, &rules));
        assert!(!matches(&TriggerEvent::Schedule, &rules));
    }
}
