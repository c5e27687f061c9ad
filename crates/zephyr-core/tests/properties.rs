//! Property tests for the pure engines: glob, trigger matcher, matrix.

use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};

use zephyr_core::glob::glob_match;
use zephyr_core::matrix;
use zephyr_core::pipeline::{
    JobDef, MatrixSpec, RunnerSpec, StepDef, TriggerEvent, TriggerRule, TriggerType,
    default_pr_events,
};
use zephyr_core::trigger;

fn ident() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,7}"
}

fn axis_values() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::vec("[a-z0-9]{1,4}", 1..4).prop_map(|values| {
        let mut seen = HashSet::new();
        values
            .into_iter()
            .filter(|value| seen.insert(value.clone()))
            .collect()
    })
}

fn matrix_axes() -> impl Strategy<Value = BTreeMap<String, Vec<String>>> {
    proptest::collection::btree_map(ident(), axis_values(), 1..4)
}

fn job_with_matrix(spec: MatrixSpec) -> JobDef {
    JobDef {
        name: "test".to_string(),
        runner: RunnerSpec::default(),
        depends_on: vec![],
        env: HashMap::new(),
        steps: vec![StepDef {
            name: "step".to_string(),
            run: "true".to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            continue_on_error: false,
            timeout_secs: None,
            condition: None,
        }],
        matrix: Some(spec),
        retry: None,
        timeout_secs: None,
        condition: None,
    }
}

fn full_product(values: &BTreeMap<String, Vec<String>>) -> Vec<BTreeMap<String, String>> {
    let mut combos: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
    for (axis, axis_values) in values {
        let mut next = Vec::new();
        for combo in &combos {
            for value in axis_values {
                let mut extended = combo.clone();
                extended.insert(axis.clone(), value.clone());
                next.push(extended);
            }
        }
        combos = next;
    }
    combos
}

proptest! {
    /// |expand| = ∏|axis| − |exclude matches| + |include|.
    #[test]
    fn matrix_cardinality(
        values in matrix_axes(),
        exclude_picks in proptest::collection::vec(any::<prop::sample::Index>(), 0..3),
        include_count in 0usize..3,
    ) {
        let product = full_product(&values);
        let product_len = product.len();

        // Distinct full-row excludes sampled from the product.
        let mut exclude: Vec<BTreeMap<String, String>> = Vec::new();
        for pick in &exclude_picks {
            let row = pick.get(&product).clone();
            if !exclude.contains(&row) {
                exclude.push(row);
            }
        }
        let excluded = exclude.len();

        // Includes introduce an axis no product row has, so they never
        // collide with surviving combinations.
        let include: Vec<BTreeMap<String, String>> = (0..include_count)
            .map(|i| BTreeMap::from([("extra".to_string(), format!("v{i}"))]))
            .collect();

        let spec = MatrixSpec {
            values,
            include: include.clone(),
            exclude,
            max_parallel: None,
            fail_fast: false,
        };
        let members = matrix::expand(&job_with_matrix(spec)).unwrap();
        prop_assert_eq!(members.len(), product_len - excluded + include.len());
    }

    /// Emitted names are unique and a pure function of base + combination.
    #[test]
    fn matrix_names_are_stable_and_unique(values in matrix_axes()) {
        let spec = MatrixSpec {
            values,
            include: vec![],
            exclude: vec![],
            max_parallel: None,
            fail_fast: false,
        };
        let job = job_with_matrix(spec);
        let first = matrix::expand(&job).unwrap();
        let second = matrix::expand(&job).unwrap();

        let first_names: Vec<String> = first.iter().map(|m| m.def.name.clone()).collect();
        let second_names: Vec<String> = second.iter().map(|m| m.def.name.clone()).collect();
        prop_assert_eq!(&first_names, &second_names);

        let unique: HashSet<&String> = first_names.iter().collect();
        prop_assert_eq!(unique.len(), first_names.len());
    }

    /// Literal patterns (no metacharacters) match exactly themselves.
    #[test]
    fn literal_glob_is_equality(value in "[a-zA-Z0-9_./-]{0,16}", other in "[a-zA-Z0-9_./-]{0,16}") {
        prop_assert!(glob_match(&value, &value));
        prop_assert_eq!(glob_match(&value, &other), value == other);
    }

    /// `*` splices into any prefix/suffix pair.
    #[test]
    fn star_matches_any_infix(prefix in "[a-z]{0,6}", infix in "[a-z/]{0,8}", suffix in "[a-z]{0,6}") {
        let pattern = format!("{prefix}*{suffix}");
        let value = format!("{prefix}{infix}{suffix}");
        prop_assert!(glob_match(&pattern, &value));
    }

    /// The matcher is deterministic, and ignore filters dominate.
    #[test]
    fn trigger_matcher_is_pure_and_ignore_dominates(
        branch in "[a-z]{1,8}",
        extra_branch in "[a-z]{1,8}",
        paths in proptest::collection::vec("[a-z]{1,6}\\.[a-z]{2}", 0..4),
    ) {
        let event = TriggerEvent::Push {
            branch: branch.clone(),
            changed_paths: paths,
        };
        let permissive = TriggerRule {
            trigger_type: TriggerType::Push,
            branches: vec![branch.clone(), extra_branch],
            branches_ignore: vec![],
            paths: vec![],
            paths_ignore: vec![],
            tags: vec![],
            pr_events: default_pr_events(),
        };
        let rules = vec![permissive.clone()];
        prop_assert_eq!(trigger::matches(&event, &rules), trigger::matches(&event, &rules));
        prop_assert!(trigger::matches(&event, &rules));

        // The same branch in branches_ignore vetoes the match outright.
        let mut vetoed = permissive;
        vetoed.branches_ignore = vec![branch];
        prop_assert!(!trigger::matches(&event, &[vetoed]));
    }

    /// pathsIgnore strictly dominates paths.
    #[test]
    fn paths_ignore_dominates(file in "[a-z]{1,8}\\.md") {
        let event = TriggerEvent::Push {
            branch: "main".to_string(),
            changed_paths: vec![file.clone()],
        };
        let rule = TriggerRule {
            trigger_type: TriggerType::Push,
            branches: vec![],
            branches_ignore: vec![],
            paths: vec![file],
            paths_ignore: vec!["*.md".to_string()],
            tags: vec![],
            pr_events: default_pr_events(),
        };
        prop_assert!(!trigger::matches(&event, &[rule]));
    }
}
