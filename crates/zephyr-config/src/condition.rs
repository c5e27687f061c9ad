//! Condition expression resolution.
//!
//! Job and step `if` expressions are resolved to plain booleans here, against
//! the context of the run being scheduled. The scheduler and executor only
//! ever see the resolved values.

use crate::{ConfigError, ConfigResult};

/// The run context conditions are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Branch the run was triggered on, if any.
    pub branch: Option<String>,
    /// Trigger kind ("push", "pull_request", "tag", "schedule", "manual").
    pub trigger_type: String,
}

/// Resolve a condition expression to a boolean.
///
/// Supported forms: `always()`, `never()`, `branch == '<name>'`,
/// `branch != '<name>'`, `trigger == '<kind>'`, `trigger != '<kind>'`.
pub fn resolve(expression: &str, ctx: &RunContext) -> ConfigResult<bool> {
    let expr = expression.trim();
    match expr {
        "always()" => return Ok(true),
        "never()" => return Ok(false),
        _ => {}
    }

    if let Some((subject, operator, literal)) = parse_comparison(expr) {
        let actual = match subject {
            "branch" => ctx.branch.as_deref().unwrap_or(""),
            "trigger" => ctx.trigger_type.as_str(),
            _ => return Err(ConfigError::UnsupportedCondition(expression.to_string())),
        };
        return Ok(match operator {
            "==" => actual == literal,
            "!=" => actual != literal,
            _ => unreachable!(),
        });
    }

    Err(ConfigError::UnsupportedCondition(expression.to_string()))
}

/// Split `subject <op> '<literal>'` into its parts.
fn parse_comparison(expr: &str) -> Option<(&str, &str, &str)> {
    for operator in ["==", "!="] {
        if let Some((lhs, rhs)) = expr.split_once(operator) {
            let subject = lhs.trim();
            let literal = rhs
                .trim()
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))?;
            return Some((subject, operator, literal));
        }
    }
    None
}
