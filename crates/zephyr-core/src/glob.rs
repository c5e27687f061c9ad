//! The glob grammar used by trigger filters.
//!
//! `*` matches any run of characters, `?` matches a single character, and
//! every other character is literal. Patterns match the entire string.

use regex::Regex;

/// Check whether `value` matches the glob `pattern`.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    match Regex::new(&glob_to_regex(pattern)) {
        Ok(re) => re.is_match(value),
        Err(_) => false,
    }
}

/// Check whether `value` matches any of the given glob patterns.
pub fn any_match(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| glob_match(p, value))
}

fn glob_to_regex(pattern: &str) -> String {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    re
}
