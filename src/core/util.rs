//! Small stateless helpers shared across plugins.

use regex::Regex;

/// Constant-time byte comparison, used to compare secrets without leaking
/// timing information about where the first mismatch occurs.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Rewrites `path` using the first `(pattern, template)` pair whose pattern
/// matches, expanding capture group references (`$1`, `$name`, ...) in the
/// template. Returns `path` unchanged if no pattern matches.
pub fn apply_regex_uri_template(path: &str, patterns: &[(Regex, String)]) -> String {
    for (re, template) in patterns {
        if let Some(captures) = re.captures(path) {
            let mut expanded = String::new();
            captures.expand(template, &mut expanded);
            return expanded;
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"secret", b"secret"));
    }

    #[test]
    fn constant_time_eq_rejects_mismatched_length() {
        assert!(!constant_time_eq(b"short", b"longer-value"));
    }

    #[test]
    fn constant_time_eq_rejects_different_bytes() {
        assert!(!constant_time_eq(b"secret", b"secreT"));
    }

    #[test]
    fn apply_regex_uri_template_rewrites_first_match() {
        let patterns = vec![(Regex::new("^/old/(.*)$").unwrap(), "/new/$1".to_string())];
        assert_eq!(apply_regex_uri_template("/old/page", &patterns), "/new/page");
    }

    #[test]
    fn apply_regex_uri_template_passes_through_unmatched() {
        let patterns = vec![(Regex::new("^/old/(.*)$").unwrap(), "/new/$1".to_string())];
        assert_eq!(apply_regex_uri_template("/other", &patterns), "/other");
    }
}
