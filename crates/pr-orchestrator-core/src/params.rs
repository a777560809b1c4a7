//! Named-parameter extraction from a PR description, e.g. `check_regression=abc,def`.

use regex::Regex;

/// A value is valid if every character falls in the allowed class, and a
/// backslash followed by another character requires that character to be
/// alphanumeric or underscore (any other escape sequence is rejected
/// outright); a backslash at the end of the value has nothing to escape and
/// is accepted.
pub fn validate_parameter_value(value: &str) -> bool {
    let chars: Vec<char> = value.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let allowed = c.is_ascii_alphanumeric()
            || matches!(c, ',' | '-' | '+' | '_' | ':' | '.' | '*' | '/' | '\\');
        if !allowed {
            return false;
        }
        if c == '\\' {
            match chars.get(i + 1) {
                Some(next) if !(next.is_ascii_alphanumeric() || *next == '_') => return false,
                _ => {}
            }
        }
        i += 1;
    }
    true
}

/// Locates `name=value` at the start of `description` or immediately after a
/// backtick, newline, or carriage return; `value` runs until whitespace, a
/// backtick, CR, LF, or the end of the string. Returns `None` if the name
/// isn't present or its value fails validation.
pub fn extract_parameter(description: &str, name_pattern: &str) -> Option<String> {
    let pattern = format!(r"(?:^|[`\r\n]){name_pattern}=([^\s`\r\n]*)");
    let re = Regex::new(&pattern).ok()?;
    let captures = re.captures(description)?;
    let value = captures.get(1)?.as_str();
    if value.is_empty() || !validate_parameter_value(value) {
        return None;
    }
    Some(value.to_string())
}

/// `check_regression` or `check_regressions`, either accepted.
pub fn extract_regression_filter(description: &str) -> Option<String> {
    extract_parameter(description, "check_regressions?")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_regression_filter_from_description() {
        let desc = "Fixes a thing.\ncheck_regression=abc,def\nmore text";
        assert_eq!(extract_regression_filter(desc), Some("abc,def".to_string()));
    }

    #[test]
    fn plural_form_is_accepted() {
        let desc = "check_regressions=perf-suite";
        assert_eq!(
            extract_regression_filter(desc),
            Some("perf-suite".to_string())
        );
    }

    #[test]
    fn missing_parameter_is_none() {
        assert_eq!(extract_regression_filter("no parameters here"), None);
    }

    #[test]
    fn rejects_bad_escape_sequences() {
        assert!(!validate_parameter_value(r"abc\$def"));
        assert!(validate_parameter_value(r"abc\_def"));
    }

    #[test]
    fn trailing_backslash_has_nothing_to_escape_and_is_accepted() {
        assert!(validate_parameter_value(r"abc\"));
    }

    #[test]
    fn requires_boundary_before_name() {
        // "xcheck_regression=foo" does not start at a boundary, so no match.
        assert_eq!(extract_regression_filter("xcheck_regression=foo"), None);
    }

    #[test]
    fn allows_full_character_class() {
        let desc = "check_regression=a-b+c_d:e.f*g/h\\_i,j";
        assert_eq!(
            extract_regression_filter(desc),
            Some("a-b+c_d:e.f*g/h\\_i,j".to_string())
        );
    }
}
