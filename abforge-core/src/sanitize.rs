//! Path sanitization and volume-number normalization (spec.md §4.5).

use std::sync::OnceLock;

use regex::Regex;

/// Strips every character that is not alphanumeric, space, hyphen,
/// underscore, dot, or parentheses, then trims whitespace (spec.md §4.5
/// "Path sanitization rule", testable property 8).
pub fn sanitize_path_component(input: &str) -> String {
    let filtered: String = input
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | '(' | ')'))
        .collect();
    filtered.trim().to_string()
}

fn range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*0*(\d+)\s*[,\-]\s*0*(\d+)\s*$").unwrap())
}

fn single_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*0*(\d+)\s*$").unwrap())
}

/// Normalizes volume numbers: `"1,2"`, `"1-2"` -> `"1-2"`; `"01"` -> `"1"`;
/// leading zeros stripped; ranges canonicalized to hyphen form.
/// Anything that doesn't match either shape is returned trimmed, unchanged.
pub fn normalize_volume_number(input: &str) -> String {
    if let Some(caps) = range_re().captures(input) {
        return format!("{}-{}", &caps[1], &caps[2]);
    }
    if let Some(caps) = single_re().captures(input) {
        return caps[1].to_string();
    }
    input.trim().to_string()
}
