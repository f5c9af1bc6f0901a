//! Name and key normalization
//!
//! Group names, usernames, display names, and permission keys are all
//! unique ignoring case. Every registry, directory, and session-table
//! lookup folds through [`fold`] exactly once at the boundary so the
//! uniqueness invariants are enforced in one place.

use std::sync::OnceLock;

use regex::Regex;

/// Maximum length for usernames and display names.
pub const MAX_NAME_LEN: usize = 16;

/// Fold a name or permission key to its canonical lookup form.
pub fn fold(s: &str) -> String {
    s.to_lowercase()
}

fn key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([a-z]+\.)+([a-z]+|\*)$").expect("key regex"))
}

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("name regex"))
}

/// Check a permission key or group pattern against the key grammar:
/// lowercase dot-separated segments, with `*` allowed as the final
/// segment. Fold the key first; the grammar itself is lowercase-only.
pub fn valid_permission_key(key: &str) -> bool {
    key_regex().is_match(key)
}

/// Check a group pattern: a permission key, a key ending in `*` at a
/// segment boundary, or the literal `*` super-wildcard.
pub fn valid_pattern(pattern: &str) -> bool {
    pattern == "*" || valid_permission_key(pattern)
}

/// Username and display-name rule: alphanumeric plus underscore,
/// bounded length.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LEN && name_regex().is_match(name)
}
