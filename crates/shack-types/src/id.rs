//! Identifier validation shared by storage ids and in-storage keys.
//!
//! Ids double as file and directory names on disk, so the rules reject
//! anything a filesystem would refuse or interpret specially:
//! - any of `\ / : * ? " < > |`
//! - a leading `.`
//! - the reserved device names `nul`, `prn`, `con`, `lpt0`-`lpt9`,
//!   `com0`-`com9` (case-insensitive), alone or followed by a `.`
//! - the empty string

const FORBIDDEN_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

const RESERVED_NAMES: &[&str] = &["nul", "prn", "con"];

const RESERVED_NUMBERED: &[&str] = &["lpt", "com"];

/// Returns true if `name` is a legal storage id or key.
pub fn is_valid_id(name: &str) -> bool {
    if name.is_empty() || name.starts_with('.') {
        return false;
    }
    if name.contains(FORBIDDEN_CHARS) {
        return false;
    }
    !is_reserved_name(name)
}

fn is_reserved_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();

    let stem_ends = |rest: &str| rest.is_empty() || rest.starts_with('.');

    if RESERVED_NAMES
        .iter()
        .any(|reserved| lower.strip_prefix(reserved).is_some_and(stem_ends))
    {
        return true;
    }

    RESERVED_NUMBERED.iter().any(|prefix| {
        lower
            .strip_prefix(prefix)
            .and_then(|rest| {
                let mut chars = rest.chars();
                match chars.next() {
                    Some(c) if c.is_ascii_digit() => Some(chars.as_str()),
                    _ => None,
                }
            })
            .is_some_and(stem_ends)
    })
}
