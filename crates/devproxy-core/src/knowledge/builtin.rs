use once_cell::sync::Lazy;

use super::{parse_patterns, IssuePattern};

const BUILTIN_SOURCE: &str = include_str!("builtin.toml");

static BUILTIN: Lazy<Vec<IssuePattern>> =
    Lazy::new(|| parse_patterns(BUILTIN_SOURCE, "builtin.toml").expect("valid builtin patterns"));

/// The shipped patterns, compiled once per process.
pub fn builtin_patterns() -> &'static [IssuePattern] {
    &BUILTIN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_source_parses() {
        let patterns = parse_patterns(BUILTIN_SOURCE, "builtin.toml").expect("parse");
        assert_eq!(patterns.len(), 6);
        let asset = patterns
            .iter()
            .find(|p| p.id() == "broken_asset_paths")
            .unwrap();
        assert_eq!(asset.spec.solutions.len(), 2);
    }
}
