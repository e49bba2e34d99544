//! `.gitignore` maintenance

/// Append the patterns missing from `existing`
///
/// Returns `None` when every pattern is already present. Existing lines,
/// including comments and their order, are preserved.
pub fn merge_patterns(existing: &str, patterns: &[&str]) -> Option<String> {
    let present: Vec<&str> = existing.lines().map(str::trim).collect();
    let mut missing: Vec<&str> = Vec::new();
    for pattern in patterns {
        if !present.contains(pattern) && !missing.contains(pattern) {
            missing.push(pattern);
        }
    }

    if missing.is_empty() {
        return None;
    }

    let mut merged = existing.to_string();
    if !merged.is_empty() && !merged.ends_with('\n') {
        merged.push('\n');
    }
    for pattern in missing {
        merged.push_str(pattern);
        merged.push('\n');
    }
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATTERNS: &[&str] = &[".*", "!.gitignore", "/db_dumps/"];

    #[test]
    fn test_empty_file_gets_all_patterns() {
        assert_eq!(
            merge_patterns("", PATTERNS).unwrap(),
            ".*\n!.gitignore\n/db_dumps/\n"
        );
    }

    #[test]
    fn test_existing_entries_are_not_duplicated() {
        let existing = "*.pyc\n.*\n";
        assert_eq!(
            merge_patterns(existing, PATTERNS).unwrap(),
            "*.pyc\n.*\n!.gitignore\n/db_dumps/\n"
        );
    }

    #[test]
    fn test_complete_file_is_untouched() {
        let existing = "/db_dumps/\n  .*  \n!.gitignore";
        assert_eq!(merge_patterns(existing, PATTERNS), None);
    }

    #[test]
    fn test_missing_trailing_newline() {
        assert_eq!(
            merge_patterns("node_modules", &["/db_dumps/"]).unwrap(),
            "node_modules\n/db_dumps/\n"
        );
    }
}
