//! Write-allowlist checker (§4.3). Pluggable: defined and exposed, but not
//! automatically enforced by the orchestrator post-iteration (§9 Open Question 1).

use glob::Pattern;

/// Return the subset of `changed_paths` that does not match any glob in `allow_globs`.
pub fn check<'a>(changed_paths: &'a [String], allow_globs: &[String]) -> Vec<&'a str> {
    let patterns: Vec<Pattern> = allow_globs
        .iter()
        .filter_map(|g| Pattern::new(g).ok())
        .collect();

    changed_paths
        .iter()
        .filter(|path| !patterns.iter().any(|p| p.matches(path)))
        .map(String::as_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_paths_outside_the_allowlist() {
        let changed = vec![
            ".jeeves/issue.json".to_string(),
            "src/main.py".to_string(),
        ];
        let allowed = vec![".jeeves/*".to_string()];
        assert_eq!(check(&changed, &allowed), vec!["src/main.py"]);
    }

    #[test]
    fn recursive_glob_covers_nested_paths() {
        let changed = vec![".jeeves/sub/dir/file.txt".to_string()];
        let allowed = vec![".jeeves/**".to_string()];
        assert!(check(&changed, &allowed).is_empty());
    }

    #[test]
    fn empty_allowlist_flags_everything() {
        let changed = vec!["a.txt".to_string()];
        assert_eq!(check(&changed, &[]), vec!["a.txt"]);
    }
}
