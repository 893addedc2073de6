//! Pure parts of change detection: diff output parsing, merge order and ref handling.

use crate::model::{ChangeStatus, ChangedFile};
use std::collections::BTreeMap;
use std::path::Path;

/// A 7 to 40 character hex string, i.e. something git will treat as an abbreviated commit.
pub fn is_sha_like(reference: &str) -> bool {
    (7..=40).contains(&reference.len()) && reference.chars().all(|c| c.is_ascii_hexdigit())
}

/// Whether `reference` should be used verbatim rather than looked up under `origin/`.
pub fn is_qualified_ref(reference: &str) -> bool {
    reference.contains('/') || is_sha_like(reference)
}

/// Branch to pass to `git fetch origin <branch>`, or `None` when nothing should be fetched.
pub fn fetch_branch(base_ref: &str) -> Option<&str> {
    if is_sha_like(base_ref) {
        return None;
    }
    let branch = base_ref.strip_prefix("origin/").unwrap_or(base_ref);
    if branch.is_empty() { None } else { Some(branch) }
}

/// Split `git diff --name-only -z` output into relative paths.
///
/// With `-z` git neither quotes nor escapes paths, so non-ASCII names come through as-is.
pub fn parse_name_only(output: &str) -> Vec<&str> {
    output.split('\0').filter(|p| !p.is_empty()).collect()
}

/// Merge the three diffs into one list keyed by path.
///
/// Unstaged entries go in first, staged entries overwrite them, and committed
/// entries only fill paths nobody else reported. Output is sorted by relative path.
pub fn merge_changes(
    vcs_root: &Path,
    unstaged: &[&str],
    staged: &[&str],
    committed: &[&str],
) -> Vec<ChangedFile> {
    let mut by_path: BTreeMap<&str, ChangeStatus> = BTreeMap::new();

    for path in unstaged {
        by_path.insert(path, ChangeStatus::Unstaged);
    }
    for path in staged {
        by_path.insert(path, ChangeStatus::Staged);
    }
    for path in committed {
        by_path.entry(path).or_insert(ChangeStatus::Committed);
    }

    by_path
        .into_iter()
        .map(|(rel, status)| ChangedFile {
            rel_path: rel.to_string(),
            abs_path: vcs_root.join(rel),
            status,
        })
        .collect()
}
