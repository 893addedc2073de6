//! Test-file filter passed to the runner.

use std::path::Path;

/// Path of `path` relative to `root`, `/`-separated. Falls back to the full path
/// when `path` is not under `root`.
pub fn relative_slash_path(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path.to_string_lossy().replace('\\', "/"),
    }
}

/// Escape JavaScript regex metacharacters.
pub fn escape_js_regex(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        if matches!(
            c,
            '.' | '*' | '+' | '?' | '^' | '$' | '{' | '}' | '(' | ')' | '|' | '[' | ']' | '\\'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// A regex matching exactly the given specs, as workspace-relative paths.
///
/// One spec gives its escaped path; several give `(a|b|c)`.
pub fn build_test_file_pattern(workspace_root: &Path, specs: &[impl AsRef<Path>]) -> String {
    let escaped: Vec<String> = specs
        .iter()
        .map(|s| escape_js_regex(&relative_slash_path(workspace_root, s.as_ref())))
        .collect();

    match escaped.as_slice() {
        [single] => single.clone(),
        many => format!("({})", many.join("|")),
    }
}
