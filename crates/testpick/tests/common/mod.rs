//! Common test utilities.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

/// A temporary directory whose path is canonical, so it compares equal to what git reports.
pub struct TempWorkspace {
    _dir: tempfile::TempDir,
    pub root: PathBuf,
}

pub fn temp_workspace() -> TempWorkspace {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let root = std::fs::canonicalize(dir.path()).expect("Failed to canonicalize temp dir");
    std::fs::write(root.join("nx.json"), "{}\n").expect("Failed to write nx.json");
    TempWorkspace { _dir: dir, root }
}

/// Write `content` to `root/rel`, creating parent directories.
pub fn write(root: &Path, rel: &str, content: &str) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    std::fs::write(&path, content).expect("Failed to write file");
    path
}

/// A `project.json` with a jest test target.
pub fn write_jest_project(root: &Path, dir: &str, name: &str) -> PathBuf {
    write(
        root,
        &format!("{dir}/project.json"),
        &format!(
            r#"{{
  "name": "{name}",
  "sourceRoot": "{dir}/src",
  "targets": {{ "test": {{ "executor": "@nx/jest:jest" }} }}
}}
"#
        ),
    )
}

pub fn git(root: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .expect("Failed to run git");
    assert!(status.success(), "git {} failed", args.join(" "));
}

pub fn git_init(root: &Path) {
    git(root, &["init", "--quiet", "--initial-branch=main"]);
    git(root, &["config", "user.email", "test@example.com"]);
    git(root, &["config", "user.name", "Test"]);
    git(root, &["config", "commit.gpgsign", "false"]);
}

pub fn git_add(root: &Path, rel: &str) {
    git(root, &["add", rel]);
}

pub fn git_commit_all(root: &Path, message: &str) {
    git(root, &["add", "-A"]);
    git(root, &["commit", "--quiet", "-m", message]);
}
