//! Changed files from git: unstaged, staged, and committed since the base ref.

use eyre::{Result, WrapErr, bail};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use testpick_core::ChangedFile;
use testpick_core::changes::{fetch_branch, is_qualified_ref, merge_changes, parse_name_only};
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DetectOptions<'a> {
    /// Any directory inside the repository
    pub cwd: &'a Path,
    pub base_ref: &'a str,
    pub skip_fetch: bool,
    /// Report per-step timings at info level instead of debug
    pub verbose: bool,
}

/// Run git in `cwd` and capture stdout.
pub async fn git_capture(cwd: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .await
        .wrap_err("failed to run git")?;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }

    String::from_utf8(out.stdout)
        .wrap_err_with(|| format!("git {} output is not valid UTF-8", args.join(" ")))
}

async fn git_succeeds(cwd: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|s| s.success())
}

/// Top-level directory of the repository containing `cwd`.
pub async fn vcs_root(cwd: &Path) -> Result<PathBuf> {
    let out = git_capture(cwd, &["rev-parse", "--show-toplevel"])
        .await
        .wrap_err_with(|| format!("{} is not inside a git repository", cwd.display()))?;
    Ok(PathBuf::from(out.trim()))
}

/// Whether `reference` names a commit.
pub async fn ref_exists(cwd: &Path, reference: &str) -> bool {
    let spec = format!("{reference}^{{commit}}");
    git_succeeds(cwd, &["rev-parse", "--verify", &spec]).await
}

/// The ref to diff `HEAD` against.
///
/// Qualified refs and commit hashes are used as-is; a bare branch name prefers
/// its `origin/` tracking ref when one exists.
pub async fn resolve_compare_ref(cwd: &Path, base_ref: &str) -> String {
    if is_qualified_ref(base_ref) {
        return base_ref.to_string();
    }
    let origin_ref = format!("origin/{base_ref}");
    if ref_exists(cwd, &origin_ref).await {
        origin_ref
    } else {
        base_ref.to_string()
    }
}

/// Best-effort `git fetch origin <branch>`. Never fails.
pub async fn try_fetch(cwd: &Path, base_ref: &str) {
    let Some(branch) = fetch_branch(base_ref) else {
        return;
    };
    let start = Instant::now();
    let ok = git_succeeds(cwd, &["fetch", "origin", branch, "--quiet"]).await;
    let elapsed_ms = start.elapsed().as_millis() as u64;
    if ok {
        debug!(branch, elapsed_ms, "fetched base branch");
    } else {
        warn!(branch, elapsed_ms, "git fetch origin {} failed (continuing)", branch);
    }
}

/// Name of the checked-out branch, or `"unknown"` when git can't tell.
pub async fn current_branch(cwd: &Path) -> String {
    match git_capture(cwd, &["rev-parse", "--abbrev-ref", "HEAD"]).await {
        Ok(out) => {
            let branch = out.trim();
            if branch.is_empty() {
                "HEAD".to_string()
            } else {
                branch.to_string()
            }
        }
        Err(e) => {
            warn!("could not determine current branch: {}", e);
            "unknown".to_string()
        }
    }
}

/// Added or modified files, each tagged with where the change lives.
///
/// Fails only when `cwd` is not inside a repository (or git itself is unusable).
/// A base ref that can't be diffed against yields no committed changes.
pub async fn detect_changed_files(opts: DetectOptions<'_>) -> Result<Vec<ChangedFile>> {
    let start = Instant::now();
    let step = |what: &str, count: usize, since: Instant| {
        let elapsed_ms = since.elapsed().as_millis() as u64;
        if opts.verbose {
            info!(count, elapsed_ms, "{}", what);
        } else {
            debug!(count, elapsed_ms, "{}", what);
        }
    };

    let root = vcs_root(opts.cwd).await?;

    if !opts.skip_fetch {
        try_fetch(&root, opts.base_ref).await;
    }

    let compare_ref = resolve_compare_ref(&root, opts.base_ref).await;
    debug!(compare_ref = %compare_ref, "resolved compare ref");

    let since = Instant::now();
    let unstaged = git_capture(&root, &["diff", "--name-only", "-z", "--diff-filter=d"]).await?;
    let unstaged = parse_name_only(&unstaged);
    step("git diff (unstaged)", unstaged.len(), since);

    let since = Instant::now();
    let staged = git_capture(&root, &["diff", "--cached", "--name-only", "-z", "--diff-filter=d"]).await?;
    let staged = parse_name_only(&staged);
    step("git diff (staged)", staged.len(), since);

    let since = Instant::now();
    let range = format!("{compare_ref}...HEAD");
    let committed = match git_capture(&root, &["diff", "--name-only", "-z", "--diff-filter=d", &range]).await {
        Ok(out) => out,
        Err(e) => {
            warn!("no committed changes against {}: {}", compare_ref, e);
            String::new()
        }
    };
    let committed = parse_name_only(&committed);
    step("git diff (committed)", committed.len(), since);

    let files = merge_changes(&root, &unstaged, &staged, &committed);
    step("changed files", files.len(), start);
    Ok(files)
}
