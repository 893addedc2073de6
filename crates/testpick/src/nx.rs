//! Invoking the nx CLI.

use eyre::{Result, WrapErr, bail};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// How to invoke nx in a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NxCli {
    pub program: PathBuf,
    /// Arguments that come before the nx subcommand (`nx` for `npx nx`)
    pub prefix_args: Vec<String>,
}

impl NxCli {
    /// Prefer the workspace-local binary, fall back to `npx nx`.
    pub async fn resolve(workspace_root: &Path) -> Self {
        let bin_name = if cfg!(windows) { "nx.cmd" } else { "nx" };
        let local = workspace_root.join("node_modules").join(".bin").join(bin_name);
        if tokio::fs::try_exists(&local).await.unwrap_or(false) {
            return Self {
                program: local,
                prefix_args: Vec::new(),
            };
        }
        Self {
            program: PathBuf::from("npx"),
            prefix_args: vec!["nx".to_string()],
        }
    }

    /// A command with the prefix arguments applied, running in `workspace_root`.
    pub fn command<I, S>(&self, workspace_root: &Path, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args)
            .args(args)
            .current_dir(workspace_root)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Shell-ish rendering for logs.
    pub fn display(&self, args: &[String]) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.prefix_args.iter().cloned());
        parts.extend(args.iter().cloned());
        parts.join(" ")
    }

    /// Run a query and capture stdout, failing on non-zero exit or timeout.
    pub async fn capture(&self, workspace_root: &Path, args: &[&str], timeout: Duration) -> Result<String> {
        let mut cmd = self.command(workspace_root, args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let out = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(out) => out.wrap_err("failed to run nx")?,
            Err(_) => bail!("nx {} timed out after {:?}", args.join(" "), timeout),
        };

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            bail!("nx {} failed: {}", args.join(" "), stderr.trim());
        }

        String::from_utf8(out.stdout)
            .wrap_err_with(|| format!("nx {} output is not valid UTF-8", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_prefers_local_binary() {
        let dir = tempfile::tempdir().unwrap();
        let cli = NxCli::resolve(dir.path()).await;
        assert_eq!(cli.program, PathBuf::from("npx"));
        assert_eq!(cli.prefix_args, vec!["nx".to_string()]);

        let bin = dir.path().join("node_modules/.bin");
        std::fs::create_dir_all(&bin).unwrap();
        let name = if cfg!(windows) { "nx.cmd" } else { "nx" };
        std::fs::write(bin.join(name), "").unwrap();

        let cli = NxCli::resolve(dir.path()).await;
        assert_eq!(cli.program, bin.join(name));
        assert!(cli.prefix_args.is_empty());
    }

    #[test]
    fn test_display() {
        let cli = NxCli {
            program: PathBuf::from("npx"),
            prefix_args: vec!["nx".into()],
        };
        assert_eq!(
            cli.display(&["test".into(), "cart".into()]),
            "npx nx test cart"
        );
    }
}
