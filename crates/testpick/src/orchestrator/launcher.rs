//! Building the runner command for a run.

use super::RunRequest;
use crate::nx::NxCli;
use async_trait::async_trait;
use eyre::Result;
use std::path::Path;
use testpick_core::filter::build_test_file_pattern;
use tokio::process::Command;

/// A prepared runner invocation.
pub struct Invocation {
    pub command: Command,
    /// For logs and the `Started` event
    pub display: String,
}

/// Turns a run request into a runner process.
#[async_trait]
pub trait RunLauncher: Send + Sync {
    async fn prepare(&self, workspace_root: &Path, request: &RunRequest) -> Result<Invocation>;
}

/// `<nx> test <project> --watch=false --testFile=<pattern> [--coverage]`
pub struct NxLauncher {
    pub coverage: bool,
}

impl NxLauncher {
    pub fn args(&self, workspace_root: &Path, request: &RunRequest) -> Vec<String> {
        let mut args = vec![
            "test".to_string(),
            request.project.clone(),
            "--watch=false".to_string(),
            format!(
                "--testFile={}",
                build_test_file_pattern(workspace_root, &request.specs)
            ),
        ];
        if self.coverage {
            args.push("--coverage".to_string());
        }
        args
    }
}

#[async_trait]
impl RunLauncher for NxLauncher {
    async fn prepare(&self, workspace_root: &Path, request: &RunRequest) -> Result<Invocation> {
        let nx = NxCli::resolve(workspace_root).await;
        let args = self.args(workspace_root, request);
        Ok(Invocation {
            display: nx.display(&args),
            command: nx.command(workspace_root, &args),
        })
    }
}
