//! Configuration schema for testpick
//!
//! Config lives at `.config/testpick/config.json` relative to the workspace root.
//! Every field is optional.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Fallback when neither the CLI, the config nor `nx.json` names a base ref.
pub const DEFAULT_BASE_REF: &str = "origin/master";

/// Root configuration for testpick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Base ref for committed changes (e.g. `origin/main`)
    pub base_ref: Option<String>,

    /// Don't `git fetch` the base branch before diffing
    pub skip_fetch: bool,

    /// Debug logging
    pub verbose: bool,

    /// Pass `--coverage` to the runner
    pub coverage: bool,

    /// Time between SIGINT and SIGKILL when cancelling a run
    pub cancel_grace_ms: u64,

    /// Concurrent `nx show project` lookups in the list tier
    pub list_concurrency: usize,

    /// Timeout for each `nx show project` lookup
    pub list_query_timeout_ms: u64,

    /// Timeout for `nx graph`
    pub graph_timeout_ms: u64,

    /// Where the runner writes `json-result.json`, relative to the workspace root
    pub results_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_ref: None,
            skip_fetch: false,
            verbose: false,
            coverage: false,
            cancel_grace_ms: 2000,
            list_concurrency: 8,
            list_query_timeout_ms: 5000,
            graph_timeout_ms: 60_000,
            results_dir: "dist/reports".to_string(),
        }
    }
}

impl Config {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn list_query_timeout(&self) -> Duration {
        Duration::from_millis(self.list_query_timeout_ms)
    }

    pub fn graph_timeout(&self) -> Duration {
        Duration::from_millis(self.graph_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NxAffected {
    #[serde(default)]
    default_base: Option<String>,
}

/// Base-ref defaults declared in `nx.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NxJson {
    #[serde(default)]
    affected: Option<NxAffected>,
    #[serde(default)]
    default_base: Option<String>,
}

impl NxJson {
    /// Read `<workspace_root>/nx.json`. A missing or malformed file yields no defaults.
    pub async fn load(workspace_root: &Path) -> Self {
        let path = workspace_root.join("nx.json");
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::debug!("ignoring malformed {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn affected_default_base(&self) -> Option<&str> {
        self.affected.as_ref()?.default_base.as_deref()
    }

    pub fn default_base(&self) -> Option<&str> {
        self.default_base.as_deref()
    }
}

/// CLI flag → config → `affected.defaultBase` → `defaultBase` → [`DEFAULT_BASE_REF`].
pub fn resolve_base_ref(cli: Option<&str>, config: &Config, nx: &NxJson) -> String {
    cli.or(config.base_ref.as_deref())
        .or(nx.affected_default_base())
        .or(nx.default_base())
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_BASE_REF)
        .to_string()
}
