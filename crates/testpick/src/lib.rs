//! testpick library - Run only the specs your monorepo changes touch
//!
//! This library exposes the async half of testpick (git, nx, the run cache and
//! the orchestrator) for testing and embedding purposes.

pub mod cache;
pub mod changes;
pub mod config;
pub mod nx;
pub mod orchestrator;
pub mod projects;
pub mod resolve;
pub mod workspace;

use config::Config;
use eyre::{Result, WrapErr};
use std::path::{Path, PathBuf};

/// Default config location relative to the workspace root.
pub fn default_config_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(".config/testpick/config.json")
}

/// Locate the workspace root: the nearest directory with an `nx.json`.
///
/// Looks in `start` itself, then its immediate non-hidden subdirectories (nested
/// workspaces), then each ancestor.
pub fn find_workspace_root(start: &Path) -> Result<PathBuf> {
    let start = if start.is_absolute() {
        start.to_path_buf()
    } else {
        std::env::current_dir()
            .wrap_err("Failed to get current directory")?
            .join(start)
    };

    if start.join("nx.json").is_file() {
        return Ok(start);
    }

    if let Ok(entries) = std::fs::read_dir(&start) {
        let mut subdirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|n| !n.starts_with('.') && n != "node_modules")
            })
            .map(|e| e.path())
            .collect();
        subdirs.sort();
        if let Some(found) = subdirs.into_iter().find(|d| d.join("nx.json").is_file()) {
            return Ok(found);
        }
    }

    let mut current = start.clone();
    while current.pop() {
        if current.join("nx.json").is_file() {
            return Ok(current);
        }
    }

    eyre::bail!("Could not find nx.json from: {}", start.display())
}

pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        eyre::bail!(
            "Config file not found at {}\n\n\
             Create a config file, for example:\n\n\
             {{\n    \
                 \"baseRef\": \"origin/main\",\n    \
                 \"coverage\": false\n\
             }}",
            path.display()
        );
    }

    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = serde_json::from_str(&content)
        .wrap_err_with(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Load config if it exists, otherwise return the defaults.
pub fn load_config_or_default(path: &Path) -> Config {
    if !path.exists() {
        return Config::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
        Err(_) => Config::default(),
    }
}

/// Current time as RFC 3339, the format stored in run metrics and the cache.
pub(crate) fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
