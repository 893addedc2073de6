//! Per-workspace store of the last known outcome of each spec.
//!
//! One JSON file per workspace under the user cache directory, named after a
//! hash of the workspace root so different checkouts never share entries.

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use testpick_core::RunMetrics;
use tracing::{debug, warn};

/// Bumped whenever the record layout changes; older files are discarded.
pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheRecord {
    version: u32,
    workspace_root: String,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    specs: BTreeMap<String, RunMetrics>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub updated_at: Option<String>,
}

#[derive(Debug)]
pub struct RunCache {
    path: PathBuf,
    workspace_root: String,
    specs: BTreeMap<String, RunMetrics>,
    updated_at: Option<String>,
}

/// First 16 hex characters of the BLAKE3 hash of the workspace root.
pub fn workspace_id(workspace_root: &Path) -> String {
    let hash = blake3::hash(workspace_root.to_string_lossy().as_bytes());
    hash.to_hex()[..16].to_string()
}

fn normalize_key(rel_path: &str) -> String {
    rel_path.replace('\\', "/")
}

impl RunCache {
    /// Cache for `workspace_root` in the user cache directory. Nothing is read yet.
    pub fn new(workspace_root: &Path) -> Result<Self> {
        let dir = dirs::cache_dir()
            .ok_or_else(|| eyre::eyre!("Could not determine the user cache directory"))?
            .join("testpick");
        Ok(Self::with_dir(&dir, workspace_root))
    }

    /// Cache for `workspace_root` stored under `dir`.
    pub fn with_dir(dir: &Path, workspace_root: &Path) -> Self {
        Self {
            path: dir.join(format!("cache-{}.json", workspace_id(workspace_root))),
            workspace_root: workspace_root.to_string_lossy().into_owned(),
            specs: BTreeMap::new(),
            updated_at: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, rel_path: &str) -> Option<&RunMetrics> {
        self.specs.get(&normalize_key(rel_path))
    }

    /// Overwrites any previous entry.
    pub fn set(&mut self, rel_path: &str, metrics: RunMetrics) {
        self.specs.insert(normalize_key(rel_path), metrics);
    }

    pub fn set_many<'a>(&mut self, rel_paths: impl IntoIterator<Item = &'a str>, metrics: &RunMetrics) {
        for rel_path in rel_paths {
            self.set(rel_path, metrics.clone());
        }
    }

    pub fn clear(&mut self) {
        self.specs.clear();
        self.updated_at = None;
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &RunMetrics)> {
        self.specs.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.specs.len(),
            updated_at: self.updated_at.clone(),
        }
    }

    /// Replace in-memory entries with what's on disk.
    ///
    /// A missing file, another version or another workspace root all give an
    /// empty cache. A file that can't be parsed is deleted.
    pub async fn load(&mut self) {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.clear();
                return;
            }
            Err(e) => {
                warn!("Failed to read cache {}: {}", self.path.display(), e);
                self.clear();
                return;
            }
        };

        match self.parse(&content) {
            Ok(Some(record)) => {
                debug!(entries = record.specs.len(), "loaded run cache");
                self.specs = record.specs;
                self.updated_at = record.updated_at;
            }
            Ok(None) => self.clear(),
            Err(e) => {
                warn!("Discarding corrupt cache {}: {:#}", self.path.display(), e);
                self.clear();
                if let Err(e) = tokio::fs::remove_file(&self.path).await {
                    debug!("could not remove {}: {}", self.path.display(), e);
                }
            }
        }
    }

    /// `Ok(None)` for a well-formed record that belongs to another version or workspace.
    fn parse(&self, content: &str) -> Result<Option<CacheRecord>> {
        let value: serde_json::Value =
            serde_json::from_str(content).wrap_err("cache is not valid JSON")?;

        let version = value.get("version").and_then(|v| v.as_u64());
        if version != Some(u64::from(CACHE_VERSION)) {
            debug!(?version, "cache version mismatch");
            return Ok(None);
        }

        let record: CacheRecord =
            serde_json::from_value(value).wrap_err("cache record has an unexpected shape")?;
        if record.workspace_root != self.workspace_root {
            debug!(
                cached = %record.workspace_root,
                "cache belongs to another workspace root"
            );
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Write all entries, creating the cache directory if needed.
    pub async fn save(&mut self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .wrap_err_with(|| format!("Failed to create {}", dir.display()))?;
        }

        let record = CacheRecord {
            version: CACHE_VERSION,
            workspace_root: self.workspace_root.clone(),
            updated_at: Some(crate::now_rfc3339()),
            specs: self.specs.clone(),
        };
        let mut json = serde_json::to_string_pretty(&record)?;
        json.push('\n');

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .wrap_err_with(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .wrap_err_with(|| format!("Failed to write {}", self.path.display()))?;

        self.updated_at = record.updated_at;
        Ok(())
    }
}
