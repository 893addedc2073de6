//! Async driver for spec resolution: one concurrent existence check per candidate.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use testpick_core::{ChangedFile, Project, ResolvePlan, Resolution, SpecConvention};
use tracing::debug;

/// Map changed files to specs per project.
///
/// Paths whose existence can't be checked are dropped from the result.
pub async fn resolve(
    workspace_root: &Path,
    projects: &[Project],
    changed_files: &[ChangedFile],
    convention: &SpecConvention,
) -> Resolution {
    let plan = ResolvePlan::new(workspace_root, projects, changed_files, convention);
    let exists = check_existence(plan.candidates().map(Path::to_path_buf).collect()).await;
    plan.assemble_with_map(&exists)
}

/// Check every path at once. Failed checks are left out of the map.
pub async fn check_existence(paths: Vec<PathBuf>) -> HashMap<PathBuf, bool> {
    let checks = paths.into_iter().map(|path| async move {
        let result = tokio::fs::try_exists(&path).await;
        (path, result)
    });

    join_all(checks)
        .await
        .into_iter()
        .filter_map(|(path, result)| match result {
            Ok(exists) => Some((path, exists)),
            Err(e) => {
                debug!("skipping {}: {}", path.display(), e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_existence() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("a.spec.ts");
        std::fs::write(&present, "").unwrap();
        let absent = dir.path().join("b.spec.ts");

        let map = check_existence(vec![present.clone(), absent.clone()]).await;
        assert_eq!(map.get(&present), Some(&true));
        assert_eq!(map.get(&absent), Some(&false));
    }
}
