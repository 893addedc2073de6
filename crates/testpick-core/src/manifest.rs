//! Project manifests: `project.json` files, `nx show project` output and the project graph.

use crate::model::{Project, RunnerKind};
use eyre::{Result, WrapErr};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Directories never searched for manifests.
pub const SCAN_EXCLUDED_DIRS: &[&str] = &["node_modules", "dist", ".git"];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    #[serde(default)]
    pub executor: Option<String>,
}

/// The subset of a project configuration we care about.
///
/// Same shape whether it comes from `project.json`, `nx show project --json`
/// or a graph node's `data`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectManifest {
    #[serde(default)]
    pub name: Option<String>,
    /// Workspace-relative root; absent in plain `project.json` files
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub source_root: Option<String>,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
}

impl ProjectManifest {
    pub fn test_executor(&self) -> Option<&str> {
        self.targets.get("test").and_then(|t| t.executor.as_deref())
    }

    /// Build a [`Project`]. `manifest_dir` wins over the declared `root` when known.
    pub fn into_project(self, workspace_root: &Path, manifest_dir: Option<&Path>) -> Option<Project> {
        let runner = RunnerKind::from_executor(self.test_executor());
        let name = self.name.filter(|n| !n.is_empty())?;
        let root = match manifest_dir {
            Some(dir) => dir.to_path_buf(),
            None => workspace_root.join(self.root.as_deref()?),
        };
        let source_root = self.source_root.map(|s| workspace_root.join(s));
        Some(Project {
            name,
            root,
            source_root,
            runner,
        })
    }
}

/// Parse one `project.json`. Returns `None` for malformed or unnamed manifests.
pub fn parse_project_json(workspace_root: &Path, manifest_path: &Path, content: &str) -> Option<Project> {
    let manifest: ProjectManifest = serde_json::from_str(content).ok()?;
    manifest.into_project(workspace_root, manifest_path.parent())
}

/// Parse `nx show project <name> --json` output.
pub fn parse_show_project(workspace_root: &Path, json: &str) -> Result<Project> {
    let manifest: ProjectManifest =
        serde_json::from_str(json).wrap_err("failed to parse project configuration")?;
    manifest
        .into_project(workspace_root, None)
        .ok_or_else(|| eyre::eyre!("project configuration has no name or root"))
}

/// Parse `nx show projects --json` output.
pub fn parse_project_names(json: &str) -> Result<Vec<String>> {
    serde_json::from_str(json).wrap_err("failed to parse project name list")
}

#[derive(Debug, Deserialize)]
struct GraphFile {
    graph: Graph,
}

#[derive(Debug, Deserialize)]
struct Graph {
    #[serde(default)]
    nodes: BTreeMap<String, GraphNode>,
}

#[derive(Debug, Deserialize)]
struct GraphNode {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

/// Parse the file written by `nx graph --file=<path>`.
///
/// Nodes whose data doesn't look like a project are skipped.
pub fn parse_graph(workspace_root: &Path, json: &str) -> Result<Vec<Project>> {
    let file: GraphFile = serde_json::from_str(json).wrap_err("failed to parse project graph")?;

    let mut projects = Vec::with_capacity(file.graph.nodes.len());
    for (key, node) in file.graph.nodes {
        let Ok(mut manifest) = serde_json::from_value::<ProjectManifest>(node.data) else {
            continue;
        };
        if manifest.name.is_none() {
            manifest.name = node.name.or(Some(key));
        }
        if let Some(project) = manifest.into_project(workspace_root, None) {
            projects.push(project);
        }
    }
    Ok(projects)
}

/// Sort by name and drop duplicate names, keeping the first occurrence.
pub fn normalize_projects(mut projects: Vec<Project>) -> Vec<Project> {
    projects.sort_by(|a, b| a.name.cmp(&b.name));
    projects.dedup_by(|b, a| a.name == b.name);
    projects
}

/// Every `project.json` under `root`, skipping [`SCAN_EXCLUDED_DIRS`] and hidden directories.
#[cfg(feature = "walk")]
pub fn find_manifests(root: &Path) -> Vec<PathBuf> {
    use ignore::WalkBuilder;

    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .ignore(false)
        .filter_entry(|entry| {
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            !(is_dir
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|n| SCAN_EXCLUDED_DIRS.contains(&n)))
        })
        .build();

    let mut manifests: Vec<PathBuf> = walker
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .filter(|entry| entry.file_name() == "project.json")
        .map(|entry| entry.into_path())
        .collect();
    manifests.sort();
    manifests
}

/// Find and parse every manifest under `workspace_root`.
#[cfg(feature = "walk")]
pub fn scan_projects(workspace_root: &Path) -> Vec<Project> {
    let manifests = find_manifests(workspace_root);

    let read = |path: &PathBuf| -> Option<Project> {
        let content = std::fs::read_to_string(path).ok()?;
        parse_project_json(workspace_root, path, &content)
    };

    #[cfg(feature = "parallel")]
    let projects: Vec<Project> = {
        use rayon::prelude::*;
        manifests.par_iter().filter_map(read).collect()
    };

    #[cfg(not(feature = "parallel"))]
    let projects: Vec<Project> = manifests.iter().filter_map(read).collect();

    normalize_projects(projects)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_project_json() {
        let content = r#"{
            "name": "shop-cart",
            "sourceRoot": "libs/shop/cart/src",
            "targets": { "test": { "executor": "@nx/jest:jest", "options": {} } }
        }"#;
        let project = parse_project_json(
            Path::new("/ws"),
            Path::new("/ws/libs/shop/cart/project.json"),
            content,
        )
        .unwrap();

        assert_eq!(project.name, "shop-cart");
        assert_eq!(project.root, PathBuf::from("/ws/libs/shop/cart"));
        assert_eq!(
            project.source_root,
            Some(PathBuf::from("/ws/libs/shop/cart/src"))
        );
        assert_eq!(project.runner, RunnerKind::Jest);
    }

    #[test]
    fn test_unnamed_or_malformed_manifest_is_skipped() {
        let path = Path::new("/ws/libs/a/project.json");
        assert!(parse_project_json(Path::new("/ws"), path, r#"{"targets": {}}"#).is_none());
        assert!(parse_project_json(Path::new("/ws"), path, "{ not json").is_none());
    }

    #[test]
    fn test_parse_graph() {
        let json = r#"{
            "graph": {
                "nodes": {
                    "web": {
                        "name": "web",
                        "type": "app",
                        "data": {
                            "root": "apps/web",
                            "targets": { "test": { "executor": "@angular-devkit/build-angular:karma" } }
                        }
                    },
                    "util": {
                        "type": "lib",
                        "data": { "root": "libs/util", "targets": {} }
                    },
                    "broken": { "type": "lib", "data": 42 }
                },
                "dependencies": {}
            }
        }"#;
        let projects = normalize_projects(parse_graph(Path::new("/ws"), json).unwrap());

        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].name, "util");
        assert_eq!(projects[0].root, PathBuf::from("/ws/libs/util"));
        assert_eq!(projects[0].runner, RunnerKind::Unknown);
        assert_eq!(projects[1].name, "web");
        assert_eq!(projects[1].runner, RunnerKind::Karma);
    }

    #[test]
    fn test_parse_show_project_requires_root() {
        let ok = parse_show_project(
            Path::new("/ws"),
            r#"{"name":"a","root":"libs/a","targets":{"test":{"executor":"@nx/jest:jest"}}}"#,
        )
        .unwrap();
        assert_eq!(ok.root, PathBuf::from("/ws/libs/a"));

        assert!(parse_show_project(Path::new("/ws"), r#"{"name":"a"}"#).is_err());
    }

    #[test]
    fn test_normalize_dedups_by_name() {
        let p = |name: &str, root: &str| Project {
            name: name.to_string(),
            root: PathBuf::from(root),
            source_root: None,
            runner: RunnerKind::Unknown,
        };
        let projects = normalize_projects(vec![p("b", "/b"), p("a", "/a1"), p("a", "/a2")]);
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].name, "a");
        assert_eq!(projects[1].name, "b");
    }

    #[cfg(feature = "walk")]
    #[test]
    fn test_scan_skips_excluded_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let write = |rel: &str, content: &str| {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        };

        write(
            "libs/a/project.json",
            r#"{"name":"a","targets":{"test":{"executor":"@nx/jest:jest"}}}"#,
        );
        write("apps/b/project.json", r#"{"name":"b"}"#);
        write("apps/c/project.json", "oops");
        write("node_modules/pkg/project.json", r#"{"name":"nm"}"#);
        write("dist/libs/a/project.json", r#"{"name":"dist-a"}"#);

        let projects = scan_projects(root);
        let names: Vec<_> = projects.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(projects[0].root, root.join("libs/a"));
        assert_eq!(projects[0].runner, RunnerKind::Jest);
    }
}
