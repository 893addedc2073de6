//! Project discovery.
//!
//! Three strategies, tried in order until one returns a non-empty list:
//! the nx project graph, `nx show projects` plus per-project root lookups,
//! and finally a scan for `project.json` files.

use crate::config::Config;
use crate::nx::NxCli;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use testpick_core::Project;
use testpick_core::manifest::{
    normalize_projects, parse_graph, parse_project_json, parse_project_names, parse_show_project,
};
use tracing::{debug, info, warn};

/// One way of enumerating the workspace's projects.
///
/// `None` means the strategy could not run at all; `Some(empty)` means it ran
/// and found nothing. Either way the next strategy is tried.
#[async_trait]
pub trait DiscoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn discover(&self, workspace_root: &Path) -> Option<Vec<Project>>;
}

/// Full project graph written by `nx graph --file=<tmp>.json`.
pub struct GraphTier {
    pub nx: NxCli,
    pub timeout: Duration,
}

#[async_trait]
impl DiscoveryStrategy for GraphTier {
    fn name(&self) -> &'static str {
        "graph"
    }

    async fn discover(&self, workspace_root: &Path) -> Option<Vec<Project>> {
        let graph_path = std::env::temp_dir().join(format!(
            "testpick-graph-{}-{}.json",
            std::process::id(),
            blake3::hash(workspace_root.to_string_lossy().as_bytes()).to_hex()
        ));
        let file_arg = format!("--file={}", graph_path.display());

        let result = self.read_graph(workspace_root, &file_arg, &graph_path).await;
        let _ = tokio::fs::remove_file(&graph_path).await;

        match result {
            Ok(projects) => Some(projects),
            Err(e) => {
                debug!("graph tier unavailable: {:#}", e);
                None
            }
        }
    }
}

impl GraphTier {
    async fn read_graph(&self, workspace_root: &Path, file_arg: &str, graph_path: &Path) -> Result<Vec<Project>> {
        self.nx
            .capture(workspace_root, &["graph", file_arg], self.timeout)
            .await?;
        let json = tokio::fs::read_to_string(graph_path)
            .await
            .wrap_err_with(|| format!("Failed to read {}", graph_path.display()))?;
        parse_graph(workspace_root, &json)
    }
}

/// `nx show projects --json`, then a root for each name.
pub struct ListTier {
    pub nx: NxCli,
    pub concurrency: usize,
    pub query_timeout: Duration,
}

/// Directories conventionally holding projects, in lookup order.
const CONVENTIONAL_DIRS: &[&str] = &["libs", "apps", "packages"];

/// Candidate roots for a project name, most likely first.
///
/// `shop-cart-ui` might live at `libs/shop-cart-ui`, `libs/shop/cart/ui` or
/// `libs/shop/cart-ui` (and the same under `apps/` and `packages/`).
pub fn guess_roots(workspace_root: &Path, name: &str) -> Vec<PathBuf> {
    let mut rel: Vec<String> = vec![name.to_string(), name.replace('-', "/")];
    if let Some((first, rest)) = name.split_once('-') {
        rel.push(format!("{first}/{rest}"));
    }
    rel.dedup();

    let mut out = Vec::new();
    for dir in CONVENTIONAL_DIRS {
        for r in &rel {
            let candidate = workspace_root.join(dir).join(r);
            if !out.contains(&candidate) {
                out.push(candidate);
            }
        }
    }
    out
}

impl ListTier {
    /// Read every guessed manifest at once; the first guess naming `name` wins.
    async fn from_guess(&self, workspace_root: &Path, name: &str) -> Option<Project> {
        let reads = guess_roots(workspace_root, name).into_iter().map(|root| async move {
            let manifest_path = root.join("project.json");
            let content = tokio::fs::read_to_string(&manifest_path).await.ok()?;
            parse_project_json(workspace_root, &manifest_path, &content)
        });
        join_all(reads)
            .await
            .into_iter()
            .flatten()
            .find(|project| project.name == name)
    }

    async fn from_query(&self, workspace_root: &Path, name: &str) -> Option<Project> {
        let json = self
            .nx
            .capture(
                workspace_root,
                &["show", "project", name, "--json"],
                self.query_timeout,
            )
            .await
            .map_err(|e| debug!(project = name, "nx show project failed: {:#}", e))
            .ok()?;
        parse_show_project(workspace_root, &json)
            .map_err(|e| debug!(project = name, "{:#}", e))
            .ok()
    }
}

#[async_trait]
impl DiscoveryStrategy for ListTier {
    fn name(&self) -> &'static str {
        "list"
    }

    async fn discover(&self, workspace_root: &Path) -> Option<Vec<Project>> {
        let json = self
            .nx
            .capture(workspace_root, &["show", "projects", "--json"], self.query_timeout)
            .await
            .map_err(|e| debug!("list tier unavailable: {:#}", e))
            .ok()?;
        let names = parse_project_names(&json)
            .map_err(|e| debug!("list tier unavailable: {:#}", e))
            .ok()?;

        let concurrency = self.concurrency.max(1);
        let guessed: Vec<(String, Option<Project>)> = stream::iter(names)
            .map(|name| async move {
                let project = self.from_guess(workspace_root, &name).await;
                (name, project)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut projects = Vec::with_capacity(guessed.len());
        let mut unresolved = Vec::new();
        for (name, project) in guessed {
            match project {
                Some(project) => projects.push(project),
                None => unresolved.push(name),
            }
        }

        if !unresolved.is_empty() {
            debug!(count = unresolved.len(), "querying nx for unguessable project roots");
            let queried: Vec<Option<Project>> = stream::iter(unresolved)
                .map(|name| async move { self.from_query(workspace_root, &name).await })
                .buffer_unordered(concurrency)
                .collect()
                .await;
            projects.extend(queried.into_iter().flatten());
        }

        Some(projects)
    }
}

/// Recursive `project.json` scan, parsed in parallel.
pub struct ScanTier;

#[async_trait]
impl DiscoveryStrategy for ScanTier {
    fn name(&self) -> &'static str {
        "scan"
    }

    async fn discover(&self, workspace_root: &Path) -> Option<Vec<Project>> {
        let root = workspace_root.to_path_buf();
        match tokio::task::spawn_blocking(move || testpick_core::manifest::scan_projects(&root)).await {
            Ok(projects) => Some(projects),
            Err(e) => {
                warn!("project scan panicked: {}", e);
                None
            }
        }
    }
}

/// The ordered list of discovery strategies for a workspace.
pub struct ProjectIndex {
    tiers: Vec<Box<dyn DiscoveryStrategy>>,
}

impl ProjectIndex {
    /// Graph, then list, then scan.
    pub fn new(nx: NxCli, config: &Config) -> Self {
        Self::with_tiers(vec![
            Box::new(GraphTier {
                nx: nx.clone(),
                timeout: config.graph_timeout(),
            }),
            Box::new(ListTier {
                nx,
                concurrency: config.list_concurrency,
                query_timeout: config.list_query_timeout(),
            }),
            Box::new(ScanTier),
        ])
    }

    pub fn with_tiers(tiers: Vec<Box<dyn DiscoveryStrategy>>) -> Self {
        Self { tiers }
    }

    /// Only the filesystem scan, for workspaces without a usable nx install.
    pub fn scan_only() -> Self {
        Self::with_tiers(vec![Box::new(ScanTier)])
    }

    /// Every project, sorted by name. Empty if no tier finds anything.
    pub async fn discover(&self, workspace_root: &Path) -> Vec<Project> {
        for tier in &self.tiers {
            let start = Instant::now();
            let found = tier.discover(workspace_root).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;
            match found {
                Some(projects) if !projects.is_empty() => {
                    info!(
                        tier = tier.name(),
                        count = projects.len(),
                        elapsed_ms,
                        "discovered projects"
                    );
                    return normalize_projects(projects);
                }
                Some(_) => debug!(tier = tier.name(), elapsed_ms, "tier found no projects"),
                None => debug!(tier = tier.name(), elapsed_ms, "tier unavailable"),
            }
        }
        warn!("no projects found in {}", workspace_root.display());
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_roots() {
        let roots = guess_roots(Path::new("/ws"), "shop-cart-ui");
        assert_eq!(roots[0], PathBuf::from("/ws/libs/shop-cart-ui"));
        assert_eq!(roots[1], PathBuf::from("/ws/libs/shop/cart/ui"));
        assert_eq!(roots[2], PathBuf::from("/ws/libs/shop/cart-ui"));
        assert!(roots.contains(&PathBuf::from("/ws/apps/shop-cart-ui")));
        assert!(roots.contains(&PathBuf::from("/ws/packages/shop/cart/ui")));
    }

    #[test]
    fn test_guess_roots_without_dashes() {
        let roots = guess_roots(Path::new("/ws"), "web");
        assert_eq!(
            roots,
            vec![
                PathBuf::from("/ws/libs/web"),
                PathBuf::from("/ws/apps/web"),
                PathBuf::from("/ws/packages/web"),
            ]
        );
    }

    fn project(name: &str, root: &str) -> Project {
        Project {
            name: name.into(),
            root: PathBuf::from(root),
            source_root: None,
            runner: testpick_core::RunnerKind::Jest,
        }
    }

    /// A tier that always answers the same thing.
    struct Fixed(&'static str, Option<Vec<Project>>);

    #[async_trait]
    impl DiscoveryStrategy for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn discover(&self, _workspace_root: &Path) -> Option<Vec<Project>> {
            self.1.clone()
        }
    }

    #[tokio::test]
    async fn test_first_non_empty_tier_wins() {
        let index = ProjectIndex::with_tiers(vec![
            Box::new(Fixed("unavailable", None)),
            Box::new(Fixed("empty", Some(Vec::new()))),
            Box::new(Fixed(
                "found",
                Some(vec![
                    project("web", "/ws/apps/web"),
                    project("cart", "/ws/libs/cart"),
                    project("cart", "/ws/libs/other-cart"),
                ]),
            )),
            Box::new(Fixed("never", Some(vec![project("late", "/ws/libs/late")]))),
        ]);

        let projects = index.discover(Path::new("/ws")).await;
        let names: Vec<&str> = projects.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["cart", "web"]);
        assert_eq!(projects[0].root, PathBuf::from("/ws/libs/cart"));
    }

    #[tokio::test]
    async fn test_no_tier_finds_anything() {
        let index = ProjectIndex::with_tiers(vec![
            Box::new(Fixed("unavailable", None)),
            Box::new(Fixed("empty", Some(Vec::new()))),
        ]);
        assert!(index.discover(Path::new("/ws")).await.is_empty());
    }

    #[cfg(unix)]
    mod scripted_nx {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        const NX_SCRIPT: &str = r#"#!/bin/sh
case "$1 $2" in
  "show projects")
    echo '["cart","web","hidden-lib","ghost"]'
    ;;
  "show project")
    if [ "$3" = "hidden-lib" ]; then
      echo '{"name":"hidden-lib","root":"tools/hidden","targets":{"test":{"executor":"@nx/jest:jest"}}}'
    else
      exit 1
    fi
    ;;
  graph*)
    printf '%s' '{"graph":{"nodes":{"cart":{"name":"cart","data":{"root":"libs/cart","targets":{"test":{"executor":"@nx/jest:jest"}}}}}}}' > "${2#--file=}"
    ;;
  *)
    exit 1
    ;;
esac
"#;

        fn write(root: &Path, rel: &str, content: &str) {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }

        fn scripted_workspace() -> (tempfile::TempDir, NxCli) {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path();
            write(root, "libs/cart/project.json", r#"{"name":"cart"}"#);
            write(root, "apps/web/project.json", r#"{"name":"web"}"#);
            // Right directory, wrong name: must not be taken as `ghost`
            write(root, "libs/ghost/project.json", r#"{"name":"not-ghost"}"#);

            let script = root.join("nx-script");
            std::fs::write(&script, NX_SCRIPT).unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            let nx = NxCli {
                program: script,
                prefix_args: Vec::new(),
            };
            (dir, nx)
        }

        #[tokio::test]
        async fn test_list_tier_guesses_then_queries() {
            let (dir, nx) = scripted_workspace();
            let tier = ListTier {
                nx,
                concurrency: 2,
                query_timeout: Duration::from_secs(10),
            };

            let projects = normalize_projects(tier.discover(dir.path()).await.unwrap());
            let found: Vec<(&str, PathBuf)> = projects
                .iter()
                .map(|p| (p.name.as_str(), p.root.clone()))
                .collect();
            assert_eq!(
                found,
                vec![
                    ("cart", dir.path().join("libs/cart")),
                    ("hidden-lib", dir.path().join("tools/hidden")),
                    ("web", dir.path().join("apps/web")),
                ]
            );
            assert_eq!(projects[1].runner, testpick_core::RunnerKind::Jest);
        }

        #[tokio::test]
        async fn test_graph_tier_reads_graph_file() {
            let (dir, nx) = scripted_workspace();
            let tier = GraphTier {
                nx,
                timeout: Duration::from_secs(10),
            };

            let projects = tier.discover(dir.path()).await.unwrap();
            assert_eq!(projects.len(), 1);
            assert_eq!(projects[0].name, "cart");
            assert_eq!(projects[0].root, dir.path().join("libs/cart"));
        }

        #[tokio::test]
        async fn test_failing_nx_falls_through_to_scan() {
            let (dir, _) = scripted_workspace();
            let broken = NxCli {
                program: dir.path().join("does-not-exist"),
                prefix_args: Vec::new(),
            };
            let config = Config::default();
            let index = ProjectIndex::new(broken, &config);

            let projects = index.discover(dir.path()).await;
            let names: Vec<&str> = projects.iter().map(|p| p.name.as_str()).collect();
            assert_eq!(names, vec!["cart", "not-ghost", "web"]);
        }
    }
}
