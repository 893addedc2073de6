//! Loading everything about a workspace in one pass, and turning it into runs.

use crate::changes::{DetectOptions, current_branch, detect_changed_files};
use crate::orchestrator::RunRequest;
use crate::projects::ProjectIndex;
use crate::resolve::resolve;
use eyre::{Result, bail};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use testpick_core::{
    ChangedFile, Project, ProjectRoots, Resolution, RunnerKind, SpecConvention, SpecEntry,
};
use tracing::info;

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub workspace_root: PathBuf,
    pub base_ref: String,
    pub skip_fetch: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct WorkspaceState {
    pub workspace_root: PathBuf,
    pub branch: String,
    pub base_ref: String,
    pub projects: Vec<Project>,
    pub changed_files: Vec<ChangedFile>,
    pub resolution: Resolution,
}

/// Discover projects and changed files concurrently, then resolve specs.
///
/// `progress` receives short human-readable status messages.
pub async fn load_workspace_state(
    index: &ProjectIndex,
    options: &LoadOptions,
    mut progress: impl FnMut(&str),
) -> Result<WorkspaceState> {
    let start = Instant::now();
    let root = options.workspace_root.as_path();

    progress("Discovering projects and changed files");
    let (projects, changed, branch) = tokio::join!(
        index.discover(root),
        detect_changed_files(DetectOptions {
            cwd: root,
            base_ref: &options.base_ref,
            skip_fetch: options.skip_fetch,
            verbose: options.verbose,
        }),
        current_branch(root),
    );
    let changed_files = changed?;

    progress("Resolving specs");
    let resolution = resolve(root, &projects, &changed_files, &SpecConvention::typescript()).await;

    info!(
        projects = projects.len(),
        changed = changed_files.len(),
        specs = resolution.spec_count(),
        missing = resolution.missing_count(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "workspace state loaded"
    );
    progress("Done");

    Ok(WorkspaceState {
        workspace_root: options.workspace_root.clone(),
        branch,
        base_ref: options.base_ref.clone(),
        projects,
        changed_files,
        resolution,
    })
}

/// Which specs to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// A project's resolved specs, optionally only those whose own file changed
    Project { name: String, changed_only: bool },
    /// Every changed spec across all Jest projects
    AllChanged,
    /// The given specs, grouped by owning project
    Specs(Vec<PathBuf>),
}

fn paths(specs: &[&SpecEntry]) -> Vec<PathBuf> {
    specs.iter().map(|s| s.abs_path.clone()).collect()
}

/// Group specs into one request per owning project. Specs no project owns are returned separately.
pub fn group_by_owner(projects: &[Project], specs: &[PathBuf]) -> (Vec<RunRequest>, Vec<PathBuf>) {
    let roots = ProjectRoots::new(projects);
    let mut grouped: BTreeMap<&str, (&Project, Vec<PathBuf>)> = BTreeMap::new();
    let mut unowned = Vec::new();

    for spec in specs {
        match roots.owner(spec) {
            Some(project) => grouped
                .entry(project.name.as_str())
                .or_insert_with(|| (project, Vec::new()))
                .1
                .push(spec.clone()),
            None => unowned.push(spec.clone()),
        }
    }

    let requests = grouped
        .into_values()
        .map(|(project, specs)| RunRequest {
            project: project.name.clone(),
            project_root: project.root.clone(),
            specs,
        })
        .collect();
    (requests, unowned)
}

/// Turn a selection into run requests, one per project.
pub fn select_runs(state: &WorkspaceState, selection: &Selection) -> Result<Vec<RunRequest>> {
    match selection {
        Selection::Project { name, changed_only } => {
            let Some(project) = state.projects.iter().find(|p| &p.name == name) else {
                bail!("Unknown project '{}'", name);
            };
            if project.runner != RunnerKind::Jest {
                bail!(
                    "Project '{}' uses the {} runner; only jest projects can be run",
                    name,
                    project.runner
                );
            }
            let Some(resolved) = state.resolution.project(name) else {
                return Ok(Vec::new());
            };
            let specs: Vec<&SpecEntry> = if *changed_only {
                resolved.changed_specs().collect()
            } else {
                resolved.specs.iter().collect()
            };
            if specs.is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![RunRequest {
                project: project.name.clone(),
                project_root: project.root.clone(),
                specs: paths(&specs),
            }])
        }
        Selection::AllChanged => Ok(state
            .resolution
            .projects
            .iter()
            .filter(|p| p.runner == RunnerKind::Jest)
            .filter_map(|p| {
                let specs: Vec<&SpecEntry> = p.changed_specs().collect();
                (!specs.is_empty()).then(|| RunRequest {
                    project: p.name.clone(),
                    project_root: p.root.clone(),
                    specs: paths(&specs),
                })
            })
            .collect()),
        Selection::Specs(specs) => {
            let (requests, unowned) = group_by_owner(&state.projects, specs);
            if !unowned.is_empty() {
                bail!(
                    "No project owns {}",
                    unowned
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            Ok(requests)
        }
    }
}

/// Absolute path for a spec given on the command line.
pub fn absolutize(workspace_root: &Path, cwd: &Path, spec: &Path) -> PathBuf {
    if spec.is_absolute() {
        return spec.to_path_buf();
    }
    let from_cwd = cwd.join(spec);
    if from_cwd.starts_with(workspace_root) && from_cwd.exists() {
        from_cwd
    } else {
        workspace_root.join(spec)
    }
}
