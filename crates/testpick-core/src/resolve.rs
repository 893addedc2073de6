//! Changed files → specs, in two phases.
//!
//! [`ResolvePlan::new`] classifies every changed file and collects the full set of
//! paths whose existence matters. The caller checks those paths however it likes
//! (the `testpick` crate fans them out concurrently) and hands the answers to
//! [`ResolvePlan::assemble`], which attaches specs to their owning projects.

use crate::convention::SpecConvention;
use crate::model::{
    ChangedFile, MissingSpecEntry, Project, ProjectWithSpecs, Resolution, SpecEntry, SpecStatus,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Number of path components, ignoring `.` segments and trailing separators.
fn depth(path: &Path) -> usize {
    path.components().count()
}

/// Project roots ordered for longest-prefix ownership lookups.
pub struct ProjectRoots<'a> {
    by_depth: Vec<&'a Project>,
}

impl<'a> ProjectRoots<'a> {
    pub fn new(projects: &'a [Project]) -> Self {
        let mut by_depth: Vec<&Project> = projects.iter().collect();
        by_depth.sort_by(|a, b| {
            depth(&b.root)
                .cmp(&depth(&a.root))
                .then_with(|| a.name.cmp(&b.name))
        });
        Self { by_depth }
    }

    /// The project with the most specific root containing `file`.
    pub fn owner(&self, file: &Path) -> Option<&'a Project> {
        // Path::starts_with compares whole components, so `libs/ab` never owns `libs/abc/x.ts`.
        self.by_depth
            .iter()
            .copied()
            .find(|p| file.starts_with(&p.root))
    }
}

/// Merge a newly derived entry into whatever is already recorded for the same path.
///
/// A real change status beats `Regular`; otherwise the first-seen entry stays.
pub fn merge_spec_entry(existing: Option<SpecEntry>, incoming: SpecEntry) -> SpecEntry {
    match existing {
        None => incoming,
        Some(existing) if existing.status.is_changed() => existing,
        Some(existing) => {
            if incoming.status.is_changed() {
                incoming
            } else {
                existing
            }
        }
    }
}

struct SourceCandidate<'a> {
    changed: &'a ChangedFile,
    derived_spec: PathBuf,
}

/// First phase of a resolution pass.
pub struct ResolvePlan<'a> {
    projects: &'a [Project],
    spec_files: Vec<&'a ChangedFile>,
    source_files: Vec<SourceCandidate<'a>>,
    candidates: BTreeSet<PathBuf>,
}

impl<'a> ResolvePlan<'a> {
    pub fn new(
        workspace_root: &Path,
        projects: &'a [Project],
        changed_files: &'a [ChangedFile],
        convention: &SpecConvention,
    ) -> Self {
        let mut spec_files = Vec::new();
        let mut source_files = Vec::new();
        let mut candidates = BTreeSet::new();

        for changed in changed_files {
            if !changed.abs_path.starts_with(workspace_root) {
                continue;
            }

            if convention.is_spec(&changed.abs_path) {
                candidates.insert(changed.abs_path.clone());
                spec_files.push(changed);
            } else if convention.should_derive_spec(&changed.abs_path) {
                let derived_spec = convention.derive_spec_path(&changed.abs_path);
                candidates.insert(derived_spec.clone());
                source_files.push(SourceCandidate {
                    changed,
                    derived_spec,
                });
            }
        }

        Self {
            projects,
            spec_files,
            source_files,
            candidates,
        }
    }

    /// Every path whose existence must be known before assembling.
    pub fn candidates(&self) -> impl Iterator<Item = &Path> {
        self.candidates.iter().map(PathBuf::as_path)
    }

    /// Second phase: attach specs and missing specs using the existence answers.
    ///
    /// `exists` returns `None` for paths that could not be checked; those are
    /// skipped entirely rather than guessed at.
    pub fn assemble(self, exists: impl Fn(&Path) -> Option<bool>) -> Resolution {
        let roots = ProjectRoots::new(self.projects);

        let mut specs_by_project: BTreeMap<&str, BTreeMap<PathBuf, SpecEntry>> = BTreeMap::new();
        let mut missing_by_project: BTreeMap<&str, Vec<MissingSpecEntry>> = BTreeMap::new();
        let mut global_missing = Vec::new();

        for changed in &self.spec_files {
            if exists(&changed.abs_path) != Some(true) {
                continue;
            }
            let Some(owner) = roots.owner(&changed.abs_path) else {
                continue;
            };
            let entry = SpecEntry {
                abs_path: changed.abs_path.clone(),
                status: changed.status.into(),
            };
            let specs = specs_by_project.entry(owner.name.as_str()).or_default();
            let merged = merge_spec_entry(specs.remove(&entry.abs_path), entry);
            specs.insert(merged.abs_path.clone(), merged);
        }

        for source in &self.source_files {
            let missing = MissingSpecEntry {
                source_abs_path: source.changed.abs_path.clone(),
                expected_spec_abs_path: source.derived_spec.clone(),
                source_status: source.changed.status,
            };

            let Some(owner) = roots.owner(&source.changed.abs_path) else {
                global_missing.push(missing);
                continue;
            };

            match exists(&source.derived_spec) {
                Some(true) => {
                    let entry = SpecEntry {
                        abs_path: source.derived_spec.clone(),
                        status: SpecStatus::Regular,
                    };
                    let specs = specs_by_project.entry(owner.name.as_str()).or_default();
                    let merged = merge_spec_entry(specs.remove(&entry.abs_path), entry);
                    specs.insert(merged.abs_path.clone(), merged);
                }
                Some(false) => {
                    missing_by_project
                        .entry(owner.name.as_str())
                        .or_default()
                        .push(missing);
                }
                None => {}
            }
        }

        let names: BTreeSet<&str> = specs_by_project
            .keys()
            .chain(missing_by_project.keys())
            .copied()
            .collect();

        let projects = names
            .into_iter()
            .filter_map(|name| {
                let project = self.projects.iter().find(|p| p.name == name)?;
                let specs = specs_by_project
                    .remove(name)
                    .map(|m| m.into_values().collect())
                    .unwrap_or_default();
                let missing_specs = missing_by_project.remove(name).unwrap_or_default();
                Some(ProjectWithSpecs {
                    name: project.name.clone(),
                    runner: project.runner,
                    root: project.root.clone(),
                    specs,
                    missing_specs,
                })
            })
            .collect();

        Resolution {
            projects,
            missing_specs: global_missing,
        }
    }

    /// Assemble from a precomputed existence map; absent keys count as unchecked.
    pub fn assemble_with_map(self, exists: &HashMap<PathBuf, bool>) -> Resolution {
        self.assemble(|p| exists.get(p).copied())
    }
}
