//! Domain types shared by discovery, change detection, resolution and runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Test runner a project declares for its `test` target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    Jest,
    Karma,
    #[default]
    Unknown,
}

impl RunnerKind {
    /// Derive the runner from a declared executor string.
    ///
    /// `@nx/jest:jest` and `@nrwl/jest:jest` are Jest; `@angular-devkit/build-angular:karma`,
    /// `@nx/angular:karma` and friends are Karma. Anything else is `Unknown`.
    pub fn from_executor(executor: Option<&str>) -> Self {
        match executor {
            Some(e) if e.contains(":jest") => Self::Jest,
            Some(e) if e.contains(":karma") => Self::Karma,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jest => "jest",
            Self::Karma => "karma",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A build unit in the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Unique within a workspace
    pub name: String,
    /// Absolute project root
    pub root: PathBuf,
    /// Absolute source root, if the manifest declares one
    pub source_root: Option<PathBuf>,
    pub runner: RunnerKind,
}

/// How a file shows up in the version-control diffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    /// Working tree differs from the index
    Unstaged,
    /// Index differs from HEAD
    Staged,
    /// HEAD differs from the base ref
    Committed,
}

impl ChangeStatus {
    pub fn badge(self) -> char {
        match self {
            Self::Unstaged => 'U',
            Self::Staged => 'S',
            Self::Committed => 'C',
        }
    }
}

/// A file reported as added or modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    /// Path relative to the repository root, always `/`-separated as git prints it
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub status: ChangeStatus,
}

/// Status of a spec attached to a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecStatus {
    Unstaged,
    Staged,
    Committed,
    /// The spec itself is unchanged; it is attached because its source file changed.
    Regular,
}

impl SpecStatus {
    pub fn badge(self) -> char {
        match self {
            Self::Unstaged => 'U',
            Self::Staged => 'S',
            Self::Committed => 'C',
            Self::Regular => 'R',
        }
    }

    /// True for statuses that come from a diff rather than from derivation.
    pub fn is_changed(self) -> bool {
        !matches!(self, Self::Regular)
    }
}

impl From<ChangeStatus> for SpecStatus {
    fn from(status: ChangeStatus) -> Self {
        match status {
            ChangeStatus::Unstaged => Self::Unstaged,
            ChangeStatus::Staged => Self::Staged,
            ChangeStatus::Committed => Self::Committed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecEntry {
    pub abs_path: PathBuf,
    pub status: SpecStatus,
}

/// A source file that should have a companion spec but doesn't.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingSpecEntry {
    pub source_abs_path: PathBuf,
    pub expected_spec_abs_path: PathBuf,
    pub source_status: ChangeStatus,
}

/// Per-project view handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectWithSpecs {
    pub name: String,
    pub runner: RunnerKind,
    pub root: PathBuf,
    pub specs: Vec<SpecEntry>,
    pub missing_specs: Vec<MissingSpecEntry>,
}

impl ProjectWithSpecs {
    /// Specs whose own file shows up in a diff.
    pub fn changed_specs(&self) -> impl Iterator<Item = &SpecEntry> {
        self.specs.iter().filter(|s| s.status.is_changed())
    }
}

/// Result of one resolution pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Projects with at least one spec or missing spec, sorted by name
    pub projects: Vec<ProjectWithSpecs>,
    /// Missing specs for files no project claims
    pub missing_specs: Vec<MissingSpecEntry>,
}

impl Resolution {
    pub fn spec_count(&self) -> usize {
        self.projects.iter().map(|p| p.specs.len()).sum()
    }

    pub fn missing_count(&self) -> usize {
        self.projects
            .iter()
            .map(|p| p.missing_specs.len())
            .sum::<usize>()
            + self.missing_specs.len()
    }

    pub fn project(&self, name: &str) -> Option<&ProjectWithSpecs> {
        self.projects.iter().find(|p| p.name == name)
    }
}

/// Test counts for one spec, when the runner reported them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub total: u32,
}

/// Outcome of the most recent run of one spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    /// RFC 3339 timestamp
    pub last_run: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_counts: Option<TestCounts>,
}

impl RunMetrics {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}
