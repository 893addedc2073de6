//! testpick-core - Core library for changed-test selection in Nx-style monorepos
//!
//! This crate holds the synchronous, side-effect-light half of testpick:
//! - Parsing project manifests and the project graph
//! - The `foo.ts` ↔ `foo.spec.ts` naming convention and its deny-list
//! - Merging diffs into one list of changed files
//! - Mapping changed files to specs, with longest-root ownership
//! - The running-state value and the runner's output and results formats
//!
//! # Features
//!
//! - `walk` - Enable [`manifest::scan_projects`] for directory walking (brings in `ignore`)
//! - `parallel` - Parse manifests in parallel while scanning (brings in `rayon`)
//!
//! # Resolving changed files
//!
//! Resolution is split so the caller can check file existence however it likes:
//!
//! ```
//! use std::path::{Path, PathBuf};
//! use testpick_core::{
//!     ChangeStatus, ChangedFile, Project, ResolvePlan, RunnerKind, SpecConvention,
//! };
//!
//! let projects = vec![Project {
//!     name: "cart".into(),
//!     root: PathBuf::from("/ws/libs/cart"),
//!     source_root: None,
//!     runner: RunnerKind::Jest,
//! }];
//! let changed = vec![ChangedFile {
//!     rel_path: "libs/cart/src/total.ts".into(),
//!     abs_path: PathBuf::from("/ws/libs/cart/src/total.ts"),
//!     status: ChangeStatus::Unstaged,
//! }];
//!
//! let plan = ResolvePlan::new(Path::new("/ws"), &projects, &changed, &SpecConvention::typescript());
//! let resolution = plan.assemble(|_| Some(false));
//!
//! assert_eq!(resolution.projects[0].missing_specs.len(), 1);
//! ```

pub mod changes;
pub mod convention;
pub mod filter;
pub mod manifest;
mod model;
pub mod report;
pub mod resolve;
mod state;

pub use convention::SpecConvention;
pub use model::{
    ChangeStatus, ChangedFile, MissingSpecEntry, Project, ProjectWithSpecs, Resolution,
    RunMetrics, RunnerKind, SpecEntry, SpecStatus, TestCounts,
};
pub use resolve::{ProjectRoots, ResolvePlan};
pub use state::{Progress, RunPhase, RunningState};
