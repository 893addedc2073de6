//! The single record of whether a test run is in progress.
//!
//! This is a plain value with explicit transitions. The async orchestrator keeps
//! one instance behind a watch channel and is the only code that mutates it.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    /// Interrupt sent, waiting for the process to go away
    Cancelling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub current_spec: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunningState {
    pub phase: RunPhase,
    pub project: Option<String>,
    pub specs: Vec<PathBuf>,
    /// Only present while a run is active
    pub progress: Option<Progress>,
    /// Specs that failed in the most recent finished run
    pub last_failed_specs: Vec<PathBuf>,
}

impl RunningState {
    pub fn is_running(&self) -> bool {
        self.phase != RunPhase::Idle
    }

    /// Claim the state for a new run. Returns false, leaving everything as is, if busy.
    pub fn try_start(&mut self, project: &str, specs: &[PathBuf]) -> bool {
        if self.is_running() {
            return false;
        }
        self.phase = RunPhase::Running;
        self.project = Some(project.to_string());
        self.specs = specs.to_vec();
        self.progress = Some(Progress {
            completed: 0,
            total: specs.len(),
            current_spec: specs.first().cloned(),
        });
        true
    }

    /// Record a finished spec seen in the runner output.
    ///
    /// `completed` never exceeds `total`. Returns whether anything changed.
    pub fn record_completed(&mut self, spec: Option<&Path>) -> bool {
        let Some(progress) = self.progress.as_mut() else {
            return false;
        };
        if progress.completed >= progress.total {
            return false;
        }
        progress.completed += 1;
        if let Some(spec) = spec {
            progress.current_spec = Some(spec.to_path_buf());
        }
        true
    }

    /// Enter `Cancelling`. Returns false if there is nothing to cancel.
    pub fn begin_cancel(&mut self) -> bool {
        match self.phase {
            RunPhase::Running => {
                self.phase = RunPhase::Cancelling;
                true
            }
            RunPhase::Cancelling => true,
            RunPhase::Idle => false,
        }
    }

    /// Back to idle, recording which specs failed.
    pub fn finish(&mut self, failed_specs: Vec<PathBuf>) {
        self.phase = RunPhase::Idle;
        self.progress = None;
        self.last_failed_specs = failed_specs;
    }
}
