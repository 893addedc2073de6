//! Run orchestration.
//!
//! The [`Orchestrator`] owns the single [`RunningState`] (behind a [`StateHandle`]),
//! launches at most one runner process at a time, streams its output as
//! [`RunEvent`]s and writes per-spec [`RunMetrics`] into the [`RunCache`] when
//! the process exits.
//!
//! Cancellation goes through the state itself: [`Orchestrator::cancel`] moves it
//! to [`RunPhase::Cancelling`] and the supervising task reacts to that.

mod launcher;
mod process;

pub use launcher::{Invocation, NxLauncher, RunLauncher};
pub use process::OutputStream;

use crate::cache::RunCache;
use process::{ProcessExit, supervise};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use testpick_core::filter::relative_slash_path;
use testpick_core::report::{
    RESULTS_FILE_NAME, ResultsFile, SpecFailureDetails, match_banner_spec, parse_banner,
    reconcile_run, strip_ansi,
};
use testpick_core::{RunMetrics, RunPhase, RunningState};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub project: String,
    /// Absolute project root, used to locate the results artifact
    pub project_root: PathBuf,
    /// Absolute spec paths
    pub specs: Vec<PathBuf>,
}

/// Why a run could not start. Returned synchronously by [`Orchestrator::start_run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunRejected {
    /// Another run is active
    Busy,
    NoSpecs,
}

impl fmt::Display for RunRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => f.write_str("a test run is already in progress"),
            Self::NoSpecs => f.write_str("no specs to run"),
        }
    }
}

impl std::error::Error for RunRejected {}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    Completed { exit_code: i32 },
    Cancelled,
    /// The runner could not be launched or awaited
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub project: String,
    pub end: RunEnd,
    pub duration_ms: u64,
    pub failed_specs: Vec<PathBuf>,
    /// Metrics written to the cache, keyed by workspace-relative path
    pub metrics: BTreeMap<String, RunMetrics>,
    /// Failing tests per failed spec, when the results artifact has them
    pub failures: Vec<SpecFailureDetails>,
    /// Runner output with ANSI codes removed
    pub output: String,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        matches!(self.end, RunEnd::Completed { exit_code: 0 }) && self.failed_specs.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum RunEvent {
    Started { project: String, command: String },
    Output { stream: OutputStream, line: String },
    Finished(RunSummary),
}

/// Shared handle on the running state. Cloning is cheap.
///
/// Only the orchestrator mutates through it; everyone else reads or subscribes.
#[derive(Clone)]
pub struct StateHandle {
    tx: Arc<watch::Sender<RunningState>>,
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunningState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> RunningState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunningState> {
        self.tx.subscribe()
    }

    /// Apply `f`; subscribers are notified only if it returns true.
    fn update(&self, f: impl FnOnce(&mut RunningState) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }
}

/// Handle on a started run.
pub struct RunHandle {
    task: JoinHandle<RunSummary>,
}

impl RunHandle {
    /// Wait for the run to end, however it ends.
    pub async fn wait(self) -> eyre::Result<RunSummary> {
        self.task
            .await
            .map_err(|e| eyre::eyre!("run task failed: {}", e))
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Time between interrupt and kill when cancelling
    pub cancel_grace: Duration,
    /// Results directory relative to the workspace root
    pub results_dir: String,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            cancel_grace: Duration::from_millis(2000),
            results_dir: "dist/reports".to_string(),
        }
    }
}

impl From<&crate::config::Config> for OrchestratorOptions {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            cancel_grace: config.cancel_grace(),
            results_dir: config.results_dir.clone(),
        }
    }
}

struct Inner {
    workspace_root: PathBuf,
    state: StateHandle,
    cache: Arc<Mutex<RunCache>>,
    launcher: Arc<dyn RunLauncher>,
    events: broadcast::Sender<RunEvent>,
    options: OrchestratorOptions,
}

/// Supervises test runs for one workspace.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        workspace_root: PathBuf,
        cache: Arc<Mutex<RunCache>>,
        launcher: Arc<dyn RunLauncher>,
        options: OrchestratorOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                workspace_root,
                state: StateHandle::new(),
                cache,
                launcher,
                events,
                options,
            }),
        }
    }

    pub fn state(&self) -> &StateHandle {
        &self.inner.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    pub fn cache(&self) -> &Arc<Mutex<RunCache>> {
        &self.inner.cache
    }

    /// Start a run in the background.
    ///
    /// Rejected without touching the state if a run is already active. Must be
    /// called from within a tokio runtime.
    pub fn start_run(&self, request: RunRequest) -> Result<RunHandle, RunRejected> {
        if request.specs.is_empty() {
            return Err(RunRejected::NoSpecs);
        }
        if !self
            .inner
            .state
            .update(|s| s.try_start(&request.project, &request.specs))
        {
            return Err(RunRejected::Busy);
        }

        info!(
            project = %request.project,
            specs = request.specs.len(),
            "starting test run"
        );
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.execute(request).await });
        Ok(RunHandle { task })
    }

    /// Stop the active run: interrupt, wait up to the grace period, then kill.
    ///
    /// Returns false if nothing is running. Otherwise returns once the state is
    /// back to idle. A run whose process hasn't been spawned yet never spawns it.
    pub async fn cancel(&self) -> bool {
        let mut accepted = false;
        self.inner.state.update(|s| {
            accepted = s.begin_cancel();
            accepted
        });
        if !accepted {
            return false;
        }

        info!("cancelling test run");
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| !s.is_running()).await;
        true
    }
}

impl Inner {
    fn emit(&self, event: RunEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn finish(&self, request: &RunRequest, summary: RunSummary) -> RunSummary {
        let failed = summary.failed_specs.clone();
        self.state.update(|s| {
            s.finish(failed);
            true
        });
        match &summary.end {
            RunEnd::Completed { exit_code } => info!(
                project = %request.project,
                exit_code,
                failed = summary.failed_specs.len(),
                duration_ms = summary.duration_ms,
                "test run finished"
            ),
            RunEnd::Cancelled => info!(project = %request.project, "test run cancelled"),
            RunEnd::Failed { message } => {
                error!(project = %request.project, "test run failed: {}", message)
            }
        }
        self.emit(RunEvent::Finished(summary.clone()));
        summary
    }

    fn is_cancelling(&self) -> bool {
        self.state.current().phase == RunPhase::Cancelling
    }

    async fn execute(self: Arc<Self>, request: RunRequest) -> RunSummary {
        let started = Instant::now();
        let started_at = SystemTime::now();
        let mut summary = RunSummary {
            project: request.project.clone(),
            end: RunEnd::Cancelled,
            duration_ms: 0,
            failed_specs: Vec::new(),
            metrics: BTreeMap::new(),
            failures: Vec::new(),
            output: String::new(),
        };

        if self.is_cancelling() {
            return self.finish(&request, summary);
        }

        let invocation = match self.launcher.prepare(&self.workspace_root, &request).await {
            Ok(invocation) => invocation,
            Err(e) => {
                summary.end = RunEnd::Failed {
                    message: format!("{e:#}"),
                };
                summary.failed_specs = request.specs.clone();
                summary.duration_ms = started.elapsed().as_millis() as u64;
                return self.finish(&request, summary);
            }
        };

        if self.is_cancelling() {
            return self.finish(&request, summary);
        }

        debug!(command = %invocation.display, "launching runner");
        self.emit(RunEvent::Started {
            project: request.project.clone(),
            command: invocation.display.clone(),
        });

        let rel_specs: Vec<String> = request
            .specs
            .iter()
            .map(|s| relative_slash_path(&self.workspace_root, s))
            .collect();

        let mut output = String::new();
        let on_line = |stream: OutputStream, line: String| {
            let plain = strip_ansi(&line);
            if let Some(banner) = parse_banner(&plain) {
                let spec = match_banner_spec(&rel_specs, banner.path)
                    .map(|rel| self.workspace_root.join(rel));
                self.state.update(|s| s.record_completed(spec.as_deref()));
            }
            output.push_str(&plain);
            output.push('\n');
            self.emit(RunEvent::Output { stream, line });
        };

        let exit = supervise(
            invocation.command,
            self.options.cancel_grace,
            self.state.subscribe(),
            on_line,
        )
        .await;

        summary.output = output;
        summary.duration_ms = started.elapsed().as_millis() as u64;

        match exit {
            Ok(ProcessExit::Cancelled) => {
                summary.end = RunEnd::Cancelled;
            }
            Ok(ProcessExit::Exited(exit_code)) => {
                summary.end = RunEnd::Completed { exit_code };
                self.reconcile(&request, started_at, exit_code, &mut summary)
                    .await;
            }
            Err(e) => {
                summary.end = RunEnd::Failed {
                    message: format!("{e:#}"),
                };
                summary.failed_specs = request.specs.clone();
            }
        }

        self.finish(&request, summary)
    }

    fn results_path(&self, project_root: &Path) -> PathBuf {
        let rel = relative_slash_path(&self.workspace_root, project_root);
        self.workspace_root
            .join(&self.options.results_dir)
            .join(rel)
            .join(RESULTS_FILE_NAME)
    }

    /// The results artifact, if present, parseable and written during this run.
    async fn read_results(&self, project_root: &Path, started_at: SystemTime) -> Option<ResultsFile> {
        let path = self.results_path(project_root);

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!("no test results at {}: {}", path.display(), e);
                return None;
            }
        };
        if let Ok(modified) = meta.modified()
            && modified < started_at
        {
            warn!("ignoring stale test results at {}", path.display());
            return None;
        }

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("could not read {}: {}", path.display(), e);
                return None;
            }
        };
        match ResultsFile::parse(&content) {
            Ok(results) => Some(results),
            Err(e) => {
                warn!("could not parse {}: {:#}", path.display(), e);
                None
            }
        }
    }

    async fn reconcile(
        &self,
        request: &RunRequest,
        started_at: SystemTime,
        exit_code: i32,
        summary: &mut RunSummary,
    ) {
        let now = crate::now_rfc3339();
        let results = self.read_results(&request.project_root, started_at).await;
        let per_spec = results
            .as_ref()
            .map(|results| results.per_spec_metrics(&self.workspace_root, &now));

        let outcome = reconcile_run(
            &self.workspace_root,
            &request.specs,
            per_spec.as_ref(),
            exit_code,
            summary.duration_ms,
            &now,
        );

        {
            let mut cache = self.cache.lock().await;
            for (rel, metrics) in &outcome.metrics {
                cache.set(rel, metrics.clone());
            }
            if let Err(e) = cache.save().await {
                warn!("could not save run cache: {:#}", e);
            }
        }

        if let Some(results) = &results {
            summary.failures = outcome
                .failed_specs
                .iter()
                .filter_map(|spec| results.failure_details(spec))
                .collect();
        }
        summary.failed_specs = outcome.failed_specs;
        summary.metrics = outcome.metrics.into_iter().collect();
    }
}
