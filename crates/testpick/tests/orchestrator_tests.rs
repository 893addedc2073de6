//! Orchestrator behavior with `sh` standing in for the test runner.

#![cfg(unix)]

mod common;

use async_trait::async_trait;
use common::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use testpick::cache::RunCache;
use testpick::orchestrator::{
    Invocation, Orchestrator, OrchestratorOptions, OutputStream, RunEnd, RunEvent, RunLauncher,
    RunRejected, RunRequest, RunSummary,
};
use testpick_core::RunPhase;
use tokio::process::Command;
use tokio::sync::{Mutex, broadcast};

/// Runs a fixed shell script in the workspace root.
struct ShLauncher {
    script: String,
    /// Simulated time spent resolving the runner
    delay: Duration,
}

impl ShLauncher {
    fn new(script: &str) -> Self {
        Self {
            script: script.to_string(),
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl RunLauncher for ShLauncher {
    async fn prepare(&self, workspace_root: &Path, _request: &RunRequest) -> eyre::Result<Invocation> {
        tokio::time::sleep(self.delay).await;
        let mut command = Command::new("sh");
        command.arg("-c").arg(&self.script).current_dir(workspace_root);
        Ok(Invocation {
            command,
            display: format!("sh -c '{}'", self.script),
        })
    }
}

struct FailingLauncher;

#[async_trait]
impl RunLauncher for FailingLauncher {
    async fn prepare(&self, _workspace_root: &Path, _request: &RunRequest) -> eyre::Result<Invocation> {
        eyre::bail!("nx is not installed")
    }
}

struct Harness {
    ws: TempWorkspace,
    _cache_dir: tempfile::TempDir,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new(launcher: impl RunLauncher + 'static) -> Self {
        Self::with_grace(launcher, Duration::from_secs(2))
    }

    fn with_grace(launcher: impl RunLauncher + 'static, cancel_grace: Duration) -> Self {
        let ws = temp_workspace();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = RunCache::with_dir(cache_dir.path(), &ws.root);
        let orchestrator = Orchestrator::new(
            ws.root.clone(),
            Arc::new(Mutex::new(cache)),
            Arc::new(launcher),
            OrchestratorOptions {
                cancel_grace,
                results_dir: "dist/reports".to_string(),
            },
        );
        Self {
            ws,
            _cache_dir: cache_dir,
            orchestrator,
        }
    }

    fn spec(&self, name: &str) -> PathBuf {
        self.ws.root.join("libs/cart/src").join(name)
    }

    fn request(&self, names: &[&str]) -> RunRequest {
        RunRequest {
            project: "cart".to_string(),
            project_root: self.ws.root.join("libs/cart"),
            specs: names.iter().map(|n| self.spec(n)).collect(),
        }
    }

    async fn cached(&self, name: &str) -> Option<testpick_core::RunMetrics> {
        let rel = format!("libs/cart/src/{name}");
        self.orchestrator.cache().lock().await.get(&rel).cloned()
    }
}

async fn wait_for_start(events: &mut broadcast::Receiver<RunEvent>) -> String {
    loop {
        match events.recv().await.expect("event stream closed") {
            RunEvent::Started { command, .. } => return command,
            RunEvent::Finished(summary) => panic!("run finished before starting: {summary:?}"),
            RunEvent::Output { .. } => {}
        }
    }
}

async fn collect_until_finished(events: &mut broadcast::Receiver<RunEvent>) -> (Vec<RunEvent>, RunSummary) {
    let mut seen = Vec::new();
    loop {
        match events.recv().await.expect("event stream closed") {
            RunEvent::Finished(summary) => return (seen, summary),
            event => seen.push(event),
        }
    }
}

#[tokio::test]
async fn test_output_is_streamed() {
    let h = Harness::new(ShLauncher::new("echo hello; echo oops >&2"));
    let mut events = h.orchestrator.subscribe();

    let handle = h.orchestrator.start_run(h.request(&["a.spec.ts"])).unwrap();
    let (seen, finished) = collect_until_finished(&mut events).await;
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary, finished);
    assert!(summary.succeeded());
    assert!(summary.output.contains("hello\n"));
    assert!(matches!(&seen[0], RunEvent::Started { command, .. } if command.starts_with("sh -c")));
    assert!(seen.iter().any(|e| matches!(
        e,
        RunEvent::Output { stream: OutputStream::Stdout, line } if line == "hello"
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        RunEvent::Output { stream: OutputStream::Stderr, line } if line == "oops"
    )));

    let cached = h.cached("a.spec.ts").await.unwrap();
    assert!(cached.passed());
}

#[tokio::test]
async fn test_failed_run_without_results_fails_every_spec() {
    let h = Harness::new(ShLauncher::new("exit 1"));
    let specs = ["a.spec.ts", "b.spec.ts", "c.spec.ts"];

    let summary = h
        .orchestrator
        .start_run(h.request(&specs))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(summary.end, RunEnd::Completed { exit_code: 1 });
    assert_eq!(summary.failed_specs.len(), 3);
    assert_eq!(summary.metrics.len(), 3);
    for metrics in summary.metrics.values() {
        assert_eq!(metrics.exit_code, 1);
        assert_eq!(metrics.test_counts, None);
    }
    for spec in specs {
        assert_eq!(h.cached(spec).await.unwrap().exit_code, 1);
    }

    let state = h.orchestrator.state().current();
    assert_eq!(state.phase, RunPhase::Idle);
    assert_eq!(state.progress, None);
    assert_eq!(state.last_failed_specs, summary.failed_specs);
}

#[tokio::test]
async fn test_results_artifact_gives_per_spec_outcomes() {
    let h = Harness::new(ShLauncher::new(
        "sleep 0.1; mkdir -p dist/reports/libs/cart && cp results.json dist/reports/libs/cart/json-result.json; exit 1",
    ));
    let a = h.spec("a.spec.ts");
    let b = h.spec("b.spec.ts");
    let results = format!(
        r#"{{
  "results": {{
    "summary": {{ "tests": 3, "passed": 2, "failed": 1 }},
    "tests": [
      {{ "name": "a adds", "status": "passed", "duration": 12, "filePath": "{a}" }},
      {{ "name": "a removes", "status": "passed", "duration": 8, "filePath": "{a}" }},
      {{ "name": "b totals", "status": "failed", "duration": 5, "filePath": "{b}",
         "failureMessages": ["expected 3 to be 4"] }}
    ]
  }}
}}"#,
        a = a.display(),
        b = b.display()
    );
    write(&h.ws.root, "results.json", &results);

    let summary = h
        .orchestrator
        .start_run(h.request(&["a.spec.ts", "b.spec.ts", "c.spec.ts"]))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(summary.end, RunEnd::Completed { exit_code: 1 });
    assert_eq!(summary.failed_specs, vec![b.clone(), h.spec("c.spec.ts")]);

    let a_metrics = h.cached("a.spec.ts").await.unwrap();
    assert!(a_metrics.passed());
    assert_eq!(a_metrics.duration_ms, 20);
    assert_eq!(a_metrics.test_counts.unwrap().passed, 2);

    let c_metrics = h.cached("c.spec.ts").await.unwrap();
    assert_eq!(c_metrics.exit_code, 1);
    assert_eq!(c_metrics.test_counts, None);

    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].spec, b);
    assert_eq!(summary.failures[0].failing_tests[0].name, "b totals");
    assert_eq!(
        summary.failures[0].failing_tests[0].message.as_deref(),
        Some("expected 3 to be 4")
    );
}

#[tokio::test]
async fn test_stale_results_are_ignored() {
    let h = Harness::new(ShLauncher::new("exit 1"));
    let a = h.spec("a.spec.ts");
    write(
        &h.ws.root,
        "dist/reports/libs/cart/json-result.json",
        &format!(
            r#"{{"results": {{"tests": [{{"name": "old", "status": "passed", "filePath": "{}"}}]}}}}"#,
            a.display()
        ),
    );

    let summary = h
        .orchestrator
        .start_run(h.request(&["a.spec.ts"]))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(summary.failed_specs, vec![a]);
    assert_eq!(h.cached("a.spec.ts").await.unwrap().test_counts, None);
}

#[tokio::test]
async fn test_second_run_is_rejected_while_busy() {
    let h = Harness::new(ShLauncher::new("sleep 30"));
    let mut events = h.orchestrator.subscribe();

    let handle = h.orchestrator.start_run(h.request(&["a.spec.ts"])).unwrap();
    wait_for_start(&mut events).await;
    let before = h.orchestrator.state().current();

    let other = RunRequest {
        project: "shop".to_string(),
        project_root: h.ws.root.join("libs/shop"),
        specs: vec![h.ws.root.join("libs/shop/src/shop.spec.ts")],
    };
    assert_eq!(
        h.orchestrator.start_run(other).err(),
        Some(RunRejected::Busy)
    );
    assert_eq!(h.orchestrator.state().current(), before);
    assert_eq!(before.project.as_deref(), Some("cart"));

    assert!(h.orchestrator.cancel().await);
    assert_eq!(handle.wait().await.unwrap().end, RunEnd::Cancelled);
}

#[tokio::test]
async fn test_empty_request_is_rejected() {
    let h = Harness::new(ShLauncher::new("exit 0"));
    assert_eq!(
        h.orchestrator.start_run(h.request(&[])).err(),
        Some(RunRejected::NoSpecs)
    );
    assert_eq!(h.orchestrator.state().current().phase, RunPhase::Idle);
}

#[tokio::test]
async fn test_cancel_when_idle() {
    let h = Harness::new(ShLauncher::new("exit 0"));
    assert!(!h.orchestrator.cancel().await);
}

#[tokio::test]
async fn test_cancel_writes_nothing() {
    let h = Harness::new(ShLauncher::new("sleep 30"));
    let mut events = h.orchestrator.subscribe();

    let handle = h.orchestrator.start_run(h.request(&["a.spec.ts"])).unwrap();
    wait_for_start(&mut events).await;
    assert!(h.orchestrator.cancel().await);

    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.end, RunEnd::Cancelled);
    assert!(summary.metrics.is_empty());
    assert!(h.cached("a.spec.ts").await.is_none());

    let state = h.orchestrator.state().current();
    assert_eq!(state.phase, RunPhase::Idle);
    assert!(state.last_failed_specs.is_empty());
}

#[tokio::test]
async fn test_cancel_kills_runner_that_ignores_interrupt() {
    let h = Harness::with_grace(
        ShLauncher::new("trap '' INT; sleep 30"),
        Duration::from_millis(200),
    );
    let mut events = h.orchestrator.subscribe();

    let handle = h.orchestrator.start_run(h.request(&["a.spec.ts"])).unwrap();
    wait_for_start(&mut events).await;

    let start = Instant::now();
    assert!(h.orchestrator.cancel().await);
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.end, RunEnd::Cancelled);
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_cancel_before_launch_never_spawns() {
    let h = Harness::new(ShLauncher {
        script: "touch launched".to_string(),
        delay: Duration::from_millis(300),
    });

    let handle = h.orchestrator.start_run(h.request(&["a.spec.ts"])).unwrap();
    assert!(h.orchestrator.cancel().await);

    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.end, RunEnd::Cancelled);
    assert!(!h.ws.root.join("launched").exists());
}

#[tokio::test]
async fn test_launch_failure_fails_all_specs() {
    let h = Harness::new(FailingLauncher);

    let summary = h
        .orchestrator
        .start_run(h.request(&["a.spec.ts", "b.spec.ts"]))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(matches!(&summary.end, RunEnd::Failed { message } if message.contains("nx is not installed")));
    assert_eq!(summary.failed_specs.len(), 2);
    assert!(h.cached("a.spec.ts").await.is_none());
    assert_eq!(h.orchestrator.state().current().last_failed_specs.len(), 2);
}

#[tokio::test]
async fn test_progress_follows_banners() {
    let h = Harness::new(ShLauncher::new(
        "echo ' PASS  libs/cart/src/a.spec.ts (1.2 s)'; \
         printf '\\033[1m FAIL \\033[22m libs/cart/src/b.spec.ts\\n'; \
         sleep 30",
    ));
    let mut state = h.orchestrator.state().subscribe();

    let handle = h
        .orchestrator
        .start_run(h.request(&["a.spec.ts", "b.spec.ts", "c.spec.ts"]))
        .unwrap();

    let progress = tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| s.progress.as_ref().is_some_and(|p| p.completed == 2)),
    )
    .await
    .expect("banners were not seen")
    .unwrap()
    .progress
    .clone()
    .unwrap();

    assert_eq!(progress.total, 3);
    assert_eq!(progress.current_spec, Some(h.spec("b.spec.ts")));

    assert!(h.orchestrator.cancel().await);
    handle.wait().await.unwrap();
}
