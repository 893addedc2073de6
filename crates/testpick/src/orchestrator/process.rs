//! Supervising the runner process: line streaming, interrupt, kill.

use eyre::{Result, WrapErr};
use std::process::Stdio;
use std::time::Duration;
use testpick_core::{RunPhase, RunningState};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Upper bound on waiting for pipes to close after the process has exited.
/// Grandchildren can keep them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessExit {
    /// Exit code; termination by signal counts as 1
    Exited(i32),
    Cancelled,
}

fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send((stream, line)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(?stream, "stopped reading runner output: {}", e);
                    break;
                }
            }
        }
    });
}

async fn cancel_requested(rx: &mut watch::Receiver<RunningState>) -> bool {
    rx.wait_for(|s| s.phase == RunPhase::Cancelling).await.is_ok()
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        debug!(pid, "killpg {:?} failed: {}", signal, e);
    }
}

/// Ask the process to stop, then force it after `grace`.
async fn interrupt(child: &mut Child, grace: Duration) -> Result<()> {
    #[cfg(unix)]
    signal_group(child, nix::sys::signal::Signal::SIGINT);

    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            debug!(?status, "runner stopped after interrupt");
        }
        Err(_) => {
            warn!(grace_ms = grace.as_millis() as u64, "runner ignored interrupt, killing it");
            #[cfg(unix)]
            signal_group(child, nix::sys::signal::Signal::SIGKILL);
            let _ = child.start_kill();
            child.wait().await.wrap_err("failed to reap runner")?;
        }
    }
    Ok(())
}

async fn drain(rx: &mut mpsc::UnboundedReceiver<(OutputStream, String)>, on_line: &mut impl FnMut(OutputStream, String)) {
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Some((stream, line)) = rx.recv().await {
            on_line(stream, line);
        }
    })
    .await;
    if drained.is_err() {
        debug!("runner output still open after exit, not waiting for it");
    }
}

/// Spawn `command` and stream its output until it exits or a cancel is requested.
///
/// A cancel is observed through `state` entering [`RunPhase::Cancelling`]. The
/// process runs in its own process group so the interrupt reaches the whole tree.
pub(crate) async fn supervise(
    mut command: Command,
    grace: Duration,
    mut state: watch::Receiver<RunningState>,
    mut on_line: impl FnMut(OutputStream, String),
) -> Result<ProcessExit> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().wrap_err("failed to launch test runner")?;
    debug!(pid = child.id(), "runner spawned");

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, OutputStream::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, OutputStream::Stderr, tx.clone());
    }
    drop(tx);

    let mut output_open = true;
    let mut cancel_watch_open = true;

    loop {
        tokio::select! {
            line = rx.recv(), if output_open => match line {
                Some((stream, line)) => on_line(stream, line),
                None => output_open = false,
            },
            status = child.wait() => {
                let status = status.wrap_err("failed to wait for test runner")?;
                drain(&mut rx, &mut on_line).await;
                return Ok(ProcessExit::Exited(status.code().unwrap_or(1)));
            }
            requested = cancel_requested(&mut state), if cancel_watch_open => {
                if !requested {
                    cancel_watch_open = false;
                    continue;
                }
                interrupt(&mut child, grace).await?;
                drain(&mut rx, &mut on_line).await;
                return Ok(ProcessExit::Cancelled);
            }
        }
    }
}
