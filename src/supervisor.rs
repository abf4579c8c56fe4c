//! Worker process lifecycle.
//!
//! The supervisor owns the single live worker. Each spawn gets a fresh
//! [`WorkerId`]; a pump task forwards that worker's output and exit to the
//! owner as [`WorkerEvent`]s tagged with the id, so events from a replaced
//! worker can be recognised and dropped. Request lines reach the worker's
//! stdin through a per-worker writer task, so a worker that stops reading
//! never blocks the owner.
//!
//! ```text
//!   Stopped --start--> Running --exit--> Restarting --delay--> Running
//!                         ^                  |
//!                         +---spawn failed---+ (retried after the same delay)
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::RecognizeError;
use crate::subprocess::{
    ExitStatus, KillSwitch, ProcessError, WorkerCommand, WorkerExit, WorkerOutput, WorkerSpawner,
    WorkerStdin,
};

const CHUNK_SIZE: usize = 8192;

/// How long output is still drained after the worker exited.
/// Bounds the wait when a forked helper keeps the pipe open.
const DRAIN_WINDOW: Duration = Duration::from_millis(250);

/// Used when `now + restart_delay` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerId(u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug)]
pub enum WorkerEvent {
    Stdout {
        worker: WorkerId,
        chunk: Vec<u8>,
    },
    Stderr {
        worker: WorkerId,
        chunk: Vec<u8>,
    },
    /// Writing to stdin failed; later lines to this worker are refused
    WriteFailed {
        worker: WorkerId,
        error: String,
    },
    /// Sent after both output streams were drained
    Exited {
        worker: WorkerId,
        status: Result<ExitStatus, ProcessError>,
    },
}

impl WorkerEvent {
    pub fn worker(&self) -> WorkerId {
        match self {
            WorkerEvent::Stdout { worker, .. }
            | WorkerEvent::Stderr { worker, .. }
            | WorkerEvent::WriteFailed { worker, .. }
            | WorkerEvent::Exited { worker, .. } => *worker,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Running,
    Restarting,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub state: SupervisorState,
    pub worker: Option<WorkerId>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub restarts: u64,
    pub spawn_failures: u64,
}

struct WorkerProcess {
    id: WorkerId,
    pid: Option<u32>,
    lines: mpsc::UnboundedSender<Vec<u8>>,
    writer: JoinHandle<()>,
    kill: Option<KillSwitch>,
    started_at: DateTime<Utc>,
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // A write may be stuck on a worker that stopped reading
        self.writer.abort();
    }
}

enum Lifecycle {
    Stopped,
    Running(WorkerProcess),
    Restarting { at: Instant },
}

pub struct ProcessSupervisor {
    spawner: Arc<dyn WorkerSpawner>,
    command: WorkerCommand,
    restart_delay: Duration,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    lifecycle: Lifecycle,
    next_worker: u64,
    restarts: u64,
    spawn_failures: u64,
    shut_down: bool,
}

impl ProcessSupervisor {
    pub fn new(
        spawner: Arc<dyn WorkerSpawner>,
        command: WorkerCommand,
        restart_delay: Duration,
        events_tx: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            spawner,
            command,
            restart_delay,
            events_tx,
            lifecycle: Lifecycle::Stopped,
            next_worker: 0,
            restarts: 0,
            spawn_failures: 0,
            shut_down: false,
        }
    }

    /// Spawn the worker. A failed spawn is logged and retried after the
    /// restart delay; it never surfaces as an error to callers.
    pub async fn start(&mut self) -> bool {
        if self.shut_down {
            debug!("Supervisor shut down, not starting worker");
            return false;
        }
        if let Lifecycle::Running(worker) = &self.lifecycle {
            warn!("start() called while {} is running", worker.id);
            return true;
        }

        info!("Starting whisper worker: {}", self.command.display());
        match self.spawner.spawn(&self.command).await {
            Ok(handle) => {
                self.next_worker += 1;
                let id = WorkerId(self.next_worker);

                tokio::spawn(pump_worker(
                    id,
                    handle.stdout,
                    handle.stderr,
                    handle.exit,
                    self.events_tx.clone(),
                ));

                let (lines, queued) = mpsc::unbounded_channel();
                let writer = tokio::spawn(write_requests(
                    id,
                    handle.stdin,
                    queued,
                    self.events_tx.clone(),
                ));

                info!("Whisper worker started as {} (pid {:?})", id, handle.pid);
                self.lifecycle = Lifecycle::Running(WorkerProcess {
                    id,
                    pid: handle.pid,
                    lines,
                    writer,
                    kill: Some(handle.kill),
                    started_at: Utc::now(),
                });
                true
            }
            Err(e) => {
                self.spawn_failures += 1;
                error!(
                    "Failed to start whisper worker ({}), retrying in {:?}",
                    e, self.restart_delay
                );
                self.schedule_restart();
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Running(_))
    }

    /// Whether `worker` is the live worker. Events from any other id are stale.
    pub fn is_current(&self, worker: WorkerId) -> bool {
        self.current().is_some_and(|current| current.id == worker)
    }

    /// Queue `text` and a newline for the worker's stdin. Returns without
    /// waiting for the write; a failed write is reported as
    /// [`WorkerEvent::WriteFailed`].
    pub fn write_line(&self, text: &str) -> Result<(), RecognizeError> {
        if text.contains(['\n', '\r']) {
            return Err(RecognizeError::InvalidPayload(
                "file path must not contain line breaks".to_string(),
            ));
        }

        let Lifecycle::Running(worker) = &self.lifecycle else {
            return Err(RecognizeError::ProcessUnavailable);
        };

        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');

        worker.lines.send(line).map_err(|_| {
            warn!("Stdin of {} is closed", worker.id);
            RecognizeError::ProcessUnavailable
        })
    }

    /// Record the exit of `worker`. Returns true when it was the live worker,
    /// in which case a restart has been scheduled.
    pub fn handle_exit(
        &mut self,
        worker: WorkerId,
        status: &Result<ExitStatus, ProcessError>,
    ) -> bool {
        if !self.is_current(worker) {
            debug!("Ignoring exit of stale {}", worker);
            return false;
        }

        match status {
            Ok(status) => warn!("Whisper {} exited with {}. Restarting...", worker, status),
            Err(e) => error!("Lost track of whisper {}: {}. Restarting...", worker, e),
        }

        self.restarts += 1;
        self.schedule_restart();
        true
    }

    /// When the next restart attempt is due, if one is scheduled
    pub fn restart_deadline(&self) -> Option<Instant> {
        match self.lifecycle {
            Lifecycle::Restarting { at } => Some(at),
            _ => None,
        }
    }

    /// Stop restarting and ask the live worker to terminate.
    /// Returns the id of the worker that was signalled.
    pub fn shutdown(&mut self) -> Option<WorkerId> {
        self.shut_down = true;
        match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(mut worker) => {
                info!("Stopping whisper {}", worker.id);
                if let Some(kill) = worker.kill.take() {
                    kill.trigger();
                }
                Some(worker.id)
            }
            _ => None,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        let state = match self.lifecycle {
            Lifecycle::Stopped => SupervisorState::Stopped,
            Lifecycle::Running(_) => SupervisorState::Running,
            Lifecycle::Restarting { .. } => SupervisorState::Restarting,
        };
        let current = self.current();

        WorkerStatus {
            state,
            worker: current.map(|w| w.id),
            pid: current.and_then(|w| w.pid),
            started_at: current.map(|w| w.started_at),
            restarts: self.restarts,
            spawn_failures: self.spawn_failures,
        }
    }

    fn current(&self) -> Option<&WorkerProcess> {
        match &self.lifecycle {
            Lifecycle::Running(worker) => Some(worker),
            _ => None,
        }
    }

    fn schedule_restart(&mut self) {
        if self.shut_down {
            self.lifecycle = Lifecycle::Stopped;
            return;
        }
        let now = Instant::now();
        self.lifecycle = Lifecycle::Restarting {
            at: now
                .checked_add(self.restart_delay)
                .unwrap_or_else(|| now + FAR_FUTURE),
        };
    }
}

/// Write queued request lines to one worker's stdin, in order.
/// Stops at the first failed write.
async fn write_requests(
    worker: WorkerId,
    mut stdin: WorkerStdin,
    mut lines: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    while let Some(line) = lines.recv().await {
        let written = async {
            stdin.write_all(&line).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!("Writing to {} stdin failed: {}", worker, e);
            lines.close();
            let _ = events.send(WorkerEvent::WriteFailed {
                worker,
                error: e.to_string(),
            });
            return;
        }
    }
}

/// Forward one worker's output and exit, in that order.
async fn pump_worker(
    worker: WorkerId,
    mut stdout: WorkerOutput,
    mut stderr: WorkerOutput,
    mut exit: WorkerExit,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut out_buf = vec![0u8; CHUNK_SIZE];
    let mut err_buf = vec![0u8; CHUNK_SIZE];
    let mut stdout_open = true;
    let mut stderr_open = true;

    let status = loop {
        tokio::select! {
            biased;
            read = stdout.read(&mut out_buf), if stdout_open => match read {
                Ok(0) => stdout_open = false,
                Ok(n) => forward_stdout(worker, &out_buf[..n], &events),
                Err(e) => {
                    warn!("Reading {} stdout failed: {}", worker, e);
                    stdout_open = false;
                }
            },
            read = stderr.read(&mut err_buf), if stderr_open => match read {
                Ok(0) => stderr_open = false,
                Ok(n) => forward_stderr(worker, &err_buf[..n], &events),
                Err(e) => {
                    debug!("Reading {} stderr failed: {}", worker, e);
                    stderr_open = false;
                }
            },
            status = &mut exit => break status,
        }
    };

    if stdout_open {
        let drained = tokio::time::timeout(DRAIN_WINDOW, async {
            loop {
                match stdout.read(&mut out_buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => forward_stdout(worker, &out_buf[..n], &events),
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!("{} stdout still open after exit, giving up on it", worker);
        }
    }

    let _ = events.send(WorkerEvent::Exited { worker, status });
}

fn forward_stdout(worker: WorkerId, chunk: &[u8], events: &mpsc::UnboundedSender<WorkerEvent>) {
    debug!(
        "[{} stdout]: {}",
        worker,
        String::from_utf8_lossy(chunk).trim_end()
    );
    let _ = events.send(WorkerEvent::Stdout {
        worker,
        chunk: chunk.to_vec(),
    });
}

fn forward_stderr(worker: WorkerId, chunk: &[u8], events: &mpsc::UnboundedSender<WorkerEvent>) {
    warn!(
        "[{} stderr]: {}",
        worker,
        String::from_utf8_lossy(chunk).trim_end()
    );
    let _ = events.send(WorkerEvent::Stderr {
        worker,
        chunk: chunk.to_vec(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::MockWorkerSpawner;

    fn supervisor(
        spawner: &MockWorkerSpawner,
    ) -> (ProcessSupervisor, mpsc::UnboundedReceiver<WorkerEvent>) {
        supervisor_with_delay(spawner, Duration::from_millis(1000))
    }

    fn supervisor_with_delay(
        spawner: &MockWorkerSpawner,
        restart_delay: Duration,
    ) -> (ProcessSupervisor, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let command = WorkerCommand::new("./whisper").in_dir("/opt/whisper");
        (
            ProcessSupervisor::new(Arc::new(spawner.clone()), command, restart_delay, tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_start_spawns_pinned_command() {
        let spawner = MockWorkerSpawner::new();
        let (mut supervisor, _events) = supervisor(&spawner);

        assert_eq!(supervisor.status().state, SupervisorState::Stopped);
        assert!(supervisor.start().await);
        assert!(supervisor.is_running());

        let history = spawner.spawn_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].program, "./whisper");
        assert_eq!(
            history[0].working_dir.as_deref(),
            Some(std::path::Path::new("/opt/whisper"))
        );

        // Second start while running does not spawn again
        assert!(supervisor.start().await);
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_write_line_appends_newline() {
        let spawner = MockWorkerSpawner::new();
        let (mut supervisor, _events) = supervisor(&spawner);
        supervisor.start().await;
        let mut worker = spawner.next_worker().await;

        supervisor.write_line("/tmp/a.wav").unwrap();
        supervisor.write_line("/tmp/b.wav").unwrap();
        assert_eq!(worker.read_line().await.as_deref(), Some("/tmp/a.wav"));
        assert_eq!(worker.read_line().await.as_deref(), Some("/tmp/b.wav"));
    }

    #[tokio::test]
    async fn test_write_line_does_not_wait_for_reader() {
        let spawner = MockWorkerSpawner::new();
        let (mut supervisor, _events) = supervisor(&spawner);
        supervisor.start().await;
        let mut worker = spawner.next_worker().await;

        // Far beyond the pipe capacity while nobody reads
        let long = format!("/tmp/{}.wav", "a".repeat(256 * 1024));
        supervisor.write_line(&long).unwrap();
        supervisor.write_line("/tmp/b.wav").unwrap();
        assert!(supervisor.is_running());

        assert_eq!(worker.read_line().await, Some(long));
        assert_eq!(worker.read_line().await.as_deref(), Some("/tmp/b.wav"));
    }

    #[tokio::test]
    async fn test_closed_stdin_reports_write_failure() {
        let spawner = MockWorkerSpawner::new();
        let (mut supervisor, mut events) = supervisor(&spawner);
        supervisor.start().await;
        let mut worker = spawner.next_worker().await;
        let id = supervisor.status().worker.unwrap();

        worker.close_stdin();
        supervisor.write_line("/tmp/a.wav").unwrap();
        match events.recv().await.unwrap() {
            WorkerEvent::WriteFailed { worker, .. } => assert_eq!(worker, id),
            other => panic!("expected write failure, got {:?}", other),
        }

        // The writer is gone, so later lines are refused up front
        assert_eq!(
            supervisor.write_line("/tmp/b.wav"),
            Err(RecognizeError::ProcessUnavailable)
        );
    }

    #[tokio::test]
    async fn test_write_line_without_worker_is_unavailable() {
        let spawner = MockWorkerSpawner::new();
        let (supervisor, _events) = supervisor(&spawner);

        assert_eq!(
            supervisor.write_line("/tmp/a.wav"),
            Err(RecognizeError::ProcessUnavailable)
        );
    }

    #[tokio::test]
    async fn test_write_line_rejects_embedded_newline() {
        let spawner = MockWorkerSpawner::new();
        let (mut supervisor, _events) = supervisor(&spawner);
        supervisor.start().await;

        assert!(matches!(
            supervisor.write_line("/tmp/a.wav\n/etc/passwd"),
            Err(RecognizeError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_output_is_forwarded_in_order_before_exit() {
        let spawner = MockWorkerSpawner::new();
        let (mut supervisor, mut events) = supervisor(&spawner);
        supervisor.start().await;
        let mut worker = spawner.next_worker().await;

        worker.emit("one\n").await.unwrap();
        worker.emit_stderr("warning\n").await.unwrap();
        worker.emit("two\n").await.unwrap();
        worker.exit(1);

        let mut stdout = Vec::new();
        let mut saw_stderr = false;
        let status = loop {
            match events.recv().await.unwrap() {
                WorkerEvent::Stdout { chunk, .. } => stdout.extend(chunk),
                WorkerEvent::Stderr { chunk, .. } => {
                    assert_eq!(chunk, b"warning\n");
                    saw_stderr = true;
                }
                WorkerEvent::Exited { status, .. } => break status.unwrap(),
                other => panic!("unexpected event {:?}", other),
            }
        };

        assert_eq!(stdout, b"one\ntwo\n");
        assert!(saw_stderr);
        assert_eq!(status, ExitStatus::Error(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_schedules_restart_after_delay() {
        let spawner = MockWorkerSpawner::new();
        let (mut supervisor, mut events) = supervisor(&spawner);
        supervisor.start().await;
        let worker = spawner.next_worker().await;
        let first = supervisor.status().worker.unwrap();

        worker.exit(139);
        let event = events.recv().await.unwrap();
        let WorkerEvent::Exited { worker: id, status } = event else {
            panic!("expected exit event, got {:?}", event);
        };
        assert_eq!(id, first);
        assert!(supervisor.handle_exit(id, &status));
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.status().state, SupervisorState::Restarting);

        let deadline = supervisor.restart_deadline().unwrap();
        assert_eq!(deadline - Instant::now(), Duration::from_millis(1000));

        tokio::time::sleep_until(deadline).await;
        assert!(supervisor.start().await);
        let status = supervisor.status();
        assert_eq!(status.restarts, 1);
        assert_ne!(status.worker, Some(first));

        // The old worker's id is stale now
        assert!(!supervisor.handle_exit(first, &Ok(ExitStatus::Success)));
    }

    #[tokio::test]
    async fn test_spawn_failure_schedules_retry() {
        let spawner = MockWorkerSpawner::new();
        spawner.fail_next(1);
        let (mut supervisor, _events) = supervisor(&spawner);

        assert!(!supervisor.start().await);
        assert!(!supervisor.is_running());
        assert!(supervisor.restart_deadline().is_some());
        assert_eq!(supervisor.status().spawn_failures, 1);

        assert!(supervisor.start().await);
        assert!(supervisor.restart_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_restart_delay_does_not_overflow() {
        let spawner = MockWorkerSpawner::new();
        spawner.fail_next(1);
        let (mut supervisor, _events) = supervisor_with_delay(&spawner, Duration::MAX);

        assert!(!supervisor.start().await);
        let deadline = supervisor.restart_deadline().unwrap();
        assert!(deadline > Instant::now() + Duration::from_secs(86_400 * 365));
    }

    #[tokio::test]
    async fn test_shutdown_kills_worker_and_stops_restarts() {
        let spawner = MockWorkerSpawner::new();
        let (mut supervisor, mut events) = supervisor(&spawner);
        supervisor.start().await;
        let _worker = spawner.next_worker().await;

        let id = supervisor.shutdown().unwrap();
        assert_eq!(supervisor.status().state, SupervisorState::Stopped);

        // Kill path: output never closes on the mock, so the drain window elapses
        let event = loop {
            let event = events.recv().await.unwrap();
            if matches!(event, WorkerEvent::Exited { .. }) {
                break event;
            }
        };
        assert_eq!(event.worker(), id);
        assert!(!supervisor.handle_exit(id, &Ok(ExitStatus::Signal(15))));
        assert!(!supervisor.start().await);
        assert_eq!(spawner.spawn_count(), 1);
    }
}
