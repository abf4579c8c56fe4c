//! Request handling on top of the supervised worker.
//!
//! [`Orchestrator`] is an actor: one task owns the [`RequestGate`], the
//! [`OutputCorrelator`] and the [`ProcessSupervisor`] and handles inbound
//! requests, worker output, worker exits, timeouts and restart deadlines one
//! event at a time. Callers talk to it through the cloneable
//! [`RecognitionService`] handle.
//!
//! The worker protocol carries no request identifiers. If a result arrives
//! after its request timed out and a new request has already been admitted,
//! that result is attributed to the new request. This is accepted: the
//! correlator is reset on every admission, so at most one stale line can be
//! misattributed, and only after a timeout.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::correlator::{Extraction, OutputCorrelator, Recognition};
use crate::error::RecognizeError;
use crate::gate::{Outcome, RequestGate, Ticket};
use crate::subprocess::WorkerSpawner;
use crate::supervisor::{ProcessSupervisor, WorkerEvent, WorkerId, WorkerStatus};

const COMMAND_BUFFER: usize = 32;

/// Extra time granted on shutdown beyond the kill grace period
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

type Admitted = Result<oneshot::Receiver<Outcome>, RecognizeError>;

enum Command {
    Recognize {
        payload: String,
        reply: oneshot::Sender<Admitted>,
    },
    Status {
        reply: oneshot::Sender<ServiceStatus>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Snapshot of the bridge for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub worker: WorkerStatus,
    pub busy: bool,
    pub pending: Option<String>,
}

/// Handle to a running [`Orchestrator`]
#[derive(Clone)]
pub struct RecognitionService {
    commands: mpsc::Sender<Command>,
}

impl RecognitionService {
    /// Recognize the audio file at `file_path`.
    ///
    /// Resolves with the extracted text or exactly one of the
    /// [`RecognizeError`] outcomes. Never waits longer than the configured
    /// request timeout once admitted.
    pub async fn recognize(&self, file_path: impl Into<String>) -> Outcome {
        let (reply, admitted) = oneshot::channel();
        self.send(Command::Recognize {
            payload: file_path.into(),
            reply,
        })
        .await?;

        let receiver = admitted
            .await
            .map_err(|_| RecognizeError::ServiceStopped)??;
        receiver.await.map_err(|_| RecognizeError::ServiceStopped)?
    }

    pub async fn status(&self) -> Result<ServiceStatus, RecognizeError> {
        let (reply, status) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        status.await.map_err(|_| RecognizeError::ServiceStopped)
    }

    /// Fail any pending request, stop the worker and end the orchestrator.
    /// Returns once the worker has exited or the kill grace period elapsed.
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.send(Command::Shutdown { done }).await.is_ok() {
            let _ = finished.await;
        }
    }

    async fn send(&self, command: Command) -> Result<(), RecognizeError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RecognizeError::ServiceStopped)
    }
}

pub struct Orchestrator {
    gate: RequestGate,
    correlator: OutputCorrelator,
    supervisor: ProcessSupervisor,
    commands: mpsc::Receiver<Command>,
    worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
    expiries: mpsc::UnboundedReceiver<Ticket>,
    shutdown_wait: Duration,
}

impl Orchestrator {
    /// Start the orchestrator task. The first worker is spawned before any
    /// request is handled.
    pub fn spawn(
        config: &BridgeConfig,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> (RecognitionService, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, worker_events) = mpsc::unbounded_channel();
        let (expiry_tx, expiries) = mpsc::unbounded_channel();

        let orchestrator = Self {
            gate: RequestGate::new(config.timing.request_timeout, expiry_tx),
            correlator: OutputCorrelator::new(),
            supervisor: ProcessSupervisor::new(
                spawner,
                config.worker_command(),
                config.timing.restart_delay,
                events_tx,
            ),
            commands,
            worker_events,
            expiries,
            shutdown_wait: config.worker.kill_grace + SHUTDOWN_SLACK,
        };

        let handle = tokio::spawn(orchestrator.run());
        (
            RecognitionService {
                commands: commands_tx,
            },
            handle,
        )
    }

    async fn run(mut self) {
        self.supervisor.start().await;

        loop {
            let restart_at = self.supervisor.restart_deadline();

            tokio::select! {
                biased;
                Some(event) = self.worker_events.recv() => self.on_worker_event(event),
                Some(ticket) = self.expiries.recv() => {
                    self.gate.expire(ticket);
                }
                _ = tokio::time::sleep_until(restart_at.unwrap_or_else(Instant::now)),
                    if restart_at.is_some() =>
                {
                    self.supervisor.start().await;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Recognize { payload, reply }) => {
                        let admitted = self.on_recognize(payload);
                        let _ = reply.send(admitted);
                    }
                    Some(Command::Status { reply }) => {
                        let _ = reply.send(self.status());
                    }
                    Some(Command::Shutdown { done }) => {
                        self.stop().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        debug!("All service handles dropped");
                        self.stop().await;
                        break;
                    }
                },
            }
        }

        info!("Recognition service stopped");
    }

    fn on_recognize(&mut self, payload: String) -> Admitted {
        validate_payload(&payload)?;

        if !self.supervisor.is_running() {
            debug!("Rejecting {:?}: no live worker", payload);
            return Err(RecognizeError::ProcessUnavailable);
        }

        let admission = self.gate.admit(&payload)?;
        self.correlator.reset();

        if let Err(e) = self.supervisor.write_line(&payload) {
            self.gate.resolve(admission.ticket, Err(e));
        }

        Ok(admission.receiver)
    }

    fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Stdout { worker, chunk } => {
                if !self.supervisor.is_current(worker) {
                    debug!("Dropping output of stale {}", worker);
                    return;
                }
                let Some(ticket) = self.gate.current() else {
                    return;
                };
                if let Some(extraction) = self.correlator.feed(&chunk) {
                    self.complete(ticket, worker, extraction);
                }
            }
            // Already logged by the pump; never part of correlation
            WorkerEvent::Stderr { .. } => {}
            WorkerEvent::WriteFailed { worker, error } => {
                if !self.supervisor.is_current(worker) {
                    return;
                }
                if let Some(ticket) = self.gate.current() {
                    debug!("Request {} never reached {}: {}", ticket, worker, error);
                    self.gate
                        .resolve(ticket, Err(RecognizeError::ProcessUnavailable));
                }
            }
            WorkerEvent::Exited { worker, status } => {
                if !self.supervisor.handle_exit(worker, &status) {
                    return;
                }
                // stdout is drained before the exit is reported, so a marker
                // line cut off by EOF is complete now
                if let Some(ticket) = self.gate.current() {
                    if let Some(extraction) = self.correlator.finish() {
                        self.complete(ticket, worker, extraction);
                    }
                }
                let reason = match &status {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                };
                self.gate.fail_all(RecognizeError::ProcessLost(reason));
            }
        }
    }

    fn complete(&mut self, ticket: Ticket, worker: WorkerId, extraction: Extraction) {
        if extraction.is_malformed() {
            warn!(
                "Could not parse result line from {}: {:?}",
                worker,
                String::from_utf8_lossy(self.correlator.accumulated())
            );
        }
        let file_path = self.gate.pending_payload().unwrap_or_default().to_string();
        self.gate
            .resolve(ticket, Ok(Recognition::new(file_path, extraction)));
    }

    fn status(&self) -> ServiceStatus {
        ServiceStatus {
            worker: self.supervisor.status(),
            busy: self.gate.is_busy(),
            pending: self.gate.pending_payload().map(str::to_string),
        }
    }

    async fn stop(&mut self) {
        self.gate.fail_all(RecognizeError::ServiceStopped);

        let Some(worker) = self.supervisor.shutdown() else {
            return;
        };

        let exited = tokio::time::timeout(self.shutdown_wait, async {
            loop {
                match self.worker_events.recv().await {
                    Some(WorkerEvent::Exited { worker: id, status }) if id == worker => {
                        break Some(status)
                    }
                    Some(_) => continue,
                    None => break None,
                }
            }
        })
        .await;

        match exited {
            Ok(Some(Ok(status))) => info!("Whisper {} stopped ({})", worker, status),
            Ok(Some(Err(e))) => warn!("Whisper {} stopped with error: {}", worker, e),
            Ok(None) => debug!("Worker event channel closed before {} exited", worker),
            Err(_) => warn!(
                "Whisper {} did not report exit within {:?}",
                worker, self.shutdown_wait
            ),
        }
    }
}

fn validate_payload(payload: &str) -> Result<(), RecognizeError> {
    if payload.trim().is_empty() {
        return Err(RecognizeError::InvalidPayload(
            "file path must not be empty".to_string(),
        ));
    }
    if payload.contains(['\n', '\r']) {
        return Err(RecognizeError::InvalidPayload(
            "file path must not contain line breaks".to_string(),
        ));
    }
    Ok(())
}
