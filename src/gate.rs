//! Single-flight admission of recognition requests.
//!
//! At most one [`PendingRequest`] exists at a time. Every admitted request is
//! resolved exactly once: with a result, a timeout, or a process-lost
//! failure. Whichever resolution arrives first wins; the others find a stale
//! ticket and do nothing.

use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::correlator::Recognition;
use crate::error::RecognizeError;

pub type Outcome = Result<Recognition, RecognizeError>;

/// Identifies one admission. Tickets are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Returned to the orchestrator on admission; the receiver goes to the caller.
#[derive(Debug)]
pub struct Admission {
    pub ticket: Ticket,
    pub receiver: oneshot::Receiver<Outcome>,
}

struct PendingRequest {
    ticket: Ticket,
    payload: String,
    responder: oneshot::Sender<Outcome>,
    admitted_at: Instant,
    timeout: JoinHandle<()>,
}

pub struct RequestGate {
    pending: Option<PendingRequest>,
    next_ticket: u64,
    timeout: Duration,
    expiry_tx: mpsc::UnboundedSender<Ticket>,
}

impl RequestGate {
    /// `expiry_tx` receives the ticket of every request whose timeout elapsed.
    /// The owner must hand those back to [`RequestGate::expire`].
    pub fn new(timeout: Duration, expiry_tx: mpsc::UnboundedSender<Ticket>) -> Self {
        Self {
            pending: None,
            next_ticket: 0,
            timeout,
            expiry_tx,
        }
    }

    /// Admit `payload` unless another request is in flight.
    ///
    /// A `Busy` rejection leaves the pending request untouched.
    pub fn admit(&mut self, payload: &str) -> Result<Admission, RecognizeError> {
        if let Some(pending) = &self.pending {
            debug!(
                "Rejecting {:?}: request {} for {:?} still pending",
                payload, pending.ticket, pending.payload
            );
            return Err(RecognizeError::Busy);
        }

        self.next_ticket += 1;
        let ticket = Ticket(self.next_ticket);
        let (responder, receiver) = oneshot::channel();
        let timeout = self.schedule_timeout(ticket);

        self.pending = Some(PendingRequest {
            ticket,
            payload: payload.to_string(),
            responder,
            admitted_at: Instant::now(),
            timeout,
        });
        debug!("Admitted request {} for {:?}", ticket, payload);

        Ok(Admission { ticket, receiver })
    }

    /// Complete the request identified by `ticket`. Stale tickets are ignored.
    pub fn resolve(&mut self, ticket: Ticket, outcome: Outcome) -> bool {
        match self.take(ticket) {
            Some(pending) => {
                pending.timeout.abort();
                Self::deliver(pending, outcome);
                true
            }
            None => {
                debug!("Ignoring resolution for stale request {}", ticket);
                false
            }
        }
    }

    /// Time out the request identified by `ticket` if it is still pending
    pub fn expire(&mut self, ticket: Ticket) -> bool {
        match self.take(ticket) {
            Some(pending) => {
                warn!(
                    "Request {} for {:?} timed out after {:?}",
                    ticket, pending.payload, self.timeout
                );
                Self::deliver(pending, Err(RecognizeError::Timeout(self.timeout)));
                true
            }
            None => false,
        }
    }

    /// Fail whatever is pending with `reason`, bypassing the timeout
    pub fn fail_all(&mut self, reason: RecognizeError) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.timeout.abort();
                warn!(
                    "Failing request {} for {:?}: {}",
                    pending.ticket, pending.payload, reason
                );
                Self::deliver(pending, Err(reason));
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    pub fn current(&self) -> Option<Ticket> {
        self.pending.as_ref().map(|p| p.ticket)
    }

    pub fn pending_payload(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.payload.as_str())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn take(&mut self, ticket: Ticket) -> Option<PendingRequest> {
        if self.current() == Some(ticket) {
            self.pending.take()
        } else {
            None
        }
    }

    fn schedule_timeout(&self, ticket: Ticket) -> JoinHandle<()> {
        let expiry_tx = self.expiry_tx.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = expiry_tx.send(ticket);
        })
    }

    fn deliver(pending: PendingRequest, outcome: Outcome) {
        let elapsed = pending.admitted_at.elapsed();
        match &outcome {
            Ok(_) => info!(
                "Request {} for {:?} completed in {:?}",
                pending.ticket, pending.payload, elapsed
            ),
            Err(e) => debug!(
                "Request {} for {:?} failed after {:?}: {}",
                pending.ticket, pending.payload, elapsed, e
            ),
        }

        if pending.responder.send(outcome).is_err() {
            debug!("Caller of request {} went away", pending.ticket);
        }
    }
}

impl Drop for RequestGate {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.timeout.abort();
        }
    }
}
