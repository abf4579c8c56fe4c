//! Worker subprocess abstraction.
//!
//! The supervisor only ever talks to a [`WorkerSpawner`], so the real
//! `tokio::process` implementation can be swapped for the in-memory
//! [`MockWorkerSpawner`] in tests.

pub mod error;
pub mod mock;
pub mod runner;


pub use error::ProcessError;
pub use mock::{MockWorker, MockWorkerSpawner};
pub use runner::{
    ExitStatus, KillSwitch, TokioWorkerSpawner, WorkerCommand, WorkerExit, WorkerHandle,
    WorkerOutput, WorkerSpawner, WorkerStdin,
};
