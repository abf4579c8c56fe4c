//! # whisper-bridge
//!
//! Turns a long-running, line-oriented speech recognition worker into a
//! single-flight HTTP service.
//!
//! ## Usage
//!
//! ```bash
//! whisper-bridge serve --root /opt/whisper -- --encoder ./models/small-encoder.axmodel
//! whisper-bridge recognize /tmp/a.wav
//! ```
//!
//! ## Modules
//!
//! - `subprocess` - Spawning the worker behind a mockable trait
//! - `supervisor` - Worker lifecycle: spawn, exit detection, restart after a fixed delay
//! - `correlator` - Extraction of `Result: <text>` lines from the worker's stdout
//! - `gate` - Single-flight admission and request timeouts
//! - `orchestrator` - The actor tying the above together, and its service handle
//! - `server` - HTTP routes
//! - `client` - HTTP client for a running bridge
//! - `config` - TOML and environment configuration
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod gate;
pub mod orchestrator;
pub mod server;
pub mod subprocess;
pub mod supervisor;

pub use config::BridgeConfig;
pub use correlator::Recognition;
pub use error::{Error, RecognizeError, Result};
pub use orchestrator::{Orchestrator, RecognitionService, ServiceStatus};
