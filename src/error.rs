use std::time::Duration;
use thiserror::Error;

use crate::subprocess::ProcessError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Server error: {0}")]
    Server(String),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{code} ({status}): {message}")]
    Remote {
        status: u16,
        code: String,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Every way a recognition request can end without a result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecognizeError {
    #[error("Invalid file path: {0}")]
    InvalidPayload(String),

    #[error("Whisper service is not running.")]
    ProcessUnavailable,

    #[error("Service is busy. Please try again later.")]
    Busy,

    #[error("Request timed out after {0:?}.")]
    Timeout(Duration),

    #[error("Whisper service exited while processing the request ({0}).")]
    ProcessLost(String),

    #[error("Recognition service has shut down.")]
    ServiceStopped,
}

impl RecognizeError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            RecognizeError::InvalidPayload(_) => "INVALID_PAYLOAD",
            RecognizeError::ProcessUnavailable => "PROCESS_UNAVAILABLE",
            RecognizeError::Busy => "BUSY",
            RecognizeError::Timeout(_) => "TIMEOUT",
            RecognizeError::ProcessLost(_) => "PROCESS_LOST",
            RecognizeError::ServiceStopped => "SERVICE_STOPPED",
        }
    }
}
