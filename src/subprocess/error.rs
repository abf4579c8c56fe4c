use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Permission denied executing {0}")]
    PermissionDenied(String),

    #[error("Worker did not exit within {0:?} of being signalled")]
    KillTimeout(Duration),

    #[error("Worker stdio pipe unavailable: {0}")]
    PipeUnavailable(&'static str),

    #[error("IO error running {command}: {source}")]
    IoError {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mock spawn failure: {0}")]
    MockSpawnFailure(String),
}

impl ProcessError {
    /// Classify a spawn failure by the OS error kind.
    pub fn from_spawn(program: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ProcessError::CommandNotFound(program.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                ProcessError::PermissionDenied(program.to_string())
            }
            _ => ProcessError::IoError {
                command: program.to_string(),
                source: err,
            },
        }
    }
}
