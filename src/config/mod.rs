use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::subprocess::WorkerCommand;

pub mod loader;

pub use loader::ConfigLoader;

/// File name looked up in the working directory when no `--config` is given
pub const CONFIG_FILE_NAME: &str = "whisper-bridge.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub log_level: Option<String>,
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Working directory of the worker; relative executables resolve here
    pub root: PathBuf,
    /// Path to the worker. A bare name without separators is looked up on PATH.
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Wait between SIGTERM and SIGKILL on shutdown
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    #[serde(with = "humantime_serde")]
    pub restart_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8801,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            executable: PathBuf::from("./whisper"),
            args: Vec::new(),
            kill_grace: Duration::from_secs(2),
            env: BTreeMap::new(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_millis(1000),
            request_timeout: Duration::from_millis(120_000),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply overrides from the process environment
    pub fn merge_env_vars(&mut self) -> Result<()> {
        self.merge_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value
    pub fn merge_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("WHISPER_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("WHISPER_PORT is not a valid port: {port}")))?;
        }

        if let Some(host) = lookup("WHISPER_BRIDGE_HOST") {
            self.server.host = host;
        }

        if let Some(executable) = lookup("WHISPER_BRIDGE_EXECUTABLE") {
            self.worker.executable = PathBuf::from(executable);
        }

        if let Some(root) = lookup("WHISPER_BRIDGE_ROOT") {
            self.worker.root = PathBuf::from(root);
        }

        if let Some(level) = lookup("WHISPER_BRIDGE_LOG") {
            self.log_level = Some(level);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("server.port must not be 0".to_string()));
        }
        if self.worker.executable.as_os_str().is_empty() {
            return Err(Error::Config("worker.executable must be set".to_string()));
        }
        if self.timing.restart_delay.is_zero() {
            return Err(Error::Config("timing.restart_delay must be positive".to_string()));
        }
        if self.timing.request_timeout.is_zero() {
            return Err(Error::Config(
                "timing.request_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Working directory of the worker, made absolute against the current directory
    pub fn worker_root(&self) -> PathBuf {
        absolutize(&self.worker.root)
    }

    /// The executable to spawn: bare names pass through for PATH lookup,
    /// anything else resolves against the worker root.
    pub fn worker_executable(&self) -> PathBuf {
        let executable = &self.worker.executable;
        if executable.is_absolute() || executable.components().count() == 1 {
            executable.clone()
        } else {
            self.worker_root().join(executable)
        }
    }

    pub fn worker_command(&self) -> WorkerCommand {
        WorkerCommand::new(self.worker_executable().to_string_lossy())
            .with_args(&self.worker.args)
            .with_env(&self.worker.env)
            .in_dir(self.worker_root())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}
