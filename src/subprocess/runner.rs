use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use super::error::ProcessError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Variables set on top of the inherited environment
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Program and arguments joined for log lines
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(*code),
            ExitStatus::Signal(_) => None,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Success => write!(f, "exit code 0"),
            ExitStatus::Error(code) => write!(f, "exit code {code}"),
            ExitStatus::Signal(sig) => write!(f, "signal {sig}"),
        }
    }
}

pub type WorkerStdin = Pin<Box<dyn AsyncWrite + Send>>;
pub type WorkerOutput = Pin<Box<dyn AsyncRead + Send>>;
pub type WorkerExit = Pin<Box<dyn Future<Output = Result<ExitStatus, ProcessError>> + Send>>;

/// Requests termination of a spawned worker. The exit future observes it.
#[derive(Debug)]
pub struct KillSwitch(oneshot::Sender<()>);

impl KillSwitch {
    pub fn pair() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn trigger(self) {
        let _ = self.0.send(());
    }
}

/// Live stdio and lifecycle handles of a freshly spawned worker.
pub struct WorkerHandle {
    pub pid: Option<u32>,
    pub stdin: WorkerStdin,
    pub stdout: WorkerOutput,
    pub stderr: WorkerOutput,
    pub exit: WorkerExit,
    pub kill: KillSwitch,
}

#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, command: &WorkerCommand) -> Result<WorkerHandle, ProcessError>;
}

pub struct TokioWorkerSpawner {
    kill_grace: Duration,
}

impl Default for TokioWorkerSpawner {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(2),
        }
    }
}

impl TokioWorkerSpawner {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    /// Convert a std ExitStatus to our ExitStatus enum
    fn convert_exit_status(status: std::process::ExitStatus) -> ExitStatus {
        if status.success() {
            return ExitStatus::Success;
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitStatus::Signal(signal);
            }
        }

        ExitStatus::Error(status.code().unwrap_or(-1))
    }

    /// Configure the command with environment, working directory and piped stdio
    fn configure_command(command: &WorkerCommand) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&command.program);

        // Own process group so termination reaches helpers the worker forks
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        cmd.args(&command.args);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Ask the worker to stop, escalating to SIGKILL after the grace period
    async fn terminate(
        child: &mut tokio::process::Child,
        grace: Duration,
    ) -> Result<std::process::ExitStatus, ProcessError> {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!("SIGTERM to worker group {} failed: {}", pid, e);
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => return status.map_err(ProcessError::Io),
                Err(_) => tracing::warn!(
                    "Worker {} ignored SIGTERM for {:?}, killing",
                    pid,
                    grace
                ),
            }
        }

        child.start_kill()?;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => status.map_err(ProcessError::Io),
            Err(_) => Err(ProcessError::KillTimeout(grace)),
        }
    }

    fn create_exit_future(
        mut child: tokio::process::Child,
        kill_rx: oneshot::Receiver<()>,
        grace: Duration,
        command: String,
    ) -> WorkerExit {
        Box::pin(async move {
            let status = tokio::select! {
                status = child.wait() => status.map_err(|e| ProcessError::IoError {
                    command: command.clone(),
                    source: e,
                })?,
                Ok(()) = kill_rx => Self::terminate(&mut child, grace).await?,
            };
            Ok(Self::convert_exit_status(status))
        })
    }
}

#[async_trait]
impl WorkerSpawner for TokioWorkerSpawner {
    async fn spawn(&self, command: &WorkerCommand) -> Result<WorkerHandle, ProcessError> {
        tracing::debug!("Spawning worker: {}", command.display());
        if let Some(ref dir) = command.working_dir {
            tracing::trace!("Working directory: {:?}", dir);
        }

        let mut child = Self::configure_command(command)
            .spawn()
            .map_err(|e| ProcessError::from_spawn(&command.program, e))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or(ProcessError::PipeUnavailable("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::PipeUnavailable("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::PipeUnavailable("stderr"))?;

        let (kill, kill_rx) = KillSwitch::pair();
        let exit = Self::create_exit_future(child, kill_rx, self.kill_grace, command.display());

        Ok(WorkerHandle {
            pid,
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            exit,
            kill,
        })
    }
}
