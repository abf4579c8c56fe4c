use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot};

use super::error::ProcessError;
use super::runner::{ExitStatus, KillSwitch, WorkerCommand, WorkerHandle, WorkerSpawner};

const PIPE_CAPACITY: usize = 64 * 1024;

/// In-memory worker spawner. Every successful spawn hands a scripted
/// [`MockWorker`] to the test through [`MockWorkerSpawner::next_worker`].
#[derive(Clone)]
pub struct MockWorkerSpawner {
    state: Arc<Mutex<MockState>>,
    workers_tx: mpsc::UnboundedSender<MockWorker>,
    workers_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MockWorker>>>,
}

struct MockState {
    next_pid: u32,
    failures_remaining: usize,
    spawn_history: Vec<WorkerCommand>,
}

/// Test side of a mock worker: reads what the bridge wrote and scripts output.
pub struct MockWorker {
    pub pid: u32,
    stdin: Option<BufReader<DuplexStream>>,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    exit_tx: Option<oneshot::Sender<ExitStatus>>,
}

impl MockWorkerSpawner {
    pub fn new() -> Self {
        let (workers_tx, workers_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_pid: 1000,
                failures_remaining: 0,
                spawn_history: Vec::new(),
            })),
            workers_tx,
            workers_rx: Arc::new(tokio::sync::Mutex::new(workers_rx)),
        }
    }

    /// Make the next `n` spawn attempts fail as if the executable were missing
    pub fn fail_next(&self, n: usize) {
        self.state.lock().unwrap().failures_remaining = n;
    }

    /// Every command passed to `spawn`, including failed attempts
    pub fn spawn_history(&self) -> Vec<WorkerCommand> {
        self.state.lock().unwrap().spawn_history.clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.state.lock().unwrap().spawn_history.len()
    }

    /// Wait for the next successfully spawned worker
    pub async fn next_worker(&self) -> MockWorker {
        self.workers_rx
            .lock()
            .await
            .recv()
            .await
            .expect("mock spawner channel closed")
    }
}

#[async_trait]
impl WorkerSpawner for MockWorkerSpawner {
    async fn spawn(&self, command: &WorkerCommand) -> Result<WorkerHandle, ProcessError> {
        let pid = {
            let mut state = self.state.lock().unwrap();
            state.spawn_history.push(command.clone());
            if state.failures_remaining > 0 {
                state.failures_remaining -= 1;
                return Err(ProcessError::MockSpawnFailure(command.program.clone()));
            }
            state.next_pid += 1;
            state.next_pid
        };

        let (bridge_stdin, worker_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (bridge_stdout, worker_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (bridge_stderr, worker_stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill, kill_rx) = KillSwitch::pair();

        let exit = Box::pin(async move {
            tokio::select! {
                Ok(()) = kill_rx => Ok::<_, ProcessError>(ExitStatus::Signal(15)),
                status = exit_rx => Ok(status.unwrap_or(ExitStatus::Signal(9))),
            }
        });

        let worker = MockWorker {
            pid,
            stdin: Some(BufReader::new(worker_stdin)),
            stdout: Some(worker_stdout),
            stderr: Some(worker_stderr),
            exit_tx: Some(exit_tx),
        };
        // The receiver lives as long as any clone of the spawner
        let _ = self.workers_tx.send(worker);

        Ok(WorkerHandle {
            pid: Some(pid),
            stdin: Box::pin(bridge_stdin),
            stdout: Box::pin(bridge_stdout),
            stderr: Box::pin(bridge_stderr),
            exit,
            kill,
        })
    }
}

impl MockWorker {
    /// Read the next request line the bridge wrote, without its newline.
    /// Returns `None` once the bridge side of stdin is gone.
    pub async fn read_line(&mut self) -> Option<String> {
        let stdin = self.stdin.as_mut()?;
        let mut line = String::new();
        match stdin.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\n', '\r']).to_string()),
        }
    }

    /// Stop reading requests. Further writes from the bridge fail.
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Write raw text to the worker's stdout
    pub async fn emit(&mut self, text: &str) -> std::io::Result<()> {
        match self.stdout.as_mut() {
            Some(stdout) => {
                stdout.write_all(text.as_bytes()).await?;
                stdout.flush().await
            }
            None => Err(std::io::ErrorKind::BrokenPipe.into()),
        }
    }

    /// Write raw text to the worker's stderr
    pub async fn emit_stderr(&mut self, text: &str) -> std::io::Result<()> {
        match self.stderr.as_mut() {
            Some(stderr) => {
                stderr.write_all(text.as_bytes()).await?;
                stderr.flush().await
            }
            None => Err(std::io::ErrorKind::BrokenPipe.into()),
        }
    }

    /// Close the output streams and exit with `code`
    pub fn exit(mut self, code: i32) {
        self.stdout.take();
        self.stderr.take();
        let status = if code == 0 {
            ExitStatus::Success
        } else {
            ExitStatus::Error(code)
        };
        if let Some(tx) = self.exit_tx.take() {
            let _ = tx.send(status);
        }
    }
}

impl Default for MockWorkerSpawner {
    fn default() -> Self {
        Self::new()
    }
}
