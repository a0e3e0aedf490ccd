//! Streaming I/O for processes running inside a container.
//!
//! The agent protocol is pull based: the host long-polls `read_stdout` and
//! `read_stderr` and pushes `write_stdin` chunks. [`ProcessHandle`] hides that
//! behind plain byte channels.

use super::client::AgentClient;
use super::protocol::ProcessParams;
use crate::container::ContainerId;
use crate::error::{CoreError, Result};
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Chunks buffered per stream before the pump stops polling.
const STREAM_BUFFER: usize = 32;

/// How long a single output poll may be held by the agent.
const READ_POLL: Duration = Duration::from_secs(60);

/// Which output stream of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub(crate) fn method(self) -> &'static str {
        match self {
            Self::Stdout => "read_stdout",
            Self::Stderr => "read_stderr",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// A process started with `exec_process`.
///
/// Output arrives on [`stdout`](Self::stdout) and [`stderr`](Self::stderr)
/// until the process closes them. Dropping the handle stops the pumps; it
/// does not kill the process.
pub struct ProcessHandle {
    container_id: ContainerId,
    process: ProcessParams,
    client: AgentClient,
    stdin: Option<mpsc::Sender<Bytes>>,
    stdout: mpsc::Receiver<Bytes>,
    stderr: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    rpc_timeout: Duration,
}

impl ProcessHandle {
    /// Start pumping I/O for an already started process. `cancel` is
    /// triggered when the owning container stops.
    pub(crate) fn spawn(
        client: AgentClient,
        container_id: ContainerId,
        exec_id: String,
        cancel: CancellationToken,
        rpc_timeout: Duration,
    ) -> Self {
        let process = ProcessParams {
            container_id: container_id.to_string(),
            exec_id,
        };
        let (stdin_tx, stdin_rx) = mpsc::channel(STREAM_BUFFER);
        let (stdout_tx, stdout) = mpsc::channel(STREAM_BUFFER);
        let (stderr_tx, stderr) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(pump_output(
            client.clone(),
            process.clone(),
            OutputStream::Stdout,
            stdout_tx,
            cancel.clone(),
        ));
        tokio::spawn(pump_output(
            client.clone(),
            process.clone(),
            OutputStream::Stderr,
            stderr_tx,
            cancel.clone(),
        ));
        tokio::spawn(pump_stdin(
            client.clone(),
            process.clone(),
            stdin_rx,
            cancel.clone(),
            rpc_timeout,
        ));

        Self {
            container_id,
            process,
            client,
            stdin: Some(stdin_tx),
            stdout,
            stderr,
            cancel,
            rpc_timeout,
        }
    }

    pub fn container_id(&self) -> ContainerId {
        self.container_id
    }

    pub fn exec_id(&self) -> &str {
        &self.process.exec_id
    }

    /// Sender for the process's stdin, or `None` once closed.
    pub fn stdin(&self) -> Option<mpsc::Sender<Bytes>> {
        self.stdin.clone()
    }

    /// Close stdin once every outstanding sender is dropped.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    pub fn stdout(&mut self) -> &mut mpsc::Receiver<Bytes> {
        &mut self.stdout
    }

    pub fn stderr(&mut self) -> &mut mpsc::Receiver<Bytes> {
        &mut self.stderr
    }

    /// Wait for the process to exit and return its exit code.
    pub async fn wait(&self, timeout: Duration) -> Result<i32> {
        if self.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CoreError::Cancelled),
            code = self.client.wait_process(&self.process, timeout) => code,
        }
    }

    /// Deliver a signal to the process.
    pub async fn signal(&self, signal: i32) -> Result<()> {
        self.client
            .signal_process(&self.process, signal, self.rpc_timeout)
            .await
    }

    /// Stop all I/O for this process.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("container_id", &self.container_id)
            .field("exec_id", &self.process.exec_id)
            .finish_non_exhaustive()
    }
}

async fn pump_output(
    client: AgentClient,
    process: ProcessParams,
    stream: OutputStream,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            read = client.read_output(stream, &process, READ_POLL) => read,
        };

        match read {
            Ok((data, eof)) => {
                if !data.is_empty() {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = tx.send(data) => if sent.is_err() { break },
                    }
                }
                if eof {
                    tracing::debug!(exec_id = %process.exec_id, %stream, "Output stream reached EOF");
                    break;
                }
            }
            // poll expired with nothing to read
            Err(CoreError::AgentTimeout { .. }) => continue,
            Err(e) => {
                tracing::debug!(exec_id = %process.exec_id, %stream, error = %e, "Output stream ended");
                break;
            }
        }
    }
}

async fn pump_stdin(
    client: AgentClient,
    process: ProcessParams,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    timeout: Duration,
) {
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = rx.recv() => chunk,
        };

        match chunk {
            Some(data) => {
                if let Err(e) = client.write_stdin(&process, &data, timeout).await {
                    tracing::warn!(exec_id = %process.exec_id, error = %e, "Failed to write stdin");
                    return;
                }
            }
            None => {
                if let Err(e) = client.close_stdin(&process, timeout).await {
                    tracing::debug!(exec_id = %process.exec_id, error = %e, "Failed to close stdin");
                }
                return;
            }
        }
    }
}
