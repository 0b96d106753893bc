//! Process bridge
//!
//! Starts the configured command and wires its standard streams to an SSH
//! channel: channel data feeds stdin, stdout is sent back as channel data,
//! stderr stays on the daemon's own stderr.

use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use nb_core::config::DaemonConfig;
use nb_core::error::BridgeError;

use crate::dispatch::ChannelProcess;

/// Read size for process output
const OUTPUT_CHUNK_SIZE: usize = 32 * 1024;

/// Client bytes that may wait for a process's stdin at any one time
pub const STDIN_BUFFER_LIMIT: usize = 256 * 1024;

/// Queued input chunk, holding its share of the stdin budget until written
type InputChunk = (Bytes, OwnedSemaphorePermit);

/// A running process bridged to a channel.
///
/// Dropping it aborts both pump tasks, which kills the child.
pub struct BridgedProcess {
    pid: Option<u32>,
    stdin_tx: Option<mpsc::UnboundedSender<InputChunk>>,
    input_budget: Arc<Semaphore>,
    input_task: JoinHandle<()>,
    output_task: JoinHandle<()>,
}

impl BridgedProcess {
    /// Start the configured command for `channel`.
    ///
    /// Returns once the process is launched; output is delivered through
    /// `handle` from a background task.
    pub fn spawn(
        config: &DaemonConfig,
        channel: ChannelId,
        handle: Handle,
    ) -> Result<Self, BridgeError> {
        let program = config.program();
        if program.is_empty() {
            return Err(BridgeError::EmptyCommand);
        }

        let mut child = Command::new(program)
            .args(config.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let pid = child.id();
        let stdin = child.stdin.take().ok_or(BridgeError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(BridgeError::MissingPipe("stdout"))?;

        tracing::info!(pid = ?pid, channel = ?channel, program, "Started bridged process");

        let input_budget = Arc::new(Semaphore::new(STDIN_BUFFER_LIMIT));
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let input_task = tokio::spawn(pump_stdin(stdin, stdin_rx, input_budget.clone(), pid));
        let output_task = tokio::spawn(pump_stdout(child, stdout, channel, handle));

        Ok(Self {
            pid,
            stdin_tx: Some(stdin_tx),
            input_budget,
            input_task,
            output_task,
        })
    }

    /// OS process id, if the process had not exited by the time it was read
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue client bytes for the process's stdin.
    ///
    /// Waits while `STDIN_BUFFER_LIMIT` bytes are still unwritten. The
    /// connection reads nothing else from the client meanwhile, so a client
    /// feeding a process that does not read runs out of channel window
    /// instead of growing the queue.
    pub async fn send_input(&self, data: Bytes) {
        let Some(tx) = &self.stdin_tx else {
            tracing::debug!(pid = ?self.pid, "Dropping input after EOF");
            return;
        };
        if data.is_empty() {
            return;
        }

        // A chunk larger than the whole budget takes all of it
        let permits = data.len().min(STDIN_BUFFER_LIMIT) as u32;
        let permit = match self.input_budget.clone().acquire_many_owned(permits).await {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!(pid = ?self.pid, "Process stdin already closed");
                return;
            }
        };

        if tx.send((data, permit)).is_err() {
            tracing::debug!(pid = ?self.pid, "Process stdin already closed");
        }
    }
}

impl ChannelProcess for BridgedProcess {
    fn close_stdin(&mut self) {
        // The input pump closes the pipe once the sender is gone
        self.stdin_tx.take();
    }

    /// The process is done once its output is drained and it was reaped
    fn is_running(&self) -> bool {
        !self.output_task.is_finished()
    }
}

impl Drop for BridgedProcess {
    fn drop(&mut self) {
        self.input_task.abort();
        self.output_task.abort();
        tracing::debug!(pid = ?self.pid, "Bridged process released");
    }
}

/// Copy queued client input into the child's stdin.
///
/// Each chunk's permits return to `budget` once it is written. Closing
/// `budget` on the way out wakes any sender still waiting for room.
async fn pump_stdin(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<InputChunk>,
    budget: Arc<Semaphore>,
    pid: Option<u32>,
) {
    while let Some((data, _permit)) = rx.recv().await {
        if let Err(e) = stdin.write_all(&data).await {
            tracing::debug!(pid = ?pid, error = %e, "Failed to write process stdin");
            budget.close();
            return;
        }
        if let Err(e) = stdin.flush().await {
            tracing::debug!(pid = ?pid, error = %e, "Failed to flush process stdin");
            budget.close();
            return;
        }
    }

    budget.close();
    tracing::debug!(pid = ?pid, "Closing process stdin");
}

/// Forward the child's stdout to the channel, then reap the child
async fn pump_stdout(mut child: Child, mut stdout: ChildStdout, channel: ChannelId, handle: Handle) {
    let pid = child.id();
    let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if handle
                    .data(channel, CryptoVec::from_slice(&buf[..n]))
                    .await
                    .is_err()
                {
                    tracing::debug!(pid = ?pid, channel = ?channel, "Channel gone, stopping output");
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(pid = ?pid, error = %e, "Failed to read process stdout");
                break;
            }
        }
    }

    match child.wait().await {
        Ok(status) => {
            tracing::info!(pid = ?pid, channel = ?channel, %status, "Bridged process exited");
        }
        Err(e) => {
            tracing::warn!(pid = ?pid, error = %e, "Failed to wait for bridged process");
        }
    }
}
