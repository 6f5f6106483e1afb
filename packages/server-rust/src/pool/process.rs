//! Worker transport.
//!
//! A worker is anything that answers [`WorkerRequest`]s with
//! [`WorkerResponse`]s over a [`WorkerConnection`]. The production transport
//! is a child process of the current executable speaking newline-delimited
//! JSON over its stdin and stdout.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arena_core::{WorkerKind, WorkerRequest, WorkerResponse};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::ipc::PARENT_CHANNEL_ENV;

/// Longest accepted protocol line.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// How long a closing worker gets to exit before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("worker closed its channel")]
    Closed,
    #[error("worker channel I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker protocol violation: {0}")]
    Protocol(String),
}

impl From<LinesCodecError> for TransportError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::Io(io) => Self::Io(io),
            LinesCodecError::MaxLineLengthExceeded => {
                Self::Protocol(format!("line longer than {MAX_LINE_BYTES} bytes"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// One live worker, owned by exactly one pool slot.
#[async_trait]
pub trait WorkerConnection: Send {
    /// Sends one request and waits for its response.
    async fn call(&mut self, request: WorkerRequest) -> Result<WorkerResponse, TransportError>;

    /// Resolves when the worker goes away while idle, with the reason.
    async fn closed(&mut self) -> String {
        std::future::pending().await
    }

    /// Asks the worker to exit and reaps it.
    async fn close(&mut self);
}

/// Starts workers of one kind.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self) -> anyhow::Result<Box<dyn WorkerConnection>>;
}

/// Hands out spawners per worker kind. Injected through the service
/// context so tests can swap processes for in-memory workers.
pub trait SpawnerFactory: Send + Sync {
    fn spawner(&self, kind: WorkerKind) -> Arc<dyn WorkerSpawner>;
}

// ---------------------------------------------------------------------------
// Line transport
// ---------------------------------------------------------------------------

/// NDJSON connection over any byte stream pair.
pub struct LineConnection<R, W> {
    reader: FramedRead<R, LinesCodec>,
    /// `None` once the connection has been closed.
    writer: Option<FramedWrite<W, LinesCodec>>,
    child: Option<Child>,
}

impl<R, W> LineConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, child: Option<Child>) -> Self {
        Self {
            reader: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            writer: Some(FramedWrite::new(
                writer,
                LinesCodec::new_with_max_length(MAX_LINE_BYTES),
            )),
            child,
        }
    }

    async fn next_line(&mut self) -> Result<String, TransportError> {
        loop {
            match self.reader.next().await {
                None => return Err(TransportError::Closed),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(line)) if line.trim().is_empty() => {}
                Some(Ok(line)) => return Ok(line),
            }
        }
    }
}

#[async_trait]
impl<R, W> WorkerConnection for LineConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn call(&mut self, request: WorkerRequest) -> Result<WorkerResponse, TransportError> {
        let id = request.id;
        let line =
            serde_json::to_string(&request).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let writer = self.writer.as_mut().ok_or(TransportError::Closed)?;
        writer.send(line).await?;

        let line = self.next_line().await?;
        let response: WorkerResponse = serde_json::from_str(&line)
            .map_err(|e| TransportError::Protocol(format!("malformed response: {e}")))?;
        if response.id != id {
            return Err(TransportError::Protocol(format!(
                "response id {} does not match request {id}",
                response.id
            )));
        }
        Ok(response)
    }

    async fn closed(&mut self) -> String {
        match self.next_line().await {
            Ok(line) => format!("unsolicited output while idle: {line}"),
            Err(err) => err.to_string(),
        }
    }

    async fn close(&mut self) {
        // End of input is the exit request. A child's stdin pipe only
        // closes when the handle is dropped.
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = SinkExt::<String>::flush(&mut writer).await {
                debug!(error = %err, "worker channel already closed");
            }
            let mut stream = writer.into_inner();
            if let Err(err) = stream.shutdown().await {
                debug!(error = %err, "worker channel already closed");
            }
            drop(stream);
        }
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "worker exited"),
            Ok(Err(err)) => warn!(error = %err, "failed to reap worker"),
            Err(_) => {
                warn!("worker ignored exit request; killing");
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill worker");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Process spawner
// ---------------------------------------------------------------------------

/// Spawns `<program> --worker <kind>` children.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    kind: WorkerKind,
}

impl ProcessSpawner {
    #[must_use]
    pub fn new(program: PathBuf, kind: WorkerKind) -> Self {
        Self { program, kind }
    }

    /// The command used for every worker. The parent channel variable is
    /// always removed from the child environment.
    #[must_use]
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--worker")
            .arg(self.kind.as_str())
            .env_remove(PARENT_CHANNEL_ENV)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self) -> anyhow::Result<Box<dyn WorkerConnection>> {
        let mut child = self
            .command()
            .spawn()
            .with_context(|| format!("spawning {} worker from {}", self.kind, self.program.display()))?;
        let stdin = child.stdin.take().context("worker stdin is not piped")?;
        let stdout = child.stdout.take().context("worker stdout is not piped")?;
        debug!(kind = %self.kind, pid = child.id(), "worker process started");
        Ok(Box::new(LineConnection::new(stdout, stdin, Some(child))))
    }
}

/// Spawns workers by re-executing a program, normally the current binary.
#[derive(Debug, Clone)]
pub struct ProcessSpawnerFactory {
    program: PathBuf,
}

impl ProcessSpawnerFactory {
    #[must_use]
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    /// # Errors
    ///
    /// Fails if the path of the running executable cannot be determined.
    pub fn current_exe() -> std::io::Result<Self> {
        std::env::current_exe().map(Self::new)
    }
}

impl SpawnerFactory for ProcessSpawnerFactory {
    fn spawner(&self, kind: WorkerKind) -> Arc<dyn WorkerSpawner> {
        Arc::new(ProcessSpawner::new(self.program.clone(), kind))
    }
}
