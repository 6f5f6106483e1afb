//! Console transport.
//!
//! Line protocol: the first line must be `auth <token>`; every later line
//! is one command, answered by its reply followed by a `.` line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arena_core::Secret;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

use super::command::{execute, Command};
use super::ConsoleError;
use crate::service::domain::names;
use crate::service::{ManagedService, ServiceContext};

const MAX_COMMAND_BYTES: usize = 4096;

/// Marks the end of one reply.
pub const END_OF_REPLY: &str = ".";

fn token_matches(offered: &str, expected: &Secret) -> bool {
    bool::from(offered.as_bytes().ct_eq(expected.expose().as_bytes()))
}

/// Serves one console connection until the client disconnects.
///
/// # Errors
///
/// `ConsoleError::Unauthorized` if the first line is not a valid `auth`
/// line, `ConsoleError::Io` on transport failure.
pub async fn serve_connection<R, W>(
    reader: R,
    writer: W,
    token: &Secret,
    ctx: &ServiceContext,
) -> Result<(), ConsoleError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_COMMAND_BYTES));
    let mut out = FramedWrite::new(writer, LinesCodec::new());

    let authorized = match lines.next().await {
        Some(Ok(line)) => line
            .strip_prefix("auth ")
            .is_some_and(|offered| token_matches(offered.trim(), token)),
        _ => false,
    };
    if !authorized {
        warn!("console authentication failed");
        let _ = out.send("unauthorized").await;
        return Err(ConsoleError::Unauthorized);
    }
    send(&mut out, "ok").await?;

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                send(&mut out, &format!("error: {err}")).await?;
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = match line.parse::<Command>() {
            Ok(command) => {
                info!(?command, "console command");
                execute(&command, ctx).await
            }
            Err(err) => err.to_string(),
        };
        send(&mut out, &reply).await?;
    }
    Ok(())
}

async fn send<W>(out: &mut FramedWrite<W, LinesCodec>, reply: &str) -> Result<(), ConsoleError>
where
    W: AsyncWrite + Unpin,
{
    for line in reply.lines() {
        out.send(line).await.map_err(lines_error)?;
    }
    out.send(END_OF_REPLY).await.map_err(lines_error)
}

fn lines_error(err: tokio_util::codec::LinesCodecError) -> ConsoleError {
    match err {
        tokio_util::codec::LinesCodecError::Io(io) => ConsoleError::Io(io),
        other => ConsoleError::Io(std::io::Error::other(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// ConsoleService
// ---------------------------------------------------------------------------

/// Starts the console listener if `consolesocket` is set. Without a
/// `consoletoken` the console stays off.
#[derive(Default)]
pub struct ConsoleService {
    task: Mutex<Option<JoinHandle<()>>>,
    socket: Mutex<Option<PathBuf>>,
}

impl ConsoleService {
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.task.lock().is_some()
    }
}

#[async_trait]
impl ManagedService for ConsoleService {
    fn name(&self) -> &'static str {
        names::CONSOLE
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let config = ctx.config.current();
        let Some(path) = config.console_socket.clone() else {
            debug!("console disabled");
            return Ok(());
        };
        let Some(token) = config.console_token.clone() else {
            warn!(path = %path.display(), "consolesocket is set but consoletoken is not; console not started");
            return Ok(());
        };
        let handle = start(&path, token, ctx.clone())?;
        *self.task.lock() = Some(handle);
        *self.socket.lock() = Some(path);
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        if let Some(path) = self.socket.lock().take() {
            if let Err(err) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), error = %err, "console socket already gone");
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn start(path: &Path, token: Secret, ctx: ServiceContext) -> anyhow::Result<JoinHandle<()>> {
    use std::os::unix::fs::FileTypeExt;

    use anyhow::Context;
    use tokio::net::UnixListener;

    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_socket() {
            std::fs::remove_file(path).context("removing stale console socket")?;
        } else {
            anyhow::bail!("{} exists and is not a socket", path.display());
        }
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("binding console socket {}", path.display()))?;
    info!(path = %path.display(), "console listening");

    let token = Arc::new(token);
    Ok(tokio::spawn(async move {
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(err) => {
                    warn!(error = %err, "console accept failed");
                    continue;
                }
            };
            let token = Arc::clone(&token);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                if let Err(err) = serve_connection(reader, writer, &token, &ctx).await {
                    debug!(error = %err, "console connection ended");
                }
            });
        }
    }))
}

#[cfg(not(unix))]
fn start(path: &Path, _token: Secret, _ctx: ServiceContext) -> anyhow::Result<JoinHandle<()>> {
    anyhow::bail!("console socket {} requires a Unix platform", path.display())
}
