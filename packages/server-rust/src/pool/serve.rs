//! Worker side of the pool protocol.
//!
//! A worker process reads one [`WorkerRequest`] per line from stdin, runs
//! it through a [`TaskHandler`], and writes one [`WorkerResponse`] per line
//! to stdout. It exits when stdin closes.

use anyhow::Context;
use arena_core::{WorkerKind, WorkerOutcome, WorkerRequest, WorkerResponse};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info};

use super::handlers;
use super::process::MAX_LINE_BYTES;

/// Runs one task inside a worker process.
pub trait TaskHandler: Send + Sync {
    /// # Errors
    ///
    /// A task-level failure, reported back to the dispatcher as
    /// `PoolError::Task`. The worker keeps serving.
    fn handle(&self, task: Value) -> anyhow::Result<Value>;
}

/// Serves requests until the reader reaches end of input. Returns the
/// number of requests answered.
///
/// # Errors
///
/// Fails on I/O errors and on lines that are not valid requests; the
/// worker should exit and let the pool respawn it.
pub async fn serve<R, W>(reader: R, writer: W, handler: &dyn TaskHandler) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut out = FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut answered = 0;

    while let Some(line) = lines.next().await {
        let line = line.context("reading request")?;
        if line.trim().is_empty() {
            continue;
        }
        let request: WorkerRequest = serde_json::from_str(&line).context("malformed request")?;
        let outcome = match handler.handle(request.task) {
            Ok(result) => WorkerOutcome::Ok { result },
            Err(err) => WorkerOutcome::Error {
                message: format!("{err:#}"),
            },
        };
        let response = WorkerResponse {
            id: request.id,
            outcome,
        };
        out.send(serde_json::to_string(&response)?)
            .await
            .context("writing response")?;
        answered += 1;
    }
    debug!(answered, "request stream closed");
    Ok(answered)
}

/// Worker-mode entry point: serves stdio with the built-in handler for
/// `kind`.
///
/// # Errors
///
/// See [`serve`].
pub async fn serve_stdio(kind: WorkerKind) -> anyhow::Result<()> {
    info!(%kind, pid = std::process::id(), "worker started");
    let handler = handlers::for_kind(kind);
    let answered = serve(tokio::io::stdin(), tokio::io::stdout(), handler.as_ref()).await?;
    info!(%kind, answered, "worker exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;

    struct Doubler;

    impl TaskHandler for Doubler {
        fn handle(&self, task: Value) -> anyhow::Result<Value> {
            let n = task.as_i64().context("expected a number")?;
            Ok(json!(n * 2))
        }
    }

    #[tokio::test]
    async fn answers_each_request_in_order() {
        let (client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, mut client_write) = tokio::io::split(client);

        let worker = tokio::spawn(async move { serve(server_read, server_write, &Doubler).await });

        client_write
            .write_all(b"{\"id\":1,\"task\":21}\n\n{\"id\":2,\"task\":\"x\"}\n")
            .await
            .unwrap();
        client_write.shutdown().await.unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let first: WorkerResponse =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let second: WorkerResponse =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(first.outcome, WorkerOutcome::Ok { result: json!(42) });
        assert_eq!(second.id, 2);
        assert!(matches!(second.outcome, WorkerOutcome::Error { .. }));
        assert_eq!(worker.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn malformed_request_stops_the_worker() {
        let (client, server) = duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);

        client_write.write_all(b"not json\n").await.unwrap();

        assert!(serve(server_read, server_write, &Doubler).await.is_err());
    }
}
