//! Shared fixtures for unit tests: an in-memory worker transport, recording
//! crash effects, and a ready-made service context.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arena_core::{Config, CrashRecord, WorkerKind, WorkerOutcome, WorkerRequest, WorkerResponse};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::duplex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::config::{ConfigReloader, ConfigStore};
use crate::crash::{
    CrashLogger, CrashPolicy, CrashResponder, FaultPolicy, LockdownController, Terminator,
};
use crate::ipc::ParentChannel;
use crate::pool::handlers;
use crate::pool::{LineConnection, SpawnerFactory, WorkerConnection, WorkerSpawner};
use crate::service::ServiceContext;

// ---------------------------------------------------------------------------
// In-memory workers
// ---------------------------------------------------------------------------

/// Spawns workers as tasks connected through an in-memory duplex pipe,
/// using the same line transport as real worker processes.
///
/// Control tasks: `{"crash": true}` drops the connection, `{"hang": true}`
/// never answers, `{"fail": msg}` reports a task error, and `"sleep_ms"`
/// delays the answer. Anything else goes to the built-in handler for the
/// spawner's kind, or is echoed back when there is none.
pub struct ChannelSpawner {
    kind: Option<WorkerKind>,
    fail_first: AtomicUsize,
    spawned: AtomicUsize,
}

impl ChannelSpawner {
    pub fn new() -> Self {
        Self {
            kind: None,
            fail_first: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
        }
    }

    pub fn for_kind(kind: WorkerKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::new()
        }
    }

    /// A spawner whose first `n` spawn attempts fail.
    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_first: AtomicUsize::new(n),
            ..Self::new()
        }
    }

    /// Workers successfully started so far.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerSpawner for ChannelSpawner {
    async fn spawn(&self) -> anyhow::Result<Box<dyn WorkerConnection>> {
        let failing = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("simulated spawn failure");
        }
        self.spawned.fetch_add(1, Ordering::SeqCst);

        let (ours, theirs) = duplex(64 * 1024);
        let (read, write) = tokio::io::split(ours);
        tokio::spawn(run_channel_worker(theirs, self.kind));
        Ok(Box::new(LineConnection::new(read, write, None)))
    }
}

async fn run_channel_worker(stream: tokio::io::DuplexStream, kind: Option<WorkerKind>) {
    let (read, write) = tokio::io::split(stream);
    let mut lines = FramedRead::new(read, LinesCodec::new());
    let mut out = FramedWrite::new(write, LinesCodec::new());
    let handler = kind.map(handlers::for_kind);

    while let Some(Ok(line)) = lines.next().await {
        let Ok(request) = serde_json::from_str::<WorkerRequest>(&line) else {
            return;
        };
        let task = request.task;
        if task.get("crash").is_some() {
            return;
        }
        if task.get("hang").is_some() {
            std::future::pending::<()>().await;
        }
        if let Some(ms) = task.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        let outcome = if let Some(message) = task.get("fail").and_then(Value::as_str) {
            WorkerOutcome::Error {
                message: message.to_string(),
            }
        } else {
            match &handler {
                Some(handler) => match handler.handle(task) {
                    Ok(result) => WorkerOutcome::Ok { result },
                    Err(err) => WorkerOutcome::Error {
                        message: format!("{err:#}"),
                    },
                },
                None => WorkerOutcome::Ok { result: task },
            }
        };
        let response = WorkerResponse {
            id: request.id,
            outcome,
        };
        let Ok(encoded) = serde_json::to_string(&response) else {
            return;
        };
        if out.send(encoded).await.is_err() {
            return;
        }
    }
}

/// Hands out [`ChannelSpawner`]s running the built-in handlers.
#[derive(Default)]
pub struct ChannelSpawnerFactory;

impl SpawnerFactory for ChannelSpawnerFactory {
    fn spawner(&self, kind: WorkerKind) -> Arc<dyn WorkerSpawner> {
        Arc::new(ChannelSpawner::for_kind(kind))
    }
}

// ---------------------------------------------------------------------------
// Crash effects
// ---------------------------------------------------------------------------

/// Records terminations instead of exiting the test process.
#[derive(Default)]
pub struct RecordingTerminator {
    pub records: Mutex<Vec<CrashRecord>>,
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, record: &CrashRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Applies lockdowns to a real controller and records crash reports.
pub struct RecordingResponder {
    pub lockdown: Arc<LockdownController>,
    pub reports: Mutex<Vec<CrashRecord>>,
}

impl RecordingResponder {
    pub fn new(lockdown: Arc<LockdownController>) -> Self {
        Self {
            lockdown,
            reports: Mutex::new(Vec::new()),
        }
    }
}

impl CrashResponder for RecordingResponder {
    fn start_lockdown(&self, record: &CrashRecord) {
        self.lockdown.start_lockdown(&record.message);
    }

    fn report_crash(&self, record: &CrashRecord) {
        self.reports.lock().push(record.clone());
    }
}

// ---------------------------------------------------------------------------
// Service context
// ---------------------------------------------------------------------------

/// A context with in-memory workers and a recording terminator. The
/// terminator is returned through `test_context_with_terminator`.
pub fn test_context(config: Config) -> ServiceContext {
    test_context_with_terminator(config).0
}

pub fn test_context_with_terminator(config: Config) -> (ServiceContext, Arc<RecordingTerminator>) {
    let terminator = Arc::new(RecordingTerminator::default());
    let classifier = CrashLogger::new(
        config.crash_lockdown_threshold,
        Duration::from_secs(config.crash_lockdown_window_secs),
        None,
    );
    let faults = Arc::new(CrashPolicy::new(
        FaultPolicy::from_config(&config),
        Arc::new(classifier),
        terminator.clone(),
    ));
    let store = Arc::new(ConfigStore::from_config(config));
    let ctx = ServiceContext {
        reloader: Arc::new(ConfigReloader::new(Arc::clone(&store))),
        config: store,
        services: Arc::default(),
        lockdown: Arc::new(LockdownController::new()),
        faults,
        parent_channel: Arc::new(ParentChannel::detached()),
        spawners: Arc::new(ChannelSpawnerFactory),
    };
    (ctx, terminator)
}
