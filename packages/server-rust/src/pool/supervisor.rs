//! Worker pool supervisor.
//!
//! A pool is a fixed number of slots. Each slot is a task that keeps one
//! worker alive: it spawns the worker, feeds it queued tasks one at a time,
//! and respawns it after a jittered backoff when it dies. Worker deaths are
//! contained here and surface only as [`PoolEvent`]s and as
//! [`PoolError::WorkerCrashed`] for the task that was in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arena_core::{WorkerOutcome, WorkerRequest};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::process::{WorkerConnection, WorkerSpawner};

/// How long `shutdown` waits for slots before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Configuration, state, events, errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool name used in logs and metric labels.
    pub name: &'static str,
    /// Number of workers `spawn(None)` brings the pool to.
    pub size: usize,
    /// Per-task limit. A worker that exceeds it is killed and respawned.
    pub dispatch_timeout: Option<Duration>,
    /// Base delay before a slot respawns its worker.
    pub respawn_backoff: Duration,
    /// Tasks that may wait for a free worker before `dispatch` blocks.
    pub queue_capacity: usize,
}

impl PoolConfig {
    #[must_use]
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            size,
            dispatch_timeout: None,
            respawn_backoff: Duration::from_millis(250),
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Ready,
    Busy,
    Dead,
}

impl WorkerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Dead => "dead",
        }
    }
}

/// Lifecycle notifications, one per worker transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Spawned { slot: usize },
    Exited { slot: usize, reason: String },
    SpawnFailed { slot: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("worker crashed while handling the task: {reason}")]
    WorkerCrashed { reason: String },
    #[error("worker pool is closed")]
    PoolClosed,
    #[error("worker pool has no workers: {0}")]
    Spawn(String),
    #[error("worker did not answer within {0:?}")]
    Timeout(Duration),
    #[error("task failed: {0}")]
    Task(String),
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

struct Job {
    task: Value,
    reply: oneshot::Sender<Result<Value, PoolError>>,
}

struct Slot {
    state: Arc<Mutex<WorkerState>>,
    handle: JoinHandle<()>,
}

/// Everything a slot task shares with the pool.
struct Shared {
    config: PoolConfig,
    spawner: Arc<dyn WorkerSpawner>,
    queue: tokio::sync::Mutex<mpsc::Receiver<Job>>,
    events: broadcast::Sender<PoolEvent>,
    next_request: AtomicU64,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    slots: Mutex<Vec<Slot>>,
    stop: watch::Sender<bool>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(config: PoolConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (events, _) = broadcast::channel(64);
        let (stop, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                spawner,
                queue: tokio::sync::Mutex::new(rx),
                events,
                next_request: AtomicU64::new(1),
            }),
            sender: Mutex::new(Some(tx)),
            slots: Mutex::new(Vec::new()),
            stop,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.shared.config.name
    }

    /// Brings the pool to `count` workers, or to its configured size.
    /// Never shrinks the pool and never starts a slot twice, so repeated
    /// calls are harmless. Returns how many slots were started.
    ///
    /// # Errors
    ///
    /// `PoolError::PoolClosed` after `shutdown`.
    pub fn spawn(&self, count: Option<usize>) -> Result<usize, PoolError> {
        if self.sender.lock().is_none() {
            return Err(PoolError::PoolClosed);
        }
        let target = count.unwrap_or(self.shared.config.size);
        let mut slots = self.slots.lock();
        let mut started = 0;
        while slots.len() < target {
            let index = slots.len();
            let state = Arc::new(Mutex::new(WorkerState::Spawning));
            let handle = tokio::spawn(run_slot(
                Arc::clone(&self.shared),
                index,
                Arc::clone(&state),
                self.stop.subscribe(),
            ));
            slots.push(Slot { state, handle });
            started += 1;
        }
        if started > 0 {
            info!(pool = self.name(), started, size = slots.len(), "worker slots started");
        }
        Ok(started)
    }

    /// Runs one task on the next free worker. Waits in the queue while
    /// every worker is busy.
    ///
    /// # Errors
    ///
    /// - `PoolError::Spawn` if the pool was never spawned.
    /// - `PoolError::PoolClosed` if the pool shuts down first.
    /// - `PoolError::WorkerCrashed` / `PoolError::Timeout` if the worker
    ///   died or stalled on this task.
    /// - `PoolError::Task` if the worker reported a task failure.
    pub async fn dispatch(&self, task: Value) -> Result<Value, PoolError> {
        let sender = self.sender.lock().clone().ok_or(PoolError::PoolClosed)?;
        if self.slots.lock().is_empty() {
            return Err(PoolError::Spawn("pool has not been spawned".to_string()));
        }
        let (reply, response) = oneshot::channel();
        sender
            .send(Job { task, reply })
            .await
            .map_err(|_| PoolError::PoolClosed)?;
        response.await.map_err(|_| PoolError::PoolClosed)?
    }

    /// Current state of every slot, by slot index.
    #[must_use]
    pub fn states(&self) -> Vec<WorkerState> {
        self.slots.lock().iter().map(|slot| *slot.state.lock()).collect()
    }

    /// Workers that are up (ready or busy).
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.states()
            .into_iter()
            .filter(|s| matches!(s, WorkerState::Ready | WorkerState::Busy))
            .count()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stops accepting tasks, fails every queued task with `PoolClosed`,
    /// lets in-flight tasks finish, and closes the workers.
    pub async fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        self.stop.send_replace(true);

        {
            let mut queue = self.shared.queue.lock().await;
            queue.close();
            while let Ok(job) = queue.try_recv() {
                let _ = job.reply.send(Err(PoolError::PoolClosed));
            }
        }

        let slots = std::mem::take(&mut *self.slots.lock());
        for slot in slots {
            let abort = slot.handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, slot.handle).await.is_err() {
                warn!(pool = self.name(), "worker slot did not stop in time; aborting");
                abort.abort();
            }
        }
        info!(pool = self.name(), "worker pool stopped");
    }
}

// ---------------------------------------------------------------------------
// Slot task
// ---------------------------------------------------------------------------

enum SlotExit {
    Stopped,
    Died(String),
}

async fn run_slot(
    shared: Arc<Shared>,
    slot: usize,
    state: Arc<Mutex<WorkerState>>,
    mut stop: watch::Receiver<bool>,
) {
    let pool = shared.config.name;
    loop {
        if *stop.borrow() {
            break;
        }
        *state.lock() = WorkerState::Spawning;

        let mut conn = match shared.spawner.spawn().await {
            Ok(conn) => conn,
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(pool, slot, error = %reason, "worker failed to spawn");
                *state.lock() = WorkerState::Dead;
                let _ = shared.events.send(PoolEvent::SpawnFailed { slot, reason });
                if !backoff(&shared.config, &mut stop).await {
                    break;
                }
                continue;
            }
        };

        metrics::counter!("arena_worker_spawns_total", "pool" => pool).increment(1);
        debug!(pool, slot, "worker ready");
        *state.lock() = WorkerState::Ready;
        let _ = shared.events.send(PoolEvent::Spawned { slot });

        match serve_worker(&shared, conn.as_mut(), &state, &mut stop).await {
            SlotExit::Stopped => {
                conn.close().await;
                break;
            }
            SlotExit::Died(reason) => {
                conn.close().await;
                warn!(pool, slot, reason = %reason, "worker exited; respawning");
                metrics::counter!("arena_worker_exits_total", "pool" => pool).increment(1);
                *state.lock() = WorkerState::Dead;
                let _ = shared.events.send(PoolEvent::Exited { slot, reason });
                if !backoff(&shared.config, &mut stop).await {
                    break;
                }
            }
        }
    }
    *state.lock() = WorkerState::Dead;
}

/// Feeds queued tasks to one live worker until it dies or the pool stops.
async fn serve_worker(
    shared: &Shared,
    conn: &mut dyn WorkerConnection,
    state: &Mutex<WorkerState>,
    stop: &mut watch::Receiver<bool>,
) -> SlotExit {
    loop {
        let job = tokio::select! {
            () = stopped(stop) => return SlotExit::Stopped,
            reason = conn.closed() => return SlotExit::Died(reason),
            job = async { shared.queue.lock().await.recv().await } => match job {
                Some(job) => job,
                None => return SlotExit::Stopped,
            },
        };

        *state.lock() = WorkerState::Busy;
        let request = WorkerRequest {
            id: shared.next_request.fetch_add(1, Ordering::Relaxed),
            task: job.task,
        };

        let outcome = match shared.config.dispatch_timeout {
            Some(limit) => tokio::time::timeout(limit, conn.call(request))
                .await
                .map_err(|_| limit),
            None => Ok(conn.call(request).await),
        };

        match outcome {
            Ok(Ok(response)) => {
                let result = match response.outcome {
                    WorkerOutcome::Ok { result } => Ok(result),
                    WorkerOutcome::Error { message } => Err(PoolError::Task(message)),
                };
                let _ = job.reply.send(result);
                *state.lock() = WorkerState::Ready;
            }
            Ok(Err(err)) => {
                let reason = err.to_string();
                let _ = job.reply.send(Err(PoolError::WorkerCrashed {
                    reason: reason.clone(),
                }));
                return SlotExit::Died(reason);
            }
            Err(limit) => {
                let _ = job.reply.send(Err(PoolError::Timeout(limit)));
                return SlotExit::Died(format!("task exceeded {limit:?}"));
            }
        }
    }
}

/// Sleeps before a respawn. Returns `false` if the pool stopped meanwhile.
async fn backoff(config: &PoolConfig, stop: &mut watch::Receiver<bool>) -> bool {
    let delay = jittered(config.respawn_backoff);
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = stopped(stop) => false,
    }
}

fn jittered(base: Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let jitter = rand::rng().random_range(0..=base_ms / 2);
    Duration::from_millis(base_ms.saturating_add(jitter))
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::ChannelSpawner;

    fn config(size: usize) -> PoolConfig {
        PoolConfig {
            respawn_backoff: Duration::from_millis(5),
            ..PoolConfig::new("test", size)
        }
    }

    async fn wait_live(pool: &WorkerPool, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.live_count() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("workers did not come up");
    }

    #[tokio::test]
    async fn spawn_is_idempotent() {
        let spawner = Arc::new(ChannelSpawner::new());
        let pool = WorkerPool::new(config(2), spawner.clone());

        assert_eq!(pool.spawn(None).unwrap(), 2);
        assert_eq!(pool.spawn(None).unwrap(), 0);
        assert_eq!(pool.spawn(Some(1)).unwrap(), 0);
        wait_live(&pool, 2).await;

        assert_eq!(pool.states().len(), 2);
        assert_eq!(spawner.spawned(), 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn dispatch_returns_worker_result() {
        let pool = WorkerPool::new(config(1), Arc::new(ChannelSpawner::new()));
        pool.spawn(None).unwrap();

        let result = pool.dispatch(json!({"echo": 5})).await.unwrap();
        assert_eq!(result, json!({"echo": 5}));

        let err = pool.dispatch(json!({"fail": "bad team"})).await.unwrap_err();
        assert_eq!(err, PoolError::Task("bad team".to_string()));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn dispatch_before_spawn_is_rejected() {
        let pool = WorkerPool::new(config(1), Arc::new(ChannelSpawner::new()));
        assert!(matches!(
            pool.dispatch(json!(1)).await,
            Err(PoolError::Spawn(_))
        ));
    }

    #[tokio::test]
    async fn exhausted_pool_queues_instead_of_failing() {
        let pool = Arc::new(WorkerPool::new(config(1), Arc::new(ChannelSpawner::new())));
        pool.spawn(None).unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.dispatch(json!({"echo": i, "sleep_ms": 5})).await })
            })
            .collect();

        for (i, task) in tasks.into_iter().enumerate() {
            let value = task.await.unwrap().unwrap();
            assert_eq!(value["echo"], json!(i));
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn crashed_worker_fails_its_task_and_respawns() {
        let spawner = Arc::new(ChannelSpawner::new());
        let pool = WorkerPool::new(config(1), spawner.clone());
        let mut events = pool.subscribe();
        pool.spawn(None).unwrap();

        let err = pool.dispatch(json!({"crash": true})).await.unwrap_err();
        assert!(matches!(err, PoolError::WorkerCrashed { .. }));

        // The pool recovers on its own and serves the next task.
        assert_eq!(pool.dispatch(json!({"echo": 1})).await.unwrap(), json!({"echo": 1}));
        assert!(spawner.spawned() >= 2);

        let mut saw_exit = false;
        while let Ok(event) = events.try_recv() {
            saw_exit |= matches!(event, PoolEvent::Exited { slot: 0, .. });
        }
        assert!(saw_exit);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn stalled_worker_times_out_and_is_replaced() {
        let spawner = Arc::new(ChannelSpawner::new());
        let pool = WorkerPool::new(
            PoolConfig {
                dispatch_timeout: Some(Duration::from_millis(50)),
                ..config(1)
            },
            spawner.clone(),
        );
        pool.spawn(None).unwrap();

        let err = pool.dispatch(json!({"hang": true})).await.unwrap_err();
        assert_eq!(err, PoolError::Timeout(Duration::from_millis(50)));
        assert_eq!(pool.dispatch(json!({"echo": 2})).await.unwrap(), json!({"echo": 2}));
        assert!(spawner.spawned() >= 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_failures_are_events_and_retried() {
        let spawner = Arc::new(ChannelSpawner::failing_first(2));
        let pool = WorkerPool::new(config(1), spawner.clone());
        let mut events = pool.subscribe();
        pool.spawn(None).unwrap();

        assert_eq!(pool.dispatch(json!({"echo": 3})).await.unwrap(), json!({"echo": 3}));

        let mut failures = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PoolEvent::SpawnFailed { .. }) {
                failures += 1;
            }
        }
        assert_eq!(failures, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_pool() {
        let pool = WorkerPool::new(config(1), Arc::new(ChannelSpawner::new()));
        pool.spawn(None).unwrap();
        wait_live(&pool, 1).await;

        pool.shutdown().await;

        assert!(pool.is_closed());
        assert_eq!(pool.spawn(None), Err(PoolError::PoolClosed));
        assert_eq!(pool.dispatch(json!(1)).await, Err(PoolError::PoolClosed));
        pool.shutdown().await;
    }

    #[test]
    fn jitter_stays_within_half_the_base() {
        for _ in 0..100 {
            let d = jittered(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }
}
