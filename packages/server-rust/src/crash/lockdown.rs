//! Lockdown flag, health state, and session admission.
//!
//! `ArcSwap` holds the health state for lock-free reads; an atomic counter
//! with RAII guards tracks in-flight sessions so a lockdown can wait for
//! them to finish.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

/// Process health, as reported to probes and the console.
///
/// State machine: Starting -> Ready -> Lockdown -> Stopped. Lockdown can be
/// entered from Starting as well; nothing leaves Lockdown except Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Subsystems are still initializing.
    Starting,
    /// Accepting new sessions.
    Ready,
    /// No new sessions; in-flight sessions run to completion.
    Lockdown,
    /// All sessions finished after a lockdown, or shutdown was requested.
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Lockdown => "lockdown",
            Self::Stopped => "stopped",
        }
    }
}

/// Why a new session was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("server is in lockdown and not accepting new sessions")]
    LockedDown,
    #[error("server is not ready")]
    NotReady,
}

/// Owns the monotonic lockdown flag and the session counter.
#[derive(Debug)]
pub struct LockdownController {
    locked_down: AtomicBool,
    reason: Mutex<Option<String>>,
    health_state: Arc<ArcSwap<HealthState>>,
    sessions: Arc<AtomicU64>,
    shutdown_signal: watch::Sender<bool>,
}

impl LockdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            locked_down: AtomicBool::new(false),
            reason: Mutex::new(None),
            health_state: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
            sessions: Arc::new(AtomicU64::new(0)),
            shutdown_signal: tx,
        }
    }

    /// Moves `Starting` to `Ready`. Has no effect in any other state.
    pub fn set_ready(&self) {
        self.health_state.rcu(|state| match **state {
            HealthState::Starting => Arc::new(HealthState::Ready),
            _ => Arc::clone(state),
        });
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    #[must_use]
    pub fn is_locked_down(&self) -> bool {
        self.locked_down.load(Ordering::SeqCst)
    }

    /// Reason given when the lockdown started.
    #[must_use]
    pub fn lockdown_reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Sets the lockdown flag. Returns `false` if the process was already in
    /// lockdown. The flag is never cleared for the life of the process.
    pub fn start_lockdown(&self, reason: &str) -> bool {
        if self.locked_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.reason.lock() = Some(reason.to_string());
        self.health_state.store(Arc::new(HealthState::Lockdown));
        warn!(
            reason,
            active_sessions = self.active_sessions(),
            "lockdown started; refusing new sessions"
        );
        true
    }

    /// Admits a new session, returning a guard that holds its slot.
    ///
    /// # Errors
    ///
    /// `AdmissionError::LockedDown` once lockdown has started,
    /// `AdmissionError::NotReady` before `set_ready` or after stop.
    pub fn admit_session(&self) -> Result<SessionGuard, AdmissionError> {
        if self.is_locked_down() {
            return Err(AdmissionError::LockedDown);
        }
        if self.health_state() != HealthState::Ready {
            return Err(AdmissionError::NotReady);
        }
        let guard = SessionGuard::new(Arc::clone(&self.sessions));
        // Lockdown may have started between the check and the increment.
        if self.is_locked_down() {
            return Err(AdmissionError::LockedDown);
        }
        Ok(guard)
    }

    #[must_use]
    pub fn active_sessions(&self) -> u64 {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Receiver that flips to `true` when the process should stop serving.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Signals every shutdown receiver.
    pub fn request_shutdown(&self) {
        self.health_state.store(Arc::new(HealthState::Stopped));
        // Ignore send errors; receivers may have been dropped.
        let _ = self.shutdown_signal.send(true);
    }

    /// Waits until no sessions are in flight, then stops.
    ///
    /// With `timeout = None` waits indefinitely. Returns `false` if the
    /// timeout expired first; the state is left unchanged in that case.
    pub async fn wait_for_drain(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            if self.sessions.load(Ordering::SeqCst) == 0 {
                info!("all sessions finished");
                self.request_shutdown();
                return true;
            }
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for LockdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one admitted session. Dropping it, including during
/// unwinding, releases the slot.
#[derive(Debug)]
pub struct SessionGuard {
    sessions: Arc<AtomicU64>,
}

impl SessionGuard {
    fn new(sessions: Arc<AtomicU64>) -> Self {
        sessions.fetch_add(1, Ordering::SeqCst);
        Self { sessions }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.fetch_sub(1, Ordering::SeqCst);
    }
}
