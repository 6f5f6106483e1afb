//! Fault routing.
//!
//! Two fault channels feed one policy:
//!
//! - **Panics** (synchronous faults), via a process-wide panic hook.
//! - **Background task errors** (asynchronous faults), via
//!   [`CrashPolicy::spawn_supervised`].
//!
//! [`FaultPolicy::route`] decides what happens; [`CrashPolicy::handle`]
//! carries it out. With crash-guard off every fault terminates the process.
//! With crash-guard on, panics are classified into lockdown or a crash
//! report, and background faults still terminate unless unified routing is
//! enabled.

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use arena_core::{Classification, Config, CrashClassifier, CrashRecord, FaultOrigin};
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Routing decision
// ---------------------------------------------------------------------------

/// What the process does about one fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    Lockdown,
    Report,
    Terminate,
}

impl FaultAction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Lockdown => "lockdown",
            Self::Report => "report",
            Self::Terminate => "terminate",
        }
    }
}

/// Routing switches, read once at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultPolicy {
    pub crash_guard: bool,
    pub unified_routing: bool,
}

impl FaultPolicy {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            crash_guard: config.crash_guard,
            unified_routing: config.unified_fault_routing,
        }
    }

    /// Decides the action for a fault from `origin`. `classify` is only
    /// called when the fault is actually routed through the classifier.
    pub fn route(&self, origin: &FaultOrigin, classify: impl FnOnce() -> Classification) -> FaultAction {
        if !self.crash_guard {
            return FaultAction::Terminate;
        }
        let classified = match origin {
            FaultOrigin::MainProcess => true,
            FaultOrigin::BackgroundTask { .. } => self.unified_routing,
        };
        if !classified {
            return FaultAction::Terminate;
        }
        match classify() {
            Classification::Lockdown => FaultAction::Lockdown,
            Classification::Crash => FaultAction::Report,
        }
    }
}

// ---------------------------------------------------------------------------
// Effect seams
// ---------------------------------------------------------------------------

/// Receives classified faults. Implemented by the room registry.
pub trait CrashResponder: Send + Sync {
    /// Begin a graceful lockdown.
    fn start_lockdown(&self, record: &CrashRecord);

    /// Record a crash that does not affect global state.
    fn report_crash(&self, record: &CrashRecord);
}

/// Ends the process for faults that are not survivable.
pub trait Terminator: Send + Sync {
    fn terminate(&self, record: &CrashRecord);
}

/// Exits the process with status 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitTerminator;

impl Terminator for ExitTerminator {
    fn terminate(&self, record: &CrashRecord) {
        error!(
            crash_id = %record.id,
            origin = %record.origin.label(),
            message = %record.message,
            "unrecoverable fault; terminating"
        );
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// CrashPolicy
// ---------------------------------------------------------------------------

/// The crash policy controller.
pub struct CrashPolicy {
    policy: FaultPolicy,
    classifier: Arc<dyn CrashClassifier>,
    terminator: Arc<dyn Terminator>,
    responder: OnceLock<Arc<dyn CrashResponder>>,
}

impl CrashPolicy {
    #[must_use]
    pub fn new(
        policy: FaultPolicy,
        classifier: Arc<dyn CrashClassifier>,
        terminator: Arc<dyn Terminator>,
    ) -> Self {
        Self {
            policy,
            classifier,
            terminator,
            responder: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> FaultPolicy {
        self.policy
    }

    /// Binds the component that carries out lockdowns and crash reports.
    /// Only the first binding takes effect.
    pub fn bind_responder(&self, responder: Arc<dyn CrashResponder>) {
        if self.responder.set(responder).is_err() {
            warn!("crash responder already bound; ignoring");
        }
    }

    /// Routes one fault and applies the resulting action.
    pub fn handle(&self, origin: FaultOrigin, message: String, location: Option<String>) -> FaultAction {
        let record = CrashRecord {
            id: Uuid::new_v4().to_string(),
            message,
            location,
            origin,
            timestamp_ms: now_ms(),
        };
        let action = self
            .policy
            .route(&record.origin, || self.classifier.classify(&record));

        metrics::counter!(
            "arena_faults_total",
            "origin" => record.origin.as_str(),
            "action" => action.as_str()
        )
        .increment(1);

        match action {
            FaultAction::Lockdown | FaultAction::Report => {
                error!(
                    crash_id = %record.id,
                    origin = %record.origin.label(),
                    location = record.location.as_deref().unwrap_or("unknown"),
                    message = %record.message,
                    action = action.as_str(),
                    "fault captured by crash guard"
                );
                match self.responder.get() {
                    Some(responder) if action == FaultAction::Lockdown => {
                        responder.start_lockdown(&record);
                    }
                    Some(responder) => responder.report_crash(&record),
                    None => warn!(crash_id = %record.id, "no crash responder bound yet"),
                }
            }
            FaultAction::Terminate => self.terminator.terminate(&record),
        }
        action
    }

    /// Installs the panic hook that feeds panics into [`handle`](Self::handle)
    /// as main-process faults. Replaces any previously installed hook.
    pub fn install_panic_hook(self: &Arc<Self>) {
        let policy = Arc::clone(self);
        std::panic::set_hook(Box::new(move |info| {
            let message = panic_message(info.payload());
            let location = info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
            policy.handle(FaultOrigin::MainProcess, message, location);
        }));
    }

    /// Spawns a background task whose error, if nobody else handles it, is
    /// routed as an asynchronous fault.
    pub fn spawn_supervised<F>(self: &Arc<Self>, task: &'static str, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let policy = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = fut.await {
                policy.handle(
                    FaultOrigin::BackgroundTask {
                        task: task.to_string(),
                    },
                    format!("{err:#}"),
                    None,
                );
            }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
