//! Fault records and the classifier seam.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a fault was raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultOrigin {
    /// An uncaught panic on any thread of the supervising process.
    MainProcess,
    /// A supervised background task that finished with an error nobody handled.
    BackgroundTask { task: String },
}

impl FaultOrigin {
    /// Label handed to the classifier alongside the fault.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::MainProcess => "The main process".to_string(),
            Self::BackgroundTask { task } => format!("Background task {task}"),
        }
    }

    /// Short tag used for metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MainProcess => "main",
            Self::BackgroundTask { .. } => "background",
        }
    }
}

/// Handling category returned by a classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// Degrade the whole process: stop new work, let in-flight work finish.
    Lockdown,
    /// Report the crash; the process keeps serving.
    Crash,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lockdown => f.write_str("lockdown"),
            Self::Crash => f.write_str("crash"),
        }
    }
}

/// One fault, produced per occurrence and never persisted by the policy
/// itself (a classifier may log it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub id: String,
    pub message: String,
    /// `file:line:column` when the fault carries a source location.
    pub location: Option<String>,
    pub origin: FaultOrigin,
    pub timestamp_ms: u64,
}

/// Inspects a fault and decides how the process should react.
pub trait CrashClassifier: Send + Sync {
    fn classify(&self, record: &CrashRecord) -> Classification;
}

impl<F> CrashClassifier for F
where
    F: Fn(&CrashRecord) -> Classification + Send + Sync,
{
    fn classify(&self, record: &CrashRecord) -> Classification {
        self(record)
    }
}
