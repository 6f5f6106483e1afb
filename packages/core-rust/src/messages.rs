//! Wire protocol between a pool supervisor and its worker processes.
//!
//! One JSON object per line in each direction. Every response echoes the id
//! of the request it answers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kinds of worker process this server knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Verifier,
    Validator,
}

impl WorkerKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verifier => "verifier",
            Self::Validator => "validator",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verifier" => Ok(Self::Verifier),
            "validator" => Ok(Self::Validator),
            other => Err(format!("unknown worker kind: {other}")),
        }
    }
}

/// A task sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    pub task: Value,
}

/// Result of one task as reported by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerOutcome {
    Ok { result: Value },
    Error { message: String },
}

/// A worker's answer to a `WorkerRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: u64,
    #[serde(flatten)]
    pub outcome: WorkerOutcome,
}
