//! Built-in worker task handlers.

use std::collections::HashSet;

use anyhow::{bail, Context};
use arena_core::{to_id, WorkerKind};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::serve::TaskHandler;

/// Largest team a validator accepts.
pub const MAX_TEAM_SIZE: usize = 6;

#[must_use]
pub fn for_kind(kind: WorkerKind) -> Box<dyn TaskHandler> {
    match kind {
        WorkerKind::Verifier => Box::new(VerifierHandler),
        WorkerKind::Validator => Box::new(ValidatorHandler),
    }
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct VerifyTask {
    data: String,
    /// Hex-encoded SHA-256 of `data`.
    digest: String,
}

/// Checks a payload against its claimed SHA-256 digest.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerifierHandler;

impl TaskHandler for VerifierHandler {
    fn handle(&self, task: Value) -> anyhow::Result<Value> {
        let task: VerifyTask = serde_json::from_value(task).context("invalid verify task")?;
        let claimed = hex::decode(task.digest.trim()).context("digest is not hex")?;
        let actual = Sha256::digest(task.data.as_bytes());
        let valid = claimed.len() == actual.len() && bool::from(actual.as_slice().ct_eq(&claimed));
        Ok(json!({ "valid": valid }))
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ValidateTask {
    format: String,
    team: Vec<String>,
}

/// Checks the shape of a team: size, blank entries, duplicates.
#[derive(Debug, Default, Clone, Copy)]
pub struct ValidatorHandler;

impl TaskHandler for ValidatorHandler {
    fn handle(&self, task: Value) -> anyhow::Result<Value> {
        let task: ValidateTask = serde_json::from_value(task).context("invalid validate task")?;
        if to_id(&task.format).is_empty() {
            bail!("format name is empty");
        }

        let mut problems = Vec::new();
        if task.team.is_empty() {
            problems.push("team is empty".to_string());
        }
        if task.team.len() > MAX_TEAM_SIZE {
            problems.push(format!(
                "team has {} entries; the limit is {MAX_TEAM_SIZE}",
                task.team.len()
            ));
        }
        let mut seen = HashSet::new();
        for (slot, entry) in task.team.iter().enumerate() {
            let id = to_id(entry);
            if id.is_empty() {
                problems.push(format!("entry {} is blank", slot + 1));
            } else if !seen.insert(id) {
                problems.push(format!("{} appears more than once", entry.trim()));
            }
        }

        Ok(json!({
            "format": to_id(&task.format),
            "valid": problems.is_empty(),
            "problems": problems,
        }))
    }
}
