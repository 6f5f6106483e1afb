//! Room registry: the crash responder.
//!
//! Rooms own the reaction to classified faults. A lockdown stops new
//! sessions and starts a drain task that signals shutdown once in-flight
//! sessions finish; a plain crash is only recorded.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

use arena_core::CrashRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use super::names;
use crate::crash::{CrashResponder, LockdownController};
use crate::service::registry::{ManagedService, ServiceContext};

/// Crash reports kept for the console.
pub const MAX_CRASH_REPORTS: usize = 50;

#[derive(Default)]
struct RoomsState {
    lockdown: OnceLock<Arc<LockdownController>>,
    reports: Mutex<VecDeque<CrashRecord>>,
}

impl RoomsState {
    fn record(&self, record: &CrashRecord) {
        let mut reports = self.reports.lock();
        if reports.len() == MAX_CRASH_REPORTS {
            reports.pop_front();
        }
        reports.push_back(record.clone());
    }

    fn begin_lockdown(&self, reason: &str) -> bool {
        let Some(lockdown) = self.lockdown.get() else {
            warn!(reason, "lockdown requested before rooms were initialized");
            return false;
        };
        if !lockdown.start_lockdown(reason) {
            return false;
        }
        let lockdown = Arc::clone(lockdown);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    lockdown.wait_for_drain(None).await;
                    info!("lockdown drain complete");
                });
            }
            Err(_) => warn!("no runtime to drain sessions; waiting for shutdown"),
        }
        true
    }
}

impl CrashResponder for RoomsState {
    fn start_lockdown(&self, record: &CrashRecord) {
        self.record(record);
        self.begin_lockdown(&format!("{}: {}", record.origin.label(), record.message));
    }

    fn report_crash(&self, record: &CrashRecord) {
        self.record(record);
    }
}

#[derive(Default)]
pub struct RoomsService {
    state: Arc<RoomsState>,
}

impl RoomsService {
    /// Operator-initiated lockdown. Returns `false` if already locked down.
    pub fn start_lockdown(&self, reason: &str) -> bool {
        self.state.begin_lockdown(reason)
    }

    /// Recent crash reports, oldest first.
    #[must_use]
    pub fn recent_crashes(&self) -> Vec<CrashRecord> {
        self.state.reports.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl ManagedService for RoomsService {
    fn name(&self) -> &'static str {
        names::ROOMS
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[names::USERS, names::CHAT]
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        if self.state.lockdown.set(Arc::clone(&ctx.lockdown)).is_err() {
            anyhow::bail!("rooms initialized twice");
        }
        ctx.faults.bind_responder(self.state.clone());
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        Ok(())
    }
}
