//! Parent-process channel.
//!
//! A supervisor that launched this process may pass a channel handle in
//! [`PARENT_CHANNEL_ENV`]. Worker pools must not inherit it, so the handle
//! is detached before the first pool spawns and stripped from every worker
//! command.

use parking_lot::Mutex;
use tracing::debug;

/// Environment variable carrying the parent channel handle.
pub const PARENT_CHANNEL_ENV: &str = "ARENA_PARENT_CHANNEL";

#[derive(Debug, Default)]
pub struct ParentChannel {
    handle: Mutex<Option<String>>,
}

impl ParentChannel {
    /// Captures the handle from the environment, if any.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            handle: Mutex::new(std::env::var(PARENT_CHANNEL_ENV).ok().filter(|h| !h.is_empty())),
        }
    }

    /// A channel that was never attached.
    #[must_use]
    pub fn detached() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn attached(handle: &str) -> Self {
        Self {
            handle: Mutex::new(Some(handle.to_string())),
        }
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Drops the handle. Returns `true` if one was attached. Idempotent.
    pub fn detach(&self) -> bool {
        let previous = self.handle.lock().take();
        if let Some(handle) = &previous {
            debug!(handle, "detached parent channel");
        }
        previous.is_some()
    }
}
