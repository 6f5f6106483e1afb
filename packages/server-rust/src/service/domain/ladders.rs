//! Ladder backend selection.

use std::fmt;
use std::sync::OnceLock;

use async_trait::async_trait;
use tracing::info;

use super::names;
use crate::service::registry::{ManagedService, ServiceContext};

/// Where ladder ratings are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderBackend {
    /// Ratings kept by this server.
    Local,
    /// Ratings kept by the login server.
    Remote,
}

impl fmt::Display for LadderBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Remote => "remote",
        })
    }
}

/// Picks the backend from `remoteladder` once at boot. A later reload that
/// flips the option has no effect until restart.
#[derive(Debug, Default)]
pub struct LaddersService {
    backend: OnceLock<LadderBackend>,
}

impl LaddersService {
    /// The backend chosen at boot, once initialized.
    #[must_use]
    pub fn backend(&self) -> Option<LadderBackend> {
        self.backend.get().copied()
    }
}

#[async_trait]
impl ManagedService for LaddersService {
    fn name(&self) -> &'static str {
        names::LADDERS
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[names::TOOLS, names::LOGIN_SERVER]
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let backend = if ctx.config.current().remote_ladder {
            LadderBackend::Remote
        } else {
            LadderBackend::Local
        };
        let chosen = *self.backend.get_or_init(|| backend);
        info!(backend = %chosen, "ladder backend selected");
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        Ok(())
    }
}
