//! Top-level boot error taxonomy.

use crate::config::ConfigError;
use crate::service::RegistryError;

/// Why the server could not come up. Every variant aborts boot.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    /// The config could not be seeded or parsed.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A subsystem initializer failed or its dependency was missing.
    #[error(transparent)]
    Subsystem(#[from] RegistryError),
    /// The socket layer refused to listen.
    #[error("network entry point failed: {0:#}")]
    Listen(#[source] anyhow::Error),
    /// The worker executable could not be located.
    #[error("cannot locate worker executable: {0}")]
    WorkerExecutable(#[source] std::io::Error),
}
