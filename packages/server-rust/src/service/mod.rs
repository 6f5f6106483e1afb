//! Subsystem lifecycle.
//!
//! 1. **Registry** (`registry`): ordered, dependency-checked initialization
//!    and reverse-order shutdown.
//! 2. **Background workers** (`worker`): tick-driven tasks such as the
//!    config watcher.
//! 3. **Subsystem table** (`domain`): every subsystem the server boots.

pub mod domain;
pub mod registry;
pub mod worker;

pub use registry::{ManagedService, RegistryError, ServiceContext, ServiceRegistry};
pub use worker::{BackgroundRunnable, BackgroundWorker};
