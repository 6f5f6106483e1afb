//! Live configuration: the versioned store and the file watcher that
//! hot-reloads it.

pub mod store;
pub mod watcher;

pub use store::{ConfigError, ConfigPaths, ConfigSnapshot, ConfigStore};
pub use watcher::{ConfigListener, ConfigReloader, ConfigWatcher, ReloadOutcome, WatchCommand};
