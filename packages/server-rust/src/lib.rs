//! Arena server: process supervisor and hot-reload control plane.
//!
//! Loads and hot-reloads the config, boots the subsystem table in
//! dependency order, runs worker process pools, routes faults through the
//! crash policy, and exposes the network entry point and operator console.

pub mod app;
pub mod config;
pub mod console;
pub mod crash;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod network;
pub mod pool;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use app::{App, BootOptions};
pub use error::BootError;
