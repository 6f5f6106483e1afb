//! Worker pools: supervisor, process transport, and the worker side.

pub mod handlers;
pub mod process;
pub mod serve;
pub mod supervisor;

pub use process::{
    LineConnection, ProcessSpawner, ProcessSpawnerFactory, SpawnerFactory, TransportError,
    WorkerConnection, WorkerSpawner,
};
pub use serve::{serve, serve_stdio, TaskHandler};
pub use supervisor::{PoolConfig, PoolError, PoolEvent, WorkerPool, WorkerState};
