//! Arena core: configuration model, fault records, and the worker wire protocol.
//!
//! Everything here is plain data shared between the supervising process and
//! its worker processes. Runtime behavior lives in `arena-server`.

pub mod config;
pub mod fault;
pub mod id;
pub mod messages;

pub use config::{Config, GroupDef, Secret, DEFAULT_PORT};
pub use fault::{Classification, CrashClassifier, CrashRecord, FaultOrigin};
pub use id::to_id;
pub use messages::{WorkerKind, WorkerOutcome, WorkerRequest, WorkerResponse};
