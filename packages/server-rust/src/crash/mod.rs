//! Crash policy: fault routing, the default classifier, and the lockdown
//! state that classification can trigger.

pub mod classifier;
pub mod lockdown;
pub mod policy;

pub use classifier::CrashLogger;
pub use lockdown::{AdmissionError, HealthState, LockdownController, SessionGuard};
pub use policy::{CrashPolicy, CrashResponder, ExitTerminator, FaultAction, FaultPolicy, Terminator};
