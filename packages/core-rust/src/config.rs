//! Process configuration model.
//!
//! A `Config` is an immutable value: the server never edits one in place.
//! Hot reload parses a fresh `Config` and swaps it in whole.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Port used when neither the command line nor the config names one.
pub const DEFAULT_PORT: u16 = 8000;

/// A string that must not appear in logs or `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw secret. Callers must not log the result.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// One entry of the user group list. Rank is the entry's position in the list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDef {
    pub symbol: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// The live configuration object.
///
/// Every recognized option has a default, so an empty JSON object is a valid
/// config. Unrecognized keys are kept in `extra` so that a reload round-trips
/// options this process does not interpret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Enables the config watcher.
    #[serde(rename = "watchconfig")]
    pub watch_config: bool,
    /// Selects the remote ladder backend. Read once at boot.
    #[serde(rename = "remoteladder")]
    pub remote_ladder: bool,
    /// Enables the crash policy controller.
    #[serde(rename = "crashguard")]
    pub crash_guard: bool,
    pub port: u16,
    #[serde(rename = "bindaddress")]
    pub bind_address: String,
    /// Socket worker count handed to the network layer.
    pub workers: usize,
    #[serde(rename = "verifierprocesses")]
    pub verifier_processes: usize,
    #[serde(rename = "validatorprocesses")]
    pub validator_processes: usize,
    #[serde(rename = "grouplist")]
    pub group_list: Vec<GroupDef>,
    pub formats: Vec<String>,
    /// Datacenter range file loaded by the blocklist subsystem.
    pub datacenters: Option<PathBuf>,
    #[serde(rename = "consolesocket")]
    pub console_socket: Option<PathBuf>,
    #[serde(rename = "consoletoken")]
    pub console_token: Option<Secret>,
    #[serde(rename = "crashlockdownthreshold")]
    pub crash_lockdown_threshold: u32,
    #[serde(rename = "crashlockdownwindowsecs")]
    pub crash_lockdown_window_secs: u64,
    #[serde(rename = "crashlog")]
    pub crash_log: PathBuf,
    /// Routes background-task faults through the classifier instead of
    /// terminating the process.
    #[serde(rename = "unifiedfaultrouting")]
    pub unified_fault_routing: bool,
    #[serde(rename = "watchintervalms")]
    pub watch_interval_ms: u64,
    #[serde(rename = "dispatchtimeoutms")]
    pub dispatch_timeout_ms: Option<u64>,
    #[serde(rename = "customavatars")]
    pub custom_avatars: HashMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_config: false,
            remote_ladder: false,
            crash_guard: true,
            port: DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            workers: 1,
            verifier_processes: 1,
            validator_processes: 1,
            group_list: Vec::new(),
            formats: Vec::new(),
            datacenters: None,
            console_socket: None,
            console_token: None,
            crash_lockdown_threshold: 3,
            crash_lockdown_window_secs: 300,
            crash_log: PathBuf::from("logs/errors.txt"),
            unified_fault_routing: false,
            watch_interval_ms: 1000,
            dispatch_timeout_ms: None,
            custom_avatars: HashMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Config {
    /// Parses a config from its JSON source text.
    ///
    /// # Errors
    ///
    /// Returns the parser error if `source` is not a JSON object matching the
    /// option types.
    pub fn from_json(source: &str) -> serde_json::Result<Self> {
        serde_json::from_str(source)
    }

    /// Looks up an option this process does not interpret.
    #[must_use]
    pub fn extra(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.get(key)
    }
}
