//! Default crash classifier.
//!
//! Appends every crash to a JSON-lines log and escalates to lockdown when
//! crashes cluster: `threshold` crashes inside `window` means the process is
//! unhealthy enough that it should stop taking new work.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use arena_core::{Classification, Config, CrashClassifier, CrashRecord};
use parking_lot::Mutex;
use tracing::warn;

pub struct CrashLogger {
    threshold: u32,
    window: Duration,
    log_path: Option<PathBuf>,
    recent: Mutex<VecDeque<Instant>>,
}

impl CrashLogger {
    #[must_use]
    pub fn new(threshold: u32, window: Duration, log_path: Option<PathBuf>) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            log_path,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.crash_lockdown_threshold,
            Duration::from_secs(config.crash_lockdown_window_secs),
            Some(config.crash_log.clone()),
        )
    }

    /// Classifies a crash observed at `now`.
    pub fn classify_at(&self, record: &CrashRecord, now: Instant) -> Classification {
        self.append(record);

        let mut recent = self.recent.lock();
        recent.push_back(now);
        while recent
            .front()
            .is_some_and(|&at| now.saturating_duration_since(at) > self.window)
        {
            recent.pop_front();
        }

        if recent.len() >= self.threshold as usize {
            Classification::Lockdown
        } else {
            Classification::Crash
        }
    }

    fn append(&self, record: &CrashRecord) {
        let Some(path) = &self.log_path else {
            return;
        };
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let line = serde_json::to_string(record)?;
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{line}")
        })();
        if let Err(err) = result {
            warn!(path = %path.display(), error = %err, "could not write crash log");
        }
    }
}

impl CrashClassifier for CrashLogger {
    fn classify(&self, record: &CrashRecord) -> Classification {
        self.classify_at(record, Instant::now())
    }
}
