//! Versioned configuration store.
//!
//! Holds exactly one live `Config`. Readers get the installed object by
//! shared reference (`Arc`) and never see a partially updated value: a
//! reload builds a new object and swaps the pointer. Writers are serialized
//! by a single-writer lock so version numbers stay monotonic.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use arena_core::Config;
use parking_lot::Mutex;
use tracing::info;

/// Location of the live config file and the template it is seeded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    pub live: PathBuf,
    pub template: PathBuf,
}

impl ConfigPaths {
    #[must_use]
    pub fn new(live: impl Into<PathBuf>, template: impl Into<PathBuf>) -> Self {
        Self {
            live: live.into(),
            template: template.into(),
        }
    }

    /// `config.json` and `config-example.json` inside `dir`.
    #[must_use]
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::new(dir.join("config.json"), dir.join("config-example.json"))
    }
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::in_dir("config")
    }
}

/// Errors raised while loading configuration at boot.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The live file was missing and the template could not be copied over.
    #[error("config unreadable: cannot seed {live} from {template}: {source}")]
    Unreadable {
        live: PathBuf,
        template: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config store has no backing file")]
    NoSource,
}

/// A config object together with the version it was installed as.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    /// Modification time of the source the object was parsed from, if any.
    pub modified: Option<SystemTime>,
    pub config: Arc<Config>,
}

/// Process-wide configuration handle.
#[derive(Debug)]
pub struct ConfigStore {
    source: Option<PathBuf>,
    installed: ArcSwap<ConfigSnapshot>,
    writer: Mutex<()>,
}

impl ConfigStore {
    /// Loads the live config, seeding it from the template on first boot.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Unreadable` if the live file is absent and the
    /// template cannot be copied, `ConfigError::Io` or `ConfigError::Invalid`
    /// if the live file cannot be read or parsed.
    pub fn load(paths: &ConfigPaths) -> Result<Self, ConfigError> {
        if !paths.live.exists() {
            seed_from_template(paths)?;
            info!(
                live = %paths.live.display(),
                template = %paths.template.display(),
                "config created from template"
            );
        }

        let (config, modified) = read_config(&paths.live)?;
        Ok(Self {
            source: Some(paths.live.clone()),
            installed: ArcSwap::from_pointee(ConfigSnapshot {
                version: 1,
                modified,
                config: Arc::new(config),
            }),
            writer: Mutex::new(()),
        })
    }

    /// Creates a store with no backing file. Reloads from disk are
    /// unavailable; `replace` still works.
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        Self {
            source: None,
            installed: ArcSwap::from_pointee(ConfigSnapshot {
                version: 1,
                modified: None,
                config: Arc::new(config),
            }),
            writer: Mutex::new(()),
        }
    }

    /// Path of the backing file, if the store was loaded from one.
    #[must_use]
    pub fn source_path(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Returns the live config object. Hold the `Arc` only as long as a
    /// stable view is needed; fetch again for the next use.
    #[must_use]
    pub fn current(&self) -> Arc<Config> {
        Arc::clone(&self.installed.load().config)
    }

    /// Returns the live object with its version and source timestamp.
    #[must_use]
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot::clone(&self.installed.load())
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.installed.load().version
    }

    /// Installs `config` as the live object. Returns the new version.
    pub fn replace(&self, config: Config) -> u64 {
        self.install(Arc::new(config), None)
    }

    /// Installs an existing object, keeping its identity. Used to put a
    /// previous object back after a failed reload.
    pub(crate) fn install(&self, config: Arc<Config>, modified: Option<SystemTime>) -> u64 {
        let _guard = self.writer.lock();
        let version = self.installed.load().version + 1;
        self.installed.store(Arc::new(ConfigSnapshot {
            version,
            modified,
            config,
        }));
        version
    }
}

fn seed_from_template(paths: &ConfigPaths) -> Result<(), ConfigError> {
    let unreadable = |source| ConfigError::Unreadable {
        live: paths.live.clone(),
        template: paths.template.clone(),
        source,
    };

    if let Some(parent) = paths.live.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(unreadable)?;
        }
    }
    fs::copy(&paths.template, &paths.live).map_err(unreadable)?;
    Ok(())
}

/// Reads and parses a config file, returning it with its modification time.
///
/// The mtime is taken before the content: an edit landing between the two
/// reads then carries a newer mtime than the one recorded here.
pub(crate) fn read_config(path: &Path) -> Result<(Config, Option<SystemTime>), ConfigError> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok();
    let source = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = Config::from_json(&source).map_err(|source| ConfigError::Invalid {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((config, modified))
}
