//! Boot sequence.
//!
//! 1. `App::boot` -- load config, wire the crash policy, start the config
//!    watcher, initialize the core subsystem table in order.
//! 2. `App::listen` -- start the network entry point.
//! 3. `App::finish_boot` -- formats, validator pool, console; then Ready.
//! 4. `App::shutdown` -- reverse-order teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::{ConfigError, ConfigPaths, ConfigReloader, ConfigStore, ConfigWatcher};
use crate::console::ConsoleService;
use crate::crash::{
    CrashLogger, CrashPolicy, ExitTerminator, FaultPolicy, LockdownController, Terminator,
};
use crate::error::BootError;
use crate::ipc::ParentChannel;
use crate::network::{self, ListenHandle, SocketLayer};
use crate::pool::{ProcessSpawnerFactory, SpawnerFactory};
use crate::service::domain::{
    ChatService, DnsblService, FormatsService, LaddersService, LoginServerService, MonitorService,
    PunishmentsService, RoomsService, ToolsService, TournamentsService, UsersService,
    ValidatorService, VerifierService,
};
use crate::service::{BackgroundWorker, ServiceContext, ServiceRegistry};

/// How long `shutdown` waits for the listener to finish.
const LISTENER_GRACE: Duration = Duration::from_secs(10);

/// Process-level wiring decided before boot.
pub struct BootOptions {
    pub paths: ConfigPaths,
    pub spawners: Arc<dyn SpawnerFactory>,
    pub terminator: Arc<dyn Terminator>,
    pub parent_channel: ParentChannel,
    /// Installs the process-wide panic hook. Off for embedded use and tests.
    pub install_panic_hook: bool,
}

impl BootOptions {
    /// Production wiring: workers re-execute this binary, unrecoverable
    /// faults exit the process, and the parent channel comes from the
    /// environment.
    ///
    /// # Errors
    ///
    /// `BootError::WorkerExecutable` if the running executable cannot be
    /// located.
    pub fn for_process(paths: ConfigPaths) -> Result<Self, BootError> {
        Ok(Self {
            paths,
            spawners: Arc::new(
                ProcessSpawnerFactory::current_exe().map_err(BootError::WorkerExecutable)?,
            ),
            terminator: Arc::new(ExitTerminator),
            parent_channel: ParentChannel::from_env(),
            install_panic_hook: true,
        })
    }
}

pub struct App {
    ctx: ServiceContext,
    watcher: tokio::sync::Mutex<Option<BackgroundWorker<ConfigWatcher>>>,
    listener: Mutex<Option<ListenHandle>>,
}

impl App {
    /// Loads the config and initializes every subsystem up to the network
    /// entry point.
    ///
    /// # Errors
    ///
    /// `BootError::Config` if the config cannot be seeded or parsed,
    /// `BootError::Subsystem` if any initializer fails.
    pub async fn boot(options: BootOptions) -> Result<Self, BootError> {
        let store = Arc::new(ConfigStore::load(&options.paths)?);
        let config = store.current();

        let faults = Arc::new(CrashPolicy::new(
            FaultPolicy::from_config(&config),
            Arc::new(CrashLogger::from_config(&config)),
            options.terminator,
        ));
        if options.install_panic_hook {
            faults.install_panic_hook();
        }
        info!(
            crash_guard = config.crash_guard,
            unified_routing = config.unified_fault_routing,
            "crash policy installed"
        );

        let reloader = Arc::new(ConfigReloader::new(Arc::clone(&store)));
        let ctx = ServiceContext {
            config: store,
            reloader,
            services: Arc::new(ServiceRegistry::new()),
            lockdown: Arc::new(LockdownController::new()),
            faults,
            parent_channel: Arc::new(options.parent_channel),
            spawners: options.spawners,
        };

        let watcher = if config.watch_config {
            start_watcher(&ctx, Duration::from_millis(config.watch_interval_ms))
        } else {
            None
        };

        let app = Self {
            ctx,
            watcher: tokio::sync::Mutex::new(watcher),
            listener: Mutex::new(None),
        };
        app.register_core()?;
        app.ctx.services.init_all(&app.ctx).await?;
        Ok(app)
    }

    fn register_core(&self) -> Result<(), BootError> {
        let services = &self.ctx.services;
        services.register(MonitorService)?;
        services.register(ToolsService)?;
        services.register(LoginServerService)?;
        services.register(LaddersService::default())?;
        services.register(UsersService::default())?;
        services.register(PunishmentsService)?;
        services.register(ChatService)?;
        services.register(RoomsService::default())?;
        services.register(VerifierService::default())?;
        services.register(TournamentsService)?;
        services.register(DnsblService::default())?;
        Ok(())
    }

    /// Starts accepting connections through `layer`.
    ///
    /// # Errors
    ///
    /// `BootError::Listen` with the socket layer's error.
    pub async fn listen(
        &self,
        layer: &dyn SocketLayer,
        port: Option<u16>,
        bind_address: Option<String>,
        workers: Option<usize>,
    ) -> Result<SocketAddr, BootError> {
        let handle = network::listen(layer, port, bind_address, workers)
            .await
            .map_err(BootError::Listen)?;
        let addr = handle.local_addr;
        *self.listener.lock() = Some(handle);
        Ok(addr)
    }

    /// Initializes the subsystems that come after the network entry point
    /// and marks the process ready.
    ///
    /// # Errors
    ///
    /// `BootError::Subsystem` if any initializer fails.
    pub async fn finish_boot(&self) -> Result<(), BootError> {
        let services = &self.ctx.services;
        services.register(FormatsService::default())?;
        services.register(ValidatorService::default())?;
        services.register(ConsoleService::default())?;
        services.init_all(&self.ctx).await?;
        self.ctx.lockdown.set_ready();
        info!(subsystems = services.init_order().len(), "boot complete");
        Ok(())
    }

    #[must_use]
    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    /// Asks the config watcher to check the file now.
    ///
    /// # Errors
    ///
    /// `ConfigError::NoSource` if watch mode is off.
    pub async fn check_config_now(&self) -> Result<(), ConfigError> {
        let guard = self.watcher.lock().await;
        let watcher = guard.as_ref().ok_or(ConfigError::NoSource)?;
        watcher
            .submit(crate::config::WatchCommand::CheckNow)
            .await
            .map_err(|_| ConfigError::NoSource)
    }

    /// Stops the watcher, shuts every subsystem down in reverse order, and
    /// stops the listener.
    pub async fn shutdown(&self, terminate: bool) {
        if let Some(mut watcher) = self.watcher.lock().await.take() {
            watcher.stop().await;
        }
        if let Err(err) = self.ctx.services.shutdown_all(terminate).await {
            warn!(error = %err, "subsystem shutdown reported errors");
        }
        self.ctx.lockdown.request_shutdown();

        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            match tokio::time::timeout(LISTENER_GRACE, handle.task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => warn!(error = %err, "listener stopped with an error"),
                Ok(Err(err)) => warn!(error = %err, "listener task failed"),
                Err(_) => warn!("listener did not stop in time"),
            }
        }
        info!("shutdown complete");
    }
}

fn start_watcher(ctx: &ServiceContext, interval: Duration) -> Option<BackgroundWorker<ConfigWatcher>> {
    match ConfigWatcher::new(Arc::clone(&ctx.reloader)) {
        Ok(watcher) => {
            info!(interval_ms = interval.as_millis(), "watching config file");
            let worker = BackgroundWorker::start(watcher, interval);
            if let Some(queue) = worker.sender() {
                ctx.reloader.attach_watcher(queue);
            }
            Some(worker)
        }
        Err(err) => {
            warn!(error = %err, "config watcher not started");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use arena_core::Config;
    use serde_json::json;

    use super::*;
    use crate::crash::HealthState;
    use crate::network::HttpSocketLayer;
    use crate::service::domain::names;
    use crate::testing::{ChannelSpawnerFactory, RecordingTerminator};

    fn write_config(dir: &Path, config: &serde_json::Value) -> ConfigPaths {
        let paths = ConfigPaths::in_dir(dir);
        std::fs::write(&paths.live, config.to_string()).unwrap();
        paths
    }

    fn options(paths: ConfigPaths) -> BootOptions {
        BootOptions {
            paths,
            spawners: Arc::new(ChannelSpawnerFactory),
            terminator: Arc::new(RecordingTerminator::default()),
            parent_channel: ParentChannel::attached("fd:3"),
            install_panic_hook: false,
        }
    }

    fn base_config(dir: &Path) -> serde_json::Value {
        json!({
            "port": 0,
            "bindaddress": "127.0.0.1",
            "crashlog": dir.join("errors.txt"),
            "formats": ["[Gen 9] OU"],
            "grouplist": [{"symbol": "@", "name": "Moderator"}],
        })
    }

    #[tokio::test]
    async fn boots_in_order_and_becomes_ready() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::boot(options(write_config(dir.path(), &base_config(dir.path()))))
            .await
            .unwrap();

        assert_eq!(
            app.context().services.init_order(),
            vec![
                names::MONITOR,
                names::TOOLS,
                names::LOGIN_SERVER,
                names::LADDERS,
                names::USERS,
                names::PUNISHMENTS,
                names::CHAT,
                names::ROOMS,
                names::VERIFIER,
                names::TOURNAMENTS,
                names::DNSBL,
            ]
        );
        assert!(!app.context().parent_channel.is_attached());
        assert_eq!(app.context().lockdown.health_state(), HealthState::Starting);

        let layer = HttpSocketLayer::new(
            Arc::clone(&app.context().config),
            Arc::clone(&app.context().lockdown),
            None,
        );
        let addr = app.listen(&layer, None, None, None).await.unwrap();
        assert!(addr.port() > 0);
        app.finish_boot().await.unwrap();

        let order = app.context().services.init_order();
        assert_eq!(
            &order[order.len() - 3..],
            &[names::FORMATS, names::VALIDATOR, names::CONSOLE]
        );
        assert_eq!(app.context().lockdown.health_state(), HealthState::Ready);

        let validator = app.context().services.get::<ValidatorService>().unwrap();
        let result = validator.validate("gen9ou", &["Mew".to_string()]).await.unwrap();
        assert_eq!(result["valid"], json!(true));

        app.shutdown(false).await;
        assert_eq!(app.context().lockdown.health_state(), HealthState::Stopped);
    }

    #[tokio::test]
    async fn first_boot_seeds_config_from_template() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::in_dir(dir.path());
        let mut template = base_config(dir.path());
        template["port"] = json!(8123);
        std::fs::write(&paths.template, template.to_string()).unwrap();

        let app = App::boot(options(paths.clone())).await.unwrap();

        assert!(paths.live.exists());
        assert_eq!(app.context().config.current().port, 8123);
        app.shutdown(true).await;
    }

    #[tokio::test]
    async fn malformed_config_aborts_boot() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::in_dir(dir.path());
        std::fs::write(&paths.live, "{ not json").unwrap();

        let result = App::boot(options(paths)).await;
        assert!(matches!(result, Err(BootError::Config(ConfigError::Invalid { .. }))));
    }

    #[tokio::test]
    async fn watch_mode_reloads_group_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config["watchconfig"] = json!(true);
        config["watchintervalms"] = json!(3_600_000);
        let paths = write_config(dir.path(), &config);
        let app = App::boot(options(paths.clone())).await.unwrap();
        let users = app.context().services.get::<crate::service::domain::UsersService>().unwrap();
        assert!(users.groups().group("%").is_none());

        config["grouplist"] = json!([{"symbol": "%", "name": "Driver"}]);
        std::fs::write(&paths.live, config.to_string()).unwrap();
        let later = std::time::SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&paths.live)
            .unwrap()
            .set_modified(later)
            .unwrap();

        app.check_config_now().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while users.groups().group("%").is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        app.shutdown(false).await;
    }

    #[tokio::test]
    async fn console_reload_is_serialized_with_the_watcher() {
        use crate::console::{execute, Command};

        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config["watchconfig"] = json!(true);
        config["watchintervalms"] = json!(3_600_000);
        let paths = write_config(dir.path(), &config);
        let app = App::boot(options(paths.clone())).await.unwrap();
        let users = app.context().services.get::<crate::service::domain::UsersService>().unwrap();
        let rebuilds = users.groups().rebuilds();

        config["grouplist"] = json!([{"symbol": "%", "name": "Driver"}]);
        std::fs::write(&paths.live, config.to_string()).unwrap();
        let later = std::time::SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&paths.live)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let reply = execute(&Command::Reload, app.context()).await;
        assert_eq!(reply, "Reloaded { version: 2 }");
        assert!(users.groups().group("%").is_some());

        // The watcher has already seen this edit; the next forced reload is
        // queued behind its check, so exactly one more reload happens.
        app.check_config_now().await.unwrap();
        let reply = execute(&Command::Reload, app.context()).await;
        assert_eq!(reply, "Reloaded { version: 3 }");
        assert_eq!(users.groups().rebuilds(), rebuilds + 2);

        app.shutdown(false).await;
    }

    #[tokio::test]
    async fn check_config_without_watch_mode_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::boot(options(write_config(dir.path(), &base_config(dir.path()))))
            .await
            .unwrap();
        assert!(matches!(app.check_config_now().await, Err(ConfigError::NoSource)));
        app.shutdown(false).await;
    }

    #[test]
    fn shipped_template_parses() {
        let template = include_str!("../../../config/config-example.json");
        Config::from_json(template).unwrap();
    }
}
