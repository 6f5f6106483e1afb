use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info};

use crate::config::{ConfigReloader, ConfigStore};
use crate::crash::{CrashPolicy, LockdownController};
use crate::ipc::ParentChannel;
use crate::pool::SpawnerFactory;

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// Application context handed to every subsystem initializer.
///
/// Replaces process-wide globals: anything a subsystem needs from the rest
/// of the process is reachable from here.
#[derive(Clone)]
pub struct ServiceContext {
    pub config: Arc<ConfigStore>,
    pub reloader: Arc<ConfigReloader>,
    /// The registry itself, for looking up subsystems initialized earlier.
    pub services: Arc<ServiceRegistry>,
    pub lockdown: Arc<LockdownController>,
    pub faults: Arc<CrashPolicy>,
    pub parent_channel: Arc<ParentChannel>,
    pub spawners: Arc<dyn SpawnerFactory>,
}

// ---------------------------------------------------------------------------
// ManagedService trait
// ---------------------------------------------------------------------------

/// Lifecycle-managed subsystem.
///
/// Subsystems are registered in dependency order, initialized exactly once
/// in that order, and shut down in reverse. The `Any` bound enables
/// type-based lookup via `ServiceRegistry::get::<T>()`.
#[async_trait]
pub trait ManagedService: Send + Sync + Any {
    /// Unique name of this subsystem (e.g. `"users"`, `"rooms"`).
    fn name(&self) -> &'static str;

    /// Names of subsystems that must be initialized before this one.
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    /// Initialize the subsystem. May start background work that outlives
    /// the call.
    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// Shut down the subsystem. If `terminate` is true, skip graceful cleanup.
    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// RegistryError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("subsystem `{name}` is already registered")]
    Duplicate { name: &'static str },
    #[error("subsystem `{name}` requires `{dependency}`, which is not initialized")]
    MissingDependency {
        name: &'static str,
        dependency: &'static str,
    },
    #[error("subsystem `{name}` failed to initialize: {source:#}")]
    InitFailed {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

struct PendingEntry {
    service: Arc<dyn ManagedService>,
    any: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
}

/// Ordered table of subsystems.
///
/// A subsystem's handle becomes visible through `get` and `get_by_name`
/// only after its initializer has completed, so no subsystem can observe
/// another one half-built.
pub struct ServiceRegistry {
    /// Registered but not yet initialized, in registration order.
    pending: Mutex<Vec<PendingEntry>>,
    registered: Mutex<HashSet<&'static str>>,
    by_name: DashMap<&'static str, Arc<dyn ManagedService>>,
    by_type: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    /// Initialization order, for reverse-order shutdown.
    init_order: RwLock<Vec<&'static str>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            registered: Mutex::new(HashSet::new()),
            by_name: DashMap::new(),
            by_type: DashMap::new(),
            init_order: RwLock::new(Vec::new()),
        }
    }

    /// Queue a subsystem for initialization. Registration order is
    /// initialization order.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Duplicate` if the name is already taken.
    pub fn register<T: ManagedService>(&self, service: T) -> Result<(), RegistryError> {
        let name = service.name();
        if !self.registered.lock().insert(name) {
            return Err(RegistryError::Duplicate { name });
        }
        let arc = Arc::new(service);
        self.pending.lock().push(PendingEntry {
            service: arc.clone(),
            any: arc,
            type_id: TypeId::of::<T>(),
        });
        Ok(())
    }

    /// Retrieve an initialized subsystem by its concrete type.
    pub fn get<T: ManagedService>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    /// Retrieve an initialized subsystem by name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn ManagedService>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    /// Whether `name` has finished initializing.
    #[must_use]
    pub fn is_initialized(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Names of initialized subsystems, in initialization order.
    #[must_use]
    pub fn init_order(&self) -> Vec<&'static str> {
        self.init_order.read().clone()
    }

    /// Initialize every pending subsystem in registration order.
    ///
    /// Subsystems initialized by an earlier call are not touched again, so
    /// boot can run in phases.
    ///
    /// # Errors
    ///
    /// Stops at the first subsystem whose dependency is missing or whose
    /// initializer fails. That subsystem and everything after it stay pending.
    pub async fn init_all(&self, ctx: &ServiceContext) -> Result<(), RegistryError> {
        let batch = std::mem::take(&mut *self.pending.lock());
        let mut remaining = batch.into_iter();

        while let Some(entry) = remaining.next() {
            if let Err(err) = self.init_one(&entry, ctx).await {
                error!(error = %err, "subsystem initialization aborted boot");
                let mut pending = self.pending.lock();
                let mut rest: Vec<PendingEntry> = std::iter::once(entry).chain(remaining).collect();
                rest.append(&mut pending);
                *pending = rest;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn init_one(&self, entry: &PendingEntry, ctx: &ServiceContext) -> Result<(), RegistryError> {
        let name = entry.service.name();
        for &dependency in entry.service.dependencies() {
            if !self.is_initialized(dependency) {
                return Err(RegistryError::MissingDependency { name, dependency });
            }
        }

        let started = Instant::now();
        entry
            .service
            .init(ctx)
            .await
            .map_err(|source| RegistryError::InitFailed { name, source })?;

        self.by_type.insert(entry.type_id, entry.any.clone());
        self.by_name.insert(name, entry.service.clone());
        self.init_order.write().push(name);

        #[allow(clippy::cast_possible_truncation)]
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(subsystem = name, elapsed_ms, "subsystem initialized");
        Ok(())
    }

    /// Shut down all initialized subsystems in reverse initialization order.
    ///
    /// Every subsystem gets its shutdown call even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the first shutdown error encountered.
    pub async fn shutdown_all(&self, terminate: bool) -> anyhow::Result<()> {
        let order = self.init_order();
        let mut first_error = None;
        for name in order.iter().rev() {
            if let Some(service) = self.get_by_name(name) {
                if let Err(err) = service.shutdown(terminate).await {
                    error!(subsystem = name, error = %err, "subsystem shutdown failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use arena_core::Config;

    use super::*;
    use crate::testing::test_context;

    type OrderLog = Arc<Mutex<Vec<String>>>;

    struct Probe {
        svc_name: &'static str,
        deps: &'static [&'static str],
        fail: bool,
        init_counter: Arc<AtomicU32>,
        order_log: OrderLog,
    }

    impl Probe {
        fn new(name: &'static str, deps: &'static [&'static str], log: &OrderLog) -> Self {
            Self {
                svc_name: name,
                deps,
                fail: false,
                init_counter: Arc::new(AtomicU32::new(0)),
                order_log: log.clone(),
            }
        }
    }

    #[async_trait]
    impl ManagedService for Probe {
        fn name(&self) -> &'static str {
            self.svc_name
        }

        fn dependencies(&self) -> &'static [&'static str] {
            self.deps
        }

        async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
            self.init_counter.fetch_add(1, Ordering::SeqCst);
            // Record which dependencies were visible while this one was built.
            let visible: Vec<&str> = self
                .deps
                .iter()
                .copied()
                .filter(|d| ctx.services.is_initialized(d))
                .collect();
            self.order_log
                .lock()
                .push(format!("init:{}[{}]", self.svc_name, visible.join(",")));
            if self.fail {
                anyhow::bail!("{} refused to start", self.svc_name);
            }
            Ok(())
        }

        async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
            self.order_log
                .lock()
                .push(format!("shutdown:{}", self.svc_name));
            Ok(())
        }
    }

    /// A distinct type for type-based lookup.
    struct Marker;

    #[async_trait]
    impl ManagedService for Marker {
        fn name(&self) -> &'static str {
            "marker"
        }
        async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            Ok(())
        }
        async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn new_log() -> OrderLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn init_runs_in_registration_order_with_dependencies_visible() {
        let ctx = test_context(Config::default());
        let log = new_log();
        let registry = &ctx.services;
        registry.register(Probe::new("tools", &[], &log)).unwrap();
        registry.register(Probe::new("users", &["tools"], &log)).unwrap();
        registry.register(Probe::new("rooms", &["tools", "users"], &log)).unwrap();

        registry.init_all(&ctx).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["init:tools[]", "init:users[tools]", "init:rooms[tools,users]"]
        );
        assert_eq!(registry.init_order(), vec!["tools", "users", "rooms"]);
    }

    #[tokio::test]
    async fn handles_are_hidden_until_initialized() {
        let ctx = test_context(Config::default());
        ctx.services.register(Marker).unwrap();

        assert!(ctx.services.get::<Marker>().is_none());
        assert!(ctx.services.get_by_name("marker").is_none());

        ctx.services.init_all(&ctx).await.unwrap();

        assert!(ctx.services.get::<Marker>().is_some());
        assert_eq!(ctx.services.get_by_name("marker").unwrap().name(), "marker");
    }

    #[tokio::test]
    async fn each_initializer_runs_exactly_once_across_phases() {
        let ctx = test_context(Config::default());
        let log = new_log();
        let early = Probe::new("early", &[], &log);
        let counter = early.init_counter.clone();
        ctx.services.register(early).unwrap();
        ctx.services.init_all(&ctx).await.unwrap();

        ctx.services.register(Probe::new("late", &["early"], &log)).unwrap();
        ctx.services.init_all(&ctx).await.unwrap();
        ctx.services.init_all(&ctx).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.services.init_order(), vec!["early", "late"]);
    }

    #[tokio::test]
    async fn dependency_registered_later_is_rejected() {
        let ctx = test_context(Config::default());
        let log = new_log();
        ctx.services.register(Probe::new("chat", &["users"], &log)).unwrap();
        ctx.services.register(Probe::new("users", &[], &log)).unwrap();

        let err = ctx.services.init_all(&ctx).await.unwrap_err();

        assert!(matches!(
            err,
            RegistryError::MissingDependency {
                name: "chat",
                dependency: "users"
            }
        ));
        assert!(log.lock().is_empty());
        assert!(!ctx.services.is_initialized("users"));
    }

    #[tokio::test]
    async fn failing_initializer_stops_boot() {
        let ctx = test_context(Config::default());
        let log = new_log();
        let mut broken = Probe::new("ladders", &[], &log);
        broken.fail = true;
        ctx.services.register(Probe::new("tools", &[], &log)).unwrap();
        ctx.services.register(broken).unwrap();
        ctx.services.register(Probe::new("users", &[], &log)).unwrap();

        let err = ctx.services.init_all(&ctx).await.unwrap_err();

        assert!(matches!(err, RegistryError::InitFailed { name: "ladders", .. }));
        assert_eq!(ctx.services.init_order(), vec!["tools"]);
        assert!(!ctx.services.is_initialized("users"));
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let registry = ServiceRegistry::new();
        registry.register(Marker).unwrap();
        assert!(matches!(
            registry.register(Marker),
            Err(RegistryError::Duplicate { name: "marker" })
        ));
    }

    #[tokio::test]
    async fn shutdown_runs_in_reverse_init_order() {
        let ctx = test_context(Config::default());
        let log = new_log();
        for name in ["first", "second", "third"] {
            ctx.services.register(Probe::new(name, &[], &log)).unwrap();
        }
        ctx.services.init_all(&ctx).await.unwrap();
        log.lock().clear();

        ctx.services.shutdown_all(false).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["shutdown:third", "shutdown:second", "shutdown:first"]
        );
    }
}
