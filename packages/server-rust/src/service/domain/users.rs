//! User registry: the permission-group cache.
//!
//! The cache is derived from `grouplist` and is the one piece of user state
//! that must follow config reloads, so it is subscribed to the reloader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::bail;
use arc_swap::ArcSwap;
use arena_core::{to_id, Config};
use async_trait::async_trait;
use tracing::debug;

use super::names;
use crate::config::ConfigListener;
use crate::service::registry::{ManagedService, ServiceContext};

/// One permission group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub symbol: String,
    pub id: String,
    pub name: String,
    /// Position in `grouplist`; 0 is the most senior group.
    pub rank: usize,
}

/// Symbol-indexed view of `grouplist`.
#[derive(Debug, Default)]
pub struct GroupCache {
    groups: ArcSwap<HashMap<String, GroupInfo>>,
    rebuilds: AtomicU64,
}

impl GroupCache {
    /// Recomputes the cache from `config`. On error the previous cache is
    /// kept.
    ///
    /// # Errors
    ///
    /// Fails if two groups share a symbol.
    pub fn rebuild(&self, config: &Config) -> anyhow::Result<()> {
        let mut groups = HashMap::with_capacity(config.group_list.len());
        for (rank, group) in config.group_list.iter().enumerate() {
            let info = GroupInfo {
                symbol: group.symbol.clone(),
                id: if group.id.is_empty() {
                    to_id(&group.name)
                } else {
                    to_id(&group.id)
                },
                name: group.name.clone(),
                rank,
            };
            if groups.insert(group.symbol.clone(), info).is_some() {
                bail!("group symbol {:?} is defined more than once", group.symbol);
            }
        }
        debug!(groups = groups.len(), "group cache rebuilt");
        self.groups.store(Arc::new(groups));
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    #[must_use]
    pub fn group(&self, symbol: &str) -> Option<GroupInfo> {
        self.groups.load().get(symbol).cloned()
    }

    /// Looks a group up by id, e.g. `"driver"`.
    #[must_use]
    pub fn group_by_id(&self, id: &str) -> Option<GroupInfo> {
        let id = to_id(id);
        self.groups.load().values().find(|g| g.id == id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful rebuilds so far.
    #[must_use]
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }
}

impl ConfigListener for GroupCache {
    fn name(&self) -> &'static str {
        "users.groups"
    }

    fn on_reload(&self, config: &Config) -> anyhow::Result<()> {
        self.rebuild(config)
    }
}

#[derive(Debug, Default)]
pub struct UsersService {
    groups: Arc<GroupCache>,
}

impl UsersService {
    #[must_use]
    pub fn groups(&self) -> &GroupCache {
        &self.groups
    }
}

#[async_trait]
impl ManagedService for UsersService {
    fn name(&self) -> &'static str {
        names::USERS
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[names::TOOLS]
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        self.groups.rebuild(&ctx.config.current())?;
        ctx.reloader.subscribe(self.groups.clone());
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use arena_core::GroupDef;

    use super::*;
    use crate::config::ReloadOutcome;
    use crate::service::domain::ToolsService;
    use crate::testing::test_context;

    fn group(symbol: &str, name: &str) -> GroupDef {
        GroupDef {
            symbol: symbol.to_string(),
            id: String::new(),
            name: name.to_string(),
        }
    }

    fn config_with(groups: Vec<GroupDef>) -> Config {
        Config {
            group_list: groups,
            ..Config::default()
        }
    }

    #[test]
    fn rebuild_indexes_by_symbol_with_rank() {
        let cache = GroupCache::default();
        cache
            .rebuild(&config_with(vec![group("~", "Administrator"), group("%", "Driver")]))
            .unwrap();

        assert_eq!(cache.len(), 2);
        let driver = cache.group("%").unwrap();
        assert_eq!(driver.rank, 1);
        assert_eq!(driver.id, "driver");
        assert_eq!(cache.group_by_id("Administrator").unwrap().symbol, "~");
    }

    #[test]
    fn duplicate_symbol_keeps_previous_cache() {
        let cache = GroupCache::default();
        cache.rebuild(&config_with(vec![group("+", "Voice")])).unwrap();

        let err = cache.rebuild(&config_with(vec![group("@", "Mod"), group("@", "Other")]));

        assert!(err.is_err());
        assert_eq!(cache.group("+").unwrap().name, "Voice");
        assert!(cache.group("@").is_none());
        assert_eq!(cache.rebuilds(), 1);
    }

    #[tokio::test]
    async fn reload_recomputes_groups() {
        let ctx = test_context(config_with(vec![group("+", "Voice")]));
        ctx.services.register(ToolsService).unwrap();
        ctx.services.register(UsersService::default()).unwrap();
        ctx.services.init_all(&ctx).await.unwrap();
        let users = ctx.services.get::<UsersService>().unwrap();
        assert!(users.groups().group("%").is_none());

        let outcome = ctx.reloader.apply_source(
            r#"{"grouplist": [{"symbol": "%", "name": "Driver"}, {"symbol": "+", "name": "Voice"}]}"#,
            None,
        );

        assert!(matches!(outcome, ReloadOutcome::Reloaded { .. }));
        assert_eq!(users.groups().group("%").unwrap().rank, 0);
        assert_eq!(users.groups().group("+").unwrap().rank, 1);
    }

    #[tokio::test]
    async fn invalid_grouplist_rolls_the_reload_back() {
        let ctx = test_context(config_with(vec![group("+", "Voice")]));
        ctx.services.register(ToolsService).unwrap();
        ctx.services.register(UsersService::default()).unwrap();
        ctx.services.init_all(&ctx).await.unwrap();
        let before = ctx.config.current();

        let outcome = ctx.reloader.apply_source(
            r#"{"grouplist": [{"symbol": "+", "name": "A"}, {"symbol": "+", "name": "B"}]}"#,
            None,
        );

        assert!(matches!(outcome, ReloadOutcome::Failed { .. }));
        assert!(Arc::ptr_eq(&before, &ctx.config.current()));
    }
}
