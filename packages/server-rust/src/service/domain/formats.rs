//! Format table, indexed by id.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use arena_core::to_id;
use async_trait::async_trait;
use tracing::{info, warn};

use super::names;
use crate::service::registry::{ManagedService, ServiceContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatInfo {
    pub id: String,
    pub name: String,
}

/// Built once from the `formats` option after the network entry point is
/// up. Lookups accept any spelling that normalizes to the same id.
#[derive(Debug, Default)]
pub struct FormatsService {
    table: OnceLock<BTreeMap<String, FormatInfo>>,
}

impl FormatsService {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FormatInfo> {
        self.table.get()?.get(&to_id(name))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.get().map_or(0, BTreeMap::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_table(formats: &[String]) -> BTreeMap<String, FormatInfo> {
    let mut table = BTreeMap::new();
    for name in formats {
        let id = to_id(name);
        if id.is_empty() {
            warn!(format = %name, "skipping format with an empty id");
            continue;
        }
        if table.contains_key(&id) {
            warn!(format = %name, id = %id, "duplicate format id; keeping the first");
            continue;
        }
        table.insert(
            id.clone(),
            FormatInfo {
                id,
                name: name.trim().to_string(),
            },
        );
    }
    table
}

#[async_trait]
impl ManagedService for FormatsService {
    fn name(&self) -> &'static str {
        names::FORMATS
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[names::TOOLS]
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let table = self
            .table
            .get_or_init(|| build_table(&ctx.config.current().formats));
        info!(formats = table.len(), "format table built");
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_indexed_by_id_and_skips_duplicates() {
        let table = build_table(&[
            "[Gen 9] OU".to_string(),
            "gen9ou".to_string(),
            "  ".to_string(),
            "Random Battle".to_string(),
        ]);
        assert_eq!(table.len(), 2);
        assert_eq!(table["gen9ou"].name, "[Gen 9] OU");
        assert!(table.contains_key("randombattle"));
    }

    #[test]
    fn lookups_before_init_find_nothing() {
        let formats = FormatsService::default();
        assert!(formats.is_empty());
        assert!(formats.get("gen9ou").is_none());
    }
}
