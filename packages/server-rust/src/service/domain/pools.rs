//! The two pool-owning subsystems.
//!
//! Both detach the parent channel before spawning anything, so no worker
//! can inherit it regardless of which pool starts first.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arena_core::WorkerKind;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::formats::FormatsService;
use super::names;
use crate::pool::{PoolConfig, PoolError, WorkerPool};
use crate::service::registry::{ManagedService, ServiceContext};

/// A pool started by a subsystem initializer.
#[derive(Default)]
struct OwnedPool {
    pool: OnceLock<Arc<WorkerPool>>,
}

impl OwnedPool {
    fn start(&self, ctx: &ServiceContext, name: &'static str, kind: WorkerKind, size: usize) -> anyhow::Result<()> {
        ctx.parent_channel.detach();
        let config = ctx.config.current();
        let pool_config = PoolConfig {
            dispatch_timeout: config.dispatch_timeout_ms.map(Duration::from_millis),
            ..PoolConfig::new(name, size)
        };
        let pool = self
            .pool
            .get_or_init(|| Arc::new(WorkerPool::new(pool_config, ctx.spawners.spawner(kind))));
        pool.spawn(None)?;
        Ok(())
    }

    fn get(&self) -> Result<&Arc<WorkerPool>, PoolError> {
        self.pool.get().ok_or(PoolError::PoolClosed)
    }

    async fn shutdown(&self) {
        if let Some(pool) = self.pool.get() {
            pool.shutdown().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

/// Signature verification pool.
#[derive(Default)]
pub struct VerifierService {
    owned: OwnedPool,
}

impl VerifierService {
    #[must_use]
    pub fn pool(&self) -> Option<&Arc<WorkerPool>> {
        self.owned.pool.get()
    }

    /// Checks `data` against a hex SHA-256 digest on a verifier worker.
    ///
    /// # Errors
    ///
    /// Any `PoolError` from dispatch.
    pub async fn verify(&self, data: &str, digest: &str) -> Result<bool, PoolError> {
        let result = self
            .owned
            .get()?
            .dispatch(json!({ "data": data, "digest": digest }))
            .await?;
        Ok(result["valid"].as_bool().unwrap_or(false))
    }
}

#[async_trait]
impl ManagedService for VerifierService {
    fn name(&self) -> &'static str {
        names::VERIFIER
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[names::ROOMS]
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let size = ctx.config.current().verifier_processes;
        self.owned.start(ctx, names::VERIFIER, WorkerKind::Verifier, size)
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        self.owned.shutdown().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Team validation pool.
#[derive(Default)]
pub struct ValidatorService {
    owned: OwnedPool,
    formats: OnceLock<Arc<FormatsService>>,
}

impl ValidatorService {
    #[must_use]
    pub fn pool(&self) -> Option<&Arc<WorkerPool>> {
        self.owned.pool.get()
    }

    /// Validates a team for a known format on a validator worker.
    ///
    /// # Errors
    ///
    /// `PoolError::Task` for an unknown format, otherwise any `PoolError`
    /// from dispatch.
    pub async fn validate(&self, format: &str, team: &[String]) -> Result<Value, PoolError> {
        let known = self
            .formats
            .get()
            .and_then(|formats| formats.get(format))
            .ok_or_else(|| PoolError::Task(format!("unknown format: {format}")))?;
        self.owned
            .get()?
            .dispatch(json!({ "format": known.id, "team": team }))
            .await
    }
}

#[async_trait]
impl ManagedService for ValidatorService {
    fn name(&self) -> &'static str {
        names::VALIDATOR
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[names::FORMATS]
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let formats = ctx
            .services
            .get::<FormatsService>()
            .ok_or_else(|| anyhow::anyhow!("format table is not available"))?;
        if self.formats.set(formats).is_err() {
            anyhow::bail!("validator initialized twice");
        }
        let size = ctx.config.current().validator_processes;
        self.owned.start(ctx, names::VALIDATOR, WorkerKind::Validator, size)
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        self.owned.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use arena_core::Config;
    use sha2::{Digest, Sha256};

    use super::*;
    use crate::ipc::ParentChannel;
    use crate::service::domain::ToolsService;
    use crate::testing::test_context;

    #[tokio::test]
    async fn verifier_detaches_parent_channel_and_verifies() {
        let mut ctx = test_context(Config {
            verifier_processes: 2,
            ..Config::default()
        });
        ctx.parent_channel = Arc::new(ParentChannel::attached("fd:3"));
        let verifier = VerifierService::default();

        verifier.init(&ctx).await.unwrap();

        assert!(!ctx.parent_channel.is_attached());
        assert_eq!(verifier.pool().unwrap().states().len(), 2);
        let digest = hex::encode(Sha256::digest(b"hello"));
        assert!(verifier.verify("hello", &digest).await.unwrap());
        assert!(!verifier.verify("hullo", &digest).await.unwrap());

        verifier.shutdown(false).await.unwrap();
        assert!(verifier.pool().unwrap().is_closed());
    }

    #[tokio::test]
    async fn validator_uses_the_format_table() {
        let ctx = test_context(Config {
            formats: vec!["[Gen 9] OU".to_string()],
            ..Config::default()
        });
        ctx.services.register(ToolsService).unwrap();
        ctx.services.register(FormatsService::default()).unwrap();
        ctx.services.register(ValidatorService::default()).unwrap();
        ctx.services.init_all(&ctx).await.unwrap();
        let validator = ctx.services.get::<ValidatorService>().unwrap();

        let result = validator
            .validate("gen9ou", &["Mew".to_string(), "Mewtwo".to_string()])
            .await
            .unwrap();
        assert_eq!(result["valid"], json!(true));
        assert_eq!(result["format"], json!("gen9ou"));

        let unknown = validator.validate("gen1ubers", &["Mew".to_string()]).await;
        assert!(matches!(unknown, Err(PoolError::Task(_))));

        ctx.services.shutdown_all(false).await.unwrap();
    }

    #[tokio::test]
    async fn validator_refuses_second_init() {
        let ctx = test_context(Config::default());
        ctx.services.register(ToolsService).unwrap();
        ctx.services.register(FormatsService::default()).unwrap();
        ctx.services.init_all(&ctx).await.unwrap();
        let validator = ValidatorService::default();

        validator.init(&ctx).await.unwrap();
        let err = validator.init(&ctx).await.unwrap_err();

        assert!(err.to_string().contains("twice"));
        assert_eq!(validator.pool().unwrap().states().len(), 1);
        validator.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn verify_before_init_reports_closed_pool() {
        let verifier = VerifierService::default();
        assert_eq!(verifier.verify("x", "00").await, Err(PoolError::PoolClosed));
    }
}
