use std::sync::Arc;

use chrono::Duration;
use sqlx::PgPool;
use tracing::{info, warn};

use flagsched_infra::audit::{AuditSink, TracingAuditSink};
use flagsched_infra::migrations::apply_migrations;
use flagsched_infra::flags::{
    FlagCache, FlagRepository, InMemoryFlagCache, InMemoryFlagRepository, PostgresFlagRepository,
};
use flagsched_infra::schedules::{
    InMemoryScheduleStore, PostgresScheduleStore, RunOrchestrator, RunnerConfig, ScheduleStore,
};

use crate::config::JobConfig;

/// Everything the handlers need.
pub struct AppServices {
    pub runner: RunOrchestrator<Arc<dyn ScheduleStore>>,
}

impl AppServices {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        flags: Arc<dyn FlagRepository>,
        cache: Arc<dyn FlagCache>,
        audit: Arc<dyn AuditSink>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            runner: RunOrchestrator::new(store, flags, cache, audit).with_config(config),
        }
    }

    /// Wire the job against in-memory backends.
    pub fn in_memory(backends: &InMemoryBackends, audit: Arc<dyn AuditSink>, config: RunnerConfig) -> Self {
        Self::new(
            backends.schedules.clone(),
            backends.flags.clone(),
            backends.cache.clone(),
            audit,
            config,
        )
    }
}

/// In-memory stores, kept by the caller for seeding and inspection.
#[derive(Debug, Clone)]
pub struct InMemoryBackends {
    pub schedules: Arc<InMemoryScheduleStore>,
    pub flags: Arc<InMemoryFlagRepository>,
    pub cache: Arc<InMemoryFlagCache>,
}

impl InMemoryBackends {
    pub fn new(claim_lease: Duration) -> Self {
        Self {
            schedules: Arc::new(InMemoryScheduleStore::new().with_lease(claim_lease)),
            flags: Arc::new(InMemoryFlagRepository::new()),
            cache: Arc::new(InMemoryFlagCache::new()),
        }
    }
}

/// Build services from configuration: Postgres when `DATABASE_URL` is set
/// (schema applied on connect), otherwise in-memory stores (dev only, state
/// is lost on restart).
pub async fn build_services(config: &JobConfig) -> Result<AppServices, sqlx::Error> {
    let runner_config = RunnerConfig::default().with_batch_limit(config.batch_limit);
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);

    let Some(database_url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set; using in-memory schedule and flag stores");
        let backends = InMemoryBackends::new(config.claim_lease);
        return Ok(AppServices::in_memory(&backends, audit, runner_config));
    };

    let pool = PgPool::connect(database_url).await?;
    apply_migrations(&pool).await?;
    info!(batch_limit = config.batch_limit, "connected to Postgres");

    Ok(AppServices::new(
        Arc::new(PostgresScheduleStore::new(pool.clone()).with_lease(config.claim_lease)),
        Arc::new(PostgresFlagRepository::new(pool)),
        Arc::new(InMemoryFlagCache::new()),
        audit,
        runner_config,
    ))
}
