use crate::{
    api::AppState,
    backup::{
        encryption::EnvSecretResolver,
        repository::PostgresBackupRepository,
        source::{DirectoryStore, InMemoryDataStore, SourceRegistry},
        BackupRepository, Clock, EventBus, InMemoryBackupRepository, JobOrchestrator,
        PolicyStore, RecordIndex, RestoreEngine, RetentionEngine, RetentionOutcome, SchedulerService,
        SecretResolver, SystemClock, VerificationService,
    },
    config::SourceConfig,
    monitoring::{BackupMetrics, HealthChecker, HealthStatus},
    storage::{LifecycleService, StorageManager},
    Config,
};
use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};

const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Dependency injection container for the application
pub struct DependencyContainer {
    // Core configuration
    pub config: Config,

    // Persistence
    pub db_pool: Option<Arc<PgPool>>,
    pub repository: Arc<dyn BackupRepository>,
    pub index: Arc<RecordIndex>,

    // Engine
    pub events: Arc<EventBus>,
    pub storage: Arc<StorageManager>,
    pub policies: Arc<PolicyStore>,
    pub sources: Arc<SourceRegistry>,
    pub secrets: Arc<dyn SecretResolver>,
    pub restores: Arc<RestoreEngine>,
    pub orchestrator: Arc<JobOrchestrator>,
    pub retention: Arc<RetentionEngine>,
    pub lifecycle: Arc<LifecycleService>,
    pub verification: Arc<VerificationService>,
    pub scheduler: Arc<SchedulerService>,

    // Infrastructure
    pub metrics: Arc<BackupMetrics>,
    pub health_checker: Arc<HealthChecker>,
}

impl DependencyContainer {
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        info!("Initializing dependency container...");
        config.validate()?;

        let (db_pool, repository): (Option<Arc<PgPool>>, Arc<dyn BackupRepository>) =
            match &config.database.url {
                Some(url) => {
                    info!(
                        database = %config.safe_database_url().unwrap_or_default(),
                        "Using PostgreSQL record index"
                    );
                    let pool = Arc::new(
                        PgPoolOptions::new()
                            .max_connections(config.database.max_connections)
                            .connect(url)
                            .await?,
                    );
                    (
                        Some(pool.clone()),
                        Arc::new(PostgresBackupRepository::new(pool)),
                    )
                }
                None => {
                    info!("No database configured, record index is in memory");
                    (None, Arc::new(InMemoryBackupRepository::new()))
                }
            };
        repository.initialize().await?;

        let index = Arc::new(RecordIndex::new(repository.clone()));
        let events = Arc::new(EventBus::new(EVENT_QUEUE_CAPACITY));
        let metrics = Arc::new(BackupMetrics::new()?);

        let storage = Arc::new(StorageManager::new(
            index.clone(),
            events.clone(),
            config.replication_retry.clone(),
        ));
        for provider in &config.providers {
            if !provider.enabled {
                warn!(provider = %provider.name, "Storage provider disabled, not registered");
                continue;
            }
            storage.register(provider.clone()).await?;
        }

        let policies = Arc::new(PolicyStore::with_policies(config.policies.clone()).await?);
        let sources = Arc::new(Self::create_sources(&config.sources));
        let secrets: Arc<dyn SecretResolver> = Arc::new(EnvSecretResolver);

        let restores = Arc::new(RestoreEngine::new(
            policies.clone(),
            storage.clone(),
            sources.clone(),
            secrets.clone(),
        ));
        let orchestrator = JobOrchestrator::new(
            config.orchestrator.clone(),
            policies.clone(),
            storage.clone(),
            sources.clone(),
            secrets.clone(),
            restores.clone(),
            events.clone(),
            metrics.clone(),
        );
        let retention = Arc::new(RetentionEngine::new(
            policies.clone(),
            storage.clone(),
            events.clone(),
            secrets.clone(),
        ));
        let lifecycle = Arc::new(LifecycleService::new(
            storage.clone(),
            config.lifecycle_rules.clone(),
        ));
        let verification = Arc::new(VerificationService::new(
            config.verification.clone(),
            policies.clone(),
            storage.clone(),
            secrets.clone(),
            events.clone(),
            metrics.clone(),
        ));
        let scheduler = Arc::new(SchedulerService::new(
            clock,
            policies.clone(),
            orchestrator.clone(),
            events.clone(),
            config.scheduler.maintenance_window.clone(),
        ));
        let health_checker = Arc::new(HealthChecker::new(storage.clone(), orchestrator.clone()));

        info!(
            providers = config.providers.len(),
            policies = config.policies.len(),
            "Dependency container initialized"
        );

        Ok(Self {
            config,
            db_pool,
            repository,
            index,
            events,
            storage,
            policies,
            sources,
            secrets,
            restores,
            orchestrator,
            retention,
            lifecycle,
            verification,
            scheduler,
            metrics,
            health_checker,
        })
    }

    fn create_sources(configs: &[SourceConfig]) -> SourceRegistry {
        let mut registry = SourceRegistry::new();
        for source in configs {
            match source {
                SourceConfig::Directory { name, root } => {
                    registry.register_store(Arc::new(DirectoryStore::new(name, root)));
                }
                SourceConfig::Memory { name } => {
                    registry.register_store(Arc::new(InMemoryDataStore::new(name)));
                }
            }
        }
        registry
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            policies: self.policies.clone(),
            orchestrator: self.orchestrator.clone(),
            restores: self.restores.clone(),
            retention: self.retention.clone(),
            storage: self.storage.clone(),
            health: self.health_checker.clone(),
            metrics: self.metrics.clone(),
        }
    }

    pub fn record_retention(&self, outcome: &RetentionOutcome) {
        self.metrics
            .retention_deleted_total
            .inc_by(outcome.deleted.len() as u64);
        self.metrics
            .retention_archived_total
            .inc_by(outcome.archived.len() as u64);
        if !outcome.deleted.is_empty() || !outcome.archived.is_empty() {
            info!(
                policy_id = %outcome.policy_id,
                deleted = outcome.deleted.len(),
                archived = outcome.archived.len(),
                compressed = outcome.compressed.len(),
                "Retention applied"
            );
        }
    }

    /// False only when a component is unhealthy
    pub async fn health_check(&self) -> Result<bool> {
        let health = self.health_checker.check_system_health().await?;
        Ok(health.status != HealthStatus::Unhealthy)
    }
}
