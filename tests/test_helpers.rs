//! Test helpers for the backup engine
//!
//! Builds an engine around one scripted in-memory provider (`primary`) and one
//! in-memory data store (`app`) so scenarios can inject failures and latency.

#![allow(dead_code)]

use anyhow::Result;
use backup_core::backup::encryption::{EncryptionSettings, EnvSecretResolver};
use backup_core::backup::retry::{BackoffStrategy, RetrySettings};
use backup_core::backup::source::{InMemoryDataStore, SourceRegistry};
use backup_core::backup::{
    BackupPolicy, BackupType, CompressionSettings, EntityRef, EventBus, InMemoryBackupRepository,
    JobOrchestrator, OrchestratorConfig, PolicyStore, RecordIndex, RestoreEngine,
    RetentionEngine, RetentionPolicy, SecretResolver,
};
use backup_core::monitoring::BackupMetrics;
use backup_core::storage::memory::MemoryProvider;
use backup_core::storage::replication::StorageBinding;
use backup_core::storage::{ProviderConfig, ProviderSettings, ReplicationMode, StorageManager};
use chrono::{Duration, Utc};
use std::sync::Arc;

pub const PROVIDER: &str = "primary";
pub const STORE: &str = "app";

/// Engine wired around in-memory collaborators
pub struct TestEnvironment {
    pub policies: Arc<PolicyStore>,
    pub storage: Arc<StorageManager>,
    pub provider: Arc<MemoryProvider>,
    pub store: Arc<InMemoryDataStore>,
    pub events: Arc<EventBus>,
    pub orchestrator: Arc<JobOrchestrator>,
    pub restores: Arc<RestoreEngine>,
    pub retention: Arc<RetentionEngine>,
    pub metrics: Arc<BackupMetrics>,
}

pub fn provider_config(name: &str) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        enabled: true,
        max_connections: 4,
        timeout_secs: 30,
        retries: 1,
        settings: ProviderSettings::Memory,
    }
}

/// Full backup of `app` into `primary`, fast retries, no encryption
pub fn policy(id: &str) -> BackupPolicy {
    BackupPolicy {
        id: id.to_string(),
        name: format!("{id} policy"),
        enabled: true,
        backup_type: BackupType::Full,
        max_concurrent_jobs: 4,
        timeout_secs: 60,
        retry: RetrySettings {
            strategy: BackoffStrategy::Exponential,
            max_retries: 3,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            jitter: false,
        },
        source: STORE.to_string(),
        storage: StorageBinding {
            primary: PROVIDER.to_string(),
            secondaries: Vec::new(),
            replication: ReplicationMode::None,
            best_effort: false,
            prefix: None,
        },
        schedules: Vec::new(),
        retention: RetentionPolicy::default(),
        encryption: EncryptionSettings::disabled(),
        compression: CompressionSettings::default(),
        verify_integrity: true,
    }
}

impl TestEnvironment {
    pub async fn new(policies: Vec<BackupPolicy>) -> Result<Self> {
        Self::with_config(OrchestratorConfig::default(), policies).await
    }

    pub async fn with_config(config: OrchestratorConfig, policies: Vec<BackupPolicy>) -> Result<Self> {
        let repository = Arc::new(InMemoryBackupRepository::new());
        let index = Arc::new(RecordIndex::new(repository));
        let events = Arc::new(EventBus::new(256));
        let metrics = Arc::new(BackupMetrics::new()?);

        let replication_retry = RetrySettings {
            strategy: BackoffStrategy::Exponential,
            max_retries: 3,
            initial_delay_ms: 5,
            max_delay_ms: 20,
            jitter: false,
        };
        let storage = Arc::new(StorageManager::new(index, events.clone(), replication_retry));
        let provider = Arc::new(MemoryProvider::new(PROVIDER));
        storage
            .register_provider(provider_config(PROVIDER), provider.clone())
            .await?;

        let store = Arc::new(InMemoryDataStore::new(STORE));
        let mut registry = SourceRegistry::new();
        registry.register_store(store.clone());
        let sources = Arc::new(registry);

        let policies = Arc::new(PolicyStore::with_policies(policies).await?);
        let secrets: Arc<dyn SecretResolver> = Arc::new(EnvSecretResolver);
        let restores = Arc::new(RestoreEngine::new(
            policies.clone(),
            storage.clone(),
            sources.clone(),
            secrets.clone(),
        ));
        let orchestrator = JobOrchestrator::new(
            config,
            policies.clone(),
            storage.clone(),
            sources,
            secrets.clone(),
            restores.clone(),
            events.clone(),
            metrics.clone(),
        );
        let retention = Arc::new(RetentionEngine::new(
            policies.clone(),
            storage.clone(),
            events.clone(),
            secrets,
        ));

        Ok(Self {
            policies,
            storage,
            provider,
            store,
            events,
            orchestrator,
            restores,
            retention,
            metrics,
        })
    }

    /// Inserts `count` contacts modified an hour ago
    pub async fn seed(&self, count: usize) {
        let modified_at = Utc::now() - Duration::hours(1);
        for i in 0..count {
            self.store
                .insert(
                    contact(i),
                    modified_at,
                    format!("contact #{i} with some payload to compress").into_bytes(),
                    Vec::new(),
                )
                .await;
        }
    }
}

pub fn contact(i: usize) -> EntityRef {
    EntityRef::new("crm", "contacts", format!("c{i:03}"))
}

/// Job id of an admission that started immediately
pub fn started(admission: &backup_core::Admission) -> uuid::Uuid {
    match admission {
        backup_core::Admission::Started { job_id } => *job_id,
        other => panic!("expected the job to start, got {other:?}"),
    }
}
