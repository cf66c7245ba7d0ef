//! Replication across a policy's storage providers.
//!
//! [`StorageManager`] owns the registered providers (each wrapped in a
//! [`PooledProvider`]), the write path used by backup jobs, read failover for
//! restores and verification, and the worker that completes asynchronous
//! replicas in the background.

use super::pool::PooledProvider;
use super::{
    build_provider, ConnectionTestResult, ProviderConfig, ProviderKind, StorageProvider,
    UploadHandle,
};
use crate::backup::events::{EventBus, LifecycleEvent};
use crate::backup::repository::RecordIndex;
use crate::backup::retry::{RetryPolicy, RetrySettings};
use crate::backup::{
    BackupError, BackupRecord, LocationRole, ReplicationStatus, Result, StoredLocation,
};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// Primary only
    #[default]
    None,
    /// Every secondary acknowledges before the job completes
    Sync,
    /// Secondaries are filled in by the replication worker
    Async,
}

/// Where a policy's backups are written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StorageBinding {
    pub primary: String,
    #[serde(default)]
    pub secondaries: Vec<String>,
    #[serde(default)]
    pub replication: ReplicationMode,
    /// In sync mode, a failing secondary is dropped instead of failing the job
    #[serde(default)]
    pub best_effort: bool,
    /// Key prefix; defaults to the policy id
    #[serde(default)]
    pub prefix: Option<String>,
}

impl StorageBinding {
    pub fn providers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.secondaries.iter().map(String::as_str))
    }
}

/// A registered provider as reported by `ListStorageProviders`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderStatus {
    pub name: String,
    pub kind: ProviderKind,
    pub enabled: bool,
    pub max_connections: usize,
    pub health: Option<ConnectionTestResult>,
}

#[derive(Debug)]
struct RegisteredProvider {
    config: ProviderConfig,
    provider: Arc<PooledProvider>,
}

#[derive(Debug, Clone)]
struct ReplicationTask {
    record_id: Uuid,
    policy_id: String,
    source: String,
    target: String,
    key: String,
}

#[derive(Debug)]
pub struct StorageManager {
    providers: RwLock<HashMap<String, RegisteredProvider>>,
    index: Arc<RecordIndex>,
    events: Arc<EventBus>,
    replication_retry: RetrySettings,
    queue_tx: mpsc::UnboundedSender<ReplicationTask>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<ReplicationTask>>>,
    pending: AtomicUsize,
    idle: Notify,
}

impl StorageManager {
    pub fn new(
        index: Arc<RecordIndex>,
        events: Arc<EventBus>,
        replication_retry: RetrySettings,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            providers: RwLock::new(HashMap::new()),
            index,
            events,
            replication_retry,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Validates `config`, builds its adapter and registers it.
    pub async fn register(&self, config: ProviderConfig) -> Result<()> {
        let provider = build_provider(&config)?;
        self.register_provider(config, provider).await
    }

    /// Registers an already-built adapter under `config`.
    pub async fn register_provider(
        &self,
        config: ProviderConfig,
        provider: Arc<dyn StorageProvider>,
    ) -> Result<()> {
        config.validate()?;
        let pooled = Arc::new(PooledProvider::from_config(provider, &config));
        let mut providers = self.providers.write().await;
        if providers.contains_key(&config.name) {
            return Err(BackupError::config(format!(
                "provider {} is already registered",
                config.name
            )));
        }
        info!(provider = %config.name, kind = ?config.kind(), "Storage provider registered");
        providers.insert(
            config.name.clone(),
            RegisteredProvider {
                config,
                provider: pooled,
            },
        );
        Ok(())
    }

    pub async fn provider(&self, name: &str) -> Result<Arc<PooledProvider>> {
        let providers = self.providers.read().await;
        let registered = providers.get(name).ok_or_else(|| BackupError::NotFound {
            entity: "storage provider",
            id: name.to_string(),
        })?;
        if !registered.config.enabled {
            return Err(BackupError::config(format!("provider {name} is disabled")));
        }
        Ok(registered.provider.clone())
    }

    pub async fn provider_config(&self, name: &str) -> Option<ProviderConfig> {
        self.providers
            .read()
            .await
            .get(name)
            .map(|r| r.config.clone())
    }

    pub async fn has_provider(&self, name: &str) -> bool {
        self.providers.read().await.contains_key(name)
    }

    pub fn index(&self) -> &Arc<RecordIndex> {
        &self.index
    }

    /// Opens uploads on the primary and, in sync mode, every secondary.
    pub async fn begin_write(&self, binding: &StorageBinding, key: &str) -> Result<WriteSession> {
        let primary = self.provider(&binding.primary).await?;
        let primary_handle = primary.begin_upload(key).await?;

        let mut session = WriteSession {
            key: key.to_string(),
            targets: vec![SessionTarget {
                provider: primary,
                handle: Some(primary_handle),
                role: LocationRole::Primary,
            }],
            deferred: Vec::new(),
            best_effort: binding.best_effort,
        };

        for name in &binding.secondaries {
            match binding.replication {
                ReplicationMode::None => {}
                ReplicationMode::Async => session.deferred.push(name.clone()),
                ReplicationMode::Sync => {
                    let opened = match self.provider(name).await {
                        Ok(provider) => provider
                            .begin_upload(key)
                            .await
                            .map(|handle| (provider, handle)),
                        Err(e) => Err(e),
                    };
                    match opened {
                        Ok((provider, handle)) => session.targets.push(SessionTarget {
                            provider,
                            handle: Some(handle),
                            role: LocationRole::Replica,
                        }),
                        Err(e) if binding.best_effort => {
                            warn!(provider = %name, error = %e, "Dropping secondary from sync write");
                        }
                        Err(e) => {
                            session.abort().await;
                            return Err(e);
                        }
                    }
                }
            }
        }

        Ok(session)
    }

    /// Queues copies for every pending replica location of `record`.
    pub fn enqueue_replication(&self, record: &BackupRecord) {
        let Some(primary) = record.primary_location() else {
            return;
        };
        for location in &record.locations {
            if location.status != ReplicationStatus::Pending {
                continue;
            }
            let task = ReplicationTask {
                record_id: record.id,
                policy_id: record.policy_id.clone(),
                source: primary.provider.clone(),
                target: location.provider.clone(),
                key: location.key.clone(),
            };
            self.pending.fetch_add(1, Ordering::SeqCst);
            if self.queue_tx.send(task).is_err() {
                self.finish_task();
                warn!(record_id = %record.id, "Replication queue closed");
            }
        }
    }

    pub fn pending_replications(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Resolves once no replication task is queued or running.
    pub async fn wait_for_replication(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn finish_task(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Starts the background replication worker. Only the first call gets the queue.
    pub async fn start_replication_worker(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let mut receiver = self.queue_rx.lock().await.take()?;
        let manager = Arc::clone(self);

        Some(tokio::spawn(async move {
            info!("Replication worker started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    task = receiver.recv() => {
                        let Some(task) = task else { break };
                        manager.replicate(task).await;
                        manager.finish_task();
                    }
                }
            }
            info!("Replication worker stopped");
        }))
    }

    #[instrument(skip(self, task), fields(record_id = %task.record_id, target = %task.target))]
    async fn replicate(&self, task: ReplicationTask) {
        let retry = RetryPolicy::new(self.replication_retry.clone());
        let outcome = retry
            .execute(|| self.copy_object(&task.source, &task.target, &task.key))
            .await;

        let (status, size) = match &outcome {
            Ok(size) => (ReplicationStatus::Completed, *size),
            Err(_) => (ReplicationStatus::Failed, 0),
        };

        let updated = self
            .index
            .update_with(task.record_id, |record| {
                for location in record.locations.iter_mut() {
                    if location.provider == task.target && location.key == task.key {
                        location.status = status;
                        if size > 0 {
                            location.size_bytes = size;
                        }
                    }
                }
            })
            .await;

        match (outcome, updated) {
            (Ok(_), Ok(_)) => debug!("Replica completed"),
            (Ok(_), Err(BackupError::NotFound { .. })) => {
                // record pruned while the copy was in flight
                if let Ok(provider) = self.provider(&task.target).await {
                    let _ = provider.delete(&task.key).await;
                }
            }
            (Ok(_), Err(e)) => error!(error = %e, "Failed to record replica status"),
            (Err(e), _) => {
                error!(error = %e, "Replication failed after retries");
                self.events.publish(LifecycleEvent::IntegrityAlert {
                    policy_id: Some(task.policy_id.clone()),
                    record_id: Some(task.record_id),
                    provider: Some(task.target.clone()),
                    message: format!("replication to {} failed: {e}", task.target),
                });
            }
        }
    }

    /// Copies one object between providers and returns the stored size.
    pub async fn copy_object(&self, source: &str, target: &str, key: &str) -> Result<u64> {
        let data = self.provider(source).await?.read(key).await?;
        self.provider(target).await?.write(key, data).await
    }

    /// Reads a record's payload, failing over across its readable locations.
    ///
    /// Each location gets its provider's `retries` attempts. `PROVIDER_UNAVAILABLE`
    /// is returned only when no location answers.
    pub async fn read_record(&self, record: &BackupRecord) -> Result<(Bytes, StoredLocation)> {
        let mut failures = Vec::new();
        let mut all_missing = true;

        for location in record.read_order() {
            let attempts = self
                .provider_config(&location.provider)
                .await
                .map(|c| c.retries.max(1))
                .unwrap_or(1);
            let provider = match self.provider(&location.provider).await {
                Ok(provider) => provider,
                Err(e) => {
                    all_missing = false;
                    failures.push(format!("{}: {e}", location.provider));
                    continue;
                }
            };

            for attempt in 1..=attempts {
                match provider.read(&location.key).await {
                    Ok(data) => {
                        if !failures.is_empty() {
                            warn!(
                                record_id = %record.id,
                                provider = %location.provider,
                                "Read served by failover location"
                            );
                        }
                        return Ok((data, location.clone()));
                    }
                    Err(e @ BackupError::NotFound { .. }) => {
                        failures.push(format!("{}: {e}", location.provider));
                        break;
                    }
                    Err(e) => {
                        all_missing = false;
                        debug!(provider = %location.provider, attempt, error = %e, "Read attempt failed");
                        if attempt == attempts || !e.is_retryable() {
                            failures.push(format!("{}: {e}", location.provider));
                            break;
                        }
                    }
                }
            }
        }

        if all_missing && !failures.is_empty() {
            return Err(BackupError::NotFound {
                entity: "backup payload",
                id: record.id.to_string(),
            });
        }
        Err(BackupError::unavailable(
            "*",
            format!(
                "no location of backup {} answered: {}",
                record.id,
                if failures.is_empty() {
                    "no readable locations".to_string()
                } else {
                    failures.join("; ")
                }
            ),
        ))
    }

    /// Deletes one location; a missing object counts as deleted.
    pub async fn delete_location(&self, location: &StoredLocation) -> Result<()> {
        match self.provider(&location.provider).await?.delete(&location.key).await {
            Ok(()) | Err(BackupError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Deletes every location of `record`. Succeeds only when every provider
    /// confirmed.
    pub async fn delete_record_objects(&self, record: &BackupRecord) -> Result<()> {
        let mut first_error = None;
        for location in &record.locations {
            if let Err(e) = self.delete_location(location).await {
                warn!(record_id = %record.id, provider = %location.provider, error = %e, "Delete not confirmed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Writes `data` under a fresh key next to every readable location of
    /// `record` and returns the record's locations pointing at the new copies.
    ///
    /// The existing objects are left untouched. When any write fails the
    /// copies already made are removed again and the error is returned.
    pub async fn stage_record_objects(
        &self,
        record: &BackupRecord,
        data: Bytes,
    ) -> Result<Vec<StoredLocation>> {
        let mut staged: Vec<StoredLocation> = Vec::new();
        let mut locations = record.locations.clone();

        for location in locations.iter_mut().filter(|l| l.is_readable()) {
            let key = recompressed_key(&location.key);
            let written = match self.provider(&location.provider).await {
                Ok(provider) => provider.write(&key, data.clone()).await,
                Err(e) => Err(e),
            };
            match written {
                Ok(size) => {
                    location.key = key;
                    location.size_bytes = size;
                    staged.push(location.clone());
                }
                Err(e) => {
                    warn!(
                        record_id = %record.id,
                        provider = %location.provider,
                        error = %e,
                        "Staging replacement payload failed, discarding staged copies"
                    );
                    self.discard_locations(record, &staged).await;
                    return Err(e);
                }
            }
        }
        Ok(locations)
    }

    /// Best-effort removal of objects no record points at any more.
    pub async fn discard_locations(&self, record: &BackupRecord, locations: &[StoredLocation]) {
        for location in locations {
            if let Err(e) = self.delete_location(location).await {
                warn!(
                    record_id = %record.id,
                    provider = %location.provider,
                    key = %location.key,
                    error = %e,
                    "Stale object left behind"
                );
            }
        }
    }

    /// Tests an arbitrary, possibly unregistered, provider configuration.
    pub async fn test_connection(&self, config: &ProviderConfig) -> ConnectionTestResult {
        let started = Instant::now();
        let outcome = match build_provider(config) {
            Ok(provider) => {
                let pooled = PooledProvider::from_config(provider, config);
                pooled.test_connection().await
            }
            Err(e) => Err(e),
        };
        connection_result(config, started, outcome)
    }

    /// Tests a registered provider and stores the result in the health cache.
    pub async fn test_registered(&self, name: &str) -> Result<ConnectionTestResult> {
        let (config, provider) = {
            let providers = self.providers.read().await;
            let registered = providers.get(name).ok_or_else(|| BackupError::NotFound {
                entity: "storage provider",
                id: name.to_string(),
            })?;
            (registered.config.clone(), registered.provider.clone())
        };

        let started = Instant::now();
        let result = connection_result(&config, started, provider.test_connection().await);
        self.index.repository().store_health(&result).await?;
        Ok(result)
    }

    pub async fn test_all(&self) -> Result<Vec<ConnectionTestResult>> {
        let names: Vec<String> = self.providers.read().await.keys().cloned().collect();
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            results.push(self.test_registered(&name).await?);
        }
        results.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(results)
    }

    pub async fn list_providers(&self) -> Result<Vec<ProviderStatus>> {
        let health: HashMap<String, ConnectionTestResult> = self
            .index
            .repository()
            .provider_health()
            .await?
            .into_iter()
            .map(|h| (h.provider.clone(), h))
            .collect();

        let providers = self.providers.read().await;
        let mut statuses: Vec<ProviderStatus> = providers
            .values()
            .map(|r| ProviderStatus {
                name: r.config.name.clone(),
                kind: r.config.kind(),
                enabled: r.config.enabled,
                max_connections: r.config.max_connections,
                health: health.get(&r.config.name).cloned(),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(statuses)
    }
}

/// Key for a re-encoded payload: `nightly/a.bkc` becomes `nightly/a.z.bkc`.
fn recompressed_key(key: &str) -> String {
    match key.rsplit_once('.') {
        Some((stem, ext)) if !ext.contains('/') => format!("{stem}.z.{ext}"),
        _ => format!("{key}.z"),
    }
}

fn connection_result(
    config: &ProviderConfig,
    started: Instant,
    outcome: Result<()>,
) -> ConnectionTestResult {
    let latency_ms = started.elapsed().as_millis() as u64;
    let (success, message) = match outcome {
        Ok(()) => (true, "connection ok".to_string()),
        Err(e) => (false, e.to_string()),
    };
    ConnectionTestResult {
        provider: config.name.clone(),
        kind: config.kind(),
        success,
        latency_ms,
        message,
        tested_at: Utc::now(),
    }
}

#[derive(Debug)]
struct SessionTarget {
    provider: Arc<PooledProvider>,
    handle: Option<UploadHandle>,
    role: LocationRole,
}

/// One backup payload being written to its primary and sync replicas.
#[derive(Debug)]
pub struct WriteSession {
    key: String,
    targets: Vec<SessionTarget>,
    deferred: Vec<String>,
    best_effort: bool,
}

impl WriteSession {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn write_part(&mut self, data: Bytes) -> Result<()> {
        let best_effort = self.best_effort;
        let mut dropped = Vec::new();

        for (position, target) in self.targets.iter_mut().enumerate() {
            let Some(handle) = target.handle.as_mut() else {
                continue;
            };
            if let Err(e) = target.provider.upload_part(handle, data.clone()).await {
                if target.role == LocationRole::Primary || !best_effort {
                    return Err(e);
                }
                warn!(provider = target.provider.name(), error = %e, "Dropping secondary from sync write");
                dropped.push(position);
            }
        }

        for position in dropped {
            let target = &mut self.targets[position];
            if let Some(handle) = target.handle.take() {
                let _ = target.provider.abort_upload(handle).await;
            }
        }
        Ok(())
    }

    /// Completes every open upload and returns the resulting locations.
    pub async fn complete(mut self) -> Result<Vec<StoredLocation>> {
        let mut locations: Vec<StoredLocation> = Vec::new();
        let mut committed: Vec<Arc<PooledProvider>> = Vec::new();

        for position in 0..self.targets.len() {
            let (provider, role, handle) = {
                let target = &mut self.targets[position];
                let Some(handle) = target.handle.take() else {
                    continue;
                };
                (target.provider.clone(), target.role, handle)
            };

            match provider.complete_upload(handle).await {
                Ok(size) => {
                    locations.push(StoredLocation {
                        provider: provider.name().to_string(),
                        key: self.key.clone(),
                        role,
                        status: ReplicationStatus::Completed,
                        size_bytes: size,
                    });
                    committed.push(provider);
                }
                Err(e) if role == LocationRole::Replica && self.best_effort => {
                    warn!(provider = provider.name(), error = %e, "Secondary failed to complete");
                }
                Err(e) => {
                    self.abort().await;
                    for provider in committed {
                        if let Err(cleanup) = provider.delete(&self.key).await {
                            warn!(provider = provider.name(), error = %cleanup, "Failed to remove committed copy");
                        }
                    }
                    return Err(e);
                }
            }
        }

        let primary_size = locations.first().map(|l| l.size_bytes).unwrap_or(0);
        for name in &self.deferred {
            locations.push(StoredLocation {
                provider: name.clone(),
                key: self.key.clone(),
                role: LocationRole::Replica,
                status: ReplicationStatus::Pending,
                size_bytes: primary_size,
            });
        }
        Ok(locations)
    }

    /// Aborts every open upload. Failures are logged, not returned.
    pub async fn abort(&mut self) {
        for target in self.targets.iter_mut() {
            if let Some(handle) = target.handle.take() {
                if let Err(e) = target.provider.abort_upload(handle).await {
                    warn!(provider = target.provider.name(), error = %e, "Failed to abort upload");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::repository::InMemoryBackupRepository;
    use crate::storage::memory::MemoryProvider;
    use crate::storage::ProviderSettings;

    fn memory_config(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            enabled: true,
            max_connections: 2,
            timeout_secs: 5,
            retries: 2,
            settings: ProviderSettings::Memory,
        }
    }

    async fn manager_with(
        names: &[&str],
    ) -> (Arc<StorageManager>, HashMap<String, Arc<MemoryProvider>>) {
        let index = Arc::new(RecordIndex::new(Arc::new(InMemoryBackupRepository::new())));
        let retry = RetrySettings {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            ..RetrySettings::default()
        };
        let manager = Arc::new(StorageManager::new(index, Arc::new(EventBus::default()), retry));
        let mut providers = HashMap::new();
        for name in names {
            let provider = Arc::new(MemoryProvider::new(name));
            manager
                .register_provider(memory_config(name), provider.clone())
                .await
                .unwrap();
            providers.insert(name.to_string(), provider);
        }
        (manager, providers)
    }

    fn binding(mode: ReplicationMode, best_effort: bool) -> StorageBinding {
        StorageBinding {
            primary: "primary".to_string(),
            secondaries: vec!["replica".to_string()],
            replication: mode,
            best_effort,
            prefix: None,
        }
    }

    #[tokio::test]
    async fn test_sync_write_lands_on_every_provider() {
        let (manager, providers) = manager_with(&["primary", "replica"]).await;
        let mut session = manager
            .begin_write(&binding(ReplicationMode::Sync, false), "p/a.bkc")
            .await
            .unwrap();
        session.write_part(Bytes::from_static(b"payload")).await.unwrap();
        let locations = session.complete().await.unwrap();

        assert_eq!(locations.len(), 2);
        assert!(locations.iter().all(|l| l.status == ReplicationStatus::Completed));
        assert!(providers["primary"].contains("p/a.bkc"));
        assert!(providers["replica"].contains("p/a.bkc"));
    }

    #[tokio::test]
    async fn test_sync_write_fails_when_required_secondary_fails() {
        let (manager, providers) = manager_with(&["primary", "replica"]).await;
        providers["replica"].fail_next_writes(1);

        let mut session = manager
            .begin_write(&binding(ReplicationMode::Sync, false), "p/a.bkc")
            .await
            .unwrap();
        let result = session.write_part(Bytes::from_static(b"payload")).await;
        assert!(result.is_err());
        session.abort().await;

        assert!(!providers["primary"].contains("p/a.bkc"));
        assert_eq!(providers["primary"].in_flight_uploads(), 0);
    }

    #[tokio::test]
    async fn test_best_effort_drops_failing_secondary() {
        let (manager, providers) = manager_with(&["primary", "replica"]).await;
        providers["replica"].fail_next_writes(1);

        let mut session = manager
            .begin_write(&binding(ReplicationMode::Sync, true), "p/a.bkc")
            .await
            .unwrap();
        session.write_part(Bytes::from_static(b"payload")).await.unwrap();
        let locations = session.complete().await.unwrap();

        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].provider, "primary");
    }

    #[tokio::test]
    async fn test_async_write_defers_secondaries() {
        let (manager, providers) = manager_with(&["primary", "replica"]).await;
        let mut session = manager
            .begin_write(&binding(ReplicationMode::Async, false), "p/a.bkc")
            .await
            .unwrap();
        session.write_part(Bytes::from_static(b"payload")).await.unwrap();
        let locations = session.complete().await.unwrap();

        assert_eq!(locations[1].status, ReplicationStatus::Pending);
        assert!(!providers["replica"].contains("p/a.bkc"));
    }

    #[tokio::test]
    async fn test_copy_object_between_providers() {
        let (manager, providers) = manager_with(&["primary", "replica"]).await;
        providers["primary"]
            .write("k", Bytes::from_static(b"data"))
            .await
            .unwrap();
        let size = manager.copy_object("primary", "replica", "k").await.unwrap();
        assert_eq!(size, 4);
        assert!(providers["replica"].contains("k"));
    }

    #[tokio::test]
    async fn test_unknown_provider_connection_test_reports_failure() {
        let (manager, _) = manager_with(&[]).await;
        let mut config = memory_config("broken");
        config.max_connections = 0;
        let result = manager.test_connection(&config).await;
        assert!(!result.success);
        assert!(result.message.contains("max_connections"));
    }

    fn replicated_record() -> BackupRecord {
        let mut record = crate::backup::fixtures::record("p", 1, 3);
        record.locations = vec![
            StoredLocation {
                provider: "primary".to_string(),
                key: "p/a.bkc".to_string(),
                role: LocationRole::Primary,
                status: ReplicationStatus::Completed,
                size_bytes: 3,
            },
            StoredLocation {
                provider: "replica".to_string(),
                key: "p/a.bkc".to_string(),
                role: LocationRole::Replica,
                status: ReplicationStatus::Completed,
                size_bytes: 3,
            },
        ];
        record
    }

    #[test]
    fn test_recompressed_keys_keep_their_extension() {
        assert_eq!(recompressed_key("p/a.bkc"), "p/a.z.bkc");
        assert_eq!(recompressed_key("v1.2/blob"), "v1.2/blob.z");
    }

    #[tokio::test]
    async fn test_staged_objects_leave_originals_in_place() {
        let (manager, providers) = manager_with(&["primary", "replica"]).await;
        for provider in providers.values() {
            provider.write("p/a.bkc", Bytes::from_static(b"old")).await.unwrap();
        }
        let record = replicated_record();

        let locations = manager
            .stage_record_objects(&record, Bytes::from_static(b"new!"))
            .await
            .unwrap();

        assert!(locations.iter().all(|l| l.key == "p/a.z.bkc" && l.size_bytes == 4));
        for provider in providers.values() {
            assert!(provider.contains("p/a.bkc"));
            assert!(provider.contains("p/a.z.bkc"));
        }
    }

    #[tokio::test]
    async fn test_failed_staging_removes_partial_copies() {
        let (manager, providers) = manager_with(&["primary", "replica"]).await;
        for provider in providers.values() {
            provider.write("p/a.bkc", Bytes::from_static(b"old")).await.unwrap();
        }
        providers["replica"].fail_next_writes(1);

        let result = manager
            .stage_record_objects(&replicated_record(), Bytes::from_static(b"new!"))
            .await;

        assert!(result.is_err());
        for provider in providers.values() {
            assert_eq!(provider.read("p/a.bkc").await.unwrap(), Bytes::from_static(b"old"));
            assert!(!provider.contains("p/a.z.bkc"));
        }
    }
}
