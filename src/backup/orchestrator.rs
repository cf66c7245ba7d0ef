//! Admits, runs and finalizes backup and restore jobs.
//!
//! All bookkeeping lives in one mutex-guarded `State`: the job table, the
//! policy -> running job map that serialises jobs of one policy, and the
//! global FIFO of admitted-but-waiting work. Jobs run on spawned tasks and
//! never hold that mutex across an await.

use super::encryption::{derive_keys, random_salt, SecretResolver};
use super::events::{EventBus, LifecycleEvent, ProgressReporter};
use super::job::{
    BackupJob, JobControl, JobError, JobHandle, JobKind, JobStage, JobStatus, ProgressSnapshot,
    RestoreJob, Trigger,
};
use super::pipeline::PipelineWriter;
use super::policy::{BackupPolicy, PolicyStore};
use super::repository::JobLogEntry;
use super::restore::{RestoreEngine, RestoreRequest};
use super::retry::RetryPolicy;
use super::source::{BackupSource, SnapshotRequest, SourceRegistry, SourceSnapshot};
use super::{BackupError, BackupRecord, BackupType, Result};
use crate::monitoring::BackupMetrics;
use crate::storage::StorageManager;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Hold the trigger in the bounded FIFO
    #[default]
    Queue,
    /// Drop the trigger
    Skip,
    /// Cancel a lower-priority running job of the same policy
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub max_concurrent_jobs: usize,
    pub conflict_resolution: ConflictResolution,
    pub max_queue: usize,
    pub progress_interval_ms: u64,
    /// Finished jobs kept in memory; older ones are only in the job log
    pub job_history: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            conflict_resolution: ConflictResolution::Queue,
            max_queue: 16,
            progress_interval_ms: 1_000,
            job_history: 256,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(BackupError::config(
                "orchestrator.max_concurrent_jobs must be > 0",
            ));
        }
        if self.job_history == 0 {
            return Err(BackupError::config("orchestrator.job_history must be > 0"));
        }
        Ok(())
    }
}

/// Result of submitting work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "admission", rename_all = "snake_case")]
pub enum Admission {
    Started { job_id: Uuid },
    Queued { job_id: Uuid, position: usize },
    Rejected { reason: String },
}

impl Admission {
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            Admission::Started { job_id } | Admission::Queued { job_id, .. } => Some(*job_id),
            Admission::Rejected { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Work {
    Backup(Uuid),
    Restore(Uuid),
}

struct BackupEntry {
    job: BackupJob,
    policy: BackupPolicy,
    handle: JobHandle,
    control: Option<JobControl>,
    progress: Option<Arc<Mutex<ProgressSnapshot>>>,
}

struct RestoreEntry {
    job: RestoreJob,
    timeout: Duration,
    handle: JobHandle,
    control: Option<JobControl>,
    progress: Option<Arc<Mutex<ProgressSnapshot>>>,
}

#[derive(Default)]
struct State {
    /// policy id -> its running backup
    running: HashMap<String, Uuid>,
    running_count: usize,
    queue: VecDeque<Work>,
    backups: HashMap<Uuid, BackupEntry>,
    restores: HashMap<Uuid, RestoreEntry>,
}

impl State {
    fn admitted_for(&self, policy_id: &str) -> usize {
        let queued = self
            .queue
            .iter()
            .filter(|work| match work {
                Work::Backup(id) => self
                    .backups
                    .get(id)
                    .is_some_and(|e| e.job.policy_id == policy_id),
                Work::Restore(_) => false,
            })
            .count();
        queued + usize::from(self.running.contains_key(policy_id))
    }

    /// Drops the oldest finished jobs beyond `keep` per job table.
    fn evict_finished(&mut self, keep: usize) {
        let backups = evict_oldest_finished(&mut self.backups, keep, |e| {
            e.job.status.is_terminal().then(|| e.job.finished_at.unwrap_or(e.job.created_at))
        });
        let restores = evict_oldest_finished(&mut self.restores, keep, |e| {
            e.job.status.is_terminal().then(|| e.job.finished_at.unwrap_or(e.job.created_at))
        });
        if backups + restores > 0 {
            debug!(backups, restores, "Evicted finished jobs from memory");
        }
    }

    fn handle(&self, job_id: Uuid) -> Option<&JobHandle> {
        self.backups
            .get(&job_id)
            .map(|e| &e.handle)
            .or_else(|| self.restores.get(&job_id).map(|e| &e.handle))
    }
}

fn evict_oldest_finished<E>(
    jobs: &mut HashMap<Uuid, E>,
    keep: usize,
    finished_at: impl Fn(&E) -> Option<DateTime<Utc>>,
) -> usize {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = jobs
        .iter()
        .filter_map(|(id, entry)| finished_at(entry).map(|at| (at, *id)))
        .collect();
    let excess = finished.len().saturating_sub(keep);
    finished.sort();
    for (_, id) in finished.iter().take(excess) {
        jobs.remove(id);
    }
    excess
}

fn latest(progress: &Option<Arc<Mutex<ProgressSnapshot>>>) -> Option<ProgressSnapshot> {
    progress
        .as_ref()
        .map(|shared| shared.lock().unwrap_or_else(|e| e.into_inner()).clone())
}

pub struct JobOrchestrator {
    config: OrchestratorConfig,
    policies: Arc<PolicyStore>,
    storage: Arc<StorageManager>,
    sources: Arc<SourceRegistry>,
    secrets: Arc<dyn SecretResolver>,
    restores: Arc<RestoreEngine>,
    events: Arc<EventBus>,
    metrics: Arc<BackupMetrics>,
    state: Mutex<State>,
    finished: Notify,
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        policies: Arc<PolicyStore>,
        storage: Arc<StorageManager>,
        sources: Arc<SourceRegistry>,
        secrets: Arc<dyn SecretResolver>,
        restores: Arc<RestoreEngine>,
        events: Arc<EventBus>,
        metrics: Arc<BackupMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            policies,
            storage,
            sources,
            secrets,
            restores,
            events,
            metrics,
            state: Mutex::new(State::default()),
            finished: Notify::new(),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reject(&self, policy_id: &str, reason: String) -> Admission {
        warn!(policy_id = %policy_id, reason = %reason, "Trigger rejected");
        self.metrics.jobs_rejected_total.inc();
        self.events.publish(LifecycleEvent::TriggerSkipped {
            policy_id: policy_id.to_string(),
            reason: reason.clone(),
        });
        Admission::Rejected { reason }
    }

    /// Admits a backup of `policy_id`, starting it now when its policy is
    /// idle and a worker slot is free, otherwise resolving the conflict.
    #[instrument(skip(self))]
    pub async fn submit_backup(self: &Arc<Self>, policy_id: &str, trigger: Trigger) -> Result<Admission> {
        let policy = self.policies.get(policy_id).await?;
        if !policy.enabled {
            return Err(BackupError::config(format!("policy {policy_id} is disabled")));
        }
        self.sources.source(&policy.source)?;

        let job = BackupJob::new(&policy.id, policy.backup_type, trigger);
        let job_id = job.id;
        let (handle, control) = JobHandle::new();

        let mut guard = self.state();
        let state = &mut *guard;
        let policy_busy = state.running.contains_key(&policy.id);
        let slots_full = state.running_count >= self.config.max_concurrent_jobs;

        let admission = if !policy_busy && !slots_full {
            Admission::Started { job_id }
        } else {
            match self.config.conflict_resolution {
                ConflictResolution::Skip => {
                    let reason = if policy_busy {
                        format!("policy {} already has a running job", policy.id)
                    } else {
                        "concurrency limit reached".to_string()
                    };
                    return Ok(self.reject(&policy.id, reason));
                }
                ConflictResolution::Queue | ConflictResolution::Cancel => {
                    if state.admitted_for(&policy.id) >= policy.max_concurrent_jobs {
                        let reason = format!(
                            "policy {} already has {} admitted jobs",
                            policy.id, policy.max_concurrent_jobs
                        );
                        return Ok(self.reject(&policy.id, reason));
                    }
                    if state.queue.len() >= self.config.max_queue {
                        let reason = format!("queue is full ({} jobs)", self.config.max_queue);
                        return Ok(self.reject(&policy.id, reason));
                    }

                    let preempt = self.config.conflict_resolution == ConflictResolution::Cancel
                        && state
                            .running
                            .get(&policy.id)
                            .and_then(|running| state.backups.get(running))
                            .is_some_and(|e| e.job.trigger.priority() < job.trigger.priority());

                    if preempt {
                        if let Some(running) = state
                            .running
                            .get(&policy.id)
                            .and_then(|id| state.backups.get(id))
                        {
                            info!(policy_id = %policy.id, cancelled = %running.job.id, "Cancelling lower-priority job");
                            running.handle.cancel();
                        }
                        state.queue.push_front(Work::Backup(job_id));
                        Admission::Queued {
                            job_id,
                            position: 1,
                        }
                    } else {
                        state.queue.push_back(Work::Backup(job_id));
                        Admission::Queued {
                            job_id,
                            position: state.queue.len(),
                        }
                    }
                }
            }
        };

        state.backups.insert(
            job_id,
            BackupEntry {
                job,
                policy,
                handle,
                control: Some(control),
                progress: None,
            },
        );
        self.metrics.jobs_submitted_total.inc();
        self.events.publish(LifecycleEvent::JobCreated {
            job_id,
            kind: JobKind::Backup,
            policy_id: policy_id.to_string(),
        });

        match &admission {
            Admission::Started { .. } => {
                self.start_locked(state, Work::Backup(job_id));
            }
            Admission::Queued { position, .. } => {
                info!(job_id = %job_id, policy_id = %policy_id, position, "Backup job queued");
            }
            Admission::Rejected { .. } => {}
        }
        self.metrics.jobs_queued.set(state.queue.len() as i64);
        Ok(admission)
    }

    /// Admits a restore whose preview was accepted. Restores take a worker
    /// slot but not the policy lock.
    #[instrument(skip(self, request), fields(backup_id = %request.backup_id))]
    pub async fn submit_restore(self: &Arc<Self>, request: RestoreRequest) -> Result<Admission> {
        let job = self.restores.accept(&request).await?;
        let timeout_secs = match self.policies.get(&job.policy_id).await {
            Ok(policy) => policy.timeout_secs,
            Err(_) => super::policy::DEFAULT_TIMEOUT_SECS,
        };
        let job_id = job.id;
        let policy_id = job.policy_id.clone();
        let (handle, control) = JobHandle::new();

        let mut guard = self.state();
        let state = &mut *guard;
        let admission = if state.running_count < self.config.max_concurrent_jobs {
            Admission::Started { job_id }
        } else if state.queue.len() < self.config.max_queue {
            state.queue.push_back(Work::Restore(job_id));
            Admission::Queued {
                job_id,
                position: state.queue.len(),
            }
        } else {
            let reason = format!("queue is full ({} jobs)", self.config.max_queue);
            return Ok(self.reject(&policy_id, reason));
        };

        state.restores.insert(
            job_id,
            RestoreEntry {
                job,
                timeout: Duration::from_secs(timeout_secs),
                handle,
                control: Some(control),
                progress: None,
            },
        );
        self.events.publish(LifecycleEvent::JobCreated {
            job_id,
            kind: JobKind::Restore,
            policy_id,
        });
        if matches!(admission, Admission::Started { .. }) {
            self.start_locked(state, Work::Restore(job_id));
        }
        self.metrics.jobs_queued.set(state.queue.len() as i64);
        Ok(admission)
    }

    /// Moves `work` to running and spawns its worker. Caller holds the state lock.
    fn start_locked(self: &Arc<Self>, state: &mut State, work: Work) {
        match work {
            Work::Backup(job_id) => {
                let Some(entry) = state.backups.get_mut(&job_id) else {
                    return;
                };
                if let Err(e) = entry.job.transition(JobStatus::Running) {
                    warn!(job_id = %job_id, error = %e, "Queued job not startable");
                    return;
                }
                let Some(control) = entry.control.take() else {
                    return;
                };
                let policy = entry.policy.clone();
                let reporter = self.reporter(job_id, JobKind::Backup);
                entry.progress = Some(reporter.shared());

                state.running.insert(policy.id.clone(), job_id);
                state.running_count += 1;
                self.after_start(job_id, JobKind::Backup, state.running_count);

                let this = self.clone();
                tokio::spawn(async move {
                    this.run_backup(job_id, policy, control, reporter).await;
                });
            }
            Work::Restore(job_id) => {
                let Some(entry) = state.restores.get_mut(&job_id) else {
                    return;
                };
                if let Err(e) = entry.job.transition(JobStatus::Running) {
                    warn!(job_id = %job_id, error = %e, "Queued restore not startable");
                    return;
                }
                let Some(control) = entry.control.take() else {
                    return;
                };
                let job = entry.job.clone();
                let timeout = entry.timeout;
                let reporter = self.reporter(job_id, JobKind::Restore);
                entry.progress = Some(reporter.shared());

                state.running_count += 1;
                self.after_start(job_id, JobKind::Restore, state.running_count);

                let this = self.clone();
                tokio::spawn(async move {
                    this.run_restore(job, timeout, control, reporter).await;
                });
            }
        }
    }

    fn reporter(&self, job_id: Uuid, kind: JobKind) -> ProgressReporter {
        ProgressReporter::new(
            job_id,
            kind,
            self.events.clone(),
            Duration::from_millis(self.config.progress_interval_ms),
        )
    }

    fn after_start(&self, job_id: Uuid, kind: JobKind, running: usize) {
        info!(job_id = %job_id, kind = ?kind, "Job started");
        self.metrics.jobs_running.set(running as i64);
        self.events.publish(LifecycleEvent::StatusChanged {
            job_id,
            kind,
            status: JobStatus::Running,
        });
    }

    /// Starts queued work in FIFO order while worker slots are free, passing
    /// over backups whose policy is still busy.
    fn pump(self: &Arc<Self>) {
        let mut guard = self.state();
        let state = &mut *guard;
        let mut position = 0;
        while state.running_count < self.config.max_concurrent_jobs && position < state.queue.len() {
            let work = state.queue[position];
            let startable = match work {
                Work::Backup(id) => state
                    .backups
                    .get(&id)
                    .map(|entry| !state.running.contains_key(&entry.job.policy_id)),
                Work::Restore(id) => state.restores.get(&id).map(|_| true),
            };
            match startable {
                Some(true) => {
                    state.queue.remove(position);
                    self.start_locked(state, work);
                }
                Some(false) => position += 1,
                None => {
                    state.queue.remove(position);
                }
            }
        }
        self.metrics.jobs_queued.set(state.queue.len() as i64);
        state.evict_finished(self.config.job_history);
    }

    /// Runs `work`, cancelling it once `timeout` elapses. Time spent paused
    /// counts. A result the job produces after its deadline goes to `discard`.
    async fn with_timeout<T, D>(
        &self,
        job_id: Uuid,
        timeout: Duration,
        work: impl Future<Output = Result<T>>,
        discard: impl FnOnce(T) -> D,
    ) -> Result<T>
    where
        D: Future<Output = ()>,
    {
        let cancel = || {
            warn!(job_id = %job_id, timeout_secs = timeout.as_secs(), "Job timed out, cancelling");
            self.cancel_handle(job_id);
        };
        run_with_deadline(timeout, work, cancel, discard).await
    }

    /// Undoes a backup that finished after its deadline: the record leaves the
    /// index and its objects are deleted.
    async fn discard_late_backup(&self, record: BackupRecord) {
        warn!(record_id = %record.id, job_id = %record.job_id, "Backup finished after its deadline, discarding");
        let removed = {
            let guard = self.storage.index().lock().await;
            guard.remove(record.id).await
        };
        if let Err(e) = removed {
            error!(record_id = %record.id, error = %e, "Failed to unindex late backup");
            return;
        }
        if let Err(e) = self.storage.delete_record_objects(&record).await {
            warn!(record_id = %record.id, error = %e, "Failed to remove objects of late backup");
        }
    }

    async fn run_backup(
        self: Arc<Self>,
        job_id: Uuid,
        policy: BackupPolicy,
        control: JobControl,
        reporter: ProgressReporter,
    ) {
        let started = Instant::now();
        let timeout = Duration::from_secs(policy.timeout_secs);
        let outcome = self
            .with_timeout(
                job_id,
                timeout,
                self.execute_backup(job_id, &policy, control, reporter),
                |record| self.discard_late_backup(record),
            )
            .await;
        self.finalize_backup(job_id, outcome, started.elapsed()).await;
    }

    async fn execute_backup(
        &self,
        job_id: Uuid,
        policy: &BackupPolicy,
        control: JobControl,
        reporter: ProgressReporter,
    ) -> Result<BackupRecord> {
        let source = self.sources.source(&policy.source)?;
        let source = source.as_ref();
        let reporter = tokio::sync::Mutex::new(reporter);
        let reporter = &reporter;
        let retry = RetryPolicy::new(policy.retry.clone());

        retry
            .execute_cancellable(&control, |attempt| {
                let control = control.clone();
                async move {
                    self.update_backup(job_id, |job| job.statistics.attempts = attempt);
                    if attempt > 1 {
                        info!(job_id = %job_id, attempt, "Retrying backup");
                    }
                    self.attempt_backup(job_id, policy, source, control, reporter)
                        .await
                }
            })
            .await
    }

    /// Newest record a differential or incremental backup builds on.
    async fn since_for(&self, policy: &BackupPolicy) -> Result<Option<chrono::DateTime<Utc>>> {
        if policy.backup_type == BackupType::Full {
            return Ok(None);
        }
        let records = self.storage.index().list(&policy.id).await?;
        let base = match policy.backup_type {
            BackupType::Incremental => records.first(),
            _ => records.iter().find(|r| r.backup_type == BackupType::Full),
        };
        Ok(base.map(|r| r.created_at))
    }

    async fn attempt_backup(
        &self,
        job_id: Uuid,
        policy: &BackupPolicy,
        source: &dyn BackupSource,
        mut control: JobControl,
        reporter: &tokio::sync::Mutex<ProgressReporter>,
    ) -> Result<BackupRecord> {
        let mut reporter = reporter.lock().await;
        reporter.set_stage(JobStage::Preparing);

        let salt = random_salt();
        let keys = derive_keys(&policy.encryption, self.secrets.as_ref(), &salt).await?;
        let since = self.since_for(policy).await?;
        let SourceSnapshot {
            total_bytes,
            entries: mut stream,
            ..
        } = source
            .snapshot(&SnapshotRequest {
                policy_id: policy.id.clone(),
                backup_type: policy.backup_type,
                since,
            })
            .await?;

        let created_at = Utc::now();
        let clock = Instant::now();
        let key = format!(
            "{}/{}-{}.bkc",
            policy.key_prefix(),
            created_at.format("%Y%m%dT%H%M%SZ"),
            job_id
        );
        let mut writer =
            PipelineWriter::new(&policy.compression, policy.encryption.algorithm, &keys)?;
        let mut session = self.storage.begin_write(&policy.storage, &key).await?;

        let transferred = async {
            let mut processed = 0u64;
            let mut written = 0u64;
            let mut files = 0u64;
            while let Some(entry) = stream.next().await {
                control.checkpoint().await?;
                let entry = entry?;
                for chunk in writer.push_entry(&entry).await? {
                    written += chunk.len() as u64;
                    session.write_part(chunk).await?;
                }
                processed += entry.data.len() as u64;
                files += 1;
                reporter.update(
                    JobStage::Transferring,
                    processed,
                    total_bytes,
                    Some(entry.entity.to_string()),
                );
                self.update_backup(job_id, |job| {
                    job.statistics.files_processed = files;
                    job.statistics.bytes_processed = processed;
                    job.statistics.bytes_written = written;
                });
            }

            control.checkpoint().await?;
            reporter.set_stage(JobStage::Finalizing);
            let (tail, summary) = writer.finish().await?;
            for chunk in tail {
                written += chunk.len() as u64;
                session.write_part(chunk).await?;
            }
            self.update_backup(job_id, |job| job.statistics.bytes_written = written);
            control.checkpoint().await?;
            Ok::<_, BackupError>(summary)
        }
        .await;

        let summary = match transferred {
            Ok(summary) => summary,
            Err(e) => {
                session.abort().await;
                return Err(e);
            }
        };
        let locations = session.complete().await?;

        let duration = clock.elapsed();
        let seconds = duration.as_secs_f64();
        let record = BackupRecord {
            id: Uuid::new_v4(),
            policy_id: policy.id.clone(),
            job_id,
            backup_type: policy.backup_type,
            created_at,
            completed_at: Utc::now(),
            original_size_bytes: summary.original_size,
            compressed_size_bytes: summary.compressed_size,
            stored_size_bytes: summary.stored_size,
            compression_ratio: summary.compression_ratio(),
            file_count: summary.file_count,
            duration_ms: duration.as_millis() as u64,
            throughput_bytes_per_sec: if seconds > 0.0 {
                summary.original_size as f64 / seconds
            } else {
                0.0
            },
            content_checksum: summary.content_checksum,
            integrity: policy.verify_integrity.then_some(summary.integrity),
            compression: policy.compression.clone(),
            encryption_algorithm: policy.encryption.algorithm,
            key_salt: hex::encode(salt),
            block_count: summary.block_count,
            locations,
            manifest: summary.manifest,
            verification: None,
            archived: false,
            recompressed: false,
            access_count: 0,
            last_accessed: None,
            expires_at: policy.retention.expiry_for(created_at),
        };

        let inserted = {
            let guard = self.storage.index().lock().await;
            if control.is_cancelled() {
                Err(BackupError::Cancelled)
            } else {
                guard.insert(&record).await
            }
        };
        if let Err(e) = inserted {
            if let Err(cleanup) = self.storage.delete_record_objects(&record).await {
                warn!(job_id = %job_id, error = %cleanup, "Failed to remove objects of unindexed backup");
            }
            return Err(e);
        }

        self.metrics.bytes_processed_total.inc_by(record.original_size_bytes);
        self.metrics.bytes_stored_total.inc_by(record.stored_size_bytes);
        self.storage.enqueue_replication(&record);
        Ok(record)
    }

    fn cancel_handle(&self, job_id: Uuid) {
        if let Some(handle) = self.state().handle(job_id) {
            handle.cancel();
        }
    }

    fn update_backup(&self, job_id: Uuid, mutate: impl FnOnce(&mut BackupJob)) {
        if let Some(entry) = self.state().backups.get_mut(&job_id) {
            mutate(&mut entry.job);
        }
    }

    async fn finalize_backup(
        self: &Arc<Self>,
        job_id: Uuid,
        outcome: Result<BackupRecord>,
        elapsed: Duration,
    ) {
        let status = match &outcome {
            Ok(_) => JobStatus::Completed,
            Err(BackupError::Cancelled) => JobStatus::Cancelled,
            Err(_) => JobStatus::Failed,
        };

        let job = {
            let mut state = self.state();
            let Some(entry) = state.backups.get_mut(&job_id) else {
                return;
            };
            if let Some(progress) = latest(&entry.progress) {
                entry.job.progress = progress;
            }
            if entry.job.status == JobStatus::Paused && status == JobStatus::Completed {
                let _ = entry.job.transition(JobStatus::Running);
            }
            if let Err(e) = entry.job.transition(status) {
                error!(job_id = %job_id, error = %e, "Illegal terminal transition");
            }
            match &outcome {
                Ok(record) => entry.job.result = Some(record.id),
                Err(e) => entry.job.error = Some(JobError::from(e)),
            }
            let job = entry.job.clone();

            if state.running.get(&job.policy_id) == Some(&job_id) {
                state.running.remove(&job.policy_id);
            }
            state.running_count = state.running_count.saturating_sub(1);
            self.metrics.jobs_running.set(state.running_count as i64);
            job
        };

        self.report_terminal_backup(&job, &outcome, elapsed).await;
        self.pump();
        self.finished.notify_waiters();
    }

    async fn report_terminal_backup(
        &self,
        job: &BackupJob,
        outcome: &Result<BackupRecord>,
        elapsed: Duration,
    ) {
        match outcome {
            Ok(record) => info!(
                job_id = %job.id,
                policy_id = %job.policy_id,
                record_id = %record.id,
                stored_bytes = record.stored_size_bytes,
                "Backup job completed"
            ),
            Err(BackupError::Cancelled) => {
                info!(job_id = %job.id, policy_id = %job.policy_id, "Backup job cancelled")
            }
            Err(e) => error!(
                job_id = %job.id,
                policy_id = %job.policy_id,
                code = e.code(),
                error = %e,
                "Backup job failed"
            ),
        }
        self.metrics.record_backup_finished(
            job.status,
            elapsed.as_secs_f64(),
            job.statistics.attempts,
        );
        self.events.publish(LifecycleEvent::Terminal {
            job_id: job.id,
            kind: JobKind::Backup,
            policy_id: job.policy_id.clone(),
            status: job.status,
            record_id: job.result,
            error: job.error.clone(),
        });
        self.log_job(JobLogEntry {
            job_id: job.id,
            kind: JobKind::Backup,
            policy_id: job.policy_id.clone(),
            status: job.status,
            record_id: job.result,
            error: job.error.clone(),
            created_at: job.created_at,
            finished_at: job.finished_at,
        })
        .await;
    }

    async fn log_job(&self, entry: JobLogEntry) {
        let repository = self.storage.index().repository().clone();
        if let Err(e) = repository.log_job(&entry).await {
            warn!(job_id = %entry.job_id, error = %e, "Failed to write job log");
        }
    }

    async fn run_restore(
        self: Arc<Self>,
        job: RestoreJob,
        timeout: Duration,
        control: JobControl,
        mut reporter: ProgressReporter,
    ) {
        let job_id = job.id;
        let outcome = self
            .with_timeout(
                job_id,
                timeout,
                self.restores.execute(&job, control, &mut reporter),
                |report| async move {
                    warn!(
                        job_id = %job_id,
                        restored = report.restored,
                        "Restore finished after its deadline; written entities stay in place"
                    );
                },
            )
            .await;

        let status = match &outcome {
            Ok(_) => JobStatus::Completed,
            Err(BackupError::Cancelled) => JobStatus::Cancelled,
            Err(_) => JobStatus::Failed,
        };

        let finished = {
            let mut state = self.state();
            let finished = state.restores.get_mut(&job.id).map(|entry| {
                if let Some(progress) = latest(&entry.progress) {
                    entry.job.progress = progress;
                }
                if entry.job.status == JobStatus::Paused && status == JobStatus::Completed {
                    let _ = entry.job.transition(JobStatus::Running);
                }
                if let Err(e) = entry.job.transition(status) {
                    error!(job_id = %job.id, error = %e, "Illegal terminal transition");
                }
                match &outcome {
                    Ok(report) => {
                        entry.job.statistics.files_processed = report.restored + report.skipped;
                        entry.job.statistics.bytes_processed = report.bytes_restored;
                        entry.job.warnings.extend(report.warnings.iter().cloned());
                        entry.job.result = Some(report.clone());
                    }
                    Err(e) => entry.job.error = Some(JobError::from(e)),
                }
                entry.job.clone()
            });
            state.running_count = state.running_count.saturating_sub(1);
            self.metrics.jobs_running.set(state.running_count as i64);
            finished
        };

        if let Some(job) = finished {
            match &outcome {
                Ok(report) => info!(
                    job_id = %job.id,
                    backup_id = %job.backup_id,
                    restored = report.restored,
                    dry_run = job.options.dry_run,
                    "Restore job completed"
                ),
                Err(BackupError::Cancelled) => info!(job_id = %job.id, "Restore job cancelled"),
                Err(e) => error!(job_id = %job.id, code = e.code(), error = %e, "Restore job failed"),
            }
            self.metrics.record_restore_finished(job.status);
            self.events.publish(LifecycleEvent::Terminal {
                job_id: job.id,
                kind: JobKind::Restore,
                policy_id: job.policy_id.clone(),
                status: job.status,
                record_id: Some(job.backup_id),
                error: job.error.clone(),
            });
            self.log_job(JobLogEntry {
                job_id: job.id,
                kind: JobKind::Restore,
                policy_id: job.policy_id.clone(),
                status: job.status,
                record_id: Some(job.backup_id),
                error: job.error.clone(),
                created_at: job.created_at,
                finished_at: job.finished_at,
            })
            .await;
        }

        self.pump();
        self.finished.notify_waiters();
    }

    /// Cancels a queued or running job. Queued jobs finish immediately;
    /// running ones stop at their next chunk boundary.
    pub async fn cancel(self: &Arc<Self>, job_id: Uuid) -> Result<()> {
        let dequeued = {
            let mut guard = self.state();
            let state = &mut *guard;
            let queued = state
                .queue
                .iter()
                .position(|w| matches!(w, Work::Backup(id) | Work::Restore(id) if *id == job_id));

            match queued {
                Some(position) => {
                    let work = state.queue.remove(position);
                    self.metrics.jobs_queued.set(state.queue.len() as i64);
                    work
                }
                None => {
                    let handle = state.handle(job_id).ok_or_else(|| BackupError::NotFound {
                        entity: "job",
                        id: job_id.to_string(),
                    })?;
                    if handle.is_cancelled() {
                        return Ok(());
                    }
                    let status = self.status_locked(state, job_id);
                    if status.is_some_and(JobStatus::is_terminal) {
                        return Err(BackupError::InvalidTransition {
                            from: status.map(|s| s.to_string()).unwrap_or_default(),
                            to: JobStatus::Cancelled.to_string(),
                        });
                    }
                    handle.cancel();
                    info!(job_id = %job_id, "Cancellation requested");
                    None
                }
            }
        };

        match dequeued {
            Some(Work::Backup(id)) => {
                let job = {
                    let mut state = self.state();
                    state.backups.get_mut(&id).map(|entry| {
                        let _ = entry.job.transition(JobStatus::Cancelled);
                        entry.job.error = Some(JobError::from(&BackupError::Cancelled));
                        entry.job.clone()
                    })
                };
                if let Some(job) = job {
                    self.report_terminal_backup(&job, &Err(BackupError::Cancelled), Duration::ZERO)
                        .await;
                }
                self.finished.notify_waiters();
            }
            Some(Work::Restore(id)) => {
                let job = {
                    let mut state = self.state();
                    state.restores.get_mut(&id).map(|entry| {
                        let _ = entry.job.transition(JobStatus::Cancelled);
                        entry.job.clone()
                    })
                };
                if let Some(job) = job {
                    info!(job_id = %job.id, "Queued restore cancelled");
                    self.events.publish(LifecycleEvent::Terminal {
                        job_id: job.id,
                        kind: JobKind::Restore,
                        policy_id: job.policy_id.clone(),
                        status: JobStatus::Cancelled,
                        record_id: Some(job.backup_id),
                        error: None,
                    });
                }
                self.finished.notify_waiters();
            }
            None => {}
        }
        Ok(())
    }

    fn status_locked(&self, state: &State, job_id: Uuid) -> Option<JobStatus> {
        state
            .backups
            .get(&job_id)
            .map(|e| e.job.status)
            .or_else(|| state.restores.get(&job_id).map(|e| e.job.status))
    }

    fn set_paused(&self, job_id: Uuid, paused: bool) -> Result<()> {
        let to = if paused {
            JobStatus::Paused
        } else {
            JobStatus::Running
        };

        let mut state = self.state();
        let kind = if let Some(entry) = state.backups.get_mut(&job_id) {
            entry.job.transition(to)?;
            entry.handle.set_paused(paused);
            JobKind::Backup
        } else if let Some(entry) = state.restores.get_mut(&job_id) {
            entry.job.transition(to)?;
            entry.handle.set_paused(paused);
            JobKind::Restore
        } else {
            return Err(BackupError::NotFound {
                entity: "job",
                id: job_id.to_string(),
            });
        };

        info!(job_id = %job_id, status = %to, "Job pause state changed");
        self.events.publish(LifecycleEvent::StatusChanged {
            job_id,
            kind,
            status: to,
        });
        Ok(())
    }

    /// Paused jobs stop at the next chunk boundary.
    pub fn pause(&self, job_id: Uuid) -> Result<()> {
        self.set_paused(job_id, true)
    }

    pub fn resume(&self, job_id: Uuid) -> Result<()> {
        self.set_paused(job_id, false)
    }

    pub fn get_job(&self, job_id: Uuid) -> Result<BackupJob> {
        let state = self.state();
        let entry = state.backups.get(&job_id).ok_or_else(|| BackupError::NotFound {
            entity: "job",
            id: job_id.to_string(),
        })?;
        let mut job = entry.job.clone();
        if !job.status.is_terminal() {
            if let Some(progress) = latest(&entry.progress) {
                job.progress = progress;
            }
        }
        Ok(job)
    }

    pub fn get_restore_job(&self, job_id: Uuid) -> Result<RestoreJob> {
        let state = self.state();
        let entry = state.restores.get(&job_id).ok_or_else(|| BackupError::NotFound {
            entity: "restore job",
            id: job_id.to_string(),
        })?;
        let mut job = entry.job.clone();
        if !job.status.is_terminal() {
            if let Some(progress) = latest(&entry.progress) {
                job.progress = progress;
            }
        }
        Ok(job)
    }

    /// Terminal summary of a job that is no longer held in memory.
    pub async fn logged_job(&self, job_id: Uuid) -> Result<JobLogEntry> {
        self.storage
            .index()
            .repository()
            .find_job(job_id)
            .await?
            .ok_or_else(|| BackupError::NotFound {
                entity: "job",
                id: job_id.to_string(),
            })
    }

    /// Backup jobs held in memory, newest first
    pub fn list_jobs(&self) -> Vec<BackupJob> {
        let state = self.state();
        let mut jobs: Vec<BackupJob> = state.backups.values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn running_jobs(&self) -> usize {
        self.state().running_count
    }

    pub fn queued_jobs(&self) -> usize {
        self.state().queue.len()
    }

    /// Resolves once the job reaches a terminal status.
    pub async fn wait_for(&self, job_id: Uuid) -> Result<BackupJob> {
        loop {
            let notified = self.finished.notified();
            let job = self.get_job(job_id)?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            notified.await;
        }
    }

    pub async fn wait_for_restore(&self, job_id: Uuid) -> Result<RestoreJob> {
        loop {
            let notified = self.finished.notified();
            let job = self.get_restore_job(job_id)?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            notified.await;
        }
    }

    /// Resolves once nothing is running or queued.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.finished.notified();
            {
                let state = self.state();
                if state.running_count == 0 && state.queue.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Removes a policy that no admitted job references.
    pub async fn remove_policy(&self, policy_id: &str) -> Result<BackupPolicy> {
        let active = self.state().admitted_for(policy_id);
        if active > 0 {
            return Err(BackupError::config(format!(
                "policy {policy_id} has {active} active jobs"
            )));
        }
        self.policies.remove(policy_id).await
    }

    /// Cancels everything and waits for workers to finish cleaning up.
    pub async fn shutdown(self: &Arc<Self>) {
        let ids: Vec<Uuid> = {
            let state = self.state();
            state
                .queue
                .iter()
                .map(|w| match w {
                    Work::Backup(id) | Work::Restore(id) => *id,
                })
                .chain(state.running.values().copied())
                .chain(
                    state
                        .restores
                        .iter()
                        .filter(|(_, e)| !e.job.status.is_terminal())
                        .map(|(id, _)| *id),
                )
                .collect()
        };
        for id in ids {
            let _ = self.cancel(id).await;
        }
        self.wait_idle().await;
    }
}

/// Runs `work` until `timeout`, then calls `cancel` and waits for `work` to
/// wind down. Anything but an in-time result is reported as `TIMEOUT`; a value
/// produced after the deadline is handed to `discard`.
async fn run_with_deadline<T, D>(
    timeout: Duration,
    work: impl Future<Output = Result<T>>,
    cancel: impl FnOnce(),
    discard: impl FnOnce(T) -> D,
) -> Result<T>
where
    D: Future<Output = ()>,
{
    tokio::pin!(work);
    tokio::select! {
        result = &mut work => result,
        _ = tokio::time::sleep(timeout) => {
            cancel();
            if let Ok(late) = work.await {
                discard(late).await;
            }
            Err(BackupError::Timeout { seconds: timeout.as_secs() })
        }
    }
}
