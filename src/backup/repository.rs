use super::job::{JobError, JobKind, JobStatus};
use super::{BackupError, BackupRecord, Result};
use crate::storage::ConnectionTestResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::debug;
use uuid::Uuid;

/// One line of the job/restore-job log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobLogEntry {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub policy_id: String,
    pub status: JobStatus,
    pub record_id: Option<Uuid>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Persistence for the backup-record index, the job log and the provider-health cache
#[async_trait]
pub trait BackupRepository: Send + Sync + std::fmt::Debug {
    async fn initialize(&self) -> Result<()>;
    async fn insert_record(&self, record: &BackupRecord) -> Result<()>;
    async fn update_record(&self, record: &BackupRecord) -> Result<()>;
    async fn remove_record(&self, id: Uuid) -> Result<()>;
    async fn get_record(&self, id: Uuid) -> Result<Option<BackupRecord>>;
    /// Records of one policy, newest first
    async fn list_records(&self, policy_id: &str) -> Result<Vec<BackupRecord>>;
    async fn list_all_records(&self) -> Result<Vec<BackupRecord>>;
    async fn log_job(&self, entry: &JobLogEntry) -> Result<()>;
    async fn job_log(&self, limit: usize) -> Result<Vec<JobLogEntry>>;
    async fn find_job(&self, job_id: Uuid) -> Result<Option<JobLogEntry>>;
    async fn store_health(&self, result: &ConnectionTestResult) -> Result<()>;
    async fn provider_health(&self) -> Result<Vec<ConnectionTestResult>>;
}

fn newest_first(records: &mut [BackupRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
}

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<Uuid, BackupRecord>,
    jobs: Vec<JobLogEntry>,
    health: HashMap<String, ConnectionTestResult>,
}

/// Process-local repository, the default when no database is configured
#[derive(Debug, Default)]
pub struct InMemoryBackupRepository {
    state: RwLock<MemoryState>,
}

impl InMemoryBackupRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackupRepository for InMemoryBackupRepository {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_record(&self, record: &BackupRecord) -> Result<()> {
        self.state
            .write()
            .await
            .records
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn update_record(&self, record: &BackupRecord) -> Result<()> {
        let mut state = self.state.write().await;
        match state.records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(BackupError::NotFound {
                entity: "backup record",
                id: record.id.to_string(),
            }),
        }
    }

    async fn remove_record(&self, id: Uuid) -> Result<()> {
        self.state.write().await.records.remove(&id);
        Ok(())
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        Ok(self.state.read().await.records.get(&id).cloned())
    }

    async fn list_records(&self, policy_id: &str) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> = self
            .state
            .read()
            .await
            .records
            .values()
            .filter(|r| r.policy_id == policy_id)
            .cloned()
            .collect();
        newest_first(&mut records);
        Ok(records)
    }

    async fn list_all_records(&self) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> =
            self.state.read().await.records.values().cloned().collect();
        newest_first(&mut records);
        Ok(records)
    }

    async fn log_job(&self, entry: &JobLogEntry) -> Result<()> {
        let mut state = self.state.write().await;
        state.jobs.retain(|j| j.job_id != entry.job_id);
        state.jobs.push(entry.clone());
        Ok(())
    }

    async fn job_log(&self, limit: usize) -> Result<Vec<JobLogEntry>> {
        let state = self.state.read().await;
        Ok(state.jobs.iter().rev().take(limit).cloned().collect())
    }

    async fn find_job(&self, job_id: Uuid) -> Result<Option<JobLogEntry>> {
        let state = self.state.read().await;
        Ok(state.jobs.iter().find(|j| j.job_id == job_id).cloned())
    }

    async fn store_health(&self, result: &ConnectionTestResult) -> Result<()> {
        self.state
            .write()
            .await
            .health
            .insert(result.provider.clone(), result.clone());
        Ok(())
    }

    async fn provider_health(&self) -> Result<Vec<ConnectionTestResult>> {
        let mut health: Vec<ConnectionTestResult> =
            self.state.read().await.health.values().cloned().collect();
        health.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(health)
    }
}

/// PostgreSQL implementation; records and log entries are stored as JSONB
#[derive(Debug)]
pub struct PostgresBackupRepository {
    db_pool: Arc<PgPool>,
}

impl PostgresBackupRepository {
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self { db_pool }
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<BackupRecord> {
        let Json(record): Json<BackupRecord> = row.try_get("record")?;
        Ok(record)
    }
}

#[async_trait]
impl BackupRepository for PostgresBackupRepository {
    async fn initialize(&self) -> Result<()> {
        debug!("Initializing backup record index");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backup_records (
                id UUID PRIMARY KEY,
                policy_id VARCHAR NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                record JSONB NOT NULL
            )
        "#,
        )
        .execute(self.db_pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_backup_records_policy_created
            ON backup_records (policy_id, created_at DESC)
        "#,
        )
        .execute(self.db_pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backup_job_log (
                job_id UUID PRIMARY KEY,
                policy_id VARCHAR NOT NULL,
                kind VARCHAR NOT NULL,
                status VARCHAR NOT NULL,
                entry JSONB NOT NULL,
                logged_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
        "#,
        )
        .execute(self.db_pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS provider_health (
                provider VARCHAR PRIMARY KEY,
                result JSONB NOT NULL,
                tested_at TIMESTAMPTZ NOT NULL
            )
        "#,
        )
        .execute(self.db_pool.as_ref())
        .await?;

        debug!("Backup record index initialized");
        Ok(())
    }

    async fn insert_record(&self, record: &BackupRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_records (id, policy_id, created_at, record)
            VALUES ($1, $2, $3, $4)
        "#,
        )
        .bind(record.id)
        .bind(&record.policy_id)
        .bind(record.created_at)
        .bind(Json(record))
        .execute(self.db_pool.as_ref())
        .await?;

        Ok(())
    }

    async fn update_record(&self, record: &BackupRecord) -> Result<()> {
        let result = sqlx::query("UPDATE backup_records SET record = $2 WHERE id = $1")
            .bind(record.id)
            .bind(Json(record))
            .execute(self.db_pool.as_ref())
            .await?;

        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound {
                entity: "backup record",
                id: record.id.to_string(),
            });
        }
        Ok(())
    }

    async fn remove_record(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM backup_records WHERE id = $1")
            .bind(id)
            .execute(self.db_pool.as_ref())
            .await?;
        Ok(())
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        let row = sqlx::query("SELECT record FROM backup_records WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db_pool.as_ref())
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list_records(&self, policy_id: &str) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM backup_records
            WHERE policy_id = $1
            ORDER BY created_at DESC, id
        "#,
        )
        .bind(policy_id)
        .fetch_all(self.db_pool.as_ref())
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn list_all_records(&self) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query("SELECT record FROM backup_records ORDER BY created_at DESC, id")
            .fetch_all(self.db_pool.as_ref())
            .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn log_job(&self, entry: &JobLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_job_log (job_id, policy_id, kind, status, entry)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id) DO UPDATE SET
                status = EXCLUDED.status, entry = EXCLUDED.entry, logged_at = NOW()
        "#,
        )
        .bind(entry.job_id)
        .bind(&entry.policy_id)
        .bind(format!("{:?}", entry.kind))
        .bind(entry.status.to_string())
        .bind(Json(entry))
        .execute(self.db_pool.as_ref())
        .await?;

        Ok(())
    }

    async fn job_log(&self, limit: usize) -> Result<Vec<JobLogEntry>> {
        let rows = sqlx::query("SELECT entry FROM backup_job_log ORDER BY logged_at DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(self.db_pool.as_ref())
            .await?;

        rows.iter()
            .map(|row| {
                let Json(entry): Json<JobLogEntry> = row.try_get("entry")?;
                Ok(entry)
            })
            .collect()
    }

    async fn find_job(&self, job_id: Uuid) -> Result<Option<JobLogEntry>> {
        let row = sqlx::query("SELECT entry FROM backup_job_log WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(self.db_pool.as_ref())
            .await?;

        row.map(|row| {
            let Json(entry): Json<JobLogEntry> = row.try_get("entry")?;
            Ok(entry)
        })
        .transpose()
    }

    async fn store_health(&self, result: &ConnectionTestResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO provider_health (provider, result, tested_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (provider) DO UPDATE SET
                result = EXCLUDED.result, tested_at = EXCLUDED.tested_at
        "#,
        )
        .bind(&result.provider)
        .bind(Json(result))
        .bind(result.tested_at)
        .execute(self.db_pool.as_ref())
        .await?;

        Ok(())
    }

    async fn provider_health(&self) -> Result<Vec<ConnectionTestResult>> {
        let rows = sqlx::query("SELECT result FROM provider_health ORDER BY provider")
            .fetch_all(self.db_pool.as_ref())
            .await?;

        rows.iter()
            .map(|row| {
                let Json(result): Json<ConnectionTestResult> = row.try_get("result")?;
                Ok(result)
            })
            .collect()
    }
}

/// The backup-record index.
///
/// Reads go straight to the repository. Mutations made by the orchestrator
/// (new records) and by retention/lifecycle sweeps go through [`lock`],
/// which serialises them on one index-level lock.
///
/// [`lock`]: RecordIndex::lock
#[derive(Debug)]
pub struct RecordIndex {
    repository: Arc<dyn BackupRepository>,
    lock: Mutex<()>,
}

pub struct IndexGuard<'a> {
    repository: &'a dyn BackupRepository,
    _guard: MutexGuard<'a, ()>,
}

impl IndexGuard<'_> {
    pub async fn insert(&self, record: &BackupRecord) -> Result<()> {
        self.repository.insert_record(record).await
    }

    pub async fn update(&self, record: &BackupRecord) -> Result<()> {
        self.repository.update_record(record).await
    }

    pub async fn remove(&self, id: Uuid) -> Result<()> {
        self.repository.remove_record(id).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        self.repository.get_record(id).await
    }

    pub async fn list(&self, policy_id: &str) -> Result<Vec<BackupRecord>> {
        self.repository.list_records(policy_id).await
    }
}

impl RecordIndex {
    pub fn new(repository: Arc<dyn BackupRepository>) -> Self {
        Self {
            repository,
            lock: Mutex::new(()),
        }
    }

    pub fn repository(&self) -> &Arc<dyn BackupRepository> {
        &self.repository
    }

    pub async fn lock(&self) -> IndexGuard<'_> {
        IndexGuard {
            repository: self.repository.as_ref(),
            _guard: self.lock.lock().await,
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<BackupRecord> {
        self.repository
            .get_record(id)
            .await?
            .ok_or_else(|| BackupError::NotFound {
                entity: "backup record",
                id: id.to_string(),
            })
    }

    pub async fn list(&self, policy_id: &str) -> Result<Vec<BackupRecord>> {
        self.repository.list_records(policy_id).await
    }

    pub async fn list_all(&self) -> Result<Vec<BackupRecord>> {
        self.repository.list_all_records().await
    }

    /// Applies `mutate` to one record under the index lock and persists it.
    pub async fn update_with<F>(&self, id: Uuid, mutate: F) -> Result<BackupRecord>
    where
        F: FnOnce(&mut BackupRecord) + Send,
    {
        let guard = self.lock().await;
        let mut record = guard.get(id).await?.ok_or_else(|| BackupError::NotFound {
            entity: "backup record",
            id: id.to_string(),
        })?;
        mutate(&mut record);
        guard.update(&record).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::fixtures;

    fn record(policy_id: &str, age_days: i64) -> BackupRecord {
        fixtures::record(policy_id, age_days, 60)
    }

    #[tokio::test]
    async fn test_records_listed_newest_first_per_policy() {
        let repo = InMemoryBackupRepository::new();
        let older = record("nightly", 3);
        let newer = record("nightly", 1);
        let other = record("weekly", 0);
        for r in [&older, &newer, &other] {
            repo.insert_record(r).await.unwrap();
        }

        let listed = repo.list_records("nightly").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(listed[1].id, older.id);
    }

    #[tokio::test]
    async fn test_update_with_persists_mutation() {
        let index = RecordIndex::new(Arc::new(InMemoryBackupRepository::new()));
        let r = record("nightly", 0);
        index.lock().await.insert(&r).await.unwrap();

        let updated = index.update_with(r.id, |r| r.archived = true).await.unwrap();
        assert!(updated.archived);
        assert!(index.get(r.id).await.unwrap().archived);
    }

    #[tokio::test]
    async fn test_update_of_missing_record_is_not_found() {
        let index = RecordIndex::new(Arc::new(InMemoryBackupRepository::new()));
        let result = index.update_with(Uuid::new_v4(), |_| {}).await;
        assert!(matches!(result, Err(BackupError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_job_log_lookup_by_id_keeps_latest_entry() {
        let repo = InMemoryBackupRepository::new();
        let job_id = Uuid::new_v4();
        let mut entry = JobLogEntry {
            job_id,
            kind: JobKind::Backup,
            policy_id: "nightly".to_string(),
            status: JobStatus::Running,
            record_id: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        repo.log_job(&entry).await.unwrap();
        entry.status = JobStatus::Completed;
        repo.log_job(&entry).await.unwrap();

        assert_eq!(repo.find_job(job_id).await.unwrap(), Some(entry));
        assert_eq!(repo.find_job(Uuid::new_v4()).await.unwrap(), None);
    }
}
