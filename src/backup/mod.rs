pub mod compression;
pub mod encryption;
pub mod events;
pub mod job;
pub mod orchestrator;
pub mod pipeline;
pub mod policy;
pub mod repository;
pub mod restore;
pub mod retention;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod verification;

pub use compression::{CompressionAlgorithm, CompressionSettings};
pub use encryption::{EncryptionAlgorithm, EncryptionSettings, KeySource, SecretResolver};
pub use events::{EventBus, EventSubscription, LifecycleEvent};
pub use job::{BackupJob, JobKind, JobStatus, RestoreJob, Trigger};
pub use orchestrator::{Admission, ConflictResolution, JobOrchestrator, OrchestratorConfig};
pub use policy::{BackupPolicy, PolicyStore};
pub use repository::{BackupRepository, InMemoryBackupRepository, RecordIndex};
pub use restore::{RestoreEngine, RestoreOptions, RestorePreview, RestoreRequest, RestoreScope};
pub use retention::{RetentionEngine, RetentionOutcome, RetentionPolicy};
pub use scheduler::{Clock, Schedule, SchedulerService, SystemClock};
pub use verification::VerificationService;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of backup a policy produces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    #[default]
    Full,
    /// Changes since the most recent backup of any type
    Incremental,
    /// Changes since the most recent full backup
    Differential,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Differential => "differential",
        };
        f.write_str(name)
    }
}

/// A single backed-up entity, addressed by module, table and id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef {
    pub module: String,
    pub table: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(module: impl Into<String>, table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            table: table.into(),
            id: id.into(),
        }
    }

    /// Qualified table name, `module/table`
    pub fn table_path(&self) -> String {
        format!("{}/{}", self.module, self.table)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.module, self.table, self.id)
    }
}

/// Where an entity's bytes live inside the decoded backup payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub entity: EntityRef,
    pub modified_at: DateTime<Utc>,
    pub offset: u64,
    pub length: u64,
    /// Qualified tables (`module/table`) this entity refers to
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LocationRole {
    Primary,
    Replica,
    Archive,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStatus {
    Pending,
    Completed,
    Failed,
}

/// One copy of a backup payload on one provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredLocation {
    pub provider: String,
    pub key: String,
    pub role: LocationRole,
    pub status: ReplicationStatus,
    pub size_bytes: u64,
}

impl StoredLocation {
    /// A location a reader may use right now
    pub fn is_readable(&self) -> bool {
        self.status == ReplicationStatus::Completed
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityAlgorithm {
    HmacSha256,
    Sha256,
}

/// Integrity tag computed over the stored (encrypted) payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityTag {
    pub algorithm: IntegrityAlgorithm,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationOutcome {
    pub verified_at: DateTime<Utc>,
    pub passed: bool,
    pub integrity_check_passed: bool,
    pub checksum_verified: bool,
    pub error_message: Option<String>,
}

/// Persisted result of a completed backup job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRecord {
    pub id: Uuid,
    pub policy_id: String,
    pub job_id: Uuid,
    pub backup_type: BackupType,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub original_size_bytes: u64,
    pub compressed_size_bytes: u64,
    pub stored_size_bytes: u64,
    pub compression_ratio: f64,
    pub file_count: u64,
    pub duration_ms: u64,
    pub throughput_bytes_per_sec: f64,
    /// SHA-256 of the plaintext payload
    pub content_checksum: String,
    pub integrity: Option<IntegrityTag>,
    pub compression: CompressionSettings,
    pub encryption_algorithm: EncryptionAlgorithm,
    /// Hex salt the per-job key was derived with; the key itself is never stored
    pub key_salt: String,
    pub block_count: u32,
    pub locations: Vec<StoredLocation>,
    pub manifest: Vec<ManifestEntry>,
    pub verification: Option<VerificationOutcome>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub recompressed: bool,
    #[serde(default)]
    pub access_count: u64,
    pub last_accessed: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl BackupRecord {
    pub fn primary_location(&self) -> Option<&StoredLocation> {
        self.locations
            .iter()
            .find(|l| l.role == LocationRole::Primary)
    }

    /// Readable locations, primary first, then replicas, then archive copies
    pub fn read_order(&self) -> Vec<&StoredLocation> {
        let mut locations: Vec<&StoredLocation> =
            self.locations.iter().filter(|l| l.is_readable()).collect();
        locations.sort_by_key(|l| match l.role {
            LocationRole::Primary => 0,
            LocationRole::Replica => 1,
            LocationRole::Archive => 2,
        });
        locations
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Configuration error: {message}")]
    ConfigInvalid { message: String },

    #[error("Provider {provider} unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("Timeout error: operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Integrity violation: {message}")]
    IntegrityViolation { message: String },

    #[error("Retention conflict in policy {policy_id}: {message}")]
    RetentionConflict { policy_id: String, message: String },

    #[error("Concurrency limit reached: {message}")]
    ConcurrencyLimit { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Restore preview required: {message}")]
    PreviewRequired { message: String },

    #[error("Encryption error: {message}")]
    Encryption { message: String },

    #[error("Compression error: {message}")]
    Compression { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl BackupError {
    pub fn config(message: impl Into<String>) -> Self {
        BackupError::ConfigInvalid {
            message: message.into(),
        }
    }

    pub fn unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        BackupError::ProviderUnavailable {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        BackupError::Storage {
            message: message.into(),
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        BackupError::IntegrityViolation {
            message: message.into(),
        }
    }

    /// Stable error code carried in events and API payloads
    pub fn code(&self) -> &'static str {
        match self {
            BackupError::ConfigInvalid { .. } => "CONFIG_INVALID",
            BackupError::ProviderUnavailable { .. } => "PROVIDER_UNAVAILABLE",
            BackupError::Timeout { .. } => "TIMEOUT",
            BackupError::IntegrityViolation { .. } => "INTEGRITY_VIOLATION",
            BackupError::RetentionConflict { .. } => "RETENTION_CONFLICT",
            BackupError::ConcurrencyLimit { .. } => "CONCURRENCY_LIMIT",
            BackupError::Cancelled => "CANCELLED",
            BackupError::NotFound { .. } => "NOT_FOUND",
            BackupError::InvalidTransition { .. } => "INVALID_TRANSITION",
            BackupError::PreviewRequired { .. } => "PREVIEW_REQUIRED",
            BackupError::Encryption { .. } => "ENCRYPTION_ERROR",
            BackupError::Compression { .. } => "COMPRESSION_ERROR",
            BackupError::Storage { .. } => "STORAGE_ERROR",
            BackupError::Io(_) => "IO_ERROR",
            BackupError::Serialization(_) => "SERIALIZATION_ERROR",
            BackupError::Database(_) => "DATABASE_ERROR",
        }
    }

    /// Transient I/O failures are retried locally; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackupError::ProviderUnavailable { .. } | BackupError::Storage { .. } | BackupError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_follow_taxonomy() {
        assert_eq!(BackupError::config("bad cron").code(), "CONFIG_INVALID");
        assert_eq!(
            BackupError::unavailable("s3", "connection refused").code(),
            "PROVIDER_UNAVAILABLE"
        );
        assert_eq!(BackupError::Timeout { seconds: 5 }.code(), "TIMEOUT");
        assert_eq!(BackupError::integrity("tag mismatch").code(), "INTEGRITY_VIOLATION");
    }

    #[test]
    fn test_only_io_class_errors_are_retryable() {
        assert!(BackupError::unavailable("local", "down").is_retryable());
        assert!(BackupError::storage("503").is_retryable());
        assert!(!BackupError::Timeout { seconds: 1 }.is_retryable());
        assert!(!BackupError::integrity("mismatch").is_retryable());
        assert!(!BackupError::Cancelled.is_retryable());
        assert!(!BackupError::config("x").is_retryable());
    }

    #[test]
    fn test_entity_ref_paths() {
        let entity = EntityRef::new("clinical", "patients", "p-1");
        assert_eq!(entity.table_path(), "clinical/patients");
        assert_eq!(entity.to_string(), "clinical/patients/p-1");
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::Duration;

    /// A completed full-backup record `age_days` old with one primary copy.
    pub fn record(policy_id: &str, age_days: i64, size: u64) -> BackupRecord {
        let created_at = Utc::now() - Duration::days(age_days);
        BackupRecord {
            id: Uuid::new_v4(),
            policy_id: policy_id.to_string(),
            job_id: Uuid::new_v4(),
            backup_type: BackupType::Full,
            created_at,
            completed_at: created_at,
            original_size_bytes: size * 2,
            compressed_size_bytes: size,
            stored_size_bytes: size,
            compression_ratio: 2.0,
            file_count: 1,
            duration_ms: 10,
            throughput_bytes_per_sec: 10_000.0,
            content_checksum: String::new(),
            integrity: None,
            compression: CompressionSettings::default(),
            encryption_algorithm: EncryptionAlgorithm::None,
            key_salt: String::new(),
            block_count: 1,
            locations: vec![StoredLocation {
                provider: "primary".to_string(),
                key: format!("{policy_id}/{created_at}.bkc"),
                role: LocationRole::Primary,
                status: ReplicationStatus::Completed,
                size_bytes: size,
            }],
            manifest: vec![],
            verification: None,
            archived: false,
            recompressed: false,
            access_count: 0,
            last_accessed: None,
            expires_at: None,
        }
    }
}
