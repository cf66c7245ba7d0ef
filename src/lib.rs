//! Backup and restore orchestration engine.
//!
//! Policies describe what is backed up, where it is stored and how long it is
//! kept. The [`backup::JobOrchestrator`] admits jobs under global and
//! per-policy ceilings and runs them through the compress/encrypt pipeline into
//! replicated [`storage`] providers. Retention, lifecycle rules and periodic
//! verification keep the record index in shape; restores go through a
//! side-effect free preview first.

pub mod api;
pub mod application;
pub mod backup;
pub mod config;
pub mod monitoring;
pub mod storage;

pub use config::Config;

// Re-export engine types
pub use backup::{
    Admission, BackupError, BackupJob, BackupPolicy, BackupRecord, BackupType, JobOrchestrator,
    JobStatus, PolicyStore, RestoreEngine, RetentionEngine, SchedulerService, Trigger,
};

// Re-export monitoring types
pub use monitoring::{BackupMetrics, HealthChecker, HealthStatus, SystemHealth};

// Re-export storage types
pub use storage::{ProviderConfig, StorageManager, StorageProvider};
