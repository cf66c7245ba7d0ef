use super::compression::CompressionSettings;
use super::encryption::EncryptionSettings;
use super::retention::RetentionPolicy;
use super::retry::RetrySettings;
use super::scheduler::Schedule;
use super::{BackupError, BackupType, Result};
use crate::storage::replication::StorageBinding;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::info;

fn default_true() -> bool {
    true
}

pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// A named backup configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackupPolicy {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub backup_type: BackupType,
    /// Jobs of this policy admitted at once, running plus queued. Only one
    /// of them ever runs.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    /// Name of the registered data source
    pub source: String,
    pub storage: StorageBinding,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub encryption: EncryptionSettings,
    #[serde(default)]
    pub compression: CompressionSettings,
    /// Store an integrity tag and check it before every restore
    #[serde(default = "default_true")]
    pub verify_integrity: bool,
}

impl BackupPolicy {
    pub fn key_prefix(&self) -> &str {
        self.storage.prefix.as_deref().unwrap_or(&self.id)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(BackupError::config(format!("policy {}: {message}", self.id)));

        if self.id.trim().is_empty() {
            return Err(BackupError::config("policy id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return fail("name must not be empty".to_string());
        }
        if self.source.trim().is_empty() {
            return fail("source must not be empty".to_string());
        }
        if self.timeout_secs == 0 {
            return fail("timeout_secs must be > 0".to_string());
        }
        if self.max_concurrent_jobs == 0 {
            return fail("max_concurrent_jobs must be > 0".to_string());
        }
        if self.storage.primary.trim().is_empty() {
            return fail("storage.primary must not be empty".to_string());
        }

        let mut seen = HashSet::new();
        for provider in self.storage.providers() {
            if !seen.insert(provider) {
                return fail(format!("provider {provider} is bound more than once"));
            }
        }

        let mut schedule_ids = HashSet::new();
        for schedule in &self.schedules {
            if !schedule_ids.insert(schedule.id.as_str()) {
                return fail(format!("duplicate schedule {}", schedule.id));
            }
            schedule.validate()?;
        }

        self.compression.validate()?;
        self.encryption.validate()?;
        self.retention.validate(&self.id)?;
        Ok(())
    }
}

/// Validated policies by id.
#[derive(Debug, Default)]
pub struct PolicyStore {
    policies: RwLock<HashMap<String, BackupPolicy>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_policies(policies: Vec<BackupPolicy>) -> Result<Self> {
        let store = Self::new();
        for policy in policies {
            store.upsert(policy).await?;
        }
        Ok(store)
    }

    pub async fn get(&self, id: &str) -> Result<BackupPolicy> {
        self.policies
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BackupError::NotFound {
                entity: "policy",
                id: id.to_string(),
            })
    }

    pub async fn list(&self) -> Vec<BackupPolicy> {
        let mut policies: Vec<BackupPolicy> =
            self.policies.read().await.values().cloned().collect();
        policies.sort_by(|a, b| a.id.cmp(&b.id));
        policies
    }

    pub async fn upsert(&self, policy: BackupPolicy) -> Result<()> {
        policy.validate()?;
        info!(policy_id = %policy.id, "Policy stored");
        self.policies.write().await.insert(policy.id.clone(), policy);
        Ok(())
    }

    /// Callers check for active jobs first; see `JobOrchestrator::remove_policy`.
    pub async fn remove(&self, id: &str) -> Result<BackupPolicy> {
        self.policies
            .write()
            .await
            .remove(id)
            .ok_or_else(|| BackupError::NotFound {
                entity: "policy",
                id: id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_toml() -> &'static str {
        r#"
        id = "nightly"
        name = "Nightly clinical backup"
        source = "clinical-db"

        [storage]
        primary = "nas"
        secondaries = ["offsite"]
        replication = "async"

        [[schedules]]
        id = "every-night"
        frequency = { type = "daily", hour = 2, minute = 30 }

        [retention.daily]
        keep = 7
        after_days = 1
        "#
    }

    #[test]
    fn test_policy_parses_with_defaults() {
        let policy: BackupPolicy = toml::from_str(policy_toml()).unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.max_concurrent_jobs, 4);
        assert_eq!(policy.key_prefix(), "nightly");
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_duplicate_provider_binding_rejected() {
        let mut policy: BackupPolicy = toml::from_str(policy_toml()).unwrap();
        policy.storage.secondaries = vec!["nas".to_string()];
        assert!(matches!(
            policy.validate(),
            Err(BackupError::ConfigInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_store_rejects_invalid_policy() {
        let store = PolicyStore::new();
        let mut policy: BackupPolicy = toml::from_str(policy_toml()).unwrap();
        policy.timeout_secs = 0;
        assert!(store.upsert(policy).await.is_err());
        assert!(store.list().await.is_empty());
    }
}
