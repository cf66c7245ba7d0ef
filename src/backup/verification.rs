use super::encryption::{sha256_hex, SecretResolver};
use super::events::{EventBus, LifecycleEvent};
use super::pipeline::{decode_payload, record_keys, verify_integrity};
use super::policy::PolicyStore;
use super::{BackupRecord, Result, VerificationOutcome};
use crate::monitoring::BackupMetrics;
use crate::storage::StorageManager;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct VerificationSettings {
    pub enabled: bool,
    /// Records checked per run
    pub sample_size: usize,
    /// Records verified more recently than this are not sampled
    pub min_interval_hours: i64,
    pub cron: String,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_size: 5,
            min_interval_hours: 24,
            cron: "0 30 4 * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VerificationReport {
    pub checked: usize,
    pub passed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

/// Oldest-verified first; never-verified records lead.
pub fn select_sample(
    records: &[BackupRecord],
    sample_size: usize,
    min_interval: Duration,
    now: DateTime<Utc>,
) -> Vec<Uuid> {
    let mut candidates: Vec<&BackupRecord> = records
        .iter()
        .filter(|r| r.read_order().first().is_some())
        .filter(|r| {
            r.verification
                .as_ref()
                .map_or(true, |v| now.signed_duration_since(v.verified_at) >= min_interval)
        })
        .collect();
    candidates.sort_by_key(|r| (r.verification.as_ref().map(|v| v.verified_at), r.created_at));
    candidates.into_iter().take(sample_size).map(|r| r.id).collect()
}

#[derive(Debug)]
pub struct VerificationService {
    settings: VerificationSettings,
    policies: Arc<PolicyStore>,
    storage: Arc<StorageManager>,
    secrets: Arc<dyn SecretResolver>,
    events: Arc<EventBus>,
    metrics: Arc<BackupMetrics>,
}

impl VerificationService {
    pub fn new(
        settings: VerificationSettings,
        policies: Arc<PolicyStore>,
        storage: Arc<StorageManager>,
        secrets: Arc<dyn SecretResolver>,
        events: Arc<EventBus>,
        metrics: Arc<BackupMetrics>,
    ) -> Self {
        Self {
            settings,
            policies,
            storage,
            secrets,
            events,
            metrics,
        }
    }

    pub fn settings(&self) -> &VerificationSettings {
        &self.settings
    }

    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<VerificationReport> {
        let now = Utc::now();
        let records = self.storage.index().list_all().await?;
        let sample = select_sample(
            &records,
            self.settings.sample_size,
            Duration::hours(self.settings.min_interval_hours),
            now,
        );

        let mut report = VerificationReport::default();
        for id in sample {
            let Some(record) = records.iter().find(|r| r.id == id) else {
                continue;
            };
            let outcome = self.verify_record(record).await;
            report.checked += 1;
            if outcome.passed {
                report.passed.push(id);
            } else {
                report.failed.push(id);
            }
            self.storage
                .index()
                .update_with(id, |r| r.verification = Some(outcome))
                .await?;
        }

        info!(
            checked = report.checked,
            failed = report.failed.len(),
            "Verification run finished"
        );
        Ok(report)
    }

    /// Full round trip of one record: read, check the tag, decode and
    /// compare the content checksum.
    pub async fn verify_record(&self, record: &BackupRecord) -> VerificationOutcome {
        let mut outcome = VerificationOutcome {
            verified_at: Utc::now(),
            passed: false,
            integrity_check_passed: false,
            checksum_verified: false,
            error_message: None,
        };

        let result: Result<()> = async {
            let encryption = match self.policies.get(&record.policy_id).await {
                Ok(policy) => policy.encryption,
                Err(_) => Default::default(),
            };
            let keys = record_keys(record, &encryption, self.secrets.as_ref()).await?;
            let (stored, _) = self.storage.read_record(record).await?;

            verify_integrity(&stored, &keys, record.integrity.as_ref())?;
            outcome.integrity_check_passed = true;

            let plaintext = decode_payload(
                &stored,
                &record.compression,
                record.encryption_algorithm,
                &keys,
                None,
            )?;
            if sha256_hex(&plaintext) != record.content_checksum {
                return Err(super::BackupError::integrity("content checksum mismatch"));
            }
            outcome.checksum_verified = true;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => outcome.passed = true,
            Err(e) => {
                error!(record_id = %record.id, policy_id = %record.policy_id, error = %e, "Backup failed verification");
                self.events.publish(LifecycleEvent::IntegrityAlert {
                    policy_id: Some(record.policy_id.clone()),
                    record_id: Some(record.id),
                    provider: None,
                    message: e.to_string(),
                });
                outcome.error_message = Some(e.to_string());
            }
        }
        self.metrics.record_verification(outcome.passed);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::fixtures;

    fn verified(mut record: BackupRecord, hours_ago: i64) -> BackupRecord {
        record.verification = Some(VerificationOutcome {
            verified_at: Utc::now() - Duration::hours(hours_ago),
            passed: true,
            integrity_check_passed: true,
            checksum_verified: true,
            error_message: None,
        });
        record
    }

    #[test]
    fn test_sample_prefers_never_verified_then_oldest() {
        let never = fixtures::record("p", 3, 10);
        let stale = verified(fixtures::record("p", 10, 10), 72);
        let staler = verified(fixtures::record("p", 9, 10), 96);
        let fresh = verified(fixtures::record("p", 1, 10), 1);
        let records = vec![fresh.clone(), stale.clone(), never.clone(), staler.clone()];

        let sample = select_sample(&records, 3, Duration::hours(24), Utc::now());
        assert_eq!(sample, vec![never.id, staler.id, stale.id]);
    }

    #[test]
    fn test_sample_skips_records_without_readable_copy() {
        let mut pending = fixtures::record("p", 3, 10);
        pending.locations[0].status = crate::backup::ReplicationStatus::Pending;
        assert!(select_sample(&[pending], 5, Duration::hours(24), Utc::now()).is_empty());
    }
}
