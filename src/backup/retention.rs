//! Tiered retention.
//!
//! [`RetentionPolicy::evaluate`] is a pure function of the policy, the record
//! set and `now`: every record of the policy's backup type is assigned to the
//! coarsest tier it is old enough for, each tier keeps its newest `keep`
//! records, and an optional size cap then evicts oldest-first. Records too
//! young for any tier are kept.
//!
//! [`RetentionEngine`] applies a plan under the record-index lock. Payloads
//! are deleted through the storage layer and a record leaves the index only
//! after every provider confirmed the delete.

use super::encryption::SecretResolver;
use super::events::{EventBus, LifecycleEvent};
use super::pipeline::{record_keys, recompress};
use super::policy::{BackupPolicy, PolicyStore};
use super::{BackupError, BackupRecord, BackupType, Result, StoredLocation};
use crate::storage::StorageManager;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Daily, Tier::Weekly, Tier::Monthly, Tier::Yearly];

    fn period_days(self) -> i64 {
        match self {
            Tier::Daily => 1,
            Tier::Weekly => 7,
            Tier::Monthly => 30,
            Tier::Yearly => 365,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowAction {
    #[default]
    Delete,
    Archive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TierRule {
    pub keep: usize,
    /// Age in days from which a record is eligible for this tier
    pub after_days: u32,
    #[serde(default)]
    pub overflow: OverflowAction,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvictionAction {
    #[default]
    DeleteOldest,
    Compress,
    Archive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SizeCap {
    pub limit_bytes: u64,
    #[serde(default)]
    pub action: EvictionAction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetentionPolicy {
    /// Backup type the tiers apply to; the owning policy's type when unset
    pub backup_type: Option<BackupType>,
    pub daily: Option<TierRule>,
    pub weekly: Option<TierRule>,
    pub monthly: Option<TierRule>,
    pub yearly: Option<TierRule>,
    pub max_size: Option<SizeCap>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetentionAction {
    Keep,
    Archive,
    Delete,
    Compress,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionDecision {
    pub record_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub tier: Option<Tier>,
    pub action: RetentionAction,
    pub reason: String,
}

/// Decisions in evaluation order, newest record first.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetentionPlan {
    pub decisions: Vec<RetentionDecision>,
}

impl RetentionPlan {
    pub fn with_action(&self, action: RetentionAction) -> Vec<Uuid> {
        self.decisions
            .iter()
            .filter(|d| d.action == action)
            .map(|d| d.record_id)
            .collect()
    }
}

impl RetentionPolicy {
    pub fn tier(&self, tier: Tier) -> Option<&TierRule> {
        match tier {
            Tier::Daily => self.daily.as_ref(),
            Tier::Weekly => self.weekly.as_ref(),
            Tier::Monthly => self.monthly.as_ref(),
            Tier::Yearly => self.yearly.as_ref(),
        }
    }

    fn configured_tiers(&self) -> impl Iterator<Item = (Tier, &TierRule)> {
        Tier::ALL
            .into_iter()
            .filter_map(|tier| self.tier(tier).map(|rule| (tier, rule)))
    }

    /// Tier thresholds must grow strictly with granularity, otherwise a
    /// coarser tier would swallow every record of a finer one.
    pub fn validate(&self, policy_id: &str) -> Result<()> {
        let conflict = |message: String| BackupError::RetentionConflict {
            policy_id: policy_id.to_string(),
            message,
        };

        let mut previous: Option<(Tier, u32)> = None;
        for (tier, rule) in self.configured_tiers() {
            if let Some((prev_tier, prev_after)) = previous {
                if rule.after_days <= prev_after {
                    return Err(conflict(format!(
                        "{tier:?} tier starts after {} days, not later than the {prev_tier:?} tier ({prev_after} days)",
                        rule.after_days
                    )));
                }
            }
            previous = Some((tier, rule.after_days));
        }

        if let Some(cap) = &self.max_size {
            if cap.limit_bytes == 0 {
                return Err(conflict("max_size.limit_bytes must be > 0".to_string()));
            }
        }
        Ok(())
    }

    /// Coarsest configured tier whose threshold `age` has reached.
    pub fn tier_for_age(&self, age: Duration) -> Option<Tier> {
        self.configured_tiers()
            .filter(|(_, rule)| age >= Duration::days(i64::from(rule.after_days)))
            .map(|(tier, _)| tier)
            .last()
    }

    /// Latest time a new record can survive under these tiers.
    pub fn expiry_for(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let (tier, rule) = self.configured_tiers().last()?;
        let days = i64::from(rule.after_days) + rule.keep as i64 * tier.period_days();
        Some(created_at + Duration::days(days))
    }

    pub fn effective_type(&self, policy_type: BackupType) -> BackupType {
        self.backup_type.unwrap_or(policy_type)
    }

    /// Computes the keep/prune plan for `records`.
    ///
    /// Records of other backup types are ignored. Ties on creation time are
    /// broken by id, so the plan depends only on the record set.
    pub fn evaluate(
        &self,
        backup_type: BackupType,
        records: &[BackupRecord],
        now: DateTime<Utc>,
    ) -> RetentionPlan {
        let mut candidates: Vec<&BackupRecord> = records
            .iter()
            .filter(|r| r.backup_type == backup_type)
            .collect();
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let mut kept_per_tier: HashMap<Tier, usize> = HashMap::new();
        let mut decisions: Vec<RetentionDecision> = candidates
            .iter()
            .map(|record| {
                let tier = self.tier_for_age(record.age_at(now));
                let (action, reason) = match tier.and_then(|t| self.tier(t).map(|rule| (t, rule))) {
                    None => (RetentionAction::Keep, "younger than every tier".to_string()),
                    Some((tier, rule)) => {
                        let kept = kept_per_tier.entry(tier).or_insert(0);
                        if *kept < rule.keep {
                            *kept += 1;
                            (RetentionAction::Keep, format!("{tier:?} tier {}/{}", kept, rule.keep))
                        } else {
                            let action = match rule.overflow {
                                OverflowAction::Delete => RetentionAction::Delete,
                                OverflowAction::Archive => RetentionAction::Archive,
                            };
                            (action, format!("beyond {tier:?} keep of {}", rule.keep))
                        }
                    }
                };
                RetentionDecision {
                    record_id: record.id,
                    created_at: record.created_at,
                    tier,
                    action,
                    reason,
                }
            })
            .collect();

        if let Some(cap) = &self.max_size {
            apply_size_cap(cap, &candidates, &mut decisions);
        }

        RetentionPlan { decisions }
    }
}

/// Evicts kept, hot records oldest-first until the hot total fits the cap.
/// The newest record is never evicted. Compression counts a record's bytes as
/// reclaimed; records already recompressed are not candidates again.
fn apply_size_cap(cap: &SizeCap, candidates: &[&BackupRecord], decisions: &mut [RetentionDecision]) {
    let hot = |i: usize| decisions[i].action == RetentionAction::Keep && !candidates[i].archived;

    let mut total: u64 = (0..candidates.len())
        .filter(|&i| hot(i))
        .map(|i| candidates[i].stored_size_bytes)
        .sum();
    if total <= cap.limit_bytes {
        return;
    }

    for i in (1..candidates.len()).rev() {
        if total <= cap.limit_bytes {
            break;
        }
        let record = candidates[i];
        if decisions[i].action != RetentionAction::Keep || record.archived {
            continue;
        }
        if cap.action == EvictionAction::Compress && record.recompressed {
            continue;
        }
        decisions[i].action = match cap.action {
            EvictionAction::DeleteOldest => RetentionAction::Delete,
            EvictionAction::Compress => RetentionAction::Compress,
            EvictionAction::Archive => RetentionAction::Archive,
        };
        decisions[i].reason = format!("size cap of {} bytes exceeded", cap.limit_bytes);
        total = total.saturating_sub(record.stored_size_bytes);
    }
}

/// Result of applying retention to one policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetentionOutcome {
    pub policy_id: String,
    pub kept: Vec<Uuid>,
    pub archived: Vec<Uuid>,
    pub deleted: Vec<Uuid>,
    pub compressed: Vec<Uuid>,
    /// Records whose action could not be confirmed; they stay in the index
    pub failed: Vec<Uuid>,
}

#[derive(Debug)]
pub struct RetentionEngine {
    policies: Arc<PolicyStore>,
    storage: Arc<StorageManager>,
    events: Arc<EventBus>,
    secrets: Arc<dyn SecretResolver>,
}

impl RetentionEngine {
    pub fn new(
        policies: Arc<PolicyStore>,
        storage: Arc<StorageManager>,
        events: Arc<EventBus>,
        secrets: Arc<dyn SecretResolver>,
    ) -> Self {
        Self {
            policies,
            storage,
            events,
            secrets,
        }
    }

    async fn checked_policy(&self, policy_id: &str) -> Result<BackupPolicy> {
        let policy = self.policies.get(policy_id).await?;
        if let Err(e) = policy.retention.validate(&policy.id) {
            warn!(policy_id, error = %e, "Retention evaluation skipped");
            self.events.publish(LifecycleEvent::ConfigurationError {
                entity: format!("policy/{policy_id}/retention"),
                message: e.to_string(),
            });
            return Err(e);
        }
        Ok(policy)
    }

    /// The plan `evaluate` would apply right now, without applying it.
    pub async fn dry_run(&self, policy_id: &str) -> Result<RetentionPlan> {
        let policy = self.checked_policy(policy_id).await?;
        let records = self.storage.index().list(policy_id).await?;
        let backup_type = policy.retention.effective_type(policy.backup_type);
        Ok(policy.retention.evaluate(backup_type, &records, Utc::now()))
    }

    #[instrument(skip(self))]
    pub async fn evaluate(&self, policy_id: &str) -> Result<RetentionOutcome> {
        self.evaluate_at(policy_id, Utc::now()).await
    }

    pub async fn evaluate_at(&self, policy_id: &str, now: DateTime<Utc>) -> Result<RetentionOutcome> {
        let policy = self.checked_policy(policy_id).await?;
        let backup_type = policy.retention.effective_type(policy.backup_type);

        let index = self.storage.index().clone();
        let guard = index.lock().await;
        let records = guard.list(policy_id).await?;
        let plan = policy.retention.evaluate(backup_type, &records, now);
        let by_id: HashMap<Uuid, &BackupRecord> = records.iter().map(|r| (r.id, r)).collect();

        let mut outcome = RetentionOutcome {
            policy_id: policy_id.to_string(),
            ..Default::default()
        };

        for decision in &plan.decisions {
            let Some(record) = by_id.get(&decision.record_id) else {
                continue;
            };
            match decision.action {
                RetentionAction::Keep => outcome.kept.push(record.id),
                RetentionAction::Delete => {
                    match self.storage.delete_record_objects(record).await {
                        Ok(()) => {
                            guard.remove(record.id).await?;
                            outcome.deleted.push(record.id);
                        }
                        Err(e) => {
                            error!(record_id = %record.id, error = %e, "Retention delete not confirmed, record kept");
                            outcome.failed.push(record.id);
                        }
                    }
                }
                RetentionAction::Archive => {
                    if !record.archived {
                        let mut updated = (*record).clone();
                        updated.archived = true;
                        guard.update(&updated).await?;
                    }
                    outcome.archived.push(record.id);
                }
                RetentionAction::Compress => match self.compress(&policy, record).await {
                    Ok(updated) => match guard.update(&updated).await {
                        Ok(()) => {
                            let stale: Vec<StoredLocation> = record
                                .locations
                                .iter()
                                .filter(|old| !updated.locations.contains(old))
                                .cloned()
                                .collect();
                            self.storage.discard_locations(record, &stale).await;
                            outcome.compressed.push(record.id);
                        }
                        Err(e) => {
                            let staged: Vec<StoredLocation> = updated
                                .locations
                                .iter()
                                .filter(|new| !record.locations.contains(new))
                                .cloned()
                                .collect();
                            self.storage.discard_locations(record, &staged).await;
                            return Err(e);
                        }
                    },
                    Err(e) => {
                        warn!(record_id = %record.id, error = %e, "Recompression failed, record left as it was");
                        outcome.failed.push(record.id);
                    }
                },
            }
        }

        info!(
            policy_id,
            kept = outcome.kept.len(),
            archived = outcome.archived.len(),
            deleted = outcome.deleted.len(),
            compressed = outcome.compressed.len(),
            failed = outcome.failed.len(),
            "Retention applied"
        );
        Ok(outcome)
    }

    /// Re-encodes a record at the strongest compression level and stages the
    /// new payload under fresh keys. The returned record points at the new
    /// copies; the old objects stay readable until the caller has indexed it.
    async fn compress(&self, policy: &BackupPolicy, record: &BackupRecord) -> Result<BackupRecord> {
        let (stored, _) = self.storage.read_record(record).await?;
        let keys = record_keys(record, &policy.encryption, self.secrets.as_ref()).await?;
        let target = record.compression.strongest();
        let (encoded, summary) = recompress(
            &stored,
            &record.compression,
            &target,
            record.encryption_algorithm,
            &keys,
            record.integrity.as_ref(),
        )
        .await?;

        if summary.content_checksum != record.content_checksum {
            return Err(BackupError::integrity(format!(
                "recompressed payload of {} does not match its checksum",
                record.id
            )));
        }

        let locations = self.storage.stage_record_objects(record, encoded).await?;
        let stored_size = locations
            .iter()
            .find(|l| l.is_readable())
            .map_or(record.stored_size_bytes, |l| l.size_bytes);

        let mut updated = record.clone();
        updated.locations = locations;
        updated.compression = target;
        updated.compressed_size_bytes = summary.compressed_size;
        updated.stored_size_bytes = stored_size;
        updated.compression_ratio = summary.compression_ratio();
        updated.block_count = summary.block_count;
        updated.integrity = record.integrity.as_ref().map(|_| summary.integrity.clone());
        updated.recompressed = true;
        Ok(updated)
    }

    /// Applies retention to every enabled policy. Failures of one policy do
    /// not stop the sweep.
    pub async fn sweep(&self) -> Vec<(String, Result<RetentionOutcome>)> {
        let mut results = Vec::new();
        for policy in self.policies.list().await {
            if !policy.enabled {
                continue;
            }
            let outcome = self.evaluate(&policy.id).await;
            results.push((policy.id, outcome));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::fixtures;

    fn daily(keep: usize, after_days: u32) -> RetentionPolicy {
        RetentionPolicy {
            daily: Some(TierRule {
                keep,
                after_days,
                overflow: OverflowAction::Delete,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_daily_keep_three_prunes_two_oldest() {
        let records: Vec<BackupRecord> =
            (2..7).map(|age| fixtures::record("nightly", age, 10)).collect();
        let plan = daily(3, 1).evaluate(BackupType::Full, &records, Utc::now());

        let deleted = plan.with_action(RetentionAction::Delete);
        assert_eq!(deleted.len(), 2);
        assert!(deleted.contains(&records[3].id));
        assert!(deleted.contains(&records[4].id));
        assert_eq!(plan.with_action(RetentionAction::Keep).len(), 3);
    }

    #[test]
    fn test_young_records_are_kept() {
        let records = vec![fixtures::record("nightly", 0, 10)];
        let plan = daily(0, 1).evaluate(BackupType::Full, &records, Utc::now());
        assert_eq!(plan.decisions[0].action, RetentionAction::Keep);
        assert_eq!(plan.decisions[0].tier, None);
    }

    #[test]
    fn test_record_counts_toward_coarsest_tier_only() {
        let mut policy = daily(1, 1);
        policy.weekly = Some(TierRule {
            keep: 1,
            after_days: 7,
            overflow: OverflowAction::Delete,
        });
        let records = vec![
            fixtures::record("nightly", 2, 10),
            fixtures::record("nightly", 8, 10),
            fixtures::record("nightly", 9, 10),
        ];
        let plan = policy.evaluate(BackupType::Full, &records, Utc::now());

        assert_eq!(plan.decisions[0].tier, Some(Tier::Daily));
        assert_eq!(plan.decisions[0].action, RetentionAction::Keep);
        assert_eq!(plan.decisions[1].tier, Some(Tier::Weekly));
        assert_eq!(plan.decisions[1].action, RetentionAction::Keep);
        assert_eq!(plan.decisions[2].action, RetentionAction::Delete);
    }

    #[test]
    fn test_other_backup_types_are_ignored() {
        let mut incremental = fixtures::record("nightly", 5, 10);
        incremental.backup_type = BackupType::Incremental;
        let plan = daily(0, 1).evaluate(BackupType::Full, &[incremental], Utc::now());
        assert!(plan.decisions.is_empty());
    }

    #[test]
    fn test_size_cap_evicts_oldest_but_never_newest() {
        let mut policy = RetentionPolicy::default();
        policy.max_size = Some(SizeCap {
            limit_bytes: 15,
            action: EvictionAction::DeleteOldest,
        });
        let records = vec![
            fixtures::record("nightly", 0, 20),
            fixtures::record("nightly", 1, 10),
            fixtures::record("nightly", 2, 10),
        ];
        let plan = policy.evaluate(BackupType::Full, &records, Utc::now());

        assert_eq!(plan.decisions[0].action, RetentionAction::Keep);
        assert_eq!(plan.decisions[1].action, RetentionAction::Delete);
        assert_eq!(plan.decisions[2].action, RetentionAction::Delete);
    }

    #[test]
    fn test_non_increasing_thresholds_conflict() {
        let mut policy = daily(7, 7);
        policy.weekly = Some(TierRule {
            keep: 4,
            after_days: 7,
            overflow: OverflowAction::Delete,
        });
        assert!(matches!(
            policy.validate("nightly"),
            Err(BackupError::RetentionConflict { .. })
        ));
    }

    #[test]
    fn test_expiry_uses_coarsest_tier() {
        let mut policy = daily(7, 1);
        policy.weekly = Some(TierRule {
            keep: 4,
            after_days: 7,
            overflow: OverflowAction::Delete,
        });
        let created = Utc::now();
        assert_eq!(policy.expiry_for(created), Some(created + Duration::days(35)));
    }
}
