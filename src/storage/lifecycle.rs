//! Lifecycle rules decide where a still-valid record lives.
//!
//! Rules are evaluated in order and the first one whose condition matches a
//! record wins. Retention decides whether a record exists at all; these rules
//! only relocate, archive or dispose of payloads based on age, size and how
//! often a record has been read.

use super::replication::StorageManager;
use crate::backup::{
    BackupError, BackupRecord, LocationRole, ReplicationStatus, Result, StoredLocation,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LifecycleCondition {
    pub min_age_days: Option<u32>,
    pub min_size_bytes: Option<u64>,
    /// Records read at most this many times
    pub max_access_count: Option<u64>,
}

impl LifecycleCondition {
    pub fn matches(&self, record: &BackupRecord, now: DateTime<Utc>) -> bool {
        let old_enough = self
            .min_age_days
            .map_or(true, |days| record.age_at(now).num_days() >= i64::from(days));
        let large_enough = self
            .min_size_bytes
            .map_or(true, |size| record.stored_size_bytes >= size);
        let cold_enough = self
            .max_access_count
            .map_or(true, |count| record.access_count <= count);
        old_enough && large_enough && cold_enough
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum LifecycleAction {
    /// Flag the record archived, moving the payload when a provider is named
    Archive { provider: Option<String> },
    Delete,
    Move { provider: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LifecycleRule {
    pub name: String,
    #[serde(default)]
    pub condition: LifecycleCondition,
    pub action: LifecycleAction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleDecision {
    pub record_id: Uuid,
    pub rule: String,
    pub action: LifecycleAction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LifecycleReport {
    pub archived: Vec<Uuid>,
    pub moved: Vec<Uuid>,
    pub deleted: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

fn already_applied(record: &BackupRecord, action: &LifecycleAction) -> bool {
    match action {
        LifecycleAction::Archive { .. } => record.archived,
        LifecycleAction::Move { provider } => record
            .primary_location()
            .is_some_and(|l| &l.provider == provider),
        LifecycleAction::Delete => false,
    }
}

/// Pure rule evaluation: one decision per record that needs action.
pub fn plan(
    records: &[BackupRecord],
    rules: &[LifecycleRule],
    now: DateTime<Utc>,
) -> Vec<LifecycleDecision> {
    records
        .iter()
        .filter_map(|record| {
            let rule = rules.iter().find(|r| r.condition.matches(record, now))?;
            if already_applied(record, &rule.action) {
                return None;
            }
            Some(LifecycleDecision {
                record_id: record.id,
                rule: rule.name.clone(),
                action: rule.action.clone(),
            })
        })
        .collect()
}

pub fn validate_rules(rules: &[LifecycleRule]) -> Result<()> {
    let mut names = std::collections::HashSet::new();
    for rule in rules {
        if rule.name.trim().is_empty() {
            return Err(BackupError::config("lifecycle rule name must not be empty"));
        }
        if !names.insert(rule.name.as_str()) {
            return Err(BackupError::config(format!(
                "duplicate lifecycle rule {}",
                rule.name
            )));
        }
    }
    Ok(())
}

#[derive(Debug)]
pub struct LifecycleService {
    storage: Arc<StorageManager>,
    rules: Vec<LifecycleRule>,
}

impl LifecycleService {
    pub fn new(storage: Arc<StorageManager>, rules: Vec<LifecycleRule>) -> Self {
        Self { storage, rules }
    }

    pub fn rules(&self) -> &[LifecycleRule] {
        &self.rules
    }

    #[instrument(skip(self))]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<LifecycleReport> {
        let index = self.storage.index().clone();
        let records = index.list_all().await?;
        let decisions = plan(&records, &self.rules, now);
        let mut report = LifecycleReport::default();

        for decision in decisions {
            let Some(record) = records.iter().find(|r| r.id == decision.record_id) else {
                continue;
            };
            let outcome = match &decision.action {
                LifecycleAction::Delete => self.delete(record).await,
                LifecycleAction::Archive { provider: None } => index
                    .update_with(record.id, |r| r.archived = true)
                    .await
                    .map(|_| ()),
                LifecycleAction::Archive {
                    provider: Some(target),
                } => self.relocate(record, target, LocationRole::Archive).await,
                LifecycleAction::Move { provider } => {
                    self.relocate(record, provider, LocationRole::Primary).await
                }
            };

            match outcome {
                Ok(()) => {
                    info!(record_id = %record.id, rule = %decision.rule, action = ?decision.action, "Lifecycle rule applied");
                    match decision.action {
                        LifecycleAction::Delete => report.deleted.push(record.id),
                        LifecycleAction::Archive { .. } => report.archived.push(record.id),
                        LifecycleAction::Move { .. } => report.moved.push(record.id),
                    }
                }
                Err(e) => {
                    warn!(record_id = %record.id, rule = %decision.rule, error = %e, "Lifecycle action failed");
                    report.failed.push(record.id);
                }
            }
        }

        Ok(report)
    }

    async fn delete(&self, record: &BackupRecord) -> Result<()> {
        self.storage.delete_record_objects(record).await?;
        let guard = self.storage.index().lock().await;
        guard.remove(record.id).await
    }

    /// Copies the payload to `target`, points the record at the new copy and
    /// removes the copies it replaces.
    async fn relocate(&self, record: &BackupRecord, target: &str, role: LocationRole) -> Result<()> {
        let source = record
            .read_order()
            .first()
            .map(|l| (*l).clone())
            .ok_or_else(|| BackupError::storage(format!("record {} has no readable copy", record.id)))?;

        let size = self
            .storage
            .copy_object(&source.provider, target, &source.key)
            .await?;

        let new_location = StoredLocation {
            provider: target.to_string(),
            key: source.key.clone(),
            role,
            status: ReplicationStatus::Completed,
            size_bytes: size,
        };
        // archiving moves every copy; a move only replaces the primary
        let replaced =
            |l: &StoredLocation| role == LocationRole::Archive || l.role == LocationRole::Primary;
        let previous: Vec<StoredLocation> = record
            .locations
            .iter()
            .filter(|l| replaced(*l) && l.provider != target)
            .cloned()
            .collect();
        let mut locations: Vec<StoredLocation> = record
            .locations
            .iter()
            .filter(|l| !replaced(*l) && l.provider != target)
            .cloned()
            .collect();
        locations.insert(0, new_location);

        self.storage
            .index()
            .update_with(record.id, |r| {
                r.locations = locations;
                if role == LocationRole::Archive {
                    r.archived = true;
                }
            })
            .await?;

        for location in previous {
            if let Err(e) = self.storage.delete_location(&location).await {
                warn!(record_id = %record.id, provider = %location.provider, error = %e, "Old copy not removed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::fixtures;

    fn record(age_days: i64, size: u64, access_count: u64) -> BackupRecord {
        let mut record = fixtures::record("nightly", age_days, size);
        record.locations[0].provider = "hot".to_string();
        record.access_count = access_count;
        record
    }

    fn rules() -> Vec<LifecycleRule> {
        vec![
            LifecycleRule {
                name: "purge-ancient".to_string(),
                condition: LifecycleCondition {
                    min_age_days: Some(365),
                    ..Default::default()
                },
                action: LifecycleAction::Delete,
            },
            LifecycleRule {
                name: "cold-after-90".to_string(),
                condition: LifecycleCondition {
                    min_age_days: Some(90),
                    max_access_count: Some(2),
                    ..Default::default()
                },
                action: LifecycleAction::Move {
                    provider: "cold".to_string(),
                },
            },
        ]
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let records = vec![record(400, 10, 0), record(100, 10, 0), record(10, 10, 0)];
        let decisions = plan(&records, &rules(), Utc::now());

        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].action, LifecycleAction::Delete);
        assert_eq!(decisions[1].rule, "cold-after-90");
    }

    #[test]
    fn test_frequently_read_records_stay_hot() {
        let records = vec![record(100, 10, 5)];
        assert!(plan(&records, &rules(), Utc::now()).is_empty());
    }

    #[test]
    fn test_applied_actions_are_not_repeated() {
        let mut moved = record(100, 10, 0);
        moved.locations[0].provider = "cold".to_string();
        assert!(plan(&[moved], &rules(), Utc::now()).is_empty());
    }

    #[test]
    fn test_duplicate_rule_names_rejected() {
        let mut rules = rules();
        rules[1].name = "purge-ancient".to_string();
        assert!(validate_rules(&rules).is_err());
    }
}
