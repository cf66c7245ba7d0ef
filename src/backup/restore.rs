//! Restore previews and the inverse pipeline.
//!
//! A preview resolves a scope against a record's manifest and the target's
//! live state without touching either. Its digest covers everything the
//! restore would do, so a restore is only accepted while a fresh preview
//! still produces the digest the caller accepted.

use super::encryption::{sha256_hex, SecretResolver};
use super::events::ProgressReporter;
use super::job::{JobControl, JobStage, RestoreJob};
use super::pipeline::{record_keys, split_frames, verify_integrity, PipelineReader};
use super::policy::PolicyStore;
use super::source::{LiveEntity, SourceRegistry};
use super::{BackupError, BackupRecord, EntityRef, ManifestEntry, Result};
use crate::storage::StorageManager;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Used when neither restores nor backups have produced a throughput yet
const FALLBACK_THROUGHPUT: f64 = 10.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ContentFilter {
    IdPrefix { prefix: String },
    IdIn { ids: Vec<String> },
}

impl ContentFilter {
    fn matches(&self, entity: &EntityRef) -> bool {
        match self {
            ContentFilter::IdPrefix { prefix } => entity.id.starts_with(prefix.as_str()),
            ContentFilter::IdIn { ids } => ids.iter().any(|id| id == &entity.id),
        }
    }
}

/// Subset of a backup a restore targets. Empty lists select everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RestoreScope {
    pub modules: Vec<String>,
    /// `module/table` or a bare table name
    pub tables: Vec<String>,
    pub date_range: Option<DateRange>,
    /// Every filter must match
    pub filters: Vec<ContentFilter>,
}

impl RestoreScope {
    pub fn matches(&self, entry: &ManifestEntry) -> bool {
        let entity = &entry.entity;
        let module_ok = self.modules.is_empty() || self.modules.contains(&entity.module);
        let table_ok = self.tables.is_empty()
            || self
                .tables
                .iter()
                .any(|t| *t == entity.table_path() || *t == entity.table);
        let date_ok = self
            .date_range
            .as_ref()
            .map_or(true, |range| range.contains(entry.modified_at));
        module_ok && table_ok && date_ok && self.filters.iter().all(|f| f.matches(entity))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RestoreOptions {
    pub overwrite: bool,
    /// Recompute the content checksum after decoding
    pub verify: bool,
    /// Run the whole pipeline but discard writes
    pub dry_run: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            verify: true,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    /// Replace the live copy
    Overwrite,
    /// Keep the live copy; only entities missing from the target are written
    Skip,
}

impl ConflictChoice {
    pub fn writes(self) -> bool {
        matches!(self, ConflictChoice::Overwrite)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoreConflict {
    pub entity: EntityRef,
    pub live_modified_at: DateTime<Utc>,
    pub backup_modified_at: DateTime<Utc>,
    pub choice: ConflictChoice,
}

/// Live entities are only ever replaced when the request asks for it, whatever
/// their age relative to the backed-up copy.
fn choose(options: &RestoreOptions, _live: &LiveEntity, _entry: &ManifestEntry) -> ConflictChoice {
    if options.overwrite {
        ConflictChoice::Overwrite
    } else {
        ConflictChoice::Skip
    }
}

/// Read-only estimate of what a restore would do. Never cached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestorePreview {
    pub backup_id: Uuid,
    pub policy_id: String,
    pub target: String,
    pub scope: RestoreScope,
    pub options: RestoreOptions,
    pub entities: Vec<EntityRef>,
    pub estimated_bytes: u64,
    pub estimated_duration_secs: u64,
    pub conflicts: Vec<RestoreConflict>,
    /// Qualified tables the selection depends on that are neither selected nor live
    pub missing_dependencies: Vec<String>,
    pub warnings: Vec<String>,
    pub summary: String,
    pub digest: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoreRequest {
    pub backup_id: Uuid,
    #[serde(default)]
    pub scope: RestoreScope,
    /// Defaults to the source of the record's policy
    pub target: Option<String>,
    #[serde(default)]
    pub options: RestoreOptions,
    /// Digest of the preview the caller accepted
    pub accepted_preview_digest: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RestoreReport {
    pub dry_run: bool,
    pub restored: u64,
    pub skipped: u64,
    pub overwritten: u64,
    pub bytes_restored: u64,
    pub entities: Vec<EntityRef>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

/// Preview inputs that determine its digest.
#[derive(Serialize)]
struct DigestInput<'a> {
    backup_id: Uuid,
    checksum: &'a str,
    target: &'a str,
    scope: &'a RestoreScope,
    options: &'a RestoreOptions,
    entities: &'a [EntityRef],
    conflicts: &'a [RestoreConflict],
    missing_dependencies: &'a [String],
}

#[derive(Debug)]
pub struct RestoreEngine {
    policies: Arc<PolicyStore>,
    storage: Arc<StorageManager>,
    sources: Arc<SourceRegistry>,
    secrets: Arc<dyn SecretResolver>,
    /// Observed restore throughput, bytes/s
    throughput: Mutex<Option<f64>>,
}

impl RestoreEngine {
    pub fn new(
        policies: Arc<PolicyStore>,
        storage: Arc<StorageManager>,
        sources: Arc<SourceRegistry>,
        secrets: Arc<dyn SecretResolver>,
    ) -> Self {
        Self {
            policies,
            storage,
            sources,
            secrets,
            throughput: Mutex::new(None),
        }
    }

    async fn resolve_target(&self, record: &BackupRecord, target: Option<&str>) -> Result<String> {
        match target {
            Some(target) => Ok(target.to_string()),
            None => Ok(self.policies.get(&record.policy_id).await?.source),
        }
    }

    async fn estimate_throughput(&self, record: &BackupRecord) -> f64 {
        let observed = *self.throughput.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(observed) = observed {
            return observed;
        }
        let history: Vec<f64> = self
            .storage
            .index()
            .list(&record.policy_id)
            .await
            .unwrap_or_default()
            .iter()
            .map(|r| r.throughput_bytes_per_sec)
            .filter(|t| *t > 0.0)
            .collect();
        if history.is_empty() {
            FALLBACK_THROUGHPUT
        } else {
            history.iter().sum::<f64>() / history.len() as f64
        }
    }

    fn record_throughput(&self, bytes: u64, seconds: f64) {
        if seconds <= 0.0 || bytes == 0 {
            return;
        }
        let sample = bytes as f64 / seconds;
        let mut observed = self.throughput.lock().unwrap_or_else(|e| e.into_inner());
        *observed = Some(match *observed {
            Some(previous) => previous * 0.7 + sample * 0.3,
            None => sample,
        });
    }

    /// Resolves `scope` against the record and the target's live state.
    #[instrument(skip(self, scope, options))]
    pub async fn preview(
        &self,
        backup_id: Uuid,
        scope: &RestoreScope,
        target: Option<&str>,
        options: &RestoreOptions,
    ) -> Result<RestorePreview> {
        let record = self.storage.index().get(backup_id).await?;
        let target_name = self.resolve_target(&record, target).await?;
        let target = self.sources.target(&target_name)?;
        let live: HashMap<EntityRef, LiveEntity> = target
            .live_entities()
            .await?
            .into_iter()
            .map(|l| (l.entity.clone(), l))
            .collect();

        let selected: Vec<&ManifestEntry> =
            record.manifest.iter().filter(|e| scope.matches(e)).collect();
        let entities: Vec<EntityRef> = selected.iter().map(|e| e.entity.clone()).collect();
        let estimated_bytes: u64 = selected.iter().map(|e| e.length).sum();

        let conflicts: Vec<RestoreConflict> = selected
            .iter()
            .filter_map(|entry| {
                let live = live.get(&entry.entity)?;
                Some(RestoreConflict {
                    entity: entry.entity.clone(),
                    live_modified_at: live.modified_at,
                    backup_modified_at: entry.modified_at,
                    choice: choose(options, live, entry),
                })
            })
            .collect();

        let selected_tables: BTreeSet<String> =
            selected.iter().map(|e| e.entity.table_path()).collect();
        let live_tables: BTreeSet<String> = live.keys().map(EntityRef::table_path).collect();
        let missing_dependencies: Vec<String> = selected
            .iter()
            .flat_map(|e| e.depends_on.iter())
            .filter(|t| !selected_tables.contains(*t) && !live_tables.contains(*t))
            .cloned()
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect();

        let mut warnings = Vec::new();
        if entities.is_empty() {
            warnings.push("scope selects no entities".to_string());
        }
        for table in &missing_dependencies {
            warnings.push(format!("missing dependency: {table}"));
        }
        let skipped = conflicts.iter().filter(|c| !c.choice.writes()).count();
        if skipped > 0 {
            warnings.push(format!("{skipped} live entities already exist and will be kept"));
        }
        if record.integrity.is_none() {
            warnings.push("backup has no integrity tag".to_string());
        }

        let throughput = self.estimate_throughput(&record).await;
        let estimated_duration_secs =
            ((record.stored_size_bytes + estimated_bytes) as f64 / throughput).ceil() as u64;

        let digest = {
            let input = DigestInput {
                backup_id,
                checksum: &record.content_checksum,
                target: &target_name,
                scope,
                options,
                entities: &entities,
                conflicts: &conflicts,
                missing_dependencies: &missing_dependencies,
            };
            sha256_hex(&serde_json::to_vec(&input)?)
        };

        let summary = format!(
            "{} entities ({} bytes) from backup {} into {}: {} conflicts, {} missing dependencies{}",
            entities.len(),
            estimated_bytes,
            backup_id,
            target_name,
            conflicts.len(),
            missing_dependencies.len(),
            if options.dry_run { ", dry run" } else { "" }
        );
        debug!(backup_id = %backup_id, digest = %digest, "Restore preview generated");

        Ok(RestorePreview {
            backup_id,
            policy_id: record.policy_id.clone(),
            target: target_name,
            scope: scope.clone(),
            options: options.clone(),
            entities,
            estimated_bytes,
            estimated_duration_secs,
            conflicts,
            missing_dependencies,
            warnings,
            summary,
            digest,
            generated_at: Utc::now(),
        })
    }

    /// Builds a restore job once a fresh preview matches the accepted digest.
    pub async fn accept(&self, request: &RestoreRequest) -> Result<RestoreJob> {
        let accepted = request
            .accepted_preview_digest
            .as_deref()
            .ok_or_else(|| BackupError::PreviewRequired {
                message: "no preview was accepted for this restore".to_string(),
            })?;

        let preview = self
            .preview(
                request.backup_id,
                &request.scope,
                request.target.as_deref(),
                &request.options,
            )
            .await?;
        if preview.digest != accepted {
            return Err(BackupError::PreviewRequired {
                message: "backup or live data changed since the preview was generated".to_string(),
            });
        }

        Ok(RestoreJob::new(
            request.backup_id,
            &preview.policy_id,
            request.scope.clone(),
            &preview.target,
            request.options.clone(),
        ))
    }

    /// read -> verify -> decrypt -> decompress -> write
    #[instrument(skip_all, fields(job_id = %job.id, backup_id = %job.backup_id))]
    pub async fn execute(
        &self,
        job: &RestoreJob,
        mut control: JobControl,
        reporter: &mut ProgressReporter,
    ) -> Result<RestoreReport> {
        let clock = Instant::now();
        let index = self.storage.index();

        reporter.set_stage(JobStage::Reading);
        let record = index.get(job.backup_id).await?;
        let (stored, location) = self.storage.read_record(&record).await?;
        debug!(provider = %location.provider, bytes = stored.len(), "Backup payload read");
        control.checkpoint().await?;

        if let Err(e) = index
            .update_with(record.id, |r| {
                r.access_count += 1;
                r.last_accessed = Some(Utc::now());
            })
            .await
        {
            warn!(record_id = %record.id, error = %e, "Failed to record access");
        }

        reporter.set_stage(JobStage::Verifying);
        let encryption = match self.policies.get(&record.policy_id).await {
            Ok(policy) => policy.encryption,
            Err(_) => Default::default(),
        };
        let keys = record_keys(&record, &encryption, self.secrets.as_ref()).await?;
        verify_integrity(&stored, &keys, record.integrity.as_ref())?;

        let frames = split_frames(&stored)?;
        let frame_count = frames.len() as u64;
        let mut reader = PipelineReader::new(&record.compression, record.encryption_algorithm, &keys)?;
        let mut plaintext = Vec::with_capacity(record.original_size_bytes as usize);
        for (position, frame) in frames.into_iter().enumerate() {
            control.checkpoint().await?;
            plaintext.extend(reader.decode_frame(position as u64, frame)?);
            reporter.update(JobStage::Decoding, position as u64 + 1, frame_count, None);
        }
        plaintext.extend(reader.finish()?);

        if job.options.verify && sha256_hex(&plaintext) != record.content_checksum {
            return Err(BackupError::integrity(format!(
                "content checksum mismatch for backup {}",
                record.id
            )));
        }

        let target = self.sources.target(&job.target)?;
        let live: HashMap<EntityRef, LiveEntity> = target
            .live_entities()
            .await?
            .into_iter()
            .map(|l| (l.entity.clone(), l))
            .collect();

        let plaintext = Bytes::from(plaintext);
        let selected: Vec<&ManifestEntry> = record
            .manifest
            .iter()
            .filter(|e| job.scope.matches(e))
            .collect();
        let total: u64 = selected.iter().map(|e| e.length).sum();
        let mut report = RestoreReport {
            dry_run: job.options.dry_run,
            ..RestoreReport::default()
        };

        for entry in selected {
            control.checkpoint().await?;
            let choice = live.get(&entry.entity).map(|l| choose(&job.options, l, entry));
            if choice.is_some_and(|c| !c.writes()) {
                report.skipped += 1;
                continue;
            }

            let start = usize::try_from(entry.offset).unwrap_or(usize::MAX);
            let end = start.saturating_add(entry.length as usize);
            if end > plaintext.len() {
                return Err(BackupError::integrity(format!(
                    "manifest entry {} lies outside the payload",
                    entry.entity
                )));
            }
            if !job.options.dry_run {
                target
                    .write_entity(&entry.entity, entry.modified_at, plaintext.slice(start..end))
                    .await?;
            }

            if choice.is_some() {
                report.overwritten += 1;
            }
            report.restored += 1;
            report.bytes_restored += entry.length;
            report.entities.push(entry.entity.clone());
            reporter.update(
                JobStage::Writing,
                report.bytes_restored,
                total,
                Some(entry.entity.to_string()),
            );
        }

        let restored_tables: BTreeSet<String> =
            report.entities.iter().map(EntityRef::table_path).collect();
        let live_tables: BTreeSet<String> = live.keys().map(EntityRef::table_path).collect();
        let missing: BTreeSet<&String> = record
            .manifest
            .iter()
            .filter(|e| job.scope.matches(e))
            .flat_map(|e| e.depends_on.iter())
            .filter(|t| !restored_tables.contains(*t) && !live_tables.contains(*t))
            .collect();
        report
            .warnings
            .extend(missing.into_iter().map(|t| format!("missing dependency: {t}")));

        let elapsed = clock.elapsed();
        report.duration_ms = elapsed.as_millis() as u64;
        self.record_throughput(record.stored_size_bytes + report.bytes_restored, elapsed.as_secs_f64());

        info!(
            restored = report.restored,
            skipped = report.skipped,
            dry_run = report.dry_run,
            "Restore pipeline finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(module: &str, table: &str, id: &str, day: u32) -> ManifestEntry {
        ManifestEntry {
            entity: EntityRef::new(module, table, id),
            modified_at: format!("2024-03-{day:02}T00:00:00Z").parse().unwrap(),
            offset: 0,
            length: 10,
            depends_on: vec![],
        }
    }

    #[test]
    fn test_scope_filters_compose() {
        let scope = RestoreScope {
            modules: vec!["clinical".to_string()],
            tables: vec!["patients".to_string()],
            date_range: Some(DateRange {
                from: Some("2024-03-05T00:00:00Z".parse().unwrap()),
                to: None,
            }),
            filters: vec![ContentFilter::IdPrefix {
                prefix: "p-".to_string(),
            }],
        };

        assert!(scope.matches(&entry("clinical", "patients", "p-1", 6)));
        assert!(!scope.matches(&entry("clinical", "patients", "p-1", 4)));
        assert!(!scope.matches(&entry("clinical", "visits", "p-1", 6)));
        assert!(!scope.matches(&entry("billing", "patients", "p-1", 6)));
        assert!(!scope.matches(&entry("clinical", "patients", "x-1", 6)));
    }

    #[test]
    fn test_qualified_table_names_match() {
        let scope = RestoreScope {
            tables: vec!["clinical/visits".to_string()],
            ..Default::default()
        };
        assert!(scope.matches(&entry("clinical", "visits", "v-1", 1)));
        assert!(!scope.matches(&entry("billing", "visits", "v-1", 1)));
        assert!(RestoreScope::default().matches(&entry("any", "thing", "1", 1)));
    }

    #[test]
    fn test_conflicts_only_write_when_overwrite_is_set() {
        let backup = entry("clinical", "patients", "p-1", 10);
        let newer_live = LiveEntity {
            entity: backup.entity.clone(),
            modified_at: "2024-03-12T00:00:00Z".parse().unwrap(),
        };
        let older_live = LiveEntity {
            entity: backup.entity.clone(),
            modified_at: "2024-03-08T00:00:00Z".parse().unwrap(),
        };

        let keep = RestoreOptions::default();
        assert_eq!(choose(&keep, &newer_live, &backup), ConflictChoice::Skip);
        assert_eq!(choose(&keep, &older_live, &backup), ConflictChoice::Skip);
        assert!(!choose(&keep, &older_live, &backup).writes());

        let overwrite = RestoreOptions {
            overwrite: true,
            ..Default::default()
        };
        assert_eq!(
            choose(&overwrite, &newer_live, &backup),
            ConflictChoice::Overwrite
        );
    }
}
