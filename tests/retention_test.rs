mod test_helpers;

use anyhow::Result;
use backup_core::backup::retention::{
    EvictionAction, OverflowAction, RetentionAction, RetentionPlan, SizeCap, TierRule,
};
use backup_core::backup::{
    CompressionSettings, EncryptionAlgorithm, LocationRole, ReplicationStatus, RestoreOptions,
    RestoreRequest, RestoreScope, RetentionPolicy, StoredLocation,
};
use backup_core::storage::memory::MemoryProvider;
use backup_core::storage::{ReplicationMode, StorageProvider};
use backup_core::{BackupRecord, BackupType, JobStatus, Trigger};
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use test_helpers::{policy, provider_config, started, TestEnvironment};
use tracing_test::traced_test;
use uuid::Uuid;

fn record(now: DateTime<Utc>, age_hours: i64, size: u64) -> BackupRecord {
    let created_at = now - Duration::hours(age_hours);
    BackupRecord {
        id: Uuid::new_v4(),
        policy_id: "nightly".to_string(),
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
        throughput_bytes_per_sec: 1_000.0,
        content_checksum: String::new(),
        integrity: None,
        compression: CompressionSettings::default(),
        encryption_algorithm: EncryptionAlgorithm::None,
        key_salt: String::new(),
        block_count: 1,
        locations: vec![StoredLocation {
            provider: "primary".to_string(),
            key: format!("nightly/{age_hours}-{size}.bkc"),
            role: LocationRole::Primary,
            status: ReplicationStatus::Completed,
            size_bytes: size,
        }],
        manifest: Vec::new(),
        verification: None,
        archived: false,
        recompressed: false,
        access_count: 0,
        last_accessed: None,
        expires_at: None,
    }
}

/// What applying `plan` leaves behind: deletions drop records, archives flag them.
fn apply(records: &[BackupRecord], plan: &RetentionPlan) -> Vec<BackupRecord> {
    let actions: BTreeMap<Uuid, RetentionAction> =
        plan.decisions.iter().map(|d| (d.record_id, d.action)).collect();
    records
        .iter()
        .filter(|r| actions.get(&r.id) != Some(&RetentionAction::Delete))
        .cloned()
        .map(|mut r| {
            if actions.get(&r.id) == Some(&RetentionAction::Archive) {
                r.archived = true;
            }
            r
        })
        .collect()
}

fn state(records: &[BackupRecord]) -> Vec<(Uuid, bool)> {
    let mut state: Vec<(Uuid, bool)> = records.iter().map(|r| (r.id, r.archived)).collect();
    state.sort();
    state
}

fn overflow() -> impl Strategy<Value = OverflowAction> {
    prop_oneof![Just(OverflowAction::Delete), Just(OverflowAction::Archive)]
}

prop_compose! {
    fn tier(min_after: u32, max_after: u32)(
        keep in 0usize..6,
        after_days in min_after..max_after,
        overflow in overflow(),
    ) -> TierRule {
        TierRule { keep, after_days, overflow }
    }
}

prop_compose! {
    fn retention_policy()(
        daily in proptest::option::of(tier(0, 3)),
        weekly in proptest::option::of(tier(7, 15)),
        monthly in proptest::option::of(tier(30, 61)),
        yearly in proptest::option::of(tier(365, 400)),
        max_size in proptest::option::of((100u64..5_000, prop_oneof![
            Just(EvictionAction::DeleteOldest),
            Just(EvictionAction::Archive),
        ])),
    ) -> RetentionPolicy {
        RetentionPolicy {
            backup_type: None,
            daily,
            weekly,
            monthly,
            yearly,
            max_size: max_size.map(|(limit_bytes, action)| SizeCap { limit_bytes, action }),
        }
    }
}

proptest! {
    #[test]
    fn test_retention_is_idempotent(
        retention in retention_policy(),
        shapes in proptest::collection::vec((0i64..20_000, 1u64..1_000), 0..40),
    ) {
        prop_assert!(retention.validate("nightly").is_ok());
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let records: Vec<BackupRecord> =
            shapes.iter().map(|(age, size)| record(now, *age, *size)).collect();

        let first = retention.evaluate(BackupType::Full, &records, now);
        prop_assert_eq!(first.decisions.len(), records.len());
        let once = apply(&records, &first);

        let second = retention.evaluate(BackupType::Full, &once, now);
        prop_assert!(second.with_action(RetentionAction::Delete).is_empty());
        let twice = apply(&once, &second);
        prop_assert_eq!(state(&once), state(&twice));
    }
}

async fn run_backups(env: &TestEnvironment, count: usize) -> Result<()> {
    for _ in 0..count {
        let admission = env.orchestrator.submit_backup("nightly", Trigger::Manual).await?;
        let job = env.orchestrator.wait_for(started(&admission)).await?;
        assert_eq!(job.status, JobStatus::Completed);
    }
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_engine_prunes_once_and_then_keeps() -> Result<()> {
    let mut nightly = policy("nightly");
    nightly.retention.daily = Some(TierRule {
        keep: 2,
        after_days: 0,
        overflow: OverflowAction::Delete,
    });
    let env = TestEnvironment::new(vec![nightly]).await?;
    env.seed(3).await;
    run_backups(&env, 4).await?;

    let plan = env.retention.dry_run("nightly").await?;
    assert_eq!(plan.with_action(RetentionAction::Delete).len(), 2);
    assert_eq!(env.storage.index().list("nightly").await?.len(), 4);
    assert_eq!(env.provider.object_count(), 4);

    let first = env.retention.evaluate("nightly").await?;
    assert_eq!(first.deleted.len(), 2);
    assert_eq!(first.kept.len(), 2);
    assert!(first.failed.is_empty());

    let remaining = env.storage.index().list("nightly").await?;
    assert_eq!(remaining.len(), 2);
    assert_eq!(env.provider.object_count(), 2);
    // the newest backups survive
    assert!(remaining.iter().all(|r| !first.deleted.contains(&r.id)));

    let second = env.retention.evaluate("nightly").await?;
    assert!(second.deleted.is_empty());
    assert_eq!(second.kept.len(), 2);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_engine_archives_aged_records_without_deleting() -> Result<()> {
    let mut nightly = policy("nightly");
    nightly.retention.daily = Some(TierRule {
        keep: 7,
        after_days: 0,
        overflow: OverflowAction::Delete,
    });
    nightly.retention.monthly = Some(TierRule {
        keep: 0,
        after_days: 30,
        overflow: OverflowAction::Archive,
    });
    let env = TestEnvironment::new(vec![nightly]).await?;
    env.seed(2).await;
    run_backups(&env, 3).await?;

    let later = Utc::now() + Duration::days(31);
    let outcome = env.retention.evaluate_at("nightly", later).await?;
    assert_eq!(outcome.archived.len(), 3);
    assert!(outcome.deleted.is_empty());

    let records = env.storage.index().list("nightly").await?;
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.archived));
    assert_eq!(env.provider.object_count(), 3);

    let again = env.retention.evaluate_at("nightly", later).await?;
    assert!(again.deleted.is_empty());
    assert_eq!(env.storage.index().list("nightly").await?.len(), 3);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_sweep_covers_every_enabled_policy() -> Result<()> {
    let mut disabled = policy("paused");
    disabled.enabled = false;
    let env = TestEnvironment::new(vec![policy("nightly"), disabled]).await?;

    let results = env.retention.sweep().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "nightly");
    assert!(results[0].1.is_ok());
    Ok(())
}

async fn replicated_env() -> Result<(TestEnvironment, Arc<MemoryProvider>)> {
    let mut nightly = policy("nightly");
    nightly.storage.secondaries = vec!["replica".to_string()];
    nightly.storage.replication = ReplicationMode::Sync;
    nightly.retention.max_size = Some(SizeCap {
        limit_bytes: 1,
        action: EvictionAction::Compress,
    });
    let env = TestEnvironment::new(vec![nightly]).await?;
    let replica = Arc::new(MemoryProvider::new("replica"));
    env.storage
        .register_provider(provider_config("replica"), replica.clone())
        .await?;
    env.seed(3).await;
    run_backups(&env, 2).await?;
    Ok((env, replica))
}

#[tokio::test]
#[traced_test]
async fn test_compression_swaps_every_copy_and_drops_the_old_objects() -> Result<()> {
    let (env, replica) = replicated_env().await?;
    let before = env.storage.index().list("nightly").await?;

    let outcome = env.retention.evaluate("nightly").await?;
    assert_eq!(outcome.compressed.len(), 1);
    assert!(outcome.failed.is_empty());

    let record = env.storage.index().get(outcome.compressed[0]).await?;
    let old = before.iter().find(|r| r.id == record.id).expect("record was listed");
    assert!(record.recompressed);
    assert_eq!(record.locations.len(), 2);
    for (new, old) in record.locations.iter().zip(&old.locations) {
        assert_ne!(new.key, old.key);
        assert_eq!(new.status, ReplicationStatus::Completed);
    }
    assert!(env.provider.contains(&record.locations[0].key));
    assert!(replica.contains(&record.locations[1].key));
    assert!(!env.provider.contains(&old.locations[0].key));
    assert!(!replica.contains(&old.locations[1].key));
    assert_eq!(env.provider.object_count(), 2);
    assert_eq!(replica.object_count(), 2);

    assert_eq!(record.content_checksum, old.content_checksum);

    let admission = env
        .orchestrator
        .submit_restore(restore_request(&env, &record).await?)
        .await?;
    let job = env.orchestrator.wait_for_restore(started(&admission)).await?;
    assert_eq!(job.status, JobStatus::Completed);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_failed_compression_leaves_record_readable_everywhere() -> Result<()> {
    let (env, replica) = replicated_env().await?;
    let before = env.storage.index().list("nightly").await?;
    replica.fail_next_writes(1);

    let outcome = env.retention.evaluate("nightly").await?;
    assert!(outcome.compressed.is_empty());
    assert_eq!(outcome.failed.len(), 1);

    let record = env.storage.index().get(outcome.failed[0]).await?;
    let old = before.iter().find(|r| r.id == record.id).expect("record was listed");
    assert_eq!(&record, old);
    assert!(!record.recompressed);

    // both copies still hold the original payload, and nothing was staged
    assert_eq!(env.provider.object_count(), 2);
    assert_eq!(replica.object_count(), 2);
    let original = env.provider.read(&record.locations[0].key).await?;
    assert_eq!(replica.read(&record.locations[1].key).await?, original);

    let admission = env
        .orchestrator
        .submit_restore(restore_request(&env, &record).await?)
        .await?;
    let job = env.orchestrator.wait_for_restore(started(&admission)).await?;
    assert_eq!(job.status, JobStatus::Completed);
    Ok(())
}

async fn restore_request(env: &TestEnvironment, record: &BackupRecord) -> Result<RestoreRequest> {
    let scope = RestoreScope::default();
    let options = RestoreOptions {
        overwrite: true,
        ..Default::default()
    };
    let preview = env.restores.preview(record.id, &scope, None, &options).await?;
    Ok(RestoreRequest {
        backup_id: record.id,
        scope,
        target: None,
        options,
        accepted_preview_digest: Some(preview.digest),
    })
}
