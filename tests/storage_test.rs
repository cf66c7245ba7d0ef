mod test_helpers;

use anyhow::Result;
use backup_core::backup::{LifecycleEvent, ReplicationStatus};
use backup_core::storage::memory::MemoryProvider;
use backup_core::storage::{ReplicationMode, StorageProvider};
use backup_core::{BackupRecord, JobStatus, Trigger};
use std::sync::Arc;
use test_helpers::{policy, provider_config, started, TestEnvironment};
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

async fn replicated(mode: ReplicationMode) -> Result<(TestEnvironment, Arc<MemoryProvider>)> {
    let mut nightly = policy("nightly");
    nightly.storage.secondaries = vec!["replica".to_string()];
    nightly.storage.replication = mode;
    let env = TestEnvironment::new(vec![nightly]).await?;
    let replica = Arc::new(MemoryProvider::new("replica"));
    env.storage
        .register_provider(provider_config("replica"), replica.clone())
        .await?;
    env.seed(3).await;
    Ok((env, replica))
}

async fn backup(env: &TestEnvironment) -> Result<BackupRecord> {
    let admission = env.orchestrator.submit_backup("nightly", Trigger::Manual).await?;
    let job = env.orchestrator.wait_for(started(&admission)).await?;
    assert_eq!(job.status, JobStatus::Completed);
    let record_id = job.result.expect("completed job carries its record");
    Ok(env.storage.index().get(record_id).await?)
}

#[tokio::test]
#[traced_test]
async fn test_read_fails_over_to_replica_when_primary_is_down() -> Result<()> {
    let (env, replica) = replicated(ReplicationMode::Sync).await?;
    let record = backup(&env).await?;
    assert_eq!(record.locations.len(), 2);

    env.provider.set_unavailable(true);
    let (data, served_by) = env.storage.read_record(&record).await?;
    assert_eq!(served_by.provider, "replica");
    assert_eq!(data, replica.read(&served_by.key).await?);

    replica.set_unavailable(true);
    let err = env.storage.read_record(&record).await.unwrap_err();
    assert_eq!(err.code(), "PROVIDER_UNAVAILABLE");

    env.provider.set_unavailable(false);
    let (_, served_by) = env.storage.read_record(&record).await?;
    assert_eq!(served_by.provider, "primary");
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_missing_objects_everywhere_read_as_not_found() -> Result<()> {
    let (env, replica) = replicated(ReplicationMode::Sync).await?;
    let record = backup(&env).await?;

    for location in &record.locations {
        let provider: &MemoryProvider = if location.provider == "replica" {
            &replica
        } else {
            &env.provider
        };
        provider.delete(&location.key).await?;
    }
    let err = env.storage.read_record(&record).await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_async_replica_is_copied_after_the_backup_completes() -> Result<()> {
    let (env, replica) = replicated(ReplicationMode::Async).await?;
    let shutdown = CancellationToken::new();
    let worker = env
        .storage
        .start_replication_worker(shutdown.clone())
        .await
        .expect("first caller gets the queue");

    let record = backup(&env).await?;
    let pending = &record.locations[1];
    assert_eq!(pending.provider, "replica");
    assert!(!pending.is_readable());

    env.storage.wait_for_replication().await;
    let record = env.storage.index().get(record.id).await?;
    assert_eq!(record.locations[1].status, ReplicationStatus::Completed);
    assert!(replica.contains(&record.locations[1].key));

    shutdown.cancel();
    worker.await?;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_exhausted_async_replication_alerts_but_keeps_the_backup() -> Result<()> {
    let (env, replica) = replicated(ReplicationMode::Async).await?;
    let events = env.events.subscribe();
    let shutdown = CancellationToken::new();
    let worker = env
        .storage
        .start_replication_worker(shutdown.clone())
        .await
        .expect("first caller gets the queue");
    replica.set_unavailable(true);

    let record = backup(&env).await?;
    env.storage.wait_for_replication().await;

    let alert = std::iter::from_fn(|| events.try_recv()).find_map(|e| match e {
        LifecycleEvent::IntegrityAlert {
            record_id,
            provider,
            ..
        } => Some((record_id, provider)),
        _ => None,
    });
    assert_eq!(alert, Some((Some(record.id), Some("replica".to_string()))));

    // the backup itself stays completed and readable from the primary
    let job = env.orchestrator.get_job(record.job_id)?;
    assert_eq!(job.status, JobStatus::Completed);
    let record = env.storage.index().get(record.id).await?;
    assert_eq!(record.locations[0].status, ReplicationStatus::Completed);
    assert_eq!(record.locations[1].status, ReplicationStatus::Failed);
    let (_, served_by) = env.storage.read_record(&record).await?;
    assert_eq!(served_by.provider, "primary");

    shutdown.cancel();
    worker.await?;
    Ok(())
}
