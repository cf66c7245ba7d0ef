mod test_helpers;

use anyhow::Result;
use backup_core::backup::restore::{ConflictChoice, ContentFilter};
use backup_core::backup::{RestoreOptions, RestoreRequest, RestoreScope};
use backup_core::{BackupRecord, JobStatus, Trigger};
use bytes::Bytes;
use chrono::Utc;
use test_helpers::{contact, policy, started, TestEnvironment};
use tracing_test::traced_test;

fn payload(i: usize) -> String {
    format!("contact #{i} with some payload to compress")
}

async fn backed_up(env: &TestEnvironment, count: usize) -> Result<BackupRecord> {
    env.seed(count).await;
    let admission = env.orchestrator.submit_backup("crm", Trigger::Manual).await?;
    let job = env.orchestrator.wait_for(started(&admission)).await?;
    assert_eq!(job.status, JobStatus::Completed);
    let record_id = job.result.expect("completed job carries its record");
    Ok(env.storage.index().get(record_id).await?)
}

async fn request(
    env: &TestEnvironment,
    record: &BackupRecord,
    scope: RestoreScope,
    options: RestoreOptions,
) -> Result<RestoreRequest> {
    let preview = env
        .restores
        .preview(record.id, &scope, None, &options)
        .await?;
    Ok(RestoreRequest {
        backup_id: record.id,
        scope,
        target: None,
        options,
        accepted_preview_digest: Some(preview.digest),
    })
}

#[tokio::test]
#[traced_test]
async fn test_preview_reports_conflicts_and_is_stable() -> Result<()> {
    let env = TestEnvironment::new(vec![policy("crm")]).await?;
    let record = backed_up(&env, 4).await?;

    env.store.remove(&contact(0)).await;
    env.store
        .insert(contact(1), Utc::now(), "edited after the backup", Vec::new())
        .await;

    let scope = RestoreScope::default();
    let options = RestoreOptions::default();
    let preview = env.restores.preview(record.id, &scope, None, &options).await?;

    assert_eq!(preview.target, "app");
    assert_eq!(preview.entities.len(), 4);
    assert_eq!(preview.conflicts.len(), 3);
    assert!(preview.conflicts.iter().all(|c| c.choice == ConflictChoice::Skip));
    assert!(preview.estimated_bytes > 0);
    assert!(preview.missing_dependencies.is_empty());

    // previews have no side effects
    let again = env.restores.preview(record.id, &scope, None, &options).await?;
    assert_eq!(preview.digest, again.digest);
    assert_eq!(env.store.len().await, 3);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_scope_filters_select_entities() -> Result<()> {
    let env = TestEnvironment::new(vec![policy("crm")]).await?;
    let record = backed_up(&env, 5).await?;

    let scope = RestoreScope {
        tables: vec!["crm/contacts".to_string()],
        filters: vec![ContentFilter::IdIn {
            ids: vec!["c001".to_string(), "c003".to_string()],
        }],
        ..Default::default()
    };
    let preview = env
        .restores
        .preview(record.id, &scope, None, &RestoreOptions::default())
        .await?;
    assert_eq!(preview.entities, vec![contact(1), contact(3)]);

    let nothing = RestoreScope {
        modules: vec!["billing".to_string()],
        ..Default::default()
    };
    let preview = env
        .restores
        .preview(record.id, &nothing, None, &RestoreOptions::default())
        .await?;
    assert!(preview.entities.is_empty());
    assert!(preview.warnings.iter().any(|w| w.contains("no entities")));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_missing_dependencies_are_reported() -> Result<()> {
    let env = TestEnvironment::new(vec![policy("crm")]).await?;
    env.store
        .insert(
            contact(7),
            Utc::now(),
            "contact referencing an account",
            vec!["crm/accounts".to_string()],
        )
        .await;
    let record = backed_up(&env, 0).await?;

    let preview = env
        .restores
        .preview(record.id, &RestoreScope::default(), None, &RestoreOptions::default())
        .await?;
    assert_eq!(preview.missing_dependencies, vec!["crm/accounts".to_string()]);
    assert!(preview.warnings.iter().any(|w| w.contains("crm/accounts")));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_restore_requires_matching_preview() -> Result<()> {
    let env = TestEnvironment::new(vec![policy("crm")]).await?;
    let record = backed_up(&env, 3).await?;

    let mut unpreviewed = request(&env, &record, RestoreScope::default(), RestoreOptions::default()).await?;
    unpreviewed.accepted_preview_digest = None;
    let refused = env.orchestrator.submit_restore(unpreviewed).await;
    assert_eq!(refused.unwrap_err().code(), "PREVIEW_REQUIRED");

    let mut forged = request(&env, &record, RestoreScope::default(), RestoreOptions::default()).await?;
    forged.accepted_preview_digest = Some("0".repeat(64));
    let refused = env.orchestrator.submit_restore(forged).await;
    assert_eq!(refused.unwrap_err().code(), "PREVIEW_REQUIRED");

    // live data changed after the preview was accepted
    let stale = request(&env, &record, RestoreScope::default(), RestoreOptions::default()).await?;
    env.store.remove(&contact(2)).await;
    let refused = env.orchestrator.submit_restore(stale).await;
    assert_eq!(refused.unwrap_err().code(), "PREVIEW_REQUIRED");
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_restore_keeps_newer_live_entities() -> Result<()> {
    let env = TestEnvironment::new(vec![policy("crm")]).await?;
    let record = backed_up(&env, 4).await?;

    env.store.remove(&contact(0)).await;
    env.store.remove(&contact(1)).await;
    env.store
        .insert(contact(2), Utc::now(), "newer live copy", Vec::new())
        .await;

    let request = request(&env, &record, RestoreScope::default(), RestoreOptions::default()).await?;
    let admission = env.orchestrator.submit_restore(request).await?;
    let job = env.orchestrator.wait_for_restore(started(&admission)).await?;

    assert_eq!(job.status, JobStatus::Completed);
    let report = job.result.expect("completed restore carries its report");
    assert_eq!(report.restored, 2);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.overwritten, 0);
    assert!(!report.dry_run);

    assert_eq!(env.store.get(&contact(0)).await.as_deref(), Some(payload(0).as_bytes()));
    assert_eq!(env.store.get(&contact(1)).await.as_deref(), Some(payload(1).as_bytes()));
    assert_eq!(
        env.store.get(&contact(2)).await,
        Some(Bytes::from_static(b"newer live copy"))
    );

    let record = env.storage.index().get(record.id).await?;
    assert_eq!(record.access_count, 1);
    assert!(record.last_accessed.is_some());
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_restore_without_overwrite_keeps_older_live_entities() -> Result<()> {
    let env = TestEnvironment::new(vec![policy("crm")]).await?;
    let record = backed_up(&env, 2).await?;

    let stale = Utc::now() - chrono::Duration::days(30);
    env.store
        .insert(contact(1), stale, "older live copy", Vec::new())
        .await;

    let preview = env
        .restores
        .preview(record.id, &RestoreScope::default(), None, &RestoreOptions::default())
        .await?;
    let conflict = preview
        .conflicts
        .iter()
        .find(|c| c.entity == contact(1))
        .expect("older live copy is still a conflict");
    assert!(conflict.live_modified_at < conflict.backup_modified_at);
    assert_eq!(conflict.choice, ConflictChoice::Skip);

    let request = request(&env, &record, RestoreScope::default(), RestoreOptions::default()).await?;
    let admission = env.orchestrator.submit_restore(request).await?;
    let job = env.orchestrator.wait_for_restore(started(&admission)).await?;

    let report = job.result.expect("completed restore carries its report");
    assert_eq!(report.restored, 0);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.overwritten, 0);
    assert_eq!(
        env.store.get(&contact(1)).await,
        Some(Bytes::from_static(b"older live copy"))
    );
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_overwrite_replaces_live_entities() -> Result<()> {
    let env = TestEnvironment::new(vec![policy("crm")]).await?;
    let record = backed_up(&env, 3).await?;
    env.store
        .insert(contact(1), Utc::now(), "newer live copy", Vec::new())
        .await;

    let options = RestoreOptions {
        overwrite: true,
        ..Default::default()
    };
    let preview = env
        .restores
        .preview(record.id, &RestoreScope::default(), None, &options)
        .await?;
    assert!(preview
        .conflicts
        .iter()
        .all(|c| c.choice == ConflictChoice::Overwrite));

    let request = request(&env, &record, RestoreScope::default(), options).await?;
    let admission = env.orchestrator.submit_restore(request).await?;
    let job = env.orchestrator.wait_for_restore(started(&admission)).await?;

    let report = job.result.expect("completed restore carries its report");
    assert_eq!(report.restored, 3);
    assert_eq!(report.overwritten, 3);
    assert_eq!(env.store.get(&contact(1)).await.as_deref(), Some(payload(1).as_bytes()));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_dry_run_writes_nothing() -> Result<()> {
    let env = TestEnvironment::new(vec![policy("crm")]).await?;
    let record = backed_up(&env, 3).await?;
    for i in 0..3 {
        env.store.remove(&contact(i)).await;
    }

    let options = RestoreOptions {
        dry_run: true,
        ..Default::default()
    };
    let request = request(&env, &record, RestoreScope::default(), options).await?;
    let admission = env.orchestrator.submit_restore(request).await?;
    let job = env.orchestrator.wait_for_restore(started(&admission)).await?;

    assert_eq!(job.status, JobStatus::Completed);
    let report = job.result.expect("completed restore carries its report");
    assert!(report.dry_run);
    assert_eq!(report.restored, 3);
    assert_eq!(env.store.len().await, 0);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_corrupted_payload_fails_integrity_check() -> Result<()> {
    let env = TestEnvironment::new(vec![policy("crm")]).await?;
    let record = backed_up(&env, 3).await?;
    let key = record.primary_location().expect("primary location").key.clone();
    env.provider.corrupt(&key, Bytes::from_static(b"not the payload that was stored"));
    env.store.remove(&contact(0)).await;

    let request = request(&env, &record, RestoreScope::default(), RestoreOptions::default()).await?;
    let admission = env.orchestrator.submit_restore(request).await?;
    let job = env.orchestrator.wait_for_restore(started(&admission)).await?;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.expect("failed restore carries its error").code, "INTEGRITY_VIOLATION");
    assert!(env.store.get(&contact(0)).await.is_none());
    Ok(())
}
