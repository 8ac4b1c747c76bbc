//! Janitor job bookkeeping tests.

mod common;

use beacon_metadata::ErrorKind;
use beacon_metadata::models::JanitorJobRow;
use beacon_metadata::repos::{JobRepo, JobState, JobType};
use common::*;
use uuid::Uuid;

fn job(job_type: JobType, offset_minutes: i64) -> JanitorJobRow {
    JanitorJobRow {
        job_id: Uuid::new_v4(),
        job_type: job_type.as_str().to_string(),
        state: JobState::Running.as_str().to_string(),
        started_at: Some(minutes(offset_minutes)),
        finished_at: None,
        stats_json: None,
    }
}

#[tokio::test]
async fn test_only_one_active_job_per_type() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();

    let first = job(JobType::HardDelete, 0);
    store.create_job(&first).await.unwrap();

    let err = store
        .create_job(&job(JobType::HardDelete, 1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // Other job types are independent.
    store.create_job(&job(JobType::Visibility, 1)).await.unwrap();

    store
        .update_job_state(
            first.job_id,
            JobState::Finished,
            Some(minutes(2)),
            Some(r#"{"items_processed":3}"#),
        )
        .await
        .unwrap();
    store.create_job(&job(JobType::HardDelete, 3)).await.unwrap();

    let finished = store.get_job(first.job_id).await.unwrap().unwrap();
    assert_eq!(finished.state, "finished");
    assert_eq!(finished.finished_at, Some(minutes(2)));
    assert_eq!(finished.stats_json.as_deref(), Some(r#"{"items_processed":3}"#));
}

#[tokio::test]
async fn test_job_listing() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();

    let stuck = job(JobType::StuckUploads, 0);
    let visibility = job(JobType::Visibility, 5);
    store.create_job(&stuck).await.unwrap();
    store.create_job(&visibility).await.unwrap();
    store
        .update_job_state(visibility.job_id, JobState::Failed, Some(minutes(6)), None)
        .await
        .unwrap();

    let recent = store.get_recent_jobs(None, 10).await.unwrap();
    let ids: Vec<Uuid> = recent.iter().map(|job| job.job_id).collect();
    assert_eq!(ids, vec![visibility.job_id, stuck.job_id]);

    let recent = store
        .get_recent_jobs(Some(JobType::Visibility), 10)
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].state, "failed");

    let active = store.get_active_jobs(JobType::StuckUploads).await.unwrap();
    assert_eq!(active.len(), 1);
    assert!(
        store
            .get_active_jobs(JobType::Visibility)
            .await
            .unwrap()
            .is_empty()
    );

    let orphaned = store.get_orphaned_jobs().await.unwrap();
    assert_eq!(orphaned.len(), 1);
    assert_eq!(orphaned[0].job_id, stuck.job_id);

    assert!(store.get_job(Uuid::new_v4()).await.unwrap().is_none());
}
