//! Janitor job integration tests against an in-memory store.

mod common;

use beacon_core::CommitDate;
use beacon_janitor::JanitorState;
use beacon_janitor::metrics;
use beacon_janitor::jobs::{recover_orphaned_jobs, run_once, spawn_job};
use beacon_metadata::models::JanitorJobRow;
use beacon_metadata::repos::{
    JobRepo, JobState, JobStats, JobType, RepositoryRepo, RetentionRepo, UploadRepo,
    VisibilityRepo,
};
use beacon_metadata::{AuthzContext, UploadQuery};
use common::*;
use std::time::Duration as StdDuration;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

async fn last_job(metadata: &TestMetadata, job_type: JobType) -> JanitorJobRow {
    metadata
        .store
        .get_recent_jobs(Some(job_type), 1)
        .await
        .unwrap()
        .pop()
        .expect("job row recorded")
}

fn running_row(job_type: JobType) -> JanitorJobRow {
    JanitorJobRow {
        job_id: Uuid::new_v4(),
        job_type: job_type.as_str().to_string(),
        state: JobState::Running.as_str().to_string(),
        started_at: Some(OffsetDateTime::now_utc()),
        finished_at: None,
        stats_json: None,
    }
}

async fn is_live(metadata: &TestMetadata, upload_id: i64) -> bool {
    metadata
        .store
        .get_upload_by_id(AuthzContext::Internal, upload_id)
        .await
        .unwrap()
        .is_some()
}

/// Reap spawned tasks until none are left.
async fn wait_for_tasks(state: &JanitorState) {
    for _ in 0..200 {
        state.job_registry.check_tasks().await;
        if state.job_registry.tracked().await == 0 {
            return;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    panic!("janitor tasks did not finish");
}

#[tokio::test]
async fn test_stuck_uploads_are_deleted_in_batches() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 1, "github.com/foo/bar").await;
    let state = metadata.state(FakeGit::new());

    let two_days_ago = OffsetDateTime::now_utc() - Duration::days(2);
    let mut stuck = Vec::new();
    for commit in ["c1", "c2", "c3"] {
        stuck.push(uploading_upload(&metadata, 1, commit, two_days_ago).await);
    }
    let fresh = uploading_upload(&metadata, 1, "c4", OffsetDateTime::now_utc()).await;

    let stats = run_once(&state, JobType::StuckUploads)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.items_deleted, 3);
    assert_eq!(stats.batches, 2);
    assert_eq!(stats.errors, 0);

    for id in stuck {
        assert!(!is_live(&metadata, id).await);
    }
    assert!(is_live(&metadata, fresh).await);

    let job = last_job(&metadata, JobType::StuckUploads).await;
    assert_eq!(job.state, "finished");
    assert!(job.finished_at.is_some());
    let recorded: JobStats = serde_json::from_str(job.stats_json.as_deref().unwrap()).unwrap();
    assert_eq!(recorded, stats);
}

#[tokio::test]
async fn test_orphaned_uploads_respect_grace_period() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 1, "github.com/foo/old").await;
    add_repository(&metadata, 2, "github.com/foo/recent").await;
    let state = metadata.state(FakeGit::new());

    let old = completed_upload(&metadata, 1, "c1", "").await;
    let recent = completed_upload(&metadata, 2, "c1", "").await;
    let now = OffsetDateTime::now_utc();
    metadata
        .store
        .soft_delete_repository(1, now - Duration::hours(1))
        .await
        .unwrap();
    metadata.store.soft_delete_repository(2, now).await.unwrap();

    let stats = run_once(&state, JobType::OrphanedUploads)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.items_deleted, 1);
    assert!(!is_live(&metadata, old).await);
    assert!(is_live(&metadata, recent).await);
}

#[tokio::test]
async fn test_expired_uploads_are_soft_then_hard_deleted() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 1, "github.com/foo/bar").await;
    let state = metadata.state(FakeGit::new());

    let kept = completed_upload(&metadata, 1, "c1", "").await;
    let first = completed_upload(&metadata, 1, "c2", "").await;
    let second = completed_upload(&metadata, 1, "c3", "").await;
    metadata
        .store
        .update_upload_retention(&[kept], &[first, second], OffsetDateTime::now_utc())
        .await
        .unwrap();

    let stats = run_once(&state, JobType::ExpiredUploads)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.items_deleted, 2);

    let query = UploadQuery::new().include_deleted().ids([first, second]);
    let (deleting, _) = metadata
        .store
        .get_uploads(AuthzContext::Internal, &query)
        .await
        .unwrap();
    assert_eq!(deleting.len(), 2);

    let stats = run_once(&state, JobType::HardDelete)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.items_deleted, 2);
    let (remaining, _) = metadata
        .store
        .get_uploads(AuthzContext::Internal, &query)
        .await
        .unwrap();
    assert!(remaining.is_empty());
    assert!(is_live(&metadata, kept).await);
}

#[tokio::test]
async fn test_visibility_job_updates_dirty_repositories() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 1, "github.com/foo/bar").await;
    add_repository(&metadata, 2, "github.com/foo/unknown").await;
    add_repository(&metadata, 3, "github.com/foo/gone").await;
    let git = FakeGit::new().with_linear_history(
        "github.com/foo/bar",
        &["a", "b", "c"],
        OffsetDateTime::now_utc(),
    );
    let state = metadata.state(git);

    let upload = completed_upload(&metadata, 1, "a", "").await;
    completed_upload(&metadata, 2, "a", "").await;
    completed_upload(&metadata, 3, "a", "").await;
    metadata
        .store
        .soft_delete_repository(3, OffsetDateTime::now_utc())
        .await
        .unwrap();

    let stats = run_once(&state, JobType::Visibility)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.items_processed, 3);
    // The repository without a clone fails on its own.
    assert_eq!(stats.errors, 1);

    let visible = metadata
        .store
        .get_visible_uploads_at_commit(AuthzContext::Internal, 1, "c")
        .await
        .unwrap();
    let ids: Vec<i64> = visible.iter().map(|u| u.id).collect();
    assert_eq!(ids, vec![upload]);
    let tip = metadata
        .store
        .get_upload_by_id(AuthzContext::Internal, upload)
        .await
        .unwrap()
        .unwrap();
    assert!(tip.visible_at_tip);

    let dirty = metadata.store.dirty_repositories().await.unwrap();
    let mut dirty_ids: Vec<i64> = dirty.into_keys().collect();
    dirty_ids.sort_unstable();
    assert_eq!(dirty_ids, vec![2]);

    let job = last_job(&metadata, JobType::Visibility).await;
    assert_eq!(job.state, "failed");
}

#[tokio::test]
async fn test_repository_marked_during_run_stays_dirty() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 1, "github.com/foo/bar").await;
    let upload = completed_upload(&metadata, 1, "a", "").await;
    let git = FakeGit::new()
        .with_linear_history("github.com/foo/bar", &["a", "b"], OffsetDateTime::now_utc())
        .marking_dirty_during_fetch(metadata.store.clone(), 1);
    let state = metadata.state(git);

    let stats = run_once(&state, JobType::Visibility)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.items_processed, 1);
    assert_eq!(stats.errors, 0);

    // The result was written for the token seen before the fetch.
    let visible = metadata
        .store
        .get_visible_uploads_at_commit(AuthzContext::Internal, 1, "b")
        .await
        .unwrap();
    assert_eq!(visible.iter().map(|u| u.id).collect::<Vec<_>>(), vec![upload]);
    let dirty = metadata
        .store
        .get_repository_dirty_state(1)
        .await
        .unwrap()
        .unwrap();
    assert!(dirty.dirty_token > dirty.update_token);
    assert!(metadata.store.dirty_repositories().await.unwrap().contains_key(&1));

    // The next run picks it up again and settles.
    let stats = run_once(&state, JobType::Visibility)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.items_processed, 1);
    let dirty = metadata
        .store
        .get_repository_dirty_state(1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dirty.dirty_token, dirty.update_token);
    assert!(metadata.store.dirty_repositories().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_commit_dates_are_resolved() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 1, "github.com/foo/bar").await;
    add_repository(&metadata, 2, "github.com/foo/unknown").await;
    let committed = datetime!(2023-06-01 12:00 UTC);
    let git = FakeGit::new().with_linear_history("github.com/foo/bar", &["a", "b"], committed);
    let state = metadata.state(git);

    let known = completed_upload(&metadata, 1, "a", "").await;
    let missing = completed_upload(&metadata, 1, "deadbeef", "").await;
    let unreachable = completed_upload(&metadata, 2, "a", "").await;

    let stats = run_once(&state, JobType::CommitDates)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.items_updated, 2);
    assert_eq!(stats.items_deleted, 0);
    assert!(stats.errors >= 1);
    assert_eq!(
        metrics::UPLOADS_DELETED
            .with_label_values(&["commit_dates"])
            .get(),
        0
    );
    assert!(
        metrics::UPLOADS_UPDATED
            .with_label_values(&["commit_dates"])
            .get()
            >= 2
    );

    let committed_at = |id: i64| {
        let store = metadata.store.clone();
        async move {
            store
                .get_upload_by_id(AuthzContext::Internal, id)
                .await
                .unwrap()
                .unwrap()
                .committed_at
        }
    };
    assert_eq!(committed_at(known).await, Some(CommitDate::At(committed)));
    assert_eq!(committed_at(missing).await, Some(CommitDate::Unresolvable));
    assert_eq!(committed_at(unreachable).await, None);

    let pending = metadata
        .store
        .get_uploads_without_commit_date(10)
        .await
        .unwrap();
    let ids: Vec<i64> = pending.iter().map(|u| u.id).collect();
    assert_eq!(ids, vec![unreachable]);
}

#[tokio::test]
async fn test_run_skipped_while_another_is_active() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let state = metadata.state(FakeGit::new());

    metadata
        .store
        .create_job(&running_row(JobType::HardDelete))
        .await
        .unwrap();

    assert!(run_once(&state, JobType::HardDelete).await.unwrap().is_none());
    let jobs = metadata
        .store
        .get_recent_jobs(Some(JobType::HardDelete), 10)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);

    // Other job types still run.
    assert!(run_once(&state, JobType::ExpiredUploads).await.unwrap().is_some());
}

#[tokio::test]
async fn test_orphaned_jobs_are_recovered() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let first = running_row(JobType::HardDelete);
    let second = running_row(JobType::Visibility);
    metadata.store.create_job(&first).await.unwrap();
    metadata.store.create_job(&second).await.unwrap();

    assert_eq!(recover_orphaned_jobs(&metadata.store).await.unwrap(), 2);
    assert!(metadata.store.get_orphaned_jobs().await.unwrap().is_empty());

    let job = metadata.store.get_job(first.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, "failed");
    let stats: JobStats = serde_json::from_str(job.stats_json.as_deref().unwrap()).unwrap();
    assert_eq!(stats.errors, 1);

    assert_eq!(recover_orphaned_jobs(&metadata.store).await.unwrap(), 0);
}

#[tokio::test]
async fn test_spawned_job_finishes() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 1, "github.com/foo/bar").await;
    let state = metadata.state(FakeGit::new());
    uploading_upload(&metadata, 1, "c1", OffsetDateTime::now_utc() - Duration::days(2)).await;

    let job_id = spawn_job(&state, JobType::StuckUploads)
        .await
        .unwrap()
        .unwrap();
    wait_for_tasks(&state).await;

    let job = metadata.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, "finished");
    let stats: JobStats = serde_json::from_str(job.stats_json.as_deref().unwrap()).unwrap();
    assert_eq!(stats.items_deleted, 1);
}

#[tokio::test]
async fn test_watchdog_marks_panicked_job_failed() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 1, "github.com/foo/bar").await;
    completed_upload(&metadata, 1, "a", "").await;
    let state = metadata.state(FakeGit::new().panicking());

    let job_id = spawn_job(&state, JobType::Visibility)
        .await
        .unwrap()
        .unwrap();
    wait_for_tasks(&state).await;

    let job = metadata.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, "failed");
    let stats: serde_json::Value =
        serde_json::from_str(job.stats_json.as_deref().unwrap()).unwrap();
    assert_eq!(stats["panic"], serde_json::Value::Bool(true));

    // The row no longer blocks the next run.
    assert!(
        metadata
            .store
            .get_active_jobs(JobType::Visibility)
            .await
            .unwrap()
            .is_empty()
    );
}
