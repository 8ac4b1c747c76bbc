//! Upload lifecycle tests against the SQLite store.

mod common;

use beacon_core::{CommitDate, MAX_UPLOAD_PARTS, UploadState};
use beacon_metadata::repos::{RepositoryRepo, UploadRepo, VisibilityRepo};
use beacon_metadata::{
    AuthzContext, ErrorKind, MetadataStore, PermissionsPolicy, StoreOptions, UploadQuery,
};
use common::*;
use time::Duration;

#[tokio::test]
async fn test_multipart_upload_becomes_queued() {
    let metadata = TestMetadata::in_memory()
        .await
        .expect("failed to create test metadata");
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    let store = metadata.store();

    let mut request = uploading(50, "deadbeef", 1);
    request.root = "sub/".to_string();
    let inserted = store.insert_upload(&request).await.unwrap();
    assert_eq!(inserted.rank, None);

    store.add_upload_part(inserted.id, 0).await.unwrap();
    store.mark_queued(inserted.id, Some(300)).await.unwrap();

    let upload = store
        .get_upload_by_id(AuthzContext::Internal, inserted.id)
        .await
        .unwrap()
        .expect("upload should exist");
    assert_eq!(upload.state, UploadState::Queued);
    assert_eq!(upload.upload_size, Some(300));
    assert_eq!(upload.uploaded_parts, vec![0]);
    assert_eq!(upload.rank, Some(1));
    assert_eq!(upload.root, "sub/");
    assert_eq!(upload.repository_name, "github.com/foo/bar");
}

#[tokio::test]
async fn test_insert_validates_request() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();

    let err = store
        .insert_upload(&uploading(50, "deadbeef", 0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let mut request = uploading(50, "deadbeef", 2);
    request.uploaded_parts = Some(vec![2]);
    let err = store.insert_upload(&request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_queued_insert_defaults_to_all_parts() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    let store = metadata.store();

    let mut request = queued(50, "deadbeef", base_time());
    request.num_parts = 3;
    let inserted = store.insert_upload(&request).await.unwrap();
    assert_eq!(inserted.rank, Some(1));

    let upload = store
        .get_upload_by_id(AuthzContext::Internal, inserted.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upload.uploaded_parts, vec![0, 1, 2]);
    assert!(upload.missing_parts().is_empty());
}

#[tokio::test]
async fn test_part_count_is_bounded() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();

    let mut request = queued(50, "deadbeef", base_time());
    request.num_parts = i64::MAX;
    let err = store.insert_upload(&request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    request.num_parts = MAX_UPLOAD_PARTS;
    let inserted = store.insert_upload(&request).await.unwrap();
    let (parts, last): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), MAX(part_index) FROM upload_parts WHERE upload_id = ?",
    )
    .bind(inserted.id)
    .fetch_one(metadata.pool())
    .await
    .unwrap();
    assert_eq!(parts, MAX_UPLOAD_PARTS);
    assert_eq!(last, MAX_UPLOAD_PARTS - 1);
}

#[tokio::test]
async fn test_ranks_are_dense_and_follow_queue_order() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    let store = metadata.store();

    let first = store
        .insert_upload(&queued(50, "c1", minutes(0)))
        .await
        .unwrap();
    let second = store
        .insert_upload(&queued(50, "c2", minutes(1)))
        .await
        .unwrap();
    // Uploaded earliest but deferred past both others.
    let mut deferred = queued(50, "c3", minutes(-10));
    deferred.process_after = Some(minutes(5));
    let deferred = store.insert_upload(&deferred).await.unwrap();
    // Uploading rows never get a rank.
    let pending = store
        .insert_upload(&uploading(50, "c4", 1))
        .await
        .unwrap();

    let ranks = |id: i64, uploads: &[beacon_core::Upload]| {
        uploads
            .iter()
            .find(|upload| upload.id == id)
            .and_then(|upload| upload.rank)
    };

    let (uploads, total) = store
        .get_uploads(AuthzContext::Internal, &UploadQuery::new().repository(50))
        .await
        .unwrap();
    assert_eq!(total, 4);
    assert_eq!(ranks(first.id, &uploads), Some(1));
    assert_eq!(ranks(second.id, &uploads), Some(2));
    assert_eq!(ranks(deferred.id, &uploads), Some(3));
    assert_eq!(ranks(pending.id, &uploads), None);

    let claimed = store.dequeue(minutes(2)).await.unwrap().unwrap();
    assert_eq!(claimed.id, first.id);
    assert_eq!(claimed.state, UploadState::Processing);
    assert_eq!(claimed.rank, None);

    let (uploads, _) = store
        .get_uploads(AuthzContext::Internal, &UploadQuery::new().repository(50))
        .await
        .unwrap();
    assert_eq!(ranks(second.id, &uploads), Some(1));
    assert_eq!(ranks(deferred.id, &uploads), Some(2));
}

#[tokio::test]
async fn test_dequeue_respects_process_after() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    let store = metadata.store();

    let mut request = queued(50, "deadbeef", minutes(0));
    request.process_after = Some(minutes(10));
    let inserted = store.insert_upload(&request).await.unwrap();

    assert!(store.dequeue(minutes(5)).await.unwrap().is_none());

    let claimed = store.dequeue(minutes(10)).await.unwrap().unwrap();
    assert_eq!(claimed.id, inserted.id);
    assert_eq!(claimed.started_at, Some(minutes(10)));
    assert!(store.dequeue(minutes(20)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_mark_queued_errors() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    let store = metadata.store();

    let err = store.mark_queued(999, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let inserted = store
        .insert_upload(&queued(50, "deadbeef", base_time()))
        .await
        .unwrap();
    let err = store.mark_queued(inserted.id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let pending = store
        .insert_upload(&uploading(50, "deadbeef", 1))
        .await
        .unwrap();
    let err = store.mark_queued(pending.id, Some(-1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_add_upload_part_rules() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    let store = metadata.store();

    let err = store.add_upload_part(999, 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let inserted = store
        .insert_upload(&uploading(50, "deadbeef", 2))
        .await
        .unwrap();
    let err = store.add_upload_part(inserted.id, 2).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    // Re-sending a part is harmless.
    store.add_upload_part(inserted.id, 0).await.unwrap();
    store.add_upload_part(inserted.id, 0).await.unwrap();
    store.mark_queued(inserted.id, None).await.unwrap();

    store.add_upload_part(inserted.id, 0).await.unwrap();
    let err = store.add_upload_part(inserted.id, 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let upload = store
        .get_upload_by_id(AuthzContext::Internal, inserted.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upload.uploaded_parts, vec![0]);
    assert_eq!(upload.missing_parts(), vec![1]);
}

#[tokio::test]
async fn test_mark_failed_truncates_and_counts() {
    let options = StoreOptions {
        max_failure_message_len: 8,
        ..StoreOptions::default()
    };
    let metadata = TestMetadata::with_options(options).await.unwrap();
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    let store = metadata.store();

    let inserted = store
        .insert_upload(&queued(50, "deadbeef", base_time()))
        .await
        .unwrap();
    store.dequeue(minutes(1)).await.unwrap().unwrap();
    store
        .mark_failed(inserted.id, "indexer crashed with signal 9", minutes(2))
        .await
        .unwrap();

    let upload = store
        .get_upload_by_id(AuthzContext::Internal, inserted.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upload.state, UploadState::Errored);
    assert_eq!(upload.failure_message.as_deref(), Some("indexer "));
    assert_eq!(upload.num_failures, 1);
    assert_eq!(upload.finished_at, Some(minutes(2)));

    // Errored uploads cannot fail again.
    let err = store
        .mark_failed(inserted.id, "again", minutes(3))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_requeue_stops_at_retry_limit() {
    let options = StoreOptions {
        max_retries: 2,
        ..StoreOptions::default()
    };
    let metadata = TestMetadata::with_options(options).await.unwrap();
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    let store = metadata.store();

    let inserted = store
        .insert_upload(&queued(50, "deadbeef", base_time()))
        .await
        .unwrap();

    for attempt in 1..=2 {
        store.dequeue(minutes(attempt)).await.unwrap().unwrap();
        store
            .mark_failed(inserted.id, "boom", minutes(attempt))
            .await
            .unwrap();
        if attempt < 2 {
            store
                .requeue(inserted.id, Some(minutes(attempt)))
                .await
                .unwrap();
        }
    }

    let err = store.requeue(inserted.id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let upload = store
        .get_upload_by_id(AuthzContext::Internal, inserted.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upload.state, UploadState::Errored);
    assert_eq!(upload.num_failures, 2);
    assert!(upload.retries_exhausted(2));

    // Only errored uploads can be requeued.
    let fresh = store
        .insert_upload(&queued(50, "cafebabe", base_time()))
        .await
        .unwrap();
    let err = store.requeue(fresh.id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = store.requeue(999, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_delete_upload_by_id_by_state() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    let store = metadata.store();

    let completed = completed_upload(&metadata, 50, "c1", "", &[], &[]).await;
    let pending = store
        .insert_upload(&uploading(50, "c2", 1))
        .await
        .unwrap()
        .id;
    store.add_upload_part(pending, 0).await.unwrap();
    let before = store
        .get_repository_dirty_state(50)
        .await
        .unwrap()
        .unwrap()
        .dirty_token;

    assert!(store.delete_upload_by_id(completed).await.unwrap());
    assert!(store.delete_upload_by_id(pending).await.unwrap());
    assert!(!store.delete_upload_by_id(999).await.unwrap());

    // Uploads being deleted are hidden unless explicitly requested.
    assert!(
        store
            .get_uploads_by_ids(AuthzContext::Internal, &[completed])
            .await
            .unwrap()
            .is_empty()
    );
    let (deleting, _) = store
        .get_uploads(
            AuthzContext::Internal,
            &UploadQuery::new().include_deleted().ids([completed]),
        )
        .await
        .unwrap();
    assert_eq!(deleting[0].state, UploadState::Deleting);
    // Deleting twice is a no-op.
    assert!(store.delete_upload_by_id(completed).await.unwrap());

    // Deleted uploads drop out of every read path.
    assert!(
        store
            .get_upload_by_id(AuthzContext::Internal, pending)
            .await
            .unwrap()
            .is_none()
    );
    assert!(!store.delete_upload_by_id(pending).await.unwrap());
    let parts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_parts WHERE upload_id = ?")
        .bind(pending)
        .fetch_one(metadata.pool())
        .await
        .unwrap();
    assert_eq!(parts, 0);

    let after = store
        .get_repository_dirty_state(50)
        .await
        .unwrap()
        .unwrap()
        .dirty_token;
    assert_eq!(after, before + 2);
}

#[tokio::test]
async fn test_delete_uploads_stuck_uploading() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    let store = metadata.store();

    let mut old = uploading(50, "c1", 1);
    old.uploaded_at = minutes(-120);
    let old = store.insert_upload(&old).await.unwrap().id;
    store.add_upload_part(old, 0).await.unwrap();
    let mut recent = uploading(50, "c2", 1);
    recent.uploaded_at = minutes(-5);
    let recent = store.insert_upload(&recent).await.unwrap().id;
    let mut queued_old = queued(50, "c3", minutes(-120));
    queued_old.num_parts = 1;
    store.insert_upload(&queued_old).await.unwrap();

    let count = store
        .delete_uploads_stuck_uploading(minutes(-60), 100)
        .await
        .unwrap();
    assert_eq!(count, 1);

    let query = UploadQuery::new().include_deleted().ids([old, recent]);
    let (uploads, _) = store
        .get_uploads(AuthzContext::Internal, &query)
        .await
        .unwrap();
    let state_of = |id: i64| {
        uploads
            .iter()
            .find(|upload| upload.id == id)
            .map(|upload| upload.state)
    };
    assert_eq!(state_of(old), Some(UploadState::Deleted));
    assert_eq!(state_of(recent), Some(UploadState::Uploading));

    let part_rows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM upload_parts WHERE upload_id = ?")
            .bind(old)
            .fetch_one(metadata.pool())
            .await
            .unwrap();
    assert_eq!(part_rows, 0);
}

#[tokio::test]
async fn test_delete_uploads_without_repository_honours_grace_period() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    add_repository(&metadata, 51, "github.com/foo/baz").await;
    let store = metadata.store();

    let exporter = completed_upload(&metadata, 50, "c1", "", &[npm("left-pad")], &[]).await;
    let importer = completed_upload(&metadata, 51, "c2", "", &[], &[npm("left-pad")]).await;
    let queued_id = store
        .insert_upload(&queued(51, "c3", base_time()))
        .await
        .unwrap()
        .id;

    store.soft_delete_repository(51, minutes(0)).await.unwrap();

    // Within the 30 minute grace period nothing is touched.
    let counts = store
        .delete_uploads_without_repository(minutes(10), 100)
        .await
        .unwrap();
    assert!(counts.is_empty());

    let counts = store
        .delete_uploads_without_repository(minutes(31), 100)
        .await
        .unwrap();
    assert_eq!(counts.get(&51), Some(&2));
    assert_eq!(counts.len(), 1);

    let (uploads, _) = store
        .get_uploads(
            AuthzContext::Internal,
            &UploadQuery::new().include_deleted().ids([importer, queued_id]),
        )
        .await
        .unwrap();
    assert!(uploads.iter().all(|u| u.state == UploadState::Deleted));

    let exporter = store
        .get_upload_by_id(AuthzContext::Internal, exporter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exporter.num_references, 0);
}

#[tokio::test]
async fn test_get_uploads_filters_and_paginates() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    add_repository(&metadata, 51, "github.com/other/repo").await;
    let store = metadata.store();

    for (minute, commit) in ["aaa111", "bbb222", "ccc333"].iter().enumerate() {
        store
            .insert_upload(&queued(50, commit, minutes(minute as i64)))
            .await
            .unwrap();
    }
    let mut typescript = queued(51, "ddd444", minutes(10));
    typescript.indexer = "scip-typescript".to_string();
    store.insert_upload(&typescript).await.unwrap();

    let (page, total) = store
        .get_uploads(
            AuthzContext::Internal,
            &UploadQuery::new().repository(50).limit(2),
        )
        .await
        .unwrap();
    assert_eq!(total, 3);
    let commits: Vec<&str> = page.iter().map(|u| u.commit.as_str()).collect();
    assert_eq!(commits, vec!["ccc333", "bbb222"]);

    let (page, _) = store
        .get_uploads(
            AuthzContext::Internal,
            &UploadQuery::new().repository(50).oldest_first().limit(1).offset(1),
        )
        .await
        .unwrap();
    assert_eq!(page[0].commit, "bbb222");

    let (hits, total) = store
        .get_uploads(AuthzContext::Internal, &UploadQuery::new().term("typescript"))
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(hits[0].commit, "ddd444");

    // Repository names are searchable too.
    let (hits, _) = store
        .get_uploads(AuthzContext::Internal, &UploadQuery::new().term("other/"))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);

    // LIKE wildcards in the term match literally.
    let (hits, total) = store
        .get_uploads(AuthzContext::Internal, &UploadQuery::new().term("%"))
        .await
        .unwrap();
    assert!(hits.is_empty());
    assert_eq!(total, 0);

    let (hits, _) = store
        .get_uploads(
            AuthzContext::Internal,
            &UploadQuery::new()
                .uploaded_after(minutes(0))
                .uploaded_before(minutes(10)),
        )
        .await
        .unwrap();
    let commits: Vec<&str> = hits.iter().map(|u| u.commit.as_str()).collect();
    assert_eq!(commits, vec!["ccc333", "bbb222"]);

    let (hits, _) = store
        .get_uploads(
            AuthzContext::Internal,
            &UploadQuery::new().state(UploadState::Completed),
        )
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_dependency_filters() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    let store = metadata.store();

    let library = completed_upload(&metadata, 50, "c1", "lib/", &[npm("left-pad")], &[]).await;
    let app = completed_upload(&metadata, 50, "c1", "app/", &[], &[npm("left-pad")]).await;
    let unrelated = completed_upload(&metadata, 50, "c1", "docs/", &[], &[npm("react")]).await;

    let (dependencies, total) = store
        .get_uploads(AuthzContext::Internal, &UploadQuery::new().dependency_of(app))
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(dependencies[0].id, library);

    let (dependents, _) = store
        .get_uploads(
            AuthzContext::Internal,
            &UploadQuery::new().dependent_of(library),
        )
        .await
        .unwrap();
    let ids: Vec<i64> = dependents.iter().map(|u| u.id).collect();
    assert_eq!(ids, vec![app]);
    assert!(!ids.contains(&unrelated));
}

#[tokio::test]
async fn test_private_repositories_require_permission() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 50, "github.com/public/repo").await;
    add_private_repository(&metadata, 60, "github.com/private/repo").await;
    let store = metadata.store();

    let public = store
        .insert_upload(&queued(50, "c1", base_time()))
        .await
        .unwrap()
        .id;
    let private = store
        .insert_upload(&queued(60, "c2", base_time()))
        .await
        .unwrap()
        .id;

    let visible = |authz| {
        let store = store.clone();
        async move {
            let (uploads, total) = store
                .get_uploads(authz, &UploadQuery::new().oldest_first())
                .await
                .unwrap();
            assert_eq!(total as usize, uploads.len());
            uploads.into_iter().map(|u| u.id).collect::<Vec<_>>()
        }
    };

    assert_eq!(visible(AuthzContext::Internal).await, vec![public, private]);
    assert_eq!(visible(AuthzContext::Anonymous).await, vec![public]);
    assert_eq!(visible(AuthzContext::User(7)).await, vec![public]);

    store.grant_repository_permission(60, 7).await.unwrap();
    assert_eq!(visible(AuthzContext::User(7)).await, vec![public, private]);
    assert!(
        store
            .get_upload_by_id(AuthzContext::User(8), private)
            .await
            .unwrap()
            .is_none()
    );

    store.revoke_repository_permission(60, 7).await.unwrap();
    assert_eq!(visible(AuthzContext::User(7)).await, vec![public]);
}

#[tokio::test]
async fn test_enforced_user_mapping_hides_public_repositories() {
    let options = StoreOptions {
        permissions: PermissionsPolicy {
            enforce_user_mapping: true,
        },
        ..StoreOptions::default()
    };
    let metadata = TestMetadata::with_options(options).await.unwrap();
    add_repository(&metadata, 50, "github.com/public/repo").await;
    let store = metadata.store();

    let id = store
        .insert_upload(&queued(50, "c1", base_time()))
        .await
        .unwrap()
        .id;

    for authz in [AuthzContext::Anonymous, AuthzContext::User(7)] {
        assert!(store.get_upload_by_id(authz, id).await.unwrap().is_none());
    }

    store.grant_repository_permission(50, 7).await.unwrap();
    assert!(
        store
            .get_upload_by_id(AuthzContext::User(7), id)
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        store
            .get_upload_by_id(AuthzContext::Anonymous, id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_get_indexers() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    add_private_repository(&metadata, 60, "github.com/private/repo").await;
    let store = metadata.store();

    store
        .insert_upload(&queued(50, "c1", base_time()))
        .await
        .unwrap();
    let mut other = queued(60, "c2", base_time());
    other.indexer = "scip-java".to_string();
    store.insert_upload(&other).await.unwrap();

    let mut all = store
        .get_indexers(AuthzContext::Internal, None)
        .await
        .unwrap();
    all.sort();
    assert_eq!(all, vec!["scip-go", "scip-java"]);

    let scoped = store
        .get_indexers(AuthzContext::Internal, Some(60))
        .await
        .unwrap();
    assert_eq!(scoped, vec!["scip-java"]);

    let anonymous = store
        .get_indexers(AuthzContext::Anonymous, None)
        .await
        .unwrap();
    assert_eq!(anonymous, vec!["scip-go"]);
}

#[tokio::test]
async fn test_commit_dates() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    let store = metadata.store();

    let first = completed_upload(&metadata, 50, "c1", "", &[], &[]).await;
    let second = completed_upload(&metadata, 50, "c2", "", &[], &[]).await;
    let third = completed_upload(&metadata, 50, "c3", "", &[], &[]).await;

    let missing = store.get_uploads_without_commit_date(10).await.unwrap();
    let ids: Vec<i64> = missing.iter().map(|u| u.id).collect();
    assert_eq!(ids, vec![first, second, third]);
    assert_eq!(store.get_oldest_commit_date(50).await.unwrap(), None);

    store
        .update_committed_at(first, CommitDate::Unresolvable)
        .await
        .unwrap();
    store
        .update_committed_at(second, CommitDate::At(minutes(-60)))
        .await
        .unwrap();
    store
        .update_committed_at(third, CommitDate::At(minutes(-30)))
        .await
        .unwrap();

    // The unresolvable marker never counts as the oldest date.
    assert_eq!(
        store.get_oldest_commit_date(50).await.unwrap(),
        Some(minutes(-60))
    );
    assert!(
        store
            .get_uploads_without_commit_date(10)
            .await
            .unwrap()
            .is_empty()
    );

    let upload = store
        .get_upload_by_id(AuthzContext::Internal, first)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upload.committed_at, Some(CommitDate::Unresolvable));

    let err = store
        .update_committed_at(999, CommitDate::At(base_time()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_unit_of_work_rolls_back_on_drop() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    let store = metadata.store();

    let discarded = {
        let mut uow = store.begin().await.unwrap();
        let inserted = uow.insert_upload(&uploading(50, "c1", 2)).await.unwrap();
        uow.add_upload_part(inserted.id, 0).await.unwrap();
        let upload = uow.get_upload(inserted.id).await.unwrap().unwrap();
        assert_eq!(upload.uploaded_parts, vec![0]);
        inserted.id
    };
    assert!(
        store
            .get_upload_by_id(AuthzContext::Internal, discarded)
            .await
            .unwrap()
            .is_none()
    );

    let mut uow = store.begin().await.unwrap();
    let inserted = uow.insert_upload(&uploading(50, "c2", 1)).await.unwrap();
    uow.add_upload_part(inserted.id, 0).await.unwrap();
    uow.mark_queued(inserted.id, Some(42)).await.unwrap();
    uow.commit().await.unwrap();

    let upload = store
        .get_upload_by_id(AuthzContext::Internal, inserted.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upload.state, UploadState::Queued);
    assert_eq!(upload.upload_size, Some(42));
}

#[tokio::test]
async fn test_file_backed_store_persists() {
    let metadata = TestMetadata::new().await.unwrap();
    add_repository(&metadata, 50, "github.com/foo/bar").await;
    let store = metadata.store();

    let inserted = store
        .insert_upload(&queued(50, "deadbeef", base_time()))
        .await
        .unwrap();
    store.health_check().await.unwrap();

    let (uploads, total) = store
        .get_uploads(
            AuthzContext::Internal,
            &UploadQuery::new().uploaded_after(base_time() - Duration::hours(1)),
        )
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(uploads[0].id, inserted.id);
}
