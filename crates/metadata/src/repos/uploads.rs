//! Upload record repository.

use crate::authz::AuthzContext;
use crate::error::MetadataResult;
use crate::query::UploadQuery;
use async_trait::async_trait;
use beacon_core::{CommitDate, NewUpload, Package, PackageReference, Upload};
use std::collections::HashMap;
use time::OffsetDateTime;

/// Result of [`UploadRepo::insert_upload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertedUpload {
    pub id: i64,
    /// Queue position when the upload was inserted as `queued`.
    pub rank: Option<i64>,
}

/// Repository for upload lifecycle operations.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Insert a new upload in the `uploading` or `queued` state.
    async fn insert_upload(&self, upload: &NewUpload) -> MetadataResult<InsertedUpload>;

    /// Move an upload from `uploading` to `queued`, recording its size if known.
    async fn mark_queued(&self, upload_id: i64, upload_size: Option<i64>) -> MetadataResult<()>;

    /// Record a received part. Re-adding a recorded part is a no-op.
    async fn add_upload_part(&self, upload_id: i64, part_index: i64) -> MetadataResult<()>;

    /// Move an active upload to `errored` and bump its failure count.
    async fn mark_failed(
        &self,
        upload_id: i64,
        failure_message: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Claim the first queued upload that is due, moving it to `processing`.
    async fn dequeue(&self, now: OffsetDateTime) -> MetadataResult<Option<Upload>>;

    /// Finish processing: store packages and references, update reference
    /// counts and mark the repository dirty.
    async fn mark_completed(
        &self,
        upload_id: i64,
        packages: &[Package],
        references: &[PackageReference],
        now: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Put an errored upload back on the queue while retries remain.
    async fn requeue(
        &self,
        upload_id: i64,
        process_after: Option<OffsetDateTime>,
    ) -> MetadataResult<()>;

    /// Get a single upload visible to `authz`. Deleted uploads are absent.
    async fn get_upload_by_id(
        &self,
        authz: AuthzContext,
        upload_id: i64,
    ) -> MetadataResult<Option<Upload>>;

    /// List uploads matching `query`, returning the page and the total count.
    async fn get_uploads(
        &self,
        authz: AuthzContext,
        query: &UploadQuery,
    ) -> MetadataResult<(Vec<Upload>, u64)>;

    async fn get_uploads_by_ids(
        &self,
        authz: AuthzContext,
        upload_ids: &[i64],
    ) -> MetadataResult<Vec<Upload>>;

    /// Distinct indexer names of visible uploads.
    async fn get_indexers(
        &self,
        authz: AuthzContext,
        repository_id: Option<i64>,
    ) -> MetadataResult<Vec<String>>;

    /// Soft-delete a completed upload, or delete any other live upload
    /// outright. Returns whether a live upload was found.
    async fn delete_upload_by_id(&self, upload_id: i64) -> MetadataResult<bool>;

    /// Delete uploads stuck in `uploading` since before `older_than`.
    async fn delete_uploads_stuck_uploading(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<u64>;

    /// Delete uploads of repositories soft-deleted longer ago than the grace
    /// period. Returns the number of uploads deleted per repository.
    async fn delete_uploads_without_repository(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<HashMap<i64, u64>>;

    async fn update_committed_at(
        &self,
        upload_id: i64,
        committed_at: CommitDate,
    ) -> MetadataResult<()>;

    /// Oldest resolved commit date among a repository's completed uploads.
    async fn get_oldest_commit_date(
        &self,
        repository_id: i64,
    ) -> MetadataResult<Option<OffsetDateTime>>;

    /// Completed uploads whose commit date has not been resolved yet.
    async fn get_uploads_without_commit_date(&self, limit: u32) -> MetadataResult<Vec<Upload>>;
}
