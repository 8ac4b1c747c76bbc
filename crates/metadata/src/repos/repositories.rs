//! Repository records, permissions and scan selection.

use crate::error::MetadataResult;
use crate::models::Repository;
use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

/// Repository for locally mirrored repository records.
#[async_trait]
pub trait RepositoryRepo: Send + Sync {
    /// Insert or update a repository record.
    async fn upsert_repository(&self, repository: &Repository) -> MetadataResult<()>;

    async fn get_repository(&self, repository_id: i64) -> MetadataResult<Option<Repository>>;

    /// Mark a repository deleted. Its uploads are purged once the grace
    /// period has passed.
    async fn soft_delete_repository(
        &self,
        repository_id: i64,
        deleted_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    async fn grant_repository_permission(
        &self,
        repository_id: i64,
        user_id: i64,
    ) -> MetadataResult<()>;

    async fn revoke_repository_permission(
        &self,
        repository_id: i64,
        user_id: i64,
    ) -> MetadataResult<()>;

    /// Pick up to `limit` indexable repositories not scanned within
    /// `interval`, never-scanned first, and stamp them with `now`.
    async fn select_repositories_for_index_scan(
        &self,
        interval: Duration,
        limit: u32,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<i64>>;

    /// Pick up to `limit` repositories with completed uploads whose
    /// retention was not evaluated within `interval`, and stamp them.
    async fn select_repositories_for_retention_scan(
        &self,
        interval: Duration,
        limit: u32,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<i64>>;
}
