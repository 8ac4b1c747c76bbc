//! Retention and expiry.

use crate::error::MetadataResult;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository applying retention decisions.
#[async_trait]
pub trait RetentionRepo: Send + Sync {
    /// Clear the expired flag on `protected_ids`, set it on `expired_ids`
    /// and stamp both with the scan time. The sets must be disjoint.
    async fn update_upload_retention(
        &self,
        protected_ids: &[i64],
        expired_ids: &[i64],
        now: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Soft-delete expired uploads no live upload depends on.
    async fn soft_delete_expired_uploads(&self, limit: u32) -> MetadataResult<u64>;

    /// Soft-delete one expired upload, failing with a policy violation when
    /// it is not expired or is still referenced.
    async fn soft_delete_expired_upload(&self, upload_id: i64) -> MetadataResult<()>;

    /// Physically remove an upload and everything derived from it.
    /// Returns whether the row existed.
    async fn hard_delete_upload_by_id(&self, upload_id: i64) -> MetadataResult<bool>;

    /// Physically remove up to `limit` uploads in the `deleting` state.
    async fn hard_delete_uploads(&self, limit: u32) -> MetadataResult<u64>;
}
