//! Janitor job bookkeeping.

use crate::error::{MetadataError, MetadataResult};
use crate::models::JanitorJobRow;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for janitor job runs.
#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Record a new job run.
    ///
    /// Fails with [`MetadataError::Constraint`] when a job of the same type
    /// is already queued or running.
    async fn create_job(&self, job: &JanitorJobRow) -> MetadataResult<()>;

    async fn get_job(&self, job_id: Uuid) -> MetadataResult<Option<JanitorJobRow>>;

    async fn update_job_state(
        &self,
        job_id: Uuid,
        state: JobState,
        finished_at: Option<OffsetDateTime>,
        stats_json: Option<&str>,
    ) -> MetadataResult<()>;

    /// Most recent runs, optionally of one type.
    async fn get_recent_jobs(
        &self,
        job_type: Option<JobType>,
        limit: u32,
    ) -> MetadataResult<Vec<JanitorJobRow>>;

    /// Queued or running jobs of one type.
    async fn get_active_jobs(&self, job_type: JobType) -> MetadataResult<Vec<JanitorJobRow>>;

    /// Every queued or running job. On startup these belong to a janitor
    /// process that exited without finishing them.
    async fn get_orphaned_jobs(&self) -> MetadataResult<Vec<JanitorJobRow>>;
}

/// Janitor job types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    /// Delete uploads stuck in `uploading`.
    StuckUploads,
    /// Delete uploads whose repository was deleted.
    OrphanedUploads,
    /// Soft-delete expired, unreferenced uploads.
    ExpiredUploads,
    /// Physically remove soft-deleted uploads.
    HardDelete,
    /// Recompute visibility of dirty repositories.
    Visibility,
    /// Resolve missing commit dates.
    CommitDates,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        Self::StuckUploads,
        Self::OrphanedUploads,
        Self::ExpiredUploads,
        Self::HardDelete,
        Self::Visibility,
        Self::CommitDates,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StuckUploads => "stuck_uploads",
            Self::OrphanedUploads => "orphaned_uploads",
            Self::ExpiredUploads => "expired_uploads",
            Self::HardDelete => "hard_delete",
            Self::Visibility => "visibility",
            Self::CommitDates => "commit_dates",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|job_type| job_type.as_str() == s)
            .ok_or_else(|| MetadataError::Validation(format!("unknown janitor job type: {s}")))
    }
}

/// Janitor job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Finished,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

/// Janitor job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobStats {
    /// Number of items examined.
    pub items_processed: u64,
    /// Number of uploads deleted.
    pub items_deleted: u64,
    /// Number of uploads updated in place.
    #[serde(default)]
    pub items_updated: u64,
    /// Number of batches executed.
    pub batches: u64,
    /// Errors encountered.
    pub errors: u64,
}
