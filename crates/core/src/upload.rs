//! Upload records and the processing state machine.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Largest number of parts a single upload may declare.
pub const MAX_UPLOAD_PARTS: i64 = 10_000;

/// Processing state of an upload.
///
/// ```text
/// uploading -> queued -> processing -> completed -> deleting -> deleted
///                 ^                 \-> errored
///                 \------ requeue ------/
/// ```
///
/// Every state except `deleted` may also move straight to `deleted`, which is
/// how uploads that never completed are removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Multipart payload is still arriving.
    Uploading,
    /// Payload is complete and waiting for a worker.
    Queued,
    /// A worker claimed the upload.
    Processing,
    /// Processing succeeded; the upload is eligible for visibility.
    Completed,
    /// Processing failed.
    Errored,
    /// Soft-deleted, waiting for the hard-delete sweep.
    Deleting,
    /// Removed from every read path.
    Deleted,
}

impl UploadState {
    pub const ALL: [UploadState; 7] = [
        Self::Uploading,
        Self::Queued,
        Self::Processing,
        Self::Completed,
        Self::Errored,
        Self::Deleting,
        Self::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
        }
    }

    /// Check if a worker or the ingestion path may still move this upload forward.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Uploading | Self::Queued | Self::Processing)
    }

    /// Check if the upload is hidden from regular read paths.
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleting | Self::Deleted)
    }

    /// Check if the upload contributes package references to other uploads.
    pub fn holds_references(&self) -> bool {
        matches!(self, Self::Completed | Self::Deleting)
    }

    /// Check whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: UploadState) -> bool {
        use UploadState::*;
        match (self, next) {
            (Uploading, Queued) => true,
            (Queued, Processing) => true,
            (Processing, Completed) => true,
            (Uploading | Queued | Processing, Errored) => true,
            (Errored, Queued) => true,
            (Completed, Deleting) => true,
            (Deleted, Deleted) => false,
            (_, Deleted) => true,
            _ => false,
        }
    }

    /// Validate a transition, returning an error naming both states if illegal.
    pub fn validate_transition(&self, next: UploadState) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }

    /// All states from which `next` can be reached in one step.
    pub fn sources_of(next: UploadState) -> Vec<UploadState> {
        Self::ALL
            .iter()
            .copied()
            .filter(|state| state.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidUploadState(s.to_string()))
    }
}

/// When the commit an upload is pinned to was authored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitDate {
    /// The commit was resolved.
    At(#[serde(with = "time::serde::rfc3339")] OffsetDateTime),
    /// The version-control service could not resolve the commit.
    Unresolvable,
}

impl CommitDate {
    /// Check whether the commit predates `horizon`. Unresolvable commits
    /// are treated as infinitely old.
    pub fn is_before(&self, horizon: OffsetDateTime) -> bool {
        match self {
            Self::At(at) => *at < horizon,
            Self::Unresolvable => true,
        }
    }
}

/// A stored upload record as returned by read paths.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    pub id: i64,
    pub repository_id: i64,
    /// Denormalized for display; empty when the repository row is gone.
    pub repository_name: String,
    pub commit: String,
    /// Directory within the repository the index covers ("" for the root).
    pub root: String,
    pub indexer: String,
    pub state: UploadState,
    pub failure_message: Option<String>,
    pub num_failures: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub process_after: Option<OffsetDateTime>,
    pub committed_at: Option<CommitDate>,
    pub upload_size: Option<i64>,
    pub num_parts: i64,
    /// Sorted part indexes received so far.
    pub uploaded_parts: Vec<i64>,
    pub associated_index_id: Option<i64>,
    pub expired: bool,
    /// Number of other uploads depending on a package this upload exports.
    pub num_references: i64,
    pub visible_at_tip: bool,
    /// 1-based queue position, only present while queued.
    pub rank: Option<i64>,
}

impl Upload {
    /// Part indexes that have not been received yet.
    pub fn missing_parts(&self) -> Vec<i64> {
        let received: BTreeSet<i64> = self.uploaded_parts.iter().copied().collect();
        (0..self.num_parts)
            .filter(|index| !received.contains(index))
            .collect()
    }

    /// Check if an errored upload may no longer be requeued.
    pub fn retries_exhausted(&self, max_retries: u32) -> bool {
        self.state == UploadState::Errored && self.num_failures >= i64::from(max_retries)
    }
}

/// Request to create an upload record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewUpload {
    pub repository_id: i64,
    pub commit: String,
    pub root: String,
    pub indexer: String,
    /// Initial state, either `uploading` (multipart) or `queued` (single shot).
    pub state: UploadState,
    pub num_parts: i64,
    /// Parts already received. `None` on a queued insert means all parts.
    pub uploaded_parts: Option<Vec<i64>>,
    pub upload_size: Option<i64>,
    pub associated_index_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub process_after: Option<OffsetDateTime>,
}

impl NewUpload {
    /// Start a multipart upload with a single declared part.
    pub fn new(
        repository_id: i64,
        commit: impl Into<String>,
        root: impl Into<String>,
        indexer: impl Into<String>,
        uploaded_at: OffsetDateTime,
    ) -> Self {
        Self {
            repository_id,
            commit: commit.into(),
            root: root.into(),
            indexer: indexer.into(),
            state: UploadState::Uploading,
            num_parts: 1,
            uploaded_parts: None,
            upload_size: None,
            associated_index_id: None,
            uploaded_at,
            process_after: None,
        }
    }

    /// Validate the request before it is persisted.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_UPLOAD_PARTS).contains(&self.num_parts) {
            return Err(Error::InvalidUpload(format!(
                "num_parts must be between 1 and {MAX_UPLOAD_PARTS}, got {}",
                self.num_parts
            )));
        }
        if !matches!(self.state, UploadState::Uploading | UploadState::Queued) {
            return Err(Error::InvalidUpload(format!(
                "uploads cannot be created in state {}",
                self.state
            )));
        }
        if self.commit.trim().is_empty() {
            return Err(Error::InvalidUpload("commit must not be empty".to_string()));
        }
        if self.indexer.trim().is_empty() {
            return Err(Error::InvalidUpload("indexer must not be empty".to_string()));
        }
        if let Some(size) = self.upload_size.filter(|size| *size < 0) {
            return Err(Error::InvalidUpload(format!(
                "upload_size must not be negative, got {size}"
            )));
        }
        for &index in self.uploaded_parts.iter().flatten() {
            validate_part_index(index, self.num_parts)?;
        }
        Ok(())
    }

    /// Explicitly listed parts, deduplicated and sorted.
    pub fn initial_parts(&self) -> Vec<i64> {
        let unique: BTreeSet<i64> = self.uploaded_parts.iter().flatten().copied().collect();
        unique.into_iter().collect()
    }

    /// A queued insert without an explicit part list has received every part.
    pub fn has_all_parts(&self) -> bool {
        self.state == UploadState::Queued && self.uploaded_parts.is_none()
    }
}

/// Check that `index` addresses one of `num_parts` declared parts.
pub fn validate_part_index(index: i64, num_parts: i64) -> Result<()> {
    if index < 0 || index >= num_parts {
        return Err(Error::InvalidPartIndex { index, num_parts });
    }
    Ok(())
}

/// Truncate a failure message to at most `max_chars` characters.
pub fn truncate_failure_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((byte_offset, _)) => message[..byte_offset].to_string(),
        None => message.to_string(),
    }
}
