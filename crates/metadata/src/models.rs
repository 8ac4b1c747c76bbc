//! Database models mapping to the metadata schema.

use crate::error::MetadataError;
use crate::timestamp::{commit_date_from_db, from_micros};
use beacon_core::{Package, PackageKey, PackageReference, Upload, UploadMeta, UploadState};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Uploads
// =============================================================================

/// Upload record joined with its repository name, received parts, tip
/// visibility and queue rank. Timestamps are Unix microseconds.
#[derive(Debug, Clone, FromRow)]
pub struct UploadRow {
    pub id: i64,
    pub repository_id: i64,
    pub repository_name: String,
    pub commit_sha: String,
    pub root: String,
    pub indexer: String,
    pub state: String,
    pub failure_message: Option<String>,
    pub num_failures: i64,
    pub uploaded_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub process_after: Option<i64>,
    pub committed_at: Option<i64>,
    pub upload_size: Option<i64>,
    pub num_parts: i64,
    /// Comma-separated part indexes, NULL when none were received.
    pub uploaded_parts: Option<String>,
    pub associated_index_id: Option<i64>,
    pub expired: bool,
    pub num_references: i64,
    pub visible_at_tip: bool,
    #[sqlx(rename = "queue_rank")]
    pub rank: Option<i64>,
}

impl TryFrom<UploadRow> for Upload {
    type Error = MetadataError;

    fn try_from(row: UploadRow) -> Result<Self, Self::Error> {
        let state: UploadState = row.state.parse()?;

        let mut uploaded_parts = match row.uploaded_parts.as_deref() {
            None | Some("") => Vec::new(),
            Some(parts) => parts
                .split(',')
                .map(|part| {
                    part.trim().parse::<i64>().map_err(|e| {
                        MetadataError::Internal(format!(
                            "corrupt part index {part:?} on upload {}: {e}",
                            row.id
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        uploaded_parts.sort_unstable();

        Ok(Upload {
            id: row.id,
            repository_id: row.repository_id,
            repository_name: row.repository_name,
            commit: row.commit_sha,
            root: row.root,
            indexer: row.indexer,
            state,
            failure_message: row.failure_message,
            num_failures: row.num_failures,
            uploaded_at: from_micros(row.uploaded_at),
            started_at: row.started_at.map(from_micros),
            finished_at: row.finished_at.map(from_micros),
            process_after: row.process_after.map(from_micros),
            committed_at: row.committed_at.map(commit_date_from_db),
            upload_size: row.upload_size,
            num_parts: row.num_parts,
            uploaded_parts,
            associated_index_id: row.associated_index_id,
            expired: row.expired,
            num_references: row.num_references,
            visible_at_tip: row.visible_at_tip,
            rank: row.rank,
        })
    }
}

/// Columns of a completed upload consumed by the visibility engine.
#[derive(Debug, Clone, FromRow)]
pub struct UploadMetaRow {
    pub id: i64,
    pub commit_sha: String,
    pub root: String,
    pub finished_at: Option<i64>,
    pub committed_at: Option<i64>,
}

impl From<UploadMetaRow> for UploadMeta {
    fn from(row: UploadMetaRow) -> Self {
        UploadMeta {
            id: row.id,
            commit: row.commit_sha,
            root: row.root,
            finished_at: row.finished_at.map(from_micros),
            committed_at: row.committed_at.map(commit_date_from_db),
        }
    }
}

/// Minimal state snapshot used to validate transitions.
#[derive(Debug, Clone, FromRow)]
pub struct UploadStateRow {
    pub id: i64,
    pub repository_id: i64,
    pub state: String,
    pub num_parts: i64,
    pub num_failures: i64,
    pub expired: bool,
    pub num_references: i64,
}

impl UploadStateRow {
    pub fn state(&self) -> Result<UploadState, MetadataError> {
        Ok(self.state.parse()?)
    }
}

// =============================================================================
// Packages
// =============================================================================

/// Row shared by the `packages` and `package_references` tables.
#[derive(Debug, Clone, FromRow)]
pub struct PackageRow {
    pub upload_id: i64,
    pub scheme: String,
    pub name: String,
    pub version: String,
}

impl PackageRow {
    fn key(self) -> (i64, PackageKey) {
        (
            self.upload_id,
            PackageKey {
                scheme: self.scheme,
                name: self.name,
                version: self.version,
            },
        )
    }
}

impl From<PackageRow> for Package {
    fn from(row: PackageRow) -> Self {
        let (upload_id, key) = row.key();
        Package::new(upload_id, key)
    }
}

impl From<PackageRow> for PackageReference {
    fn from(row: PackageRow) -> Self {
        let (upload_id, key) = row.key();
        PackageReference::new(upload_id, key)
    }
}

// =============================================================================
// Repositories
// =============================================================================

/// Locally mirrored repository record.
#[derive(Debug, Clone, FromRow)]
pub struct RepositoryRow {
    pub id: i64,
    pub name: String,
    pub private: bool,
    /// Whether the repository belongs to the active search context.
    pub indexable: bool,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

/// Repository record with decoded timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    pub private: bool,
    pub indexable: bool,
    pub created_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
}

impl Repository {
    /// A public, indexable repository.
    pub fn new(id: i64, name: impl Into<String>, created_at: OffsetDateTime) -> Self {
        Self {
            id,
            name: name.into(),
            private: false,
            indexable: true,
            created_at,
            deleted_at: None,
        }
    }
}

impl From<RepositoryRow> for Repository {
    fn from(row: RepositoryRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            private: row.private,
            indexable: row.indexable,
            created_at: from_micros(row.created_at),
            deleted_at: row.deleted_at.map(from_micros),
        }
    }
}

// =============================================================================
// Visibility bookkeeping
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct DirtyRepositoryRow {
    pub repository_id: i64,
    pub dirty_token: i64,
    pub update_token: i64,
    pub updated_at: Option<i64>,
}

/// Dirty marker for one repository.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyRepository {
    pub repository_id: i64,
    pub dirty_token: i64,
    /// Last dirty token whose visibility data was written.
    pub update_token: i64,
    pub updated_at: Option<OffsetDateTime>,
}

impl DirtyRepository {
    pub fn is_dirty(&self) -> bool {
        self.dirty_token > self.update_token
    }
}

impl From<DirtyRepositoryRow> for DirtyRepository {
    fn from(row: DirtyRepositoryRow) -> Self {
        Self {
            repository_id: row.repository_id,
            dirty_token: row.dirty_token,
            update_token: row.update_token,
            updated_at: row.updated_at.map(from_micros),
        }
    }
}

// =============================================================================
// Janitor jobs
// =============================================================================

/// Bookkeeping row for one janitor job run.
#[derive(Debug, Clone, FromRow)]
pub struct JanitorJobRow {
    pub job_id: Uuid,
    pub job_type: String,
    pub state: String,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
    pub stats_json: Option<String>,
}
