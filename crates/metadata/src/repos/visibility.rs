//! Commit-graph visibility persistence.

use crate::authz::AuthzContext;
use crate::error::MetadataResult;
use crate::models::DirtyRepository;
use async_trait::async_trait;
use beacon_core::{CommitGraph, RefDescriptions, Upload, VisibilityOptions};
use std::collections::HashMap;

/// Summary of a [`VisibilityRepo::calculate_visible_uploads`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct VisibilityUpdate {
    pub repository_id: i64,
    /// Dirty token observed before computing.
    pub snapshot_token: i64,
    pub num_commits: usize,
    pub num_nearest: usize,
    pub num_visible_at_tip: usize,
    /// False when a newer run had already written its result.
    pub applied: bool,
    /// True when the repository was marked dirty again during the run.
    pub still_dirty: bool,
}

/// Repository for dirty markers and nearest-upload data.
#[async_trait]
pub trait VisibilityRepo: Send + Sync {
    /// Bump the dirty token of a repository and return the new value.
    async fn mark_repository_as_dirty(&self, repository_id: i64) -> MetadataResult<i64>;

    /// Dirty tokens of every repository whose visibility data is stale.
    async fn dirty_repositories(&self) -> MetadataResult<HashMap<i64, i64>>;

    async fn get_repository_dirty_state(
        &self,
        repository_id: i64,
    ) -> MetadataResult<Option<DirtyRepository>>;

    /// Recompute nearest uploads and tip visibility for one repository.
    ///
    /// `dirty_token` is the token observed when the repository was picked,
    /// before its graph was fetched; `None` reads the current token. Marks
    /// newer than that token leave the repository dirty.
    async fn calculate_visible_uploads(
        &self,
        repository_id: i64,
        dirty_token: Option<i64>,
        graph: &CommitGraph,
        refs: &RefDescriptions,
        options: &VisibilityOptions,
    ) -> MetadataResult<VisibilityUpdate>;

    /// Uploads visible from `commit`.
    async fn get_visible_uploads_at_commit(
        &self,
        authz: AuthzContext,
        repository_id: i64,
        commit: &str,
    ) -> MetadataResult<Vec<Upload>>;

    /// Uploads visible from `commit` whose root matches `path`.
    ///
    /// With `root_must_enclose_path` the root must be a prefix of the path;
    /// otherwise a root nested below the path matches as well.
    async fn find_closest_uploads(
        &self,
        authz: AuthzContext,
        repository_id: i64,
        commit: &str,
        path: &str,
        root_must_enclose_path: bool,
        indexer: Option<&str>,
    ) -> MetadataResult<Vec<Upload>>;
}
