use super::INSERT_BATCH_SIZE;
use super::uploads::fetch_uploads;
use crate::authz::AuthzContext;
use crate::error::MetadataResult;
use crate::models::{DirtyRepository, DirtyRepositoryRow, UploadMetaRow};
use crate::query::UploadQuery;
use crate::repos::{VisibilityRepo, VisibilityUpdate};
use crate::store::SqliteStore;
use crate::timestamp::to_micros;
use async_trait::async_trait;
use beacon_core::{
    CommitGraph, RefDescriptions, Upload, UploadMeta, VisibilityGraph, VisibilityOptions,
};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashMap;

/// Increment the dirty token of a repository, creating the marker if needed.
pub(crate) async fn mark_dirty(
    conn: &mut SqliteConnection,
    repository_id: i64,
) -> MetadataResult<i64> {
    let token: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO dirty_repositories (repository_id, dirty_token, update_token)
        VALUES (?, 1, 0)
        ON CONFLICT (repository_id) DO UPDATE SET dirty_token = dirty_token + 1
        RETURNING dirty_token
        "#,
    )
    .bind(repository_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(token)
}

/// One `upload_visible_at_tip` row.
struct TipRow<'a> {
    upload_id: i64,
    ref_name: &'a str,
    is_default_branch: bool,
}

fn tip_rows<'a>(visibility: &VisibilityGraph, refs: &'a RefDescriptions) -> Vec<TipRow<'a>> {
    let mut rows: HashMap<(i64, &'a str), TipRow<'a>> = HashMap::new();
    for (commit, descriptions) in refs {
        for upload in visibility.visible_at(commit) {
            for description in descriptions {
                let row = rows
                    .entry((upload.upload_id, description.name.as_str()))
                    .or_insert(TipRow {
                        upload_id: upload.upload_id,
                        ref_name: description.name.as_str(),
                        is_default_branch: false,
                    });
                row.is_default_branch |= description.is_default_branch;
            }
        }
    }
    rows.into_values().collect()
}

async fn replace_visibility(
    conn: &mut SqliteConnection,
    repository_id: i64,
    visibility: &VisibilityGraph,
    tips: &[TipRow<'_>],
) -> MetadataResult<usize> {
    sqlx::query("DELETE FROM nearest_uploads WHERE repository_id = ?")
        .bind(repository_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM upload_visible_at_tip WHERE repository_id = ?")
        .bind(repository_id)
        .execute(&mut *conn)
        .await?;

    let nearest: Vec<(&str, i64, u32)> = visibility
        .iter()
        .flat_map(|(commit, uploads)| {
            uploads
                .iter()
                .map(move |upload| (commit, upload.upload_id, upload.distance))
        })
        .collect();

    for chunk in nearest.chunks(INSERT_BATCH_SIZE) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO nearest_uploads (repository_id, commit_sha, upload_id, distance) ",
        );
        qb.push_values(chunk, |mut row, (commit, upload_id, distance)| {
            row.push_bind(repository_id)
                .push_bind(*commit)
                .push_bind(*upload_id)
                .push_bind(i64::from(*distance));
        });
        qb.build().execute(&mut *conn).await?;
    }

    for chunk in tips.chunks(INSERT_BATCH_SIZE) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO upload_visible_at_tip \
             (repository_id, upload_id, branch_or_tag_name, is_default_branch) ",
        );
        qb.push_values(chunk, |mut row, tip| {
            row.push_bind(repository_id)
                .push_bind(tip.upload_id)
                .push_bind(tip.ref_name)
                .push_bind(tip.is_default_branch);
        });
        qb.build().execute(&mut *conn).await?;
    }

    Ok(nearest.len())
}

#[async_trait]
impl VisibilityRepo for SqliteStore {
    async fn mark_repository_as_dirty(&self, repository_id: i64) -> MetadataResult<i64> {
        let mut conn = self.pool().acquire().await?;
        mark_dirty(&mut conn, repository_id).await
    }

    async fn dirty_repositories(&self) -> MetadataResult<HashMap<i64, i64>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT repository_id, dirty_token FROM dirty_repositories \
             WHERE dirty_token > update_token ORDER BY repository_id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn get_repository_dirty_state(
        &self,
        repository_id: i64,
    ) -> MetadataResult<Option<DirtyRepository>> {
        let row = sqlx::query_as::<_, DirtyRepositoryRow>(
            "SELECT repository_id, dirty_token, update_token, updated_at \
             FROM dirty_repositories WHERE repository_id = ?",
        )
        .bind(repository_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(DirtyRepository::from))
    }

    async fn calculate_visible_uploads(
        &self,
        repository_id: i64,
        dirty_token: Option<i64>,
        graph: &CommitGraph,
        refs: &RefDescriptions,
        options: &VisibilityOptions,
    ) -> MetadataResult<VisibilityUpdate> {
        let snapshot_token = match dirty_token {
            Some(token) => token,
            None => sqlx::query_scalar::<_, i64>(
                "SELECT dirty_token FROM dirty_repositories WHERE repository_id = ?",
            )
            .bind(repository_id)
            .fetch_optional(self.pool())
            .await?
            .unwrap_or(0),
        };

        let uploads: Vec<UploadMeta> = sqlx::query_as::<_, UploadMetaRow>(
            "SELECT id, commit_sha, root, finished_at, committed_at FROM uploads \
             WHERE repository_id = ? AND state = 'completed'",
        )
        .bind(repository_id)
        .fetch_all(self.pool())
        .await?
        .into_iter()
        .map(UploadMeta::from)
        .collect();

        // The graph walk runs without holding a transaction.
        let visibility = VisibilityGraph::compute(graph, &uploads, options)?;
        let tips = tip_rows(&visibility, refs);

        let mut update = VisibilityUpdate {
            repository_id,
            snapshot_token,
            num_commits: visibility.num_commits(),
            num_visible_at_tip: tips.len(),
            ..Default::default()
        };

        let mut tx = super::begin_write(self.pool()).await?;
        let recorded: Option<(i64, i64)> = sqlx::query_as(
            "SELECT dirty_token, update_token FROM dirty_repositories WHERE repository_id = ?",
        )
        .bind(repository_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((dirty_token, update_token)) =
            recorded.filter(|(_, update_token)| *update_token > snapshot_token)
        {
            tx.rollback().await?;
            tracing::debug!(
                repository_id,
                snapshot_token,
                update_token,
                "Discarding stale visibility result"
            );
            update.still_dirty = dirty_token > update_token;
            return Ok(update);
        }

        update.num_nearest = replace_visibility(&mut tx, repository_id, &visibility, &tips).await?;

        let (dirty_token, update_token): (i64, i64) = sqlx::query_as(
            r#"
            INSERT INTO dirty_repositories (repository_id, dirty_token, update_token, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (repository_id) DO UPDATE SET
                update_token = MAX(update_token, excluded.update_token),
                updated_at = excluded.updated_at
            RETURNING dirty_token, update_token
            "#,
        )
        .bind(repository_id)
        .bind(snapshot_token)
        .bind(snapshot_token)
        .bind(to_micros(options.now))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        update.applied = true;
        update.still_dirty = dirty_token > update_token;

        tracing::info!(
            repository_id,
            commits = update.num_commits,
            nearest = update.num_nearest,
            visible_at_tip = update.num_visible_at_tip,
            still_dirty = update.still_dirty,
            "Updated visible uploads"
        );
        Ok(update)
    }

    async fn get_visible_uploads_at_commit(
        &self,
        authz: AuthzContext,
        repository_id: i64,
        commit: &str,
    ) -> MetadataResult<Vec<Upload>> {
        let mut conn = self.pool().acquire().await?;
        let query = UploadQuery::new()
            .repository(repository_id)
            .nearest_at(repository_id, commit);
        fetch_uploads(&mut conn, &query, authz, self.options().permissions).await
    }

    async fn find_closest_uploads(
        &self,
        authz: AuthzContext,
        repository_id: i64,
        commit: &str,
        path: &str,
        root_must_enclose_path: bool,
        indexer: Option<&str>,
    ) -> MetadataResult<Vec<Upload>> {
        let mut conn = self.pool().acquire().await?;
        let mut query = UploadQuery::new()
            .repository(repository_id)
            .nearest_at(repository_id, commit)
            .root_for_path(path, root_must_enclose_path);
        if let Some(indexer) = indexer {
            query = query.indexer(indexer);
        }
        fetch_uploads(&mut conn, &query, authz, self.options().permissions).await
    }
}
