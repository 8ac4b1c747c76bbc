use super::{
    INSERT_BATCH_SIZE, load_state, not_found, packages, purge_derived_rows, push_id_list,
    transition_error, visibility,
};
use crate::error::{MetadataError, MetadataResult};
use crate::repos::RetentionRepo;
use crate::store::SqliteStore;
use crate::timestamp::to_micros;
use async_trait::async_trait;
use beacon_core::UploadState;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::{BTreeSet, HashSet};
use time::OffsetDateTime;

/// Rejects uploads that some other live, unexpired upload still depends on.
const NO_LIVE_REFERENCER: &str = r#"
    NOT EXISTS (
        SELECT 1 FROM packages p
        JOIN package_references r
            ON r.scheme = p.scheme AND r.name = p.name AND r.version = p.version
        JOIN uploads ru ON ru.id = r.upload_id
        WHERE p.upload_id = u.id
          AND r.upload_id != u.id
          AND ru.state IN ('uploading', 'queued', 'processing', 'completed')
          AND ru.expired = 0
    )"#;

async fn set_expired(
    conn: &mut SqliteConnection,
    upload_ids: &[i64],
    expired: bool,
    now: OffsetDateTime,
) -> MetadataResult<()> {
    for chunk in upload_ids.chunks(INSERT_BATCH_SIZE) {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE uploads SET expired = ");
        qb.push_bind(expired)
            .push(", last_retention_scan_at = ")
            .push_bind(to_micros(now))
            .push(" WHERE id IN ");
        push_id_list(&mut qb, chunk);
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

pub(crate) async fn update_upload_retention(
    conn: &mut SqliteConnection,
    protected_ids: &[i64],
    expired_ids: &[i64],
    now: OffsetDateTime,
) -> MetadataResult<()> {
    let protected: HashSet<i64> = protected_ids.iter().copied().collect();
    let overlap: BTreeSet<i64> = expired_ids
        .iter()
        .copied()
        .filter(|id| protected.contains(id))
        .collect();
    if !overlap.is_empty() {
        return Err(MetadataError::Validation(format!(
            "uploads {overlap:?} are both protected and expired"
        )));
    }

    set_expired(conn, protected_ids, false, now).await?;
    set_expired(conn, expired_ids, true, now).await?;
    Ok(())
}

pub(crate) async fn soft_delete_expired_uploads(
    conn: &mut SqliteConnection,
    limit: u32,
) -> MetadataResult<u64> {
    let repository_ids: Vec<i64> = sqlx::query_scalar(&format!(
        r#"
        UPDATE uploads SET state = 'deleting'
        WHERE id IN (
            SELECT u.id FROM uploads u
            WHERE u.state = 'completed' AND u.expired = 1 AND u.num_references = 0
              AND {NO_LIVE_REFERENCER}
            ORDER BY u.id
            LIMIT ?
        )
        RETURNING repository_id
        "#
    ))
    .bind(i64::from(limit))
    .fetch_all(&mut *conn)
    .await?;

    let repositories: BTreeSet<i64> = repository_ids.iter().copied().collect();
    for repository_id in repositories {
        visibility::mark_dirty(conn, repository_id).await?;
    }
    Ok(repository_ids.len() as u64)
}

pub(crate) async fn soft_delete_expired_upload(
    conn: &mut SqliteConnection,
    upload_id: i64,
) -> MetadataResult<()> {
    let Some(row) = load_state(conn, upload_id).await? else {
        return Err(not_found(upload_id));
    };
    let state = row.state()?;
    if state.is_deleted() {
        return Err(not_found(upload_id));
    }
    state.validate_transition(UploadState::Deleting)?;

    if !row.expired {
        return Err(MetadataError::PolicyViolation(format!(
            "upload {upload_id} is protected by retention"
        )));
    }

    let referenced: bool = sqlx::query_scalar(&format!(
        "SELECT NOT ({NO_LIVE_REFERENCER}) FROM uploads u WHERE u.id = ?"
    ))
    .bind(upload_id)
    .fetch_one(&mut *conn)
    .await?;
    if row.num_references > 0 || referenced {
        return Err(MetadataError::PolicyViolation(format!(
            "upload {upload_id} is still referenced by {} uploads",
            row.num_references
        )));
    }

    let result =
        sqlx::query("UPDATE uploads SET state = 'deleting' WHERE id = ? AND state = 'completed'")
            .bind(upload_id)
            .execute(&mut *conn)
            .await?;
    if result.rows_affected() == 0 {
        return Err(transition_error(conn, upload_id, UploadState::Deleting).await);
    }

    visibility::mark_dirty(conn, row.repository_id).await?;
    Ok(())
}

pub(crate) async fn hard_delete_upload_by_id(
    conn: &mut SqliteConnection,
    upload_id: i64,
) -> MetadataResult<bool> {
    let Some(row) = load_state(conn, upload_id).await? else {
        return Ok(false);
    };
    let holds_references = row.state()?.holds_references();

    if holds_references {
        packages::update_dependency_num_references(conn, &[upload_id], true).await?;
    }
    purge_derived_rows(conn, &[upload_id]).await?;
    sqlx::query("DELETE FROM uploads WHERE id = ?")
        .bind(upload_id)
        .execute(&mut *conn)
        .await?;
    if holds_references {
        visibility::mark_dirty(conn, row.repository_id).await?;
    }
    Ok(true)
}

pub(crate) async fn hard_delete_uploads(
    conn: &mut SqliteConnection,
    limit: u32,
) -> MetadataResult<u64> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT id, repository_id FROM uploads WHERE state = 'deleting' ORDER BY id LIMIT ?",
    )
    .bind(i64::from(limit))
    .fetch_all(&mut *conn)
    .await?;
    if rows.is_empty() {
        return Ok(0);
    }

    let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
    packages::update_dependency_num_references(conn, &ids, true).await?;
    purge_derived_rows(conn, &ids).await?;
    for chunk in ids.chunks(INSERT_BATCH_SIZE) {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM uploads WHERE id IN ");
        push_id_list(&mut qb, chunk);
        qb.build().execute(&mut *conn).await?;
    }

    let repositories: BTreeSet<i64> = rows.iter().map(|(_, repository_id)| *repository_id).collect();
    for repository_id in repositories {
        visibility::mark_dirty(conn, repository_id).await?;
    }
    Ok(ids.len() as u64)
}

#[async_trait]
impl RetentionRepo for SqliteStore {
    async fn update_upload_retention(
        &self,
        protected_ids: &[i64],
        expired_ids: &[i64],
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        let mut tx = super::begin_write(self.pool()).await?;
        update_upload_retention(&mut tx, protected_ids, expired_ids, now).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn soft_delete_expired_uploads(&self, limit: u32) -> MetadataResult<u64> {
        let mut tx = super::begin_write(self.pool()).await?;
        let count = soft_delete_expired_uploads(&mut tx, limit).await?;
        tx.commit().await?;
        if count > 0 {
            tracing::info!(count, "Soft-deleted expired uploads");
        }
        Ok(count)
    }

    async fn soft_delete_expired_upload(&self, upload_id: i64) -> MetadataResult<()> {
        let mut tx = super::begin_write(self.pool()).await?;
        soft_delete_expired_upload(&mut tx, upload_id).await?;
        tx.commit().await?;
        tracing::info!(upload_id, "Soft-deleted expired upload");
        Ok(())
    }

    async fn hard_delete_upload_by_id(&self, upload_id: i64) -> MetadataResult<bool> {
        let mut tx = super::begin_write(self.pool()).await?;
        let found = hard_delete_upload_by_id(&mut tx, upload_id).await?;
        tx.commit().await?;
        Ok(found)
    }

    async fn hard_delete_uploads(&self, limit: u32) -> MetadataResult<u64> {
        let mut tx = super::begin_write(self.pool()).await?;
        let count = hard_delete_uploads(&mut tx, limit).await?;
        tx.commit().await?;
        if count > 0 {
            tracing::info!(count, "Hard-deleted uploads");
        }
        Ok(count)
    }
}
