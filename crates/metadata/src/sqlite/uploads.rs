use super::{
    INSERT_BATCH_SIZE, in_states, load_state, not_found, packages, purge_derived_rows,
    push_id_list, transition_error, visibility,
};
use crate::authz::{AuthzContext, PermissionsPolicy};
use crate::error::{MetadataError, MetadataResult};
use crate::models::UploadRow;
use crate::query::UploadQuery;
use crate::repos::{InsertedUpload, UploadRepo};
use crate::store::SqliteStore;
use crate::timestamp::{UNRESOLVABLE_COMMIT, commit_date_to_db, from_micros, to_micros};
use async_trait::async_trait;
use beacon_core::upload::{truncate_failure_message, validate_part_index};
use beacon_core::{CommitDate, NewUpload, Package, PackageReference, Upload, UploadState};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};

pub(crate) async fn fetch_uploads(
    conn: &mut SqliteConnection,
    query: &UploadQuery,
    authz: AuthzContext,
    policy: PermissionsPolicy,
) -> MetadataResult<Vec<Upload>> {
    let mut qb = query.select(authz, policy);
    let rows = qb
        .build_query_as::<UploadRow>()
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter().map(Upload::try_from).collect()
}

pub(crate) async fn fetch_upload(
    conn: &mut SqliteConnection,
    upload_id: i64,
) -> MetadataResult<Option<Upload>> {
    let query = UploadQuery::new().include_deleted().ids([upload_id]);
    let uploads = fetch_uploads(conn, &query, AuthzContext::Internal, PermissionsPolicy::default())
        .await?;
    Ok(uploads.into_iter().next())
}

async fn queue_rank(conn: &mut SqliteConnection, upload_id: i64) -> MetadataResult<Option<i64>> {
    let rank = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT queue_rank FROM (
            SELECT id, ROW_NUMBER() OVER (
                ORDER BY COALESCE(process_after, uploaded_at), uploaded_at, id
            ) AS queue_rank
            FROM uploads WHERE state = 'queued'
        ) WHERE id = ?
        "#,
    )
    .bind(upload_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(rank)
}

async fn insert_parts(
    conn: &mut SqliteConnection,
    upload_id: i64,
    parts: &[i64],
) -> MetadataResult<()> {
    for chunk in parts.chunks(INSERT_BATCH_SIZE) {
        let mut qb =
            QueryBuilder::<Sqlite>::new("INSERT OR IGNORE INTO upload_parts (upload_id, part_index) ");
        qb.push_values(chunk, |mut row, part_index| {
            row.push_bind(upload_id).push_bind(*part_index);
        });
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Record parts `0..num_parts` without materialising the list.
async fn insert_all_parts(
    conn: &mut SqliteConnection,
    upload_id: i64,
    num_parts: i64,
) -> MetadataResult<()> {
    sqlx::query(
        r#"
        WITH RECURSIVE parts(part_index) AS (
            SELECT 0
            UNION ALL
            SELECT part_index + 1 FROM parts WHERE part_index + 1 < ?
        )
        INSERT OR IGNORE INTO upload_parts (upload_id, part_index)
        SELECT ?, part_index FROM parts
        "#,
    )
    .bind(num_parts)
    .bind(upload_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn insert_upload(
    conn: &mut SqliteConnection,
    upload: &NewUpload,
) -> MetadataResult<InsertedUpload> {
    upload.validate()?;

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO uploads (
            repository_id, commit_sha, root, indexer, state, num_parts,
            upload_size, associated_index_id, uploaded_at, process_after
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(upload.repository_id)
    .bind(&upload.commit)
    .bind(&upload.root)
    .bind(&upload.indexer)
    .bind(upload.state.as_str())
    .bind(upload.num_parts)
    .bind(upload.upload_size)
    .bind(upload.associated_index_id)
    .bind(to_micros(upload.uploaded_at))
    .bind(upload.process_after.map(to_micros))
    .fetch_one(&mut *conn)
    .await?;

    if upload.has_all_parts() {
        insert_all_parts(conn, id, upload.num_parts).await?;
    } else {
        insert_parts(conn, id, &upload.initial_parts()).await?;
    }

    let rank = if upload.state == UploadState::Queued {
        queue_rank(conn, id).await?
    } else {
        None
    };

    tracing::debug!(
        upload_id = id,
        repository_id = upload.repository_id,
        state = %upload.state,
        "Inserted upload"
    );
    Ok(InsertedUpload { id, rank })
}

pub(crate) async fn mark_queued(
    conn: &mut SqliteConnection,
    upload_id: i64,
    upload_size: Option<i64>,
) -> MetadataResult<()> {
    if let Some(size) = upload_size.filter(|size| *size < 0) {
        return Err(MetadataError::Validation(format!(
            "upload_size must not be negative, got {size}"
        )));
    }

    let result = sqlx::query(
        "UPDATE uploads SET state = 'queued', upload_size = COALESCE(?, upload_size) \
         WHERE id = ? AND state = 'uploading'",
    )
    .bind(upload_size)
    .bind(upload_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(transition_error(conn, upload_id, UploadState::Queued).await);
    }
    Ok(())
}

pub(crate) async fn add_upload_part(
    conn: &mut SqliteConnection,
    upload_id: i64,
    part_index: i64,
) -> MetadataResult<()> {
    let Some(row) = load_state(conn, upload_id).await? else {
        return Err(not_found(upload_id));
    };
    let state = row.state()?;
    if state.is_deleted() {
        return Err(not_found(upload_id));
    }
    validate_part_index(part_index, row.num_parts)?;

    if state == UploadState::Uploading {
        insert_parts(conn, upload_id, &[part_index]).await?;
        return Ok(());
    }

    let recorded: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM upload_parts WHERE upload_id = ? AND part_index = ?)",
    )
    .bind(upload_id)
    .bind(part_index)
    .fetch_one(&mut *conn)
    .await?;

    if recorded {
        Ok(())
    } else {
        Err(MetadataError::Conflict(format!(
            "upload {upload_id} is {state}, part {part_index} can no longer be added"
        )))
    }
}

pub(crate) async fn mark_failed(
    conn: &mut SqliteConnection,
    upload_id: i64,
    failure_message: &str,
    now: OffsetDateTime,
    max_failure_message_len: usize,
) -> MetadataResult<()> {
    let message = truncate_failure_message(failure_message, max_failure_message_len);
    let result = sqlx::query(&format!(
        "UPDATE uploads SET state = 'errored', failure_message = ?, \
         num_failures = num_failures + 1, finished_at = ? \
         WHERE id = ? AND state IN ({})",
        in_states(&UploadState::sources_of(UploadState::Errored))
    ))
    .bind(&message)
    .bind(to_micros(now))
    .bind(upload_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(transition_error(conn, upload_id, UploadState::Errored).await);
    }
    tracing::info!(upload_id, failure_message = %message, "Upload failed");
    Ok(())
}

pub(crate) async fn dequeue(
    conn: &mut SqliteConnection,
    now: OffsetDateTime,
) -> MetadataResult<Option<Upload>> {
    let now = to_micros(now);
    let claimed: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE uploads SET state = 'processing', started_at = ?
        WHERE id = (
            SELECT id FROM uploads
            WHERE state = 'queued' AND (process_after IS NULL OR process_after <= ?)
            ORDER BY COALESCE(process_after, uploaded_at), uploaded_at, id
            LIMIT 1
        )
        RETURNING id
        "#,
    )
    .bind(now)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    match claimed {
        Some(upload_id) => fetch_upload(conn, upload_id).await,
        None => Ok(None),
    }
}

pub(crate) async fn mark_completed(
    conn: &mut SqliteConnection,
    upload_id: i64,
    packages: &[Package],
    references: &[PackageReference],
    now: OffsetDateTime,
) -> MetadataResult<()> {
    if let Some(foreign) = packages
        .iter()
        .map(|p| p.upload_id)
        .chain(references.iter().map(|r| r.upload_id))
        .find(|id| *id != upload_id)
    {
        return Err(MetadataError::Validation(format!(
            "package rows for upload {foreign} passed when completing upload {upload_id}"
        )));
    }

    let repository_id: Option<i64> = sqlx::query_scalar(
        "UPDATE uploads SET state = 'completed', finished_at = ? \
         WHERE id = ? AND state = 'processing' RETURNING repository_id",
    )
    .bind(to_micros(now))
    .bind(upload_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(repository_id) = repository_id else {
        return Err(transition_error(conn, upload_id, UploadState::Completed).await);
    };

    packages::insert_packages(conn, packages).await?;
    packages::insert_package_references(conn, references).await?;
    packages::update_num_references(conn, &[upload_id]).await?;
    packages::update_dependency_num_references(conn, &[upload_id], false).await?;
    visibility::mark_dirty(conn, repository_id).await?;

    tracing::info!(
        upload_id,
        repository_id,
        packages = packages.len(),
        references = references.len(),
        "Upload completed"
    );
    Ok(())
}

pub(crate) async fn requeue(
    conn: &mut SqliteConnection,
    upload_id: i64,
    process_after: Option<OffsetDateTime>,
    max_retries: u32,
) -> MetadataResult<()> {
    let result = sqlx::query(
        "UPDATE uploads SET state = 'queued', process_after = ?, started_at = NULL, \
         finished_at = NULL, failure_message = NULL \
         WHERE id = ? AND state = 'errored' AND num_failures < ?",
    )
    .bind(process_after.map(to_micros))
    .bind(upload_id)
    .bind(i64::from(max_retries))
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() > 0 {
        return Ok(());
    }

    let exhausted = load_state(conn, upload_id)
        .await?
        .filter(|row| row.state == UploadState::Errored.as_str());
    match exhausted {
        Some(row) => Err(MetadataError::Conflict(format!(
            "upload {upload_id} reached the retry limit ({} of {max_retries} failures)",
            row.num_failures
        ))),
        None => Err(transition_error(conn, upload_id, UploadState::Queued).await),
    }
}

pub(crate) async fn delete_upload_by_id(
    conn: &mut SqliteConnection,
    upload_id: i64,
) -> MetadataResult<bool> {
    let Some(row) = load_state(conn, upload_id).await? else {
        return Ok(false);
    };
    let state = row.state()?;
    let next = match state {
        UploadState::Deleted => return Ok(false),
        UploadState::Deleting => return Ok(true),
        UploadState::Completed => UploadState::Deleting,
        _ => UploadState::Deleted,
    };

    let result = sqlx::query("UPDATE uploads SET state = ? WHERE id = ? AND state = ?")
        .bind(next.as_str())
        .bind(upload_id)
        .bind(state.as_str())
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(transition_error(conn, upload_id, next).await);
    }
    if next == UploadState::Deleted {
        purge_derived_rows(conn, &[upload_id]).await?;
    }

    visibility::mark_dirty(conn, row.repository_id).await?;
    tracing::info!(upload_id, from = %state, to = %next, "Deleted upload");
    Ok(true)
}

pub(crate) async fn delete_uploads_stuck_uploading(
    conn: &mut SqliteConnection,
    older_than: OffsetDateTime,
    limit: u32,
) -> MetadataResult<u64> {
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        UPDATE uploads SET state = 'deleted'
        WHERE id IN (
            SELECT id FROM uploads
            WHERE state = 'uploading' AND uploaded_at < ?
            ORDER BY uploaded_at, id
            LIMIT ?
        )
        RETURNING id
        "#,
    )
    .bind(to_micros(older_than))
    .bind(i64::from(limit))
    .fetch_all(&mut *conn)
    .await?;

    purge_derived_rows(conn, &ids).await?;
    Ok(ids.len() as u64)
}

pub(crate) async fn delete_uploads_without_repository(
    conn: &mut SqliteConnection,
    now: OffsetDateTime,
    limit: u32,
    grace_period: Duration,
) -> MetadataResult<HashMap<i64, u64>> {
    let candidates: Vec<(i64, i64, String)> = sqlx::query_as(
        r#"
        SELECT u.id, u.repository_id, u.state
        FROM uploads u
        JOIN repositories r ON r.id = u.repository_id
        WHERE r.deleted_at IS NOT NULL AND r.deleted_at < ? AND u.state != 'deleted'
        ORDER BY u.id
        LIMIT ?
        "#,
    )
    .bind(to_micros(now - grace_period))
    .bind(i64::from(limit))
    .fetch_all(&mut *conn)
    .await?;

    if candidates.is_empty() {
        return Ok(HashMap::new());
    }

    let mut ids = Vec::with_capacity(candidates.len());
    let mut holders = Vec::new();
    let mut counts: HashMap<i64, u64> = HashMap::new();
    for (id, repository_id, state) in &candidates {
        ids.push(*id);
        if state.parse::<UploadState>()?.holds_references() {
            holders.push(*id);
        }
        *counts.entry(*repository_id).or_default() += 1;
    }

    packages::update_dependency_num_references(conn, &holders, true).await?;
    purge_derived_rows(conn, &ids).await?;

    for chunk in ids.chunks(INSERT_BATCH_SIZE) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE uploads SET state = 'deleted', num_references = 0 WHERE id IN ",
        );
        push_id_list(&mut qb, chunk);
        qb.build().execute(&mut *conn).await?;
    }

    Ok(counts)
}

pub(crate) async fn update_committed_at(
    conn: &mut SqliteConnection,
    upload_id: i64,
    committed_at: CommitDate,
) -> MetadataResult<()> {
    let result = sqlx::query("UPDATE uploads SET committed_at = ? WHERE id = ?")
        .bind(commit_date_to_db(committed_at))
        .bind(upload_id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(not_found(upload_id));
    }
    Ok(())
}

#[async_trait]
impl UploadRepo for SqliteStore {
    async fn insert_upload(&self, upload: &NewUpload) -> MetadataResult<InsertedUpload> {
        let mut tx = super::begin_write(self.pool()).await?;
        let inserted = insert_upload(&mut tx, upload).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn mark_queued(&self, upload_id: i64, upload_size: Option<i64>) -> MetadataResult<()> {
        let mut conn = self.pool().acquire().await?;
        mark_queued(&mut conn, upload_id, upload_size).await
    }

    async fn add_upload_part(&self, upload_id: i64, part_index: i64) -> MetadataResult<()> {
        let mut tx = super::begin_write(self.pool()).await?;
        add_upload_part(&mut tx, upload_id, part_index).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        upload_id: i64,
        failure_message: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        let mut conn = self.pool().acquire().await?;
        mark_failed(
            &mut conn,
            upload_id,
            failure_message,
            now,
            self.options().max_failure_message_len,
        )
        .await
    }

    async fn dequeue(&self, now: OffsetDateTime) -> MetadataResult<Option<Upload>> {
        let mut tx = super::begin_write(self.pool()).await?;
        let upload = dequeue(&mut tx, now).await?;
        tx.commit().await?;
        if let Some(upload) = &upload {
            tracing::debug!(upload_id = upload.id, "Dequeued upload");
        }
        Ok(upload)
    }

    async fn mark_completed(
        &self,
        upload_id: i64,
        packages: &[Package],
        references: &[PackageReference],
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        let mut tx = super::begin_write(self.pool()).await?;
        mark_completed(&mut tx, upload_id, packages, references, now).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn requeue(
        &self,
        upload_id: i64,
        process_after: Option<OffsetDateTime>,
    ) -> MetadataResult<()> {
        let mut tx = super::begin_write(self.pool()).await?;
        requeue(&mut tx, upload_id, process_after, self.options().max_retries).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_upload_by_id(
        &self,
        authz: AuthzContext,
        upload_id: i64,
    ) -> MetadataResult<Option<Upload>> {
        let mut conn = self.pool().acquire().await?;
        let query = UploadQuery::new().ids([upload_id]);
        let uploads =
            fetch_uploads(&mut conn, &query, authz, self.options().permissions).await?;
        Ok(uploads.into_iter().next())
    }

    async fn get_uploads(
        &self,
        authz: AuthzContext,
        query: &UploadQuery,
    ) -> MetadataResult<(Vec<Upload>, u64)> {
        let policy = self.options().permissions;
        let mut tx = super::begin_write(self.pool()).await?;
        let uploads = fetch_uploads(&mut tx, query, authz, policy).await?;
        let mut count = query.count(authz, policy);
        let total = count
            .build_query_scalar::<i64>()
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok((uploads, total.max(0) as u64))
    }

    async fn get_uploads_by_ids(
        &self,
        authz: AuthzContext,
        upload_ids: &[i64],
    ) -> MetadataResult<Vec<Upload>> {
        let mut conn = self.pool().acquire().await?;
        let query = UploadQuery::new().ids(upload_ids.iter().copied());
        fetch_uploads(&mut conn, &query, authz, self.options().permissions).await
    }

    async fn get_indexers(
        &self,
        authz: AuthzContext,
        repository_id: Option<i64>,
    ) -> MetadataResult<Vec<String>> {
        let query = match repository_id {
            Some(repository_id) => UploadQuery::new().repository(repository_id),
            None => UploadQuery::new(),
        };
        let mut qb = query.indexers(authz, self.options().permissions);
        let indexers = qb
            .build_query_scalar::<String>()
            .fetch_all(self.pool())
            .await?;
        Ok(indexers)
    }

    async fn delete_upload_by_id(&self, upload_id: i64) -> MetadataResult<bool> {
        let mut tx = super::begin_write(self.pool()).await?;
        let found = delete_upload_by_id(&mut tx, upload_id).await?;
        tx.commit().await?;
        Ok(found)
    }

    async fn delete_uploads_stuck_uploading(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<u64> {
        let mut tx = super::begin_write(self.pool()).await?;
        let count = delete_uploads_stuck_uploading(&mut tx, older_than, limit).await?;
        tx.commit().await?;
        if count > 0 {
            tracing::info!(count, "Deleted uploads stuck in uploading");
        }
        Ok(count)
    }

    async fn delete_uploads_without_repository(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<HashMap<i64, u64>> {
        let grace_period = self.options().deleted_repository_grace_period;
        let mut tx = super::begin_write(self.pool()).await?;
        let counts = delete_uploads_without_repository(&mut tx, now, limit, grace_period).await?;
        tx.commit().await?;
        for (repository_id, count) in &counts {
            tracing::info!(repository_id, count, "Deleted uploads of deleted repository");
        }
        Ok(counts)
    }

    async fn update_committed_at(
        &self,
        upload_id: i64,
        committed_at: CommitDate,
    ) -> MetadataResult<()> {
        let mut conn = self.pool().acquire().await?;
        update_committed_at(&mut conn, upload_id, committed_at).await
    }

    async fn get_oldest_commit_date(
        &self,
        repository_id: i64,
    ) -> MetadataResult<Option<OffsetDateTime>> {
        let oldest: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(committed_at) FROM uploads \
             WHERE repository_id = ? AND state = 'completed' \
             AND committed_at IS NOT NULL AND committed_at != ?",
        )
        .bind(repository_id)
        .bind(UNRESOLVABLE_COMMIT)
        .fetch_one(self.pool())
        .await?;
        Ok(oldest.map(from_micros))
    }

    async fn get_uploads_without_commit_date(&self, limit: u32) -> MetadataResult<Vec<Upload>> {
        let mut conn = self.pool().acquire().await?;
        let query = UploadQuery::new()
            .state(UploadState::Completed)
            .commit_date_unknown()
            .oldest_first()
            .limit(limit);
        fetch_uploads(
            &mut conn,
            &query,
            AuthzContext::Internal,
            self.options().permissions,
        )
        .await
    }
}
