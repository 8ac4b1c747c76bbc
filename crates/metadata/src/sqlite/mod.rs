//! SQLite implementations of the repository traits.
//!
//! Each module exposes free functions over a `SqliteConnection` so the same
//! statements run against a pooled connection, a store-managed transaction
//! or a caller-held [`crate::UnitOfWork`].

pub(crate) mod jobs;
pub(crate) mod packages;
pub(crate) mod repositories;
pub(crate) mod retention;
pub(crate) mod uploads;
pub(crate) mod visibility;

use crate::error::{MetadataError, MetadataResult};
use crate::models::UploadStateRow;
use beacon_core::UploadState;
use sqlx::{Pool, QueryBuilder, Sqlite, SqliteConnection, Transaction};

/// Rows per multi-row INSERT, well below SQLite's bind parameter limit.
pub(crate) const INSERT_BATCH_SIZE: usize = 1000;

/// Open a transaction that takes the write lock up front.
///
/// A deferred transaction that reads before writing fails with
/// `SQLITE_BUSY` instead of waiting when another connection commits first.
pub(crate) async fn begin_write(
    pool: &Pool<Sqlite>,
) -> MetadataResult<Transaction<'static, Sqlite>> {
    Ok(pool.begin_with("BEGIN IMMEDIATE").await?)
}

/// Render states as a quoted SQL list, e.g. `'uploading', 'queued'`.
pub(crate) fn in_states(states: &[UploadState]) -> String {
    states
        .iter()
        .map(|state| format!("'{}'", state.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Append `(?, ?, ...)` binding every ID.
pub(crate) fn push_id_list(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    qb.push("(");
    let mut list = qb.separated(", ");
    for id in ids {
        list.push_bind(*id);
    }
    list.push_unseparated(")");
}

pub(crate) async fn load_state(
    conn: &mut SqliteConnection,
    upload_id: i64,
) -> MetadataResult<Option<UploadStateRow>> {
    let row = sqlx::query_as::<_, UploadStateRow>(
        "SELECT id, repository_id, state, num_parts, num_failures, expired, num_references \
         FROM uploads WHERE id = ?",
    )
    .bind(upload_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

/// Explain why a guarded state update matched no row.
pub(crate) async fn transition_error(
    conn: &mut SqliteConnection,
    upload_id: i64,
    to: UploadState,
) -> MetadataError {
    let row = match load_state(conn, upload_id).await {
        Ok(row) => row,
        Err(e) => return e,
    };
    match row.map(|row| row.state()) {
        None => not_found(upload_id),
        Some(Err(e)) => e,
        Some(Ok(from)) if from.is_deleted() => not_found(upload_id),
        Some(Ok(from)) => MetadataError::InvalidStateTransition {
            upload_id,
            from: from.to_string(),
            to: to.to_string(),
        },
    }
}

pub(crate) fn not_found(upload_id: i64) -> MetadataError {
    MetadataError::NotFound(format!("upload {upload_id}"))
}

/// Remove every row derived from the given uploads: packages, references,
/// received parts, nearest-upload entries and tip visibility.
pub(crate) async fn purge_derived_rows(
    conn: &mut SqliteConnection,
    upload_ids: &[i64],
) -> MetadataResult<()> {
    for chunk in upload_ids.chunks(INSERT_BATCH_SIZE) {
        for table in [
            "packages",
            "package_references",
            "upload_parts",
            "nearest_uploads",
            "upload_visible_at_tip",
        ] {
            let mut qb = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {table} WHERE upload_id IN "));
            push_id_list(&mut qb, chunk);
            qb.build().execute(&mut *conn).await?;
        }
    }
    Ok(())
}
