use crate::error::{MetadataError, MetadataResult};
use crate::models::{Repository, RepositoryRow};
use crate::repos::RepositoryRepo;
use crate::store::SqliteStore;
use crate::timestamp::to_micros;
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use time::{Duration, OffsetDateTime};

/// Which scan timestamp a selection reads and stamps.
#[derive(Clone, Copy)]
enum ScanKind {
    Index,
    Retention,
}

impl ScanKind {
    fn column(self) -> &'static str {
        match self {
            Self::Index => "last_index_scan_at",
            Self::Retention => "last_retention_scan_at",
        }
    }

    /// Candidate repository IDs, aliased as `c.repository_id`.
    fn candidates(self) -> &'static str {
        match self {
            Self::Index => {
                "SELECT id AS repository_id FROM repositories \
                 WHERE indexable = 1 AND deleted_at IS NULL"
            }
            Self::Retention => {
                "SELECT DISTINCT up.repository_id FROM uploads up \
                 LEFT JOIN repositories r ON r.id = up.repository_id \
                 WHERE up.state = 'completed' AND r.deleted_at IS NULL"
            }
        }
    }
}

async fn select_for_scan(
    conn: &mut SqliteConnection,
    kind: ScanKind,
    interval: Duration,
    limit: u32,
    now: OffsetDateTime,
) -> MetadataResult<Vec<i64>> {
    let column = kind.column();
    let ids: Vec<i64> = sqlx::query_scalar(&format!(
        r#"
        SELECT c.repository_id
        FROM ({candidates}) c
        LEFT JOIN repository_scan_state s ON s.repository_id = c.repository_id
        WHERE s.{column} IS NULL OR s.{column} < ?
        ORDER BY s.{column} IS NOT NULL, s.{column}, c.repository_id
        LIMIT ?
        "#,
        candidates = kind.candidates(),
    ))
    .bind(to_micros(now - interval))
    .bind(i64::from(limit))
    .fetch_all(&mut *conn)
    .await?;

    if ids.is_empty() {
        return Ok(ids);
    }

    let stamped = to_micros(now);
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "INSERT INTO repository_scan_state (repository_id, {column}) "
    ));
    qb.push_values(&ids, |mut row, repository_id| {
        row.push_bind(*repository_id).push_bind(stamped);
    });
    qb.push(format!(
        " ON CONFLICT (repository_id) DO UPDATE SET {column} = excluded.{column}"
    ));
    qb.build().execute(&mut *conn).await?;

    Ok(ids)
}

#[async_trait]
impl RepositoryRepo for SqliteStore {
    async fn upsert_repository(&self, repository: &Repository) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO repositories (id, name, private, indexable, created_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                private = excluded.private,
                indexable = excluded.indexable,
                deleted_at = excluded.deleted_at
            "#,
        )
        .bind(repository.id)
        .bind(&repository.name)
        .bind(repository.private)
        .bind(repository.indexable)
        .bind(to_micros(repository.created_at))
        .bind(repository.deleted_at.map(to_micros))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_repository(&self, repository_id: i64) -> MetadataResult<Option<Repository>> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            "SELECT id, name, private, indexable, created_at, deleted_at \
             FROM repositories WHERE id = ?",
        )
        .bind(repository_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(Repository::from))
    }

    async fn soft_delete_repository(
        &self,
        repository_id: i64,
        deleted_at: OffsetDateTime,
    ) -> MetadataResult<()> {
        let result = sqlx::query(
            "UPDATE repositories SET deleted_at = COALESCE(deleted_at, ?) WHERE id = ?",
        )
        .bind(to_micros(deleted_at))
        .bind(repository_id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!(
                "repository {repository_id}"
            )));
        }
        Ok(())
    }

    async fn grant_repository_permission(
        &self,
        repository_id: i64,
        user_id: i64,
    ) -> MetadataResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO repository_permissions (repository_id, user_id) VALUES (?, ?)",
        )
        .bind(repository_id)
        .bind(user_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn revoke_repository_permission(
        &self,
        repository_id: i64,
        user_id: i64,
    ) -> MetadataResult<()> {
        sqlx::query("DELETE FROM repository_permissions WHERE repository_id = ? AND user_id = ?")
            .bind(repository_id)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn select_repositories_for_index_scan(
        &self,
        interval: Duration,
        limit: u32,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<i64>> {
        let mut tx = super::begin_write(self.pool()).await?;
        let ids = select_for_scan(&mut tx, ScanKind::Index, interval, limit, now).await?;
        tx.commit().await?;
        Ok(ids)
    }

    async fn select_repositories_for_retention_scan(
        &self,
        interval: Duration,
        limit: u32,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<i64>> {
        let mut tx = super::begin_write(self.pool()).await?;
        let ids = select_for_scan(&mut tx, ScanKind::Retention, interval, limit, now).await?;
        tx.commit().await?;
        Ok(ids)
    }
}
