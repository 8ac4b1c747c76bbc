use super::{INSERT_BATCH_SIZE, push_id_list};
use crate::error::{MetadataError, MetadataResult};
use crate::models::PackageRow;
use crate::repos::PackageRepo;
use crate::store::SqliteStore;
use async_trait::async_trait;
use beacon_core::{Package, PackageKey, PackageReference};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

async fn insert_keys(
    conn: &mut SqliteConnection,
    table: &str,
    rows: &[(i64, &PackageKey)],
) -> MetadataResult<u64> {
    let mut inserted = 0;
    for chunk in rows.chunks(INSERT_BATCH_SIZE) {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT OR IGNORE INTO {table} (upload_id, scheme, name, version) "
        ));
        qb.push_values(chunk, |mut row, (upload_id, key)| {
            row.push_bind(*upload_id)
                .push_bind(key.scheme.as_str())
                .push_bind(key.name.as_str())
                .push_bind(key.version.as_str());
        });
        inserted += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(inserted)
}

pub(crate) async fn insert_packages(
    conn: &mut SqliteConnection,
    packages: &[Package],
) -> MetadataResult<u64> {
    let rows: Vec<_> = packages.iter().map(|p| (p.upload_id, &p.key)).collect();
    insert_keys(conn, "packages", &rows).await
}

pub(crate) async fn insert_package_references(
    conn: &mut SqliteConnection,
    references: &[PackageReference],
) -> MetadataResult<u64> {
    let rows: Vec<_> = references.iter().map(|r| (r.upload_id, &r.key)).collect();
    insert_keys(conn, "package_references", &rows).await
}

pub(crate) async fn update_num_references(
    conn: &mut SqliteConnection,
    upload_ids: &[i64],
) -> MetadataResult<()> {
    for chunk in upload_ids.chunks(INSERT_BATCH_SIZE) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            UPDATE uploads SET num_references = (
                SELECT COUNT(DISTINCT r.upload_id)
                FROM packages p
                JOIN package_references r
                    ON r.scheme = p.scheme AND r.name = p.name AND r.version = p.version
                JOIN uploads ru ON ru.id = r.upload_id
                WHERE p.upload_id = uploads.id
                  AND r.upload_id != uploads.id
                  AND ru.state IN ('completed', 'deleting')
            )
            WHERE id IN "#,
        );
        push_id_list(&mut qb, chunk);
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

pub(crate) async fn update_dependency_num_references(
    conn: &mut SqliteConnection,
    upload_ids: &[i64],
    removed: bool,
) -> MetadataResult<()> {
    if upload_ids.is_empty() {
        return Ok(());
    }

    // Exporters among the given uploads are excluded, so the whole ID set is
    // bound once as a JSON array instead of being chunked.
    let ids = serde_json::to_string(upload_ids)
        .map_err(|e| MetadataError::Internal(format!("failed to encode upload ids: {e}")))?;
    let op = if removed { "-" } else { "+" };
    let sql = format!(
        r#"
        WITH ids(id) AS (SELECT value FROM json_each(?)),
        deltas AS (
            SELECT p.upload_id AS exporter_id, COUNT(DISTINCT r.upload_id) AS delta
            FROM package_references r
            JOIN packages p
                ON p.scheme = r.scheme AND p.name = r.name AND p.version = r.version
            WHERE r.upload_id IN (SELECT id FROM ids)
              AND p.upload_id NOT IN (SELECT id FROM ids)
            GROUP BY p.upload_id
        )
        UPDATE uploads SET num_references = MAX(0, num_references {op}
            (SELECT delta FROM deltas WHERE exporter_id = uploads.id))
        WHERE id IN (SELECT exporter_id FROM deltas)
        "#
    );
    let result = sqlx::query(&sql).bind(ids).execute(&mut *conn).await?;

    tracing::debug!(
        uploads = upload_ids.len(),
        exporters = result.rows_affected(),
        removed,
        "Updated dependency reference counts"
    );
    Ok(())
}

async fn get_rows(
    conn: &mut SqliteConnection,
    table: &str,
    upload_id: i64,
) -> MetadataResult<Vec<PackageRow>> {
    let rows = sqlx::query_as::<_, PackageRow>(&format!(
        "SELECT upload_id, scheme, name, version FROM {table} \
         WHERE upload_id = ? ORDER BY scheme, name, version"
    ))
    .bind(upload_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

#[async_trait]
impl PackageRepo for SqliteStore {
    async fn insert_packages(&self, packages: &[Package]) -> MetadataResult<u64> {
        let mut conn = self.pool().acquire().await?;
        insert_packages(&mut conn, packages).await
    }

    async fn insert_package_references(
        &self,
        references: &[PackageReference],
    ) -> MetadataResult<u64> {
        let mut conn = self.pool().acquire().await?;
        insert_package_references(&mut conn, references).await
    }

    async fn update_num_references(&self, upload_ids: &[i64]) -> MetadataResult<()> {
        let mut tx = super::begin_write(self.pool()).await?;
        update_num_references(&mut tx, upload_ids).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_dependency_num_references(
        &self,
        upload_ids: &[i64],
        removed: bool,
    ) -> MetadataResult<()> {
        let mut conn = self.pool().acquire().await?;
        update_dependency_num_references(&mut conn, upload_ids, removed).await
    }

    async fn get_packages(&self, upload_id: i64) -> MetadataResult<Vec<Package>> {
        let mut conn = self.pool().acquire().await?;
        let rows = get_rows(&mut conn, "packages", upload_id).await?;
        Ok(rows.into_iter().map(Package::from).collect())
    }

    async fn get_references(&self, upload_id: i64) -> MetadataResult<Vec<PackageReference>> {
        let mut conn = self.pool().acquire().await?;
        let rows = get_rows(&mut conn, "package_references", upload_id).await?;
        Ok(rows.into_iter().map(PackageReference::from).collect())
    }
}
