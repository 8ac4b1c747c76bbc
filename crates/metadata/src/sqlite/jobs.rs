use crate::error::{MetadataError, MetadataResult};
use crate::models::JanitorJobRow;
use crate::repos::{JobRepo, JobState, JobType};
use crate::store::SqliteStore;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

#[async_trait]
impl JobRepo for SqliteStore {
    async fn create_job(&self, job: &JanitorJobRow) -> MetadataResult<()> {
        match sqlx::query(
            r#"
            INSERT INTO janitor_jobs (job_id, job_type, state, started_at, finished_at, stats_json)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.job_id)
        .bind(&job.job_type)
        .bind(&job.state)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.stats_json)
        .execute(self.pool())
        .await
        {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) => {
                // SQLite names either the columns or the partial index:
                // "UNIQUE constraint failed: janitor_jobs.job_type"
                // "UNIQUE constraint failed: index 'idx_janitor_jobs_type_active'"
                let msg = db_err.message();
                if msg.contains("UNIQUE constraint") && msg.contains("janitor_jobs") {
                    Err(MetadataError::Constraint(format!(
                        "another {} job is already active",
                        job.job_type
                    )))
                } else {
                    Err(sqlx::Error::Database(db_err).into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_job(&self, job_id: Uuid) -> MetadataResult<Option<JanitorJobRow>> {
        let row =
            sqlx::query_as::<_, JanitorJobRow>("SELECT * FROM janitor_jobs WHERE job_id = ?")
                .bind(job_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row)
    }

    async fn update_job_state(
        &self,
        job_id: Uuid,
        state: JobState,
        finished_at: Option<OffsetDateTime>,
        stats_json: Option<&str>,
    ) -> MetadataResult<()> {
        sqlx::query(
            "UPDATE janitor_jobs SET state = ?, finished_at = ?, stats_json = ? WHERE job_id = ?",
        )
        .bind(state.as_str())
        .bind(finished_at)
        .bind(stats_json)
        .bind(job_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_recent_jobs(
        &self,
        job_type: Option<JobType>,
        limit: u32,
    ) -> MetadataResult<Vec<JanitorJobRow>> {
        let rows = match job_type {
            Some(job_type) => {
                sqlx::query_as::<_, JanitorJobRow>(
                    "SELECT * FROM janitor_jobs WHERE job_type = ? ORDER BY started_at DESC LIMIT ?",
                )
                .bind(job_type.as_str())
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, JanitorJobRow>(
                    "SELECT * FROM janitor_jobs ORDER BY started_at DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
        };
        Ok(rows)
    }

    async fn get_active_jobs(&self, job_type: JobType) -> MetadataResult<Vec<JanitorJobRow>> {
        let rows = sqlx::query_as::<_, JanitorJobRow>(
            "SELECT * FROM janitor_jobs WHERE job_type = ? AND state IN ('queued', 'running') \
             ORDER BY started_at DESC",
        )
        .bind(job_type.as_str())
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    async fn get_orphaned_jobs(&self) -> MetadataResult<Vec<JanitorJobRow>> {
        let rows = sqlx::query_as::<_, JanitorJobRow>(
            "SELECT * FROM janitor_jobs WHERE state IN ('queued', 'running') ORDER BY started_at DESC",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
