//! HTTP handlers.

use crate::error::{JanitorError, JanitorResult};
use crate::state::JanitorState;
use axum::Json;
use axum::extract::{Query, State};
use beacon_metadata::models::JanitorJobRow;
use beacon_metadata::repos::{JobRepo, JobStats, JobType};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

const MAX_JOBS_LIMIT: u32 = 100;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /healthz - Health check.
///
/// Unauthenticated, for liveness probes. Fails when the metadata store is
/// unreachable.
pub async fn health_check(State(state): State<JanitorState>) -> JanitorResult<Json<HealthResponse>> {
    state.metadata.health_check().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    pub job_type: Option<String>,
    pub limit: Option<u32>,
}

/// One janitor run.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub job_type: String,
    pub state: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub stats: Option<JobStats>,
}

impl From<JanitorJobRow> for JobResponse {
    fn from(row: JanitorJobRow) -> Self {
        let stats = row
            .stats_json
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok());
        Self {
            job_id: row.job_id,
            job_type: row.job_type,
            state: row.state,
            started_at: row.started_at,
            finished_at: row.finished_at,
            stats,
        }
    }
}

/// GET /jobs - Most recent janitor runs, newest first.
pub async fn list_jobs(
    State(state): State<JanitorState>,
    Query(params): Query<ListJobsParams>,
) -> JanitorResult<Json<Vec<JobResponse>>> {
    let job_type = params
        .job_type
        .as_deref()
        .map(str::parse::<JobType>)
        .transpose()
        .map_err(JanitorError::from)?;
    let limit = params.limit.unwrap_or(20).clamp(1, MAX_JOBS_LIMIT);

    let jobs = state.metadata.get_recent_jobs(job_type, limit).await?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}
