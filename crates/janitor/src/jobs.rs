//! Janitor jobs: upload cleanup sweeps, visibility recomputation and
//! commit-date resolution.
//!
//! Every run is recorded as a janitor job row. The store allows one active
//! row per job type, so a run that finds another janitor already working on
//! the same type is skipped rather than queued.

use crate::error::JanitorResult;
use crate::gitserver::GitError;
use crate::metrics;
use crate::state::JanitorState;
use beacon_core::config::JanitorConfig;
use beacon_core::{CommitDate, CommitGraph, RefDescriptions, VisibilityOptions};
use beacon_metadata::models::JanitorJobRow;
use beacon_metadata::repos::{
    JobRepo, JobState, JobStats, JobType, RepositoryRepo, RetentionRepo, UploadRepo,
    VisibilityRepo, VisibilityUpdate,
};
use beacon_metadata::{MetadataError, MetadataResult, MetadataStore};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Parse the configured job list, skipping unknown names.
pub fn enabled_jobs(config: &JanitorConfig) -> Vec<JobType> {
    let mut jobs = Vec::new();
    for name in &config.jobs {
        match name.parse::<JobType>() {
            Ok(job_type) if !jobs.contains(&job_type) => jobs.push(job_type),
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(job_type = %name, "Unknown janitor job type in janitor.jobs, skipping");
            }
        }
    }
    jobs
}

/// Mark job rows left `queued` or `running` by a previous process as failed.
///
/// Returns the number of rows recovered.
pub async fn recover_orphaned_jobs(metadata: &Arc<dyn MetadataStore>) -> JanitorResult<usize> {
    let orphaned = metadata.get_orphaned_jobs().await?;
    if orphaned.is_empty() {
        return Ok(0);
    }

    tracing::warn!(
        count = orphaned.len(),
        "Found orphaned janitor jobs from a previous instance, marking as failed"
    );

    let stats = JobStats {
        errors: 1,
        ..JobStats::default()
    };
    let stats_json = serde_json::to_string(&stats).ok();

    for job in &orphaned {
        metadata
            .update_job_state(
                job.job_id,
                JobState::Failed,
                Some(OffsetDateTime::now_utc()),
                stats_json.as_deref(),
            )
            .await?;
        tracing::warn!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            job_state = %job.state,
            "Marked orphaned janitor job as failed"
        );
    }

    Ok(orphaned.len())
}

/// Create the job row, or return `None` when a run of the same type is
/// already active.
async fn start_job(metadata: &dyn MetadataStore, job_type: JobType) -> JanitorResult<Option<Uuid>> {
    let job = JanitorJobRow {
        job_id: Uuid::new_v4(),
        job_type: job_type.as_str().to_string(),
        state: JobState::Running.as_str().to_string(),
        started_at: Some(OffsetDateTime::now_utc()),
        finished_at: None,
        stats_json: None,
    };

    match metadata.create_job(&job).await {
        Ok(()) => Ok(Some(job.job_id)),
        Err(MetadataError::Constraint(_)) => {
            tracing::debug!(
                job_type = %job_type,
                "Another janitor job of this type is already running, skipping"
            );
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Run the job body, then record its final state, stats and metrics.
async fn execute(state: &JanitorState, job_id: Uuid, job_type: JobType) -> Option<JobStats> {
    let started = Instant::now();
    let result = run_job(state, job_type).await;

    let (job_state, stats) = match result {
        Ok(stats) if stats.errors > 0 => (JobState::Failed, Some(stats)),
        Ok(stats) => (JobState::Finished, Some(stats)),
        Err(e) => {
            tracing::error!(job_id = %job_id, job_type = %job_type, error = %e, "Janitor job failed");
            (JobState::Failed, None)
        }
    };

    metrics::JOB_RUNS
        .with_label_values(&[job_type.as_str(), job_state.as_str()])
        .inc();
    metrics::JOB_DURATION
        .with_label_values(&[job_type.as_str(), job_state.as_str()])
        .observe(started.elapsed().as_secs_f64());

    if let Some(stats) = &stats {
        if stats.items_deleted > 0 {
            metrics::UPLOADS_DELETED
                .with_label_values(&[job_type.as_str()])
                .inc_by(stats.items_deleted);
        }
        if stats.items_updated > 0 {
            metrics::UPLOADS_UPDATED
                .with_label_values(&[job_type.as_str()])
                .inc_by(stats.items_updated);
        }
        tracing::info!(
            job_id = %job_id,
            job_type = %job_type,
            state = job_state.as_str(),
            items_processed = stats.items_processed,
            items_deleted = stats.items_deleted,
            items_updated = stats.items_updated,
            batches = stats.batches,
            errors = stats.errors,
            "Janitor job completed"
        );
    }

    let stats_json = stats.as_ref().and_then(|s| serde_json::to_string(s).ok());
    if let Err(e) = state
        .metadata
        .update_job_state(
            job_id,
            job_state,
            Some(OffsetDateTime::now_utc()),
            stats_json.as_deref(),
        )
        .await
    {
        tracing::error!(job_id = %job_id, error = %e, "Failed to update janitor job state");
    }

    stats
}

/// Run one job inline.
///
/// Returns `None` when the run was skipped because another is active, or
/// when the job failed before producing stats.
pub async fn run_once(state: &JanitorState, job_type: JobType) -> JanitorResult<Option<JobStats>> {
    let Some(job_id) = start_job(state.metadata.as_ref(), job_type).await? else {
        return Ok(None);
    };
    Ok(execute(state, job_id, job_type).await)
}

/// Run one job on a background task registered with the watchdog.
pub async fn spawn_job(state: &JanitorState, job_type: JobType) -> JanitorResult<Option<Uuid>> {
    let Some(job_id) = start_job(state.metadata.as_ref(), job_type).await? else {
        return Ok(None);
    };

    metrics::JOBS_ACTIVE.inc();
    let task_state = state.clone();
    let handle = tokio::spawn(async move {
        execute(&task_state, job_id, job_type).await;
        metrics::JOBS_ACTIVE.dec();
    });
    state.job_registry.register(job_id, handle).await;

    Ok(Some(job_id))
}

/// Spawn the periodic loop that starts every enabled job each interval.
pub fn spawn_scheduler(state: JanitorState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = state.config.janitor.interval();
        let jobs = enabled_jobs(&state.config.janitor);
        tracing::info!(
            interval_secs = interval.as_secs(),
            jobs = ?jobs,
            "Janitor scheduler enabled"
        );

        loop {
            for &job_type in &jobs {
                if let Err(e) = spawn_job(&state, job_type).await {
                    tracing::error!(job_type = %job_type, error = %e, "Failed to start janitor job");
                }
            }
            tokio::time::sleep(interval).await;
        }
    })
}

/// Dispatch a job type to its implementation.
pub async fn run_job(state: &JanitorState, job_type: JobType) -> JanitorResult<JobStats> {
    let now = OffsetDateTime::now_utc();
    let janitor = &state.config.janitor;
    match job_type {
        JobType::StuckUploads => {
            let older_than = now - janitor.stuck_upload_timeout();
            sweep(state, Sweep::StuckUploads { older_than }).await
        }
        JobType::OrphanedUploads => sweep(state, Sweep::OrphanedUploads { now }).await,
        JobType::ExpiredUploads => sweep(state, Sweep::ExpiredUploads).await,
        JobType::HardDelete => sweep(state, Sweep::HardDelete).await,
        JobType::Visibility => update_visibility(state, now).await,
        JobType::CommitDates => resolve_commit_dates(state).await,
    }
}

/// Batched deletions drained until a batch comes back short.
#[derive(Debug, Clone, Copy)]
enum Sweep {
    StuckUploads { older_than: OffsetDateTime },
    OrphanedUploads { now: OffsetDateTime },
    ExpiredUploads,
    HardDelete,
}

impl Sweep {
    async fn run_batch(self, metadata: &dyn MetadataStore, limit: u32) -> MetadataResult<u64> {
        match self {
            Self::StuckUploads { older_than } => {
                metadata.delete_uploads_stuck_uploading(older_than, limit).await
            }
            Self::OrphanedUploads { now } => Ok(metadata
                .delete_uploads_without_repository(now, limit)
                .await?
                .values()
                .sum()),
            Self::ExpiredUploads => metadata.soft_delete_expired_uploads(limit).await,
            Self::HardDelete => metadata.hard_delete_uploads(limit).await,
        }
    }
}

async fn sweep(state: &JanitorState, sweep: Sweep) -> JanitorResult<JobStats> {
    let batch_size = state.config.janitor.batch_size;
    let max_iterations = state.config.janitor.max_iterations;
    let mut stats = JobStats::default();

    for _ in 0..max_iterations {
        let deleted = sweep.run_batch(state.metadata.as_ref(), batch_size).await?;
        stats.batches += 1;
        stats.items_processed += deleted;
        stats.items_deleted += deleted;
        tracing::debug!(sweep = ?sweep, deleted = deleted, "Janitor batch done");
        if deleted < u64::from(batch_size) {
            break;
        }
    }

    Ok(stats)
}

/// Recompute visibility for up to `visibility.repository_batch_size` dirty
/// repositories, lowest ID first.
async fn update_visibility(state: &JanitorState, now: OffsetDateTime) -> JanitorResult<JobStats> {
    let dirty = state.metadata.dirty_repositories().await?;
    metrics::DIRTY_REPOSITORIES.set(i64::try_from(dirty.len()).unwrap_or(i64::MAX));

    let mut repositories: Vec<(i64, i64)> = dirty.into_iter().collect();
    repositories.sort_unstable();
    repositories.truncate(state.config.visibility.repository_batch_size as usize);

    let options = VisibilityOptions {
        max_commits: state.config.visibility.max_commits,
        max_age: state.config.visibility.max_age(),
        now,
    };

    let mut stats = JobStats {
        batches: 1,
        ..JobStats::default()
    };
    for (repository_id, dirty_token) in repositories {
        stats.items_processed += 1;
        match update_repository_visibility(state, repository_id, dirty_token, &options).await {
            Ok(update) => {
                let outcome = if update.applied { "applied" } else { "stale" };
                metrics::record_visibility_outcome(outcome);
                tracing::info!(
                    repository_id = repository_id,
                    token = update.snapshot_token,
                    commits = update.num_commits,
                    nearest = update.num_nearest,
                    visible_at_tip = update.num_visible_at_tip,
                    applied = update.applied,
                    still_dirty = update.still_dirty,
                    "Updated repository visibility"
                );
            }
            Err(e) => {
                metrics::record_visibility_outcome("error");
                stats.errors += 1;
                tracing::warn!(
                    repository_id = repository_id,
                    error = %e,
                    "Failed to update repository visibility"
                );
            }
        }
    }

    Ok(stats)
}

async fn update_repository_visibility(
    state: &JanitorState,
    repository_id: i64,
    dirty_token: i64,
    options: &VisibilityOptions,
) -> JanitorResult<VisibilityUpdate> {
    let repository = state.metadata.get_repository(repository_id).await?;

    // A deleted or unknown repository has no commits, which clears every row.
    let (graph, refs) = match repository {
        Some(repository) if repository.deleted_at.is_none() => {
            let graph = state.git.commit_graph(&repository.name).await?;
            let refs = state.git.ref_descriptions(&repository.name).await?;
            (graph, refs)
        }
        _ => (CommitGraph::new(), RefDescriptions::new()),
    };

    Ok(state
        .metadata
        .calculate_visible_uploads(repository_id, Some(dirty_token), &graph, &refs, options)
        .await?)
}

/// Fill in committed-at for completed uploads that lack it.
///
/// Commits git does not know are stored as unresolvable so they are not
/// looked up again. Lookup errors leave the upload for the next run.
async fn resolve_commit_dates(state: &JanitorState) -> JanitorResult<JobStats> {
    let batch_size = state.config.janitor.batch_size;
    let max_iterations = state.config.janitor.max_iterations;
    let mut stats = JobStats::default();

    for _ in 0..max_iterations {
        let uploads = state
            .metadata
            .get_uploads_without_commit_date(batch_size)
            .await?;
        if uploads.is_empty() {
            break;
        }
        stats.batches += 1;

        let mut resolved = 0u64;
        for upload in &uploads {
            stats.items_processed += 1;
            let lookup = if upload.repository_name.is_empty() {
                Ok(None)
            } else {
                state
                    .git
                    .commit_date(&upload.repository_name, &upload.commit)
                    .await
            };

            let committed_at = match lookup {
                Ok(Some(at)) => CommitDate::At(at),
                Ok(None) | Err(GitError::InvalidRepositoryName(_)) => CommitDate::Unresolvable,
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(
                        upload_id = upload.id,
                        repository = %upload.repository_name,
                        commit = %upload.commit,
                        error = %e,
                        "Failed to resolve commit date"
                    );
                    continue;
                }
            };

            state
                .metadata
                .update_committed_at(upload.id, committed_at)
                .await?;
            resolved += 1;
            tracing::debug!(
                upload_id = upload.id,
                committed_at = ?committed_at,
                "Resolved commit date"
            );
        }

        stats.items_updated += resolved;
        if resolved == 0 || uploads.len() < batch_size as usize {
            break;
        }
    }

    Ok(stats)
}
