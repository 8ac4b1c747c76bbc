//! Janitor state shared across jobs and handlers.

use crate::gitserver::CommitGraphSource;
use beacon_core::config::AppConfig;
use beacon_metadata::MetadataStore;
use beacon_metadata::repos::{JobRepo, JobState, JobStats};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Tracks spawned job tasks so a panicked run does not stay `running`.
///
/// A panicking task never reaches the code that records its final state, and
/// its job row would block later runs of the same type. The watchdog marks
/// such rows failed.
pub struct JobTaskRegistry {
    tasks: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
    metadata: Arc<dyn MetadataStore>,
}

impl JobTaskRegistry {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            metadata,
        }
    }

    /// Register a spawned job task.
    pub async fn register(&self, job_id: Uuid, handle: JoinHandle<()>) {
        self.tasks.lock().await.insert(job_id, handle);
    }

    /// Number of tasks not yet reaped by [`check_tasks`](Self::check_tasks).
    pub async fn tracked(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Spawn a watchdog that checks for finished tasks every 10 seconds.
    /// The caller keeps the handle alive.
    pub fn spawn_watchdog(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                self.check_tasks().await;
            }
        })
    }

    /// Reap finished tasks and mark panicked jobs failed.
    pub async fn check_tasks(&self) {
        let finished: Vec<(Uuid, JoinHandle<()>)> = {
            let mut tasks = self.tasks.lock().await;
            let ids: Vec<Uuid> = tasks
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(job_id, _)| *job_id)
                .collect();
            ids.into_iter()
                .filter_map(|job_id| tasks.remove(&job_id).map(|handle| (job_id, handle)))
                .collect()
        };

        for (job_id, handle) in finished {
            match handle.await {
                Ok(()) => {
                    tracing::debug!(job_id = %job_id, "Janitor task completed");
                }
                Err(join_err) if join_err.is_panic() => {
                    crate::metrics::JOBS_ACTIVE.dec();
                    crate::metrics::JOBS_PANICKED.inc();
                    tracing::error!(
                        job_id = %job_id,
                        panic = ?join_err,
                        "Janitor task panicked, marking job as failed"
                    );

                    let stats = JobStats {
                        errors: 1,
                        ..JobStats::default()
                    };
                    let mut stats_json = serde_json::to_value(&stats)
                        .unwrap_or_else(|_| serde_json::json!({}));
                    stats_json["panic"] = serde_json::Value::Bool(true);
                    let stats_json = stats_json.to_string();

                    if let Err(e) = self
                        .metadata
                        .update_job_state(
                            job_id,
                            JobState::Failed,
                            Some(time::OffsetDateTime::now_utc()),
                            Some(&stats_json),
                        )
                        .await
                    {
                        tracing::error!(
                            job_id = %job_id,
                            error = %e,
                            "Failed to mark panicked job as failed"
                        );
                    }
                }
                Err(join_err) if join_err.is_cancelled() => {
                    crate::metrics::JOBS_ACTIVE.dec();
                    tracing::warn!(job_id = %job_id, "Janitor task was cancelled");
                }
                Err(e) => {
                    crate::metrics::JOBS_ACTIVE.dec();
                    tracing::error!(job_id = %job_id, error = ?e, "Janitor task failed");
                }
            }
        }
    }
}

/// Shared janitor state.
#[derive(Clone)]
pub struct JanitorState {
    pub config: Arc<AppConfig>,
    pub metadata: Arc<dyn MetadataStore>,
    /// Commit graphs for the visibility and commit-date jobs.
    pub git: Arc<dyn CommitGraphSource>,
    pub job_registry: Arc<JobTaskRegistry>,
}

impl JanitorState {
    pub fn new(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        git: Arc<dyn CommitGraphSource>,
    ) -> Self {
        let job_registry = Arc::new(JobTaskRegistry::new(metadata.clone()));
        Self {
            config: Arc::new(config),
            metadata,
            git,
            job_registry,
        }
    }
}
