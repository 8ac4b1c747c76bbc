//! Metadata store and janitor state helpers.

use super::FakeGit;
use beacon_core::config::AppConfig;
use beacon_core::{NewUpload, UploadState};
use beacon_janitor::JanitorState;
use beacon_metadata::models::Repository;
use beacon_metadata::repos::{RepositoryRepo, UploadRepo};
use beacon_metadata::{MetadataResult, MetadataStore, SqliteStore, StoreOptions};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use time::OffsetDateTime;

/// In-memory metadata store with direct pool access.
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    sqlite_store: Arc<SqliteStore>,
}

impl TestMetadata {
    pub async fn in_memory() -> MetadataResult<Self> {
        let options = StoreOptions::from_app_config(&AppConfig::for_testing());
        let store = Arc::new(SqliteStore::with_options(":memory:", None, options).await?);
        Ok(Self {
            store: store.clone(),
            sqlite_store: store,
        })
    }

    #[allow(dead_code)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite_store.pool()
    }

    /// Janitor state over this store with a small batch size, so sweeps
    /// take several batches.
    pub fn state(&self, git: FakeGit) -> JanitorState {
        let mut config = AppConfig::for_testing();
        config.janitor.batch_size = 2;
        JanitorState::new(config, self.store.clone(), Arc::new(git))
    }
}

/// Create a public, indexable repository.
#[allow(dead_code)]
pub async fn add_repository(metadata: &TestMetadata, id: i64, name: &str) -> Repository {
    let repository = Repository::new(id, name, OffsetDateTime::now_utc());
    metadata
        .store
        .upsert_repository(&repository)
        .await
        .expect("failed to upsert repository");
    repository
}

/// Insert an upload still receiving parts.
#[allow(dead_code)]
pub async fn uploading_upload(
    metadata: &TestMetadata,
    repository_id: i64,
    commit: &str,
    uploaded_at: OffsetDateTime,
) -> i64 {
    let request = NewUpload::new(repository_id, commit, "", "scip-go", uploaded_at);
    metadata
        .store
        .insert_upload(&request)
        .await
        .expect("failed to insert upload")
        .id
}

/// Insert a completed upload without packages.
#[allow(dead_code)]
pub async fn completed_upload(
    metadata: &TestMetadata,
    repository_id: i64,
    commit: &str,
    root: &str,
) -> i64 {
    let mut request = NewUpload::new(
        repository_id,
        commit,
        root,
        "scip-go",
        OffsetDateTime::now_utc(),
    );
    request.state = UploadState::Queued;
    let id = metadata
        .store
        .insert_upload(&request)
        .await
        .expect("failed to insert upload")
        .id;

    sqlx::query("UPDATE uploads SET state = 'processing' WHERE id = ?")
        .bind(id)
        .execute(metadata.pool())
        .await
        .expect("failed to start processing");
    metadata
        .store
        .mark_completed(id, &[], &[], OffsetDateTime::now_utc())
        .await
        .expect("failed to complete upload");
    id
}
