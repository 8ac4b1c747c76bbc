//! Test fixtures for generating uploads, packages and repositories.

use super::TestMetadata;
use beacon_core::{NewUpload, Package, PackageKey, PackageReference, UploadState};
use beacon_metadata::models::Repository;
use beacon_metadata::repos::{RepositoryRepo, UploadRepo};
use time::{Duration, OffsetDateTime, macros::datetime};

/// Fixed reference time shared by all tests.
pub fn base_time() -> OffsetDateTime {
    datetime!(2024-01-01 00:00 UTC)
}

/// `base_time()` shifted by whole minutes.
#[allow(dead_code)]
pub fn minutes(offset: i64) -> OffsetDateTime {
    base_time() + Duration::minutes(offset)
}

/// Create a public, indexable repository.
#[allow(dead_code)]
pub async fn add_repository(metadata: &TestMetadata, id: i64, name: &str) -> Repository {
    let repository = Repository::new(id, name, base_time());
    metadata
        .store
        .upsert_repository(&repository)
        .await
        .expect("failed to upsert repository");
    repository
}

/// Create a private repository.
#[allow(dead_code)]
pub async fn add_private_repository(metadata: &TestMetadata, id: i64, name: &str) -> Repository {
    let mut repository = Repository::new(id, name, base_time());
    repository.private = true;
    metadata
        .store
        .upsert_repository(&repository)
        .await
        .expect("failed to upsert repository");
    repository
}

/// A multipart upload request with `num_parts` declared parts.
#[allow(dead_code)]
pub fn uploading(repository_id: i64, commit: &str, num_parts: i64) -> NewUpload {
    let mut upload = NewUpload::new(repository_id, commit, "", "scip-go", base_time());
    upload.num_parts = num_parts;
    upload
}

/// A single-shot upload request that enters the queue immediately.
#[allow(dead_code)]
pub fn queued(repository_id: i64, commit: &str, uploaded_at: OffsetDateTime) -> NewUpload {
    let mut upload = NewUpload::new(repository_id, commit, "", "scip-go", uploaded_at);
    upload.state = UploadState::Queued;
    upload
}

/// Package key in the `npm` scheme at version 1.0.0.
#[allow(dead_code)]
pub fn npm(name: &str) -> PackageKey {
    PackageKey::new("npm", name, "1.0.0")
}

/// Force an upload into `state`, bypassing transition checks.
#[allow(dead_code)]
pub async fn force_state(metadata: &TestMetadata, upload_id: i64, state: UploadState) {
    sqlx::query("UPDATE uploads SET state = ? WHERE id = ?")
        .bind(state.as_str())
        .bind(upload_id)
        .execute(metadata.pool())
        .await
        .expect("failed to force upload state");
}

/// Insert a completed upload at `commit` and `root` that exports and
/// imports the given packages.
#[allow(dead_code)]
pub async fn completed_upload(
    metadata: &TestMetadata,
    repository_id: i64,
    commit: &str,
    root: &str,
    exports: &[PackageKey],
    imports: &[PackageKey],
) -> i64 {
    let mut request = queued(repository_id, commit, base_time());
    request.root = root.to_string();
    let inserted = metadata
        .store
        .insert_upload(&request)
        .await
        .expect("failed to insert upload");
    force_state(metadata, inserted.id, UploadState::Processing).await;

    let packages: Vec<Package> = exports
        .iter()
        .map(|key| Package::new(inserted.id, key.clone()))
        .collect();
    let references: Vec<PackageReference> = imports
        .iter()
        .map(|key| PackageReference::new(inserted.id, key.clone()))
        .collect();
    metadata
        .store
        .mark_completed(inserted.id, &packages, &references, base_time())
        .await
        .expect("failed to complete upload");
    inserted.id
}
