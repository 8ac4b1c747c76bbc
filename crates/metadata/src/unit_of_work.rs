//! Explicit transaction scope for multi-step ingestion.
//!
//! A [`UnitOfWork`] holds a pooled connection and the database write lock
//! for its lifetime. Every operation runs inside one transaction that is
//! committed with [`UnitOfWork::commit`]; dropping it without committing
//! rolls back.

use crate::error::MetadataResult;
use crate::repos::InsertedUpload;
use crate::sqlite::{packages, uploads, visibility};
use crate::store::StoreOptions;
use beacon_core::{NewUpload, Package, PackageReference, Upload};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use time::OffsetDateTime;

pub struct UnitOfWork {
    tx: Transaction<'static, Sqlite>,
    options: StoreOptions,
}

impl UnitOfWork {
    pub(crate) fn new(tx: Transaction<'static, Sqlite>, options: StoreOptions) -> Self {
        Self { tx, options }
    }

    fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub async fn commit(self) -> MetadataResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> MetadataResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    pub async fn insert_upload(&mut self, upload: &NewUpload) -> MetadataResult<InsertedUpload> {
        uploads::insert_upload(self.conn(), upload).await
    }

    pub async fn add_upload_part(&mut self, upload_id: i64, part_index: i64) -> MetadataResult<()> {
        uploads::add_upload_part(self.conn(), upload_id, part_index).await
    }

    pub async fn mark_queued(
        &mut self,
        upload_id: i64,
        upload_size: Option<i64>,
    ) -> MetadataResult<()> {
        uploads::mark_queued(self.conn(), upload_id, upload_size).await
    }

    pub async fn mark_failed(
        &mut self,
        upload_id: i64,
        failure_message: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        let max_len = self.options.max_failure_message_len;
        uploads::mark_failed(self.conn(), upload_id, failure_message, now, max_len).await
    }

    pub async fn dequeue(&mut self, now: OffsetDateTime) -> MetadataResult<Option<Upload>> {
        uploads::dequeue(self.conn(), now).await
    }

    pub async fn mark_completed(
        &mut self,
        upload_id: i64,
        packages: &[Package],
        references: &[PackageReference],
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        uploads::mark_completed(self.conn(), upload_id, packages, references, now).await
    }

    /// Read an upload through the open transaction, including uncommitted
    /// changes. Deleted uploads are returned as well.
    pub async fn get_upload(&mut self, upload_id: i64) -> MetadataResult<Option<Upload>> {
        uploads::fetch_upload(self.conn(), upload_id).await
    }

    pub async fn insert_packages(&mut self, packages: &[Package]) -> MetadataResult<u64> {
        packages::insert_packages(self.conn(), packages).await
    }

    pub async fn insert_package_references(
        &mut self,
        references: &[PackageReference],
    ) -> MetadataResult<u64> {
        packages::insert_package_references(self.conn(), references).await
    }

    pub async fn update_num_references(&mut self, upload_ids: &[i64]) -> MetadataResult<()> {
        packages::update_num_references(self.conn(), upload_ids).await
    }

    pub async fn update_dependency_num_references(
        &mut self,
        upload_ids: &[i64],
        removed: bool,
    ) -> MetadataResult<()> {
        packages::update_dependency_num_references(self.conn(), upload_ids, removed).await
    }

    pub async fn mark_repository_as_dirty(&mut self, repository_id: i64) -> MetadataResult<i64> {
        visibility::mark_dirty(self.conn(), repository_id).await
    }
}
