//! Package and reference index.

use crate::error::MetadataResult;
use async_trait::async_trait;
use beacon_core::{Package, PackageReference};

/// Repository for the packages uploads export and depend on.
#[async_trait]
pub trait PackageRepo: Send + Sync {
    /// Insert exported packages. Duplicates are ignored.
    async fn insert_packages(&self, packages: &[Package]) -> MetadataResult<u64>;

    /// Insert package references. Duplicates are ignored.
    async fn insert_package_references(&self, references: &[PackageReference])
    -> MetadataResult<u64>;

    /// Recompute `num_references` of each upload from scratch.
    async fn update_num_references(&self, upload_ids: &[i64]) -> MetadataResult<()>;

    /// Adjust the counts of the uploads that `upload_ids` depend on, adding
    /// their contribution or removing it when `removed` is set.
    async fn update_dependency_num_references(
        &self,
        upload_ids: &[i64],
        removed: bool,
    ) -> MetadataResult<()>;

    async fn get_packages(&self, upload_id: i64) -> MetadataResult<Vec<Package>>;

    async fn get_references(&self, upload_id: i64) -> MetadataResult<Vec<PackageReference>>;
}
