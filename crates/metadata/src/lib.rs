//! Metadata store abstraction and the SQLite implementation for Beacon.
//!
//! This crate provides the durable side of the upload lifecycle:
//! - Upload records, parts and the processing queue
//! - Package exports, references and reference counts
//! - Nearest-upload visibility and dirty-repository markers
//! - Retention, soft delete and hard delete
//! - Repository records, permissions and scan scheduling
//! - Janitor job bookkeeping

pub mod authz;
pub mod error;
pub mod models;
pub mod query;
pub mod repos;
mod sqlite;
pub mod store;
pub mod timestamp;
pub mod unit_of_work;

pub use authz::{AuthzContext, PermissionsPolicy};
pub use error::{ErrorKind, MetadataError, MetadataResult};
pub use query::UploadQuery;
pub use store::{MetadataStore, SqliteStore, StoreOptions};
pub use unit_of_work::UnitOfWork;

use beacon_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(
    config: &MetadataConfig,
    options: StoreOptions,
) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
            ..
        } => {
            let store = SqliteStore::with_options(path, *query_timeout_secs, options).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
