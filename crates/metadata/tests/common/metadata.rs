//! Metadata store test helpers.

use beacon_metadata::{MetadataResult, MetadataStore, SqliteStore, StoreOptions};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use tempfile::TempDir;

/// Test metadata store wrapper.
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    /// Concrete store kept for direct pool access.
    pub(crate) sqlite_store: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

impl TestMetadata {
    /// Create a file-backed SQLite store in a temporary directory.
    #[allow(dead_code)]
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("test.db");
        let store = Arc::new(SqliteStore::new(&db_path, None).await?);
        Ok(Self::wrap(store, temp_dir))
    }

    /// Create an in-memory SQLite store.
    pub async fn in_memory() -> MetadataResult<Self> {
        Self::with_options(StoreOptions::default()).await
    }

    /// Create an in-memory SQLite store with custom options.
    pub async fn with_options(options: StoreOptions) -> MetadataResult<Self> {
        let temp_dir = TempDir::new()?;
        let store = Arc::new(SqliteStore::with_options(":memory:", None, options).await?);
        Ok(Self::wrap(store, temp_dir))
    }

    fn wrap(store: Arc<SqliteStore>, temp_dir: TempDir) -> Self {
        Self {
            store: store.clone(),
            sqlite_store: store,
            _temp_dir: temp_dir,
        }
    }

    /// Get the metadata store.
    #[allow(dead_code)]
    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// Get the underlying SQLite pool for direct database access.
    #[allow(dead_code)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite_store.pool()
    }
}
