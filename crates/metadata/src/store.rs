//! Metadata store trait and the SQLite implementation.

use crate::authz::PermissionsPolicy;
use crate::error::{MetadataError, MetadataResult};
use crate::repos::{
    JobRepo, PackageRepo, RepositoryRepo, RetentionRepo, UploadRepo, VisibilityRepo,
};
use crate::unit_of_work::UnitOfWork;
use async_trait::async_trait;
use beacon_core::config::AppConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    UploadRepo
    + PackageRepo
    + VisibilityRepo
    + RetentionRepo
    + RepositoryRepo
    + JobRepo
    + Send
    + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Open an explicit transaction for multi-step ingestion.
    ///
    /// The transaction holds the write lock until it is committed or
    /// dropped. On an in-memory store it also holds the only connection,
    /// so the caller must not use the store until the unit of work ends.
    async fn begin(&self) -> MetadataResult<UnitOfWork>;
}

/// Behaviour the store applies to every operation.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub permissions: PermissionsPolicy,
    /// Failures after which an errored upload is no longer requeued.
    pub max_retries: u32,
    /// Failure messages are truncated to this many characters.
    pub max_failure_message_len: usize,
    /// How long uploads of a deleted repository are kept.
    pub deleted_repository_grace_period: time::Duration,
    /// Pool size for file-backed databases.
    pub max_connections: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

impl StoreOptions {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            permissions: PermissionsPolicy::from_config(&config.authz),
            max_retries: config.uploads.max_retries,
            max_failure_message_len: config.uploads.max_failure_message_len,
            deleted_repository_grace_period: config.janitor.deleted_repository_grace_period(),
            max_connections: config.metadata.max_connections(),
        }
    }
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    options: StoreOptions,
    query_timeout: Duration,
}

impl SqliteStore {
    /// Create a new SQLite store with default options.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        Self::with_options(path, query_timeout_secs, StoreOptions::default()).await
    }

    /// Create a new SQLite store. The path `:memory:` opens a private
    /// in-memory database backed by a single connection.
    ///
    /// File-backed stores run in WAL mode with `options.max_connections`
    /// connections, so reads proceed while a [`UnitOfWork`] or another
    /// write transaction is open. Writers wait on the busy timeout.
    pub async fn with_options(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
        options: StoreOptions,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout = Duration::from_secs(query_timeout_secs.unwrap_or(600));
        let in_memory = path.as_os_str() == ":memory:";

        let opts = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        };
        let opts = opts
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Concurrent writers wait instead of failing with "database is locked".
            .busy_timeout(Duration::from_secs(5));

        let mut pool_options = SqlitePoolOptions::new().acquire_timeout(query_timeout);
        if in_memory {
            // Each connection would open its own database, and closing the
            // only one would drop it.
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            pool_options = pool_options.max_connections(options.max_connections.max(1));
        }
        let pool = pool_options.connect_with(opts).await?;

        let store = Self {
            pool,
            options,
            query_timeout,
        };
        store.migrate().await?;

        tracing::info!(
            path = %path.display(),
            max_retries = options.max_retries,
            max_connections = if in_memory { 1 } else { options.max_connections },
            enforce_user_mapping = options.permissions.enforce_user_mapping,
            "Opened SQLite metadata store"
        );
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Upper bound on waiting for the connection.
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn begin(&self) -> MetadataResult<UnitOfWork> {
        let tx = crate::sqlite::begin_write(&self.pool).await?;
        Ok(UnitOfWork::new(tx, self.options))
    }
}

impl From<std::io::Error> for MetadataError {
    fn from(e: std::io::Error) -> Self {
        MetadataError::Config(e.to_string())
    }
}

/// SQL schema for SQLite.
///
/// Upload-related timestamps are Unix microseconds; job bookkeeping uses
/// the text timestamps `OffsetDateTime` encodes to.
const SCHEMA_SQL: &str = r#"
-- Repositories mirrored from the code host
CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    private INTEGER NOT NULL DEFAULT 0,
    indexable INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_repositories_deleted ON repositories(deleted_at) WHERE deleted_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS repository_permissions (
    repository_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL,
    PRIMARY KEY (repository_id, user_id)
);

-- Uploaded code-intelligence indexes
CREATE TABLE IF NOT EXISTS uploads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository_id INTEGER NOT NULL,
    commit_sha TEXT NOT NULL,
    root TEXT NOT NULL DEFAULT '',
    indexer TEXT NOT NULL,
    state TEXT NOT NULL,
    failure_message TEXT,
    num_failures INTEGER NOT NULL DEFAULT 0,
    uploaded_at INTEGER NOT NULL,
    started_at INTEGER,
    finished_at INTEGER,
    process_after INTEGER,
    committed_at INTEGER,
    upload_size INTEGER,
    num_parts INTEGER NOT NULL,
    associated_index_id INTEGER,
    expired INTEGER NOT NULL DEFAULT 0,
    last_retention_scan_at INTEGER,
    num_references INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_uploads_repository_state_commit ON uploads(repository_id, state, commit_sha);
CREATE INDEX IF NOT EXISTS idx_uploads_state_uploaded_at ON uploads(state, uploaded_at);

CREATE TABLE IF NOT EXISTS upload_parts (
    upload_id INTEGER NOT NULL REFERENCES uploads(id) ON DELETE CASCADE,
    part_index INTEGER NOT NULL,
    PRIMARY KEY (upload_id, part_index)
);

-- Packages exported by uploads
CREATE TABLE IF NOT EXISTS packages (
    upload_id INTEGER NOT NULL,
    scheme TEXT NOT NULL,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    PRIMARY KEY (upload_id, scheme, name, version)
);
CREATE INDEX IF NOT EXISTS idx_packages_key ON packages(scheme, name, version);

-- Packages uploads depend on
CREATE TABLE IF NOT EXISTS package_references (
    upload_id INTEGER NOT NULL,
    scheme TEXT NOT NULL,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    PRIMARY KEY (upload_id, scheme, name, version)
);
CREATE INDEX IF NOT EXISTS idx_package_references_key ON package_references(scheme, name, version);

-- Visibility bookkeeping
CREATE TABLE IF NOT EXISTS dirty_repositories (
    repository_id INTEGER PRIMARY KEY,
    dirty_token INTEGER NOT NULL DEFAULT 0,
    update_token INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER
);

CREATE TABLE IF NOT EXISTS nearest_uploads (
    repository_id INTEGER NOT NULL,
    commit_sha TEXT NOT NULL,
    upload_id INTEGER NOT NULL,
    distance INTEGER NOT NULL,
    PRIMARY KEY (repository_id, commit_sha, upload_id)
);
CREATE INDEX IF NOT EXISTS idx_nearest_uploads_upload ON nearest_uploads(upload_id);

CREATE TABLE IF NOT EXISTS upload_visible_at_tip (
    repository_id INTEGER NOT NULL,
    upload_id INTEGER NOT NULL,
    branch_or_tag_name TEXT NOT NULL,
    is_default_branch INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (repository_id, upload_id, branch_or_tag_name)
);
CREATE INDEX IF NOT EXISTS idx_upload_visible_at_tip_upload ON upload_visible_at_tip(upload_id);

-- Scan scheduling
CREATE TABLE IF NOT EXISTS repository_scan_state (
    repository_id INTEGER PRIMARY KEY,
    last_index_scan_at INTEGER,
    last_retention_scan_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_repository_scan_state_index ON repository_scan_state(last_index_scan_at);
CREATE INDEX IF NOT EXISTS idx_repository_scan_state_retention ON repository_scan_state(last_retention_scan_at);

-- Janitor job runs
CREATE TABLE IF NOT EXISTS janitor_jobs (
    job_id BLOB PRIMARY KEY,
    job_type TEXT NOT NULL,
    state TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    stats_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_janitor_jobs_state ON janitor_jobs(state);
-- At most one queued or running job per type across janitor processes
CREATE UNIQUE INDEX IF NOT EXISTS idx_janitor_jobs_type_active ON janitor_jobs(job_type) WHERE state IN ('queued', 'running');
"#;
