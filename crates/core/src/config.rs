//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// HTTP listener for health and metrics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:9187").
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:9187".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path, or ":memory:".
        path: PathBuf,
        /// Query timeout in seconds (advisory only - SQLite cannot force-cancel queries).
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
        /// Pool size for file-backed databases. In-memory databases always
        /// use a single connection.
        #[serde(default = "default_sqlite_max_connections")]
        max_connections: u32,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600)
}

fn default_sqlite_max_connections() -> u32 {
    4
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
            max_connections: default_sqlite_max_connections(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { path, .. } if path.as_os_str().is_empty() => {
                Err("metadata.path must not be empty".to_string())
            }
            MetadataConfig::Sqlite {
                max_connections: 0, ..
            } => Err("metadata.max_connections must be at least 1".to_string()),
            MetadataConfig::Sqlite { .. } => Ok(()),
        }
    }

    /// Connection pool size.
    pub fn max_connections(&self) -> u32 {
        match self {
            MetadataConfig::Sqlite {
                max_connections, ..
            } => *max_connections,
        }
    }
}

/// Upload processing limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadsConfig {
    /// Number of failures after which an errored upload is no longer requeued.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Failure messages are truncated to this many characters.
    #[serde(default = "default_max_failure_message_len")]
    pub max_failure_message_len: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_failure_message_len() -> usize {
    2048
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_failure_message_len: default_max_failure_message_len(),
        }
    }
}

/// Repository permission policy applied to read paths.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthzConfig {
    /// Require an explicit permission row for every repository, including
    /// public ones.
    #[serde(default)]
    pub enforce_user_mapping: bool,
}

/// Background janitor configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// Run the periodic job loop.
    #[serde(default = "default_janitor_enabled")]
    pub enabled: bool,
    /// Seconds between job rounds (default: 1 minute).
    #[serde(default = "default_janitor_interval_secs")]
    pub interval_secs: u64,
    /// Rows handled per batch.
    #[serde(default = "default_janitor_batch_size")]
    pub batch_size: u32,
    /// Batches per job run before yielding to the next tick.
    #[serde(default = "default_janitor_max_iterations")]
    pub max_iterations: u64,
    /// Uploads still `uploading` after this long are deleted (default: 1 day).
    #[serde(default = "default_stuck_upload_timeout_secs")]
    pub stuck_upload_timeout_secs: u64,
    /// Uploads of repositories deleted longer ago than this are purged (default: 30 minutes).
    #[serde(default = "default_deleted_repository_grace_period_secs")]
    pub deleted_repository_grace_period_secs: u64,
    /// Which jobs to run.
    /// Valid values: "stuck_uploads", "orphaned_uploads", "expired_uploads",
    /// "hard_delete", "visibility", "commit_dates"
    #[serde(default = "default_janitor_jobs")]
    pub jobs: Vec<String>,
}

fn default_janitor_enabled() -> bool {
    true
}

fn default_janitor_interval_secs() -> u64 {
    60
}

fn default_janitor_batch_size() -> u32 {
    100
}

fn default_janitor_max_iterations() -> u64 {
    1000
}

fn default_stuck_upload_timeout_secs() -> u64 {
    86400 // 1 day
}

fn default_deleted_repository_grace_period_secs() -> u64 {
    1800 // 30 minutes
}

fn default_janitor_jobs() -> Vec<String> {
    vec![
        "stuck_uploads".to_string(),
        "orphaned_uploads".to_string(),
        "expired_uploads".to_string(),
        "hard_delete".to_string(),
        "visibility".to_string(),
        "commit_dates".to_string(),
    ]
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_janitor_enabled(),
            interval_secs: default_janitor_interval_secs(),
            batch_size: default_janitor_batch_size(),
            max_iterations: default_janitor_max_iterations(),
            stuck_upload_timeout_secs: default_stuck_upload_timeout_secs(),
            deleted_repository_grace_period_secs: default_deleted_repository_grace_period_secs(),
            jobs: default_janitor_jobs(),
        }
    }
}

impl JanitorConfig {
    /// Get the job interval as a std::time::Duration.
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub fn stuck_upload_timeout(&self) -> Duration {
        Duration::seconds(self.stuck_upload_timeout_secs as i64)
    }

    pub fn deleted_repository_grace_period(&self) -> Duration {
        Duration::seconds(self.deleted_repository_grace_period_secs as i64)
    }

    /// Validate janitor configuration for settings that would misbehave at runtime.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("janitor.interval_secs must be greater than 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("janitor.batch_size must be greater than 0".to_string());
        }
        for (name, value) in [
            ("stuck_upload_timeout_secs", self.stuck_upload_timeout_secs),
            (
                "deleted_repository_grace_period_secs",
                self.deleted_repository_grace_period_secs,
            ),
        ] {
            if value > i64::MAX as u64 {
                return Err(format!(
                    "janitor.{name} {value} exceeds maximum value {}",
                    i64::MAX
                ));
            }
        }
        Ok(())
    }
}

/// Commit-graph visibility settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VisibilityConfig {
    /// Maximum parent edges between a commit and a visible upload.
    #[serde(default = "default_max_commits")]
    pub max_commits: u32,
    /// Ignore uploads committed longer ago than this (default: no limit).
    #[serde(default)]
    pub max_age_secs: Option<u64>,
    /// Dirty repositories recomputed per job run.
    #[serde(default = "default_visibility_repository_batch_size")]
    pub repository_batch_size: u32,
}

fn default_max_commits() -> u32 {
    500
}

fn default_visibility_repository_batch_size() -> u32 {
    50
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            max_commits: default_max_commits(),
            max_age_secs: None,
            repository_batch_size: default_visibility_repository_batch_size(),
        }
    }
}

impl VisibilityConfig {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs
            .map(|secs| Duration::seconds(secs.min(i64::MAX as u64) as i64))
    }
}

/// Repository scan selection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_scan_interval_secs")]
    pub index_scan_interval_secs: u64,
    #[serde(default = "default_scan_interval_secs")]
    pub retention_scan_interval_secs: u64,
    /// Repositories returned per selection.
    #[serde(default = "default_scan_batch_size")]
    pub batch_size: u32,
}

fn default_scan_interval_secs() -> u64 {
    3600 // 1 hour
}

fn default_scan_batch_size() -> u32 {
    100
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            index_scan_interval_secs: default_scan_interval_secs(),
            retention_scan_interval_secs: default_scan_interval_secs(),
            batch_size: default_scan_batch_size(),
        }
    }
}

impl ScanConfig {
    pub fn index_scan_interval(&self) -> Duration {
        Duration::seconds(self.index_scan_interval_secs as i64)
    }

    pub fn retention_scan_interval(&self) -> Duration {
        Duration::seconds(self.retention_scan_interval_secs as i64)
    }
}

/// Local git checkouts used to read commit graphs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GitserverConfig {
    /// Directory holding one clone per repository, named after the repository.
    #[serde(default = "default_repos_root")]
    pub repos_root: PathBuf,
    #[serde(default = "default_git_bin")]
    pub git_bin: String,
    /// Per-command timeout.
    #[serde(default = "default_git_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_repos_root() -> PathBuf {
    PathBuf::from("./data/repos")
}

fn default_git_bin() -> String {
    "git".to_string()
}

fn default_git_command_timeout_secs() -> u64 {
    30
}

impl Default for GitserverConfig {
    fn default() -> Self {
        Self {
            repos_root: default_repos_root(),
            git_bin: default_git_bin(),
            command_timeout_secs: default_git_command_timeout_secs(),
        }
    }
}

impl GitserverConfig {
    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.command_timeout_secs)
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub uploads: UploadsConfig,
    #[serde(default)]
    pub authz: AuthzConfig,
    #[serde(default)]
    pub janitor: JanitorConfig,
    #[serde(default)]
    pub visibility: VisibilityConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub gitserver: GitserverConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses an in-memory SQLite database and keeps the
    /// periodic job loop disabled.
    pub fn for_testing() -> Self {
        Self {
            metadata: MetadataConfig::Sqlite {
                path: PathBuf::from(":memory:"),
                query_timeout_secs: None,
                max_connections: 1,
            },
            janitor: JanitorConfig {
                enabled: false,
                ..JanitorConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.metadata.validate()?;
        self.janitor.validate()?;
        if self.uploads.max_failure_message_len == 0 {
            return Err("uploads.max_failure_message_len must be greater than 0".to_string());
        }
        if self.visibility.max_commits == 0 {
            return Err("visibility.max_commits must be greater than 0".to_string());
        }
        Ok(())
    }
}
