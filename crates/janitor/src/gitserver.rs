//! Commit graph and ref lookups backed by local git clones.

use async_trait::async_trait;
use beacon_core::commit_graph::parse_ref_descriptions;
use beacon_core::config::GitserverConfig;
use beacon_core::{CommitGraph, RefDescriptions};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::process::Command;

const REF_FORMAT: &str = "--format=%(objectname)%09%(*objectname)%09%(refname)%09%(HEAD)";

/// Errors raised while talking to git.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("repository not found: {0}")]
    MissingRepository(String),

    #[error("invalid repository name: {0:?}")]
    InvalidRepositoryName(String),

    #[error("git {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("unexpected output from git {command}: {output:?}")]
    InvalidOutput { command: String, output: String },

    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] beacon_core::Error),
}

pub type GitResult<T> = std::result::Result<T, GitError>;

/// Source of commit graphs, ref descriptions and commit dates.
#[async_trait]
pub trait CommitGraphSource: Send + Sync {
    /// Every commit reachable from any ref, with its parents.
    async fn commit_graph(&self, repository: &str) -> GitResult<CommitGraph>;

    /// Branches and tags keyed by the commit they point at.
    async fn ref_descriptions(&self, repository: &str) -> GitResult<RefDescriptions>;

    /// Committer date of `commit`, or `None` when the repository does not
    /// contain it.
    async fn commit_date(
        &self,
        repository: &str,
        commit: &str,
    ) -> GitResult<Option<OffsetDateTime>>;
}

/// [`CommitGraphSource`] that runs the git binary against clones stored
/// under `repos_root/<repository name>`.
#[derive(Debug, Clone)]
pub struct GitCli {
    repos_root: PathBuf,
    git_bin: String,
    timeout: Duration,
}

/// Captured result of one git invocation.
struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl GitCli {
    pub fn new(
        repos_root: impl Into<PathBuf>,
        git_bin: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            repos_root: repos_root.into(),
            git_bin: git_bin.into(),
            timeout,
        }
    }

    pub fn from_config(config: &GitserverConfig) -> Self {
        Self::new(
            config.repos_root.clone(),
            config.git_bin.clone(),
            config.command_timeout(),
        )
    }

    /// Resolve the clone directory of a repository.
    ///
    /// Names are relative paths such as `github.com/foo/bar`; anything that
    /// could escape `repos_root` is rejected.
    pub fn repository_dir(&self, repository: &str) -> GitResult<PathBuf> {
        let relative = Path::new(repository);
        let valid = !repository.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(GitError::InvalidRepositoryName(repository.to_string()));
        }

        let dir = self.repos_root.join(relative);
        if !dir.is_dir() {
            return Err(GitError::MissingRepository(repository.to_string()));
        }
        Ok(dir)
    }

    async fn run(&self, repository: &str, args: &[&str]) -> GitResult<GitOutput> {
        let dir = self.repository_dir(repository)?;
        let command = args.first().copied().unwrap_or_default().to_string();

        let mut cmd = Command::new(&self.git_bin);
        cmd.args(args)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(GitError::Timeout {
                    command,
                    timeout: self.timeout,
                });
            }
        };

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn run_checked(&self, repository: &str, args: &[&str]) -> GitResult<String> {
        let output = self.run(repository, args).await?;
        if !output.success {
            return Err(GitError::CommandFailed {
                command: args.first().copied().unwrap_or_default().to_string(),
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl CommitGraphSource for GitCli {
    async fn commit_graph(&self, repository: &str) -> GitResult<CommitGraph> {
        let output = self
            .run_checked(
                repository,
                &["log", "--all", "--topo-order", "--pretty=format:%H %P"],
            )
            .await?;
        let graph = CommitGraph::parse(&output)?;
        tracing::debug!(
            repository = %repository,
            commits = graph.len(),
            "Loaded commit graph"
        );
        Ok(graph)
    }

    async fn ref_descriptions(&self, repository: &str) -> GitResult<RefDescriptions> {
        let output = self
            .run_checked(
                repository,
                &["for-each-ref", REF_FORMAT, "refs/heads", "refs/tags"],
            )
            .await?;
        Ok(parse_ref_descriptions(&output)?)
    }

    async fn commit_date(
        &self,
        repository: &str,
        commit: &str,
    ) -> GitResult<Option<OffsetDateTime>> {
        if commit.is_empty() || !commit.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(None);
        }

        let object = format!("{commit}^{{commit}}");
        let verified = self
            .run(repository, &["rev-parse", "--verify", "--quiet", &object])
            .await?;
        if !verified.success {
            return Ok(None);
        }

        let output = self
            .run_checked(repository, &["show", "-s", "--format=%ct", commit])
            .await?;
        let trimmed = output.trim();
        let invalid = || GitError::InvalidOutput {
            command: "show".to_string(),
            output: trimmed.to_string(),
        };
        let seconds: i64 = trimmed.parse().map_err(|_| invalid())?;
        let date = OffsetDateTime::from_unix_timestamp(seconds).map_err(|_| invalid())?;
        Ok(Some(date))
    }
}
