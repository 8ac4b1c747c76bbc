//! In-memory commit graph source.

use async_trait::async_trait;
use beacon_core::{CommitGraph, RefDescription, RefDescriptions, RefType};
use beacon_janitor::gitserver::{CommitGraphSource, GitError, GitResult};
use beacon_metadata::MetadataStore;
use beacon_metadata::repos::VisibilityRepo;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;

#[derive(Clone, Default)]
struct FakeRepository {
    graph: CommitGraph,
    refs: RefDescriptions,
    dates: HashMap<String, OffsetDateTime>,
}

/// Serves fixed graphs, refs and commit dates per repository name.
/// Unknown repositories fail with [`GitError::MissingRepository`].
#[derive(Clone, Default)]
pub struct FakeGit {
    repositories: HashMap<String, FakeRepository>,
    panic_on_graph: bool,
    dirty_on_graph: Option<DirtyOnGraph>,
}

/// Marks a repository dirty the first time any graph is fetched.
#[derive(Clone)]
struct DirtyOnGraph {
    store: Arc<dyn MetadataStore>,
    repository_id: i64,
    fired: Arc<AtomicBool>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a repository with a linear history whose last commit is the
    /// default branch `main`. Each commit is dated `date`.
    #[allow(dead_code)]
    pub fn with_linear_history(
        mut self,
        name: &str,
        commits: &[&str],
        date: OffsetDateTime,
    ) -> Self {
        let mut graph = CommitGraph::new();
        let mut parent: Option<&str> = None;
        for commit in commits {
            graph.add_commit(*commit, parent.map(str::to_string).into_iter().collect());
            parent = Some(*commit);
        }

        let mut refs = RefDescriptions::new();
        if let Some(tip) = parent {
            refs.insert(
                tip.to_string(),
                vec![RefDescription {
                    name: "main".to_string(),
                    ref_type: RefType::Branch,
                    is_default_branch: true,
                }],
            );
        }

        let dates = commits
            .iter()
            .map(|commit| (commit.to_string(), date))
            .collect();
        self.repositories
            .insert(name.to_string(), FakeRepository { graph, refs, dates });
        self
    }

    /// Panic when any commit graph is requested.
    #[allow(dead_code)]
    pub fn panicking(mut self) -> Self {
        self.panic_on_graph = true;
        self
    }

    /// Mark `repository_id` dirty while the first commit graph is fetched,
    /// as an upload finishing mid-run would.
    #[allow(dead_code)]
    pub fn marking_dirty_during_fetch(
        mut self,
        store: Arc<dyn MetadataStore>,
        repository_id: i64,
    ) -> Self {
        self.dirty_on_graph = Some(DirtyOnGraph {
            store,
            repository_id,
            fired: Arc::new(AtomicBool::new(false)),
        });
        self
    }

    fn repository(&self, name: &str) -> GitResult<&FakeRepository> {
        self.repositories
            .get(name)
            .ok_or_else(|| GitError::MissingRepository(name.to_string()))
    }
}

#[async_trait]
impl CommitGraphSource for FakeGit {
    async fn commit_graph(&self, repository: &str) -> GitResult<CommitGraph> {
        if self.panic_on_graph {
            panic!("commit graph requested for {repository}");
        }
        if let Some(hook) = &self.dirty_on_graph {
            if !hook.fired.swap(true, Ordering::SeqCst) {
                hook.store
                    .mark_repository_as_dirty(hook.repository_id)
                    .await
                    .expect("failed to mark repository dirty");
            }
        }
        Ok(self.repository(repository)?.graph.clone())
    }

    async fn ref_descriptions(&self, repository: &str) -> GitResult<RefDescriptions> {
        Ok(self.repository(repository)?.refs.clone())
    }

    async fn commit_date(
        &self,
        repository: &str,
        commit: &str,
    ) -> GitResult<Option<OffsetDateTime>> {
        Ok(self.repository(repository)?.dates.get(commit).copied())
    }
}
