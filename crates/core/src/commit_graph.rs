//! Commit graphs and ref descriptions supplied by the version-control layer.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Immutable snapshot of a repository's commit DAG.
///
/// Commits keep the order in which they were added; parents that were never
/// added themselves (e.g. beyond a truncated log) are ignored by traversals.
#[derive(Clone, Debug, Default)]
pub struct CommitGraph {
    order: Vec<String>,
    parents: HashMap<String, Vec<String>>,
}

impl CommitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `git log --topo-order --pretty="%H %P"` output: one commit per
    /// line followed by its parents.
    pub fn parse(output: &str) -> Result<Self> {
        let mut graph = Self::new();
        for (line_no, line) in output.lines().enumerate() {
            let mut fields = line.split_whitespace();
            let Some(commit) = fields.next() else {
                continue;
            };
            let parents: Vec<String> = fields.map(str::to_string).collect();
            for sha in std::iter::once(commit).chain(parents.iter().map(String::as_str)) {
                if !sha.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(Error::InvalidCommitGraph(format!(
                        "line {}: {sha:?} is not a commit hash",
                        line_no + 1
                    )));
                }
            }
            graph.add_commit(commit, parents);
        }
        Ok(graph)
    }

    /// Add a commit with its parent edges. Re-adding a commit merges parents.
    pub fn add_commit(&mut self, commit: impl Into<String>, parents: Vec<String>) {
        let commit = commit.into();
        match self.parents.get_mut(&commit) {
            Some(existing) => {
                for parent in parents {
                    if !existing.contains(&parent) {
                        existing.push(parent);
                    }
                }
            }
            None => {
                self.order.push(commit.clone());
                self.parents.insert(commit, parents);
            }
        }
    }

    pub fn contains(&self, commit: &str) -> bool {
        self.parents.contains_key(commit)
    }

    /// Parent edges of `commit`, empty for unknown commits.
    pub fn parents(&self, commit: &str) -> &[String] {
        self.parents.get(commit).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn commits(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Order commits so that every commit comes after all of its parents.
    ///
    /// Fails with [`Error::InvalidCommitGraph`] when the edges contain a cycle.
    pub fn ancestors_first(&self) -> Result<Vec<&str>> {
        let mut pending: HashMap<&str, usize> = HashMap::with_capacity(self.order.len());
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();

        for commit in &self.order {
            let known: HashSet<&str> = self
                .parents(commit)
                .iter()
                .map(String::as_str)
                .filter(|parent| self.contains(parent))
                .collect();
            for parent in &known {
                children.entry(*parent).or_default().push(commit.as_str());
            }
            pending.insert(commit.as_str(), known.len());
        }

        let mut ready: VecDeque<&str> = self
            .order
            .iter()
            .rev()
            .map(String::as_str)
            .filter(|commit| pending.get(commit) == Some(&0))
            .collect();

        let mut ordered = Vec::with_capacity(self.order.len());
        while let Some(commit) = ready.pop_front() {
            ordered.push(commit);
            for child in children.get(commit).into_iter().flatten() {
                if let Some(count) = pending.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(*child);
                    }
                }
            }
        }

        if ordered.len() != self.order.len() {
            return Err(Error::InvalidCommitGraph(format!(
                "cycle detected among {} commits",
                self.order.len() - ordered.len()
            )));
        }
        Ok(ordered)
    }
}

/// Kind of ref pointing at a commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefType {
    Branch,
    Tag,
}

/// A branch or tag pointing at a commit.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefDescription {
    pub name: String,
    pub ref_type: RefType,
    pub is_default_branch: bool,
}

/// Ref descriptions keyed by the commit they point at.
pub type RefDescriptions = HashMap<String, Vec<RefDescription>>;

/// Parse tab-separated `git for-each-ref` output produced with the format
/// `%(objectname)%09%(*objectname)%09%(refname)%09%(HEAD)`.
///
/// Annotated tags are resolved to the commit they point at. Refs outside
/// `refs/heads/` and `refs/tags/` are skipped.
pub fn parse_ref_descriptions(output: &str) -> Result<RefDescriptions> {
    let mut refs = RefDescriptions::new();
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        let [object, peeled, refname, head] = fields.as_slice() else {
            return Err(Error::InvalidRefDescription(format!(
                "expected 4 tab-separated fields, got {:?}",
                line
            )));
        };

        let (name, ref_type) = if let Some(name) = refname.strip_prefix("refs/heads/") {
            (name, RefType::Branch)
        } else if let Some(name) = refname.strip_prefix("refs/tags/") {
            (name, RefType::Tag)
        } else {
            continue;
        };

        let commit = if peeled.is_empty() { object } else { peeled };
        refs.entry(commit.to_string())
            .or_default()
            .push(RefDescription {
                name: name.to_string(),
                ref_type,
                is_default_branch: ref_type == RefType::Branch && head.trim() == "*",
            });
    }
    Ok(refs)
}
