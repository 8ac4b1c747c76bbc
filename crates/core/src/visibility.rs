//! Nearest-upload computation over a commit graph.
//!
//! For every commit the engine determines, per root directory, the closest
//! completed upload reachable by following parent edges. Uploads further
//! than `max_commits` edges away, or committed before the age horizon, are
//! not visible.

use crate::commit_graph::CommitGraph;
use crate::error::Result;
use crate::upload::CommitDate;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use time::{Duration, OffsetDateTime};

/// The subset of an upload the visibility engine needs.
#[derive(Clone, Debug)]
pub struct UploadMeta {
    pub id: i64,
    pub commit: String,
    pub root: String,
    pub finished_at: Option<OffsetDateTime>,
    pub committed_at: Option<CommitDate>,
}

/// Bounds applied to a visibility computation.
#[derive(Clone, Copy, Debug)]
pub struct VisibilityOptions {
    /// Maximum number of parent edges between a commit and a visible upload.
    pub max_commits: u32,
    /// Uploads committed before `now - max_age` are ignored.
    pub max_age: Option<Duration>,
    pub now: OffsetDateTime,
}

/// An upload visible from some commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NearestUpload {
    pub upload_id: i64,
    pub root: String,
    pub distance: u32,
}

#[derive(Clone, Copy)]
struct Candidate<'a> {
    upload: &'a UploadMeta,
    distance: u32,
}

impl Candidate<'_> {
    /// Closer wins, then the most recently finished, then the newest ID.
    fn beats(&self, other: &Candidate<'_>) -> bool {
        other
            .distance
            .cmp(&self.distance)
            .then_with(|| self.upload.finished_at.cmp(&other.upload.finished_at))
            .then_with(|| self.upload.id.cmp(&other.upload.id))
            == Ordering::Greater
    }
}

fn offer<'a>(visible: &mut BTreeMap<&'a str, Candidate<'a>>, candidate: Candidate<'a>) {
    let root = candidate.upload.root.as_str();
    match visible.get(root) {
        Some(current) if !candidate.beats(current) => {}
        _ => {
            visible.insert(root, candidate);
        }
    }
}

/// Per-commit nearest uploads for one repository.
#[derive(Clone, Debug, Default)]
pub struct VisibilityGraph {
    nearest: HashMap<String, Vec<NearestUpload>>,
}

impl VisibilityGraph {
    /// Walk `graph` ancestors-first and resolve the nearest upload per root
    /// for every commit.
    pub fn compute(
        graph: &CommitGraph,
        uploads: &[UploadMeta],
        options: &VisibilityOptions,
    ) -> Result<Self> {
        let horizon = options.max_age.map(|max_age| options.now - max_age);

        let mut by_commit: HashMap<&str, Vec<&UploadMeta>> = HashMap::new();
        for upload in uploads {
            let too_old = match (horizon, upload.committed_at) {
                (Some(horizon), Some(committed_at)) => committed_at.is_before(horizon),
                _ => false,
            };
            if !too_old {
                by_commit
                    .entry(upload.commit.as_str())
                    .or_default()
                    .push(upload);
            }
        }

        let mut state: HashMap<&str, BTreeMap<&str, Candidate<'_>>> = HashMap::new();
        for commit in graph.ancestors_first()? {
            let mut visible: BTreeMap<&str, Candidate<'_>> = BTreeMap::new();

            for parent in graph.parents(commit) {
                let Some(inherited) = state.get(parent.as_str()) else {
                    continue;
                };
                for candidate in inherited.values() {
                    let distance = candidate.distance + 1;
                    if distance > options.max_commits {
                        continue;
                    }
                    offer(
                        &mut visible,
                        Candidate {
                            upload: candidate.upload,
                            distance,
                        },
                    );
                }
            }

            for upload in by_commit.get(commit).into_iter().flatten() {
                offer(
                    &mut visible,
                    Candidate {
                        upload: *upload,
                        distance: 0,
                    },
                );
            }

            state.insert(commit, visible);
        }

        let nearest = state
            .into_iter()
            .filter(|(_, visible)| !visible.is_empty())
            .map(|(commit, visible)| {
                let uploads = visible
                    .into_values()
                    .map(|candidate| NearestUpload {
                        upload_id: candidate.upload.id,
                        root: candidate.upload.root.clone(),
                        distance: candidate.distance,
                    })
                    .collect();
                (commit.to_string(), uploads)
            })
            .collect();

        Ok(Self { nearest })
    }

    /// Uploads visible from `commit`, ordered by root.
    pub fn visible_at(&self, commit: &str) -> &[NearestUpload] {
        self.nearest
            .get(commit)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_visible(&self, commit: &str, upload_id: i64) -> bool {
        self.visible_at(commit)
            .iter()
            .any(|upload| upload.upload_id == upload_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[NearestUpload])> {
        self.nearest
            .iter()
            .map(|(commit, uploads)| (commit.as_str(), uploads.as_slice()))
    }

    /// Number of commits with at least one visible upload.
    pub fn num_commits(&self) -> usize {
        self.nearest.len()
    }

    /// Total number of (commit, upload) pairs.
    pub fn num_entries(&self) -> usize {
        self.nearest.values().map(Vec::len).sum()
    }
}
