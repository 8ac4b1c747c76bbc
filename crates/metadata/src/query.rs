//! Structured filter for upload read paths.
//!
//! An [`UploadQuery`] collects predicates; the store renders them as a
//! conjunction into a [`QueryBuilder`] with every value bound as a parameter.

use crate::authz::{AuthzContext, PermissionsPolicy};
use crate::timestamp::to_micros;
use beacon_core::UploadState;
use sqlx::{QueryBuilder, Sqlite};
use time::OffsetDateTime;

/// Columns decoded into [`crate::models::UploadRow`].
pub(crate) const UPLOAD_COLUMNS: &str = "\
    u.id, u.repository_id, COALESCE(repo.name, '') AS repository_name, \
    u.commit_sha, u.root, u.indexer, u.state, u.failure_message, u.num_failures, \
    u.uploaded_at, u.started_at, u.finished_at, u.process_after, u.committed_at, \
    u.upload_size, u.num_parts, \
    (SELECT group_concat(p.part_index) FROM upload_parts p WHERE p.upload_id = u.id) AS uploaded_parts, \
    u.associated_index_id, u.expired, u.num_references, \
    EXISTS (SELECT 1 FROM upload_visible_at_tip t \
            WHERE t.upload_id = u.id AND t.is_default_branch = 1) AS visible_at_tip, \
    rk.queue_rank";

/// Uploads joined with their repository and queue position.
pub(crate) const UPLOAD_FROM: &str = "\
    uploads u \
    LEFT JOIN repositories repo ON repo.id = u.repository_id \
    LEFT JOIN (SELECT q.id, ROW_NUMBER() OVER ( \
                   ORDER BY COALESCE(q.process_after, q.uploaded_at), q.uploaded_at, q.id \
               ) AS queue_rank \
               FROM uploads q WHERE q.state = 'queued') rk ON rk.id = u.id";

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Predicate {
    IdIn(Vec<i64>),
    Repository(i64),
    State(UploadState),
    Term(String),
    VisibleAtTip,
    UploadedBefore(i64),
    UploadedAfter(i64),
    DependencyOf(i64),
    DependentOf(i64),
    Indexer(String),
    NearestAt {
        repository_id: i64,
        commit: String,
    },
    /// The upload root is a prefix of the path.
    RootEncloses(String),
    /// The upload root is a prefix of the path, or the path of the root.
    RootOverlaps(String),
    CommitDateUnknown,
}

impl Predicate {
    fn push(&self, qb: &mut QueryBuilder<'static, Sqlite>) {
        match self {
            Self::IdIn(ids) if ids.is_empty() => {
                qb.push("0");
            }
            Self::IdIn(ids) => {
                qb.push("u.id IN (");
                let mut list = qb.separated(", ");
                for id in ids {
                    list.push_bind(*id);
                }
                list.push_unseparated(")");
            }
            Self::Repository(repository_id) => {
                qb.push("u.repository_id = ").push_bind(*repository_id);
            }
            Self::State(state) => {
                qb.push("u.state = ").push_bind(state.as_str());
            }
            Self::Term(term) => {
                let pattern = format!("%{}%", escape_like(term));
                qb.push("(");
                for (i, column) in [
                    "u.commit_sha",
                    "u.root",
                    "u.indexer",
                    "COALESCE(u.failure_message, '')",
                    "COALESCE(repo.name, '')",
                    "u.state",
                ]
                .into_iter()
                .enumerate()
                {
                    if i > 0 {
                        qb.push(" OR ");
                    }
                    qb.push(column)
                        .push(" LIKE ")
                        .push_bind(pattern.clone())
                        .push(" ESCAPE '\\'");
                }
                qb.push(")");
            }
            Self::VisibleAtTip => {
                qb.push(
                    "EXISTS (SELECT 1 FROM upload_visible_at_tip t \
                     WHERE t.upload_id = u.id AND t.is_default_branch = 1)",
                );
            }
            Self::UploadedBefore(micros) => {
                qb.push("u.uploaded_at < ").push_bind(*micros);
            }
            Self::UploadedAfter(micros) => {
                qb.push("u.uploaded_at > ").push_bind(*micros);
            }
            Self::DependencyOf(upload_id) => {
                qb.push(
                    "u.id IN (SELECT p.upload_id FROM package_references r \
                     JOIN packages p ON p.scheme = r.scheme AND p.name = r.name \
                     AND p.version = r.version WHERE r.upload_id = ",
                )
                .push_bind(*upload_id)
                .push(" AND p.upload_id != r.upload_id)");
            }
            Self::DependentOf(upload_id) => {
                qb.push(
                    "u.id IN (SELECT r.upload_id FROM packages p \
                     JOIN package_references r ON r.scheme = p.scheme AND r.name = p.name \
                     AND r.version = p.version WHERE p.upload_id = ",
                )
                .push_bind(*upload_id)
                .push(" AND r.upload_id != p.upload_id)");
            }
            Self::Indexer(indexer) => {
                qb.push("u.indexer = ").push_bind(indexer.clone());
            }
            Self::NearestAt {
                repository_id,
                commit,
            } => {
                qb.push("u.id IN (SELECT n.upload_id FROM nearest_uploads n WHERE n.repository_id = ")
                    .push_bind(*repository_id)
                    .push(" AND n.commit_sha = ")
                    .push_bind(commit.clone())
                    .push(")");
            }
            Self::RootEncloses(path) => {
                qb.push("substr(")
                    .push_bind(path.clone())
                    .push(", 1, length(u.root)) = u.root");
            }
            Self::RootOverlaps(path) => {
                qb.push("(substr(")
                    .push_bind(path.clone())
                    .push(", 1, length(u.root)) = u.root OR substr(u.root, 1, length(")
                    .push_bind(path.clone())
                    .push(")) = ")
                    .push_bind(path.clone())
                    .push(")");
            }
            Self::CommitDateUnknown => {
                qb.push("u.committed_at IS NULL");
            }
        }
    }
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Predicates joined with `AND`, rendered as a `WHERE` clause.
pub(crate) struct Conjunction<'a> {
    predicates: &'a [Predicate],
    include_deleted: bool,
    authz: AuthzContext,
    policy: PermissionsPolicy,
}

impl Conjunction<'_> {
    pub(crate) fn push_where(&self, qb: &mut QueryBuilder<'static, Sqlite>) {
        let mut first = true;
        let mut open = |qb: &mut QueryBuilder<'static, Sqlite>| {
            qb.push(if first { " WHERE (" } else { " AND (" });
            first = false;
        };

        if !self.include_deleted {
            open(qb);
            qb.push("u.state NOT IN ('deleting', 'deleted'))");
        }

        for predicate in self.predicates {
            open(qb);
            predicate.push(qb);
            qb.push(")");
        }

        if self.authz != AuthzContext::Internal {
            open(qb);
            self.policy.push_predicate(qb, self.authz);
            qb.push(")");
        }
    }
}

/// Filter for listing uploads.
#[derive(Clone, Debug, Default)]
pub struct UploadQuery {
    predicates: Vec<Predicate>,
    include_deleted: bool,
    oldest_first: bool,
    limit: Option<u32>,
    offset: u32,
}

impl UploadQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given upload IDs.
    pub fn ids(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.predicates.push(Predicate::IdIn(ids.into_iter().collect()));
        self
    }

    pub fn repository(mut self, repository_id: i64) -> Self {
        self.predicates.push(Predicate::Repository(repository_id));
        self
    }

    pub fn state(mut self, state: UploadState) -> Self {
        self.predicates.push(Predicate::State(state));
        self
    }

    /// Case-insensitive substring match over commit, root, indexer, failure
    /// message, repository name and state.
    pub fn term(mut self, term: impl Into<String>) -> Self {
        let term = term.into();
        if !term.is_empty() {
            self.predicates.push(Predicate::Term(term));
        }
        self
    }

    pub fn visible_at_tip(mut self) -> Self {
        self.predicates.push(Predicate::VisibleAtTip);
        self
    }

    pub fn uploaded_before(mut self, at: OffsetDateTime) -> Self {
        self.predicates.push(Predicate::UploadedBefore(to_micros(at)));
        self
    }

    pub fn uploaded_after(mut self, at: OffsetDateTime) -> Self {
        self.predicates.push(Predicate::UploadedAfter(to_micros(at)));
        self
    }

    /// Uploads exporting a package that `upload_id` references.
    pub fn dependency_of(mut self, upload_id: i64) -> Self {
        self.predicates.push(Predicate::DependencyOf(upload_id));
        self
    }

    /// Uploads referencing a package that `upload_id` exports.
    pub fn dependent_of(mut self, upload_id: i64) -> Self {
        self.predicates.push(Predicate::DependentOf(upload_id));
        self
    }

    pub fn indexer(mut self, indexer: impl Into<String>) -> Self {
        self.predicates.push(Predicate::Indexer(indexer.into()));
        self
    }

    /// Include `deleting` and `deleted` uploads.
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn oldest_first(mut self) -> Self {
        self.oldest_first = true;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub(crate) fn nearest_at(mut self, repository_id: i64, commit: impl Into<String>) -> Self {
        self.predicates.push(Predicate::NearestAt {
            repository_id,
            commit: commit.into(),
        });
        self
    }

    pub(crate) fn root_for_path(mut self, path: impl Into<String>, must_enclose: bool) -> Self {
        let path = path.into();
        self.predicates.push(if must_enclose {
            Predicate::RootEncloses(path)
        } else {
            Predicate::RootOverlaps(path)
        });
        self
    }

    pub(crate) fn commit_date_unknown(mut self) -> Self {
        self.predicates.push(Predicate::CommitDateUnknown);
        self
    }

    pub(crate) fn conjunction(
        &self,
        authz: AuthzContext,
        policy: PermissionsPolicy,
    ) -> Conjunction<'_> {
        Conjunction {
            predicates: &self.predicates,
            include_deleted: self.include_deleted,
            authz,
            policy,
        }
    }

    /// Page select over [`UPLOAD_COLUMNS`].
    pub(crate) fn select(
        &self,
        authz: AuthzContext,
        policy: PermissionsPolicy,
    ) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new(format!("SELECT {UPLOAD_COLUMNS} FROM {UPLOAD_FROM}"));
        self.conjunction(authz, policy).push_where(&mut qb);
        qb.push(if self.oldest_first {
            " ORDER BY u.uploaded_at ASC, u.id ASC"
        } else {
            " ORDER BY u.uploaded_at DESC, u.id DESC"
        });
        if let Some(limit) = self.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
            qb.push(" OFFSET ").push_bind(i64::from(self.offset));
        }
        qb
    }

    /// Total number of rows matching the filter, ignoring pagination.
    pub(crate) fn count(
        &self,
        authz: AuthzContext,
        policy: PermissionsPolicy,
    ) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new(
            "SELECT COUNT(*) FROM uploads u LEFT JOIN repositories repo ON repo.id = u.repository_id",
        );
        self.conjunction(authz, policy).push_where(&mut qb);
        qb
    }

    /// Distinct indexer names matching the filter.
    pub(crate) fn indexers(
        &self,
        authz: AuthzContext,
        policy: PermissionsPolicy,
    ) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new(
            "SELECT DISTINCT u.indexer FROM uploads u \
             LEFT JOIN repositories repo ON repo.id = u.repository_id",
        );
        self.conjunction(authz, policy).push_where(&mut qb);
        qb.push(" ORDER BY u.indexer");
        qb
    }
}
