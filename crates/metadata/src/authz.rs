//! Repository permission filtering.
//!
//! Every read path that returns uploads takes an [`AuthzContext`] describing
//! the caller. The store combines it with the [`PermissionsPolicy`] it was
//! constructed with and renders a SQL predicate over `u.repository_id`.

use beacon_core::config::AuthzConfig;
use sqlx::{QueryBuilder, Sqlite};

/// Identity of the caller of a read operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthzContext {
    /// Background workers and admin tooling. Sees every repository.
    Internal,
    /// Unauthenticated caller.
    Anonymous,
    /// An authenticated user.
    User(i64),
}

/// Store-wide permission policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PermissionsPolicy {
    /// When set, private and public repositories alike require an explicit
    /// `repository_permissions` row, and anonymous callers see nothing.
    pub enforce_user_mapping: bool,
}

impl PermissionsPolicy {
    pub fn from_config(config: &AuthzConfig) -> Self {
        Self {
            enforce_user_mapping: config.enforce_user_mapping,
        }
    }

    /// Append the visibility predicate for `authz` to `qb`.
    ///
    /// Returns `false` without touching the builder when no filtering applies.
    pub(crate) fn push_predicate(
        &self,
        qb: &mut QueryBuilder<'static, Sqlite>,
        authz: AuthzContext,
    ) -> bool {
        match (authz, self.enforce_user_mapping) {
            (AuthzContext::Internal, _) => false,
            (AuthzContext::Anonymous, true) => {
                qb.push("1 = 0");
                true
            }
            (AuthzContext::Anonymous, false) => {
                qb.push(
                    "EXISTS (SELECT 1 FROM repositories ar \
                     WHERE ar.id = u.repository_id AND ar.deleted_at IS NULL AND ar.private = 0)",
                );
                true
            }
            (AuthzContext::User(user_id), enforce) => {
                qb.push(
                    "EXISTS (SELECT 1 FROM repositories ar \
                     WHERE ar.id = u.repository_id AND ar.deleted_at IS NULL AND (",
                );
                if !enforce {
                    qb.push("ar.private = 0 OR ");
                }
                qb.push(
                    "EXISTS (SELECT 1 FROM repository_permissions rp \
                     WHERE rp.repository_id = ar.id AND rp.user_id = ",
                );
                qb.push_bind(user_id);
                qb.push(")))");
                true
            }
        }
    }
}
