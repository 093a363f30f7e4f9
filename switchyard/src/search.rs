use async_trait::async_trait;
use thiserror::Error;

use crate::models::{ContactId, OrgId};

/// Failure modes of a contact search. The split matters at the worker
/// boundary: a bad query is the user's error and marks the owning flow start
/// failed without escalating, while an unreachable index is retried like any
/// other infrastructure fault.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid contact query: {0}")]
    UserQuery(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Evaluates contact queries against the search index. The index itself is
/// an external collaborator; only this interface is part of the core.
#[async_trait]
pub trait ContactSearcher: Send + Sync {
    /// Resolve a free-text query to the matching contact ids.
    async fn contact_ids_for_query(
        &self,
        org: OrgId,
        query: &str,
    ) -> Result<Vec<ContactId>, SearchError>;

    /// Whether a single contact matches a query. Used to recompute dynamic
    /// group memberships when a contact is created or unstopped.
    async fn contact_matches(
        &self,
        org: OrgId,
        query: &str,
        contact: ContactId,
    ) -> Result<bool, SearchError>;
}
