use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use switchyard::models::{ContactId, OrgId};
use switchyard::search::{ContactSearcher, SearchError};

/// Mock searcher with canned query results. Unknown queries are reported as
/// user errors, matching how a real index rejects unparseable input.
#[derive(Default)]
pub struct MockSearcher {
    results: Mutex<HashMap<String, Vec<ContactId>>>,
}

impl MockSearcher {
    pub fn new() -> MockSearcher {
        MockSearcher::default()
    }

    pub fn with_result(self, query: &str, ids: Vec<ContactId>) -> Self {
        self.results.lock().insert(query.to_string(), ids);
        self
    }
}

#[async_trait]
impl ContactSearcher for MockSearcher {
    async fn contact_ids_for_query(
        &self,
        _org: OrgId,
        query: &str,
    ) -> Result<Vec<ContactId>, SearchError> {
        match self.results.lock().get(query) {
            Some(ids) => Ok(ids.clone()),
            None => Err(SearchError::UserQuery(format!(
                "can't resolve query: {}",
                query
            ))),
        }
    }

    async fn contact_matches(
        &self,
        _org: OrgId,
        query: &str,
        contact: ContactId,
    ) -> Result<bool, SearchError> {
        Ok(self
            .results
            .lock()
            .get(query)
            .is_some_and(|ids| ids.contains(&contact)))
    }
}
