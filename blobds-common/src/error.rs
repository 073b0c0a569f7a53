use crate::key::Key;

/// Errors surfaced by every `Datastore` implementation.
#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("datastore: key not found")]
    NotFound,
    #[error("datastore: {0} is not supported by this backend")]
    Unsupported(&'static str),
    /// Backend failure that has no generic meaning. Kept opaque so callers
    /// can still downcast to the backend's own error type.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl DatastoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        DatastoreError::Backend(Box::new(err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DatastoreError::NotFound)
    }
}

/// Failure attached to a single element of a query result stream.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// Fetching the value of one listed key failed. Sibling entries are
    /// unaffected.
    #[error("failed to fetch value for {key}: {source}")]
    Fetch {
        key: Key,
        #[source]
        source: DatastoreError,
    },
    /// The listing itself failed; no further entries follow.
    #[error("listing failed: {0}")]
    Listing(#[source] DatastoreError),
}

impl QueryError {
    pub fn key(&self) -> Option<&Key> {
        match self {
            QueryError::Fetch { key, .. } => Some(key),
            QueryError::Listing(_) => None,
        }
    }
}
