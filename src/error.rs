//! Cache error types

use std::sync::Arc;

use crate::CacheKey;

/// Boxed error returned by fetchers and writers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A fetcher or writer failure, shared between the cache entry and every
/// caller waiting on the same operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error(transparent)]
pub struct RemoteError(Arc<dyn std::error::Error + Send + Sync>);

impl RemoteError {
    pub fn new(error: impl Into<BoxError>) -> Self {
        Self(Arc::from(error.into()))
    }

    /// Borrow the underlying error, e.g. to downcast it
    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.0.as_ref()
    }
}

impl From<BoxError> for RemoteError {
    fn from(error: BoxError) -> Self {
        Self(Arc::from(error))
    }
}

/// Cache-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Fetch failed for key {key}: {source}")]
    Fetch { key: CacheKey, source: RemoteError },

    #[error("Mutation failed for key {key}: {source}")]
    Mutation { key: CacheKey, source: RemoteError },

    #[error("Cannot trigger the mutation: missing key")]
    MissingKey,

    #[error("In-flight fetch for key {key} ended without a result")]
    Aborted { key: CacheKey },
}

impl CacheError {
    /// The remote failure behind a fetch or mutation error, if any
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Fetch { source, .. } | Self::Mutation { source, .. } => Some(source),
            _ => None,
        }
    }
}
