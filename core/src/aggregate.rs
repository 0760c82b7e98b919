//! Aggregate loading collaborator used by snapshotting helpers.
//!
//! Reply correlation does not load aggregates itself. The trait lives here so
//! that snapshotting helpers built on top of the engine share one definition
//! of "load the latest state of an aggregate".

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur while loading an aggregate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// A failure worth retrying (connection reset, lock timeout, ...).
    #[error("Transient repository failure: {0}")]
    Transient(String),

    /// A failure that will not go away by retrying.
    #[error("Repository failure: {0}")]
    Other(String),
}

impl RepositoryError {
    /// Whether a caller may retry the operation.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Loads the latest state of an aggregate.
pub trait AggregateRepository: Send + Sync {
    /// The aggregate representation this repository returns.
    type Aggregate: Send;

    /// Load the latest state of `aggregate_id`, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Transient`] for failures a caller may retry
    /// and [`RepositoryError::Other`] otherwise.
    fn load_latest<'a>(
        &'a self,
        aggregate_type: &'a str,
        aggregate_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Self::Aggregate>, RepositoryError>> + Send + 'a>>;
}
