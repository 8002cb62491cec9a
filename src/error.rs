use std::sync::Arc;

pub use anyhow::Error as RuntimeError;
use thiserror::Error;

/// A cloneable error produced by a failed call.
///
/// Every node observing the failed cache entry shares the same underlying
/// error, so downstream equality checks can rely on pointer identity. The
/// failure is data flowing through the graph, not an exception; it stays
/// terminal for its fingerprint until the call's inputs change.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct CallError(#[from] pub(crate) Arc<anyhow::Error>);

impl CallError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// True when both handles point at the same underlying error.
    pub fn same_as(&self, other: &CallError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<anyhow::Error> for CallError {
    fn from(e: anyhow::Error) -> Self {
        CallError(Arc::new(e))
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode the cache snapshot.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode the cache snapshot.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
}
