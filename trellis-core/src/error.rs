//! Error Taxonomy
//!
//! Every fallible read in the runtime returns [`ReactiveError`]. The type is
//! `Clone` because a failed computation caches its error as the node value
//! and hands the same error to every reader and awaiter.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;

/// Errors surfaced by signals, reactive functions and async handles.
#[derive(Debug, Clone, Error)]
pub enum ReactiveError {
    /// A node was read while it was already computing on the current
    /// evaluation path.
    #[error("cyclic computation detected while reading {node}")]
    Cyclic { node: String },

    /// A computation body failed.
    #[error("computation failed: {message}")]
    Computation {
        message: String,
        #[source]
        source: Option<SharedError>,
    },

    /// An internal state combination that can never occur was observed.
    #[error("unreachable state: {context}")]
    Unreachable { context: &'static str },

    /// The handle or state setter outlived the node that owned it.
    #[error("reactive value was released")]
    Released,
}

impl ReactiveError {
    pub fn computation(message: impl Into<String>) -> Self {
        Self::Computation {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an arbitrary error as a computation failure, keeping it as the
    /// source.
    pub fn from_error<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Computation {
            message: err.to_string(),
            source: Some(SharedError(Arc::new(err))),
        }
    }

    pub(crate) fn cyclic(node: impl Into<String>) -> Self {
        Self::Cyclic { node: node.into() }
    }

    pub(crate) fn unreachable(context: &'static str) -> Self {
        Self::Unreachable { context }
    }

    #[must_use]
    pub fn is_cyclic(&self) -> bool {
        matches!(self, Self::Cyclic { .. })
    }
}

/// Reference-counted error source so [`ReactiveError`] stays `Clone`.
#[derive(Clone)]
pub struct SharedError(Arc<dyn StdError + Send + Sync>);

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl StdError for SharedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = ReactiveError::from_error(io);

        assert_eq!(err.to_string(), "computation failed: disk on fire");
        assert!(err.source().is_some());
        assert!(!err.is_cyclic());
    }

    #[test]
    fn cyclic_names_the_node() {
        let err = ReactiveError::cyclic("total");
        assert!(err.is_cyclic());
        assert!(err.to_string().contains("total"));
    }
}
