//! Error types for session loading.
//!
//! Cancellation is its own variant so the router can tell "the session was
//! canceled" apart from "a part failed" without inspecting error chains.

use std::fmt;
use std::sync::Arc;

/// Result of a part, an action group, or a whole session load.
pub type LoadResult<T = ()> = Result<T, LoadError>;

/// Terminal failure of a unit of loading work.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    /// The session was canceled. Reported, never rethrown.
    #[error("Canceled")]
    Canceled,

    /// A genuine failure; carries the underlying cause for diagnostics.
    ///
    /// Shared so the same failure can be handed to observers, the error
    /// handler and the caller.
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),
}

impl LoadError {
    /// Wraps any error as a genuine failure.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        LoadError::Failed(Arc::new(err.into()))
    }

    /// Builds a genuine failure from a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        LoadError::Failed(Arc::new(anyhow::Error::msg(message)))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, LoadError::Canceled)
    }

    /// Returns the underlying cause for a genuine failure.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            LoadError::Canceled => None,
            LoadError::Failed(err) => Some(err),
        }
    }

    /// Collapses the failures of a fan-in into a single error.
    ///
    /// - no failures: `None`
    /// - only cancellations: `Canceled`
    /// - otherwise the first genuine failure; sibling cancellations are dropped
    pub fn aggregate<I>(errors: I) -> Option<LoadError>
    where
        I: IntoIterator<Item = LoadError>,
    {
        let mut saw_cancel = false;
        for err in errors {
            match err {
                LoadError::Canceled => saw_cancel = true,
                failed @ LoadError::Failed(_) => return Some(failed),
            }
        }
        saw_cancel.then_some(LoadError::Canceled)
    }
}

impl From<anyhow::Error> for LoadError {
    fn from(err: anyhow::Error) -> Self {
        LoadError::Failed(Arc::new(err))
    }
}

impl From<ParameterError> for LoadError {
    fn from(err: ParameterError) -> Self {
        LoadError::failed(err)
    }
}

/// Failure to read a session parameter.
#[derive(Debug, thiserror::Error)]
pub enum ParameterError {
    #[error("parameter '{name}' not found")]
    NotFound { name: String },

    #[error("parameter '{name}' has an unexpected type")]
    Invalid {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_empty_is_none() {
        assert!(LoadError::aggregate(Vec::new()).is_none());
    }

    #[test]
    fn test_aggregate_only_cancellations_is_canceled() {
        let err = LoadError::aggregate(vec![LoadError::Canceled, LoadError::Canceled]);
        assert!(matches!(err, Some(LoadError::Canceled)));
    }

    #[test]
    fn test_aggregate_prefers_first_failure() {
        let err = LoadError::aggregate(vec![
            LoadError::Canceled,
            LoadError::msg("first"),
            LoadError::msg("second"),
        ])
        .unwrap();
        assert_eq!(err.to_string(), "first");
        assert!(!err.is_canceled());
    }

    #[test]
    fn test_failed_display_keeps_context_chain() {
        let err: LoadError = anyhow::anyhow!("disk gone")
            .context("load header")
            .into();
        assert_eq!(err.to_string(), "load header: disk gone");
    }

    #[test]
    fn test_parameter_error_converts_to_failure() {
        let err: LoadError = ParameterError::NotFound {
            name: "id".to_string(),
        }
        .into();
        assert_eq!(
            err.cause().map(ToString::to_string).as_deref(),
            Some("parameter 'id' not found")
        );
    }
}
