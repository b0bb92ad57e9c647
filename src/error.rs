//! Error taxonomy of the framework.
//!
//! Every fallible framework operation returns a [`GraphError`]. Calculators
//! additionally use [`Continuation`](crate::calculator::Continuation) to ask
//! for a graceful stop without going through the error channel.

use thiserror::Error;

/// Convenience alias used by the whole crate.
pub type GraphResult<T = ()> = Result<T, GraphError>;

/// An error produced by the graph, one of its nodes, or a generator.
///
/// The variants mirror the canonical error space of the framework: they are
/// coarse on purpose, the attached message carries the details. Errors are
/// cheap to clone so that they can be recorded by the graph and also handed
/// to the error callback and to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The graph configuration or an argument of a call is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not legal in the current lifecycle state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// An unknown stream, side packet or executor name was referenced.
    #[error("not found: {0}")]
    NotFound(String),

    /// A name was produced or registered twice.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The operation cannot be satisfied right now (e.g. a full queue).
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The awaited event can no longer happen.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// The run was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// An invariant was violated inside a node or inside the framework.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GraphError {
    /// Rebuilds an error of the same kind with a different message.
    ///
    /// `Cancelled` carries no message and is returned unchanged.
    pub(crate) fn with_message(&self, message: String) -> GraphError {
        match self {
            GraphError::InvalidArgument(_) => GraphError::InvalidArgument(message),
            GraphError::FailedPrecondition(_) => GraphError::FailedPrecondition(message),
            GraphError::NotFound(_) => GraphError::NotFound(message),
            GraphError::AlreadyExists(_) => GraphError::AlreadyExists(message),
            GraphError::Unavailable(_) => GraphError::Unavailable(message),
            GraphError::OutOfRange(_) => GraphError::OutOfRange(message),
            GraphError::Cancelled => GraphError::Cancelled,
            GraphError::Internal(_) => GraphError::Internal(message),
        }
    }
}

/// Combines the recorded errors into a single stable representation.
///
/// A single error is returned as-is. Multiple errors keep the kind of the
/// first one (so that callers matching on e.g. [`GraphError::Cancelled`]
/// keep working) and concatenate all the messages under a fixed prefix.
pub(crate) fn combine_errors(prefix: &str, errors: &[GraphError]) -> Option<GraphError> {
    match errors {
        [] => None,
        [single] => Some(single.clone()),
        [first, ..] => {
            let mut message = String::from(prefix);
            for err in errors {
                message.push_str("\n  ");
                message.push_str(&err.to_string());
            }
            match first {
                // Keep cancellation observable even when more errors piled up
                // behind it, but do not lose the other messages.
                GraphError::Cancelled => Some(GraphError::Cancelled),
                other => Some(other.with_message(message)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_none() {
        assert_eq!(combine_errors("failed", &[]), None);
    }

    #[test]
    fn combine_single_is_identity() {
        let err = GraphError::NotFound("stream 'a'".into());
        assert_eq!(combine_errors("failed", &[err.clone()]), Some(err));
    }

    #[test]
    fn combine_keeps_first_kind() {
        let errors = [
            GraphError::Unavailable("queue full".into()),
            GraphError::Internal("boom".into()),
        ];
        let combined = combine_errors("graph run failed", &errors).unwrap();
        assert!(matches!(combined, GraphError::Unavailable(_)));
        let text = combined.to_string();
        assert!(text.contains("graph run failed"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn combine_prefers_cancelled() {
        let errors = [GraphError::Cancelled, GraphError::Internal("late".into())];
        assert_eq!(
            combine_errors("prefix", &errors),
            Some(GraphError::Cancelled)
        );
    }
}
