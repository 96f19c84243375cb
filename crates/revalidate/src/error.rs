use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

/// An error produced while resolving a value through an
/// [`AsyncFunction`](crate::AsyncFunction).
///
/// The variants double as the failure classification that drives default
/// substitution: [`Timeout`](Self::Timeout) and
/// [`Connectivity`](Self::Connectivity) are "soft" failures, substituted with
/// the default value whenever a default supplier is configured.
/// [`Failed`](Self::Failed) is substituted only when substitution for
/// failures is enabled, and [`Interrupted`](Self::Interrupted) is never
/// substituted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The bounded synchronous wait on a first request elapsed before the
    /// computation produced a value.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The computation failed at the connection level.
    ///
    /// The attached string carries the underlying error message.
    #[error("connection failed: {0}")]
    Connectivity(String),
    /// The in-flight computation was cancelled out from under a waiting
    /// caller, e.g. because the runtime is shutting down.
    #[error("interrupted")]
    Interrupted,
    /// Any other computation failure.
    #[error("failed: {0}")]
    Failed(String),
}

impl ResolveError {
    /// Whether this failure is eligible for default substitution even when
    /// substitution for failures is disabled.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connectivity(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// Converts the outcome of awaiting a spawned computation.
    ///
    /// A cancelled task maps to [`Interrupted`](Self::Interrupted); a panicked
    /// task is reported as a plain failure. Returning the task's own error
    /// instead of a wrapper is what unwraps the one level of cause that the
    /// join handle adds.
    pub(crate) fn from_join_error(error: JoinError) -> Self {
        if error.is_cancelled() {
            Self::Interrupted
        } else {
            Self::Failed(error.to_string())
        }
    }

    /// Catch-all conversion for unclassified errors.
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr, "unclassified resolver error");
        Self::Failed(e.to_string())
    }
}

impl From<io::Error> for ResolveError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut => Self::Connectivity(err.to_string()),
            _ => Self::Failed(err.to_string()),
        }
    }
}

/// The outcome of resolving a value, either `Ok(T)` or a classified
/// [`ResolveError`].
pub type ResolveResult<T> = Result<T, ResolveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            ResolveError::from(refused),
            ResolveError::Connectivity(_)
        ));

        // A computation-internal timeout is a connection-level problem, not a
        // bounded-wait timeout.
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "socket timeout");
        assert!(matches!(
            ResolveError::from(timed_out),
            ResolveError::Connectivity(_)
        ));

        let other = io::Error::new(io::ErrorKind::InvalidData, "garbage");
        assert_eq!(
            ResolveError::from(other),
            ResolveError::Failed("garbage".into())
        );
    }

    #[test]
    fn test_softness() {
        assert!(ResolveError::Timeout(Duration::from_millis(100)).is_soft());
        assert!(ResolveError::Connectivity("unplugged".into()).is_soft());
        assert!(!ResolveError::Interrupted.is_soft());
        assert!(!ResolveError::Failed("boom".into()).is_soft());
    }

    #[tokio::test]
    async fn test_join_error_conversion() {
        let cancelled = tokio::spawn(std::future::pending::<()>());
        cancelled.abort();
        let err = cancelled.await.unwrap_err();
        assert_eq!(
            ResolveError::from_join_error(err),
            ResolveError::Interrupted
        );

        let panicked = tokio::spawn(async { panic!("boom") });
        let err = panicked.await.unwrap_err();
        assert!(matches!(
            ResolveError::from_join_error(err),
            ResolveError::Failed(_)
        ));
    }
}
