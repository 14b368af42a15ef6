//! Call outcomes and error classification.
use serde::{Deserialize, Serialize};
use std::{error::Error, fmt};

/// The coarse category of a failed call.
///
/// A breaker's configuration lists which kinds advance it towards opening;
/// the rest are only recorded in the failure rate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The call did not complete in time.
    Timeout,
    /// The dependency answered with an unsuccessful status.
    BadStatus,
    /// The dependency could not be reached.
    Network,
    /// Anything else.
    Other,
}

/// Maps an error to its [`ErrorKind`].
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// A ready-made error type for protected calls.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("call timed out")]
    Timeout,
    #[error("dependency returned status {0}")]
    BadStatus(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

/// The result of running one call through a breaker.
#[derive(Debug)]
#[must_use]
pub enum Outcome<T, E> {
    /// The call ran and succeeded.
    Success(T),
    /// The call ran and failed with an error that counts towards opening the
    /// breaker.
    CountedFailure(E),
    /// The call ran and failed, but its error kind is not one the breaker
    /// counts. It still lowers the rolling success rate.
    UncountedFailure(E),
    /// The breaker refused the call; it was never attempted.
    Rejected,
}

/// Error half of [`Outcome::into_result`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("call not permitted: circuit breaker is open")]
    Rejected,
    #[error("call failed")]
    Failed(#[source] E),
}

// === impl ErrorKind ===

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::BadStatus => "bad_status",
            ErrorKind::Network => "network",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl CallError ===

impl CallError {
    pub fn other(error: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        CallError::Other(error.into())
    }
}

impl Classify for CallError {
    fn kind(&self) -> ErrorKind {
        match self {
            CallError::Timeout => ErrorKind::Timeout,
            CallError::BadStatus(_) => ErrorKind::BadStatus,
            CallError::Network(_) => ErrorKind::Network,
            CallError::Other(_) => ErrorKind::Other,
        }
    }
}

impl From<tokio::time::error::Elapsed> for CallError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CallError::Timeout
    }
}

impl Classify for tokio::time::error::Elapsed {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Timeout
    }
}

impl<E: Classify + ?Sized> Classify for &E {
    fn kind(&self) -> ErrorKind {
        (**self).kind()
    }
}

impl<E: Classify + ?Sized> Classify for Box<E> {
    fn kind(&self) -> ErrorKind {
        (**self).kind()
    }
}

// === impl Outcome ===

impl<T, E> Outcome<T, E> {
    /// A short name for the outcome, used as a metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::CountedFailure(_) => "counted_failure",
            Outcome::UncountedFailure(_) => "uncounted_failure",
            Outcome::Rejected => "rejected",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Returns `true` if the call ran and failed, counted or not.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Outcome::CountedFailure(_) | Outcome::UncountedFailure(_)
        )
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected)
    }

    pub fn into_result(self) -> Result<T, BreakerError<E>> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::CountedFailure(error) | Outcome::UncountedFailure(error) => {
                Err(BreakerError::Failed(error))
            }
            Outcome::Rejected => Err(BreakerError::Rejected),
        }
    }
}

// === impl BreakerError ===

impl<E> BreakerError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, BreakerError::Rejected)
    }

    /// Returns the underlying call error, if the call ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Failed(error) => Some(error),
            BreakerError::Rejected => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_error_kinds() {
        assert_eq!(CallError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(CallError::BadStatus(503).kind(), ErrorKind::BadStatus);
        assert_eq!(
            CallError::Network("connection refused".into()).kind(),
            ErrorKind::Network
        );
        assert_eq!(CallError::other("boom").kind(), ErrorKind::Other);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_is_a_timeout() {
        let elapsed = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        assert_eq!(elapsed.kind(), ErrorKind::Timeout);
        assert_eq!(CallError::from(elapsed).kind(), ErrorKind::Timeout);
    }

    #[test]
    fn outcome_into_result() {
        let ok: Outcome<u8, CallError> = Outcome::Success(7);
        assert_eq!(ok.into_result().unwrap(), 7);

        let rejected: Outcome<u8, CallError> = Outcome::Rejected;
        assert!(rejected.into_result().unwrap_err().is_rejected());

        let failed: Outcome<u8, CallError> = Outcome::UncountedFailure(CallError::other("nope"));
        let err = failed.into_result().unwrap_err();
        assert!(!err.is_rejected());
        assert_eq!(err.into_inner().unwrap().kind(), ErrorKind::Other);
    }

    #[test]
    fn rejection_reads_differently_from_failure() {
        let rejected = BreakerError::<CallError>::Rejected.to_string();
        let failed = BreakerError::Failed(CallError::BadStatus(500));
        assert!(rejected.contains("not permitted"));
        assert_eq!(failed.to_string(), "call failed");
        assert_eq!(
            failed.source().map(|e| e.to_string()),
            Some("dependency returned status 500".to_string())
        );
    }

    #[test]
    fn kinds_deserialize_snake_case() {
        #[derive(Deserialize)]
        struct Kinds {
            kinds: Vec<ErrorKind>,
        }
        let parsed: Kinds = toml::from_str(r#"kinds = ["timeout", "bad_status"]"#).unwrap();
        assert_eq!(parsed.kinds, vec![ErrorKind::Timeout, ErrorKind::BadStatus]);
    }
}
