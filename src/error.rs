//! Error types for the circuit breaker façade.

use std::time::Duration;

use thiserror::Error;

/// Boxed error returned by setup hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for circuit breaker operations.
pub type BreakerResult<T, E> = Result<T, BreakerError<E>>;

/// Error type for a breaker's `fire` operation.
///
/// Everything here is an operational error: it goes through the breaker's
/// fallback before it reaches the caller.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open, calls are not permitted.
    #[error("circuit breaker is open")]
    Open,

    /// The wrapped operation did not finish in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// All of the breaker's concurrent call slots are taken.
    #[error("circuit breaker is at capacity")]
    CapacityExceeded,

    /// The breaker has been shut down and accepts no more calls.
    #[error("circuit breaker has been shut down")]
    Shutdown,

    /// The underlying operation failed.
    #[error("operation error: {0}")]
    Operation(#[source] E),
}

impl<E> BreakerError<E> {
    /// Returns the wrapped operation error, if this is one.
    pub fn operation(&self) -> Option<&E> {
        match self {
            BreakerError::Operation(err) => Some(err),
            _ => None,
        }
    }

    /// Consumes the error and returns the operation error, if this is one.
    pub fn into_operation(self) -> Option<E> {
        match self {
            BreakerError::Operation(err) => Some(err),
            _ => None,
        }
    }
}

/// Programmer errors: raised at setup or first invocation, never retried and
/// never routed through a fallback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// The intercepted target is not a callable method.
    #[error("intercepted member `{0}` is not a callable method")]
    NotAFunction(String),

    /// A breaker identity (or registry key) is empty on one side.
    #[error("breaker identity must have a non-empty group and name")]
    InvalidIdentity,

    /// The breaker handle cannot be registered.
    #[error("breaker handle for `{0}` is not usable")]
    InvalidBreaker(String),

    /// A breaker is already registered under this key.
    #[error("a breaker is already registered under `{0}`")]
    DuplicateIdentity(String),

    /// The key is registered, but to a breaker with a different call signature.
    #[error("breaker registered under `{0}` wraps a different call signature")]
    IncompatibleBreaker(String),
}

/// Error returned by an intercepted method call.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The call site or registry is misconfigured.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// A setup hook failed while the breaker was being created.
    #[error("breaker setup hook failed: {0}")]
    Setup(#[source] BoxError),

    /// The breaker rejected the call or the operation failed.
    #[error("{0}")]
    Breaker(#[from] BreakerError<E>),
}

impl<E> CallError<E> {
    /// Returns the wrapped operation error, if the call failed inside the operation.
    pub fn operation(&self) -> Option<&E> {
        match self {
            CallError::Breaker(err) => err.operation(),
            _ => None,
        }
    }

    /// Returns the breaker error, if the call reached the breaker.
    pub fn breaker_error(&self) -> Option<&BreakerError<E>> {
        match self {
            CallError::Breaker(err) => Some(err),
            _ => None,
        }
    }
}
