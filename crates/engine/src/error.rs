//! Failure taxonomy shared by the retrier, the admission controller and the
//! poller.
//!
//! Failures are a closed set of tagged variants that callers match
//! exhaustively:
//!
//! | Class | Rust type | Retried? |
//! |-------|-----------|----------|
//! | **ClientError** | [`RetryError::Client`] | never, surfaced immediately |
//! | **TransientError** | [`FailureClass::Transient`] / [`Failure::TimedOut`] | up to `max_attempts` |
//! | **FatalFailure** | [`RetryError::Fatal`] | terminal, carries attempt count and cause |
//! | **CancellationSignal** | [`RetryError::Cancelled`] / [`AdmissionError::Cancelled`] | never |
//!
//! Poll loops never raise fetch failures; [`PollerError`] only reports on the
//! background task itself.
//!
//! The engine has no knowledge of any wire protocol. Whether a failure is a
//! client-side or a transient one is decided by the caller, either through a
//! [`RetryPolicy`](crate::retry::RetryPolicy) or by implementing [`Classify`]
//! on its own error type.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Boxed error type used by observer callbacks and other dynamic seams
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Classification of a single failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Caller-side failure (malformed request, validation). Never retried.
    Client,
    /// Server-side or connectivity failure. Retried while budget remains.
    Transient,
}

impl FailureClass {
    /// Whether this class consumes retry budget
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Transient => write!(f, "transient"),
        }
    }
}

/// Implemented by caller error types that know their own failure class.
///
/// ```rust
/// use backstop_engine::error::{Classify, FailureClass};
///
/// #[derive(Debug)]
/// enum ApiError {
///     BadRequest(String),
///     Unavailable,
/// }
///
/// impl Classify for ApiError {
///     fn failure_class(&self) -> FailureClass {
///         match self {
///             Self::BadRequest(_) => FailureClass::Client,
///             Self::Unavailable => FailureClass::Transient,
///         }
///     }
/// }
///
/// assert!(ApiError::Unavailable.is_retryable());
/// assert!(!ApiError::BadRequest("missing field".into()).is_retryable());
/// ```
pub trait Classify {
    /// Class of this failure
    fn failure_class(&self) -> FailureClass;

    /// Shorthand for `failure_class().is_retryable()`
    fn is_retryable(&self) -> bool {
        self.failure_class().is_retryable()
    }
}

/// The concrete failure of one attempt: either the work's own error or a
/// per-attempt timeout imposed by the engine.
#[derive(Debug, Error)]
pub enum Failure<E> {
    /// The unit of work returned an error
    #[error("{0}")]
    Error(E),

    /// The attempt exceeded its per-attempt timeout
    #[error("attempt timed out after {timeout:?}")]
    TimedOut {
        /// The timeout that elapsed
        timeout: Duration,
    },
}

impl<E> Failure<E> {
    /// Borrow the underlying error, if the failure was not a timeout
    pub const fn error(&self) -> Option<&E> {
        match self {
            Self::Error(error) => Some(error),
            Self::TimedOut { .. } => None,
        }
    }

    /// Consume the failure, returning the underlying error if any
    pub fn into_error(self) -> Option<E> {
        match self {
            Self::Error(error) => Some(error),
            Self::TimedOut { .. } => None,
        }
    }

    /// Whether the failure was a per-attempt timeout
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// Terminal outcome of [`RetryExecutor::execute`](crate::retry::RetryExecutor::execute).
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The policy classified the failure as a client error. The original error
    /// is returned unchanged and no retry budget was consumed.
    #[error("non-retryable failure: {source}")]
    Client {
        /// The original error
        source: E,
    },

    /// Every allowed attempt failed transiently
    #[error("gave up after {attempts} attempts: {cause}")]
    Fatal {
        /// Total attempts made, including the first
        attempts: u32,
        /// The last transient failure
        cause: Failure<E>,
    },

    /// A cancellation signal interrupted the execution
    #[error("execution cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// Whether the execution gave up after exhausting its attempts
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Whether the execution was stopped by cancellation
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the failure was classified as a client error
    pub const fn is_client(&self) -> bool {
        matches!(self, Self::Client { .. })
    }

    /// Number of attempts made before a fatal failure
    pub const fn attempts(&self) -> Option<u32> {
        match self {
            Self::Fatal { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// Errors reported by the admission controller.
///
/// `acquire` never fails on its own: it either admits or is cancelled. The
/// remaining variants flag permit misuse, which is a programming error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// Waiting for admission was cancelled
    #[error("admission cancelled while waiting")]
    Cancelled,

    /// The permit was already released
    #[error("permit {permit_id} released twice")]
    AlreadyReleased {
        /// Identifier of the offending permit
        permit_id: u64,
    },

    /// The permit was issued by a different controller
    #[error("permit {permit_id} does not belong to this controller")]
    ForeignPermit {
        /// Identifier of the offending permit
        permit_id: u64,
    },
}

/// Result type for admission operations
pub type AdmissionResult<T> = Result<T, AdmissionError>;

/// Errors reported by a poll handle about its background task.
///
/// Fetch failures never surface here; they only drive interval back-off and
/// the failure observers.
#[derive(Debug, Error)]
pub enum PollerError {
    /// The poll task panicked, usually inside the fetcher
    #[error("poll task failed: {0}")]
    TaskFailed(String),

    /// The poll task did not finish in time after being stopped
    #[error("poll task did not stop within {timeout:?}")]
    JoinTimeout {
        /// How long the handle waited
        timeout: Duration,
    },
}

/// Result type for poller lifecycle operations
pub type PollerResult<T> = Result<T, PollerError>;
