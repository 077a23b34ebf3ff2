//! Error types for the call execution core.
//!
//! Every failure a caller can observe is an [`RpcError`] tagged with a
//! [`Code`]; the code alone decides how the retry machinery treats the
//! failure. The remaining types ([`ConnectError`], [`ListenError`],
//! [`StreamError`]) cover narrower lifecycles and convert into `RpcError`
//! at the call boundary.

use std::str::FromStr;

/// Status codes carried by [`RpcError`].
///
/// Numbering and wire names follow the gRPC status code registry so a
/// transport can put them on the wire unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// The snake_case wire name of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "ok",
            Code::Cancelled => "cancelled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::ResourceExhausted => "resource_exhausted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out_of_range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data_loss",
            Code::Unauthenticated => "unauthenticated",
        }
    }

    /// Whether a failure with this code may be transient.
    ///
    /// Only [`Unavailable`](Code::Unavailable),
    /// [`ResourceExhausted`](Code::ResourceExhausted) and
    /// [`Aborted`](Code::Aborted) qualify. A retryable code is necessary but
    /// not sufficient for a retry: the per-method
    /// [`RetryPolicy`](crate::RetryPolicy) and the transport's
    /// [`RetryThrottle`](crate::RetryThrottle) still have to agree.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Code::Unavailable | Code::ResourceExhausted | Code::Aborted
        )
    }
}

/// Error returned when parsing a [`Code`] from a string fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseCodeError(());

impl std::fmt::Display for ParseCodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown status code")
    }
}

impl std::error::Error for ParseCodeError {}

impl FromStr for Code {
    type Err = ParseCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Code::Ok),
            "cancelled" | "canceled" => Ok(Code::Cancelled),
            "unknown" => Ok(Code::Unknown),
            "invalid_argument" => Ok(Code::InvalidArgument),
            "deadline_exceeded" => Ok(Code::DeadlineExceeded),
            "not_found" => Ok(Code::NotFound),
            "already_exists" => Ok(Code::AlreadyExists),
            "permission_denied" => Ok(Code::PermissionDenied),
            "resource_exhausted" => Ok(Code::ResourceExhausted),
            "failed_precondition" => Ok(Code::FailedPrecondition),
            "aborted" => Ok(Code::Aborted),
            "out_of_range" => Ok(Code::OutOfRange),
            "unimplemented" => Ok(Code::Unimplemented),
            "internal" => Ok(Code::Internal),
            "unavailable" => Ok(Code::Unavailable),
            "data_loss" => Ok(Code::DataLoss),
            "unauthenticated" => Ok(Code::Unauthenticated),
            _ => Err(ParseCodeError(())),
        }
    }
}

/// An RPC error tagged with a status code.
///
/// This is the one error type the original caller of a call observes: every
/// call yields either a complete response or exactly one `RpcError`.
/// Interceptors may translate or wrap these, but cancellation
/// ([`Code::Cancelled`]) must never be swallowed.
///
/// # Example
///
/// ```
/// use trellis_core::{Code, RpcError};
///
/// let err = RpcError::unavailable("service overloaded");
/// assert_eq!(err.code(), Code::Unavailable);
/// assert!(err.is_retryable());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    code: Code,
    message: Option<String>,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code.as_str())?;
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Create a new error with a code and message.
    pub fn new<S: Into<String>>(code: Code, message: S) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Create a new error with just a code.
    pub fn from_code(code: Code) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Get the status code.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the error message.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns whether this error indicates a transient condition that may be
    /// resolved by retrying.
    ///
    /// This is a convenience wrapper for [`Code::is_retryable()`].
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Returns whether this error was caused by cancellation of the call
    /// scope. Cancellation always takes precedence over in-flight results and
    /// is never retried.
    pub fn is_cancellation(&self) -> bool {
        self.code == Code::Cancelled
    }

    // Convenience constructors

    /// Create a cancelled error.
    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Cancelled, message)
    }

    /// Create an unknown error.
    pub fn unknown<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unknown, message)
    }

    /// Create an invalid argument error.
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// Create a deadline exceeded error.
    pub fn deadline_exceeded<S: Into<String>>(message: S) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    /// Create a not found error.
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(Code::NotFound, message)
    }

    /// Create a permission denied error.
    pub fn permission_denied<S: Into<String>>(message: S) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    /// Create a resource exhausted error.
    pub fn resource_exhausted<S: Into<String>>(message: S) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    /// Create a failed precondition error.
    pub fn failed_precondition<S: Into<String>>(message: S) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    /// Create an aborted error.
    pub fn aborted<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Aborted, message)
    }

    /// Create an unimplemented error.
    pub fn unimplemented<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Internal, message)
    }

    /// Create an unavailable error.
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unavailable, message)
    }

    /// Create an unauthenticated error.
    pub fn unauthenticated<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unauthenticated, message)
    }
}

/// Transport establishment errors.
///
/// Fatal to the current attempt; a higher layer may retry the call.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConnectError {
    /// The remote peer could not be reached.
    #[error("transport unreachable: {0}")]
    Unreachable(String),

    /// The connection was established but the handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The transport has begun shutting down and accepts no new connections.
    #[error("transport is shutting down")]
    ShuttingDown,
}

impl From<ConnectError> for RpcError {
    fn from(err: ConnectError) -> Self {
        RpcError::unavailable(err.to_string())
    }
}

/// Server accept-loop errors.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ListenError {
    /// `listen` was called while another listener is already running.
    #[error("transport is already listening")]
    AlreadyListening,

    /// Accepting inbound streams failed.
    #[error("failed to accept inbound stream: {0}")]
    Accept(String),
}

/// Stream operation errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Write after close. This is a programming error and is never retried.
    #[error("stream is closed")]
    Closed,

    /// The owning call scope was cancelled while the operation was suspended.
    #[error("call scope cancelled")]
    Cancelled,
}

impl From<StreamError> for RpcError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Closed => RpcError::internal("write to closed stream"),
            StreamError::Cancelled => RpcError::cancelled("call scope cancelled"),
        }
    }
}
