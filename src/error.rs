//! Crate level errors.
//!
//! Every failure in the publish path is a value of [`Error`]. Errors are
//! `Clone` because a single failure is frequently fanned out to many callers:
//! a failed batch resolves every message inside it, a corked sink resolves
//! every queued request, and shutdown resolves every pending publish.
//!
//! # Taxonomy
//!
//! - Transient transport errors are retried below this crate and never seen here.
//! - Permanent publish errors ([`Error::Rpc`]) are propagated verbatim to the caller.
//! - Partition discovery errors are fatal only before any partition is known.
//! - [`Error::Shutdown`] is the terminal status installed by `shutdown()`.
//!
//! [`StatusCode`] classifies errors with the canonical RPC status codes so
//! transports can map their wire codes in and callers can branch on a code
//! instead of matching variants.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use std::result;
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Errors surfaced by the publish path.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum Error {
    /// A caller supplied a malformed value (e.g. an unparsable metadata string).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The publisher was shut down by the application.
    #[error("Publisher shut down")]
    Shutdown,

    /// The publisher stopped because of an unrecoverable failure.
    #[error("Aborted: {0}")]
    Aborted(String),

    /// The operation was abandoned before it produced a result.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The backend or executor is not available.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// The operation is not valid in the current state.
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A status returned by the remote service.
    #[error("RPC error ({code:?}): {message}")]
    Rpc { code: StatusCode, message: String },

    /// A broken internal invariant.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an error from a remote status.
    pub fn rpc(code: StatusCode, message: impl Into<String>) -> Self {
        Error::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Build an error from a raw wire status code.
    ///
    /// Codes outside the canonical range map to [`StatusCode::Unknown`].
    pub fn from_wire(code: i32, message: impl Into<String>) -> Self {
        let code = StatusCode::from_i32(code).unwrap_or(StatusCode::Unknown);
        Self::rpc(code, message)
    }

    /// Canonical status code for this error.
    pub fn code(&self) -> StatusCode {
        match self {
            Error::InvalidArgument(_) | Error::Config(_) => StatusCode::InvalidArgument,
            Error::Shutdown | Error::Aborted(_) => StatusCode::Aborted,
            Error::Cancelled(_) => StatusCode::Cancelled,
            Error::Unavailable(_) => StatusCode::Unavailable,
            Error::FailedPrecondition(_) => StatusCode::FailedPrecondition,
            Error::Rpc { code, .. } => *code,
            Error::Internal(_) => StatusCode::Internal,
        }
    }

    /// Returns true for the status installed by an application shutdown.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown)
    }
}

/// Canonical RPC status codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, Default)]
pub enum StatusCode {
    #[default]
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
