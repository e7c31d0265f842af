//! Contains the `Error` and `Result` types that `hawser` uses.

use std::sync::Arc;

use thiserror::Error;

/// The result type for all methods that can return an error in the `hawser` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `hawser` crate. The inner [`ErrorKind`] is boxed to keep the
/// type small, and errors are cheaply cloneable so that a single failure can be fanned out to
/// every caller it affects.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
}

impl Error {
    pub(crate) fn invalid_options(message: impl Into<String>) -> Error {
        ErrorKind::InvalidOptions {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn pool_too_busy(max_wait_queue_size: i32) -> Error {
        ErrorKind::PoolTooBusy {
            max_wait_queue_size,
        }
        .into()
    }

    pub(crate) fn pool_closed(message: impl Into<String>) -> Error {
        ErrorKind::PoolClosed {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn decode(message: impl Into<String>) -> Error {
        ErrorKind::Decode {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    /// Construct a generic network timeout error.
    pub(crate) fn network_timeout() -> Error {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into()
    }

    /// Whether this error is a wait-queue saturation rejection.
    pub fn is_pool_too_busy(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::PoolTooBusy { .. })
    }

    /// Whether this error was caused by the pool shutting down.
    pub fn is_pool_closed(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::PoolClosed { .. })
    }

    /// Whether this error is a response body decode failure.
    pub fn is_decode(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Decode { .. })
    }

    /// Whether this error is a network timeout.
    pub fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::TimedOut)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(err)).into()
    }
}

/// The types of errors that can occur.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The pool was configured with an invalid combination of options.
    #[error("Invalid pool configuration: {message}")]
    #[non_exhaustive]
    InvalidOptions {
        /// A description of what made the configuration invalid.
        message: String,
    },

    /// The wait queue for a destination is at its configured bound.
    #[error("Connection pool reached max wait queue size of {max_wait_queue_size}")]
    #[non_exhaustive]
    PoolTooBusy {
        /// The configured wait-queue bound that was hit.
        max_wait_queue_size: i32,
    },

    /// Wrapper around [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// An error occurred during address resolution.
    #[error("An error occurred during address resolution: {message}")]
    #[non_exhaustive]
    DnsResolve {
        /// A description of the resolution failure.
        message: String,
    },

    /// The pool was closed before the request could complete.
    #[error("{message}")]
    #[non_exhaustive]
    PoolClosed {
        /// A description of the shutdown condition.
        message: String,
    },

    /// A response body could not be decoded.
    #[error("Failed to decode response body: {message}")]
    #[non_exhaustive]
    Decode {
        /// A description of the decode failure.
        message: String,
    },

    /// An internal fault; these indicate a bug in the crate.
    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal {
        /// A description of the fault.
        message: String,
    },
}
