//! Error types for keyflux.

use alloc::string::String;
use core::fmt;

/// Result type alias for keyflux operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error types for cache and pipeline operations.
///
/// Errors are cloned when a terminal error is multicast to several
/// subscribers, so every variant owns its data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Invalid configuration detected while building a pipeline stage.
    InvalidArgument {
        message: String,
    },
    /// A user callback failed inside an operator. Terminal for the stream.
    Operator {
        operator: &'static str,
        message: String,
    },
    /// An error pushed into a stream by its producer.
    Source {
        message: String,
    },
    /// A cached item failed to release its resources.
    Disposal {
        message: String,
    },
    /// The cache has already been disposed.
    Disposed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument { message } => {
                write!(f, "Invalid argument: {}", message)
            }
            Error::Operator { operator, message } => {
                write!(f, "Operator {} failed: {}", operator, message)
            }
            Error::Source { message } => {
                write!(f, "Source error: {}", message)
            }
            Error::Disposal { message } => {
                write!(f, "Disposal failed: {}", message)
            }
            Error::Disposed => {
                write!(f, "Cache has been disposed")
            }
        }
    }
}

impl Error {
    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an operator failure error.
    pub fn operator(operator: &'static str, message: impl Into<String>) -> Self {
        Error::Operator {
            operator,
            message: message.into(),
        }
    }

    /// Creates a source error.
    pub fn source(message: impl Into<String>) -> Self {
        Error::Source {
            message: message.into(),
        }
    }

    /// Creates a disposal error.
    pub fn disposal(message: impl Into<String>) -> Self {
        Error::Disposal {
            message: message.into(),
        }
    }

    /// Returns true for errors raised while building a pipeline.
    #[inline]
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument { .. })
    }
}
