//! Error types for cacheio
//!
//! Every fallible operation in the workspace returns [`Result`]. Partial I/O is
//! reported separately through the context's completed byte count, so an error
//! here never implies that zero bytes moved.

use thiserror::Error;

/// Common result type for cacheio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for cacheio
#[derive(Debug, Error)]
pub enum Error {
    // Resource errors
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    // Range and logical errors
    #[error("end of file")]
    EndOfFile,

    #[error("out of bounds: offset {offset} is beyond device size {size}")]
    OutOfBounds { offset: u64, size: u64 },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("operation cancelled")]
    Cancelled,

    // Device and transport errors
    #[error("device not connected")]
    DeviceNotConnected,

    #[error("device error: {0}")]
    Device(String),

    #[error("device I/O error: {0}")]
    DeviceIo(#[from] std::io::Error),

    #[error("request timeout")]
    Timeout,

    #[error("try again")]
    TryAgain,

    #[error("not supported: {0}")]
    NotSupported(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a device error
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Create an invalid parameter error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Create an insufficient resources error
    pub fn resources(msg: impl Into<String>) -> Self {
        Self::InsufficientResources(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::TryAgain | Self::InsufficientResources(_)
        )
    }

    /// Teardown treats a vanished device as a successful close or delete.
    #[must_use]
    pub const fn is_teardown_success(&self) -> bool {
        matches!(self, Self::DeviceNotConnected)
    }

    /// Check if this error is a range or logical error
    #[must_use]
    pub const fn is_range_error(&self) -> bool {
        matches!(
            self,
            Self::EndOfFile | Self::OutOfBounds { .. } | Self::InvalidParameter(_)
        )
    }

    /// Make a best-effort copy of this error.
    ///
    /// I/O errors lose their source and keep their kind and message.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        match self {
            Self::InsufficientResources(m) => Self::InsufficientResources(m.clone()),
            Self::EndOfFile => Self::EndOfFile,
            Self::OutOfBounds { offset, size } => Self::OutOfBounds {
                offset: *offset,
                size: *size,
            },
            Self::InvalidParameter(m) => Self::InvalidParameter(m.clone()),
            Self::Cancelled => Self::Cancelled,
            Self::DeviceNotConnected => Self::DeviceNotConnected,
            Self::Device(m) => Self::Device(m.clone()),
            Self::DeviceIo(e) => Self::DeviceIo(std::io::Error::new(e.kind(), e.to_string())),
            Self::Timeout => Self::Timeout,
            Self::TryAgain => Self::TryAgain,
            Self::NotSupported(m) => Self::NotSupported(m.clone()),
            Self::Configuration(m) => Self::Configuration(m.clone()),
            Self::Internal(m) => Self::Internal(m.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::OutOfBounds {
            offset: 8192,
            size: 4096,
        };
        assert_eq!(
            err.to_string(),
            "out of bounds: offset 8192 is beyond device size 4096"
        );
        assert_eq!(Error::EndOfFile.to_string(), "end of file");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::resources("no pages").is_retryable());
        assert!(!Error::EndOfFile.is_retryable());

        assert!(Error::DeviceNotConnected.is_teardown_success());
        assert!(!Error::device("close failed").is_teardown_success());

        assert!(Error::EndOfFile.is_range_error());
        assert!(Error::invalid("overflow").is_range_error());
        assert!(!Error::Cancelled.is_range_error());
    }

    #[test]
    fn test_error_duplicate() {
        let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let copy = io.duplicate();
        assert!(matches!(copy, Error::DeviceIo(ref e) if e.kind() == std::io::ErrorKind::Other));
        assert!(matches!(Error::Cancelled.duplicate(), Error::Cancelled));
    }
}
