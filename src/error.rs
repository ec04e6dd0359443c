//! Error types for vloop
//!
//! Provides a unified error type for all operations, plus a coarse
//! classification (`ErrorKind`) and an errno mapping for adapters that
//! speak POSIX.

use thiserror::Error;

/// Result type alias using LoopError
pub type Result<T> = std::result::Result<T, LoopError>;

/// Unified error type for vloop operations
#[derive(Debug, Error)]
pub enum LoopError {
    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Device is not configured")]
    NotConfigured,

    #[error("Device is already configured")]
    AlreadyConfigured,

    #[error("Device is busy")]
    Busy,

    // -------------------------------------------------------------------------
    // Validation Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Device still has dirty residue, retry the request")]
    Retryable,

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Write to read-only device")]
    ReadOnly,

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    // -------------------------------------------------------------------------
    // Registry Errors
    // -------------------------------------------------------------------------
    #[error("No such device: {0}")]
    NoSuchDevice(u32),

    #[error("Device {0} already exists")]
    DeviceExists(u32),
}

/// Coarse classification of a [`LoopError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotConfigured,
    Busy,
    InvalidArgument,
    PermissionDenied,
    Retryable,
    IoFailure,
    NotSupported,
    NotFound,
}

impl LoopError {
    /// Shorthand for `LoopError::InvalidArgument`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConfigured => ErrorKind::NotConfigured,
            Self::AlreadyConfigured | Self::Busy | Self::DeviceExists(_) => ErrorKind::Busy,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::Retryable => ErrorKind::Retryable,
            Self::Io(_) | Self::ReadOnly => ErrorKind::IoFailure,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::NoSuchDevice(_) => ErrorKind::NotFound,
        }
    }

    /// Returns true if the caller should simply retry the request.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Retryable)
    }

    /// Convert to a negative errno value.
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::NotConfigured => -libc::ENXIO,
            Self::AlreadyConfigured | Self::Busy => -libc::EBUSY,
            Self::InvalidArgument(_) => -libc::EINVAL,
            Self::PermissionDenied => -libc::EPERM,
            Self::Retryable => -libc::EAGAIN,
            Self::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            Self::ReadOnly => -libc::EIO,
            Self::NotSupported(_) => -libc::EOPNOTSUPP,
            Self::NoSuchDevice(_) => -libc::ENODEV,
            Self::DeviceExists(_) => -libc::EEXIST,
        }
    }

    /// Collapse an I/O-path error to what a command completion may report:
    /// "not supported" survives, everything else becomes a generic I/O failure.
    pub(crate) fn into_completion_error(self) -> Self {
        match self {
            Self::NotSupported(_) | Self::NotConfigured | Self::InvalidArgument(_) => self,
            Self::Io(e) if e.kind() == std::io::ErrorKind::Unsupported => {
                Self::NotSupported(e.to_string())
            }
            Self::Io(e) => Self::Io(e),
            other => Self::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                other.to_string(),
            )),
        }
    }
}
