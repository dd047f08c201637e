//! CSI error types.
//!
//! All errors in the `libcsi` crate are represented by the [`CsiError`] enum,
//! which derives [`thiserror::Error`] for ergonomic error handling and also
//! implements [`Serialize`]/[`Deserialize`] so errors can travel across the
//! QUIC transport layer.
//!
//! The orchestrator only needs to know whether to fix the request, retry the
//! call, or give up, so every variant maps onto one [`ErrorCode`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a [`CsiError`], mirroring the gRPC status codes
/// a CSI caller acts upon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The request is malformed; retrying it unchanged will fail again.
    InvalidArgument,
    /// A host primitive failed; the whole RPC may be retried.
    Internal,
    /// The operation is permanently unsupported by this plugin.
    Unimplemented,
    /// The transport could not deliver the request.
    Unavailable,
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The block device for a volume never became visible on this node.
    #[error("device for volume {volume_id} (serial {serial}) not found: {reason}")]
    DeviceNotFound {
        /// Volume whose device was looked up.
        volume_id: String,
        /// Truncated virtio serial used for the lookup.
        serial: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// Creating a filesystem failed.
    #[error("format of {device} as {fs_type} failed: {reason}")]
    FormatFailed {
        /// Device that was being formatted.
        device: String,
        /// Requested filesystem type.
        fs_type: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// Growing a filesystem failed.
    #[error("resize of {path} failed: {reason}")]
    ResizeFailed {
        /// Volume path (or device) being resized.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// A LUKS (`cryptsetup`) operation failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// The operation is not supported by this plugin.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CsiError::Encryption`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn encryption<E: std::fmt::Display>(e: E) -> Self {
        Self::Encryption(e.to_string())
    }

    /// Shorthand for [`CsiError::InvalidArgument`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Classify the error for the caller.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Unimplemented(_) => ErrorCode::Unimplemented,
            Self::TransportError(_) => ErrorCode::Unavailable,
            Self::DeviceNotFound { .. }
            | Self::FormatFailed { .. }
            | Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::ResizeFailed { .. }
            | Self::Encryption(_)
            | Self::Internal(_) => ErrorCode::Internal,
        }
    }
}
