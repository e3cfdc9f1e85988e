//! Error types for the capture-to-stream pipeline.

use std::fmt;

/// Error type for screencast operations.
#[derive(Debug, Clone, PartialEq)]
pub enum CastError {
    /// A buffer could not be allocated with the requested format or modifier
    AllocationFailed(String),
    /// Shared memory or descriptors ran out
    ResourceExhausted(String),
    /// The compositor refused a buffer import
    ImportFailed(String),
    /// The compositor failed a capture request
    CaptureFailed(String),
    /// The streaming transport went away
    StreamDisconnected(String),
    /// Invalid parameters from a collaborator
    InvalidParameters(String),
    /// A required protocol or device is missing
    Unsupported(String),
    /// Wayland connection error
    Wayland(String),
}

impl CastError {
    /// Whether the failure is absorbed by falling back to another transport.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CastError::AllocationFailed(_) | CastError::ImportFailed(_))
    }
}

impl fmt::Display for CastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CastError::AllocationFailed(msg) => write!(f, "Buffer allocation failed: {}", msg),
            CastError::ResourceExhausted(msg) => write!(f, "Resources exhausted: {}", msg),
            CastError::ImportFailed(msg) => write!(f, "Buffer import failed: {}", msg),
            CastError::CaptureFailed(msg) => write!(f, "Capture failed: {}", msg),
            CastError::StreamDisconnected(msg) => write!(f, "Stream disconnected: {}", msg),
            CastError::InvalidParameters(msg) => write!(f, "Invalid parameters: {}", msg),
            CastError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
            CastError::Wayland(msg) => write!(f, "Wayland error: {}", msg),
        }
    }
}

impl std::error::Error for CastError {}

impl From<CastError> for String {
    fn from(err: CastError) -> Self {
        err.to_string()
    }
}
