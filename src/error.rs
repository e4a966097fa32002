//! GPU error types.

use std::fmt;

/// Errors that can occur in the GPU layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// Failed to initialize the device or instance.
    InitializationFailed(String),
    /// Failed to create a driver resource.
    ResourceCreationFailed(String),
    /// No compatible device memory type had room for an allocation.
    OutOfMemory,
    /// The GPU device was lost.
    DeviceLost,
    /// Submitting or polling GPU work failed.
    SubmissionFailed(String),
    /// An internal error occurred.
    Internal(String),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitializationFailed(msg) => write!(f, "initialization failed: {msg}"),
            Self::ResourceCreationFailed(msg) => write!(f, "resource creation failed: {msg}"),
            Self::OutOfMemory => write!(f, "out of GPU memory"),
            Self::DeviceLost => write!(f, "GPU device lost"),
            Self::SubmissionFailed(msg) => write!(f, "submission failed: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GpuError {}
