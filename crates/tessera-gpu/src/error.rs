//! GPU error types.

use ash::vk;
use tessera_core::PoolError;
use thiserror::Error;

use crate::usage::ImageUsageState;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader module creation failed.
    #[error("Shader creation failed: {0}")]
    ShaderCreation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// A handle did not refer to a live resource.
    #[error(transparent)]
    InvalidHandle(#[from] PoolError),

    /// No barrier exists for this pair of image usages.
    #[error("Unsupported image usage transition: {from:?} -> {to:?}")]
    UnsupportedTransition {
        from: ImageUsageState,
        to: ImageUsageState,
    },

    /// A command recorder operation was issued in the wrong state.
    #[error("Cannot {operation} while command recorder is {state}")]
    InvalidRecorderState {
        operation: &'static str,
        state: &'static str,
    },

    /// A descriptor binding does not match its layout.
    #[error("Invalid descriptor binding: {0}")]
    InvalidBinding(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
