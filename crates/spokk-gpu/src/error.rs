//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// No memory type satisfies both the requirement bits and the property mask.
    #[error("No memory type matches type bits {type_bits:#b} with properties {properties:?}")]
    NoMatchingMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// An allocation was used in a way its allocator does not permit.
    #[error("Invalid allocation: {0}")]
    InvalidAllocation(String),

    /// Operation on a resource that was never created or already destroyed.
    #[error("Null resource: {0}")]
    NullResource(&'static str),

    /// A device-local upload could not be expressed as an in-command-buffer update.
    #[error("Unsupported transfer: {0}")]
    UnsupportedTransfer(String),

    /// A fence wait ran past its timeout.
    #[error("Device lost (fence wait timed out)")]
    DeviceLost,

    /// The swapchain no longer matches the surface and must be recreated.
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
