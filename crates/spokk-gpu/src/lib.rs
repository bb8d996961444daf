//! Vulkan device memory and frame pipelining for the spokk framework.
//!
//! This crate provides:
//! - A capability provider trait ([`GpuDevice`]) with an ash backend
//! - Device memory blocks, allocations, and pluggable allocator policies
//! - Buffers and images with all-or-nothing creation
//! - Blocking one-shot command submission
//! - A pipelined frame multiplexer for frames in flight, with per-slot
//!   descriptor sets
//! - Surface and swapchain handling

pub mod allocator;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod frame;
pub mod instance;
pub mod memory;
pub mod resource;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use allocator::{
    DedicatedAllocator, DeviceAllocator, ManagedAllocator, PoolStats, PoolingAllocator,
    PoolingAllocatorConfig,
};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{CommandPool, OneShotCommandPool};
pub use context::DeviceContext;
pub use descriptors::{DescriptorPool, DescriptorSetLayoutBuilder};
pub use device::{GpuDevice, MemoryTypeTable, QueueInfo, SubmitBatch};
pub use error::{GpuError, Result};
pub use frame::{
    ActiveFrame, FrameConfig, FramePipeline, FrameRing, FrameSlot, PipelinedBuffer, PresentStatus,
    FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT,
};
pub use memory::{
    AllocationOrigin, AllocationRequest, AllocationScope, DeviceMemoryAllocation,
    DeviceMemoryBlock,
};
pub use resource::{Buffer, Image};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{Swapchain, SwapchainConfig};
pub use vulkan::{AllocatorPolicy, DeviceBuilder, VulkanDevice};
