//! Capability provider boundary.
//!
//! Everything the memory, resource, and frame subsystems need from the
//! graphics API goes through [`GpuDevice`]. [`crate::vulkan::VulkanDevice`]
//! implements it on top of ash; tests use the in-memory fake from
//! [`crate::testing`].
//!
//! Handles passed into a `GpuDevice` must have been created by that same
//! device and must not be in use by the GPU when they are destroyed.

use ash::prelude::VkResult;
use ash::vk;
use std::ptr::NonNull;

/// Memory type properties of a physical device.
#[derive(Debug, Clone, Default)]
pub struct MemoryTypeTable {
    types: Vec<vk::MemoryType>,
}

impl MemoryTypeTable {
    /// Build the table from queried physical device properties.
    pub fn from_properties(properties: &vk::PhysicalDeviceMemoryProperties) -> Self {
        let count = (properties.memory_type_count as usize).min(vk::MAX_MEMORY_TYPES);
        Self {
            types: properties.memory_types[..count].to_vec(),
        }
    }

    /// Build a table from property flags alone, one entry per memory type.
    pub fn from_flags(flags: impl IntoIterator<Item = vk::MemoryPropertyFlags>) -> Self {
        let types = flags
            .into_iter()
            .take(vk::MAX_MEMORY_TYPES)
            .map(|property_flags| vk::MemoryType {
                property_flags,
                heap_index: 0,
            })
            .collect();
        Self { types }
    }

    /// Number of memory types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Property flags of a memory type; empty for out-of-range indices.
    pub fn properties(&self, memory_type_index: u32) -> vk::MemoryPropertyFlags {
        self.types
            .get(memory_type_index as usize)
            .map_or_else(vk::MemoryPropertyFlags::empty, |t| t.property_flags)
    }

    /// Whether a memory type can be mapped into host address space.
    pub fn is_host_visible(&self, memory_type_index: u32) -> bool {
        self.properties(memory_type_index)
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Find the first memory type allowed by `type_bits` whose flags are a
    /// superset of `required`.
    ///
    /// Lowest index wins. A `type_bits` of zero never matches.
    pub fn find_memory_type_index(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        self.types
            .iter()
            .enumerate()
            .find(|(index, memory_type)| {
                type_bits & (1u32 << index) != 0 && memory_type.property_flags.contains(required)
            })
            .map(|(index, _)| index as u32)
    }

    /// Find the first allowed memory type whose flags equal `flags` exactly,
    /// falling back to the first superset match.
    pub fn find_exact_memory_type_index(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        self.types
            .iter()
            .enumerate()
            .find(|(index, memory_type)| {
                type_bits & (1u32 << index) != 0 && memory_type.property_flags == flags
            })
            .map(|(index, _)| index as u32)
            .or_else(|| self.find_memory_type_index(type_bits, flags))
    }
}

/// A device queue and the capabilities of its family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    pub queue: vk::Queue,
    pub family: u32,
    pub flags: vk::QueueFlags,
}

/// Find a queue with the requested capabilities.
///
/// An exact flag match is preferred; otherwise the first queue whose flags
/// are a superset of `flags` is returned.
pub fn find_queue(queues: &[QueueInfo], flags: vk::QueueFlags) -> Option<QueueInfo> {
    queues
        .iter()
        .find(|q| q.flags == flags)
        .or_else(|| queues.iter().find(|q| q.flags.contains(flags)))
        .copied()
}

/// One batch of command buffers handed to [`GpuDevice::queue_submit`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitBatch<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

impl<'a> SubmitBatch<'a> {
    /// A batch that only executes command buffers.
    pub fn commands(command_buffers: &'a [vk::CommandBuffer]) -> Self {
        Self {
            command_buffers,
            ..Default::default()
        }
    }
}

/// The operations the core needs from the graphics API.
pub trait GpuDevice: Send + Sync {
    /// Memory types exposed by the physical device.
    fn memory_types(&self) -> &MemoryTypeTable;

    /// Queues created with the logical device.
    fn queues(&self) -> &[QueueInfo];

    /// Find a queue with the requested capabilities.
    fn find_queue(&self, flags: vk::QueueFlags) -> Option<QueueInfo> {
        find_queue(self.queues(), flags)
    }

    // Device memory

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    /// Map the whole memory object.
    fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<NonNull<u8>>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    fn flush_mapped_range(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()>;
    fn invalidate_mapped_range(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()>;

    // Buffers

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;
    fn create_buffer_view(&self, info: &vk::BufferViewCreateInfo<'_>)
        -> VkResult<vk::BufferView>;
    fn destroy_buffer_view(&self, view: vk::BufferView);

    // Images

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;
    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    // Synchronization

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Returns `Err(vk::Result::TIMEOUT)` when the timeout expires first.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool>;
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Command buffers

    fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    /// Record an in-command-buffer update. `data` must be at most 65536 bytes
    /// and a multiple of 4; `offset` must be a multiple of 4.
    fn cmd_update_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    );

    /// Record an image memory barrier between two pipeline stages.
    fn cmd_image_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>,
    );
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    // Descriptors

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool>;
    /// Destroying a pool frees every set allocated from it.
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    /// Allocate one set per entry of `layouts`.
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>>;
    /// Point one buffer binding of a set at `range` bytes of `buffer`.
    fn write_buffer_descriptor(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    );

    // Queues and presentation

    fn queue_submit(
        &self,
        queue: vk::Queue,
        batch: &SubmitBatch<'_>,
        fence: vk::Fence,
    ) -> VkResult<()>;
    fn wait_idle(&self) -> VkResult<()>;
    /// Returns the acquired image index and whether the swapchain is suboptimal.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    /// Returns whether the swapchain is suboptimal.
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HOST_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;

    fn typical_table() -> MemoryTypeTable {
        MemoryTypeTable::from_flags([
            DEVICE_LOCAL,
            HOST_VISIBLE | HOST_COHERENT,
            DEVICE_LOCAL | HOST_VISIBLE | HOST_COHERENT,
            HOST_VISIBLE | HOST_COHERENT | vk::MemoryPropertyFlags::HOST_CACHED,
        ])
    }

    #[test]
    fn first_fit_picks_lowest_matching_index() {
        let table = typical_table();
        assert_eq!(table.find_memory_type_index(0b1111, DEVICE_LOCAL), Some(0));
        assert_eq!(table.find_memory_type_index(0b1111, HOST_VISIBLE), Some(1));
        assert_eq!(
            table.find_memory_type_index(0b1111, DEVICE_LOCAL | HOST_VISIBLE),
            Some(2)
        );
    }

    #[test]
    fn requirement_bits_restrict_candidates() {
        let table = typical_table();
        assert_eq!(table.find_memory_type_index(0b1100, HOST_VISIBLE), Some(2));
        assert_eq!(table.find_memory_type_index(0b0001, HOST_VISIBLE), None);
    }

    #[test]
    fn empty_type_bits_never_match() {
        let table = typical_table();
        assert_eq!(
            table.find_memory_type_index(0, vk::MemoryPropertyFlags::empty()),
            None
        );
        assert_eq!(table.find_memory_type_index(0, DEVICE_LOCAL), None);
    }

    #[test]
    fn selection_is_deterministic() {
        let table = typical_table();
        let first = table.find_memory_type_index(0b1110, HOST_COHERENT);
        for _ in 0..8 {
            assert_eq!(table.find_memory_type_index(0b1110, HOST_COHERENT), first);
        }
    }

    #[test]
    fn exact_match_is_preferred_over_superset() {
        let table = typical_table();
        assert_eq!(
            table.find_exact_memory_type_index(0b1111, HOST_VISIBLE | HOST_COHERENT),
            Some(1)
        );
        assert_eq!(
            table.find_exact_memory_type_index(0b1100, HOST_VISIBLE | HOST_COHERENT),
            Some(2)
        );
    }

    #[test]
    fn out_of_range_properties_are_empty() {
        let table = typical_table();
        assert!(table.properties(17).is_empty());
        assert!(!table.is_host_visible(0));
        assert!(table.is_host_visible(3));
    }

    #[test]
    fn queue_lookup_prefers_exact_match() {
        let graphics = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;
        let queues = [
            QueueInfo {
                queue: vk::Queue::null(),
                family: 0,
                flags: graphics,
            },
            QueueInfo {
                queue: vk::Queue::null(),
                family: 2,
                flags: vk::QueueFlags::TRANSFER,
            },
        ];
        assert_eq!(find_queue(&queues, vk::QueueFlags::TRANSFER).map(|q| q.family), Some(2));
        assert_eq!(find_queue(&queues, vk::QueueFlags::COMPUTE).map(|q| q.family), Some(0));
        assert_eq!(find_queue(&queues[1..], vk::QueueFlags::GRAPHICS), None);
    }
}
