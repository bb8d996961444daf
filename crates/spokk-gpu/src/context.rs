//! Device context: the device plus its allocator policy.

use crate::allocator::{DedicatedAllocator, DeviceAllocator};
use crate::device::{GpuDevice, QueueInfo};
use crate::error::{GpuError, Result};
use crate::memory::{AllocationRequest, AllocationScope, DeviceMemoryAllocation};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// A device and the allocator every resource in this crate draws from.
pub struct DeviceContext {
    // Dropped before `device`: some policies hold device function tables.
    allocator: Mutex<Box<dyn DeviceAllocator>>,
    device: Arc<dyn GpuDevice>,
}

impl DeviceContext {
    /// Create a context with an explicit allocator policy.
    pub fn new(device: Arc<dyn GpuDevice>, allocator: Box<dyn DeviceAllocator>) -> Self {
        tracing::debug!(policy = allocator.name(), "Created device context");
        Self {
            allocator: Mutex::new(allocator),
            device,
        }
    }

    /// Create a context with one memory object per resource.
    pub fn with_default_allocator(device: Arc<dyn GpuDevice>) -> Self {
        Self::new(device, Box::new(DedicatedAllocator))
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    /// Name of the active allocator policy.
    pub fn allocator_name(&self) -> &'static str {
        self.allocator.lock().name()
    }

    /// Run `f` with exclusive access to the allocator, e.g. to call
    /// policy-specific operations.
    pub fn with_allocator<R>(&self, f: impl FnOnce(&mut dyn DeviceAllocator) -> R) -> R {
        let mut allocator = self.allocator.lock();
        f(allocator.as_mut())
    }

    /// First memory type allowed by `type_bits` whose flags include `required`.
    pub fn find_memory_type_index(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        self.device
            .memory_types()
            .find_memory_type_index(type_bits, required)
    }

    pub fn memory_type_properties(&self, memory_type_index: u32) -> vk::MemoryPropertyFlags {
        self.device.memory_types().properties(memory_type_index)
    }

    /// Allocate device memory through the active policy.
    pub fn device_alloc(&self, request: &AllocationRequest) -> Result<DeviceMemoryAllocation> {
        let allocation = self.allocator.lock().allocate(&self.device, request);
        if let Err(e) = &allocation {
            tracing::debug!(
                size = request.requirements.size,
                properties = ?request.properties,
                "Device allocation failed: {e}"
            );
        }
        allocation
    }

    /// Return an allocation to the policy that produced it.
    pub fn device_free(&self, allocation: DeviceMemoryAllocation) -> Result<()> {
        self.allocator.lock().free(&self.device, allocation)
    }

    /// Allocate memory for `buffer` and bind it.
    ///
    /// If binding fails the memory is released before the error is returned.
    pub fn device_alloc_and_bind_to_buffer(
        &self,
        buffer: vk::Buffer,
        properties: vk::MemoryPropertyFlags,
        scope: AllocationScope,
    ) -> Result<DeviceMemoryAllocation> {
        if buffer == vk::Buffer::null() {
            return Err(GpuError::NullResource("buffer"));
        }
        let requirements = self.device.buffer_memory_requirements(buffer);
        let request = AllocationRequest::new(requirements, properties)
            .with_scope(scope)
            .with_linear(true);
        let allocation = self.device_alloc(&request)?;
        match self
            .device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        {
            Ok(()) => Ok(allocation),
            Err(e) => {
                self.release_after_failed_bind(allocation);
                Err(e.into())
            }
        }
    }

    /// Allocate memory for `image` and bind it.
    ///
    /// `linear` must match the image's tiling. If binding fails the memory is
    /// released before the error is returned.
    pub fn device_alloc_and_bind_to_image(
        &self,
        image: vk::Image,
        properties: vk::MemoryPropertyFlags,
        scope: AllocationScope,
        linear: bool,
    ) -> Result<DeviceMemoryAllocation> {
        if image == vk::Image::null() {
            return Err(GpuError::NullResource("image"));
        }
        let requirements = self.device.image_memory_requirements(image);
        let request = AllocationRequest::new(requirements, properties)
            .with_scope(scope)
            .with_linear(linear);
        let allocation = self.device_alloc(&request)?;
        match self
            .device
            .bind_image_memory(image, allocation.memory(), allocation.offset())
        {
            Ok(()) => Ok(allocation),
            Err(e) => {
                self.release_after_failed_bind(allocation);
                Err(e.into())
            }
        }
    }

    fn release_after_failed_bind(&self, allocation: DeviceMemoryAllocation) {
        if let Err(e) = self.device_free(allocation) {
            tracing::warn!("Failed to release memory after bind failure: {e}");
        }
    }

    /// Find a queue with the requested capabilities (exact match preferred).
    pub fn find_queue(&self, flags: vk::QueueFlags) -> Option<QueueInfo> {
        self.device.find_queue(flags)
    }

    /// A queue that can execute transfer commands.
    ///
    /// Graphics and compute queues implicitly support transfers even when
    /// their family does not advertise it.
    pub fn transfer_queue(&self) -> Option<QueueInfo> {
        self.find_queue(vk::QueueFlags::TRANSFER)
            .or_else(|| self.find_queue(vk::QueueFlags::GRAPHICS))
            .or_else(|| self.find_queue(vk::QueueFlags::COMPUTE))
    }

    /// Wait for the device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{PoolingAllocator, PoolingAllocatorConfig};
    use crate::testing::{Call, FailPoint, FakeDevice};

    fn context() -> (Arc<FakeDevice>, DeviceContext) {
        let fake = Arc::new(FakeDevice::new());
        let ctx = DeviceContext::with_default_allocator(fake.clone());
        (fake, ctx)
    }

    fn buffer_info(size: u64) -> vk::BufferCreateInfo<'static> {
        vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::UNIFORM_BUFFER)
    }

    #[test]
    fn memory_type_queries_forward_to_device() {
        let (_fake, ctx) = context();
        assert_eq!(
            ctx.find_memory_type_index(u32::MAX, vk::MemoryPropertyFlags::HOST_CACHED),
            Some(3)
        );
        assert!(ctx
            .memory_type_properties(0)
            .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL));
        assert_eq!(ctx.allocator_name(), "dedicated");
    }

    #[test]
    fn alloc_and_bind_binds_at_allocation_offset() {
        let (fake, ctx) = context();
        let buffer = ctx.device().create_buffer(&buffer_info(1000)).unwrap();
        let allocation = ctx
            .device_alloc_and_bind_to_buffer(
                buffer,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                AllocationScope::Device,
            )
            .unwrap();
        assert!(fake.calls().contains(&Call::BindBufferMemory {
            buffer,
            memory: allocation.memory(),
            offset: 0,
        }));
        // Requirements are rounded up to the fake's 256-byte alignment.
        assert_eq!(allocation.size(), 1024);

        ctx.device_free(allocation).unwrap();
        ctx.device().destroy_buffer(buffer);
        assert!(fake.violations().is_empty());
    }

    #[test]
    fn bind_failure_releases_memory() {
        let (fake, ctx) = context();
        let buffer = ctx.device().create_buffer(&buffer_info(64)).unwrap();
        fake.inject_failure(FailPoint::BindBufferMemory);
        let result = ctx.device_alloc_and_bind_to_buffer(
            buffer,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            AllocationScope::Device,
        );
        assert!(matches!(
            result,
            Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
        ));
        assert_eq!(fake.live_memory_count(), 0);
        ctx.device().destroy_buffer(buffer);
    }

    #[test]
    fn image_bind_failure_releases_memory() {
        let (fake, ctx) = context();
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width: 16,
                height: 16,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1);
        let image = ctx.device().create_image(&info).unwrap();
        fake.inject_failure(FailPoint::BindImageMemory);
        assert!(ctx
            .device_alloc_and_bind_to_image(
                image,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                AllocationScope::Device,
                false,
            )
            .is_err());
        assert_eq!(fake.live_memory_count(), 0);
        ctx.device().destroy_image(image);
    }

    #[test]
    fn null_buffers_are_rejected() {
        let (_fake, ctx) = context();
        let result = ctx.device_alloc_and_bind_to_buffer(
            vk::Buffer::null(),
            vk::MemoryPropertyFlags::empty(),
            AllocationScope::Device,
        );
        assert!(matches!(result, Err(GpuError::NullResource("buffer"))));
    }

    #[test]
    fn transfer_queue_prefers_dedicated_family() {
        let (_fake, ctx) = context();
        assert_eq!(ctx.transfer_queue().map(|q| q.family), Some(1));
        assert_eq!(
            ctx.find_queue(vk::QueueFlags::GRAPHICS).map(|q| q.family),
            Some(0)
        );
    }

    #[test]
    fn policy_specific_operations_via_with_allocator() {
        let fake = Arc::new(FakeDevice::new());
        let ctx = DeviceContext::new(
            fake.clone(),
            Box::new(PoolingAllocator::new(PoolingAllocatorConfig {
                block_size: 1 << 16,
                ..Default::default()
            })),
        );
        let request = AllocationRequest::new(
            vk::MemoryRequirements {
                size: 512,
                alignment: 256,
                memory_type_bits: u32::MAX,
            },
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )
        .with_scope(AllocationScope::Frame);
        let a = ctx.device_alloc(&request).unwrap();
        let b = ctx.device_alloc(&request).unwrap();
        assert_eq!(a.memory(), b.memory());
        assert_eq!(b.offset(), 512);
        assert_eq!(ctx.allocator_name(), "pooling");

        // The frame is over: recycle its memory wholesale.
        drop((a, b));
        ctx.with_allocator(|allocator| allocator.reset_frame_scope());

        let c = ctx.device_alloc(&request).unwrap();
        assert_eq!(c.offset(), 0);
        assert_eq!(fake.live_memory_count(), 1);
        ctx.device_free(c).unwrap();
    }
}
