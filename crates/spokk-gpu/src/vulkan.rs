//! ash-backed [`GpuDevice`].

use crate::allocator::{
    DedicatedAllocator, DeviceAllocator, ManagedAllocator, PoolingAllocator,
    PoolingAllocatorConfig,
};
use crate::capabilities::GpuCapabilities;
use crate::device::{GpuDevice, MemoryTypeTable, QueueInfo, SubmitBatch};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use ash::prelude::VkResult;
use ash::vk;
use std::ffi::CStr;
use std::ptr::NonNull;

/// Vulkan instance, physical device, and logical device.
pub struct VulkanDevice {
    // Entry must be kept alive for the lifetime of the device
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    capabilities: GpuCapabilities,
    memory_types: MemoryTypeTable,
    queues: Vec<QueueInfo>,
    graphics_queue: QueueInfo,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
}

impl VulkanDevice {
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// The ash device, for recording commands the core does not wrap.
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// The queue used for rendering and presentation.
    pub fn graphics_queue(&self) -> QueueInfo {
        self.graphics_queue
    }

    /// Swapchain entry points; `None` for headless devices.
    pub fn swapchain_loader(&self) -> Option<&ash::khr::swapchain::Device> {
        self.swapchain_loader.as_ref()
    }

    fn swapchain_loader_or_err(&self) -> VkResult<&ash::khr::swapchain::Device> {
        self.swapchain_loader
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        // SAFETY: every object created from this device is owned by something
        // that holds an `Arc` to it, so nothing else is alive at this point.
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        tracing::debug!("Destroyed Vulkan device");
    }
}

// Every method forwards to ash. The handles passed in were created by this
// device, which is the contract of `GpuDevice`; that is the SAFETY argument
// for each `unsafe` block below.
impl GpuDevice for VulkanDevice {
    fn memory_types(&self) -> &MemoryTypeTable {
        &self.memory_types
    }

    fn queues(&self) -> &[QueueInfo] {
        &self.queues
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        // SAFETY: see impl comment.
        unsafe { self.device.allocate_memory(&info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: see impl comment.
        unsafe { self.device.free_memory(memory, None) }
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> VkResult<NonNull<u8>> {
        // SAFETY: see impl comment.
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
        };
        NonNull::new(ptr.cast::<u8>()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: see impl comment.
        unsafe { self.device.unmap_memory(memory) }
    }

    fn flush_mapped_range(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        let range = vk::MappedMemoryRange::default()
            .memory(memory)
            .offset(offset)
            .size(size);
        // SAFETY: see impl comment.
        unsafe { self.device.flush_mapped_memory_ranges(&[range]) }
    }

    fn invalidate_mapped_range(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        let range = vk::MappedMemoryRange::default()
            .memory(memory)
            .offset(offset)
            .size(size);
        // SAFETY: see impl comment.
        unsafe { self.device.invalidate_mapped_memory_ranges(&[range]) }
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
        // SAFETY: see impl comment.
        unsafe { self.device.create_buffer(info, None) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: see impl comment.
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        // SAFETY: see impl comment.
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        // SAFETY: see impl comment.
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
    }

    fn create_buffer_view(
        &self,
        info: &vk::BufferViewCreateInfo<'_>,
    ) -> VkResult<vk::BufferView> {
        // SAFETY: see impl comment.
        unsafe { self.device.create_buffer_view(info, None) }
    }

    fn destroy_buffer_view(&self, view: vk::BufferView) {
        // SAFETY: see impl comment.
        unsafe { self.device.destroy_buffer_view(view, None) }
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image> {
        // SAFETY: see impl comment.
        unsafe { self.device.create_image(info, None) }
    }

    fn destroy_image(&self, image: vk::Image) {
        // SAFETY: see impl comment.
        unsafe { self.device.destroy_image(image, None) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        // SAFETY: see impl comment.
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        // SAFETY: see impl comment.
        unsafe { self.device.bind_image_memory(image, memory, offset) }
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView> {
        // SAFETY: see impl comment.
        unsafe { self.device.create_image_view(info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        // SAFETY: see impl comment.
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: see impl comment.
        unsafe { self.device.create_fence(&info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        // SAFETY: see impl comment.
        unsafe { self.device.destroy_fence(fence, None) }
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        // SAFETY: see impl comment.
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        // SAFETY: see impl comment.
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        // SAFETY: see impl comment.
        unsafe { self.device.get_fence_status(fence) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        // SAFETY: see impl comment.
        unsafe { self.device.create_semaphore(&info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: see impl comment.
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);
        // SAFETY: see impl comment.
        unsafe { self.device.create_command_pool(&info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: see impl comment.
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);
        // SAFETY: see impl comment.
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        buffers
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        // SAFETY: see impl comment.
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        // SAFETY: see impl comment.
        unsafe { self.device.begin_command_buffer(command_buffer, &info) }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        // SAFETY: see impl comment.
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        // SAFETY: see impl comment.
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    fn cmd_update_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) {
        // SAFETY: see impl comment.
        unsafe {
            self.device
                .cmd_update_buffer(command_buffer, buffer, offset, data);
        }
    }

    fn cmd_image_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier<'_>,
    ) {
        // SAFETY: see impl comment.
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(barrier),
            );
        }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: see impl comment.
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(command_buffer, buffer, image, layout, regions);
        }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        // SAFETY: see impl comment.
        unsafe { self.device.create_descriptor_set_layout(&info, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        // SAFETY: see impl comment.
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        // SAFETY: see impl comment.
        unsafe { self.device.create_descriptor_pool(&info, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: see impl comment.
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        // SAFETY: see impl comment.
        unsafe { self.device.allocate_descriptor_sets(&info) }
    }

    fn write_buffer_descriptor(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        let buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(offset)
            .range(range);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(descriptor_type)
            .buffer_info(std::slice::from_ref(&buffer_info));
        // SAFETY: see impl comment.
        unsafe { self.device.update_descriptor_sets(&[write], &[]) }
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn queue_submit(
        &self,
        queue: vk::Queue,
        batch: &SubmitBatch<'_>,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(batch.wait_semaphores)
            .wait_dst_stage_mask(batch.wait_stages)
            .command_buffers(batch.command_buffers)
            .signal_semaphores(batch.signal_semaphores);
        // SAFETY: see impl comment.
        unsafe { self.device.queue_submit(queue, &[submit_info], fence) }
    }

    fn wait_idle(&self) -> VkResult<()> {
        // SAFETY: see impl comment.
        unsafe { self.device.device_wait_idle() }
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let loader = self.swapchain_loader_or_err()?;
        // SAFETY: see impl comment.
        unsafe { loader.acquire_next_image(swapchain, timeout_ns, semaphore, vk::Fence::null()) }
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let loader = self.swapchain_loader_or_err()?;
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        // SAFETY: see impl comment.
        unsafe { loader.queue_present(queue, &present_info) }
    }
}

/// Which allocator policy a [`crate::DeviceContext`] is built with.
#[derive(Debug, Clone, Copy, Default)]
pub enum AllocatorPolicy {
    /// One memory object per resource.
    #[default]
    Dedicated,
    /// Sub-allocation from large blocks.
    Pooling(PoolingAllocatorConfig),
    /// gpu-allocator.
    Managed,
}

impl AllocatorPolicy {
    /// Instantiate the policy for a device.
    pub fn create(self, device: &VulkanDevice) -> Result<Box<dyn DeviceAllocator>> {
        let allocator: Box<dyn DeviceAllocator> = match self {
            Self::Dedicated => Box::new(DedicatedAllocator),
            Self::Pooling(mut config) => {
                config.min_alignment = config
                    .min_alignment
                    .max(device.capabilities.non_coherent_atom_size)
                    .max(device.capabilities.buffer_image_granularity);
                Box::new(PoolingAllocator::new(config))
            }
            // SAFETY: the allocator is owned by a `DeviceContext` that also
            // holds the device, and is dropped before it.
            Self::Managed => Box::new(unsafe {
                ManagedAllocator::new(
                    &device.instance,
                    &device.device,
                    device.physical_device,
                    device.capabilities.non_coherent_atom_size,
                )?
            }),
        };
        tracing::info!(policy = allocator.name(), "Created device allocator");
        Ok(allocator)
    }
}

/// Builder for [`VulkanDevice`].
pub struct DeviceBuilder {
    app_name: String,
    enable_validation: bool,
    headless: bool,
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        Self {
            app_name: "spokk".to_string(),
            enable_validation: cfg!(debug_assertions),
            headless: false,
        }
    }
}

impl DeviceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Skip surface and swapchain support.
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Build the device.
    pub fn build(self) -> Result<VulkanDevice> {
        // SAFETY: loading the Vulkan library has no preconditions beyond the
        // library itself being well behaved.
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        // SAFETY: `entry` was just loaded.
        let instance = unsafe {
            create_instance(&entry, &self.app_name, self.enable_validation, self.headless)
        }?;

        // SAFETY: `instance` is valid; on any error below it is destroyed.
        match unsafe { self.finish(entry.clone(), &instance) } {
            Ok(device) => Ok(device),
            Err(e) => {
                // SAFETY: nothing created from `instance` survived.
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    unsafe fn finish(&self, entry: ash::Entry, instance: &ash::Instance) -> Result<VulkanDevice> {
        // SAFETY: forwarded from `build`.
        let physical_device = unsafe { select_physical_device(instance) }?;
        // SAFETY: as above.
        let capabilities = unsafe { GpuCapabilities::query(instance, physical_device) };
        if !capabilities.meets_requirements() {
            return Err(GpuError::NoSuitableDevice);
        }
        tracing::info!("Selected GPU: {}", capabilities.summary());

        // SAFETY: as above.
        let (memory_properties, families) = unsafe {
            (
                instance.get_physical_device_memory_properties(physical_device),
                instance.get_physical_device_queue_family_properties(physical_device),
            )
        };
        let memory_types = MemoryTypeTable::from_properties(&memory_properties);
        let selected = select_queue_families(&families).ok_or(GpuError::NoSuitableDevice)?;

        // SAFETY: as above.
        let device = unsafe { create_device(instance, physical_device, &selected, self.headless) }?;

        let queues: Vec<QueueInfo> = selected
            .iter()
            .map(|&family| QueueInfo {
                // SAFETY: queue 0 of every selected family was requested.
                queue: unsafe { device.get_device_queue(family, 0) },
                family,
                flags: families[family as usize].queue_flags,
            })
            .collect();
        let graphics_queue = queues[0];

        let swapchain_loader =
            (!self.headless).then(|| ash::khr::swapchain::Device::new(instance, &device));

        tracing::debug!(
            memory_types = memory_types.len(),
            queue_families = queues.len(),
            "Created logical device"
        );

        Ok(VulkanDevice {
            entry,
            instance: instance.clone(),
            physical_device,
            device,
            capabilities,
            memory_types,
            queues,
            graphics_queue,
            swapchain_loader,
        })
    }
}

/// Pick queue families: the first graphics family, then a dedicated compute
/// family and a dedicated transfer family if the device has them.
///
/// The graphics family is always first in the result.
fn select_queue_families(families: &[vk::QueueFamilyProperties]) -> Option<Vec<u32>> {
    let find = |want: vk::QueueFlags, exclude: vk::QueueFlags| {
        families
            .iter()
            .position(|f| f.queue_count > 0 && f.queue_flags.contains(want) && !f.queue_flags.intersects(exclude))
            .map(|i| i as u32)
    };

    let graphics = find(vk::QueueFlags::GRAPHICS, vk::QueueFlags::empty())?;
    let compute = find(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS);
    let transfer = find(
        vk::QueueFlags::TRANSFER,
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
    );

    let mut selected = vec![graphics];
    for family in [compute, transfer].into_iter().flatten() {
        if !selected.contains(&family) {
            selected.push(family);
        }
    }
    Some(selected)
}

/// Create the logical device with one queue per selected family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &[u32],
    headless: bool,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extensions: Vec<&CStr> = if headless {
        Vec::new()
    } else {
        vec![ash::khr::swapchain::NAME]
    };
    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();

    let features = vk::PhysicalDeviceFeatures::default();
    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    // SAFETY: forwarded from the caller; all pointers outlive the call.
    let device = unsafe { instance.create_device(physical_device, &device_create_info, None)? };
    Ok(device)
}
