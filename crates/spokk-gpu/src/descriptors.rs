//! Descriptor set management.

use crate::device::GpuDevice;
use crate::error::Result;
use ash::vk;
use std::sync::Arc;

/// Descriptor set layout builder.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    /// Add a combined image sampler binding.
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'a>] {
        &self.bindings
    }

    /// Pool sizes that fit `sets` sets of this layout, one entry per
    /// descriptor type.
    pub fn pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            let count = binding.descriptor_count * sets;
            match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
                Some(size) => size.descriptor_count += count,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty: binding.descriptor_type,
                    descriptor_count: count,
                }),
            }
        }
        sizes
    }

    /// Build the descriptor set layout.
    pub fn build(&self, device: &dyn GpuDevice) -> Result<vk::DescriptorSetLayout> {
        Ok(device.create_descriptor_set_layout(&self.bindings)?)
    }
}

/// Descriptor pool for allocating descriptor sets.
///
/// Sets are never freed individually; dropping the pool releases all of them.
pub struct DescriptorPool {
    device: Arc<dyn GpuDevice>,
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create a new descriptor pool.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let pool = device.create_descriptor_pool(max_sets, pool_sizes)?;
        Ok(Self { device, pool })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Allocate one descriptor set per layout.
    pub fn allocate(&self, layouts: &[vk::DescriptorSetLayout]) -> Result<Vec<vk::DescriptorSet>> {
        Ok(self.device.allocate_descriptor_sets(self.pool, layouts)?)
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.device.destroy_descriptor_pool(self.pool);
    }
}

/// Write a uniform buffer descriptor covering `range` bytes from `offset`.
pub fn write_uniform_buffer(
    device: &dyn GpuDevice,
    dst_set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
) {
    device.write_buffer_descriptor(
        dst_set,
        binding,
        vk::DescriptorType::UNIFORM_BUFFER,
        buffer,
        offset,
        range,
    );
}

/// Write a storage buffer descriptor covering `range` bytes from `offset`.
pub fn write_storage_buffer(
    device: &dyn GpuDevice,
    dst_set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
) {
    device.write_buffer_descriptor(
        dst_set,
        binding,
        vk::DescriptorType::STORAGE_BUFFER,
        buffer,
        offset,
        range,
    );
}
