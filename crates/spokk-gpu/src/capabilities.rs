//! GPU capability detection.

use ash::vk;
use std::ffi::CStr;

/// Minimum Vulkan API version the framework runs on.
pub const MIN_API_VERSION: u32 = vk::API_VERSION_1_1;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities relevant to memory and frame management.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub api_version: u32,
    pub driver_version: u32,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Upper bound on live `vkAllocateMemory` allocations
    pub max_memory_allocation_count: u32,
    /// Granularity for flushing and invalidating non-coherent memory
    pub non_coherent_atom_size: vk::DeviceSize,
    /// Minimum spacing between linear and optimal resources in one block
    pub buffer_image_granularity: vk::DeviceSize,
    pub min_uniform_buffer_offset_alignment: vk::DeviceSize,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        // SAFETY: guaranteed by the caller.
        let (properties, memory_properties) = unsafe {
            (
                instance.get_physical_device_properties(physical_device),
                instance.get_physical_device_memory_properties(physical_device),
            )
        };

        // SAFETY: `device_name` is a NUL-terminated string filled by the driver.
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let limits = &properties.limits;
        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            device_local_memory_mb: device_local_memory_mb(&memory_properties),
            max_memory_allocation_count: limits.max_memory_allocation_count,
            non_coherent_atom_size: limits.non_coherent_atom_size,
            buffer_image_granularity: limits.buffer_image_granularity,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
        }
    }

    /// Check if the GPU meets minimum requirements.
    pub fn meets_requirements(&self) -> bool {
        self.api_version >= MIN_API_VERSION
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - {} allocations max",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            self.max_memory_allocation_count,
        )
    }
}

/// Sum of all device-local heaps, in MB.
pub fn device_local_memory_mb(memory: &vk::PhysicalDeviceMemoryProperties) -> u64 {
    memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size / (1024 * 1024))
        .sum()
}
