//! Vulkan instance creation and physical device selection.

use crate::capabilities::MIN_API_VERSION;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

/// Instance extensions needed to present to a window surface.
pub fn surface_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

/// Validation layers to enable in debug builds.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance.
///
/// Headless instances skip the surface extensions.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
    headless: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"spokk")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(MIN_API_VERSION);

    let extensions = if headless {
        Vec::new()
    } else {
        surface_instance_extensions()
    };
    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();

    let layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    // SAFETY: `entry` is valid per the caller.
    let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
    let layers: Vec<&CStr> = layers
        .into_iter()
        .filter(|layer| {
            let found = available_layers
                .iter()
                .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == *layer));
            if !found {
                tracing::warn!("Validation layer {:?} not available", layer);
            }
            found
        })
        .collect();
    let layer_names: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = if headless {
        vk::InstanceCreateFlags::empty()
    } else {
        vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
    };
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    // SAFETY: every pointer in `create_info` outlives the call.
    let instance = unsafe { entry.create_instance(&create_info, None)? };

    Ok(instance)
}

/// Select the best physical device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    // SAFETY: `instance` is valid per the caller.
    let devices = unsafe { instance.enumerate_physical_devices()? };

    devices
        .into_iter()
        // SAFETY: every handle came from `instance`.
        .map(|device| (device, unsafe { score_physical_device(instance, device) }))
        .filter(|&(_, score)| score >= 0)
        .max_by_key(|&(_, score)| score)
        .map(|(device, _)| device)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Score a physical device for selection. Negative scores are unusable.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i64 {
    // SAFETY: forwarded from `select_physical_device`.
    let (properties, memory, families) = unsafe {
        (
            instance.get_physical_device_properties(device),
            instance.get_physical_device_memory_properties(device),
            instance.get_physical_device_queue_family_properties(device),
        )
    };

    if properties.api_version < MIN_API_VERSION {
        return -1;
    }
    if !families
        .iter()
        .any(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
    {
        return -1;
    }

    let mut score = 0;

    // Prefer discrete GPUs
    match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => score += 50,
        _ => {}
    }

    // +1 per GB of VRAM
    score += (crate::capabilities::device_local_memory_mb(&memory) / 1024) as i64;

    score
}
