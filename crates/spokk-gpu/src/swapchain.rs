//! Swapchain creation and selection helpers.
//!
//! Acquisition and presentation go through [`crate::device::GpuDevice`] so
//! the frame pipeline can drive them; this module only owns the swapchain
//! object, its images, and their views.

use crate::error::{GpuError, Result};
use crate::vulkan::VulkanDevice;
use ash::vk;

/// Swapchain parameters picked from what the surface supports.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainConfig {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
}

impl SwapchainConfig {
    /// Choose format, present mode, extent and image count for a surface.
    pub fn choose(
        capabilities: &vk::SurfaceCapabilitiesKHR,
        formats: &[vk::SurfaceFormatKHR],
        present_modes: &[vk::PresentModeKHR],
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<Self> {
        let surface_format = select_surface_format(formats)
            .ok_or_else(|| GpuError::SwapchainCreation("surface reports no formats".to_string()))?;
        Ok(Self {
            surface_format,
            present_mode: select_present_mode(present_modes, vsync),
            extent: calculate_extent(capabilities, width, height),
            image_count: select_image_count(capabilities),
        })
    }
}

/// A swapchain with one color view per image.
pub struct Swapchain {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain, retiring `old_swapchain` if given.
    ///
    /// The old swapchain is not destroyed; see [`Self::destroy`].
    ///
    /// # Safety
    /// `surface` must belong to the device's instance and `old_swapchain`
    /// must have been created for the same surface.
    pub unsafe fn new(
        device: &VulkanDevice,
        surface: vk::SurfaceKHR,
        capabilities: &vk::SurfaceCapabilitiesKHR,
        config: &SwapchainConfig,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let loader = device
            .swapchain_loader()
            .ok_or_else(|| GpuError::SwapchainCreation("device was created headless".to_string()))?;

        let queue_families = [device.graphics_queue().family];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(config.image_count)
            .image_format(config.surface_format.format)
            .image_color_space(config.surface_format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let images = match loader.get_swapchain_images(swapchain) {
            Ok(images) => images,
            Err(e) => {
                loader.destroy_swapchain(swapchain, None);
                return Err(e.into());
            }
        };

        let raw = device.raw();
        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(config.surface_format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            match raw.create_image_view(&view_info, None) {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    for view in image_views {
                        raw.destroy_image_view(view, None);
                    }
                    loader.destroy_swapchain(swapchain, None);
                    return Err(e.into());
                }
            }
        }

        tracing::info!(
            images = images.len(),
            width = config.extent.width,
            height = config.extent.height,
            format = ?config.surface_format.format,
            present_mode = ?config.present_mode,
            "Created swapchain"
        );

        Ok(Self {
            swapchain,
            images,
            image_views,
            format: config.surface_format.format,
            extent: config.extent,
        })
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Destroy the views and the swapchain.
    ///
    /// # Safety
    /// No submitted work may still reference the swapchain images.
    pub unsafe fn destroy(&mut self, device: &VulkanDevice) {
        for view in self.image_views.drain(..) {
            device.raw().destroy_image_view(view, None);
        }
        if let Some(loader) = device.swapchain_loader() {
            if self.swapchain != vk::SwapchainKHR::null() {
                loader.destroy_swapchain(self.swapchain, None);
            }
        }
        self.swapchain = vk::SwapchainKHR::null();
        self.images.clear();
    }
}

/// Prefer 8-bit sRGB BGRA; otherwise take the first format offered.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
}

/// FIFO with vsync; otherwise mailbox, then immediate, then FIFO.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// One image more than the minimum, capped by the maximum (0 = unbounded).
pub fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        desired.min(capabilities.max_image_count)
    } else {
        desired
    }
}

/// The surface's fixed extent, or the desired size clamped to its limits.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: desired_width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: desired_height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}
