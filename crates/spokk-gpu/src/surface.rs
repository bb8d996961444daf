//! Window surfaces.

use crate::error::{GpuError, Result};
use crate::swapchain::{Swapchain, SwapchainConfig};
use crate::vulkan::VulkanDevice;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// A presentation surface for one window.
pub struct SurfaceContext {
    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
}

impl SurfaceContext {
    /// Create a surface for `window`.
    ///
    /// # Safety
    /// The window must outlive the surface, and the device must not have been
    /// built headless.
    pub unsafe fn from_window<W>(device: &VulkanDevice, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let surface = ash_window::create_surface(
            device.entry(),
            device.instance(),
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        let surface_loader = ash::khr::surface::Instance::new(device.entry(), device.instance());

        let context = Self {
            surface,
            surface_loader,
        };
        match context.supports_present(device, device.graphics_queue().family) {
            Ok(true) => Ok(context),
            Ok(false) => {
                context.destroy();
                Err(GpuError::SurfaceCreation(
                    "graphics queue family cannot present to this surface".to_string(),
                ))
            }
            Err(e) => {
                context.destroy();
                Err(e)
            }
        }
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Whether queues of `queue_family` can present to this surface.
    pub fn supports_present(&self, device: &VulkanDevice, queue_family: u32) -> Result<bool> {
        // SAFETY: the surface and physical device belong to the same instance.
        let supported = unsafe {
            self.surface_loader.get_physical_device_surface_support(
                device.physical_device(),
                queue_family,
                self.surface,
            )
        }?;
        Ok(supported)
    }

    /// Query surface capabilities, formats and present modes.
    pub fn capabilities(&self, device: &VulkanDevice) -> Result<SurfaceCapabilities> {
        let physical_device = device.physical_device();
        // SAFETY: the surface and physical device belong to the same instance.
        unsafe {
            Ok(SurfaceCapabilities {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(physical_device, self.surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(physical_device, self.surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(physical_device, self.surface)?,
            })
        }
    }

    /// Create a swapchain sized as close to `width` x `height` as the surface
    /// allows.
    ///
    /// # Safety
    /// `old_swapchain` must be null or a swapchain of this surface.
    pub unsafe fn create_swapchain(
        &self,
        device: &VulkanDevice,
        width: u32,
        height: u32,
        vsync: bool,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Swapchain> {
        let caps = self.capabilities(device)?;
        let config = caps.choose(width, height, vsync)?;
        Swapchain::new(device, self.surface, &caps.capabilities, &config, old_swapchain)
    }

    /// Replace `swapchain` with one for the new size.
    ///
    /// # Safety
    /// The device must be idle: no submitted work may reference the old
    /// swapchain images.
    pub unsafe fn recreate_swapchain(
        &self,
        device: &VulkanDevice,
        swapchain: &mut Swapchain,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<()> {
        let mut old = std::mem::replace(
            swapchain,
            self.create_swapchain(device, width, height, vsync, swapchain.handle())?,
        );
        old.destroy(device);
        Ok(())
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// Every swapchain created for the surface must already be destroyed.
    pub unsafe fn destroy(&self) {
        self.surface_loader.destroy_surface(self.surface, None);
    }
}

/// Surface capabilities query result.
pub struct SurfaceCapabilities {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceCapabilities {
    /// Swapchain parameters for the desired size.
    pub fn choose(&self, width: u32, height: u32, vsync: bool) -> Result<SwapchainConfig> {
        SwapchainConfig::choose(
            &self.capabilities,
            &self.formats,
            &self.present_modes,
            width,
            height,
            vsync,
        )
    }
}
