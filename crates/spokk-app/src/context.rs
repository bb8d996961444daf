//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use spokk_gpu::{
    DeviceContext, FrameConfig, FramePipeline, GpuDevice, SurfaceContext, Swapchain, VulkanDevice,
};
use winit::window::Window;

use crate::runner::AppConfig;

/// Application context shared across all app methods.
///
/// Owns the window, the device and everything presented through it.
pub struct AppContext {
    /// The window handle.
    pub window: Arc<Window>,
    /// Device and allocator; resources are created through this.
    pub gpu: DeviceContext,
    /// Frames-in-flight multiplexer.
    pub frames: FramePipeline,
    /// Current swapchain.
    pub swapchain: Swapchain,
    surface: SurfaceContext,
    device: Arc<VulkanDevice>,
    pub(crate) last_frame_time: Instant,
    /// Whether vsync is enabled.
    pub vsync: bool,
}

impl AppContext {
    /// Create the surface, swapchain and frame pipeline for `window`.
    ///
    /// # Safety
    /// The window must have valid handles and outlive the context.
    pub(crate) unsafe fn new(
        window: Arc<Window>,
        device: Arc<VulkanDevice>,
        config: &AppConfig,
    ) -> anyhow::Result<Self> {
        let allocator = config.allocator.create(&device)?;
        let gpu = DeviceContext::new(device.clone(), allocator);

        // SAFETY: caller guarantees the window handles are valid.
        let surface = unsafe { SurfaceContext::from_window(&device, window.as_ref())? };

        let size = window.inner_size();
        // SAFETY: there is no previous swapchain.
        let swapchain = match unsafe {
            surface.create_swapchain(
                &device,
                size.width.max(1),
                size.height.max(1),
                config.vsync,
                vk::SwapchainKHR::null(),
            )
        } {
            Ok(swapchain) => swapchain,
            Err(e) => {
                // SAFETY: no swapchain was created for the surface.
                unsafe { surface.destroy() };
                return Err(e.into());
            }
        };

        let frame_config = FrameConfig::default().with_frames_in_flight(config.frames_in_flight);
        let dyn_device: Arc<dyn GpuDevice> = device.clone();
        let frames = match FramePipeline::new(
            dyn_device,
            device.graphics_queue().family,
            frame_config,
            swapchain.image_count(),
        ) {
            Ok(frames) => frames,
            Err(e) => {
                let mut swapchain = swapchain;
                // SAFETY: nothing has been submitted yet.
                unsafe {
                    swapchain.destroy(&device);
                    surface.destroy();
                }
                return Err(e.into());
            }
        };

        Ok(Self {
            window,
            gpu,
            frames,
            swapchain,
            surface,
            device,
            last_frame_time: Instant::now(),
            vsync: config.vsync,
        })
    }

    /// The concrete Vulkan device, for raw command recording.
    pub fn device(&self) -> &VulkanDevice {
        &self.device
    }

    /// Get the current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    pub fn width(&self) -> u32 {
        self.swapchain.extent().width
    }

    pub fn height(&self) -> u32 {
        self.swapchain.extent().height
    }

    /// Width over height.
    #[allow(clippy::cast_precision_loss)]
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.swapchain.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.frames_in_flight()
    }

    /// Frames submitted so far.
    pub fn frame_number(&self) -> u64 {
        self.frames.frame_number()
    }

    /// Replace the swapchain after a resize or an out-of-date result.
    pub(crate) fn recreate_swapchain(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        self.gpu.wait_idle()?;
        // SAFETY: the device is idle, so no work references the old images.
        unsafe {
            self.surface.recreate_swapchain(
                &self.device,
                &mut self.swapchain,
                width,
                height,
                self.vsync,
            )?;
        }
        self.frames
            .recreate_swapchain_resources(self.swapchain.image_count())?;

        tracing::info!(
            width = self.swapchain.extent().width,
            height = self.swapchain.extent().height,
            images = self.swapchain.image_count(),
            "Swapchain recreated"
        );
        Ok(())
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            tracing::error!("Failed to wait idle: {e}");
        }
        // SAFETY: the device is idle and the swapchain is destroyed before
        // its surface. The remaining fields drop afterwards, device last.
        unsafe {
            self.swapchain.destroy(&self.device);
            self.surface.destroy();
        }
    }
}
