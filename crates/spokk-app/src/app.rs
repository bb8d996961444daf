//! `SpokkApp` trait definition.

use std::path::PathBuf;

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};

/// Trait for spokk applications.
///
/// The framework creates the window, device, swapchain and frame pipeline,
/// and drives the event loop. The application records commands for each
/// frame into the command buffer it is handed.
pub trait SpokkApp: Sized {
    /// Initialize the application.
    ///
    /// Called once, after the device, window and swapchain exist.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before rendering, with the time in seconds since
    /// the previous frame.
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Record the frame.
    ///
    /// The framework has already waited for this frame slot's previous
    /// submission, acquired a swapchain image and begun the command buffer.
    /// It submits and presents after this returns. Per-frame CPU resources
    /// should be indexed by [`FrameContext::slot`] so that data the GPU may
    /// still be reading is never overwritten.
    ///
    /// The swapchain image is handed over in `UNDEFINED` layout and must be
    /// left in `PRESENT_SRC_KHR`.
    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()>;

    /// Handle window resize.
    ///
    /// Called after the swapchain and its per-image resources have been
    /// recreated.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle changed files in the watched shader directory.
    ///
    /// The device is idle when this is called, so pipelines can be rebuilt
    /// in place.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_shaders_changed(
        &mut self,
        ctx: &mut AppContext,
        paths: &[PathBuf],
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Handle raw device events.
    #[allow(unused_variables)]
    fn on_device_event(&mut self, device_id: DeviceId, event: &DeviceEvent) {}

    /// Release application resources.
    ///
    /// Called once before shutdown, with the device idle.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
