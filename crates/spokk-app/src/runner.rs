//! Application runner and event loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ash::vk;
use spokk_gpu::{
    ActiveFrame, AllocatorPolicy, DeviceBuilder, FramePipeline, GpuError, PresentStatus,
    FRAMES_IN_FLIGHT,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::SpokkApp;
use crate::context::AppContext;
use crate::frame::FrameContext;
use crate::watcher::ShaderWatcher;

/// Stages that wait for the acquired image before touching it.
pub const FRAME_WAIT_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT.as_raw()
        | vk::PipelineStageFlags::TRANSFER.as_raw(),
);

/// Application configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
    /// Device memory allocation policy.
    pub allocator: AllocatorPolicy,
    /// Directory to watch for shader edits.
    pub shader_dir: Option<PathBuf>,
    pub shader_poll_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "spokk".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: true,
            validation: cfg!(debug_assertions),
            frames_in_flight: FRAMES_IN_FLIGHT,
            allocator: AllocatorPolicy::default(),
            shader_dir: None,
            shader_poll_interval: Duration::from_millis(250),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_allocator(mut self, allocator: AllocatorPolicy) -> Self {
        self.allocator = allocator;
        self
    }

    /// Watch `dir` and call [`SpokkApp::on_shaders_changed`] when files in
    /// it change.
    pub fn with_shader_watch(mut self, dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        self.shader_dir = Some(dir.into());
        self.shader_poll_interval = poll_interval;
        self
    }

    fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Run a [`SpokkApp`] with the given configuration.
///
/// This function initializes logging, creates the window and device, and
/// runs the event loop until the application exits.
pub fn run_app<A: SpokkApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    // Another subscriber may already be installed by the host binary.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        error: None,
    };
    event_loop.run_app(&mut runner)?;

    match runner.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// What the runner must do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameOutcome {
    Presented,
    /// The swapchain no longer matches the surface.
    Recreate,
}

/// Start a frame, or `None` if the swapchain must be recreated first.
pub(crate) fn begin_frame(
    frames: &mut FramePipeline,
    swapchain: vk::SwapchainKHR,
) -> anyhow::Result<Option<ActiveFrame>> {
    match frames.begin_frame(swapchain) {
        Ok(frame) => Ok(Some(frame)),
        Err(GpuError::SwapchainOutOfDate) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Submit and present a recorded frame, or abandon it if recording failed.
///
/// An abandoned frame's image is never presented, so the caller must
/// recreate the swapchain before the next frame.
pub(crate) fn finish_frame(
    frames: &mut FramePipeline,
    frame: ActiveFrame,
    queue: vk::Queue,
    swapchain: vk::SwapchainKHR,
    recorded: anyhow::Result<()>,
) -> anyhow::Result<FrameOutcome> {
    if let Err(e) = recorded {
        frames.abandon_frame(frame)?;
        return Err(e);
    }
    match frames.end_frame(frame, queue, swapchain, FRAME_WAIT_STAGE) {
        Ok(PresentStatus::Optimal) => Ok(FrameOutcome::Presented),
        Ok(PresentStatus::Suboptimal) | Err(GpuError::SwapchainOutOfDate) => {
            Ok(FrameOutcome::Recreate)
        }
        Err(e) => Err(e.into()),
    }
}

/// Internal application runner that implements winit's `ApplicationHandler`.
struct AppRunner<A: SpokkApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    error: Option<anyhow::Error>,
}

/// Internal application state.
struct AppState<A: SpokkApp> {
    // Dropped before `ctx` so the watcher thread stops first.
    watcher: Option<ShaderWatcher>,
    app: A,
    ctx: AppContext,
    target_frame_time: Option<Duration>,
    needs_recreate: bool,
    frames_rendered: u64,
    // FPS tracking
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: SpokkApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        // Let the app handle the event first
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(state) = self.state.take() {
                    state.shutdown();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.render_frame() {
                        error!("Render error: {e:#}");
                    }
                    state.ctx.window.request_redraw();
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    state.needs_recreate = true;
                    info!("Resized to {}x{}", size.width, size.height);
                }
            }
            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let Some(state) = &mut self.state {
            state.app.on_device_event(device_id, &event);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: SpokkApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let device = DeviceBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .build()?;
        info!("GPU: {}", device.capabilities().summary());

        // SAFETY: the window was just created and is owned by the context.
        let mut ctx = unsafe { AppContext::new(window, Arc::new(device), &self.config)? };

        let app = A::init(&mut ctx)?;

        let watcher = match &self.config.shader_dir {
            Some(dir) => match ShaderWatcher::spawn(dir, self.config.shader_poll_interval) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!("Shader watching disabled: {e}");
                    None
                }
            },
            None => None,
        };

        Ok(AppState {
            watcher,
            app,
            ctx,
            target_frame_time: self.config.target_frame_time(),
            needs_recreate: false,
            frames_rendered: 0,
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }
}

impl<A: SpokkApp> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();

        let dt = {
            let now = Instant::now();
            let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
            self.ctx.last_frame_time = now;
            if dt > 0.0 {
                let fps = 1.0 / f64::from(dt);
                self.min_fps = self.min_fps.min(fps);
                self.max_fps = self.max_fps.max(fps);
                self.fps_sum += fps;
            }
            dt
        };

        self.app.update(&self.ctx, dt);

        if let Some(event) = self.watcher.as_ref().and_then(ShaderWatcher::try_recv) {
            info!(count = event.paths.len(), "Reloading shaders");
            self.ctx.gpu.wait_idle()?;
            self.app.on_shaders_changed(&mut self.ctx, &event.paths)?;
        }

        if self.needs_recreate && !self.recreate_swapchain()? {
            // Minimized: nothing to present to.
            return Ok(());
        }

        let swapchain = self.ctx.swapchain.handle();
        let Some(frame) = begin_frame(&mut self.ctx.frames, swapchain)? else {
            self.needs_recreate = true;
            return Ok(());
        };

        let image = frame.image_index as usize;
        let mut frame_ctx = FrameContext::new(
            &frame,
            self.ctx.swapchain.images()[image],
            self.ctx.swapchain.image_views()[image],
            self.ctx.swapchain.extent(),
            dt,
        );
        let recorded = self.app.render(&self.ctx, &mut frame_ctx);

        let queue = self.ctx.device().graphics_queue().queue;
        match finish_frame(&mut self.ctx.frames, frame, queue, swapchain, recorded) {
            Ok(FrameOutcome::Presented) => {}
            Ok(FrameOutcome::Recreate) => self.needs_recreate = true,
            Err(e) => {
                self.needs_recreate = true;
                return Err(e);
            }
        }
        self.frames_rendered += 1;

        // Frame pacing
        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(())
    }

    /// Recreate the swapchain at the window's current size. Returns `false`
    /// when the window has no area.
    fn recreate_swapchain(&mut self) -> anyhow::Result<bool> {
        let size = self.ctx.window.inner_size();
        if size.width == 0 || size.height == 0 {
            return Ok(false);
        }
        self.ctx.recreate_swapchain(size.width, size.height)?;
        self.needs_recreate = false;
        let extent = self.ctx.extent();
        self.app
            .on_resize(&mut self.ctx, extent.width, extent.height)?;
        Ok(true)
    }

    #[allow(clippy::cast_precision_loss)]
    fn shutdown(mut self) {
        if self.frames_rendered > 0 {
            let avg_fps = self.fps_sum / self.frames_rendered as f64;
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", self.frames_rendered);
        }

        info!("Starting cleanup...");
        if let Some(mut watcher) = self.watcher.take() {
            watcher.shutdown();
        }
        if let Err(e) = self.ctx.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
        }
        self.app.cleanup(&mut self.ctx);
        drop(self);
        info!("Cleanup complete");
    }
}
