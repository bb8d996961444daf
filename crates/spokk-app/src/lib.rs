//! Application framework for spokk.
//!
//! This crate provides a trait-based application framework that handles:
//! - Window creation and management
//! - Device, allocator and swapchain setup
//! - Frames in flight through [`spokk_gpu::FramePipeline`]
//! - Swapchain recreation on resize or out-of-date results
//! - Optional shader directory watching
//!
//! # Example
//!
//! ```no_run
//! use spokk_app::{run_app, AppConfig, AppContext, FrameContext, SpokkApp};
//!
//! struct MyApp;
//!
//! impl SpokkApp for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, _ctx: &AppContext, _dt: f32) {}
//!
//!     fn render(&mut self, _ctx: &AppContext, _frame: &mut FrameContext) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::new("my app"))
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;
pub mod watcher;

pub use app::SpokkApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{run_app, AppConfig, FRAME_WAIT_STAGE};
pub use watcher::{ReloadEvent, ShaderWatcher};

// Re-export commonly used types for convenience
pub use spokk_gpu::{AllocatorPolicy, DescriptorSetLayoutBuilder, DeviceContext, PipelinedBuffer};
pub use winit::event::{DeviceEvent, DeviceId, WindowEvent};
