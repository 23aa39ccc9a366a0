//! Application framework for the Tessera engine.
//!
//! Owns the window, the [`Device`] and the event loop, and drives the
//! acquire / record / submit / present cycle so applications only record
//! their frame's commands. Swapchain rebuilds after resizes or out-of-date
//! surfaces are handled by the runner.
//!
//! # Example
//!
//! ```no_run
//! use tessera_app::{run_app, AppConfig, AppContext, FrameContext, TesseraApp};
//!
//! struct MyApp;
//!
//! impl TesseraApp for MyApp {
//!     fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, ctx: &AppContext, dt: f32) {}
//!
//!     fn render(&mut self, ctx: &mut AppContext, frame: &FrameContext) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::TesseraApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{run_app, AppConfig};

pub use tessera_gpu::{Device, VulkanBackend};
pub use winit::event::{DeviceEvent, DeviceId, WindowEvent};
