//! `TesseraApp` trait definition.

use winit::event::{DeviceEvent, DeviceId, WindowEvent};

use crate::context::AppContext;
use crate::frame::FrameContext;

/// Trait for Tessera applications.
///
/// The framework creates the window and device, paces frames and keeps the
/// swapchain in sync with the window.
pub trait TesseraApp: Sized {
    /// Initialize the application once the window and device exist.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before the swapchain image is acquired, with the
    /// delta time in seconds since the last frame.
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Record the frame.
    ///
    /// Called after a swapchain image has been acquired. Record into
    /// `ctx.device.frame_command()` and submit it; if nothing is submitted the
    /// runner submits an empty frame so the image can still be presented.
    fn render(&mut self, ctx: &mut AppContext, frame: &FrameContext) -> anyhow::Result<()>;

    /// Handle a swapchain rebuild.
    ///
    /// The old swapchain image handles are invalid by now; recreate render
    /// targets that referenced them.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle a window event. Return `true` to stop further processing.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Handle a raw device event.
    #[allow(unused_variables)]
    fn on_device_event(&mut self, device_id: DeviceId, event: &DeviceEvent) {}

    /// Release application resources. The device is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
