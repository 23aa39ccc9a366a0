//! Per-frame context for rendering.

use tessera_gpu::ImageHandle;

/// The frame being rendered.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    /// The acquired swapchain image.
    pub swapchain_image: ImageHandle,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Frames presented so far.
    pub frame_number: u64,
}

impl FrameContext {
    pub(crate) fn new(
        image_index: u32,
        swapchain_image: ImageHandle,
        dt: f32,
        frame_number: u64,
    ) -> Self {
        Self {
            image_index,
            swapchain_image,
            dt,
            frame_number,
        }
    }
}
