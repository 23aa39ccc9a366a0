//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use tessera_gpu::{Device, DeviceConfig, VulkanBackend, VulkanBackendBuilder};
use tracing::info;
use winit::window::Window;

use crate::runner::AppConfig;

/// Application context shared across all app methods.
pub struct AppContext {
    /// The GPU device presenting to [`window`](Self::window).
    ///
    /// Declared first so the surface is released before the window.
    pub device: Device<VulkanBackend>,
    /// The window handle.
    pub window: Arc<Window>,
    /// Time of last frame (for delta time calculation).
    pub(crate) last_frame_time: Instant,
    /// Whether vsync is enabled.
    pub vsync: bool,
}

impl AppContext {
    pub(crate) fn new(window: Arc<Window>, config: &AppConfig) -> anyhow::Result<Self> {
        let size = window.inner_size();
        let width = size.width.max(1);
        let height = size.height.max(1);

        let backend = VulkanBackendBuilder::new()
            .app_name(&config.title)
            .validation(config.validation)
            .vsync(config.vsync)
            .build(window.as_ref(), width, height)?;
        let device = Device::new(
            backend,
            DeviceConfig::default().with_frames_in_flight(config.frames_in_flight),
        )?;

        info!("GPU: {}", device.capabilities().summary());

        Ok(Self {
            device,
            window,
            last_frame_time: Instant::now(),
            vsync: config.vsync,
        })
    }

    /// Get the current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.device.swapchain_extent().unwrap_or_default()
    }

    /// Get the swapchain width.
    pub fn width(&self) -> u32 {
        self.extent().width
    }

    /// Get the swapchain height.
    pub fn height(&self) -> u32 {
        self.extent().height
    }

    /// Get the aspect ratio (width / height).
    #[allow(clippy::cast_precision_loss)]
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    /// Get the number of frames in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.device.scheduler().frames_in_flight()
    }

    /// Rebuild the swapchain at the window's current size.
    ///
    /// Returns the new size, or `None` while the window is minimized.
    pub(crate) fn rebuild_swapchain(&mut self) -> anyhow::Result<Option<(u32, u32)>> {
        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            return Ok(None);
        }
        self.device.rebuild_swapchain(size.width, size.height)?;
        Ok(Some((size.width, size.height)))
    }
}
