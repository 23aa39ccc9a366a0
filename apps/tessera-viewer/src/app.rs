//! Viewer application: per-swapchain-image render targets cleared to an
//! animated color.

use ash::vk;
use glam::Vec3;
use tracing::{error, info};

use tessera_app::{AppContext, FrameContext, TesseraApp};
use tessera_gpu::{ImageDesc, ImageHandle, ImageUsage, LoadOp, RenderTargetHandle, SubmitOptions};

/// Seconds per full trip around the color wheel.
const CYCLE_SECONDS: f32 = 6.0;

/// Render targets for one swapchain generation.
struct Targets {
    depth: ImageHandle,
    per_image: Vec<RenderTargetHandle>,
}

impl Targets {
    fn create(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let extent = ctx.extent();
        let depth = ctx.device.create_image(
            ImageDesc::new_2d(
                extent.width,
                extent.height,
                vk::Format::D32_SFLOAT,
                ImageUsage::DEPTH_TARGET,
            )
            .with_label("viewer depth"),
        )?;

        let images = ctx.device.swapchain_images().to_vec();
        let mut per_image = Vec::with_capacity(images.len());
        for image in images {
            per_image.push(ctx.device.create_render_target(&[image], Some(depth))?);
        }

        info!(
            "Created {} render targets at {}x{}",
            per_image.len(),
            extent.width,
            extent.height
        );
        Ok(Self { depth, per_image })
    }

    fn destroy(self, ctx: &mut AppContext) -> anyhow::Result<()> {
        for target in self.per_image {
            ctx.device.destroy_render_target(target)?;
        }
        ctx.device.destroy_image(self.depth)?;
        Ok(())
    }
}

/// Viewer application state.
pub struct Viewer {
    targets: Option<Targets>,
    elapsed: f32,
}

impl Viewer {
    fn clear_color(&self) -> Vec3 {
        let phase = self.elapsed / CYCLE_SECONDS * std::f32::consts::TAU;
        let wave = |offset: f32| 0.5 + 0.5 * (phase + offset).cos();
        Vec3::new(wave(0.0), wave(2.0), wave(4.0))
    }
}

impl TesseraApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        Ok(Self {
            targets: Some(Targets::create(ctx)?),
            elapsed: 0.0,
        })
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        self.elapsed = (self.elapsed + dt) % CYCLE_SECONDS;
    }

    fn render(&mut self, ctx: &mut AppContext, frame: &FrameContext) -> anyhow::Result<()> {
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Render targets missing"))?;
        let target = *targets
            .per_image
            .get(frame.image_index as usize)
            .ok_or_else(|| anyhow::anyhow!("No render target for image {}", frame.image_index))?;

        let color = self.clear_color();
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: color.extend(1.0).to_array(),
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let mut cmd = ctx.device.frame_command()?;
        cmd.begin()?;
        cmd.begin_render_pass(target, &[LoadOp::Clear, LoadOp::Clear], &clear_values)?;
        cmd.end_render_pass()?;
        cmd.submit(&SubmitOptions::new())?;
        Ok(())
    }

    fn on_resize(&mut self, ctx: &mut AppContext, _width: u32, _height: u32) -> anyhow::Result<()> {
        if let Some(old) = self.targets.take() {
            old.destroy(ctx)?;
        }
        self.targets = Some(Targets::create(ctx)?);
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        if let Some(targets) = self.targets.take() {
            if let Err(e) = targets.destroy(ctx) {
                error!("Failed to release render targets: {e:#}");
            }
        }
    }
}
