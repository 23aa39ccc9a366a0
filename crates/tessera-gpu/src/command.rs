//! Command recording.
//!
//! A [`CommandRecorder`] wraps one native command buffer together with the
//! device that owns every resource it references. Resources are named by
//! handle only; the recorder resolves them, derives barriers from the tracked
//! image usage, and realizes descriptor sets and pipeline variants on demand.

use ash::vk;
use tracing::{error, warn};

use crate::backend::{Backend, QueueKind};
use crate::deferred::RetiredObject;
use crate::descriptor::DescriptorSetHandle;
use crate::device::{lookup, Device};
use crate::error::{GpuError, Result};
use crate::frame::{FramePhase, SubmitOptions};
use crate::pipeline::{LoadOp, PipelineProgramHandle, RenderState, RenderTargetHandle, TargetLayout};
use crate::resource::{BufferDesc, BufferHandle, BufferUsage, ImageHandle};
use crate::usage::{derive_barrier, derive_buffer_barrier, BufferAccess, ImageUsageState};

/// Lifecycle of a recorder's command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecorderState {
    Initial,
    Recording,
    Executable,
    Submitted,
}

impl RecorderState {
    /// Lowercase name used in error messages.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Recording => "recording",
            Self::Executable => "executable",
            Self::Submitted => "submitted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecorderKind {
    /// The current frame context's command buffer.
    Frame,
    /// A one-off buffer from a device-owned pool.
    Transient {
        queue: QueueKind,
        pool: vk::CommandPool,
    },
}

#[derive(Debug, Clone, Copy)]
struct BoundProgram {
    handle: PipelineProgramHandle,
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    push_constant_stages: vk::ShaderStageFlags,
    push_constant_size: u32,
}

#[derive(Debug)]
struct ActivePass {
    layout: TargetLayout,
}

/// Records commands into one native command buffer.
///
/// Obtained from [`Device::frame_command`] or one of the
/// `Device::get_*_command` calls. Every recording operation requires the
/// `Recording` state entered through [`begin`](Self::begin).
pub struct CommandRecorder<'d, B: Backend> {
    device: &'d mut Device<B>,
    cmd: vk::CommandBuffer,
    kind: RecorderKind,
    state: RecorderState,
    staging: Vec<BufferHandle>,
    /// Tracked usage of each image before this recorder transitioned it,
    /// restored if the commands are never submitted.
    transitions: Vec<(ImageHandle, ImageUsageState)>,
    program: Option<BoundProgram>,
    pass: Option<ActivePass>,
}

impl<'d, B: Backend> CommandRecorder<'d, B> {
    pub(crate) fn for_frame(device: &'d mut Device<B>, cmd: vk::CommandBuffer) -> Self {
        Self::new(device, cmd, RecorderKind::Frame)
    }

    pub(crate) fn transient(
        device: &'d mut Device<B>,
        queue: QueueKind,
        pool: vk::CommandPool,
        cmd: vk::CommandBuffer,
    ) -> Self {
        Self::new(device, cmd, RecorderKind::Transient { queue, pool })
    }

    fn new(device: &'d mut Device<B>, cmd: vk::CommandBuffer, kind: RecorderKind) -> Self {
        Self {
            device,
            cmd,
            kind,
            state: RecorderState::Initial,
            staging: Vec::new(),
            transitions: Vec::new(),
            program: None,
            pass: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Queue the commands will be submitted to.
    pub fn queue(&self) -> QueueKind {
        match self.kind {
            RecorderKind::Frame => QueueKind::Graphics,
            RecorderKind::Transient { queue, .. } => queue,
        }
    }

    /// Native command buffer.
    pub fn raw(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// The owning device.
    pub fn device(&self) -> &Device<B> {
        self.device
    }

    /// Start recording.
    pub fn begin(&mut self) -> Result<()> {
        self.expect_state(RecorderState::Initial, "begin")?;
        self.device.backend.begin_command_buffer(self.cmd, true)?;
        self.state = RecorderState::Recording;
        Ok(())
    }

    /// Finish recording. A render pass must not be open.
    ///
    /// The frame recorder first moves the acquired swapchain image to
    /// `Present`.
    pub fn end(&mut self) -> Result<()> {
        self.expect_state(RecorderState::Recording, "end")?;
        if self.pass.is_some() {
            return Err(GpuError::InvalidState(
                "Cannot end a command buffer inside a render pass".to_string(),
            ));
        }
        if self.kind == RecorderKind::Frame {
            self.prepare_present()?;
        }
        self.device.backend.end_command_buffer(self.cmd)?;
        self.state = RecorderState::Executable;
        Ok(())
    }

    // Barriers

    /// Transition `image` to `usage`.
    ///
    /// Always records a full barrier, even when the image already has the
    /// requested usage, and updates the tracked usage unconditionally.
    pub fn image_barrier(&mut self, image: ImageHandle, usage: ImageUsageState) -> Result<()> {
        self.expect_recording("record a barrier")?;
        self.expect_outside_pass("record a barrier")?;
        self.transition(image, usage)
    }

    /// Order `after` behind `before` on the whole of `buffer`.
    pub fn buffer_barrier(
        &mut self,
        buffer: BufferHandle,
        before: BufferAccess,
        after: BufferAccess,
    ) -> Result<()> {
        self.expect_recording("record a barrier")?;
        self.expect_outside_pass("record a barrier")?;
        let raw = lookup(&self.device.buffers, buffer, "buffer")?.raw;
        let barrier = derive_buffer_barrier(before, after).to_vk(raw);
        self.device
            .backend
            .cmd_pipeline_barrier(self.cmd, &[], &[barrier]);
        Ok(())
    }

    fn transition(&mut self, image: ImageHandle, usage: ImageUsageState) -> Result<()> {
        let resource = self
            .device
            .images
            .get_mut(image)
            .inspect_err(|e| error!("Invalid image handle: {e}"))?;
        let barrier = derive_barrier(resource.usage, usage)
            .inspect_err(|e| error!("{e} on image '{}'", resource.desc.label))?;
        let native = barrier.to_vk(resource.raw, resource.full_range());
        self.transitions.push((image, resource.usage));
        resource.usage = usage;
        self.device
            .backend
            .cmd_pipeline_barrier(self.cmd, &[native], &[]);
        Ok(())
    }

    // Pipelines and bindings

    /// Bind the compute pipeline of `program`.
    pub fn bind_compute_pipeline(&mut self, program: PipelineProgramHandle) -> Result<()> {
        self.expect_recording("bind a pipeline")?;
        self.expect_outside_pass("bind a compute pipeline")?;
        let pipeline = self.device.compile_compute_pipeline(program)?;
        self.bind_program(program, pipeline)
    }

    /// Bind the variant of `program` for `state` and the open render pass.
    pub fn bind_graphics_pipeline(
        &mut self,
        program: PipelineProgramHandle,
        state: &RenderState,
    ) -> Result<()> {
        self.expect_recording("bind a pipeline")?;
        let Some(pass) = &self.pass else {
            return Err(GpuError::InvalidState(
                "Graphics pipelines are bound inside a render pass".to_string(),
            ));
        };
        let targets = pass.layout.clone();
        let pipeline = self.device.compile_pipeline(program, state, &targets)?;
        self.bind_program(program, pipeline)
    }

    fn bind_program(&mut self, handle: PipelineProgramHandle, pipeline: vk::Pipeline) -> Result<()> {
        let program = lookup(&self.device.programs, handle, "pipeline program")?;
        let bound = BoundProgram {
            handle,
            layout: program.layout,
            bind_point: program.bind_point(),
            push_constant_stages: program.push_constant_stages,
            push_constant_size: program.desc.push_constant_size,
        };
        self.device
            .backend
            .cmd_bind_pipeline(self.cmd, bound.bind_point, pipeline);
        self.program = Some(bound);
        Ok(())
    }

    /// Bind `set` at `set_index` of the bound program, realizing it if its
    /// staged content has not been seen before.
    pub fn bind_descriptor_set(&mut self, set_index: u32, set: DescriptorSetHandle) -> Result<()> {
        self.expect_recording("bind a descriptor set")?;
        let program = self.bound_program("bind a descriptor set")?;

        let expected = lookup(&self.device.programs, program.handle, "pipeline program")?
            .desc
            .set_layouts
            .get(set_index as usize)
            .copied();
        let logical = lookup(&self.device.sets, set, "descriptor set")?;
        if expected != Some(logical.layout()) {
            return Err(GpuError::InvalidBinding(format!(
                "Set {set_index} does not match the bound program's layout"
            )));
        }
        let offsets = logical.dynamic_offsets().to_vec();

        let raw = self.device.realize_descriptor_set(set)?;
        self.device.backend.cmd_bind_descriptor_set(
            self.cmd,
            program.bind_point,
            program.layout,
            set_index,
            raw,
            &offsets,
        );
        Ok(())
    }

    /// Bind `buffer` as vertex input `binding`.
    pub fn bind_vertex_buffer(&mut self, binding: u32, buffer: BufferHandle, offset: u64) -> Result<()> {
        self.expect_recording("bind a vertex buffer")?;
        let raw = self.buffer_with_usage(buffer, BufferUsage::VERTEX)?;
        self.device
            .backend
            .cmd_bind_vertex_buffer(self.cmd, binding, raw, offset);
        Ok(())
    }

    /// Bind `buffer` as the index buffer.
    pub fn bind_index_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        index_type: vk::IndexType,
    ) -> Result<()> {
        self.expect_recording("bind an index buffer")?;
        let raw = self.buffer_with_usage(buffer, BufferUsage::INDEX)?;
        self.device
            .backend
            .cmd_bind_index_buffer(self.cmd, raw, offset, index_type);
        Ok(())
    }

    /// Write `value` into the bound program's push constant block at `offset`.
    pub fn push_constants<T: bytemuck::Pod>(&mut self, offset: u32, value: &T) -> Result<()> {
        self.expect_recording("push constants")?;
        let program = self.bound_program("push constants")?;
        let data = bytemuck::bytes_of(value);
        let end = u64::from(offset) + data.len() as u64;
        if offset % 4 != 0 || end > u64::from(program.push_constant_size) {
            return Err(GpuError::InvalidState(format!(
                "Push constant range {offset}..{end} outside the {}-byte block",
                program.push_constant_size
            )));
        }
        self.device.backend.cmd_push_constants(
            self.cmd,
            program.layout,
            program.push_constant_stages,
            offset,
            data,
        );
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) -> Result<()> {
        self.expect_recording("set the viewport")?;
        self.device.backend.cmd_set_viewport(self.cmd, viewport);
        Ok(())
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) -> Result<()> {
        self.expect_recording("set the scissor")?;
        self.device.backend.cmd_set_scissor(self.cmd, scissor);
        Ok(())
    }

    // Render passes

    /// Begin a render pass into `target`.
    ///
    /// Attachments not already in their target usage are transitioned first.
    /// Viewport and scissor are set to the full target extent.
    pub fn begin_render_pass(
        &mut self,
        target: RenderTargetHandle,
        load_ops: &[LoadOp],
        clear_values: &[vk::ClearValue],
    ) -> Result<()> {
        self.expect_recording("begin a render pass")?;
        self.expect_outside_pass("begin a render pass")?;

        let render_target = lookup(&self.device.targets, target, "render target")?;
        let colors = render_target.colors.clone();
        let depth = render_target.depth;
        for color in colors {
            if self.device.image_usage(color)? != ImageUsageState::ColorTarget {
                self.transition(color, ImageUsageState::ColorTarget)?;
            }
        }
        if let Some(depth) = depth {
            if self.device.image_usage(depth)? != ImageUsageState::DepthTarget {
                self.transition(depth, ImageUsageState::DepthTarget)?;
            }
        }

        let pass = self
            .device
            .get_or_create_render_target_pass(target, load_ops)?;
        let render_target = lookup(&self.device.targets, target, "render target")?;
        let framebuffer = render_target.framebuffer.ok_or_else(|| {
            GpuError::InvalidState("Render target has no framebuffer".to_string())
        })?;
        let extent = render_target.extent;
        let layout = render_target.layout.clone();

        let backend = &mut self.device.backend;
        backend.cmd_begin_render_pass(self.cmd, pass, framebuffer, extent, clear_values);
        backend.cmd_set_viewport(
            self.cmd,
            vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        );
        backend.cmd_set_scissor(
            self.cmd,
            vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
        );
        self.pass = Some(ActivePass { layout });
        Ok(())
    }

    /// End the open render pass.
    pub fn end_render_pass(&mut self) -> Result<()> {
        self.expect_recording("end a render pass")?;
        if self.pass.take().is_none() {
            return Err(GpuError::InvalidState("No render pass is open".to_string()));
        }
        self.device.backend.cmd_end_render_pass(self.cmd);
        Ok(())
    }

    // Work

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        self.expect_draw("draw")?;
        self.device.backend.cmd_draw(
            self.cmd,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        );
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        self.expect_draw("draw")?;
        self.device.backend.cmd_draw_indexed(
            self.cmd,
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        );
        Ok(())
    }

    /// Dispatch `x * y * z` workgroups of the bound compute program.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.expect_recording("dispatch")?;
        self.expect_outside_pass("dispatch")?;
        let program = self.bound_program("dispatch")?;
        if program.bind_point != vk::PipelineBindPoint::COMPUTE {
            return Err(GpuError::InvalidState(
                "Dispatch needs a compute pipeline".to_string(),
            ));
        }
        self.device.backend.cmd_dispatch(self.cmd, x, y, z);
        Ok(())
    }

    // Transfers

    /// Copy `size` bytes between two buffers.
    pub fn copy_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.expect_recording("copy")?;
        self.expect_outside_pass("copy")?;
        let in_bounds = |buffer: BufferHandle, offset: u64| -> Result<vk::Buffer> {
            let resource = lookup(&self.device.buffers, buffer, "buffer")?;
            if offset.checked_add(size).is_some_and(|end| end <= resource.size()) {
                Ok(resource.raw)
            } else {
                Err(GpuError::InvalidState(format!(
                    "Copy of {size} bytes at {offset} exceeds buffer '{}'",
                    resource.desc.label
                )))
            }
        };
        let src = in_bounds(src, src_offset)?;
        let dst = in_bounds(dst, dst_offset)?;
        self.device.backend.cmd_copy_buffer(
            self.cmd,
            src,
            dst,
            &[vk::BufferCopy {
                src_offset,
                dst_offset,
                size,
            }],
        );
        Ok(())
    }

    /// Copy tightly packed texels from `src` into mip level 0 of `dst`.
    ///
    /// `dst` must be in the `TransferDst` or `General` usage.
    pub fn copy_buffer_to_image(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: ImageHandle,
    ) -> Result<()> {
        self.expect_recording("copy")?;
        self.expect_outside_pass("copy")?;
        let image = lookup(&self.device.images, dst, "image")?;
        let layout = match image.usage {
            ImageUsageState::TransferDst | ImageUsageState::General => image.usage.layout(),
            usage => {
                error!("Copy into image '{}' in usage {usage:?}", image.desc.label);
                return Err(GpuError::InvalidState(format!(
                    "Image '{}' must be a transfer destination, not {usage:?}",
                    image.desc.label
                )));
            }
        };
        let buffer = lookup(&self.device.buffers, src, "buffer")?;
        if let Some(needed) = image.desc.base_level_size() {
            let fits = src_offset
                .checked_add(needed)
                .is_some_and(|end| end <= buffer.size());
            if !fits {
                return Err(GpuError::InvalidState(format!(
                    "Buffer '{}' holds fewer than the {needed} bytes of image '{}'",
                    buffer.desc.label, image.desc.label
                )));
            }
        }

        let range = image.full_range();
        let region = vk::BufferImageCopy {
            buffer_offset: src_offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: range.aspect_mask,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: image.desc.extent,
        };
        let (src, dst) = (buffer.raw, image.raw);
        self.device
            .backend
            .cmd_copy_buffer_to_image(self.cmd, src, dst, layout, &[region]);
        Ok(())
    }

    /// Upload `data` into `dst` at `offset` through a staging buffer.
    ///
    /// The staging buffer lives until the submission has completed.
    pub fn upload_buffer<T: bytemuck::Pod>(
        &mut self,
        dst: BufferHandle,
        offset: u64,
        data: &[T],
    ) -> Result<()> {
        self.expect_recording("upload")?;
        self.expect_outside_pass("upload")?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.is_empty() {
            return Ok(());
        }
        let size = bytes.len() as u64;
        let staging = self.staging_buffer(bytes)?;
        self.copy_buffer(staging, 0, dst, offset, size)
    }

    /// Upload tightly packed texels into mip level 0 of `image`.
    ///
    /// Transitions the image to `TransferDst` first and leaves it there.
    pub fn upload_image(&mut self, image: ImageHandle, data: &[u8]) -> Result<()> {
        self.expect_recording("upload")?;
        self.expect_outside_pass("upload")?;
        let desc = &lookup(&self.device.images, image, "image")?.desc;
        let expected = desc.base_level_size().ok_or_else(|| {
            GpuError::InvalidState(format!("Unknown texel size of format {:?}", desc.format))
        })?;
        if data.len() as u64 != expected {
            return Err(GpuError::InvalidState(format!(
                "Image '{}' needs {expected} bytes, got {}",
                desc.label,
                data.len()
            )));
        }

        self.transition(image, ImageUsageState::TransferDst)?;
        let staging = self.staging_buffer(data)?;
        self.copy_buffer_to_image(staging, 0, image)
    }

    fn staging_buffer(&mut self, bytes: &[u8]) -> Result<BufferHandle> {
        let staging = self
            .device
            .create_buffer(BufferDesc::staging(bytes.len() as u64))?;
        self.staging.push(staging);
        self.device.write_buffer(staging, 0, bytes)?;
        Ok(staging)
    }

    // Submission

    /// Submit the recorded commands, ending recording first if needed.
    ///
    /// The frame recorder submits through the frame scheduler. A transient
    /// recorder's command buffer and staging buffers are released once its
    /// work has completed.
    pub fn submit(&mut self, options: &SubmitOptions) -> Result<()> {
        if self.state == RecorderState::Recording {
            self.end()?;
        }
        self.expect_state(RecorderState::Executable, "submit")?;

        // On failure the recorder stays executable and `Drop` releases
        // everything it still owns.
        match self.kind {
            RecorderKind::Frame => {
                let scheduler = &mut self.device.scheduler;
                scheduler.submit(&mut self.device.backend, &[self.cmd], options)?;
                for object in self.take_staging() {
                    self.device.retire(object);
                }
            }
            RecorderKind::Transient { queue, pool } => {
                let fence = self.device.submit_transient(queue, self.cmd, options)?;
                let mut retired = self.take_staging();
                retired.push(RetiredObject::CommandBuffer {
                    pool,
                    buffer: self.cmd,
                });
                self.device.track_transient(fence, retired);
            }
        }
        self.transitions.clear();
        self.state = RecorderState::Submitted;
        Ok(())
    }

    /// Submit and block until the device is idle.
    ///
    /// For one-off setup work only; never inside the frame loop.
    pub fn submit_blocking(&mut self) -> Result<()> {
        if self.kind == RecorderKind::Frame {
            return Err(GpuError::InvalidState(
                "Frame commands are submitted through the frame loop".to_string(),
            ));
        }
        self.submit(&SubmitOptions::new())?;
        self.device.wait_idle()
    }

    /// Hand submitted staging buffers over for release after completion.
    fn take_staging(&mut self) -> Vec<RetiredObject> {
        let mut retired = Vec::with_capacity(self.staging.len() + 1);
        for staging in self.staging.drain(..) {
            if let Ok(buffer) = self.device.buffers.erase(staging) {
                retired.push(RetiredObject::Buffer(buffer.raw));
            }
        }
        retired
    }

    fn prepare_present(&mut self) -> Result<()> {
        let FramePhase::Acquired { .. } = self.device.scheduler.phase() else {
            return Ok(());
        };
        let Some(image) = self.device.current_swapchain_image() else {
            return Ok(());
        };
        if self.device.image_usage(image)? != ImageUsageState::Present {
            self.transition(image, ImageUsageState::Present)?;
        }
        Ok(())
    }

    // State checks

    fn expect_state(&self, expected: RecorderState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(GpuError::InvalidRecorderState {
                operation,
                state: self.state.name(),
            })
        }
    }

    fn expect_recording(&self, operation: &'static str) -> Result<()> {
        self.expect_state(RecorderState::Recording, operation)
    }

    fn expect_outside_pass(&self, operation: &str) -> Result<()> {
        if self.pass.is_some() {
            return Err(GpuError::InvalidState(format!(
                "Cannot {operation} inside a render pass"
            )));
        }
        Ok(())
    }

    fn expect_draw(&self, operation: &'static str) -> Result<()> {
        self.expect_recording(operation)?;
        if self.pass.is_none() {
            return Err(GpuError::InvalidState(format!(
                "Cannot {operation} outside a render pass"
            )));
        }
        match self.program {
            Some(program) if program.bind_point == vk::PipelineBindPoint::GRAPHICS => Ok(()),
            _ => Err(GpuError::InvalidState(format!(
                "Cannot {operation} without a graphics pipeline"
            ))),
        }
    }

    fn bound_program(&self, operation: &str) -> Result<BoundProgram> {
        self.program.ok_or_else(|| {
            GpuError::InvalidState(format!("Cannot {operation} without a bound pipeline"))
        })
    }

    fn buffer_with_usage(&self, buffer: BufferHandle, usage: BufferUsage) -> Result<vk::Buffer> {
        let resource = lookup(&self.device.buffers, buffer, "buffer")?;
        if !resource.desc.usage.contains(usage) {
            return Err(GpuError::InvalidState(format!(
                "Buffer '{}' lacks {usage:?} usage",
                resource.desc.label
            )));
        }
        Ok(resource.raw)
    }
}

impl<B: Backend> Drop for CommandRecorder<'_, B> {
    fn drop(&mut self) {
        if self.state == RecorderState::Submitted {
            return;
        }
        if matches!(
            self.state,
            RecorderState::Recording | RecorderState::Executable
        ) {
            warn!(
                "Command recorder for {:?} dropped while {}; commands discarded",
                self.queue(),
                self.state.name()
            );
        }
        if self.state == RecorderState::Recording {
            if self.pass.take().is_some() {
                self.device.backend.cmd_end_render_pass(self.cmd);
            }
            if let Err(e) = self.device.backend.end_command_buffer(self.cmd) {
                error!("Failed to end discarded command buffer: {e}");
            }
        }
        if let RecorderKind::Transient { pool, .. } = self.kind {
            self.device.backend.free_command_buffer(pool, self.cmd);
        }
        for staging in std::mem::take(&mut self.staging) {
            self.device.destroy_unused_buffer(staging);
        }
        for (image, previous) in self.transitions.drain(..).rev() {
            if let Ok(resource) = self.device.images.get_mut(image) {
                resource.usage = previous;
            }
        }
    }
}
