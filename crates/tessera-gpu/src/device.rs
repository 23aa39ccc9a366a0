//! The device: sole owner of every GPU resource.
//!
//! All resources are created through `Device::create_*` and addressed by
//! generation-checked handles afterwards. Destroying a resource invalidates
//! its handle immediately while the native objects go through deferred
//! deletion, since in-flight frames may still reference them.

use std::ffi::CString;

use ash::vk;
use hashbrown::HashMap;
use tessera_core::{Handle, Pool};
use tracing::{debug, error, info, warn};

use crate::backend::{
    Backend, ComputePipelineRequest, DescriptorResource, DescriptorWrite, FramebufferRequest,
    GraphicsPipelineRequest, NativeImage, QueueKind, ShaderStageRef, SubmitRequest,
};
use crate::capabilities::GpuCapabilities;
use crate::command::CommandRecorder;
use crate::config::DeviceConfig;
use crate::deferred::{DeferredDeletionQueue, RetiredObject};
use crate::descriptor::{
    BindingKind, BindingResource, DescriptorAllocator, DescriptorBindingSet, DescriptorLayout,
    DescriptorLayoutDesc, DescriptorLayoutHandle, DescriptorSetHandle,
};
use crate::error::{GpuError, Result};
use crate::frame::{AcquireOutcome, FramePhase, FrameScheduler, PresentOutcome, SubmitOptions};
use crate::pipeline::{
    LoadOp, PipelineProgram, PipelineProgramHandle, ProgramDesc, ProgramStages, RenderState,
    RenderTarget, RenderTargetHandle, TargetLayout,
};
use crate::resource::{
    is_depth_format, BufferDesc, BufferHandle, BufferResource, ImageDesc, ImageHandle,
    ImageResource, ImageUsage, SamplerDesc, SamplerHandle, SamplerResource, ShaderDesc,
    ShaderHandle, ShaderResource, ShaderStage,
};
use crate::usage::ImageUsageState;

/// Look up `handle`, logging a stale or foreign handle as a fatal error.
pub(crate) fn lookup<'a, T>(pool: &'a Pool<T>, handle: Handle<T>, what: &str) -> Result<&'a T> {
    pool.get(handle).map_err(|e| {
        error!("Invalid {what} handle: {e}");
        GpuError::from(e)
    })
}

/// Mutable [`lookup`].
pub(crate) fn lookup_mut<'a, T>(
    pool: &'a mut Pool<T>,
    handle: Handle<T>,
    what: &str,
) -> Result<&'a mut T> {
    pool.get_mut(handle).map_err(|e| {
        error!("Invalid {what} handle: {e}");
        GpuError::from(e)
    })
}

/// Work submitted outside the frame loop, released once its fence signals.
#[derive(Debug)]
struct TransientSubmission {
    fence: vk::Fence,
    retired: Vec<RetiredObject>,
}

/// Owner of every resource pool, cache, and frame context.
pub struct Device<B: Backend> {
    pub(crate) backend: B,
    config: DeviceConfig,
    pub(crate) buffers: Pool<BufferResource>,
    pub(crate) images: Pool<ImageResource>,
    samplers: Pool<SamplerResource>,
    shaders: Pool<ShaderResource>,
    layouts: Pool<DescriptorLayout>,
    pub(crate) sets: Pool<DescriptorBindingSet>,
    pub(crate) programs: Pool<PipelineProgram>,
    pub(crate) targets: Pool<RenderTarget>,
    descriptors: DescriptorAllocator,
    compatible_passes: HashMap<TargetLayout, vk::RenderPass>,
    transient_pools: HashMap<QueueKind, vk::CommandPool>,
    in_flight: Vec<TransientSubmission>,
    pub(crate) scheduler: FrameScheduler,
    deletion: DeferredDeletionQueue,
    swapchain_images: Vec<ImageHandle>,
}

impl<B: Backend> Device<B> {
    /// Create a device on `backend`.
    ///
    /// Presentable images of the backend's surface, if any, are registered
    /// as external images.
    pub fn new(mut backend: B, config: DeviceConfig) -> Result<Self> {
        let config = config.normalized();
        let frames_in_flight = config.frames_in_flight as usize;
        let scheduler =
            FrameScheduler::new(&mut backend, frames_in_flight, config.fence_timeout_ns)?;

        let mut device = Self {
            backend,
            config,
            buffers: Pool::new(),
            images: Pool::new(),
            samplers: Pool::new(),
            shaders: Pool::new(),
            layouts: Pool::new(),
            sets: Pool::new(),
            programs: Pool::new(),
            targets: Pool::new(),
            descriptors: DescriptorAllocator::new(config.descriptor_pool_sizes()),
            compatible_passes: HashMap::new(),
            transient_pools: HashMap::new(),
            in_flight: Vec::new(),
            scheduler,
            deletion: DeferredDeletionQueue::new(frames_in_flight),
            swapchain_images: Vec::new(),
        };
        device.register_swapchain_images();

        info!(
            "Device ready on {} ({} frames in flight)",
            device.backend.capabilities().summary(),
            frames_in_flight
        );
        Ok(device)
    }

    /// The native backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The native backend, mutably.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Effective configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Properties of the GPU.
    pub fn capabilities(&self) -> &GpuCapabilities {
        self.backend.capabilities()
    }

    /// Frame pacing state.
    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    /// Number of frames presented so far.
    pub fn frame_number(&self) -> u64 {
        self.scheduler.frame_number()
    }

    // Buffers

    /// Create a buffer.
    pub fn create_buffer(&mut self, desc: BufferDesc) -> Result<BufferHandle> {
        if desc.size == 0 {
            return Err(GpuError::AllocationFailed(format!(
                "Buffer '{}' has zero size",
                desc.label
            )));
        }
        let native = self.backend.create_buffer(&desc)?;
        Ok(self.buffers.insert(BufferResource {
            desc,
            raw: native.raw,
            mapped: native.mapped,
        }))
    }

    /// Buffer record behind `handle`.
    pub fn buffer(&self, handle: BufferHandle) -> Result<&BufferResource> {
        lookup(&self.buffers, handle, "buffer")
    }

    /// Write `data` through the mapping of a host-visible buffer.
    ///
    /// The range must not be read by a frame still in flight.
    pub fn write_buffer<T: bytemuck::Pod>(
        &self,
        handle: BufferHandle,
        offset: u64,
        data: &[T],
    ) -> Result<()> {
        let buffer = lookup(&self.buffers, handle, "buffer")?;
        let mapped = buffer.mapped().ok_or_else(|| {
            GpuError::InvalidState(format!(
                "Buffer '{}' is not host-visible",
                buffer.desc.label
            ))
        })?;
        mapped.write(offset, data)
    }

    /// Destroy a buffer.
    pub fn destroy_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        let buffer = self.buffers.erase(handle)?;
        self.retire(RetiredObject::Buffer(buffer.raw));
        Ok(())
    }

    // Images

    /// Create an image with a default full-extent view.
    pub fn create_image(&mut self, desc: ImageDesc) -> Result<ImageHandle> {
        let extent = desc.extent;
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 || desc.mip_levels == 0 {
            return Err(GpuError::AllocationFailed(format!(
                "Image '{}' has an empty extent",
                desc.label
            )));
        }
        if !desc.samples.is_power_of_two() || desc.samples > 64 {
            return Err(GpuError::InvalidState(format!(
                "Unsupported sample count {}",
                desc.samples
            )));
        }
        let native = self.backend.create_image(&desc)?;
        Ok(self.images.insert(ImageResource {
            desc,
            raw: native.raw,
            view: native.view,
            usage: ImageUsageState::Undefined,
            external: false,
        }))
    }

    /// Image record behind `handle`.
    pub fn image(&self, handle: ImageHandle) -> Result<&ImageResource> {
        lookup(&self.images, handle, "image")
    }

    /// Tracked usage of an image.
    pub fn image_usage(&self, handle: ImageHandle) -> Result<ImageUsageState> {
        Ok(self.image(handle)?.usage)
    }

    /// Destroy an image. Swapchain images cannot be destroyed.
    pub fn destroy_image(&mut self, handle: ImageHandle) -> Result<()> {
        if self.image(handle)?.external {
            return Err(GpuError::InvalidState(
                "Swapchain images are owned by the surface".to_string(),
            ));
        }
        let image = self.images.erase(handle)?;
        self.retire(RetiredObject::Image(NativeImage {
            raw: image.raw,
            view: image.view,
        }));
        Ok(())
    }

    // Samplers and shaders

    /// Create a sampler.
    pub fn create_sampler(&mut self, desc: SamplerDesc) -> Result<SamplerHandle> {
        let raw = self.backend.create_sampler(&desc)?;
        Ok(self.samplers.insert(SamplerResource { desc, raw }))
    }

    /// Sampler record behind `handle`.
    pub fn sampler(&self, handle: SamplerHandle) -> Result<&SamplerResource> {
        lookup(&self.samplers, handle, "sampler")
    }

    /// Destroy a sampler.
    pub fn destroy_sampler(&mut self, handle: SamplerHandle) -> Result<()> {
        let sampler = self.samplers.erase(handle)?;
        self.retire(RetiredObject::Sampler(sampler.raw));
        Ok(())
    }

    /// Create a shader module from SPIR-V.
    pub fn create_shader(&mut self, desc: &ShaderDesc<'_>) -> Result<ShaderHandle> {
        let entry_point = CString::new(desc.entry_point)
            .map_err(|e| GpuError::ShaderCreation(format!("Invalid entry point: {e}")))?;
        let raw = self.backend.create_shader_module(desc.code)?;
        Ok(self.shaders.insert(ShaderResource {
            stage: desc.stage,
            raw,
            entry_point,
        }))
    }

    /// Shader record behind `handle`.
    pub fn shader(&self, handle: ShaderHandle) -> Result<&ShaderResource> {
        lookup(&self.shaders, handle, "shader")
    }

    /// Destroy a shader module. Compiled pipelines stay valid.
    pub fn destroy_shader(&mut self, handle: ShaderHandle) -> Result<()> {
        let shader = self.shaders.erase(handle)?;
        self.retire(RetiredObject::ShaderModule(shader.raw));
        Ok(())
    }

    // Descriptors

    /// Create a descriptor layout.
    pub fn create_descriptor_layout(
        &mut self,
        desc: DescriptorLayoutDesc,
    ) -> Result<DescriptorLayoutHandle> {
        let bindings = desc.into_sorted()?;
        let raw = self.backend.create_descriptor_set_layout(&bindings)?;
        Ok(self.layouts.insert(DescriptorLayout { bindings, raw }))
    }

    /// Layout record behind `handle`.
    pub fn descriptor_layout(&self, handle: DescriptorLayoutHandle) -> Result<&DescriptorLayout> {
        lookup(&self.layouts, handle, "descriptor layout")
    }

    /// Destroy a descriptor layout.
    pub fn destroy_descriptor_layout(&mut self, handle: DescriptorLayoutHandle) -> Result<()> {
        let layout = self.layouts.erase(handle)?;
        self.retire(RetiredObject::DescriptorSetLayout(layout.raw));
        Ok(())
    }

    /// Create an empty logical descriptor set for `layout`.
    pub fn create_descriptor_set(
        &mut self,
        layout: DescriptorLayoutHandle,
    ) -> Result<DescriptorSetHandle> {
        let bindings = self.descriptor_layout(layout)?.bindings.clone();
        Ok(self.sets.insert(DescriptorBindingSet::new(layout, bindings)))
    }

    /// Logical descriptor set behind `handle`.
    pub fn descriptor_set(&self, handle: DescriptorSetHandle) -> Result<&DescriptorBindingSet> {
        lookup(&self.sets, handle, "descriptor set")
    }

    /// Destroy a logical descriptor set and every instance realized from it.
    pub fn destroy_descriptor_set(&mut self, handle: DescriptorSetHandle) -> Result<()> {
        let mut set = self.sets.erase(handle)?;
        for retired in set.take_instances() {
            self.retire(retired);
        }
        Ok(())
    }

    /// Stage `resource` at `binding` of `set`.
    pub fn bind_descriptor(
        &mut self,
        set: DescriptorSetHandle,
        binding: u32,
        resource: BindingResource,
    ) -> Result<()> {
        lookup_mut(&mut self.sets, set, "descriptor set")?.bind(binding, resource)
    }

    /// Set the bind-time offset of a dynamic binding of `set`.
    ///
    /// The offset must be a multiple of the device's minimum offset alignment
    /// for the binding kind, and must keep the staged range inside its buffer.
    pub fn set_dynamic_offset(
        &mut self,
        set: DescriptorSetHandle,
        binding: u32,
        offset: u32,
    ) -> Result<()> {
        let logical = lookup(&self.sets, set, "descriptor set")?;
        let limits = self.backend.capabilities();
        let alignment = match logical.binding_kind(binding)? {
            BindingKind::DynamicUniformBuffer => limits.min_uniform_buffer_offset_alignment,
            BindingKind::DynamicStorageBuffer => limits.min_storage_buffer_offset_alignment,
            _ => 1,
        };
        if u64::from(offset) % alignment.max(1) != 0 {
            return Err(GpuError::InvalidBinding(format!(
                "Dynamic offset {offset} of binding {binding} is not a multiple of {alignment}"
            )));
        }
        if let Some(&BindingResource::Buffer {
            buffer,
            offset: base,
            range,
        }) = logical.binding(binding)
        {
            let native = lookup(&self.buffers, buffer, "buffer")?;
            let end = base
                .checked_add(range)
                .and_then(|end| end.checked_add(u64::from(offset)));
            if !end.is_some_and(|end| end <= native.size()) {
                return Err(GpuError::InvalidBinding(format!(
                    "Dynamic offset {offset} moves binding {binding} past the end of buffer '{}'",
                    native.desc.label
                )));
            }
        }
        lookup_mut(&mut self.sets, set, "descriptor set")?.set_dynamic_offset(binding, offset)
    }

    /// Physical descriptor set holding the currently staged bindings of `set`.
    ///
    /// Reuses the instance realized from an identical snapshot if the set's
    /// history still holds one; otherwise allocates and writes a new one.
    pub fn realize_descriptor_set(&mut self, set: DescriptorSetHandle) -> Result<vk::DescriptorSet> {
        let logical = lookup(&self.sets, set, "descriptor set")?;
        let layout = lookup(&self.layouts, logical.layout(), "descriptor layout")?.raw;
        let hash = logical.content_hash()?;

        let mut writes = Vec::new();
        for (slot, resource) in logical.staged() {
            let Some(&resource) = resource else {
                continue;
            };
            let resource = match resource {
                BindingResource::Buffer {
                    buffer,
                    offset,
                    range,
                } => {
                    let native = lookup(&self.buffers, buffer, "buffer")?;
                    let dynamic = logical.dynamic_offset(slot.binding);
                    let in_bounds = if range == vk::WHOLE_SIZE {
                        offset < native.size()
                    } else {
                        offset
                            .checked_add(range)
                            .and_then(|end| end.checked_add(dynamic))
                            .is_some_and(|end| end <= native.size())
                    };
                    if !in_bounds {
                        return Err(GpuError::InvalidBinding(format!(
                            "Binding {} exceeds buffer '{}'",
                            slot.binding, native.desc.label
                        )));
                    }
                    DescriptorResource::Buffer {
                        buffer: native.raw,
                        offset,
                        range,
                    }
                }
                BindingResource::Image { image, sampler } => {
                    let native = lookup(&self.images, image, "image")?;
                    let sampler = match sampler {
                        Some(sampler) => lookup(&self.samplers, sampler, "sampler")?.raw,
                        None => vk::Sampler::null(),
                    };
                    let layout = slot
                        .kind
                        .image_usage()
                        .map_or(vk::ImageLayout::GENERAL, ImageUsageState::layout);
                    DescriptorResource::Image {
                        view: native.view,
                        layout,
                        sampler,
                    }
                }
            };
            writes.push(DescriptorWrite {
                binding: slot.binding,
                kind: slot.kind,
                resource,
            });
        }

        let logical = lookup_mut(&mut self.sets, set, "descriptor set")?;
        if let Some(raw) = logical.find_instance(hash) {
            return Ok(raw);
        }

        let (raw, pool) = self.descriptors.allocate(&mut self.backend, layout)?;
        self.backend.write_descriptor_set(raw, &writes);
        debug!("Realized descriptor set instance {hash:#018x}");

        let limit = self.config.descriptor_history_limit;
        let evicted = lookup_mut(&mut self.sets, set, "descriptor set")?
            .record_instance(hash, raw, pool, limit);
        if let Some(evicted) = evicted {
            warn!("Descriptor set history full ({limit}); evicting least recently used instance");
            self.retire(evicted);
        }
        Ok(raw)
    }

    /// Physical descriptor sets allocated over the device's lifetime.
    pub fn descriptor_sets_allocated(&self) -> usize {
        self.descriptors.allocated_count()
    }

    // Pipelines

    /// Create a pipeline program. Variants are compiled on demand.
    pub fn create_pipeline_program(&mut self, desc: ProgramDesc) -> Result<PipelineProgramHandle> {
        let expect_stage = |handle: ShaderHandle, stage: ShaderStage| -> Result<()> {
            let shader = lookup(&self.shaders, handle, "shader")?;
            if shader.stage == stage {
                Ok(())
            } else {
                Err(GpuError::PipelineCreation(format!(
                    "Expected a {stage:?} shader, got {:?}",
                    shader.stage
                )))
            }
        };
        match desc.stages {
            ProgramStages::Graphics { vertex, fragment } => {
                expect_stage(vertex, ShaderStage::Vertex)?;
                if let Some(fragment) = fragment {
                    expect_stage(fragment, ShaderStage::Fragment)?;
                }
            }
            ProgramStages::Compute { compute } => expect_stage(compute, ShaderStage::Compute)?,
        }

        let set_layouts = desc
            .set_layouts
            .iter()
            .map(|&layout| Ok(lookup(&self.layouts, layout, "descriptor layout")?.raw))
            .collect::<Result<Vec<_>>>()?;

        let max_push = self.backend.capabilities().max_push_constants_size;
        if desc.push_constant_size % 4 != 0 || desc.push_constant_size > max_push {
            return Err(GpuError::PipelineCreation(format!(
                "Push constant size {} must be a multiple of 4 and at most {max_push}",
                desc.push_constant_size
            )));
        }

        let mut program = PipelineProgram::new(desc, vk::PipelineLayout::null());
        let push_constants = (program.desc.push_constant_size > 0).then(|| vk::PushConstantRange {
            stage_flags: program.push_constant_stages,
            offset: 0,
            size: program.desc.push_constant_size,
        });
        program.layout = self
            .backend
            .create_pipeline_layout(&set_layouts, push_constants)?;
        Ok(self.programs.insert(program))
    }

    /// Program record behind `handle`.
    pub fn program(&self, handle: PipelineProgramHandle) -> Result<&PipelineProgram> {
        lookup(&self.programs, handle, "pipeline program")
    }

    /// Destroy a program and every compiled variant.
    pub fn destroy_pipeline_program(&mut self, handle: PipelineProgramHandle) -> Result<()> {
        let mut program = self.programs.erase(handle)?;
        for retired in program.take_native() {
            self.retire(retired);
        }
        Ok(())
    }

    /// Graphics pipeline of `program` for `state`, rendering into `targets`.
    ///
    /// Equal states and layouts return the identical cached pipeline.
    pub fn compile_pipeline(
        &mut self,
        handle: PipelineProgramHandle,
        state: &RenderState,
        targets: &TargetLayout,
    ) -> Result<vk::Pipeline> {
        let program = lookup_mut(&mut self.programs, handle, "pipeline program")?;
        if program.is_compute() {
            return Err(GpuError::PipelineCreation(
                "Compute programs have no render state".to_string(),
            ));
        }
        if let Some(pipeline) = program.find_variant(state, targets) {
            return Ok(pipeline);
        }

        let render_pass = self.compatible_pass(targets)?;
        let program = lookup(&self.programs, handle, "pipeline program")?;
        let ProgramStages::Graphics { vertex, fragment } = program.desc.stages else {
            return Err(GpuError::PipelineCreation(
                "Compute programs have no render state".to_string(),
            ));
        };

        let mut stages = Vec::with_capacity(2);
        for shader in std::iter::once(vertex).chain(fragment) {
            let shader = lookup(&self.shaders, shader, "shader")?;
            stages.push(ShaderStageRef {
                stage: shader.stage,
                module: shader.raw,
                entry_point: &shader.entry_point,
            });
        }

        let pipeline = self
            .backend
            .create_graphics_pipeline(&GraphicsPipelineRequest {
                layout: program.layout,
                stages: &stages,
                vertex_layout: &program.desc.vertex_layout,
                state: *state,
                targets,
                render_pass,
            })
            .inspect_err(|e| error!("Graphics pipeline creation failed: {e}"))?;
        debug!("Compiled pipeline variant {:#010x}", state.pack());

        let limit = self.config.pipeline_variant_limit;
        let evicted = lookup_mut(&mut self.programs, handle, "pipeline program")?
            .record_variant(state, targets, pipeline, limit);
        if let Some(evicted) = evicted {
            warn!("Pipeline variant limit ({limit}) reached; evicting least recently used variant");
            self.retire(evicted);
        }
        Ok(pipeline)
    }

    /// Compute pipeline of `program`, compiled once.
    pub fn compile_compute_pipeline(&mut self, handle: PipelineProgramHandle) -> Result<vk::Pipeline> {
        let state = RenderState::default();
        let targets = TargetLayout::new(Vec::new(), None);

        let program = lookup_mut(&mut self.programs, handle, "pipeline program")?;
        let ProgramStages::Compute { compute } = program.desc.stages else {
            return Err(GpuError::PipelineCreation(
                "Graphics programs need a render state".to_string(),
            ));
        };
        if let Some(pipeline) = program.find_variant(&state, &targets) {
            return Ok(pipeline);
        }
        let layout = program.layout;

        let shader = lookup(&self.shaders, compute, "shader")?;
        let pipeline = self
            .backend
            .create_compute_pipeline(&ComputePipelineRequest {
                layout,
                stage: ShaderStageRef {
                    stage: shader.stage,
                    module: shader.raw,
                    entry_point: &shader.entry_point,
                },
            })
            .inspect_err(|e| error!("Compute pipeline creation failed: {e}"))?;
        debug!("Compiled compute pipeline");

        // A single variant never reaches the limit.
        lookup_mut(&mut self.programs, handle, "pipeline program")?
            .record_variant(&state, &targets, pipeline, usize::MAX);
        Ok(pipeline)
    }

    /// A render pass compatible with every pass rendering into `targets`.
    fn compatible_pass(&mut self, targets: &TargetLayout) -> Result<vk::RenderPass> {
        if let Some(&pass) = self.compatible_passes.get(targets) {
            return Ok(pass);
        }
        let load_ops = vec![LoadOp::DontCare; targets.attachment_count()];
        let pass = self
            .backend
            .create_render_pass(&targets.render_pass_request(&load_ops))?;
        self.compatible_passes.insert(targets.clone(), pass);
        Ok(pass)
    }

    // Render targets

    /// Group images into a render target. All attachments must share an extent.
    pub fn create_render_target(
        &mut self,
        colors: &[ImageHandle],
        depth: Option<ImageHandle>,
    ) -> Result<RenderTargetHandle> {
        if colors.is_empty() && depth.is_none() {
            return Err(GpuError::InvalidState(
                "Render target needs at least one attachment".to_string(),
            ));
        }

        let mut extent = None;
        let mut samples = None;
        let mut check = |image: &ImageResource| -> Result<()> {
            let size = vk::Extent2D {
                width: image.desc.extent.width,
                height: image.desc.extent.height,
            };
            if *extent.get_or_insert(size) != size
                || *samples.get_or_insert(image.desc.samples) != image.desc.samples
            {
                return Err(GpuError::InvalidState(format!(
                    "Attachment '{}' does not match the render target",
                    image.desc.label
                )));
            }
            Ok(())
        };

        let mut color_formats = Vec::with_capacity(colors.len());
        for &color in colors {
            let image = lookup(&self.images, color, "image")?;
            if !image.desc.usage.contains(ImageUsage::COLOR_TARGET) {
                return Err(GpuError::InvalidState(format!(
                    "Image '{}' is not usable as a color target",
                    image.desc.label
                )));
            }
            check(image)?;
            color_formats.push(image.desc.format);
        }

        let depth_format = match depth {
            Some(depth) => {
                let image = lookup(&self.images, depth, "image")?;
                if !image.desc.usage.contains(ImageUsage::DEPTH_TARGET)
                    || !is_depth_format(image.desc.format)
                {
                    return Err(GpuError::InvalidState(format!(
                        "Image '{}' is not usable as a depth target",
                        image.desc.label
                    )));
                }
                check(image)?;
                Some(image.desc.format)
            }
            None => None,
        };

        let (Some(extent), Some(samples)) = (extent, samples) else {
            return Err(GpuError::InvalidState(
                "Render target needs at least one attachment".to_string(),
            ));
        };
        let layout = TargetLayout {
            color_formats,
            depth_format,
            samples,
        };
        Ok(self
            .targets
            .insert(RenderTarget::new(colors.to_vec(), depth, extent, layout)))
    }

    /// Render target record behind `handle`.
    pub fn render_target(&self, handle: RenderTargetHandle) -> Result<&RenderTarget> {
        lookup(&self.targets, handle, "render target")
    }

    /// Destroy a render target with its framebuffer and passes. The images stay.
    pub fn destroy_render_target(&mut self, handle: RenderTargetHandle) -> Result<()> {
        let mut target = self.targets.erase(handle)?;
        for retired in target.take_native() {
            self.retire(retired);
        }
        Ok(())
    }

    /// Render pass of `target` for the exact sequence of `load_ops`, colors
    /// first then depth.
    ///
    /// Each distinct sequence builds its own pass once; all of them share
    /// the target's framebuffer.
    pub fn get_or_create_render_target_pass(
        &mut self,
        handle: RenderTargetHandle,
        load_ops: &[LoadOp],
    ) -> Result<vk::RenderPass> {
        let target = lookup(&self.targets, handle, "render target")?;
        if load_ops.len() != target.layout.attachment_count() {
            return Err(GpuError::InvalidState(format!(
                "Render target has {} attachments, got {} load ops",
                target.layout.attachment_count(),
                load_ops.len()
            )));
        }
        if let Some(pass) = target.find_pass(load_ops) {
            return Ok(pass);
        }

        let request = target.layout.render_pass_request(load_ops);
        let views = target
            .attachments()
            .map(|image| Ok(lookup(&self.images, image, "image")?.view))
            .collect::<Result<Vec<_>>>()?;
        let extent = target.extent;
        let has_framebuffer = target.framebuffer.is_some();

        let pass = self.backend.create_render_pass(&request)?;
        debug!("Created render pass for load ops {load_ops:?}");
        let target = lookup_mut(&mut self.targets, handle, "render target")?;
        target.record_pass(load_ops, pass);

        if !has_framebuffer {
            let framebuffer = self.backend.create_framebuffer(&FramebufferRequest {
                render_pass: pass,
                attachments: views,
                extent,
            })?;
            target.framebuffer = Some(framebuffer);
        }
        Ok(pass)
    }

    // Command recording

    /// Recorder for one-off graphics work outside the frame loop.
    pub fn get_graphics_command(&mut self) -> Result<CommandRecorder<'_, B>> {
        self.transient_command(QueueKind::Graphics)
    }

    /// Recorder for one-off compute work.
    pub fn get_compute_command(&mut self) -> Result<CommandRecorder<'_, B>> {
        self.transient_command(QueueKind::Compute)
    }

    /// Recorder for uploads and copies.
    pub fn get_transfer_command(&mut self) -> Result<CommandRecorder<'_, B>> {
        self.transient_command(QueueKind::Transfer)
    }

    /// Recorder for the current frame's command buffer.
    ///
    /// Only available between a successful `acquire_frame` and the frame's
    /// submission.
    pub fn frame_command(&mut self) -> Result<CommandRecorder<'_, B>> {
        let FramePhase::Acquired { .. } = self.scheduler.phase() else {
            return Err(GpuError::InvalidState(format!(
                "No frame to record in phase {:?}",
                self.scheduler.phase()
            )));
        };
        let cmd = self.scheduler.current().command_buffer();
        Ok(CommandRecorder::for_frame(self, cmd))
    }

    fn transient_command(&mut self, queue: QueueKind) -> Result<CommandRecorder<'_, B>> {
        let pool = match self.transient_pools.get(&queue) {
            Some(&pool) => pool,
            None => {
                let pool = self.backend.create_command_pool(queue)?;
                self.transient_pools.insert(queue, pool);
                pool
            }
        };
        let cmd = self.backend.allocate_command_buffer(pool)?;
        Ok(CommandRecorder::transient(self, queue, pool, cmd))
    }

    /// Submit a transient command buffer, returning the fence it signals.
    pub(crate) fn submit_transient(
        &mut self,
        queue: QueueKind,
        cmd: vk::CommandBuffer,
        options: &SubmitOptions,
    ) -> Result<vk::Fence> {
        let fence = self.backend.create_fence(false)?;
        let submitted = self.backend.submit(&SubmitRequest {
            queue,
            command_buffers: &[cmd],
            wait: &options.wait,
            signal: &options.signal,
            fence,
        });
        if let Err(e) = submitted {
            self.backend.destroy_fence(fence);
            error!("Submission to {queue:?} queue failed: {e}");
            return Err(e);
        }
        Ok(fence)
    }

    /// Release `retired` once `fence` signals.
    pub(crate) fn track_transient(&mut self, fence: vk::Fence, retired: Vec<RetiredObject>) {
        self.in_flight.push(TransientSubmission { fence, retired });
    }

    /// Destroy a staging buffer whose commands were never executed.
    pub(crate) fn destroy_unused_buffer(&mut self, handle: BufferHandle) {
        if let Ok(buffer) = self.buffers.erase(handle) {
            self.backend.destroy_buffer(buffer.raw);
        }
    }

    /// Queue a native object for destruction once in-flight frames retire.
    pub(crate) fn retire(&mut self, object: RetiredObject) {
        self.deletion.queue(object, self.scheduler.frame_number());
    }

    // Frames

    /// Wait for the current frame context to retire and acquire the next
    /// presentable image.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn acquire_frame(&mut self) -> Result<AcquireOutcome> {
        let outcome = self.scheduler.acquire(&mut self.backend)?;
        self.collect_garbage()?;
        Ok(outcome)
    }

    /// Present the frame submitted through the frame recorder.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn present_frame(&mut self) -> Result<PresentOutcome> {
        self.scheduler.present(&mut self.backend)
    }

    /// Swapchain images, indexed by acquired image index.
    pub fn swapchain_images(&self) -> &[ImageHandle] {
        &self.swapchain_images
    }

    /// Swapchain image acquired for the current frame.
    pub fn current_swapchain_image(&self) -> Option<ImageHandle> {
        match self.scheduler.phase() {
            FramePhase::Acquired { image_index } | FramePhase::Submitted { image_index } => {
                self.swapchain_images.get(image_index as usize).copied()
            }
            FramePhase::Idle => None,
        }
    }

    /// Size of the presentable images.
    pub fn swapchain_extent(&self) -> Option<vk::Extent2D> {
        self.backend.swapchain().map(|swapchain| swapchain.extent)
    }

    /// Recreate the swapchain for a new drawable size.
    ///
    /// Waits for the device to go idle, re-registers the presentable images,
    /// and resets frame synchronization. Render targets built on the old
    /// swapchain images must be recreated by the caller.
    pub fn rebuild_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        self.wait_idle()?;
        self.backend
            .recreate_swapchain(width, height)
            .inspect_err(|e| error!("Swapchain recreation failed: {e}"))?;

        for handle in std::mem::take(&mut self.swapchain_images) {
            // External images have no native objects of ours to retire.
            let _ = self.images.erase(handle);
        }
        self.register_swapchain_images();
        self.scheduler.reset_sync(&mut self.backend)?;

        info!("Swapchain rebuilt at {width}x{height}");
        Ok(())
    }

    /// Block until the GPU is idle and release everything pending deletion.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&mut self) -> Result<()> {
        self.backend.wait_idle()?;
        for submission in std::mem::take(&mut self.in_flight) {
            self.release_submission(submission);
        }
        let backend = &mut self.backend;
        self.deletion.flush(|object| object.destroy(backend));
        Ok(())
    }

    /// Release retired objects no in-flight work can still reference.
    ///
    /// Called by `acquire_frame`; returns the number of objects released.
    pub fn collect_garbage(&mut self) -> Result<usize> {
        let mut released = 0;
        let mut pending = Vec::with_capacity(self.in_flight.len());
        for submission in std::mem::take(&mut self.in_flight) {
            if self.backend.fence_signaled(submission.fence)? {
                released += submission.retired.len();
                self.release_submission(submission);
            } else {
                pending.push(submission);
            }
        }
        self.in_flight = pending;

        let backend = &mut self.backend;
        released += self
            .deletion
            .process(self.scheduler.frame_number(), |object| object.destroy(backend));
        Ok(released)
    }

    /// Native objects waiting for deferred destruction.
    pub fn pending_deletions(&self) -> usize {
        self.deletion.pending_count()
            + self
                .in_flight
                .iter()
                .map(|submission| submission.retired.len())
                .sum::<usize>()
    }

    fn release_submission(&mut self, submission: TransientSubmission) {
        for object in submission.retired {
            object.destroy(&mut self.backend);
        }
        self.backend.destroy_fence(submission.fence);
    }

    fn register_swapchain_images(&mut self) {
        let Some(swapchain) = self.backend.swapchain() else {
            return;
        };
        let extent = swapchain.extent;
        self.swapchain_images = swapchain
            .images
            .iter()
            .map(|native| {
                self.images.insert(ImageResource {
                    desc: ImageDesc::new_2d(
                        extent.width,
                        extent.height,
                        swapchain.format,
                        ImageUsage::COLOR_TARGET | ImageUsage::TRANSFER_DST,
                    )
                    .with_label("swapchain"),
                    raw: native.raw,
                    view: native.view,
                    usage: ImageUsageState::Undefined,
                    external: true,
                })
            })
            .collect();
        debug!(
            "Registered {} swapchain images at {}x{}",
            self.swapchain_images.len(),
            extent.width,
            extent.height
        );
    }

    fn report_leaks(&self) {
        let external = self.swapchain_images.len();
        let leaks = [
            ("buffers", self.buffers.len()),
            ("images", self.images.len().saturating_sub(external)),
            ("samplers", self.samplers.len()),
            ("shaders", self.shaders.len()),
            ("descriptor layouts", self.layouts.len()),
            ("descriptor sets", self.sets.len()),
            ("pipeline programs", self.programs.len()),
            ("render targets", self.targets.len()),
        ];
        for (kind, count) in leaks {
            if count > 0 {
                warn!("{count} {kind} still alive at device shutdown");
            }
        }
    }
}

impl<B: Backend> Drop for Device<B> {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            error!("Failed to idle device during shutdown: {e}");
        }
        self.report_leaks();

        let backend = &mut self.backend;
        for buffer in self.buffers.drain() {
            backend.destroy_buffer(buffer.raw);
        }
        for image in self.images.drain() {
            if !image.external {
                backend.destroy_image(NativeImage {
                    raw: image.raw,
                    view: image.view,
                });
            }
        }
        for sampler in self.samplers.drain() {
            backend.destroy_sampler(sampler.raw);
        }
        for shader in self.shaders.drain() {
            backend.destroy_shader_module(shader.raw);
        }
        // Realized sets go away with their pools.
        drop(self.sets.drain());
        for mut program in self.programs.drain() {
            for object in program.take_native() {
                object.destroy(backend);
            }
        }
        for mut target in self.targets.drain() {
            for object in target.take_native() {
                object.destroy(backend);
            }
        }
        for layout in self.layouts.drain() {
            backend.destroy_descriptor_set_layout(layout.raw);
        }
        for (_, pass) in self.compatible_passes.drain() {
            backend.destroy_render_pass(pass);
        }
        self.descriptors.destroy(backend);
        for (_, pool) in self.transient_pools.drain() {
            backend.destroy_command_pool(pool);
        }
        self.scheduler.destroy(backend);
        info!("Device destroyed");
    }
}
