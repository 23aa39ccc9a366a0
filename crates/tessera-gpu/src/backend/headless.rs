//! CPU-side backend for tests and GPU-less tooling.
//!
//! Buffers and images live in host memory. Commands are recorded into a log
//! per command buffer; on submit, copies are executed against host memory
//! and every command is appended to the submission log. Fences either
//! complete at submit ([`CompletionMode::Immediate`]) or wait until signaled
//! through a [`FenceSignaler`], which may live on another thread. Misuse the
//! GPU would not catch eagerly (waiting on an unsignaled semaphore, submitting
//! with a signaled fence, double destruction) is reported as an error or
//! collected in [`HeadlessBackend::validation_errors`].

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use ash::vk::Handle as _;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use super::{
    AcquireStatus, Backend, ComputePipelineRequest, DescriptorPoolSizes, DescriptorWrite,
    FramebufferRequest, GraphicsPipelineRequest, NativeBuffer, NativeImage, PresentStatus,
    QueueKind, RenderPassRequest, SubmitRequest, SwapchainInfo,
};
use crate::capabilities::GpuCapabilities;
use crate::descriptor::LayoutBinding;
use crate::error::{GpuError, Result};
use crate::resource::{
    texel_block_size, BufferDesc, ImageDesc, ImageUsage, MappedMemory, SamplerDesc,
};

/// When submitted work completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Fences signal as part of the submission.
    #[default]
    Immediate,
    /// Fences stay pending until signaled explicitly or the device idles.
    Manual,
}

/// An image layout transition as recorded in a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_access: vk::AccessFlags2,
}

/// One recorded command.
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    PipelineBarrier {
        images: Vec<ImageTransition>,
        buffers: Vec<vk::Buffer>,
    },
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSet {
        set_index: u32,
        set: vk::DescriptorSet,
        dynamic_offsets: Vec<u32>,
    },
    BindVertexBuffer {
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    },
    PushConstants {
        offset: u32,
        data: Vec<u8>,
    },
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    BeginRenderPass {
        pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: usize,
    },
    EndRenderPass,
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
}

/// Object counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    /// Objects created and not yet destroyed, swapchain images excluded.
    pub live_objects: usize,
    pub buffers_created: usize,
    pub images_created: usize,
    pub descriptor_pools_created: usize,
    pub descriptor_sets_allocated: usize,
    pub descriptor_sets_freed: usize,
    pub descriptor_writes: usize,
    pub pipelines_created: usize,
    pub render_passes_created: usize,
    pub framebuffers_created: usize,
    pub submissions: usize,
    pub presents: usize,
}

#[derive(Debug)]
struct FenceState {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl FenceState {
    fn new(signaled: bool) -> Self {
        Self {
            signaled: Mutex::new(signaled),
            condvar: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.signaled.lock() = true;
        self.condvar.notify_all();
    }

    fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }
}

/// Completes a pending fence, possibly from another thread.
#[derive(Debug, Clone)]
pub struct FenceSignaler(Arc<FenceState>);

impl FenceSignaler {
    /// Signal the fence and wake every waiter.
    pub fn signal(&self) {
        self.0.signal();
    }

    /// Returns `true` once the fence is signaled.
    pub fn is_signaled(&self) -> bool {
        self.0.is_signaled()
    }
}

/// Heap bytes addressed only through a raw pointer, so mapped views and
/// copies never alias a Rust reference.
#[derive(Debug)]
struct HostAllocation {
    ptr: NonNull<u8>,
    len: usize,
}

impl HostAllocation {
    fn zeroed(len: usize) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(boxed)).cast::<u8>();
        Self { ptr, len }
    }

    fn range(&self, offset: u64, len: u64) -> Option<*mut u8> {
        let end = offset.checked_add(len)?;
        if end > self.len as u64 {
            return None;
        }
        // SAFETY: offset is within the allocation.
        Some(unsafe { self.ptr.as_ptr().add(offset as usize) })
    }

    fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        // SAFETY: `out` has exactly `len` bytes and does not overlap the allocation.
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), out.as_mut_ptr(), self.len) };
        out
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // SAFETY: the pointer came from `Box::leak` of a slice of this length.
        unsafe { drop(Box::from_raw(slice)) };
    }
}

#[derive(Debug)]
struct HostImage {
    memory: HostAllocation,
    extent: vk::Extent3D,
    texel_size: u64,
    view: vk::ImageView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    Sampler,
    ShaderModule,
    DescriptorSetLayout,
    PipelineLayout,
    Pipeline,
    RenderPass,
    Framebuffer,
    Semaphore,
}

#[derive(Debug)]
struct DescriptorPoolState {
    remaining: u32,
    sets: Vec<u64>,
}

#[derive(Debug)]
struct CommandBufferState {
    pool: u64,
    recording: bool,
    commands: Vec<RecordedCommand>,
}

#[derive(Debug)]
struct VirtualSwapchain {
    format: vk::Format,
    extent: vk::Extent2D,
    image_count: u32,
    images: Vec<NativeImage>,
    next_image: u32,
    acquired: Vec<bool>,
    fail_acquire: bool,
    present_result: Option<PresentStatus>,
}

/// CPU-side [`Backend`].
#[derive(Debug)]
pub struct HeadlessBackend {
    capabilities: GpuCapabilities,
    completion: CompletionMode,
    next_id: u64,
    buffers: HashMap<u64, HostAllocation>,
    images: HashMap<u64, HostImage>,
    objects: HashMap<u64, ObjectKind>,
    descriptor_pools: HashMap<u64, DescriptorPoolState>,
    descriptor_contents: HashMap<u64, Vec<DescriptorWrite>>,
    command_pools: HashMap<u64, QueueKind>,
    command_buffers: HashMap<u64, CommandBufferState>,
    fences: HashMap<u64, Arc<FenceState>>,
    pending_fences: Vec<vk::Fence>,
    semaphores: HashMap<u64, bool>,
    swapchain: Option<VirtualSwapchain>,
    submitted: Vec<RecordedCommand>,
    validation_errors: Vec<String>,
    fail_submit: bool,
    stats: HeadlessStats,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    /// Backend without a surface whose fences complete at submit.
    pub fn new() -> Self {
        Self {
            capabilities: GpuCapabilities::headless(),
            completion: CompletionMode::Immediate,
            next_id: 1,
            buffers: HashMap::new(),
            images: HashMap::new(),
            objects: HashMap::new(),
            descriptor_pools: HashMap::new(),
            descriptor_contents: HashMap::new(),
            command_pools: HashMap::new(),
            command_buffers: HashMap::new(),
            fences: HashMap::new(),
            pending_fences: Vec::new(),
            semaphores: HashMap::new(),
            swapchain: None,
            submitted: Vec::new(),
            validation_errors: Vec::new(),
            fail_submit: false,
            stats: HeadlessStats::default(),
        }
    }

    /// Set when submitted work completes.
    #[must_use]
    pub fn with_completion(mut self, completion: CompletionMode) -> Self {
        self.completion = completion;
        self
    }

    /// Attach a virtual surface with `image_count` presentable images.
    #[must_use]
    pub fn with_swapchain(mut self, width: u32, height: u32, image_count: u32) -> Self {
        let mut swapchain = VirtualSwapchain {
            format: vk::Format::B8G8R8A8_SRGB,
            extent: vk::Extent2D { width, height },
            image_count: image_count.max(1),
            images: Vec::new(),
            next_image: 0,
            acquired: Vec::new(),
            fail_acquire: false,
            present_result: None,
        };
        self.populate_swapchain(&mut swapchain);
        self.swapchain = Some(swapchain);
        self
    }

    /// Change when subsequently submitted work completes.
    pub fn set_completion(&mut self, completion: CompletionMode) {
        self.completion = completion;
    }

    /// Object counters.
    pub fn stats(&self) -> HeadlessStats {
        self.stats
    }

    /// Every command submitted so far, in submission order.
    pub fn submitted_commands(&self) -> &[RecordedCommand] {
        &self.submitted
    }

    /// Forget the submission log.
    pub fn clear_submitted(&mut self) {
        self.submitted.clear();
    }

    /// Commands recorded into `buffer` since it was last begun.
    pub fn recorded_commands(&self, buffer: vk::CommandBuffer) -> Option<&[RecordedCommand]> {
        self.command_buffers
            .get(&buffer.as_raw())
            .map(|state| state.commands.as_slice())
    }

    /// Misuse detected by the backend.
    pub fn validation_errors(&self) -> &[String] {
        &self.validation_errors
    }

    /// Fences submitted but not yet signaled.
    pub fn pending_fences(&self) -> Vec<vk::Fence> {
        self.pending_fences
            .iter()
            .copied()
            .filter(|fence| !self.is_fence_signaled(*fence))
            .collect()
    }

    /// Returns `true` if `fence` exists and is signaled.
    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.fences
            .get(&fence.as_raw())
            .is_some_and(|state| state.is_signaled())
    }

    /// A signaler for `fence` that can be moved to another thread.
    pub fn fence_signaler(&self, fence: vk::Fence) -> Option<FenceSignaler> {
        self.fences
            .get(&fence.as_raw())
            .map(|state| FenceSignaler(Arc::clone(state)))
    }

    /// Signal every pending fence, as if the GPU caught up.
    pub fn complete_pending(&mut self) {
        for fence in self.pending_fences.drain(..) {
            if let Some(state) = self.fences.get(&fence.as_raw()) {
                state.signal();
            }
        }
    }

    /// Contents of a buffer.
    pub fn read_buffer(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.buffers.get(&buffer.as_raw()).map(HostAllocation::to_vec)
    }

    /// Contents of the base level of an image, tightly packed.
    pub fn read_image(&self, image: vk::Image) -> Option<Vec<u8>> {
        self.images
            .get(&image.as_raw())
            .map(|image| image.memory.to_vec())
    }

    /// Last writes applied to a descriptor set.
    pub fn descriptor_writes(&self, set: vk::DescriptorSet) -> Option<&[DescriptorWrite]> {
        self.descriptor_contents
            .get(&set.as_raw())
            .map(Vec::as_slice)
    }

    /// Make the next queue submission fail with a lost device.
    pub fn fail_next_submit(&mut self) {
        self.fail_submit = true;
    }

    /// Make the next acquire report an out-of-date surface.
    pub fn fail_next_acquire(&mut self) {
        if let Some(swapchain) = &mut self.swapchain {
            swapchain.fail_acquire = true;
        }
    }

    /// Make the next present report `status` instead of [`PresentStatus::Presented`].
    pub fn inject_present_status(&mut self, status: PresentStatus) {
        if let Some(swapchain) = &mut self.swapchain {
            swapchain.present_result = Some(status);
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn create_object(&mut self, kind: ObjectKind) -> u64 {
        let id = self.allocate_id();
        self.objects.insert(id, kind);
        self.stats.live_objects += 1;
        id
    }

    fn destroy_object(&mut self, id: u64, kind: ObjectKind) {
        match self.objects.remove(&id) {
            Some(found) if found == kind => self.stats.live_objects -= 1,
            Some(found) => {
                self.objects.insert(id, found);
                self.report(format!("Destroying {found:?} {id:#x} as {kind:?}"));
            }
            None => self.report(format!("Destroying unknown {kind:?} {id:#x}")),
        }
    }

    fn report(&mut self, message: String) {
        warn!("Headless validation: {message}");
        self.validation_errors.push(message);
    }

    fn host_image(&mut self, desc: &ImageDesc) -> NativeImage {
        let texel_size = u64::from(texel_block_size(desc.format).unwrap_or(4));
        let len = u64::from(desc.extent.width)
            * u64::from(desc.extent.height)
            * u64::from(desc.extent.depth)
            * texel_size;
        let raw = vk::Image::from_raw(self.allocate_id());
        let view = vk::ImageView::from_raw(self.allocate_id());
        self.images.insert(
            raw.as_raw(),
            HostImage {
                memory: HostAllocation::zeroed(len as usize),
                extent: desc.extent,
                texel_size,
                view,
            },
        );
        NativeImage { raw, view }
    }

    fn populate_swapchain(&mut self, swapchain: &mut VirtualSwapchain) {
        for image in swapchain.images.drain(..) {
            self.images.remove(&image.raw.as_raw());
        }
        let desc = ImageDesc::new_2d(
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.format,
            ImageUsage::COLOR_TARGET | ImageUsage::TRANSFER_DST,
        );
        swapchain.images = (0..swapchain.image_count)
            .map(|_| self.host_image(&desc))
            .collect();
        swapchain.acquired = vec![false; swapchain.image_count as usize];
        swapchain.next_image = 0;
    }

    fn recording(&mut self, cmd: vk::CommandBuffer) -> Option<&mut Vec<RecordedCommand>> {
        match self.command_buffers.get(&cmd.as_raw()).map(|state| state.recording) {
            Some(true) => self
                .command_buffers
                .get_mut(&cmd.as_raw())
                .map(|state| &mut state.commands),
            Some(false) => {
                self.report(format!("Recording into {cmd:?} outside begin/end"));
                None
            }
            None => {
                self.report(format!("Recording into unknown command buffer {cmd:?}"));
                None
            }
        }
    }

    fn record(&mut self, cmd: vk::CommandBuffer, command: RecordedCommand) {
        if let Some(commands) = self.recording(cmd) {
            commands.push(command);
        }
    }

    fn execute(&self, command: &RecordedCommand) -> Result<()> {
        match command {
            RecordedCommand::CopyBuffer { src, dst, regions } => {
                let src = self.buffer_memory(*src)?;
                let dst = self.buffer_memory(*dst)?;
                for region in regions {
                    let from = src
                        .range(region.src_offset, region.size)
                        .ok_or_else(|| out_of_bounds("copy source"))?;
                    let to = dst
                        .range(region.dst_offset, region.size)
                        .ok_or_else(|| out_of_bounds("copy destination"))?;
                    // SAFETY: both ranges were bounds-checked; `copy` tolerates overlap.
                    unsafe { std::ptr::copy(from, to, region.size as usize) };
                }
                Ok(())
            }
            RecordedCommand::CopyBufferToImage {
                src,
                dst,
                layout,
                regions,
            } => {
                if *layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL
                    && *layout != vk::ImageLayout::GENERAL
                {
                    return Err(GpuError::InvalidState(format!(
                        "Copy into image in layout {layout:?}"
                    )));
                }
                let src = self.buffer_memory(*src)?;
                let image = self
                    .images
                    .get(&dst.as_raw())
                    .ok_or_else(|| GpuError::InvalidState(format!("Unknown image {dst:?}")))?;
                for region in regions {
                    copy_region_to_image(src, image, region)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn buffer_memory(&self, buffer: vk::Buffer) -> Result<&HostAllocation> {
        self.buffers
            .get(&buffer.as_raw())
            .ok_or_else(|| GpuError::InvalidState(format!("Unknown buffer {buffer:?}")))
    }

    fn consume_semaphore(&mut self, semaphore: vk::Semaphore) -> Result<()> {
        match self.semaphores.get_mut(&semaphore.as_raw()) {
            Some(signaled) if *signaled => {
                *signaled = false;
                Ok(())
            }
            Some(_) => Err(GpuError::InvalidState(format!(
                "Waiting on unsignaled semaphore {semaphore:?}"
            ))),
            None => Err(GpuError::InvalidState(format!(
                "Waiting on unknown semaphore {semaphore:?}"
            ))),
        }
    }

    fn signal_semaphore(&mut self, semaphore: vk::Semaphore) -> Result<()> {
        let signaled = self
            .semaphores
            .get_mut(&semaphore.as_raw())
            .ok_or_else(|| {
                GpuError::InvalidState(format!("Signaling unknown semaphore {semaphore:?}"))
            })?;
        *signaled = true;
        Ok(())
    }
}

fn out_of_bounds(what: &str) -> GpuError {
    GpuError::InvalidState(format!("{what} range out of bounds"))
}

fn copy_region_to_image(
    src: &HostAllocation,
    image: &HostImage,
    region: &vk::BufferImageCopy,
) -> Result<()> {
    if region.image_subresource.mip_level != 0 {
        trace!("Headless copy skips mip level {}", region.image_subresource.mip_level);
        return Ok(());
    }
    let texel = image.texel_size;
    let extent = region.image_extent;
    let offset = region.image_offset;
    let row_texels = if region.buffer_row_length == 0 {
        u64::from(extent.width)
    } else {
        u64::from(region.buffer_row_length)
    };
    let image_rows = if region.buffer_image_height == 0 {
        u64::from(extent.height)
    } else {
        u64::from(region.buffer_image_height)
    };

    if offset.x < 0
        || offset.y < 0
        || offset.z < 0
        || offset.x as u32 + extent.width > image.extent.width
        || offset.y as u32 + extent.height > image.extent.height
        || offset.z as u32 + extent.depth > image.extent.depth
    {
        return Err(out_of_bounds("image copy"));
    }

    let row_bytes = u64::from(extent.width) * texel;
    for z in 0..u64::from(extent.depth) {
        for y in 0..u64::from(extent.height) {
            let src_offset = region.buffer_offset + (z * image_rows + y) * row_texels * texel;
            let dst_texel = ((z + offset.z as u64) * u64::from(image.extent.height)
                + (y + offset.y as u64))
                * u64::from(image.extent.width)
                + offset.x as u64;
            let from = src
                .range(src_offset, row_bytes)
                .ok_or_else(|| out_of_bounds("image copy source"))?;
            let to = image
                .memory
                .range(dst_texel * texel, row_bytes)
                .ok_or_else(|| out_of_bounds("image copy destination"))?;
            // SAFETY: both ranges were bounds-checked and belong to different allocations.
            unsafe { std::ptr::copy_nonoverlapping(from, to, row_bytes as usize) };
        }
    }
    Ok(())
}

impl Backend for HeadlessBackend {
    fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<NativeBuffer> {
        if desc.size == 0 {
            return Err(GpuError::AllocationFailed("Zero-sized buffer".to_string()));
        }
        let len = usize::try_from(desc.size)
            .map_err(|_| GpuError::AllocationFailed(format!("Buffer too large: {}", desc.size)))?;
        let memory = HostAllocation::zeroed(len);
        let mapped = desc
            .residency
            .is_host_visible()
            // SAFETY: the allocation lives until `destroy_buffer` removes it.
            .then(|| unsafe { MappedMemory::new(memory.ptr, memory.len) });

        let raw = vk::Buffer::from_raw(self.allocate_id());
        self.buffers.insert(raw.as_raw(), memory);
        self.stats.live_objects += 1;
        self.stats.buffers_created += 1;
        Ok(NativeBuffer { raw, mapped })
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        if self.buffers.remove(&buffer.as_raw()).is_some() {
            self.stats.live_objects -= 1;
        } else {
            self.report(format!("Destroying unknown buffer {buffer:?}"));
        }
    }

    fn create_image(&mut self, desc: &ImageDesc) -> Result<NativeImage> {
        if desc.extent.width == 0 || desc.extent.height == 0 || desc.extent.depth == 0 {
            return Err(GpuError::AllocationFailed("Zero-sized image".to_string()));
        }
        let image = self.host_image(desc);
        self.stats.live_objects += 1;
        self.stats.images_created += 1;
        Ok(image)
    }

    fn destroy_image(&mut self, image: NativeImage) {
        match self.images.remove(&image.raw.as_raw()) {
            Some(host) if host.view == image.view => self.stats.live_objects -= 1,
            Some(host) => {
                self.images.insert(image.raw.as_raw(), host);
                self.report(format!("Destroying {image:?} with a foreign view"));
            }
            None => self.report(format!("Destroying unknown image {image:?}")),
        }
    }

    fn create_sampler(&mut self, _desc: &SamplerDesc) -> Result<vk::Sampler> {
        Ok(vk::Sampler::from_raw(self.create_object(ObjectKind::Sampler)))
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        self.destroy_object(sampler.as_raw(), ObjectKind::Sampler);
    }

    fn create_shader_module(&mut self, code: &[u32]) -> Result<vk::ShaderModule> {
        if code.is_empty() {
            return Err(GpuError::ShaderCreation("Empty SPIR-V".to_string()));
        }
        Ok(vk::ShaderModule::from_raw(
            self.create_object(ObjectKind::ShaderModule),
        ))
    }

    fn destroy_shader_module(&mut self, module: vk::ShaderModule) {
        self.destroy_object(module.as_raw(), ObjectKind::ShaderModule);
    }

    fn create_descriptor_set_layout(
        &mut self,
        _bindings: &[LayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        Ok(vk::DescriptorSetLayout::from_raw(
            self.create_object(ObjectKind::DescriptorSetLayout),
        ))
    }

    fn destroy_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout) {
        self.destroy_object(layout.as_raw(), ObjectKind::DescriptorSetLayout);
    }

    fn create_descriptor_pool(
        &mut self,
        sizes: &DescriptorPoolSizes,
    ) -> Result<vk::DescriptorPool> {
        let id = self.allocate_id();
        self.descriptor_pools.insert(
            id,
            DescriptorPoolState {
                remaining: sizes.max_sets,
                sets: Vec::new(),
            },
        );
        self.stats.live_objects += 1;
        self.stats.descriptor_pools_created += 1;
        Ok(vk::DescriptorPool::from_raw(id))
    }

    fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool) {
        match self.descriptor_pools.remove(&pool.as_raw()) {
            Some(state) => {
                for set in state.sets {
                    self.descriptor_contents.remove(&set);
                }
                self.stats.live_objects -= 1;
            }
            None => self.report(format!("Destroying unknown descriptor pool {pool:?}")),
        }
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> Result<Option<vk::DescriptorSet>> {
        let id = self.allocate_id();
        let state = self
            .descriptor_pools
            .get_mut(&pool.as_raw())
            .ok_or_else(|| GpuError::InvalidState(format!("Unknown descriptor pool {pool:?}")))?;
        if state.remaining == 0 {
            return Ok(None);
        }
        state.remaining -= 1;
        state.sets.push(id);
        self.stats.descriptor_sets_allocated += 1;
        Ok(Some(vk::DescriptorSet::from_raw(id)))
    }

    fn free_descriptor_set(&mut self, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        let freed = self
            .descriptor_pools
            .get_mut(&pool.as_raw())
            .and_then(|state| {
                let index = state.sets.iter().position(|s| *s == set.as_raw())?;
                state.sets.swap_remove(index);
                state.remaining += 1;
                Some(())
            });
        if freed.is_some() {
            self.descriptor_contents.remove(&set.as_raw());
            self.stats.descriptor_sets_freed += 1;
        } else {
            self.report(format!("Freeing unknown descriptor set {set:?}"));
        }
    }

    fn write_descriptor_set(&mut self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        self.stats.descriptor_writes += writes.len();
        self.descriptor_contents
            .insert(set.as_raw(), writes.to_vec());
    }

    fn create_pipeline_layout(
        &mut self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constants: Option<vk::PushConstantRange>,
    ) -> Result<vk::PipelineLayout> {
        Ok(vk::PipelineLayout::from_raw(
            self.create_object(ObjectKind::PipelineLayout),
        ))
    }

    fn destroy_pipeline_layout(&mut self, layout: vk::PipelineLayout) {
        self.destroy_object(layout.as_raw(), ObjectKind::PipelineLayout);
    }

    fn create_graphics_pipeline(
        &mut self,
        request: &GraphicsPipelineRequest<'_>,
    ) -> Result<vk::Pipeline> {
        if request.stages.is_empty() {
            return Err(GpuError::PipelineCreation("No shader stages".to_string()));
        }
        self.stats.pipelines_created += 1;
        Ok(vk::Pipeline::from_raw(self.create_object(ObjectKind::Pipeline)))
    }

    fn create_compute_pipeline(
        &mut self,
        _request: &ComputePipelineRequest<'_>,
    ) -> Result<vk::Pipeline> {
        self.stats.pipelines_created += 1;
        Ok(vk::Pipeline::from_raw(self.create_object(ObjectKind::Pipeline)))
    }

    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.destroy_object(pipeline.as_raw(), ObjectKind::Pipeline);
    }

    fn create_render_pass(&mut self, _request: &RenderPassRequest) -> Result<vk::RenderPass> {
        self.stats.render_passes_created += 1;
        Ok(vk::RenderPass::from_raw(
            self.create_object(ObjectKind::RenderPass),
        ))
    }

    fn destroy_render_pass(&mut self, pass: vk::RenderPass) {
        self.destroy_object(pass.as_raw(), ObjectKind::RenderPass);
    }

    fn create_framebuffer(&mut self, request: &FramebufferRequest) -> Result<vk::Framebuffer> {
        if self.objects.get(&request.render_pass.as_raw()) != Some(&ObjectKind::RenderPass) {
            return Err(GpuError::InvalidState(format!(
                "Framebuffer for unknown render pass {:?}",
                request.render_pass
            )));
        }
        self.stats.framebuffers_created += 1;
        Ok(vk::Framebuffer::from_raw(
            self.create_object(ObjectKind::Framebuffer),
        ))
    }

    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        self.destroy_object(framebuffer.as_raw(), ObjectKind::Framebuffer);
    }

    fn create_command_pool(&mut self, queue: QueueKind) -> Result<vk::CommandPool> {
        let id = self.allocate_id();
        self.command_pools.insert(id, queue);
        self.stats.live_objects += 1;
        Ok(vk::CommandPool::from_raw(id))
    }

    fn destroy_command_pool(&mut self, pool: vk::CommandPool) {
        if self.command_pools.remove(&pool.as_raw()).is_some() {
            self.command_buffers
                .retain(|_, state| state.pool != pool.as_raw());
            self.stats.live_objects -= 1;
        } else {
            self.report(format!("Destroying unknown command pool {pool:?}"));
        }
    }

    fn reset_command_pool(&mut self, pool: vk::CommandPool) -> Result<()> {
        if !self.command_pools.contains_key(&pool.as_raw()) {
            return Err(GpuError::InvalidState(format!(
                "Resetting unknown command pool {pool:?}"
            )));
        }
        for state in self
            .command_buffers
            .values_mut()
            .filter(|state| state.pool == pool.as_raw())
        {
            state.recording = false;
            state.commands.clear();
        }
        Ok(())
    }

    fn allocate_command_buffer(&mut self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        if !self.command_pools.contains_key(&pool.as_raw()) {
            return Err(GpuError::InvalidState(format!(
                "Allocating from unknown command pool {pool:?}"
            )));
        }
        let id = self.allocate_id();
        self.command_buffers.insert(
            id,
            CommandBufferState {
                pool: pool.as_raw(),
                recording: false,
                commands: Vec::new(),
            },
        );
        Ok(vk::CommandBuffer::from_raw(id))
    }

    fn free_command_buffer(&mut self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        match self.command_buffers.get(&buffer.as_raw()) {
            Some(state) if state.pool == pool.as_raw() => {
                self.command_buffers.remove(&buffer.as_raw());
            }
            _ => self.report(format!("Freeing unknown command buffer {buffer:?}")),
        }
    }

    fn begin_command_buffer(&mut self, buffer: vk::CommandBuffer, _one_time: bool) -> Result<()> {
        let state = self
            .command_buffers
            .get_mut(&buffer.as_raw())
            .ok_or_else(|| GpuError::InvalidState(format!("Unknown command buffer {buffer:?}")))?;
        state.recording = true;
        state.commands.clear();
        Ok(())
    }

    fn end_command_buffer(&mut self, buffer: vk::CommandBuffer) -> Result<()> {
        match self.command_buffers.get_mut(&buffer.as_raw()) {
            Some(state) if state.recording => {
                state.recording = false;
                Ok(())
            }
            Some(_) => Err(GpuError::InvalidState(format!(
                "Ending {buffer:?} which is not recording"
            ))),
            None => Err(GpuError::InvalidState(format!(
                "Unknown command buffer {buffer:?}"
            ))),
        }
    }

    fn cmd_pipeline_barrier(
        &mut self,
        cmd: vk::CommandBuffer,
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
    ) {
        let images = image_barriers
            .iter()
            .map(|b| ImageTransition {
                image: b.image,
                old_layout: b.old_layout,
                new_layout: b.new_layout,
                src_stage: b.src_stage_mask,
                dst_stage: b.dst_stage_mask,
                src_access: b.src_access_mask,
                dst_access: b.dst_access_mask,
            })
            .collect();
        let buffers = buffer_barriers.iter().map(|b| b.buffer).collect();
        self.record(cmd, RecordedCommand::PipelineBarrier { images, buffers });
    }

    fn cmd_bind_pipeline(
        &mut self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(
            cmd,
            RecordedCommand::BindPipeline {
                bind_point,
                pipeline,
            },
        );
    }

    fn cmd_bind_descriptor_set(
        &mut self,
        cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    ) {
        self.record(
            cmd,
            RecordedCommand::BindDescriptorSet {
                set_index,
                set,
                dynamic_offsets: dynamic_offsets.to_vec(),
            },
        );
    }

    fn cmd_bind_vertex_buffer(
        &mut self,
        cmd: vk::CommandBuffer,
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
    ) {
        self.record(
            cmd,
            RecordedCommand::BindVertexBuffer {
                binding,
                buffer,
                offset,
            },
        );
    }

    fn cmd_bind_index_buffer(
        &mut self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    ) {
        self.record(
            cmd,
            RecordedCommand::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            },
        );
    }

    fn cmd_push_constants(
        &mut self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.record(
            cmd,
            RecordedCommand::PushConstants {
                offset,
                data: data.to_vec(),
            },
        );
    }

    fn cmd_set_viewport(&mut self, cmd: vk::CommandBuffer, viewport: vk::Viewport) {
        self.record(cmd, RecordedCommand::SetViewport(viewport));
    }

    fn cmd_set_scissor(&mut self, cmd: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.record(cmd, RecordedCommand::SetScissor(scissor));
    }

    fn cmd_begin_render_pass(
        &mut self,
        cmd: vk::CommandBuffer,
        pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) {
        self.record(
            cmd,
            RecordedCommand::BeginRenderPass {
                pass,
                framebuffer,
                extent,
                clear_values: clear_values.len(),
            },
        );
    }

    fn cmd_end_render_pass(&mut self, cmd: vk::CommandBuffer) {
        self.record(cmd, RecordedCommand::EndRenderPass);
    }

    fn cmd_draw(
        &mut self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.record(
            cmd,
            RecordedCommand::Draw {
                vertex_count,
                instance_count,
            },
        );
    }

    fn cmd_draw_indexed(
        &mut self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record(
            cmd,
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
            },
        );
    }

    fn cmd_dispatch(&mut self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.record(cmd, RecordedCommand::Dispatch { x, y, z });
    }

    fn cmd_copy_buffer(
        &mut self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.record(
            cmd,
            RecordedCommand::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &mut self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.record(
            cmd,
            RecordedCommand::CopyBufferToImage {
                src,
                dst,
                layout,
                regions: regions.to_vec(),
            },
        );
    }

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        let id = self.allocate_id();
        self.fences.insert(id, Arc::new(FenceState::new(signaled)));
        self.stats.live_objects += 1;
        Ok(vk::Fence::from_raw(id))
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        if self.fences.remove(&fence.as_raw()).is_some() {
            self.pending_fences.retain(|f| *f != fence);
            self.stats.live_objects -= 1;
        } else {
            self.report(format!("Destroying unknown fence {fence:?}"));
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        let state = self
            .fences
            .get(&fence.as_raw())
            .ok_or_else(|| GpuError::InvalidState(format!("Waiting on unknown fence {fence:?}")))?;

        let mut signaled = state.signaled.lock();
        if timeout_ns == u64::MAX {
            while !*signaled {
                state.condvar.wait(&mut signaled);
            }
            return Ok(());
        }

        let timeout = Duration::from_nanos(timeout_ns);
        while !*signaled {
            if state.condvar.wait_for(&mut signaled, timeout).timed_out() && !*signaled {
                return Err(GpuError::Vulkan(vk::Result::TIMEOUT));
            }
        }
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        self.fences
            .get(&fence.as_raw())
            .map(|state| state.is_signaled())
            .ok_or_else(|| GpuError::InvalidState(format!("Querying unknown fence {fence:?}")))
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        let state = self
            .fences
            .get(&fence.as_raw())
            .ok_or_else(|| GpuError::InvalidState(format!("Resetting unknown fence {fence:?}")))?;
        *state.signaled.lock() = false;
        Ok(())
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore> {
        let id = self.create_object(ObjectKind::Semaphore);
        self.semaphores.insert(id, false);
        Ok(vk::Semaphore::from_raw(id))
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.semaphores.remove(&semaphore.as_raw());
        self.destroy_object(semaphore.as_raw(), ObjectKind::Semaphore);
    }

    fn submit(&mut self, request: &SubmitRequest<'_>) -> Result<()> {
        if std::mem::take(&mut self.fail_submit) {
            return Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }
        if request.fence != vk::Fence::null() {
            let state = self.fences.get(&request.fence.as_raw()).ok_or_else(|| {
                GpuError::InvalidState(format!("Submitting with unknown fence {:?}", request.fence))
            })?;
            if state.is_signaled() {
                return Err(GpuError::InvalidState(format!(
                    "Submitting with signaled fence {:?}",
                    request.fence
                )));
            }
        }

        for &cmd in request.command_buffers {
            match self.command_buffers.get(&cmd.as_raw()) {
                Some(state) if !state.recording => {}
                Some(_) => {
                    return Err(GpuError::InvalidState(format!(
                        "Submitting {cmd:?} while it is recording"
                    )))
                }
                None => {
                    return Err(GpuError::InvalidState(format!(
                        "Submitting unknown command buffer {cmd:?}"
                    )))
                }
            }
        }

        for wait in request.wait {
            self.consume_semaphore(wait.semaphore)?;
        }

        for &cmd in request.command_buffers {
            let commands = self
                .command_buffers
                .get(&cmd.as_raw())
                .map(|state| state.commands.clone())
                .unwrap_or_default();
            for command in &commands {
                self.execute(command)?;
            }
            self.submitted.extend(commands);
        }

        for &semaphore in request.signal {
            self.signal_semaphore(semaphore)?;
        }

        if request.fence != vk::Fence::null() {
            match self.completion {
                CompletionMode::Immediate => {
                    if let Some(state) = self.fences.get(&request.fence.as_raw()) {
                        state.signal();
                    }
                }
                CompletionMode::Manual => self.pending_fences.push(request.fence),
            }
        }

        self.stats.submissions += 1;
        trace!(
            "Headless submit on {:?}: {} command buffers",
            request.queue,
            request.command_buffers.len()
        );
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.complete_pending();
        Ok(())
    }

    fn swapchain(&self) -> Option<SwapchainInfo> {
        self.swapchain.as_ref().map(|swapchain| SwapchainInfo {
            format: swapchain.format,
            extent: swapchain.extent,
            images: swapchain.images.clone(),
        })
    }

    fn acquire_next_image(
        &mut self,
        signal: vk::Semaphore,
        _timeout_ns: u64,
    ) -> Result<AcquireStatus> {
        let swapchain = self
            .swapchain
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Headless backend has no surface".to_string()))?;

        if std::mem::take(&mut swapchain.fail_acquire) {
            return Ok(AcquireStatus::OutOfDate);
        }

        let image_index = swapchain.next_image;
        if swapchain.acquired[image_index as usize] {
            return Err(GpuError::InvalidState(format!(
                "Image {image_index} acquired twice without present"
            )));
        }
        swapchain.acquired[image_index as usize] = true;
        swapchain.next_image = (image_index + 1) % swapchain.image_count;
        self.signal_semaphore(signal)?;
        Ok(AcquireStatus::Acquired {
            image_index,
            suboptimal: false,
        })
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<PresentStatus> {
        self.consume_semaphore(wait)?;
        let swapchain = self
            .swapchain
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Headless backend has no surface".to_string()))?;

        match swapchain.acquired.get_mut(image_index as usize) {
            Some(acquired) if *acquired => *acquired = false,
            _ => {
                return Err(GpuError::InvalidState(format!(
                    "Presenting image {image_index} which was not acquired"
                )))
            }
        }

        self.stats.presents += 1;
        Ok(swapchain
            .present_result
            .take()
            .unwrap_or(PresentStatus::Presented))
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        let mut swapchain = self
            .swapchain
            .take()
            .ok_or_else(|| GpuError::InvalidState("Headless backend has no surface".to_string()))?;
        swapchain.extent = vk::Extent2D { width, height };
        swapchain.fail_acquire = false;
        self.populate_swapchain(&mut swapchain);
        self.swapchain = Some(swapchain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{BufferUsage, MemoryResidency};

    #[test]
    fn mapped_writes_are_visible_to_copies() {
        let mut backend = HeadlessBackend::new();
        let src = backend
            .create_buffer(&BufferDesc::staging(8))
            .unwrap();
        let dst = backend
            .create_buffer(&BufferDesc::new(
                8,
                BufferUsage::TRANSFER_DST,
                MemoryResidency::DeviceLocal,
            ))
            .unwrap();
        assert!(dst.mapped.is_none());
        src.mapped
            .as_ref()
            .unwrap()
            .write_bytes(0, &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();

        let pool = backend.create_command_pool(QueueKind::Transfer).unwrap();
        let cmd = backend.allocate_command_buffer(pool).unwrap();
        backend.begin_command_buffer(cmd, true).unwrap();
        backend.cmd_copy_buffer(
            cmd,
            src.raw,
            dst.raw,
            &[vk::BufferCopy {
                src_offset: 4,
                dst_offset: 0,
                size: 4,
            }],
        );
        backend.end_command_buffer(cmd).unwrap();
        backend
            .submit(&SubmitRequest {
                queue: QueueKind::Transfer,
                command_buffers: &[cmd],
                wait: &[],
                signal: &[],
                fence: vk::Fence::null(),
            })
            .unwrap();

        assert_eq!(backend.read_buffer(dst.raw).unwrap(), vec![5, 6, 7, 8, 0, 0, 0, 0]);
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn manual_fence_blocks_until_signaled() {
        let mut backend = HeadlessBackend::new().with_completion(CompletionMode::Manual);
        let fence = backend.create_fence(false).unwrap();
        backend
            .submit(&SubmitRequest {
                queue: QueueKind::Graphics,
                command_buffers: &[],
                wait: &[],
                signal: &[],
                fence,
            })
            .unwrap();
        assert_eq!(backend.pending_fences(), vec![fence]);
        assert!(matches!(
            backend.wait_for_fence(fence, 1_000),
            Err(GpuError::Vulkan(vk::Result::TIMEOUT))
        ));

        let signaler = backend.fence_signaler(fence).unwrap();
        let thread = std::thread::spawn(move || signaler.signal());
        backend.wait_for_fence(fence, u64::MAX).unwrap();
        thread.join().unwrap();
        assert!(backend.pending_fences().is_empty());
    }

    #[test]
    fn submit_rejects_signaled_fence_and_unsignaled_wait() {
        let mut backend = HeadlessBackend::new();
        let fence = backend.create_fence(true).unwrap();
        let semaphore = backend.create_semaphore().unwrap();

        let signaled_fence = backend.submit(&SubmitRequest {
            queue: QueueKind::Graphics,
            command_buffers: &[],
            wait: &[],
            signal: &[],
            fence,
        });
        assert!(signaled_fence.is_err());

        let unsignaled_wait = backend.submit(&SubmitRequest {
            queue: QueueKind::Graphics,
            command_buffers: &[],
            wait: &[super::super::SemaphoreWait {
                semaphore,
                stage: vk::PipelineStageFlags::ALL_COMMANDS,
            }],
            signal: &[],
            fence: vk::Fence::null(),
        });
        assert!(unsignaled_wait.is_err());
    }

    #[test]
    fn descriptor_pool_reports_exhaustion() {
        let mut backend = HeadlessBackend::new();
        let layout = backend.create_descriptor_set_layout(&[]).unwrap();
        let pool = backend
            .create_descriptor_pool(&DescriptorPoolSizes {
                max_sets: 1,
                uniform_buffers: 1,
                dynamic_uniform_buffers: 0,
                storage_buffers: 0,
                dynamic_storage_buffers: 0,
                sampled_images: 0,
                storage_images: 0,
            })
            .unwrap();

        let set = backend.allocate_descriptor_set(pool, layout).unwrap();
        assert!(set.is_some());
        assert!(backend.allocate_descriptor_set(pool, layout).unwrap().is_none());
        backend.free_descriptor_set(pool, set.unwrap());
        assert!(backend.allocate_descriptor_set(pool, layout).unwrap().is_some());
    }

    #[test]
    fn double_destroy_is_reported() {
        let mut backend = HeadlessBackend::new();
        let sampler = backend.create_sampler(&SamplerDesc::default()).unwrap();
        backend.destroy_sampler(sampler);
        assert!(backend.validation_errors().is_empty());
        backend.destroy_sampler(sampler);
        assert_eq!(backend.validation_errors().len(), 1);
        assert_eq!(backend.stats().live_objects, 0);
    }

    #[test]
    fn virtual_swapchain_cycles_images() {
        let mut backend = HeadlessBackend::new().with_swapchain(64, 32, 2);
        let acquired = backend.create_semaphore().unwrap();
        let info = backend.swapchain().unwrap();
        assert_eq!(info.images.len(), 2);
        assert_eq!(info.extent.width, 64);

        let status = backend.acquire_next_image(acquired, u64::MAX).unwrap();
        assert_eq!(
            status,
            AcquireStatus::Acquired {
                image_index: 0,
                suboptimal: false
            }
        );
        assert_eq!(backend.present(0, acquired).unwrap(), PresentStatus::Presented);

        backend.fail_next_acquire();
        assert_eq!(
            backend.acquire_next_image(acquired, u64::MAX).unwrap(),
            AcquireStatus::OutOfDate
        );
        backend.recreate_swapchain(128, 64).unwrap();
        assert_eq!(backend.swapchain().unwrap().extent.width, 128);
    }
}
