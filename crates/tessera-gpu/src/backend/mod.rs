//! The native API seam.
//!
//! [`Backend`] is every native operation the device needs. Object identities
//! are `ash::vk` handle types in every implementation, so the device,
//! caches and recorder speak one vocabulary whether they drive a real GPU
//! ([`vulkan::VulkanBackend`]) or the CPU-side [`headless::HeadlessBackend`].

pub mod headless;
pub mod vulkan;

use std::ffi::CStr;

use ash::vk;

use crate::capabilities::GpuCapabilities;
use crate::descriptor::{BindingKind, LayoutBinding};
use crate::error::Result;
use crate::pipeline::{LoadOp, RenderState, TargetLayout, VertexLayout};
use crate::resource::{BufferDesc, ImageDesc, MappedMemory, SamplerDesc, ShaderStage};

/// Queue a command stream is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

impl QueueKind {
    /// All queue kinds.
    pub const ALL: [Self; 3] = [Self::Graphics, Self::Compute, Self::Transfer];
}

/// A freshly created buffer.
#[derive(Debug)]
pub struct NativeBuffer {
    pub raw: vk::Buffer,
    /// Persistent mapping, present for host-visible residencies.
    pub mapped: Option<MappedMemory>,
}

/// A freshly created image and its default view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeImage {
    pub raw: vk::Image,
    pub view: vk::ImageView,
}

/// Per-type descriptor counts of one native descriptor pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorPoolSizes {
    pub max_sets: u32,
    pub uniform_buffers: u32,
    pub dynamic_uniform_buffers: u32,
    pub storage_buffers: u32,
    pub dynamic_storage_buffers: u32,
    pub sampled_images: u32,
    pub storage_images: u32,
}

impl DescriptorPoolSizes {
    /// Non-zero `(type, count)` pairs.
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        [
            (vk::DescriptorType::UNIFORM_BUFFER, self.uniform_buffers),
            (
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                self.dynamic_uniform_buffers,
            ),
            (vk::DescriptorType::STORAGE_BUFFER, self.storage_buffers),
            (
                vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
                self.dynamic_storage_buffers,
            ),
            (
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                self.sampled_images,
            ),
            (vk::DescriptorType::STORAGE_IMAGE, self.storage_images),
        ]
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty,
            descriptor_count,
        })
        .collect()
    }
}

/// What a descriptor write points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    Image {
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler: vk::Sampler,
    },
}

/// One descriptor update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub kind: BindingKind,
    pub resource: DescriptorResource,
}

/// A shader module bound to a pipeline stage.
#[derive(Debug, Clone, Copy)]
pub struct ShaderStageRef<'a> {
    pub stage: ShaderStage,
    pub module: vk::ShaderModule,
    pub entry_point: &'a CStr,
}

/// Everything needed to build one graphics pipeline variant.
#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineRequest<'a> {
    pub layout: vk::PipelineLayout,
    pub stages: &'a [ShaderStageRef<'a>],
    pub vertex_layout: &'a VertexLayout,
    pub state: RenderState,
    pub targets: &'a TargetLayout,
    /// Any pass compatible with `targets`.
    pub render_pass: vk::RenderPass,
}

/// Everything needed to build one compute pipeline.
#[derive(Debug, Clone, Copy)]
pub struct ComputePipelineRequest<'a> {
    pub layout: vk::PipelineLayout,
    pub stage: ShaderStageRef<'a>,
}

/// One attachment of a render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentRequest {
    pub format: vk::Format,
    pub samples: u32,
    pub load_op: LoadOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

/// A single-subpass render pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPassRequest {
    pub colors: Vec<AttachmentRequest>,
    pub depth: Option<AttachmentRequest>,
}

/// A framebuffer over image views, in attachment order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferRequest {
    pub render_pass: vk::RenderPass,
    pub attachments: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
}

/// A semaphore wait attached to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
}

/// One queue submission.
#[derive(Debug, Clone, Copy)]
pub struct SubmitRequest<'a> {
    pub queue: QueueKind,
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait: &'a [SemaphoreWait],
    pub signal: &'a [vk::Semaphore],
    /// `vk::Fence::null()` for none.
    pub fence: vk::Fence,
}

/// Presentable images and their properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainInfo {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub images: Vec<NativeImage>,
}

/// Result of asking the surface for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    Acquired { image_index: u32, suboptimal: bool },
    OutOfDate,
}

/// Result of handing an image to the presentation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Native operations used by the device.
///
/// Creation calls return owned native objects; the device decides when they
/// are destroyed. Destroy calls must only be issued once the GPU no longer
/// uses the object. `cmd_*` calls record into a command buffer that is in the
/// recording state.
pub trait Backend {
    /// Properties of the selected GPU.
    fn capabilities(&self) -> &GpuCapabilities;

    // Resources

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<NativeBuffer>;
    fn destroy_buffer(&mut self, buffer: vk::Buffer);
    fn create_image(&mut self, desc: &ImageDesc) -> Result<NativeImage>;
    fn destroy_image(&mut self, image: NativeImage);
    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<vk::Sampler>;
    fn destroy_sampler(&mut self, sampler: vk::Sampler);
    fn create_shader_module(&mut self, code: &[u32]) -> Result<vk::ShaderModule>;
    fn destroy_shader_module(&mut self, module: vk::ShaderModule);

    // Descriptors

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[LayoutBinding],
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(&mut self, sizes: &DescriptorPoolSizes)
        -> Result<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool);
    /// Allocate one set; `Ok(None)` when `pool` is exhausted.
    fn allocate_descriptor_set(
        &mut self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<Option<vk::DescriptorSet>>;
    fn free_descriptor_set(&mut self, pool: vk::DescriptorPool, set: vk::DescriptorSet);
    fn write_descriptor_set(&mut self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    // Pipelines

    fn create_pipeline_layout(
        &mut self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: Option<vk::PushConstantRange>,
    ) -> Result<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&mut self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(
        &mut self,
        request: &GraphicsPipelineRequest<'_>,
    ) -> Result<vk::Pipeline>;
    fn create_compute_pipeline(
        &mut self,
        request: &ComputePipelineRequest<'_>,
    ) -> Result<vk::Pipeline>;
    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline);
    fn create_render_pass(&mut self, request: &RenderPassRequest) -> Result<vk::RenderPass>;
    fn destroy_render_pass(&mut self, pass: vk::RenderPass);
    fn create_framebuffer(&mut self, request: &FramebufferRequest) -> Result<vk::Framebuffer>;
    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer);

    // Command buffers

    fn create_command_pool(&mut self, queue: QueueKind) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&mut self, pool: vk::CommandPool);
    fn reset_command_pool(&mut self, pool: vk::CommandPool) -> Result<()>;
    fn allocate_command_buffer(&mut self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;
    fn free_command_buffer(&mut self, pool: vk::CommandPool, buffer: vk::CommandBuffer);
    fn begin_command_buffer(&mut self, buffer: vk::CommandBuffer, one_time: bool) -> Result<()>;
    fn end_command_buffer(&mut self, buffer: vk::CommandBuffer) -> Result<()>;

    fn cmd_pipeline_barrier(
        &mut self,
        cmd: vk::CommandBuffer,
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
    );
    fn cmd_bind_pipeline(
        &mut self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_descriptor_set(
        &mut self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    );
    fn cmd_bind_vertex_buffer(
        &mut self,
        cmd: vk::CommandBuffer,
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
    );
    fn cmd_bind_index_buffer(
        &mut self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    );
    fn cmd_push_constants(
        &mut self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    fn cmd_set_viewport(&mut self, cmd: vk::CommandBuffer, viewport: vk::Viewport);
    fn cmd_set_scissor(&mut self, cmd: vk::CommandBuffer, scissor: vk::Rect2D);
    fn cmd_begin_render_pass(
        &mut self,
        cmd: vk::CommandBuffer,
        pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    );
    fn cmd_end_render_pass(&mut self, cmd: vk::CommandBuffer);
    fn cmd_draw(
        &mut self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &mut self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_dispatch(&mut self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32);
    fn cmd_copy_buffer(
        &mut self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    fn cmd_copy_buffer_to_image(
        &mut self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    // Synchronization and submission

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&mut self, fence: vk::Fence);
    /// Block until `fence` is signaled or `timeout_ns` elapses.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;
    /// Non-blocking fence query.
    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool>;
    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()>;
    fn create_semaphore(&mut self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore);
    fn submit(&mut self, request: &SubmitRequest<'_>) -> Result<()>;
    /// Block until all submitted work has completed.
    fn wait_idle(&mut self) -> Result<()>;

    // Presentation

    /// Current presentable images, if the backend has a surface.
    fn swapchain(&self) -> Option<SwapchainInfo>;
    fn acquire_next_image(
        &mut self,
        signal: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireStatus>;
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<PresentStatus>;
    /// Recreate the presentable images for a new drawable size.
    fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()>;
}
