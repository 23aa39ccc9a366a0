//! GPU resource and synchronization core for the Tessera engine.
//!
//! This crate provides:
//! - A [`Device`] owning buffers, images, samplers, shaders, descriptor sets,
//!   pipeline programs and render targets behind generation-checked handles
//! - Automatic image usage tracking and barrier derivation
//! - Content-addressed descriptor set and pipeline variant caches
//! - A [`CommandRecorder`] validating command order and resource usage
//! - Frame pacing over N frames in flight with deferred destruction
//! - A Vulkan backend and a CPU-side headless backend for tests

pub mod backend;
pub mod capabilities;
pub mod command;
pub mod config;
pub mod deferred;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod resource;
pub mod usage;

pub use backend::headless::{CompletionMode, FenceSignaler, HeadlessBackend, HeadlessStats};
pub use backend::vulkan::{VulkanBackend, VulkanBackendBuilder};
pub use backend::{Backend, QueueKind};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{CommandRecorder, RecorderState};
pub use config::DeviceConfig;
pub use deferred::{DeferredDeletionQueue, RetiredObject};
pub use descriptor::{
    BindingKind, BindingResource, DescriptorBindingSet, DescriptorLayout, DescriptorLayoutDesc,
    DescriptorLayoutHandle, DescriptorSetHandle,
};
pub use device::Device;
pub use error::{GpuError, Result};
pub use frame::{
    AcquireOutcome, FrameContext, FramePhase, FrameScheduler, PresentOutcome, SubmitOptions,
};
pub use pipeline::{
    BlendMode, CompareOp, CullMode, FillMode, FrontFace, LoadOp, PipelineProgram,
    PipelineProgramHandle, ProgramDesc, ProgramStages, RenderState, RenderTarget,
    RenderTargetHandle, TargetLayout, Topology, VertexLayout,
};
pub use resource::{
    BufferDesc, BufferHandle, BufferUsage, ImageDesc, ImageHandle, ImageUsage, MemoryResidency,
    SamplerDesc, SamplerHandle, ShaderDesc, ShaderHandle, ShaderStage,
};
pub use usage::{derive_barrier, derive_buffer_barrier, BufferAccess, ImageUsageState};
