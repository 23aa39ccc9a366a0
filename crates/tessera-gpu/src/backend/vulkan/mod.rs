//! Vulkan 1.3 backend built on ash.
//!
//! Requires `synchronization2`; every barrier goes through
//! `vkCmdPipelineBarrier2`. Buffers and images are allocated through
//! gpu-allocator and shared concurrently when the selected queues come from
//! more than one family.

mod descriptors;
mod instance;
mod memory;
mod pipeline;
mod swapchain;

pub use instance::{required_instance_extensions, validation_layers};
pub use memory::GpuAllocator;
pub use swapchain::{
    calculate_extent, select_present_mode, select_surface_format, SurfaceCapabilities,
    SurfaceContext, Swapchain,
};

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info, warn};

use super::{
    AcquireStatus, Backend, ComputePipelineRequest, DescriptorPoolSizes, DescriptorWrite,
    FramebufferRequest, GraphicsPipelineRequest, NativeBuffer, NativeImage, PresentStatus,
    QueueKind, RenderPassRequest, SubmitRequest, SwapchainInfo,
};
use crate::capabilities::GpuCapabilities;
use crate::descriptor::LayoutBinding;
use crate::error::{GpuError, Result};
use crate::resource::{BufferDesc, ImageDesc, SamplerDesc};

/// Presentation state of a windowed backend.
struct Presentation {
    surface: SurfaceContext,
    swapchain_loader: ash::khr::swapchain::Device,
    swapchain: Swapchain,
    queue: vk::Queue,
    vsync: bool,
}

/// A [`Backend`] driving a real GPU.
pub struct VulkanBackend {
    // Entry must be kept alive for the lifetime of the instance
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    capabilities: GpuCapabilities,
    allocator: Mutex<GpuAllocator>,
    families: QueueFamilyIndices,
    graphics_queue: vk::Queue,
    compute_queue: vk::Queue,
    transfer_queue: vk::Queue,
    anisotropy: bool,
    presentation: Option<Presentation>,
}

impl VulkanBackend {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Queue family index serving `queue`.
    pub fn queue_family(&self, queue: QueueKind) -> u32 {
        match queue {
            QueueKind::Graphics => self.families.graphics,
            QueueKind::Compute => self.families.compute,
            QueueKind::Transfer => self.families.transfer,
        }
    }

    fn queue(&self, queue: QueueKind) -> vk::Queue {
        match queue {
            QueueKind::Graphics => self.graphics_queue,
            QueueKind::Compute => self.compute_queue,
            QueueKind::Transfer => self.transfer_queue,
        }
    }

    fn presentation(&self) -> Result<&Presentation> {
        self.presentation
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Backend has no surface".to_string()))
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            if let Some(presentation) = self.presentation.take() {
                presentation
                    .swapchain
                    .destroy(&self.device, &presentation.swapchain_loader);
                presentation.surface.destroy();
            }

            // Shutdown allocator BEFORE destroying device
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        debug!("Vulkan backend destroyed");
    }
}

/// Builder for a [`VulkanBackend`].
pub struct VulkanBackendBuilder {
    app_name: String,
    enable_validation: bool,
    vsync: bool,
}

impl Default for VulkanBackendBuilder {
    fn default() -> Self {
        Self {
            app_name: "Tessera".to_string(),
            enable_validation: cfg!(debug_assertions),
            vsync: true,
        }
    }
}

impl VulkanBackendBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Wait for vertical blank when presenting.
    #[must_use]
    pub fn vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Build a backend presenting to `window`.
    pub fn build<W>(self, window: &W, width: u32, height: u32) -> Result<VulkanBackend>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let entry = load_entry()?;
        let instance = unsafe {
            instance::create_instance(&entry, &self.app_name, self.enable_validation, true)
        }?;
        let surface = match unsafe { SurfaceContext::from_window(&entry, &instance, window) } {
            Ok(surface) => surface,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        // On failure the surface has already been released with the instance
        let mut backend = self.finish(entry, instance, Some(&surface))?;

        let swapchain_loader = ash::khr::swapchain::Device::new(&backend.instance, &backend.device);
        let swapchain = unsafe {
            surface
                .capabilities(backend.physical_device)
                .and_then(|caps| {
                    Swapchain::new(
                        &backend.device,
                        &swapchain_loader,
                        surface.surface,
                        &caps,
                        vk::Extent2D { width, height },
                        self.vsync,
                        vk::SwapchainKHR::null(),
                    )
                })
        };
        let swapchain = match swapchain {
            Ok(swapchain) => swapchain,
            Err(e) => {
                unsafe { surface.destroy() };
                return Err(e);
            }
        };
        info!(
            "Created swapchain {}x{} ({} images, {:?})",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.images.len(),
            swapchain.format
        );

        let present_family = backend.families.present.unwrap_or(backend.families.graphics);
        let queue = unsafe { backend.device.get_device_queue(present_family, 0) };
        backend.presentation = Some(Presentation {
            surface,
            swapchain_loader,
            swapchain,
            queue,
            vsync: self.vsync,
        });
        Ok(backend)
    }

    /// Build a backend without a surface.
    pub fn build_headless(self) -> Result<VulkanBackend> {
        let entry = load_entry()?;
        let instance = unsafe {
            instance::create_instance(&entry, &self.app_name, self.enable_validation, false)
        }?;
        self.finish(entry, instance, None)
    }

    fn finish(
        &self,
        entry: ash::Entry,
        instance: ash::Instance,
        surface: Option<&SurfaceContext>,
    ) -> Result<VulkanBackend> {
        let destroy_instance = |instance: &ash::Instance| unsafe {
            if let Some(surface) = surface {
                surface.destroy();
            }
            instance.destroy_instance(None);
        };

        let physical_device = match unsafe { instance::select_physical_device(&instance) } {
            Ok(device) => device,
            Err(e) => {
                destroy_instance(&instance);
                return Err(e);
            }
        };

        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };
        if !capabilities.meets_requirements() {
            destroy_instance(&instance);
            return Err(GpuError::NoSuitableDevice);
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let created = unsafe {
            find_queue_families(&instance, physical_device, surface)
                .and_then(|families| {
                    create_device(&instance, physical_device, &families, surface.is_some())
                        .map(|created| (families, created))
                })
        };
        let (families, (device, anisotropy)) = match created {
            Ok(created) => created,
            Err(e) => {
                destroy_instance(&instance);
                return Err(e);
            }
        };
        let device = Arc::new(device);

        let allocator = match unsafe {
            GpuAllocator::new(
                &instance,
                device.clone(),
                physical_device,
                families.shared(),
            )
        } {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                destroy_instance(&instance);
                return Err(e);
            }
        };

        let (graphics_queue, compute_queue, transfer_queue) = unsafe {
            (
                device.get_device_queue(families.graphics, 0),
                device.get_device_queue(families.compute, 0),
                device.get_device_queue(families.transfer, 0),
            )
        };
        debug!(
            "Queue families: graphics {}, compute {}, transfer {}, present {:?}",
            families.graphics, families.compute, families.transfer, families.present
        );

        Ok(VulkanBackend {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator: Mutex::new(allocator),
            families,
            graphics_queue,
            compute_queue,
            transfer_queue,
            anisotropy,
            presentation: None,
        })
    }
}

fn load_entry() -> Result<ash::Entry> {
    unsafe { ash::Entry::load() }.map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))
}

/// Queue family indices.
#[derive(Debug, Clone, Copy)]
struct QueueFamilyIndices {
    graphics: u32,
    compute: u32,
    transfer: u32,
    present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Distinct families resources are shared between.
    fn shared(&self) -> Vec<u32> {
        let mut families = vec![self.graphics, self.compute, self.transfer];
        families.sort_unstable();
        families.dedup();
        families
    }

    /// Distinct families a queue is created from.
    fn unique(&self) -> Vec<u32> {
        let mut families = self.shared();
        if let Some(present) = self.present {
            if !families.contains(&present) {
                families.push(present);
            }
        }
        families
    }
}

/// Find queue families for graphics, compute, transfer and presentation.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface: Option<&SurfaceContext>,
) -> Result<QueueFamilyIndices> {
    let queue_families = instance.get_physical_device_queue_family_properties(physical_device);

    let mut graphics_family = None;
    let mut compute_family = None;
    let mut transfer_family = None;

    for (i, family) in queue_families.iter().enumerate() {
        let i = i as u32;

        // Look for dedicated compute queue (no graphics)
        if family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && compute_family.is_none()
        {
            compute_family = Some(i);
        }

        // Look for dedicated transfer queue (no graphics or compute)
        if family.queue_flags.contains(vk::QueueFlags::TRANSFER)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && !family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && transfer_family.is_none()
        {
            transfer_family = Some(i);
        }

        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
            graphics_family = Some(i);
        }
    }

    let graphics = graphics_family.ok_or(GpuError::NoSuitableDevice)?;
    let compute = compute_family.unwrap_or(graphics);
    let transfer = transfer_family.unwrap_or(compute);

    // Presenting from the graphics family avoids an extra queue
    let present = match surface {
        None => None,
        Some(surface) => {
            if surface.supports_present(physical_device, graphics)? {
                Some(graphics)
            } else {
                let mut found = None;
                for i in 0..queue_families.len() as u32 {
                    if surface.supports_present(physical_device, i)? {
                        found = Some(i);
                        break;
                    }
                }
                Some(found.ok_or_else(|| {
                    GpuError::SurfaceCreation("No queue family can present".to_string())
                })?)
            }
        }
    };

    Ok(QueueFamilyIndices {
        graphics,
        compute,
        transfer,
        present,
    })
}

/// Required device extensions.
fn required_device_extensions(presentable: bool) -> Vec<&'static CStr> {
    if presentable {
        vec![ash::khr::swapchain::NAME]
    } else {
        Vec::new()
    }
}

/// Create the logical device. Returns whether sampler anisotropy was enabled.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &QueueFamilyIndices,
    presentable: bool,
) -> Result<(ash::Device, bool)> {
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extensions = required_device_extensions(presentable);
    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();

    let supported = instance.get_physical_device_features(physical_device);
    let anisotropy = supported.sampler_anisotropy == vk::TRUE;

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true)
        .maintenance4(true);

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .descriptor_indexing(true)
        .scalar_block_layout(true);

    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(anisotropy)
        .fill_mode_non_solid(supported.fill_mode_non_solid == vk::TRUE)
        .wide_lines(supported.wide_lines == vk::TRUE);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)?;

    Ok((device, anisotropy))
}

impl Backend for VulkanBackend {
    fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<NativeBuffer> {
        self.allocator.lock().create_buffer(desc)
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        self.allocator.lock().destroy_buffer(buffer);
    }

    fn create_image(&mut self, desc: &ImageDesc) -> Result<NativeImage> {
        self.allocator.lock().create_image(desc)
    }

    fn destroy_image(&mut self, image: NativeImage) {
        self.allocator.lock().destroy_image(image);
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<vk::Sampler> {
        let anisotropy = desc.max_anisotropy.filter(|_| self.anisotropy);
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);
        Ok(unsafe { self.device.create_sampler(&create_info, None)? })
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_shader_module(&mut self, code: &[u32]) -> Result<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device.create_shader_module(&create_info, None) }
            .map_err(|e| GpuError::ShaderCreation(e.to_string()))
    }

    fn destroy_shader_module(&mut self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[LayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        unsafe { descriptors::create_set_layout(&self.device, bindings) }
    }

    fn destroy_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &mut self,
        sizes: &DescriptorPoolSizes,
    ) -> Result<vk::DescriptorPool> {
        unsafe { descriptors::create_pool(&self.device, sizes) }
    }

    fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<Option<vk::DescriptorSet>> {
        unsafe { descriptors::allocate_set(&self.device, pool, layout) }
    }

    fn free_descriptor_set(&mut self, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        if let Err(e) = unsafe { self.device.free_descriptor_sets(pool, &[set]) } {
            warn!("Failed to free descriptor set: {e}");
        }
    }

    fn write_descriptor_set(&mut self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        unsafe { descriptors::write_set(&self.device, set, writes) };
    }

    fn create_pipeline_layout(
        &mut self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: Option<vk::PushConstantRange>,
    ) -> Result<vk::PipelineLayout> {
        unsafe { pipeline::create_pipeline_layout(&self.device, set_layouts, push_constants) }
    }

    fn destroy_pipeline_layout(&mut self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(
        &mut self,
        request: &GraphicsPipelineRequest<'_>,
    ) -> Result<vk::Pipeline> {
        unsafe { pipeline::create_graphics_pipeline(&self.device, request) }
    }

    fn create_compute_pipeline(
        &mut self,
        request: &ComputePipelineRequest<'_>,
    ) -> Result<vk::Pipeline> {
        unsafe { pipeline::create_compute_pipeline(&self.device, request) }
    }

    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn create_render_pass(&mut self, request: &RenderPassRequest) -> Result<vk::RenderPass> {
        unsafe { pipeline::create_render_pass(&self.device, request) }
    }

    fn destroy_render_pass(&mut self, pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(pass, None) };
    }

    fn create_framebuffer(&mut self, request: &FramebufferRequest) -> Result<vk::Framebuffer> {
        unsafe { pipeline::create_framebuffer(&self.device, request) }
    }

    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_command_pool(&mut self, queue: QueueKind) -> Result<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                    | vk::CommandPoolCreateFlags::TRANSIENT,
            )
            .queue_family_index(self.queue_family(queue));
        Ok(unsafe { self.device.create_command_pool(&create_info, None)? })
    }

    fn destroy_command_pool(&mut self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn reset_command_pool(&mut self, pool: vk::CommandPool) -> Result<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())?;
        }
        Ok(())
    }

    fn allocate_command_buffer(&mut self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info)? };
        buffers
            .first()
            .copied()
            .ok_or_else(|| GpuError::Other("No command buffer allocated".to_string()))
    }

    fn free_command_buffer(&mut self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[buffer]) };
    }

    fn begin_command_buffer(&mut self, buffer: vk::CommandBuffer, one_time: bool) -> Result<()> {
        let flags = if one_time {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device.begin_command_buffer(buffer, &begin_info)? };
        Ok(())
    }

    fn end_command_buffer(&mut self, buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(buffer)? };
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &mut self,
        cmd: vk::CommandBuffer,
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
    ) {
        let dependency_info = vk::DependencyInfo::default()
            .image_memory_barriers(image_barriers)
            .buffer_memory_barriers(buffer_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency_info) };
    }

    fn cmd_bind_pipeline(
        &mut self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { self.device.cmd_bind_pipeline(cmd, bind_point, pipeline) };
    }

    fn cmd_bind_descriptor_set(
        &mut self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                bind_point,
                layout,
                set_index,
                &[set],
                dynamic_offsets,
            );
        }
    }

    fn cmd_bind_vertex_buffer(
        &mut self,
        cmd: vk::CommandBuffer,
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(cmd, binding, &[buffer], &[offset]);
        }
    }

    fn cmd_bind_index_buffer(
        &mut self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(cmd, buffer, offset, index_type);
        }
    }

    fn cmd_push_constants(
        &mut self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(cmd, layout, stages, offset, data);
        }
    }

    fn cmd_set_viewport(&mut self, cmd: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(cmd, 0, &[viewport]) };
    }

    fn cmd_set_scissor(&mut self, cmd: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(cmd, 0, &[scissor]) };
    }

    fn cmd_begin_render_pass(
        &mut self,
        cmd: vk::CommandBuffer,
        pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
        }
    }

    fn cmd_end_render_pass(&mut self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(cmd) };
    }

    fn cmd_draw(
        &mut self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance);
        }
    }

    fn cmd_draw_indexed(
        &mut self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    fn cmd_dispatch(&mut self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(cmd, x, y, z) };
    }

    fn cmd_copy_buffer(
        &mut self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, regions) };
    }

    fn cmd_copy_buffer_to_image(
        &mut self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(cmd, src, dst, layout, regions);
        }
    }

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&create_info, None)? })
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns)? };
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence])? };
        Ok(())
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&create_info, None)? })
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn submit(&mut self, request: &SubmitRequest<'_>) -> Result<()> {
        let wait_semaphores: Vec<vk::Semaphore> =
            request.wait.iter().map(|wait| wait.semaphore).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> =
            request.wait.iter().map(|wait| wait.stage).collect();

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(request.command_buffers)
            .signal_semaphores(request.signal);

        unsafe {
            self.device
                .queue_submit(self.queue(request.queue), &[submit_info], request.fence)?;
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn swapchain(&self) -> Option<SwapchainInfo> {
        self.presentation
            .as_ref()
            .map(|presentation| presentation.swapchain.info())
    }

    fn acquire_next_image(
        &mut self,
        signal: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireStatus> {
        let presentation = self.presentation()?;
        let result = unsafe {
            presentation.swapchain_loader.acquire_next_image(
                presentation.swapchain.swapchain,
                timeout_ns,
                signal,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireStatus::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireStatus::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<PresentStatus> {
        let presentation = self.presentation()?;
        let wait_semaphores = [wait];
        let swapchains = [presentation.swapchain.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            presentation
                .swapchain_loader
                .queue_present(presentation.queue, &present_info)
        };
        match result {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidState(format!(
                "Cannot create a {width}x{height} swapchain"
            )));
        }
        unsafe { self.device.device_wait_idle()? };

        let physical_device = self.physical_device;
        let device = self.device.clone();
        let presentation = self
            .presentation
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Backend has no surface".to_string()))?;

        let swapchain = unsafe {
            let caps = presentation.surface.capabilities(physical_device)?;
            Swapchain::new(
                &device,
                &presentation.swapchain_loader,
                presentation.surface.surface,
                &caps,
                vk::Extent2D { width, height },
                presentation.vsync,
                presentation.swapchain.swapchain,
            )?
        };

        let old = std::mem::replace(&mut presentation.swapchain, swapchain);
        unsafe { old.destroy(&device, &presentation.swapchain_loader) };
        debug!(
            "Recreated swapchain at {}x{}",
            presentation.swapchain.extent.width, presentation.swapchain.extent.height
        );
        Ok(())
    }
}
