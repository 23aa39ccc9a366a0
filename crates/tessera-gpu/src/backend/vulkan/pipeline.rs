//! Render pass, framebuffer and pipeline creation.

use ash::vk;

use crate::backend::{
    AttachmentRequest, ComputePipelineRequest, FramebufferRequest, GraphicsPipelineRequest,
    RenderPassRequest,
};
use crate::error::{GpuError, Result};

fn attachment_description(request: &AttachmentRequest) -> vk::AttachmentDescription {
    vk::AttachmentDescription::default()
        .format(request.format)
        .samples(vk::SampleCountFlags::from_raw(request.samples))
        .load_op(request.load_op.to_vk())
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(request.initial_layout)
        .final_layout(request.final_layout)
}

/// Create a single-subpass render pass.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_render_pass(
    device: &ash::Device,
    request: &RenderPassRequest,
) -> Result<vk::RenderPass> {
    let mut attachments: Vec<vk::AttachmentDescription> =
        request.colors.iter().map(attachment_description).collect();

    let color_refs: Vec<vk::AttachmentReference> = (0..request.colors.len())
        .map(|index| vk::AttachmentReference {
            attachment: index as u32,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        })
        .collect();

    let depth_ref = request.depth.as_ref().map(|depth| {
        attachments.push(attachment_description(depth));
        vk::AttachmentReference {
            attachment: request.colors.len() as u32,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }
    });

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if let Some(depth_ref) = depth_ref.as_ref() {
        subpass = subpass.depth_stencil_attachment(depth_ref);
    }

    // Orders attachment access against work recorded before the pass
    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );

    let subpasses = [subpass];
    let dependencies = [dependency];
    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    device
        .create_render_pass(&create_info, None)
        .map_err(|e| GpuError::PipelineCreation(format!("Render pass: {e}")))
}

/// Create a framebuffer.
///
/// # Safety
/// The device, render pass and views must be valid.
pub unsafe fn create_framebuffer(
    device: &ash::Device,
    request: &FramebufferRequest,
) -> Result<vk::Framebuffer> {
    let create_info = vk::FramebufferCreateInfo::default()
        .render_pass(request.render_pass)
        .attachments(&request.attachments)
        .width(request.extent.width)
        .height(request.extent.height)
        .layers(1);

    Ok(device.create_framebuffer(&create_info, None)?)
}

/// Create a pipeline layout.
///
/// # Safety
/// The device and set layouts must be valid.
pub unsafe fn create_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constants: Option<vk::PushConstantRange>,
) -> Result<vk::PipelineLayout> {
    let ranges: Vec<vk::PushConstantRange> = push_constants.into_iter().collect();
    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(&ranges);

    device
        .create_pipeline_layout(&layout_info, None)
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))
}

/// Create a graphics pipeline with dynamic viewport and scissor.
///
/// # Safety
/// The device and every handle in `request` must be valid.
pub unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    request: &GraphicsPipelineRequest<'_>,
) -> Result<vk::Pipeline> {
    let state = &request.state;

    let stages: Vec<vk::PipelineShaderStageCreateInfo> = request
        .stages
        .iter()
        .map(|stage| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(stage.stage.to_vk())
                .module(stage.module)
                .name(stage.entry_point)
        })
        .collect();

    let vertex_bindings = request.vertex_layout.binding_descriptions();
    let vertex_attributes = request.vertex_layout.attribute_descriptions();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&vertex_bindings)
        .vertex_attribute_descriptions(&vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(state.topology.to_vk())
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(state.fill.to_vk())
        .cull_mode(state.cull.to_vk())
        .front_face(state.front_face.to_vk())
        .depth_bias_enable(false)
        .line_width(f32::from(state.line_width));

    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::from_raw(request.targets.samples))
        .sample_shading_enable(false);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(state.depth_test)
        .depth_write_enable(state.depth_write)
        .depth_compare_op(state.depth_compare.to_vk())
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let blend_attachments =
        vec![state.blend.attachment_state(); request.targets.color_formats.len()];
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(request.layout)
        .render_pass(request.render_pass)
        .subpass(0);
    if request.targets.depth_format.is_some() {
        pipeline_info = pipeline_info.depth_stencil_state(&depth_stencil);
    }

    let pipelines = device
        .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        .map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?;

    pipelines
        .first()
        .copied()
        .ok_or_else(|| GpuError::PipelineCreation("No pipeline returned".to_string()))
}

/// Create a compute pipeline.
///
/// # Safety
/// The device and every handle in `request` must be valid.
pub unsafe fn create_compute_pipeline(
    device: &ash::Device,
    request: &ComputePipelineRequest<'_>,
) -> Result<vk::Pipeline> {
    let stage_info = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(request.stage.module)
        .name(request.stage.entry_point);

    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage_info)
        .layout(request.layout);

    let pipelines = device
        .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        .map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?;

    pipelines
        .first()
        .copied()
        .ok_or_else(|| GpuError::PipelineCreation("No pipeline returned".to_string()))
}
