mod common;

use ash::vk;
use tessera_gpu::backend::headless::RecordedCommand;
use tessera_gpu::{
    CullMode, Device, DeviceConfig, FillMode, GpuError, HeadlessBackend, ImageDesc, ImageUsage,
    ImageUsageState, LoadOp, PipelineProgramHandle, ProgramDesc, RenderState, ShaderStage,
    TargetLayout, Topology,
};

fn graphics_program(device: &mut Device<HeadlessBackend>) -> PipelineProgramHandle {
    let vertex = common::shader(device, ShaderStage::Vertex);
    let fragment = common::shader(device, ShaderStage::Fragment);
    device
        .create_pipeline_program(ProgramDesc::graphics(vertex, fragment).with_push_constants(64))
        .unwrap()
}

fn color_targets() -> TargetLayout {
    TargetLayout::new(vec![vk::Format::R8G8B8A8_UNORM], Some(vk::Format::D32_SFLOAT))
}

#[test]
fn equal_states_share_one_pipeline() {
    let mut device = common::device();
    let program = graphics_program(&mut device);
    let targets = color_targets();

    let state = RenderState::default();
    let first = device.compile_pipeline(program, &state, &targets).unwrap();
    let again = device
        .compile_pipeline(program, &RenderState::default(), &targets)
        .unwrap();
    assert_eq!(first, again);

    let culled = device
        .compile_pipeline(program, &state.with_cull(CullMode::Front), &targets)
        .unwrap();
    assert_ne!(first, culled);

    let wireframe = device
        .compile_pipeline(program, &state.with_fill(FillMode::Line), &targets)
        .unwrap();
    assert_ne!(first, wireframe);
    assert_ne!(culled, wireframe);

    // Same state, different attachments.
    let hdr = TargetLayout::new(vec![vk::Format::R16G16B16A16_SFLOAT], None);
    let other_targets = device.compile_pipeline(program, &state, &hdr).unwrap();
    assert_ne!(first, other_targets);

    assert_eq!(device.program(program).unwrap().variant_count(), 4);
    assert_eq!(device.backend().stats().pipelines_created, 4);
    // One compatible pass per distinct target layout.
    assert_eq!(device.backend().stats().render_passes_created, 2);
}

#[test]
fn variant_limit_retires_least_recently_used() {
    let mut device = Device::new(
        HeadlessBackend::new(),
        DeviceConfig::default().with_pipeline_variant_limit(2),
    )
    .unwrap();
    let program = graphics_program(&mut device);
    let targets = color_targets();

    let triangles = RenderState::default();
    let lines = triangles.with_topology(Topology::LineList);
    let points = triangles.with_topology(Topology::PointList);

    let first = device.compile_pipeline(program, &triangles, &targets).unwrap();
    device.compile_pipeline(program, &lines, &targets).unwrap();
    assert_eq!(
        device.compile_pipeline(program, &triangles, &targets).unwrap(),
        first
    );

    device.compile_pipeline(program, &points, &targets).unwrap();
    assert_eq!(device.program(program).unwrap().variant_count(), 2);
    assert_eq!(device.pending_deletions(), 1);
    let cached: Vec<_> = device.program(program).unwrap().variant_states().collect();
    assert!(cached.contains(&triangles));
    assert!(!cached.contains(&lines));

    device.wait_idle().unwrap();
    assert_eq!(device.pending_deletions(), 0);
    assert!(device.backend().validation_errors().is_empty());
}

#[test]
fn compute_programs_compile_once() {
    let mut device = common::device();
    let compute = common::shader(&mut device, ShaderStage::Compute);
    let program = device
        .create_pipeline_program(ProgramDesc::compute(compute))
        .unwrap();

    let first = device.compile_compute_pipeline(program).unwrap();
    assert_eq!(device.compile_compute_pipeline(program).unwrap(), first);
    assert!(matches!(
        device.compile_pipeline(program, &RenderState::default(), &color_targets()),
        Err(GpuError::PipelineCreation(_))
    ));
    assert_eq!(device.backend().stats().pipelines_created, 1);
}

#[test]
fn program_creation_validates_stages_and_push_constants() {
    let mut device = common::device();
    let vertex = common::shader(&mut device, ShaderStage::Vertex);
    let fragment = common::shader(&mut device, ShaderStage::Fragment);

    assert!(device
        .create_pipeline_program(ProgramDesc::graphics(fragment, vertex))
        .is_err());
    assert!(device
        .create_pipeline_program(ProgramDesc::compute(vertex))
        .is_err());
    assert!(device
        .create_pipeline_program(ProgramDesc::graphics(vertex, fragment).with_push_constants(6))
        .is_err());
    assert!(device
        .create_pipeline_program(
            ProgramDesc::graphics(vertex, fragment).with_push_constants(1 << 20)
        )
        .is_err());
    assert!(device
        .create_shader(&tessera_gpu::ShaderDesc::new(ShaderStage::Vertex, &[]))
        .is_err());
}

#[test]
fn render_target_passes_share_a_framebuffer() {
    let mut device = common::device();
    let color = device
        .create_image(ImageDesc::new_2d(
            64,
            64,
            vk::Format::R8G8B8A8_UNORM,
            ImageUsage::COLOR_TARGET | ImageUsage::SAMPLED,
        ))
        .unwrap();
    let depth = device
        .create_image(ImageDesc::new_2d(
            64,
            64,
            vk::Format::D32_SFLOAT,
            ImageUsage::DEPTH_TARGET,
        ))
        .unwrap();
    let small = device
        .create_image(ImageDesc::new_2d(
            32,
            32,
            vk::Format::R8G8B8A8_UNORM,
            ImageUsage::COLOR_TARGET,
        ))
        .unwrap();

    assert!(device.create_render_target(&[color, small], None).is_err());
    assert!(device.create_render_target(&[], None).is_err());

    let target = device.create_render_target(&[color], Some(depth)).unwrap();
    let clear = device
        .get_or_create_render_target_pass(target, &[LoadOp::Clear, LoadOp::Clear])
        .unwrap();
    let load = device
        .get_or_create_render_target_pass(target, &[LoadOp::Load, LoadOp::Clear])
        .unwrap();
    assert_ne!(clear, load);
    assert_eq!(
        device
            .get_or_create_render_target_pass(target, &[LoadOp::Clear, LoadOp::Clear])
            .unwrap(),
        clear
    );
    assert!(device
        .get_or_create_render_target_pass(target, &[LoadOp::Clear])
        .is_err());

    assert_eq!(device.render_target(target).unwrap().pass_count(), 2);
    assert_eq!(device.backend().stats().framebuffers_created, 1);

    device.destroy_render_target(target).unwrap();
    device.wait_idle().unwrap();
    // The attachments outlive the target.
    assert!(device.image(color).is_ok());
    assert!(device.backend().validation_errors().is_empty());
}

#[test]
fn draw_in_render_pass_transitions_attachments() {
    let mut device = common::device();
    let color = device
        .create_image(ImageDesc::new_2d(
            16,
            16,
            vk::Format::R8G8B8A8_UNORM,
            ImageUsage::COLOR_TARGET | ImageUsage::SAMPLED,
        ))
        .unwrap();
    let target = device.create_render_target(&[color], None).unwrap();
    let program = graphics_program(&mut device);
    let clear = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: [0.0, 0.0, 0.0, 1.0],
        },
    }];

    {
        let mut cmd = device.get_graphics_command().unwrap();
        cmd.begin().unwrap();
        // Pipelines need the pass for their attachment formats.
        assert!(cmd
            .bind_graphics_pipeline(program, &RenderState::no_depth())
            .is_err());
        cmd.begin_render_pass(target, &[LoadOp::Clear], &clear).unwrap();
        assert!(cmd.draw(3, 1, 0, 0).is_err());
        cmd.bind_graphics_pipeline(program, &RenderState::no_depth())
            .unwrap();
        cmd.push_constants(0, &[1.0f32; 16]).unwrap();
        assert!(cmd.push_constants(8, &[0.0f32; 16]).is_err());
        cmd.draw(3, 1, 0, 0).unwrap();
        assert!(cmd.end().is_err());
        cmd.end_render_pass().unwrap();
        cmd.image_barrier(color, ImageUsageState::ShaderRead).unwrap();
        cmd.submit_blocking().unwrap();
    }

    let submitted = device.backend().submitted_commands();
    let first_barrier = submitted
        .iter()
        .find_map(|command| match command {
            RecordedCommand::PipelineBarrier { images, .. } => images.first().copied(),
            _ => None,
        })
        .unwrap();
    assert_eq!(first_barrier.old_layout, vk::ImageLayout::UNDEFINED);
    assert_eq!(
        first_barrier.new_layout,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    );
    assert!(submitted.iter().any(|command| matches!(
        command,
        RecordedCommand::Draw {
            vertex_count: 3,
            instance_count: 1
        }
    )));
    assert!(matches!(
        submitted.last(),
        Some(RecordedCommand::PipelineBarrier { .. })
    ));
    assert_eq!(
        device.image_usage(color).unwrap(),
        ImageUsageState::ShaderRead
    );
}
