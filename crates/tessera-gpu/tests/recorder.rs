mod common;

use ash::vk;
use tessera_gpu::backend::headless::RecordedCommand;
use tessera_gpu::{
    BufferAccess, BufferDesc, BufferHandle, BufferUsage, CompletionMode, Device, DeviceConfig,
    GpuError, HeadlessBackend, ImageDesc, ImageUsage, ImageUsageState, MemoryResidency,
    RecorderState, SubmitOptions,
};

fn device_buffer(
    device: &mut Device<HeadlessBackend>,
    usage: BufferUsage,
    size: u64,
) -> BufferHandle {
    device
        .create_buffer(BufferDesc::new(size, usage, MemoryResidency::DeviceLocal))
        .unwrap()
}

#[test]
fn recorder_state_machine() {
    let mut device = common::device();
    let buffer = device_buffer(&mut device, BufferUsage::TRANSFER_DST, 64);

    let mut cmd = device.get_transfer_command().unwrap();
    assert_eq!(cmd.state(), RecorderState::Initial);
    assert!(matches!(
        cmd.upload_buffer(buffer, 0, &[0u8; 4]),
        Err(GpuError::InvalidRecorderState { .. })
    ));
    assert!(cmd.submit(&SubmitOptions::new()).is_err());

    cmd.begin().unwrap();
    assert!(cmd.begin().is_err());
    assert_eq!(cmd.state(), RecorderState::Recording);
    assert!(cmd.end_render_pass().is_err());

    cmd.end().unwrap();
    assert_eq!(cmd.state(), RecorderState::Executable);
    assert!(cmd.upload_buffer(buffer, 0, &[0u8; 4]).is_err());

    cmd.submit_blocking().unwrap();
    assert_eq!(cmd.state(), RecorderState::Submitted);
    assert!(cmd.submit(&SubmitOptions::new()).is_err());
}

#[test]
fn dropped_recorder_releases_staging_and_command_buffer() {
    let mut device = common::device();
    let dst = device_buffer(&mut device, BufferUsage::TRANSFER_DST, 64);
    // Creates the transfer pool up front.
    drop(device.get_transfer_command().unwrap());
    let live = device.backend().stats().live_objects;

    {
        let mut cmd = device.get_transfer_command().unwrap();
        cmd.begin().unwrap();
        cmd.upload_buffer(dst, 0, &[1u32; 16]).unwrap();
    }

    assert_eq!(device.backend().stats().live_objects, live);
    assert_eq!(device.backend().stats().buffers_created, 2);
    assert_eq!(device.backend().stats().submissions, 0);
    assert_eq!(device.pending_deletions(), 0);
    let raw = device.buffer(dst).unwrap().raw();
    assert!(device.backend().read_buffer(raw).unwrap().iter().all(|&b| b == 0));
    assert!(device.backend().validation_errors().is_empty());
}

#[test]
fn unsubmitted_transitions_are_rolled_back() {
    let mut device = common::device();
    let image = device
        .create_image(ImageDesc::new_2d(
            4,
            4,
            vk::Format::R8G8B8A8_UNORM,
            ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
        ))
        .unwrap();

    {
        let mut cmd = device.get_graphics_command().unwrap();
        cmd.begin().unwrap();
        cmd.image_barrier(image, ImageUsageState::TransferDst).unwrap();
        cmd.image_barrier(image, ImageUsageState::ShaderRead).unwrap();
    }
    assert_eq!(device.image_usage(image).unwrap(), ImageUsageState::Undefined);

    let mut cmd = device.get_graphics_command().unwrap();
    cmd.begin().unwrap();
    cmd.image_barrier(image, ImageUsageState::ShaderRead).unwrap();
    cmd.submit_blocking().unwrap();
    drop(cmd);
    assert_eq!(device.image_usage(image).unwrap(), ImageUsageState::ShaderRead);
    assert!(device.backend().validation_errors().is_empty());
}

#[test]
fn failed_submit_releases_everything_the_recorder_owns() {
    common::init_tracing();
    let mut device = common::device();
    let image = device
        .create_image(ImageDesc::new_2d(
            2,
            2,
            vk::Format::R8G8B8A8_UNORM,
            ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
        ))
        .unwrap();
    drop(device.get_transfer_command().unwrap());
    let live = device.backend().stats().live_objects;

    device.backend_mut().fail_next_submit();
    {
        let mut cmd = device.get_transfer_command().unwrap();
        cmd.begin().unwrap();
        cmd.upload_image(image, &[7u8; 16]).unwrap();
        assert!(matches!(
            cmd.submit(&SubmitOptions::new()),
            Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
        ));
        assert_eq!(cmd.state(), RecorderState::Executable);
    }

    assert_eq!(device.backend().stats().live_objects, live);
    assert_eq!(device.pending_deletions(), 0);
    assert_eq!(device.image_usage(image).unwrap(), ImageUsageState::Undefined);
    assert!(device.backend().pending_fences().is_empty());
    assert!(device.backend().validation_errors().is_empty());
}

#[test]
fn transient_work_is_released_once_its_fence_signals() {
    common::init_tracing();
    let backend = HeadlessBackend::new().with_completion(CompletionMode::Manual);
    let mut device = Device::new(backend, DeviceConfig::default()).unwrap();
    let dst = device_buffer(&mut device, BufferUsage::TRANSFER_DST | BufferUsage::VERTEX, 48);

    {
        let mut cmd = device.get_transfer_command().unwrap();
        cmd.begin().unwrap();
        cmd.upload_buffer(dst, 0, &[[0.0f32, 0.5, 0.0], [-0.5, -0.5, 0.0], [0.5, -0.5, 0.0]])
            .unwrap();
        cmd.buffer_barrier(dst, BufferAccess::TransferWrite, BufferAccess::VertexRead)
            .unwrap();
        cmd.submit(&SubmitOptions::new()).unwrap();
    }

    // Staging buffer and command buffer.
    assert_eq!(device.pending_deletions(), 2);
    assert_eq!(device.collect_garbage().unwrap(), 0);
    assert_eq!(device.backend().pending_fences().len(), 1);

    device.backend_mut().complete_pending();
    assert_eq!(device.collect_garbage().unwrap(), 2);
    assert_eq!(device.pending_deletions(), 0);

    let raw = device.buffer(dst).unwrap().raw();
    let uploaded = device.backend().read_buffer(raw).unwrap();
    assert_eq!(&uploaded[12..16], &(-0.5f32).to_ne_bytes());

    let barrier = device
        .backend()
        .submitted_commands()
        .iter()
        .find_map(|command| match command {
            RecordedCommand::PipelineBarrier { buffers, .. } if !buffers.is_empty() => {
                Some(buffers.clone())
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(barrier, vec![raw]);
    assert!(device.backend().validation_errors().is_empty());
}

#[test]
fn transfers_check_usage_and_bounds() {
    let mut device = common::device();
    let src = device.create_buffer(BufferDesc::staging(16)).unwrap();
    let dst = device_buffer(&mut device, BufferUsage::TRANSFER_DST | BufferUsage::UNIFORM, 16);

    let mut cmd = device.get_transfer_command().unwrap();
    cmd.begin().unwrap();
    assert!(cmd.copy_buffer(src, 0, dst, 0, 32).is_err());
    assert!(cmd.copy_buffer(src, 8, dst, 0, 16).is_err());
    assert!(cmd.bind_vertex_buffer(0, dst, 0).is_err());
    assert!(cmd.bind_index_buffer(dst, 0, vk::IndexType::UINT16).is_err());
    assert!(cmd.dispatch(1, 1, 1).is_err());
    cmd.copy_buffer(src, 0, dst, 0, 16).unwrap();
    cmd.submit_blocking().unwrap();
    drop(cmd);

    assert_eq!(device.backend().stats().submissions, 1);
    assert!(matches!(
        device.backend().submitted_commands(),
        [RecordedCommand::CopyBuffer { .. }]
    ));
}
