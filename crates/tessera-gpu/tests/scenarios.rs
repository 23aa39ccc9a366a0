//! End-to-end flows through the device on the headless backend.

mod common;

use ash::vk;
use tessera_gpu::backend::headless::RecordedCommand;
use tessera_gpu::{
    BindingResource, BufferDesc, BufferUsage, DescriptorLayoutDesc, ImageDesc, ImageUsage,
    ImageUsageState, MemoryResidency,
};

#[test]
fn uniform_buffer_upload_realizes_one_descriptor_set() {
    let mut device = common::device();

    let uniforms = device
        .create_buffer(
            BufferDesc::new(
                256,
                BufferUsage::UNIFORM | BufferUsage::TRANSFER_DST,
                MemoryResidency::DeviceLocal,
            )
            .with_label("camera"),
        )
        .unwrap();

    let identity: [f32; 16] = [
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ];
    {
        let mut cmd = device.get_transfer_command().unwrap();
        cmd.begin().unwrap();
        cmd.upload_buffer(uniforms, 0, &identity).unwrap();
        cmd.submit_blocking().unwrap();
    }

    let raw = device.buffer(uniforms).unwrap().raw();
    let contents = device.backend().read_buffer(raw).unwrap();
    assert_eq!(contents.len(), 256);
    assert_eq!(&contents[..64], bytemuck::cast_slice::<f32, u8>(&identity));
    assert!(contents[64..].iter().all(|&b| b == 0));

    let layout = device
        .create_descriptor_layout(
            DescriptorLayoutDesc::new().uniform_buffer(0, vk::ShaderStageFlags::VERTEX),
        )
        .unwrap();
    let set = device.create_descriptor_set(layout).unwrap();
    device
        .bind_descriptor(set, 0, BindingResource::buffer(uniforms))
        .unwrap();

    let first = device.realize_descriptor_set(set).unwrap();
    let second = device.realize_descriptor_set(set).unwrap();

    assert_eq!(first, second);
    assert_eq!(device.descriptor_sets_allocated(), 1);
    assert_eq!(device.backend().stats().descriptor_sets_allocated, 1);

    let writes = device.backend().descriptor_writes(first).unwrap();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].binding, 0);

    // The staging buffer is released with its submission.
    assert_eq!(device.pending_deletions(), 0);
    assert_eq!(device.backend().stats().buffers_created, 2);
    assert!(device.backend().validation_errors().is_empty());

    device.destroy_descriptor_set(set).unwrap();
    device.destroy_descriptor_layout(layout).unwrap();
    device.destroy_buffer(uniforms).unwrap();
}

#[test]
fn transfer_then_sample_chains_two_barriers() {
    let mut device = common::device();
    let image = device
        .create_image(ImageDesc::new_2d(
            4,
            4,
            vk::Format::R8G8B8A8_UNORM,
            ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
        ))
        .unwrap();
    let raw = device.image(image).unwrap().raw();
    device.backend_mut().clear_submitted();

    {
        let mut cmd = device.get_graphics_command().unwrap();
        cmd.begin().unwrap();
        cmd.image_barrier(image, ImageUsageState::TransferDst).unwrap();
        cmd.image_barrier(image, ImageUsageState::ShaderRead).unwrap();
        cmd.submit_blocking().unwrap();
    }

    let transitions: Vec<_> = device
        .backend()
        .submitted_commands()
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::PipelineBarrier { images, .. } => Some(images.clone()),
            _ => None,
        })
        .flatten()
        .filter(|transition| transition.image == raw)
        .collect();

    assert_eq!(transitions.len(), 2);
    let (first, second) = (transitions[0], transitions[1]);

    assert_eq!(first.old_layout, vk::ImageLayout::UNDEFINED);
    assert_eq!(first.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    assert_eq!(first.dst_access, vk::AccessFlags2::TRANSFER_WRITE);

    assert_eq!(second.old_layout, first.new_layout);
    assert_eq!(second.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    // The write performed in the first usage is what the second waits on.
    assert_eq!(second.src_access, vk::AccessFlags2::TRANSFER_WRITE);
    assert_eq!(second.src_stage, first.dst_stage);
    assert!(second.dst_access.contains(vk::AccessFlags2::SHADER_SAMPLED_READ));

    assert_eq!(
        device.image_usage(image).unwrap(),
        ImageUsageState::ShaderRead
    );
    device.destroy_image(image).unwrap();
}

#[test]
fn texture_upload_lands_in_image_memory() {
    let mut device = common::device();
    let image = device
        .create_image(ImageDesc::new_2d(
            2,
            2,
            vk::Format::R8G8B8A8_UNORM,
            ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
        ))
        .unwrap();
    let texels: Vec<u8> = (0..16).collect();

    {
        let mut cmd = device.get_transfer_command().unwrap();
        cmd.begin().unwrap();
        assert!(cmd.upload_image(image, &texels[..15]).is_err());
        cmd.upload_image(image, &texels).unwrap();
        cmd.image_barrier(image, ImageUsageState::ShaderRead).unwrap();
        cmd.submit_blocking().unwrap();
    }

    let raw = device.image(image).unwrap().raw();
    assert_eq!(device.backend().read_image(raw).unwrap(), texels);
    assert_eq!(
        device.image_usage(image).unwrap(),
        ImageUsageState::ShaderRead
    );
}
