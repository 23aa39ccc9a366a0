mod common;

use ash::vk;
use tessera_gpu::backend::headless::RecordedCommand;
use tessera_gpu::{
    BindingKind, BindingResource, BufferDesc, BufferHandle, BufferUsage, DescriptorLayoutDesc, Device,
    DeviceConfig, GpuError, HeadlessBackend, ImageDesc, ImageUsage, MemoryResidency, ProgramDesc,
    SamplerDesc, ShaderStage,
};

fn uniform(device: &mut Device<HeadlessBackend>, label: &str) -> BufferHandle {
    device
        .create_buffer(
            BufferDesc::new(256, BufferUsage::UNIFORM, MemoryResidency::HostVisible)
                .with_label(label),
        )
        .unwrap()
}

#[test]
fn rebinding_realizes_a_new_instance() {
    let mut device = common::device();
    let a = uniform(&mut device, "a");
    let b = uniform(&mut device, "b");
    let layout = device
        .create_descriptor_layout(
            DescriptorLayoutDesc::new().uniform_buffer(0, vk::ShaderStageFlags::ALL_GRAPHICS),
        )
        .unwrap();
    let set = device.create_descriptor_set(layout).unwrap();

    device.bind_descriptor(set, 0, BindingResource::buffer(a)).unwrap();
    let first = device.realize_descriptor_set(set).unwrap();
    assert_eq!(device.realize_descriptor_set(set).unwrap(), first);

    device.bind_descriptor(set, 0, BindingResource::buffer(b)).unwrap();
    let second = device.realize_descriptor_set(set).unwrap();
    assert_ne!(first, second);

    // Switching back finds the earlier instance in the history.
    device.bind_descriptor(set, 0, BindingResource::buffer(a)).unwrap();
    assert_eq!(device.realize_descriptor_set(set).unwrap(), first);

    assert_eq!(device.descriptor_sets_allocated(), 2);
    assert_eq!(device.descriptor_set(set).unwrap().instance_count(), 2);
    assert_eq!(device.backend().stats().descriptor_writes, 2);
}

#[test]
fn history_limit_retires_least_recently_used_instance() {
    let mut device = Device::new(
        HeadlessBackend::new(),
        DeviceConfig::default().with_descriptor_history_limit(2),
    )
    .unwrap();
    let buffers: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|label| uniform(&mut device, label))
        .collect();
    let layout = device
        .create_descriptor_layout(
            DescriptorLayoutDesc::new().uniform_buffer(0, vk::ShaderStageFlags::VERTEX),
        )
        .unwrap();
    let set = device.create_descriptor_set(layout).unwrap();
    let realize = |device: &mut Device<HeadlessBackend>, buffer| {
        device
            .bind_descriptor(set, 0, BindingResource::buffer(buffer))
            .unwrap();
        device.realize_descriptor_set(set).unwrap()
    };

    let _a = realize(&mut device, buffers[0]);
    let b = realize(&mut device, buffers[1]);
    realize(&mut device, buffers[0]);
    assert_eq!(device.pending_deletions(), 0);

    // `b` is now the least recently used of the two.
    realize(&mut device, buffers[2]);
    assert_eq!(device.descriptor_set(set).unwrap().instance_count(), 2);
    assert_eq!(device.pending_deletions(), 1);

    let b_again = realize(&mut device, buffers[1]);
    assert_ne!(b, b_again);
    assert_eq!(device.descriptor_sets_allocated(), 4);

    device.wait_idle().unwrap();
    assert_eq!(device.pending_deletions(), 0);
    assert_eq!(device.backend().stats().descriptor_sets_freed, 2);
    assert!(device.backend().validation_errors().is_empty());
}

#[test]
fn exhausted_pools_are_chained() {
    let mut device = Device::new(
        HeadlessBackend::new(),
        DeviceConfig::default().with_descriptor_pool_max_sets(2),
    )
    .unwrap();
    let layout = device
        .create_descriptor_layout(
            DescriptorLayoutDesc::new().uniform_buffer(0, vk::ShaderStageFlags::FRAGMENT),
        )
        .unwrap();

    for i in 0..5 {
        let buffer = uniform(&mut device, &format!("u{i}"));
        let set = device.create_descriptor_set(layout).unwrap();
        device
            .bind_descriptor(set, 0, BindingResource::buffer(buffer))
            .unwrap();
        device.realize_descriptor_set(set).unwrap();
    }

    assert_eq!(device.descriptor_sets_allocated(), 5);
    assert_eq!(device.backend().stats().descriptor_pools_created, 3);
}

#[test]
fn realize_rejects_incomplete_and_invalid_bindings() {
    let mut device = common::device();
    let buffer = uniform(&mut device, "small");
    let image = device
        .create_image(ImageDesc::new_2d(
            8,
            8,
            vk::Format::R8G8B8A8_UNORM,
            ImageUsage::SAMPLED,
        ))
        .unwrap();
    let sampler = device.create_sampler(SamplerDesc::default()).unwrap();

    let layout = device
        .create_descriptor_layout(
            DescriptorLayoutDesc::new()
                .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
                .sampled_image(1, vk::ShaderStageFlags::FRAGMENT),
        )
        .unwrap();
    let set = device.create_descriptor_set(layout).unwrap();

    device.bind_descriptor(set, 0, BindingResource::buffer(buffer)).unwrap();
    assert!(matches!(
        device.realize_descriptor_set(set),
        Err(GpuError::InvalidBinding(_))
    ));

    // Kind mismatch and unknown slot.
    assert!(device
        .bind_descriptor(set, 1, BindingResource::buffer(buffer))
        .is_err());
    assert!(device
        .bind_descriptor(set, 7, BindingResource::buffer(buffer))
        .is_err());

    device
        .bind_descriptor(set, 1, BindingResource::sampled(image, sampler))
        .unwrap();
    device
        .bind_descriptor(set, 0, BindingResource::buffer_range(buffer, 200, 100))
        .unwrap();
    assert!(matches!(
        device.realize_descriptor_set(set),
        Err(GpuError::InvalidBinding(_))
    ));

    device
        .bind_descriptor(set, 0, BindingResource::buffer_range(buffer, 128, 128))
        .unwrap();
    let raw = device.realize_descriptor_set(set).unwrap();
    let writes = device.backend().descriptor_writes(raw).unwrap();
    assert_eq!(writes.len(), 2);
    assert_eq!(device.descriptor_sets_allocated(), 1);
}

#[test]
fn stale_resource_in_binding_is_an_error() {
    let mut device = common::device();
    let buffer = uniform(&mut device, "gone");
    let layout = device
        .create_descriptor_layout(
            DescriptorLayoutDesc::new().uniform_buffer(0, vk::ShaderStageFlags::VERTEX),
        )
        .unwrap();
    let set = device.create_descriptor_set(layout).unwrap();
    device.bind_descriptor(set, 0, BindingResource::buffer(buffer)).unwrap();
    device.destroy_buffer(buffer).unwrap();

    assert!(matches!(
        device.realize_descriptor_set(set),
        Err(GpuError::InvalidHandle(_))
    ));
}

#[test]
fn dynamic_offsets_reuse_the_instance() {
    let mut device = common::device();
    let buffer = device
        .create_buffer(BufferDesc::new(
            1024,
            BufferUsage::UNIFORM,
            MemoryResidency::HostVisible,
        ))
        .unwrap();
    let layout = device
        .create_descriptor_layout(
            DescriptorLayoutDesc::new().dynamic_uniform_buffer(0, vk::ShaderStageFlags::COMPUTE),
        )
        .unwrap();
    let set = device.create_descriptor_set(layout).unwrap();
    device
        .bind_descriptor(set, 0, BindingResource::buffer_range(buffer, 0, 64))
        .unwrap();

    let compute = common::shader(&mut device, ShaderStage::Compute);
    let program = device
        .create_pipeline_program(ProgramDesc::compute(compute).with_set_layouts(vec![layout]))
        .unwrap();

    {
        let mut cmd = device.get_compute_command().unwrap();
        cmd.begin().unwrap();
        cmd.bind_compute_pipeline(program).unwrap();
        cmd.bind_descriptor_set(0, set).unwrap();
        cmd.dispatch(1, 1, 1).unwrap();
        cmd.submit_blocking().unwrap();
    }
    device.set_dynamic_offset(set, 0, 512).unwrap();
    {
        let mut cmd = device.get_compute_command().unwrap();
        cmd.begin().unwrap();
        cmd.bind_compute_pipeline(program).unwrap();
        cmd.bind_descriptor_set(0, set).unwrap();
        cmd.dispatch(1, 1, 1).unwrap();
        cmd.submit_blocking().unwrap();
    }

    assert_eq!(device.descriptor_sets_allocated(), 1);
    let offsets: Vec<_> = device
        .backend()
        .submitted_commands()
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::BindDescriptorSet {
                dynamic_offsets, ..
            } => Some(dynamic_offsets.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(offsets, vec![vec![0], vec![512]]);
}

#[test]
fn dynamic_offsets_are_aligned_and_bounded() {
    let mut device = common::device();
    let uniform_alignment = device.capabilities().min_uniform_buffer_offset_alignment;
    let buffer = device
        .create_buffer(
            BufferDesc::new(
                4 * uniform_alignment,
                BufferUsage::UNIFORM | BufferUsage::STORAGE,
                MemoryResidency::HostVisible,
            )
            .with_label("per-draw"),
        )
        .unwrap();
    let layout = device
        .create_descriptor_layout(
            DescriptorLayoutDesc::new()
                .dynamic_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
                .binding(1, BindingKind::DynamicStorageBuffer, vk::ShaderStageFlags::COMPUTE)
                .uniform_buffer(2, vk::ShaderStageFlags::FRAGMENT),
        )
        .unwrap();
    let set = device.create_descriptor_set(layout).unwrap();
    device
        .bind_descriptor(
            set,
            0,
            BindingResource::buffer_range(buffer, 0, uniform_alignment),
        )
        .unwrap();
    device
        .bind_descriptor(set, 1, BindingResource::buffer_range(buffer, 0, 16))
        .unwrap();
    device
        .bind_descriptor(set, 2, BindingResource::buffer(buffer))
        .unwrap();

    let misaligned = u32::try_from(uniform_alignment).unwrap() + 4;
    assert!(matches!(
        device.set_dynamic_offset(set, 0, misaligned),
        Err(GpuError::InvalidBinding(_))
    ));
    let past_end = u32::try_from(4 * uniform_alignment).unwrap();
    assert!(matches!(
        device.set_dynamic_offset(set, 0, past_end),
        Err(GpuError::InvalidBinding(_))
    ));
    assert!(device.set_dynamic_offset(set, 2, 0).is_err());

    let last = u32::try_from(3 * uniform_alignment).unwrap();
    device.set_dynamic_offset(set, 0, last).unwrap();
    let storage_alignment = device.capabilities().min_storage_buffer_offset_alignment;
    device
        .set_dynamic_offset(set, 1, u32::try_from(storage_alignment).unwrap())
        .unwrap();

    let set_offsets = device.descriptor_set(set).unwrap().dynamic_offsets().to_vec();
    assert_eq!(set_offsets, vec![last, u32::try_from(storage_alignment).unwrap()]);
    device.realize_descriptor_set(set).unwrap();

    // A shorter buffer bound afterwards no longer fits the offset.
    let small = uniform(&mut device, "small");
    device
        .bind_descriptor(
            set,
            0,
            BindingResource::buffer_range(small, 0, uniform_alignment),
        )
        .unwrap();
    assert!(matches!(
        device.realize_descriptor_set(set),
        Err(GpuError::InvalidBinding(_))
    ));
}
