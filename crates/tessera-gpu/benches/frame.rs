use ash::vk;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tessera_gpu::{
    BindingResource, BufferDesc, BufferUsage, DescriptorLayoutDesc, Device, DeviceConfig,
    HeadlessBackend, MemoryResidency, ProgramDesc, RenderState, ShaderDesc, ShaderStage,
    SubmitOptions, TargetLayout,
};

const SPIRV: [u32; 5] = [0x0723_0203, 0x0001_0600, 0, 1, 0];

fn descriptor_realize(c: &mut Criterion) {
    let mut device = Device::new(HeadlessBackend::new(), DeviceConfig::default()).unwrap();
    let buffers: Vec<_> = (0..4)
        .map(|_| {
            device
                .create_buffer(BufferDesc::new(
                    256,
                    BufferUsage::UNIFORM,
                    MemoryResidency::HostVisible,
                ))
                .unwrap()
        })
        .collect();
    let layout = device
        .create_descriptor_layout(
            DescriptorLayoutDesc::new()
                .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
                .uniform_buffer(1, vk::ShaderStageFlags::FRAGMENT),
        )
        .unwrap();
    let set = device.create_descriptor_set(layout).unwrap();

    c.bench_function("descriptor realize hit", |b| {
        device
            .bind_descriptor(set, 0, BindingResource::buffer(buffers[0]))
            .unwrap();
        device
            .bind_descriptor(set, 1, BindingResource::buffer(buffers[1]))
            .unwrap();
        b.iter(|| black_box(device.realize_descriptor_set(set).unwrap()));
    });

    c.bench_function("descriptor realize cycling 4 snapshots", |b| {
        let mut i = 0;
        b.iter(|| {
            device
                .bind_descriptor(set, 0, BindingResource::buffer(buffers[i % 4]))
                .unwrap();
            i += 1;
            black_box(device.realize_descriptor_set(set).unwrap())
        });
    });
}

fn pipeline_lookup(c: &mut Criterion) {
    let mut device = Device::new(HeadlessBackend::new(), DeviceConfig::default()).unwrap();
    let vertex = device
        .create_shader(&ShaderDesc::new(ShaderStage::Vertex, &SPIRV))
        .unwrap();
    let fragment = device
        .create_shader(&ShaderDesc::new(ShaderStage::Fragment, &SPIRV))
        .unwrap();
    let program = device
        .create_pipeline_program(ProgramDesc::graphics(vertex, fragment))
        .unwrap();
    let targets = TargetLayout::new(vec![vk::Format::B8G8R8A8_SRGB], Some(vk::Format::D32_SFLOAT));
    let state = RenderState::default();
    device.compile_pipeline(program, &state, &targets).unwrap();

    c.bench_function("pipeline variant hit", |b| {
        b.iter(|| black_box(device.compile_pipeline(program, &state, &targets).unwrap()));
    });
}

fn frame_loop(c: &mut Criterion) {
    let backend = HeadlessBackend::new().with_swapchain(1280, 720, 3);
    let mut device = Device::new(backend, DeviceConfig::default()).unwrap();

    c.bench_function("headless frame acquire/submit/present", |b| {
        b.iter(|| {
            device.acquire_frame().unwrap();
            let mut cmd = device.frame_command().unwrap();
            cmd.begin().unwrap();
            cmd.submit(&SubmitOptions::new()).unwrap();
            drop(cmd);
            device.backend_mut().clear_submitted();
            black_box(device.present_frame().unwrap())
        });
    });
}

criterion_group!(benches, descriptor_realize, pipeline_lookup, frame_loop);
criterion_main!(benches);
