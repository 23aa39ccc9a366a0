#![allow(dead_code)]

use std::sync::Once;

use tessera_gpu::{
    AcquireOutcome, CompletionMode, Device, DeviceConfig, HeadlessBackend, PresentOutcome,
    ShaderDesc, ShaderHandle, ShaderStage, SubmitOptions,
};

/// SPIR-V magic followed by a few filler words. The headless backend only
/// rejects empty modules.
pub const SPIRV: [u32; 5] = [0x0723_0203, 0x0001_0600, 0, 1, 0];

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Device without a surface.
pub fn device() -> Device<HeadlessBackend> {
    init_tracing();
    Device::new(HeadlessBackend::new(), DeviceConfig::default()).unwrap()
}

/// Device with a three-image virtual swapchain.
pub fn presenting_device(config: DeviceConfig) -> Device<HeadlessBackend> {
    init_tracing();
    Device::new(HeadlessBackend::new().with_swapchain(640, 480, 3), config).unwrap()
}

/// Device whose fences only signal when told to.
pub fn manual_device(config: DeviceConfig) -> Device<HeadlessBackend> {
    init_tracing();
    let backend = HeadlessBackend::new()
        .with_swapchain(640, 480, 3)
        .with_completion(CompletionMode::Manual);
    Device::new(backend, config).unwrap()
}

pub fn shader(device: &mut Device<HeadlessBackend>, stage: ShaderStage) -> ShaderHandle {
    device.create_shader(&ShaderDesc::new(stage, &SPIRV)).unwrap()
}

/// Acquire, record nothing but the present transition, submit and present.
pub fn run_empty_frame(device: &mut Device<HeadlessBackend>) -> PresentOutcome {
    let outcome = device.acquire_frame().unwrap();
    assert!(matches!(outcome, AcquireOutcome::Ready { .. }));
    let mut cmd = device.frame_command().unwrap();
    cmd.begin().unwrap();
    cmd.submit(&SubmitOptions::new()).unwrap();
    drop(cmd);
    device.present_frame().unwrap()
}
