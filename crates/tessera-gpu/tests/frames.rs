mod common;

use std::thread;
use std::time::{Duration, Instant};

use ash::vk;
use tessera_gpu::backend::headless::RecordedCommand;
use tessera_gpu::backend::PresentStatus;
use tessera_gpu::{
    AcquireOutcome, BufferDesc, BufferUsage, DeviceConfig, FramePhase, GpuError, ImageUsageState,
    LoadOp, MemoryResidency, PresentOutcome, SubmitOptions,
};

#[test]
fn frame_after_n_in_flight_waits_for_first_fence() {
    let config = DeviceConfig::default()
        .with_frames_in_flight(2)
        .with_fence_timeout_ns(20_000_000);
    let mut device = common::manual_device(config);

    assert_eq!(common::run_empty_frame(&mut device), PresentOutcome::Presented);
    assert_eq!(common::run_empty_frame(&mut device), PresentOutcome::Presented);

    // Back on context 0, whose submission has not completed.
    assert_eq!(device.scheduler().current_index(), 0);
    let fence = device.scheduler().current().fence();
    assert!(!device.backend().is_fence_signaled(fence));

    let started = Instant::now();
    assert!(matches!(
        device.acquire_frame(),
        Err(GpuError::Vulkan(vk::Result::TIMEOUT))
    ));
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(device.scheduler().phase(), FramePhase::Idle);

    // Completing frame 0 alone unblocks frame 2.
    device.backend().fence_signaler(fence).unwrap().signal();
    assert!(matches!(
        device.acquire_frame().unwrap(),
        AcquireOutcome::Ready { .. }
    ));
    let other = device.scheduler().context(1).unwrap().fence();
    assert!(!device.backend().is_fence_signaled(other));
}

#[test]
fn blocked_acquire_resumes_when_gpu_catches_up() {
    let mut device = common::manual_device(DeviceConfig::default().with_frames_in_flight(2));
    common::run_empty_frame(&mut device);
    common::run_empty_frame(&mut device);

    let fence = device.scheduler().current().fence();
    let signaler = device.backend().fence_signaler(fence).unwrap();
    let delay = Duration::from_millis(50);

    let started = Instant::now();
    let gpu = thread::spawn({
        let signaler = signaler.clone();
        move || {
            thread::sleep(delay);
            signaler.signal();
        }
    });
    let outcome = device.acquire_frame().unwrap();
    let waited = started.elapsed();
    gpu.join().unwrap();

    assert!(matches!(outcome, AcquireOutcome::Ready { .. }));
    assert!(waited >= delay);
    // Reset again for this frame's submission.
    assert!(!signaler.is_signaled());
    assert_eq!(device.frame_number(), 2);
}

#[test]
fn frame_protocol_is_enforced() {
    let mut device = common::presenting_device(DeviceConfig::default());

    assert!(device.frame_command().is_err());
    assert!(device.present_frame().is_err());

    device.acquire_frame().unwrap();
    assert!(device.acquire_frame().is_err());
    assert!(device.present_frame().is_err());
    assert!(device.current_swapchain_image().is_some());

    {
        let mut cmd = device.frame_command().unwrap();
        cmd.begin().unwrap();
        assert!(cmd.submit_blocking().is_err());
        cmd.submit(&SubmitOptions::new()).unwrap();
    }
    assert!(matches!(device.scheduler().phase(), FramePhase::Submitted { .. }));
    assert!(device.frame_command().is_err());

    assert_eq!(device.present_frame().unwrap(), PresentOutcome::Presented);
    assert_eq!(device.scheduler().phase(), FramePhase::Idle);
    assert_eq!(device.frame_number(), 1);
    assert!(device.backend().validation_errors().is_empty());
}

#[test]
fn frame_end_hands_swapchain_image_to_presentation() {
    let mut device = common::presenting_device(DeviceConfig::default());
    let targets: Vec<_> = device
        .swapchain_images()
        .to_vec()
        .into_iter()
        .map(|image| device.create_render_target(&[image], None).unwrap())
        .collect();
    let clear = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: [0.1, 0.2, 0.3, 1.0],
        },
    }];

    for _ in 0..4 {
        let AcquireOutcome::Ready { image_index, .. } = device.acquire_frame().unwrap() else {
            panic!("virtual swapchain never goes out of date on its own");
        };
        let image = device.current_swapchain_image().unwrap();
        let raw = device.image(image).unwrap().raw();
        device.backend_mut().clear_submitted();

        {
            let mut cmd = device.frame_command().unwrap();
            cmd.begin().unwrap();
            cmd.begin_render_pass(targets[image_index as usize], &[LoadOp::Clear], &clear)
                .unwrap();
            cmd.end_render_pass().unwrap();
            cmd.submit(&SubmitOptions::new()).unwrap();
        }

        let layouts: Vec<_> = device
            .backend()
            .submitted_commands()
            .iter()
            .filter_map(|command| match command {
                RecordedCommand::PipelineBarrier { images, .. } => Some(images.clone()),
                _ => None,
            })
            .flatten()
            .filter(|transition| transition.image == raw)
            .map(|transition| (transition.old_layout, transition.new_layout))
            .collect();
        let expected_first = if device.frame_number() < 3 {
            vk::ImageLayout::UNDEFINED
        } else {
            vk::ImageLayout::PRESENT_SRC_KHR
        };
        assert_eq!(
            layouts,
            vec![
                (expected_first, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
                (
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::ImageLayout::PRESENT_SRC_KHR
                ),
            ]
        );
        assert_eq!(device.image_usage(image).unwrap(), ImageUsageState::Present);
        assert_eq!(device.present_frame().unwrap(), PresentOutcome::Presented);
    }
    assert_eq!(device.backend().stats().presents, 4);
}

#[test]
fn destroyed_buffer_outlives_in_flight_frames() {
    let mut device = common::presenting_device(DeviceConfig::default().with_frames_in_flight(2));
    let buffer = device
        .create_buffer(BufferDesc::new(
            64,
            BufferUsage::VERTEX,
            MemoryResidency::HostVisibleCoherent,
        ))
        .unwrap();
    let live_before = device.backend().stats().live_objects;

    device.destroy_buffer(buffer).unwrap();
    assert!(device.buffer(buffer).is_err());
    assert_eq!(device.pending_deletions(), 1);

    common::run_empty_frame(&mut device);
    common::run_empty_frame(&mut device);
    common::run_empty_frame(&mut device);
    assert_eq!(device.pending_deletions(), 1);
    assert_eq!(device.backend().stats().live_objects, live_before);

    // Frame 3 can no longer reference anything retired during frame 0.
    device.acquire_frame().unwrap();
    assert_eq!(device.pending_deletions(), 0);
    assert_eq!(device.backend().stats().live_objects, live_before - 1);
}

#[test]
fn out_of_date_acquire_rebuilds_and_retries() {
    let mut device = common::presenting_device(DeviceConfig::default());
    let old_images = device.swapchain_images().to_vec();
    common::run_empty_frame(&mut device);

    device.backend_mut().fail_next_acquire();
    assert_eq!(device.acquire_frame().unwrap(), AcquireOutcome::OutOfDate);
    assert_eq!(device.scheduler().phase(), FramePhase::Idle);

    device.rebuild_swapchain(800, 600).unwrap();
    assert_eq!(
        device.swapchain_extent(),
        Some(vk::Extent2D {
            width: 800,
            height: 600
        })
    );
    assert_eq!(device.swapchain_images().len(), 3);
    for image in old_images {
        assert!(device.image(image).is_err());
    }

    assert_eq!(common::run_empty_frame(&mut device), PresentOutcome::Presented);
    assert_eq!(device.frame_number(), 2);
    assert!(device.backend().validation_errors().is_empty());
}

#[test]
fn suboptimal_present_keeps_the_frame_context() {
    let mut device = common::presenting_device(DeviceConfig::default());
    common::run_empty_frame(&mut device);
    let context = device.scheduler().current_index();

    device
        .backend_mut()
        .inject_present_status(PresentStatus::Suboptimal);
    let outcome = common::run_empty_frame(&mut device);
    assert_eq!(outcome, PresentOutcome::Suboptimal);
    assert!(outcome.needs_rebuild());
    assert_eq!(device.scheduler().current_index(), context);
    assert_eq!(device.frame_number(), 1);

    device.rebuild_swapchain(640, 480).unwrap();
    assert_eq!(common::run_empty_frame(&mut device), PresentOutcome::Presented);
    assert_eq!(device.frame_number(), 2);
}

#[test]
fn rebuild_rejects_devices_without_a_surface() {
    let mut device = common::device();
    assert!(device.acquire_frame().is_err());
    assert!(device.rebuild_swapchain(800, 600).is_err());
    assert!(device.swapchain_images().is_empty());
    assert_eq!(device.swapchain_extent(), None);
}
