//! Frame pacing.
//!
//! The scheduler owns N frame contexts and cycles through them. Acquiring
//! frame context `k` first waits on its fence, which the submission of frame
//! `k - N` signals, so at most N frames are ever in flight and the context's
//! command buffer is free for reuse once `acquire` returns.

use ash::vk;
use tracing::{error, trace};

use crate::backend::{AcquireStatus, Backend, PresentStatus, QueueKind, SemaphoreWait, SubmitRequest};
use crate::error::{GpuError, Result};

/// Result of [`FrameScheduler::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image is ready to be rendered into.
    Ready { image_index: u32, suboptimal: bool },
    /// The surface changed; rebuild the swapchain and try again.
    OutOfDate,
}

/// Result of [`FrameScheduler::present`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented, but the swapchain no longer matches the surface exactly.
    Suboptimal,
    /// Not presented; rebuild the swapchain.
    OutOfDate,
}

impl PresentOutcome {
    /// Returns `true` if swapchain-dependent resources should be rebuilt.
    pub fn needs_rebuild(self) -> bool {
        !matches!(self, Self::Presented)
    }
}

/// Where the current frame is in the acquire/submit/present protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    /// Waiting for `acquire`.
    Idle,
    /// Image acquired, commands may be recorded and submitted.
    Acquired { image_index: u32 },
    /// Commands submitted, waiting for `present`.
    Submitted { image_index: u32 },
}

/// Extra semaphores attached to a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    pub wait: Vec<SemaphoreWait>,
    pub signal: Vec<vk::Semaphore>,
}

impl SubmitOptions {
    /// No extra synchronization.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait on `semaphore` before `stage`.
    #[must_use]
    pub fn wait(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> Self {
        self.wait.push(SemaphoreWait { semaphore, stage });
        self
    }

    /// Signal `semaphore` on completion.
    #[must_use]
    pub fn signal(mut self, semaphore: vk::Semaphore) -> Self {
        self.signal.push(semaphore);
        self
    }
}

/// Synchronization primitives and command storage of one in-flight frame.
#[derive(Debug)]
pub struct FrameContext {
    fence: vk::Fence,
    image_acquired: vk::Semaphore,
    render_complete: vk::Semaphore,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    image_index: Option<u32>,
}

impl FrameContext {
    fn new<B: Backend>(backend: &mut B) -> Result<Self> {
        let command_pool = backend.create_command_pool(QueueKind::Graphics)?;
        let command_buffer = backend.allocate_command_buffer(command_pool)?;
        Ok(Self {
            fence: backend.create_fence(true)?,
            image_acquired: backend.create_semaphore()?,
            render_complete: backend.create_semaphore()?,
            command_pool,
            command_buffer,
            image_index: None,
        })
    }

    /// Fence signaled when this context's last submission completes.
    pub fn fence(&self) -> vk::Fence {
        self.fence
    }

    /// Semaphore signaled when the acquired image is available.
    pub fn image_acquired(&self) -> vk::Semaphore {
        self.image_acquired
    }

    /// Semaphore signaled when rendering into the acquired image completes.
    pub fn render_complete(&self) -> vk::Semaphore {
        self.render_complete
    }

    /// Primary command buffer of this context.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Swapchain image acquired for this context, if any.
    pub fn image_index(&self) -> Option<u32> {
        self.image_index
    }

    fn recreate_sync<B: Backend>(&mut self, backend: &mut B) -> Result<()> {
        backend.destroy_fence(self.fence);
        backend.destroy_semaphore(self.image_acquired);
        backend.destroy_semaphore(self.render_complete);
        self.fence = backend.create_fence(true)?;
        self.image_acquired = backend.create_semaphore()?;
        self.render_complete = backend.create_semaphore()?;
        self.image_index = None;
        Ok(())
    }

    fn destroy<B: Backend>(&self, backend: &mut B) {
        backend.destroy_fence(self.fence);
        backend.destroy_semaphore(self.image_acquired);
        backend.destroy_semaphore(self.render_complete);
        backend.destroy_command_pool(self.command_pool);
    }
}

/// Cycles N frame contexts through acquire, submit, and present.
#[derive(Debug)]
pub struct FrameScheduler {
    contexts: Vec<FrameContext>,
    current: usize,
    frame_number: u64,
    phase: FramePhase,
    fence_timeout_ns: u64,
}

impl FrameScheduler {
    /// Create `frames_in_flight` frame contexts.
    pub fn new<B: Backend>(
        backend: &mut B,
        frames_in_flight: usize,
        fence_timeout_ns: u64,
    ) -> Result<Self> {
        let mut contexts = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight.max(1) {
            contexts.push(FrameContext::new(backend)?);
        }

        Ok(Self {
            contexts,
            current: 0,
            frame_number: 0,
            phase: FramePhase::Idle,
            fence_timeout_ns,
        })
    }

    /// Number of frame contexts.
    pub fn frames_in_flight(&self) -> usize {
        self.contexts.len()
    }

    /// Index of the current frame context.
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Number of frames presented so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Current frame context.
    pub fn current(&self) -> &FrameContext {
        &self.contexts[self.current]
    }

    /// Frame context at `index`.
    pub fn context(&self, index: usize) -> Option<&FrameContext> {
        self.contexts.get(index)
    }

    /// Protocol phase of the current frame.
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Wait for the current context to retire, then acquire the next image.
    ///
    /// Blocks while the frame submitted N frames ago is still executing.
    pub fn acquire<B: Backend>(&mut self, backend: &mut B) -> Result<AcquireOutcome> {
        if self.phase != FramePhase::Idle {
            error!("Acquire called in phase {:?}", self.phase);
            return Err(GpuError::InvalidState(format!(
                "Cannot acquire a frame in phase {:?}",
                self.phase
            )));
        }

        let context = &mut self.contexts[self.current];
        trace!(
            "Frame {}: waiting on context {}",
            self.frame_number,
            self.current
        );
        backend
            .wait_for_fence(context.fence, self.fence_timeout_ns)
            .inspect_err(|e| error!("Frame fence wait failed: {e}"))?;

        match backend.acquire_next_image(context.image_acquired, self.fence_timeout_ns)? {
            AcquireStatus::OutOfDate => {
                trace!("Acquire reported an out-of-date swapchain");
                Ok(AcquireOutcome::OutOfDate)
            }
            AcquireStatus::Acquired {
                image_index,
                suboptimal,
            } => {
                // An out-of-date acquire must leave the fence signaled.
                backend.reset_fence(context.fence)?;
                backend.reset_command_pool(context.command_pool)?;
                context.image_index = Some(image_index);
                self.phase = FramePhase::Acquired { image_index };
                Ok(AcquireOutcome::Ready {
                    image_index,
                    suboptimal,
                })
            }
        }
    }

    /// Submit the current frame's command buffers.
    ///
    /// Waits on "image acquired" and signals "render complete" and the
    /// context fence, in addition to `options`.
    pub fn submit<B: Backend>(
        &mut self,
        backend: &mut B,
        command_buffers: &[vk::CommandBuffer],
        options: &SubmitOptions,
    ) -> Result<()> {
        let FramePhase::Acquired { image_index } = self.phase else {
            error!("Frame submit called in phase {:?}", self.phase);
            return Err(GpuError::InvalidState(format!(
                "Cannot submit a frame in phase {:?}",
                self.phase
            )));
        };

        let context = &self.contexts[self.current];
        let mut wait = Vec::with_capacity(options.wait.len() + 1);
        wait.push(SemaphoreWait {
            semaphore: context.image_acquired,
            stage: vk::PipelineStageFlags::ALL_COMMANDS,
        });
        wait.extend_from_slice(&options.wait);
        let mut signal = Vec::with_capacity(options.signal.len() + 1);
        signal.push(context.render_complete);
        signal.extend_from_slice(&options.signal);

        backend.submit(&SubmitRequest {
            queue: QueueKind::Graphics,
            command_buffers,
            wait: &wait,
            signal: &signal,
            fence: context.fence,
        })
        .inspect_err(|e| error!("Frame {} submit failed: {e}", self.frame_number))?;

        self.phase = FramePhase::Submitted { image_index };
        trace!("Frame {} submitted", self.frame_number);
        Ok(())
    }

    /// Present the submitted image.
    ///
    /// Advances to the next frame context only when the image was presented
    /// cleanly; otherwise the caller rebuilds and retries with the same one.
    pub fn present<B: Backend>(&mut self, backend: &mut B) -> Result<PresentOutcome> {
        let FramePhase::Submitted { image_index } = self.phase else {
            error!("Present called in phase {:?}", self.phase);
            return Err(GpuError::InvalidState(format!(
                "Cannot present a frame in phase {:?}",
                self.phase
            )));
        };

        let wait = self.contexts[self.current].render_complete;
        let status = backend.present(image_index, wait)?;
        self.phase = FramePhase::Idle;

        let outcome = match status {
            PresentStatus::Presented => {
                self.advance();
                PresentOutcome::Presented
            }
            PresentStatus::Suboptimal => PresentOutcome::Suboptimal,
            PresentStatus::OutOfDate => PresentOutcome::OutOfDate,
        };
        Ok(outcome)
    }

    /// Recreate every fence and semaphore and return to [`FramePhase::Idle`].
    ///
    /// Only valid once the device is idle.
    pub fn reset_sync<B: Backend>(&mut self, backend: &mut B) -> Result<()> {
        for context in &mut self.contexts {
            context.recreate_sync(backend)?;
        }
        self.phase = FramePhase::Idle;
        Ok(())
    }

    /// Destroy every frame context. Only valid once the device is idle.
    pub fn destroy<B: Backend>(&mut self, backend: &mut B) {
        for context in self.contexts.drain(..) {
            context.destroy(backend);
        }
    }

    fn advance(&mut self) {
        self.current = (self.current + 1) % self.contexts.len();
        self.frame_number += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessBackend;

    fn cycle(scheduler: &mut FrameScheduler, backend: &mut HeadlessBackend) -> PresentOutcome {
        assert!(matches!(
            scheduler.acquire(backend).unwrap(),
            AcquireOutcome::Ready { .. }
        ));
        let cmd = scheduler.current().command_buffer();
        backend.begin_command_buffer(cmd, true).unwrap();
        backend.end_command_buffer(cmd).unwrap();
        scheduler
            .submit(backend, &[cmd], &SubmitOptions::new())
            .unwrap();
        scheduler.present(backend).unwrap()
    }

    #[test]
    fn contexts_rotate_on_present() {
        let mut backend = HeadlessBackend::new().with_swapchain(16, 16, 3);
        let mut scheduler = FrameScheduler::new(&mut backend, 2, u64::MAX).unwrap();

        assert_eq!(scheduler.current_index(), 0);
        assert_eq!(cycle(&mut scheduler, &mut backend), PresentOutcome::Presented);
        assert_eq!(scheduler.current_index(), 1);
        assert_eq!(cycle(&mut scheduler, &mut backend), PresentOutcome::Presented);
        assert_eq!(scheduler.current_index(), 0);
        assert_eq!(scheduler.frame_number(), 2);
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn failed_present_keeps_context() {
        let mut backend = HeadlessBackend::new().with_swapchain(16, 16, 3);
        let mut scheduler = FrameScheduler::new(&mut backend, 2, u64::MAX).unwrap();

        backend.inject_present_status(PresentStatus::OutOfDate);
        let outcome = cycle(&mut scheduler, &mut backend);
        assert_eq!(outcome, PresentOutcome::OutOfDate);
        assert!(outcome.needs_rebuild());
        assert_eq!(scheduler.current_index(), 0);
        assert_eq!(scheduler.frame_number(), 0);
        assert_eq!(scheduler.phase(), FramePhase::Idle);
    }

    #[test]
    fn out_of_date_acquire_leaves_fence_signaled() {
        let mut backend = HeadlessBackend::new().with_swapchain(16, 16, 2);
        let mut scheduler = FrameScheduler::new(&mut backend, 2, u64::MAX).unwrap();

        backend.fail_next_acquire();
        assert_eq!(
            scheduler.acquire(&mut backend).unwrap(),
            AcquireOutcome::OutOfDate
        );
        assert!(backend.is_fence_signaled(scheduler.current().fence()));
        assert_eq!(scheduler.phase(), FramePhase::Idle);
    }

    #[test]
    fn protocol_order_is_enforced() {
        let mut backend = HeadlessBackend::new().with_swapchain(16, 16, 2);
        let mut scheduler = FrameScheduler::new(&mut backend, 2, u64::MAX).unwrap();

        assert!(scheduler.present(&mut backend).is_err());
        assert!(scheduler
            .submit(&mut backend, &[], &SubmitOptions::new())
            .is_err());
        scheduler.acquire(&mut backend).unwrap();
        assert!(scheduler.acquire(&mut backend).is_err());
    }
}
