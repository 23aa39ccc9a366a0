//! Deferred destruction of native objects.
//!
//! With several frames in flight, a native object whose handle was just
//! erased may still be referenced by a command buffer the GPU is executing.
//! Retired objects are queued with the frame number at retirement and only
//! destroyed once every frame that could reference them has completed.

use std::collections::VecDeque;

use ash::vk;

use crate::backend::{Backend, NativeImage};

/// A native object waiting for the GPU to let go of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetiredObject {
    Buffer(vk::Buffer),
    Image(NativeImage),
    Sampler(vk::Sampler),
    ShaderModule(vk::ShaderModule),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    DescriptorSet {
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    },
    PipelineLayout(vk::PipelineLayout),
    Pipeline(vk::Pipeline),
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
    CommandBuffer {
        pool: vk::CommandPool,
        buffer: vk::CommandBuffer,
    },
}

impl RetiredObject {
    /// Destroy the native object.
    pub fn destroy<B: Backend>(self, backend: &mut B) {
        match self {
            Self::Buffer(buffer) => backend.destroy_buffer(buffer),
            Self::Image(image) => backend.destroy_image(image),
            Self::Sampler(sampler) => backend.destroy_sampler(sampler),
            Self::ShaderModule(module) => backend.destroy_shader_module(module),
            Self::DescriptorSetLayout(layout) => backend.destroy_descriptor_set_layout(layout),
            Self::DescriptorSet { pool, set } => backend.free_descriptor_set(pool, set),
            Self::PipelineLayout(layout) => backend.destroy_pipeline_layout(layout),
            Self::Pipeline(pipeline) => backend.destroy_pipeline(pipeline),
            Self::RenderPass(pass) => backend.destroy_render_pass(pass),
            Self::Framebuffer(framebuffer) => backend.destroy_framebuffer(framebuffer),
            Self::CommandBuffer { pool, buffer } => backend.free_command_buffer(pool, buffer),
        }
    }
}

/// An item pending deletion.
#[derive(Debug)]
struct PendingDeletion<T> {
    item: T,
    /// Frame number when this item was queued for deletion.
    frame_queued: u64,
}

/// FIFO of items that become safe to release after `frames_in_flight` frames.
#[derive(Debug)]
pub struct DeferredDeletionQueue<T = RetiredObject> {
    pending: VecDeque<PendingDeletion<T>>,
    frames_in_flight: usize,
}

impl<T> DeferredDeletionQueue<T> {
    /// Create a new deferred deletion queue.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
        }
    }

    /// Queue an item retired during `frame_number`.
    pub fn queue(&mut self, item: T, frame_number: u64) {
        self.pending.push_back(PendingDeletion {
            item,
            frame_queued: frame_number,
        });
    }

    /// Release every item no in-flight frame can still reference.
    ///
    /// Call once the fence of the current frame context has been waited on.
    pub fn process(&mut self, current_frame_number: u64, mut release: impl FnMut(T)) -> usize {
        // Keep items queued within the last `frames_in_flight` frames
        let cutoff = current_frame_number.saturating_sub(self.frames_in_flight as u64);

        // Queue order is FIFO and frame numbers are non-decreasing, so only the front can mature.
        let mut released = 0;
        while self
            .pending
            .front()
            .is_some_and(|pending| pending.frame_queued < cutoff)
        {
            if let Some(pending) = self.pending.pop_front() {
                release(pending.item);
                released += 1;
            }
        }
        released
    }

    /// Release everything immediately. Only valid after the device is idle.
    pub fn flush(&mut self, mut release: impl FnMut(T)) -> usize {
        let released = self.pending.len();
        while let Some(pending) = self.pending.pop_front() {
            release(pending.item);
        }
        released
    }

    /// Get the number of pending deletions.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_wait_for_frames_in_flight() {
        let mut queue = DeferredDeletionQueue::new(2);
        queue.queue("a", 0);
        queue.queue("b", 1);

        let mut released = Vec::new();
        assert_eq!(queue.process(2, |item| released.push(item)), 0);
        assert_eq!(queue.process(3, |item| released.push(item)), 1);
        assert_eq!(released, vec!["a"]);
        assert_eq!(queue.process(4, |item| released.push(item)), 1);
        assert_eq!(released, vec!["a", "b"]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn flush_releases_everything() {
        let mut queue = DeferredDeletionQueue::new(3);
        queue.queue(1, 10);
        queue.queue(2, 10);

        let mut released = Vec::new();
        assert_eq!(queue.flush(|item| released.push(item)), 2);
        assert_eq!(released, vec![1, 2]);
        assert_eq!(queue.pending_count(), 0);
    }
}
