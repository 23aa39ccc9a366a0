//! Device configuration.

use serde::{Deserialize, Serialize};

use crate::backend::DescriptorPoolSizes;

/// Tunables of a [`Device`](crate::Device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Number of frame contexts cycled by the scheduler.
    pub frames_in_flight: u32,
    /// Physical binding-table instances kept per logical descriptor set.
    pub descriptor_history_limit: usize,
    /// Compiled variants kept per pipeline program.
    pub pipeline_variant_limit: usize,
    /// Sets per native descriptor pool.
    pub descriptor_pool_max_sets: u32,
    pub uniform_buffers_per_pool: u32,
    pub dynamic_uniform_buffers_per_pool: u32,
    pub storage_buffers_per_pool: u32,
    pub dynamic_storage_buffers_per_pool: u32,
    pub sampled_images_per_pool: u32,
    pub storage_images_per_pool: u32,
    /// Timeout of every fence wait.
    pub fence_timeout_ns: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            descriptor_history_limit: 8,
            pipeline_variant_limit: 32,
            descriptor_pool_max_sets: 256,
            uniform_buffers_per_pool: 256,
            dynamic_uniform_buffers_per_pool: 64,
            storage_buffers_per_pool: 256,
            dynamic_storage_buffers_per_pool: 64,
            sampled_images_per_pool: 256,
            storage_images_per_pool: 64,
            fence_timeout_ns: u64::MAX,
        }
    }
}

impl DeviceConfig {
    /// Highest supported frame pipeline depth.
    pub const MAX_FRAMES_IN_FLIGHT: u32 = 3;

    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of frames in flight, clamped to `1..=3`.
    #[must_use]
    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the per-set descriptor instance cap.
    #[must_use]
    pub fn with_descriptor_history_limit(mut self, limit: usize) -> Self {
        self.descriptor_history_limit = limit;
        self
    }

    /// Set the per-program pipeline variant cap.
    #[must_use]
    pub fn with_pipeline_variant_limit(mut self, limit: usize) -> Self {
        self.pipeline_variant_limit = limit;
        self
    }

    /// Set the number of sets per native descriptor pool.
    #[must_use]
    pub fn with_descriptor_pool_max_sets(mut self, max_sets: u32) -> Self {
        self.descriptor_pool_max_sets = max_sets;
        self
    }

    /// Set the fence wait timeout.
    #[must_use]
    pub fn with_fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    /// Copy with every value brought into its valid range.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.frames_in_flight = self.frames_in_flight.clamp(1, Self::MAX_FRAMES_IN_FLIGHT);
        self.descriptor_history_limit = self.descriptor_history_limit.max(1);
        self.pipeline_variant_limit = self.pipeline_variant_limit.max(1);
        self.descriptor_pool_max_sets = self.descriptor_pool_max_sets.max(1);
        self
    }

    /// Sizes of each native descriptor pool.
    pub fn descriptor_pool_sizes(&self) -> DescriptorPoolSizes {
        DescriptorPoolSizes {
            max_sets: self.descriptor_pool_max_sets,
            uniform_buffers: self.uniform_buffers_per_pool,
            dynamic_uniform_buffers: self.dynamic_uniform_buffers_per_pool,
            storage_buffers: self.storage_buffers_per_pool,
            dynamic_storage_buffers: self.dynamic_storage_buffers_per_pool,
            sampled_images: self.sampled_images_per_pool,
            storage_images: self.storage_images_per_pool,
        }
    }
}
