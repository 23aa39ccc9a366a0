//! Error types shared across the engine.

use thiserror::Error;

use crate::handle::Handle;

/// Errors raised by [`Pool`](crate::Pool) lookups.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The handle was never issued, its slot was erased, or the slot has
    /// since been reused by a newer generation.
    #[error("invalid handle (index {index}, generation {generation})")]
    InvalidHandle { index: u32, generation: u32 },
}

impl PoolError {
    /// Build an [`PoolError::InvalidHandle`] describing `handle`.
    #[must_use]
    pub const fn from_handle<T>(handle: Handle<T>) -> Self {
        Self::InvalidHandle {
            index: handle.index(),
            generation: handle.generation(),
        }
    }
}
