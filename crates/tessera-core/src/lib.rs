//! Core building blocks for the Tessera engine.
//!
//! This crate provides:
//! - Generation-checked handles
//! - The slot pool every GPU resource table is built on
//! - Shared error types

pub mod error;
pub mod handle;
pub mod pool;

pub use error::PoolError;
pub use handle::Handle;
pub use pool::{Pool, PoolCursor};
