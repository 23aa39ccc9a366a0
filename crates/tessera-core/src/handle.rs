//! Versioned, non-owning references into a [`Pool`](crate::Pool).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Slot index reserved for the invalid handle.
pub const INVALID_INDEX: u32 = u32::MAX;

/// A generation-checked reference to a value stored in a [`Pool<T>`](crate::Pool).
///
/// Handles are plain `Copy` data. They never own the value they refer to and
/// may outlive it: once the slot is erased, the generation stored in the pool
/// moves on and the handle is detectably stale.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// The invalid sentinel handle. Never returned by a pool.
    pub const INVALID: Self = Self::new(INVALID_INDEX, 0);

    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index inside the owning pool.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot at the time this handle was issued.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Returns `true` for the [`Handle::INVALID`] sentinel.
    #[inline]
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.index == INVALID_INDEX
    }

    /// Pack index and generation into a single value, generation in the high bits.
    #[inline]
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Reinterpret this handle as a handle to another payload type.
    ///
    /// Only useful for type-erased bookkeeping; the result is not valid for
    /// any pool other than the one that issued the original handle.
    #[inline]
    #[must_use]
    pub const fn cast<U>(self) -> Handle<U> {
        Handle::new(self.index, self.generation)
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::INVALID
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bits().hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "Handle(invalid)")
        } else {
            write!(f, "Handle({}v{})", self.index, self.generation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Payload;

    #[test]
    fn equality_requires_both_fields() {
        let a = Handle::<Payload>::new(3, 1);
        assert_eq!(a, Handle::new(3, 1));
        assert_ne!(a, Handle::new(3, 2));
        assert_ne!(a, Handle::new(4, 1));
    }

    #[test]
    fn invalid_sentinel() {
        assert!(Handle::<Payload>::INVALID.is_invalid());
        assert!(Handle::<Payload>::default().is_invalid());
        assert!(!Handle::<Payload>::new(0, 0).is_invalid());
    }

    #[test]
    fn bits_keep_generation_high() {
        let handle = Handle::<Payload>::new(7, 2);
        assert_eq!(handle.to_bits(), (2u64 << 32) | 7);
    }
}
