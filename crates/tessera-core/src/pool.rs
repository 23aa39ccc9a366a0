//! Generation-checked slot allocator.
//!
//! Slots live in a `Vec` and are addressed by index, so growing the storage
//! never invalidates an issued [`Handle`]. Erased slots are threaded into an
//! intrusive singly-linked free list and reused LIFO. Every erase bumps the
//! slot generation before the slot can be handed out again.

use crate::error::PoolError;
use crate::handle::{Handle, INVALID_INDEX};

/// End-of-list marker for the intrusive free list.
const FREE_LIST_END: u32 = INVALID_INDEX;

enum SlotState<T> {
    Occupied(T),
    Free { next_free: u32 },
}

struct Slot<T> {
    generation: u32,
    state: SlotState<T>,
}

/// Stable-index container with O(1) insert and erase.
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    free_head: u32,
    len: usize,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Pool<T> {
    /// Create an empty pool.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: FREE_LIST_END,
            len: 0,
        }
    }

    /// Create an empty pool with room for `capacity` slots.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_head: FREE_LIST_END,
            len: 0,
        }
    }

    /// Number of live values.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no value is live.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots ever allocated, live or free.
    #[inline]
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Store `value` and return a handle to it.
    ///
    /// Reuses the most recently freed slot when one exists.
    ///
    /// # Panics
    /// Panics if the pool would exceed `u32::MAX - 1` slots.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.len += 1;

        if self.free_head != FREE_LIST_END {
            let index = self.free_head;
            let slot = &mut self.slots[index as usize];
            let SlotState::Free { next_free } = slot.state else {
                unreachable!("free list points at an occupied slot");
            };
            self.free_head = next_free;
            slot.state = SlotState::Occupied(value);
            return Handle::new(index, slot.generation);
        }

        let index = self.slots.len();
        assert!(
            index < INVALID_INDEX as usize,
            "pool capacity exhausted ({index} slots)"
        );
        self.slots.push(Slot {
            generation: 0,
            state: SlotState::Occupied(value),
        });
        Handle::new(index as u32, 0)
    }

    /// Returns `true` if `handle` refers to a live value in this pool.
    #[must_use]
    pub fn is_valid(&self, handle: Handle<T>) -> bool {
        self.slot(handle).is_some()
    }

    /// Borrow the value behind `handle`.
    pub fn get(&self, handle: Handle<T>) -> Result<&T, PoolError> {
        match self.slot(handle) {
            Some(Slot {
                state: SlotState::Occupied(value),
                ..
            }) => Ok(value),
            _ => Err(PoolError::from_handle(handle)),
        }
    }

    /// Mutably borrow the value behind `handle`.
    pub fn get_mut(&mut self, handle: Handle<T>) -> Result<&mut T, PoolError> {
        let index = handle.index() as usize;
        match self.slots.get_mut(index) {
            Some(Slot {
                generation,
                state: SlotState::Occupied(value),
            }) if *generation == handle.generation() => Ok(value),
            _ => Err(PoolError::from_handle(handle)),
        }
    }

    /// Remove the value behind `handle` and return it.
    ///
    /// The slot generation is bumped so every copy of `handle` becomes stale.
    /// A slot whose generation would wrap is retired instead of reused.
    pub fn erase(&mut self, handle: Handle<T>) -> Result<T, PoolError> {
        if !self.is_valid(handle) {
            return Err(PoolError::from_handle(handle));
        }

        let index = handle.index();
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        let retired = slot.generation == u32::MAX;

        let next_free = if retired {
            FREE_LIST_END
        } else {
            self.free_head
        };
        let SlotState::Occupied(value) =
            std::mem::replace(&mut slot.state, SlotState::Free { next_free })
        else {
            unreachable!("validated slot is occupied");
        };

        if !retired {
            self.free_head = index;
        }
        self.len -= 1;
        Ok(value)
    }

    /// Iterate over live values in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.state {
                SlotState::Occupied(value) => {
                    Some((Handle::new(index as u32, slot.generation), value))
                }
                SlotState::Free { .. } => None,
            })
    }

    /// Iterate mutably over live values in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match &mut slot.state {
                SlotState::Occupied(value) => {
                    Some((Handle::new(index as u32, slot.generation), value))
                }
                SlotState::Free { .. } => None,
            })
    }

    /// Handles of all live values, collected up front.
    #[must_use]
    pub fn handles(&self) -> Vec<Handle<T>> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Erase every live value, yielding them in slot order.
    pub fn drain(&mut self) -> Vec<T> {
        let handles = self.handles();
        handles
            .into_iter()
            .filter_map(|handle| self.erase(handle).ok())
            .collect()
    }

    /// Start a cursor that walks live slots while the pool may keep growing.
    #[must_use]
    pub const fn cursor(&self) -> PoolCursor {
        PoolCursor { next: 0 }
    }

    fn slot(&self, handle: Handle<T>) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .filter(|slot| matches!(slot.state, SlotState::Occupied(_)))
    }
}

/// Forward position over a [`Pool`] that does not borrow it.
///
/// Unlike [`Pool::iter`], the pool can be mutated between steps. Slots
/// appended after the cursor position are visited; freed slots are skipped.
#[derive(Debug, Clone, Copy)]
pub struct PoolCursor {
    next: usize,
}

impl PoolCursor {
    /// Advance to the next live slot and return its handle.
    pub fn next<T>(&mut self, pool: &Pool<T>) -> Option<Handle<T>> {
        while let Some(slot) = pool.slots.get(self.next) {
            let index = self.next;
            self.next += 1;
            if matches!(slot.state, SlotState::Occupied(_)) {
                return Some(Handle::new(index as u32, slot.generation));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get() {
        let mut pool = Pool::new();
        let a = pool.insert("a");
        let b = pool.insert("b");

        assert_eq!(pool.len(), 2);
        assert_eq!(*pool.get(a).unwrap(), "a");
        assert_eq!(*pool.get(b).unwrap(), "b");
    }

    #[test]
    fn erase_invalidates_handle() {
        let mut pool = Pool::new();
        let a = pool.insert(1);
        assert!(pool.is_valid(a));

        assert_eq!(pool.erase(a).unwrap(), 1);
        assert!(!pool.is_valid(a));
        assert_eq!(pool.get(a), Err(PoolError::from_handle(a)));
        assert!(pool.erase(a).is_err());
        assert!(pool.is_empty());
    }

    #[test]
    fn reused_slot_has_greater_generation() {
        let mut pool = Pool::new();
        let first = pool.insert(1);
        pool.erase(first).unwrap();
        let second = pool.insert(2);

        assert_eq!(first.index(), second.index());
        assert!(second.generation() > first.generation());
        assert!(!pool.is_valid(first));
        assert!(pool.is_valid(second));
        assert_eq!(pool.slot_count(), 1);
    }

    #[test]
    fn free_list_is_lifo() {
        let mut pool = Pool::new();
        let handles: Vec<_> = (0..4).map(|i| pool.insert(i)).collect();
        pool.erase(handles[1]).unwrap();
        pool.erase(handles[3]).unwrap();

        assert_eq!(pool.insert(10).index(), 3);
        assert_eq!(pool.insert(11).index(), 1);
        assert_eq!(pool.insert(12).index(), 4);
    }

    #[test]
    fn iteration_skips_freed_slots() {
        let mut pool = Pool::new();
        let handles: Vec<_> = (0..5).map(|i| pool.insert(i)).collect();
        pool.erase(handles[0]).unwrap();
        pool.erase(handles[2]).unwrap();

        let values: Vec<_> = pool.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![1, 3, 4]);

        for (_, value) in pool.iter_mut() {
            *value *= 10;
        }
        assert_eq!(*pool.get(handles[4]).unwrap(), 40);
    }

    #[test]
    fn cursor_survives_growth() {
        let mut pool = Pool::new();
        pool.insert(0);
        let erased = pool.insert(1);
        pool.insert(2);
        pool.erase(erased).unwrap();

        let mut cursor = pool.cursor();
        let mut seen = Vec::new();
        while let Some(handle) = cursor.next(&pool) {
            let value = *pool.get(handle).unwrap();
            seen.push(value);
            if value == 0 {
                // Reuses slot 1, which the cursor has not reached yet.
                pool.insert(100);
                pool.insert(200);
            }
        }

        assert_eq!(seen, vec![0, 100, 2, 200]);
    }

    #[test]
    fn stale_handle_never_revalidated() {
        let mut pool = Pool::new();
        let mut issued = Vec::new();
        for round in 0..16 {
            let handle = pool.insert(round);
            issued.push(handle);
            pool.erase(handle).unwrap();
        }

        assert!(issued.iter().all(|h| !pool.is_valid(*h)));
        let generations: Vec<_> = issued.iter().map(|h| h.generation()).collect();
        assert!(generations.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn exhausted_generation_retires_slot() {
        let mut pool = Pool::new();
        let handle = pool.insert(0);
        pool.slots[0].generation = u32::MAX - 1;
        let handle = Handle::new(handle.index(), u32::MAX - 1);

        pool.erase(handle).unwrap();
        let fresh = pool.insert(1);
        assert_ne!(fresh.index(), handle.index());
    }

    #[test]
    fn drain_empties_pool() {
        let mut pool = Pool::new();
        let a = pool.insert(1);
        pool.insert(2);
        let drained = pool.drain();

        assert_eq!(drained, vec![1, 2]);
        assert!(pool.is_empty());
        assert!(!pool.is_valid(a));
    }
}
