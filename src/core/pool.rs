//! Generational arena with stable integer handles
//!
//! Compute buffers, kernels and render targets all refer to each other. Instead of
//! pointers or shared ownership, every object lives in a [`Pool`] and is addressed by
//! a [`PoolIndex`]: a slot number plus the generation the slot had when the object
//! was inserted. Releasing a slot bumps its generation, so stale indices held by
//! other objects simply stop resolving instead of aliasing whatever reuses the slot.
//!
//! # Example
//!
//! ```ignore
//! use lumen::core::Pool;
//!
//! let mut pool: Pool<&str> = Pool::new();
//! let a = pool.insert("kernel");
//! pool.remove(a);
//! let b = pool.insert("buffer"); // same slot, newer generation
//! assert!(pool.get(a).is_none());
//! assert_eq!(pool.get(b), Some(&"buffer"));
//! ```

// ============================================================================
// Pool Index
// ============================================================================

/// Index into a pool, identifying a specific slot and generation.
///
/// The index stays valid until the object is removed; afterwards it never
/// resolves again, even when the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolIndex {
    slot: u32,
    generation: u32,
}

impl PoolIndex {
    /// Get the raw slot value.
    #[must_use]
    #[inline]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// Get the generation of the slot at insertion time.
    #[must_use]
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for PoolIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.slot, self.generation)
    }
}

// ============================================================================
// Pool Slot
// ============================================================================

#[derive(Debug)]
enum Entry<T> {
    Occupied(T),
    /// Points to the next free slot (or `u32::MAX` at the end of the list)
    Vacant(u32),
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    entry: Entry<T>,
}

// ============================================================================
// Pool
// ============================================================================

/// A generic generational arena.
///
/// | Operation | Time Complexity |
/// |-----------|-----------------|
/// | `insert`  | O(1) amortized  |
/// | `remove`  | O(1)            |
/// | `get`     | O(1)            |
/// | `iter`    | O(n)            |
#[derive(Debug)]
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    free_head: u32,
    active_count: usize,
}

impl<T> Pool<T> {
    const NONE: u32 = u32::MAX;

    /// Create a new empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: Self::NONE,
            active_count: 0,
        }
    }

    /// Create a pool with pre-allocated capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_head: Self::NONE,
            active_count: 0,
        }
    }

    /// Insert an object, reusing a free slot when one exists.
    pub fn insert(&mut self, value: T) -> PoolIndex {
        self.active_count += 1;

        if self.free_head != Self::NONE {
            let slot_idx = self.free_head;
            let slot = &mut self.slots[slot_idx as usize];
            if let Entry::Vacant(next) = slot.entry {
                self.free_head = next;
            }
            slot.entry = Entry::Occupied(value);
            PoolIndex {
                slot: slot_idx,
                generation: slot.generation,
            }
        } else {
            let slot_idx = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                entry: Entry::Occupied(value),
            });
            PoolIndex {
                slot: slot_idx,
                generation: 0,
            }
        }
    }

    /// Remove an object and return it.
    ///
    /// Returns `None` if the index is stale or the slot is already vacant.
    pub fn remove(&mut self, index: PoolIndex) -> Option<T> {
        let slot = self.slots.get_mut(index.slot as usize)?;
        if slot.generation != index.generation || matches!(slot.entry, Entry::Vacant(_)) {
            return None;
        }

        let old = std::mem::replace(&mut slot.entry, Entry::Vacant(self.free_head));
        slot.generation = slot.generation.wrapping_add(1);
        self.free_head = index.slot;
        self.active_count -= 1;

        match old {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant(_) => None,
        }
    }

    /// Get a reference to an object by index.
    #[must_use]
    #[inline]
    pub fn get(&self, index: PoolIndex) -> Option<&T> {
        self.slots
            .get(index.slot as usize)
            .filter(|slot| slot.generation == index.generation)
            .and_then(|slot| match &slot.entry {
                Entry::Occupied(obj) => Some(obj),
                Entry::Vacant(_) => None,
            })
    }

    /// Get a mutable reference to an object by index.
    #[inline]
    pub fn get_mut(&mut self, index: PoolIndex) -> Option<&mut T> {
        self.slots
            .get_mut(index.slot as usize)
            .filter(|slot| slot.generation == index.generation)
            .and_then(|slot| match &mut slot.entry {
                Entry::Occupied(obj) => Some(obj),
                Entry::Vacant(_) => None,
            })
    }

    /// Check if an index refers to a live object.
    #[must_use]
    #[inline]
    pub fn contains(&self, index: PoolIndex) -> bool {
        self.get(index).is_some()
    }

    /// Number of live objects.
    #[must_use]
    #[inline]
    pub const fn len(&self) -> usize {
        self.active_count
    }

    /// Check if the pool has no live objects.
    #[must_use]
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    /// Iterate over live objects with their indices, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (PoolIndex, &T)> {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| match &slot.entry {
            Entry::Occupied(obj) => Some((
                PoolIndex {
                    slot: idx as u32,
                    generation: slot.generation,
                },
                obj,
            )),
            Entry::Vacant(_) => None,
        })
    }

    /// Iterate mutably over live objects with their indices.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PoolIndex, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let generation = slot.generation;
                match &mut slot.entry {
                    Entry::Occupied(obj) => Some((
                        PoolIndex {
                            slot: idx as u32,
                            generation,
                        },
                        obj,
                    )),
                    Entry::Vacant(_) => None,
                }
            })
    }

    /// Collect the indices of all live objects.
    #[must_use]
    pub fn indices(&self) -> Vec<PoolIndex> {
        self.iter().map(|(idx, _)| idx).collect()
    }

    /// Remove every object. Outstanding indices become stale.
    pub fn clear(&mut self) {
        for idx in self.indices() {
            self.remove(idx);
        }
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_insert_and_remove() {
        let mut pool: Pool<i32> = Pool::new();

        let a = pool.insert(1);
        let b = pool.insert(2);
        let c = pool.insert(3);
        assert_eq!(pool.len(), 3);

        assert_eq!(pool.remove(b), Some(2));
        assert_eq!(pool.len(), 2);
        assert!(pool.get(b).is_none());

        assert_eq!(pool.get(a), Some(&1));
        assert_eq!(pool.get(c), Some(&3));
    }

    #[test]
    fn test_stale_index_does_not_alias_reused_slot() {
        let mut pool: Pool<&str> = Pool::new();

        let old = pool.insert("first");
        pool.remove(old);
        let new = pool.insert("second");

        assert_eq!(old.slot(), new.slot(), "slot should be reused");
        assert_ne!(old.generation(), new.generation());
        assert!(pool.get(old).is_none());
        assert_eq!(pool.get(new), Some(&"second"));
        assert!(pool.remove(old).is_none());
    }

    #[test]
    fn test_free_list_is_lifo() {
        let mut pool: Pool<i32> = Pool::new();

        let i0 = pool.insert(0);
        let i1 = pool.insert(1);
        let i2 = pool.insert(2);

        pool.remove(i1);
        pool.remove(i0);
        pool.remove(i2);

        assert_eq!(pool.insert(10).slot(), 2);
        assert_eq!(pool.insert(20).slot(), 0);
        assert_eq!(pool.insert(30).slot(), 1);
    }

    #[test]
    fn test_iteration_skips_vacant() {
        let mut pool: Pool<i32> = Pool::new();

        pool.insert(1);
        let mid = pool.insert(2);
        pool.insert(3);
        pool.remove(mid);

        let values: Vec<i32> = pool.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![1, 3]);

        for (_, v) in pool.iter_mut() {
            *v *= 10;
        }
        let values: Vec<i32> = pool.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![10, 30]);
    }

    #[test]
    fn test_double_remove() {
        let mut pool: Pool<i32> = Pool::new();

        let idx = pool.insert(1);
        assert!(pool.remove(idx).is_some());
        assert!(pool.remove(idx).is_none(), "Double remove should fail");
    }

    #[test]
    fn test_clear_invalidates_indices() {
        let mut pool: Pool<i32> = Pool::with_capacity(4);

        let a = pool.insert(1);
        pool.insert(2);
        pool.clear();

        assert!(pool.is_empty());
        assert!(!pool.contains(a));
    }
}
