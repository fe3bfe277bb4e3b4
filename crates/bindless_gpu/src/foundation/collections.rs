//! Specialized collection types

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

pub use slotmap::SlotMap;

slotmap::new_key_type! {
    /// Generational key of an entry in the resource registry
    pub struct ResourceKey;
}

/// Typed handle for type-safe resource references
///
/// A handle is a plain generational key: copying it is free and a stale
/// handle never aliases a newer resource that reused the same slot.
pub struct Handle<T> {
    key: ResourceKey,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a new typed handle from a key
    pub(crate) const fn new(key: ResourceKey) -> Self {
        Self {
            key,
            _phantom: PhantomData,
        }
    }

    /// Get the underlying key
    pub const fn key(&self) -> ResourceKey {
        self.key
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
        self.key == other.key
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle<{}>({:?})", std::any::type_name::<T>().rsplit("::").next().unwrap_or("?"), self.key)
    }
}

/// Free list of bindless descriptor indices
///
/// Freed indices are reused before the table grows, so the descriptor
/// array stays dense.
#[derive(Debug)]
pub struct BindlessTable {
    free_indices: Vec<u32>,
    next: u32,
    capacity: u32,
}

impl BindlessTable {
    /// Create a table holding at most `capacity` indices
    pub const fn new(capacity: u32) -> Self {
        Self {
            free_indices: Vec::new(),
            next: 0,
            capacity,
        }
    }

    /// Allocate an index, or `None` when the table is full
    pub fn allocate(&mut self) -> Option<u32> {
        if let Some(index) = self.free_indices.pop() {
            return Some(index);
        }
        if self.next >= self.capacity {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(index)
    }

    /// Return an index to the table
    pub fn free(&mut self, index: u32) {
        debug_assert!(index < self.next, "freeing index {index} that was never allocated");
        debug_assert!(!self.free_indices.contains(&index), "double free of bindless index {index}");
        self.free_indices.push(index);
    }

    /// Number of indices currently allocated
    pub fn allocated_count(&self) -> u32 {
        self.next - self.free_indices.len() as u32
    }

    /// Maximum number of indices
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindless_table_reuses_freed_indices() {
        let mut table = BindlessTable::new(4);
        let a = table.allocate().expect("Should allocate");
        let b = table.allocate().expect("Should allocate");
        assert_eq!((a, b), (0, 1));

        table.free(a);
        assert_eq!(table.allocated_count(), 1);
        assert_eq!(table.allocate(), Some(0));
        assert_eq!(table.allocate(), Some(2));
    }

    #[test]
    fn test_bindless_table_exhaustion() {
        let mut table = BindlessTable::new(2);
        assert!(table.allocate().is_some());
        assert!(table.allocate().is_some());
        assert_eq!(table.allocate(), None);

        table.free(1);
        assert_eq!(table.allocate(), Some(1));
    }

    #[test]
    fn test_stale_handle_does_not_alias_reused_slot() {
        let mut map: SlotMap<ResourceKey, u32> = SlotMap::with_key();
        let first = Handle::<u8>::new(map.insert(1));
        map.remove(first.key());
        let second = Handle::<u8>::new(map.insert(2));

        assert_ne!(first, second);
        assert!(map.get(first.key()).is_none());
        assert_eq!(map.get(second.key()), Some(&2));
    }
}
