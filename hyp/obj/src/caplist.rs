//! Per-object capability lists.
//!
//! Every object header carries the ordered list of capability slots that
//! reference it. The master cap (the first one created) is always at the
//! head, and a copied cap is inserted immediately after its parent, so
//! revocation can walk everything derived from the master in one pass.
//!
//! The list stores type-erased slot pointers; the capability space crate
//! owns the slots and interprets the pointers. All access is under the
//! header's cap-list lock.

use alloc::vec::Vec;
use core::ptr::NonNull;

/// A type-erased pointer to a capability slot.
pub type CapSlotPtr = NonNull<()>;

/// Ordered list of capability slots referencing one object.
#[derive(Debug, Default)]
pub struct CapList {
    entries: Vec<CapSlotPtr>,
}

// SAFETY: The type-erased pointers reference capability slots owned by the
// capability space crate; all access to a CapList is mediated by the owning
// object header's cap-list lock, so sending or sharing it across threads is
// safe.
unsafe impl Send for CapList {}
unsafe impl Sync for CapList {}

impl CapList {
    /// Creates an empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Returns `true` if no caps reference the object.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the head of the list (the master cap, if one exists).
    #[must_use]
    pub fn head(&self) -> Option<CapSlotPtr> {
        self.entries.first().copied()
    }

    /// Inserts `slot` at the head.
    pub fn insert_head(&mut self, slot: CapSlotPtr) {
        self.entries.insert(0, slot);
    }

    /// Inserts `slot` immediately after `parent`.
    ///
    /// # Panics
    ///
    /// Panics if `parent` is not on the list; callers hold the cap-list
    /// lock across the lookup that produced `parent`, so absence is a
    /// bookkeeping bug.
    pub fn insert_after(&mut self, parent: CapSlotPtr, slot: CapSlotPtr) {
        let pos = self
            .entries
            .iter()
            .position(|&e| e == parent)
            .expect("parent cap not on object cap list");
        self.entries.insert(pos + 1, slot);
    }

    /// Removes `slot` from the list. Returns `true` if it was present.
    pub fn remove(&mut self, slot: CapSlotPtr) -> bool {
        match self.entries.iter().position(|&e| e == slot) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Iterates over the slots in list order.
    pub fn iter(&self) -> impl Iterator<Item = CapSlotPtr> + '_ {
        self.entries.iter().copied()
    }

    /// Returns the slots in list order, for walks that mutate the list.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CapSlotPtr> {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(n: usize) -> CapSlotPtr {
        NonNull::new(n as *mut ()).unwrap()
    }

    #[test]
    fn master_stays_at_head() {
        let mut list = CapList::new();
        list.insert_head(slot(1));
        list.insert_after(slot(1), slot(2));
        list.insert_after(slot(1), slot(3));
        assert_eq!(list.head(), Some(slot(1)));
        let order: Vec<_> = list.iter().collect();
        assert_eq!(order, vec![slot(1), slot(3), slot(2)]);
    }

    #[test]
    fn remove_tracks_presence() {
        let mut list = CapList::new();
        list.insert_head(slot(1));
        assert!(list.remove(slot(1)));
        assert!(!list.remove(slot(1)));
        assert!(list.is_empty());
    }
}
