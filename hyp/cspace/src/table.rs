//! Capability slots and second-level tables.

use core::cell::Cell;
use core::ptr::NonNull;

use boson_core::bitmap::AtomicBitmap;
use boson_obj::{ObjRef, Partition};
use boson_rcu::RcuEntry;

use crate::CAP_SLOTS_PER_TABLE;
use crate::cell::CapCell;

/// One capability slot: the atomically-updatable payload plus a back
/// pointer to the containing table (needed to find a cap's cspace when it
/// is reached through an object cap-list rather than an ID).
pub struct Cap {
    /// The capability payload.
    pub data: CapCell,
    table: Cell<*const CapTable>,
}

// SAFETY: The table back pointer is written once at table construction and
// read-only afterwards.
unsafe impl Send for Cap {}
unsafe impl Sync for Cap {}

impl Cap {
    const fn new() -> Self {
        Self {
            data: CapCell::new(),
            table: Cell::new(core::ptr::null()),
        }
    }

    /// Returns the containing table.
    #[must_use]
    pub fn table(&self) -> &CapTable {
        // SAFETY: Set at construction; tables outlive their caps.
        unsafe { &*self.table.get() }
    }

    /// Returns this cap as a type-erased list pointer.
    #[must_use]
    pub fn as_slot_ptr(&self) -> NonNull<()> {
        NonNull::from(self).cast()
    }
}

/// A second-level capability table.
///
/// The RCU entry must stay first: emptied tables are detached and freed
/// through the cspace release class.
#[repr(C)]
pub struct CapTable {
    pub(crate) rcu_entry: RcuEntry,
    /// Atomic slot-claim bitmap, so slot claims don't need the cspace lock.
    pub(crate) used_slots: AtomicBitmap<1>,
    /// Caps allocated in this table. Guarded by the cspace allocation lock.
    pub(crate) cap_count: Cell<u32>,
    /// This table's upper index in its cspace.
    pub(crate) index: usize,
    /// The owning cspace, as a raw pointer to avoid a reference cycle.
    pub(crate) cspace: *const crate::Cspace,
    /// Pays for this table's memory; the free goes back to it.
    pub(crate) partition: ObjRef<Partition>,
    pub(crate) slots: [Cap; CAP_SLOTS_PER_TABLE],
}

// SAFETY: cap_count is guarded by the cspace allocation lock; everything
// else is atomic, immutable after construction, or internally synchronized.
unsafe impl Send for CapTable {}
unsafe impl Sync for CapTable {}

impl CapTable {
    /// Initializes a table in place at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to zeroed, properly aligned memory of at least
    /// `size_of::<CapTable>()` bytes that outlives the table.
    pub(crate) unsafe fn init_at(
        ptr: NonNull<CapTable>,
        index: usize,
        cspace: *const crate::Cspace,
        partition: ObjRef<Partition>,
    ) {
        // SAFETY: Per the caller contract.
        unsafe {
            ptr.write(CapTable {
                rcu_entry: RcuEntry::new(),
                used_slots: AtomicBitmap::new(),
                cap_count: Cell::new(0),
                index,
                cspace,
                partition,
                slots: [const { Cap::new() }; CAP_SLOTS_PER_TABLE],
            });
            for slot in &(*ptr.as_ptr()).slots {
                slot.table.set(ptr.as_ptr());
            }
        }
    }

    /// Returns the slot at `lower`.
    #[must_use]
    pub fn slot(&self, lower: usize) -> &Cap {
        &self.slots[lower]
    }

    /// Returns the slot index of `cap`, which must belong to this table.
    #[must_use]
    pub fn slot_index(&self, cap: &Cap) -> usize {
        let base = self.slots.as_ptr() as usize;
        let offset = core::ptr::from_ref(cap) as usize - base;
        let index = offset / core::mem::size_of::<Cap>();
        debug_assert!(core::ptr::eq(&self.slots[index], cap));
        index
    }

    /// Returns the owning cspace.
    #[must_use]
    pub fn cspace(&self) -> &crate::Cspace {
        // SAFETY: A table is attached to exactly one live cspace; caps (and
        // so tables) are destroyed before their cspace can be.
        unsafe { &*self.cspace }
    }
}
