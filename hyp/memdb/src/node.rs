//! Tree node types and their RCU-deferred reclamation.

use alloc::boxed::Box;
use core::cell::Cell;
use core::sync::atomic::{AtomicU64, Ordering};

use boson_core::bitmap::AtomicBitmap;
use boson_core::error::Result;
use boson_rcu::{RcuClass, RcuEntry};

use crate::{BITMAP_ID_BITS, BITMAP_OBJECTS, LEVEL_ENTRIES, MemdbEntry, MemdbType};

/// Words needed for `LEVEL_ENTRIES` packed owner IDs.
const BITMAP_WORDS: usize = LEVEL_ENTRIES * BITMAP_ID_BITS as usize / 64;

// ---------------------------------------------------------------------------
// Table levels
// ---------------------------------------------------------------------------

/// An internal table level: one atomic entry per 6-bit stride.
#[repr(C)]
pub(crate) struct LevelTable {
    rcu_entry: RcuEntry,
    entries: [AtomicU64; LEVEL_ENTRIES],
}

impl LevelTable {
    /// Creates a table with every entry empty (used for the root).
    pub(crate) fn empty() -> Self {
        Self::filled(MemdbEntry::EMPTY)
    }

    fn filled(initial: MemdbEntry) -> Self {
        Self {
            rcu_entry: RcuEntry::new(),
            entries: core::array::from_fn(|_| AtomicU64::new(initial.raw())),
        }
    }

    /// Loads entry `index` with acquire ordering, pairing with the release
    /// store that published any node it points to.
    pub(crate) fn load(&self, index: usize) -> MemdbEntry {
        MemdbEntry::from_raw(self.entries[index].load(Ordering::Acquire))
    }

    /// Publishes `entry` at `index`. Release ordering makes a pointed-to
    /// node's initialization visible before the pointer.
    pub(crate) fn store(&self, index: usize, entry: MemdbEntry) {
        self.entries[index].store(entry.raw(), Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Bitmap leaves
// ---------------------------------------------------------------------------

/// A compact leaf covering `LEVEL_ENTRIES` pages with up to four distinct
/// owners: a packed 2-bit owner ID per page, the owner entries, and per-ID
/// use counts (maintained by writers only, under the database lock).
#[repr(C)]
pub(crate) struct LevelBitmap {
    rcu_entry: RcuEntry,
    objects: [AtomicU64; BITMAP_OBJECTS],
    counts: [Cell<u16>; BITMAP_OBJECTS],
    bitmap: AtomicBitmap<BITMAP_WORDS>,
}

// SAFETY: `counts` is only accessed under the global memdb writer lock; all
// other fields are atomic.
unsafe impl Sync for LevelBitmap {}
unsafe impl Send for LevelBitmap {}

impl LevelBitmap {
    /// Creates a leaf with every page owned by `initial` under ID 0.
    fn filled(initial: MemdbEntry) -> Self {
        let this = Self {
            rcu_entry: RcuEntry::new(),
            objects: core::array::from_fn(|_| AtomicU64::new(0)),
            counts: core::array::from_fn(|_| Cell::new(0)),
            bitmap: AtomicBitmap::new(),
        };
        this.objects[0].store(initial.raw(), Ordering::Relaxed);
        this.counts[0].set(LEVEL_ENTRIES as u16);
        this
    }

    /// Returns the owner ID packed at entry `index`.
    pub(crate) fn id_at(&self, index: usize) -> usize {
        self.bitmap.extract(index * BITMAP_ID_BITS as usize, BITMAP_ID_BITS) as usize
    }

    /// Stores owner ID `id` at entry `index`.
    pub(crate) fn set_id(&self, index: usize, id: usize) {
        self.bitmap
            .insert(index * BITMAP_ID_BITS as usize, BITMAP_ID_BITS, id as u64);
    }

    /// Loads the owner entry for `id` with acquire ordering.
    pub(crate) fn object(&self, id: usize) -> MemdbEntry {
        MemdbEntry::from_raw(self.objects[id].load(Ordering::Acquire))
    }

    /// Publishes the owner entry for `id`.
    pub(crate) fn set_object(&self, id: usize, entry: MemdbEntry) {
        self.objects[id].store(entry.raw(), Ordering::Release);
    }

    /// Returns the use count of `id`. Writer-lock only.
    pub(crate) fn count(&self, id: usize) -> u16 {
        self.counts[id].get()
    }

    /// Adjusts the use count of `id` by `delta`. Writer-lock only.
    pub(crate) fn adjust_count(&self, id: usize, delta: i32) {
        let cur = i32::from(self.counts[id].get());
        let new = cur + delta;
        debug_assert!((0..=LEVEL_ENTRIES as i32).contains(&new));
        self.counts[id].set(new as u16);
    }

    /// Finds the ID currently assigned to `entry`, ignoring IDs whose use
    /// count is zero.
    pub(crate) fn find_object(&self, entry: MemdbEntry) -> Option<usize> {
        (0..BITMAP_OBJECTS).find(|&id| self.count(id) != 0 && self.object(id) == entry)
    }

    /// Finds the ID holding `entry` regardless of use count (readers have
    /// no view of the counts' writer-side meaning beyond nonzero).
    pub(crate) fn find_object_any(&self, entry: MemdbEntry) -> Option<usize> {
        (0..BITMAP_OBJECTS).find(|&id| self.object(id) == entry)
    }
}

// ---------------------------------------------------------------------------
// Allocation and RCU-deferred reclamation
// ---------------------------------------------------------------------------

/// Allocates a table whose entries all hold `initial`.
pub(crate) fn create_table(initial: MemdbEntry) -> Result<*mut LevelTable> {
    // A failed allocation surfaces as NOMEM rather than aborting: callers
    // roll back and return the error to the guest.
    Ok(Box::into_raw(Box::new(LevelTable::filled(initial))))
}

/// Allocates a bitmap leaf fully owned by `initial`.
pub(crate) fn create_bitmap(initial: MemdbEntry) -> Result<*mut LevelBitmap> {
    Ok(Box::into_raw(Box::new(LevelBitmap::filled(initial))))
}

/// Builds a table with the same contents as `bitmap`, for updates a bitmap
/// leaf cannot represent.
pub(crate) fn convert_bitmap(bitmap: &LevelBitmap) -> Result<*mut LevelTable> {
    let table = create_table(MemdbEntry::EMPTY)?;
    let objects: [MemdbEntry; BITMAP_OBJECTS] = core::array::from_fn(|i| bitmap.object(i));
    for i in 0..LEVEL_ENTRIES {
        // SAFETY: Freshly allocated, not yet shared.
        unsafe { (*table).store(i, objects[bitmap.id_at(i)]) };
    }
    Ok(table)
}

/// Duplicates `bitmap`, dropping owner IDs with a zero use count so they can
/// be reassigned in the copy. The original stays untouched for concurrent
/// RCU readers that may still resolve through its stale IDs.
pub(crate) fn duplicate_bitmap(bitmap: &LevelBitmap) -> Result<*mut LevelBitmap> {
    let new = create_bitmap(MemdbEntry::EMPTY)?;
    // SAFETY: Freshly allocated, not yet shared.
    let new_ref = unsafe { &*new };
    new_ref.counts[0].set(0);
    for id in 0..BITMAP_OBJECTS {
        if bitmap.count(id) != 0 {
            new_ref.set_object(id, bitmap.object(id));
            new_ref.counts[id].set(bitmap.count(id));
        }
    }
    for i in 0..LEVEL_ENTRIES {
        new_ref.set_id(i, bitmap.id_at(i));
    }
    Ok(new)
}

/// Queues a detached table for freeing after the next grace period.
pub(crate) fn release_table(table: *mut LevelTable) {
    // SAFETY: The rcu entry is the first field; the node is detached from
    // the tree and will not be enqueued again.
    unsafe { boson_rcu::enqueue(table.cast::<RcuEntry>(), RcuClass::MemdbReleaseTable) };
}

/// Queues a detached bitmap leaf for freeing after the next grace period.
pub(crate) fn release_bitmap(bitmap: *mut LevelBitmap) {
    // SAFETY: As in release_table.
    unsafe { boson_rcu::enqueue(bitmap.cast::<RcuEntry>(), RcuClass::MemdbReleaseBitmap) };
}

fn free_table_handler(entry: *mut RcuEntry) -> bool {
    // SAFETY: Only detached LevelTable nodes are enqueued with this class.
    drop(unsafe { Box::from_raw(entry.cast::<LevelTable>()) });
    false
}

fn free_bitmap_handler(entry: *mut RcuEntry) -> bool {
    // SAFETY: Only detached LevelBitmap nodes are enqueued with this class.
    drop(unsafe { Box::from_raw(entry.cast::<LevelBitmap>()) });
    false
}

/// Registers the node release handlers. Idempotent.
pub(crate) fn init_release_classes() {
    boson_rcu::set_class_handler(RcuClass::MemdbReleaseTable, free_table_handler);
    boson_rcu::set_class_handler(RcuClass::MemdbReleaseBitmap, free_bitmap_handler);
}

/// Looks up a level entry pointer as a table reference.
///
/// # Safety
///
/// `entry` must be a `LevelTable` entry read from a live tree position,
/// either under the writer lock or inside an RCU read section.
pub(crate) unsafe fn table_ref<'a>(entry: MemdbEntry) -> &'a LevelTable {
    debug_assert_eq!(entry.entry_type(), MemdbType::LevelTable);
    // SAFETY: Per the caller contract.
    unsafe { &*(entry.entry_ptr() as *const LevelTable) }
}

/// Looks up a level entry pointer as a bitmap reference.
///
/// # Safety
///
/// As [`table_ref`], for `LevelBitmap` entries.
pub(crate) unsafe fn bitmap_ref<'a>(entry: MemdbEntry) -> &'a LevelBitmap {
    debug_assert_eq!(entry.entry_type(), MemdbType::LevelBitmap);
    // SAFETY: Per the caller contract.
    unsafe { &*(entry.entry_ptr() as *const LevelBitmap) }
}

/// Packs a node pointer into a level entry.
pub(crate) fn table_entry(table: *mut LevelTable) -> MemdbEntry {
    MemdbEntry::for_object(table as usize, MemdbType::LevelTable)
}

/// Packs a bitmap pointer into a level entry.
pub(crate) fn bitmap_entry(bitmap: *mut LevelBitmap) -> MemdbEntry {
    MemdbEntry::for_object(bitmap as usize, MemdbType::LevelBitmap)
}
