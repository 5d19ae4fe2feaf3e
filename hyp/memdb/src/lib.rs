//! Physical memory ownership database.
//!
//! Tracks the exclusive owner of every page of physical memory in a radix
//! tree with two node kinds: *tables* (arrays of atomic entries, one per
//! 6-bit address stride) and *bitmaps* (a compact leaf form holding up to
//! four distinct owners, a packed 2-bit owner ID per page, and per-ID use
//! counts). Dense page-granular ownership — the common case after carving a
//! partition's memory into extents — costs a quarter of a full table level.
//!
//! Writers serialize on a single global lock and update entries in place
//! with release stores. Readers never take a lock: lookups and contiguity
//! checks run inside an RCU read section with acquire loads, and replaced
//! nodes are freed only after a grace period, so a reader sees either the
//! pre-write or the post-write state for any single address.
//!
//! When an update covers only part of an entry's range, the entry is split:
//! into a next-level bitmap when the children would be page-sized, or a
//! next-level table otherwise. The reverse happens on return from a child:
//! a node whose entries have become identical is collapsed back into a
//! single parent entry and queued for RCU release.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::sync::atomic::{Ordering, fence};

use boson_core::addr::PhysAddr;
use boson_core::error::{Error, Result};
use boson_core::sync::SpinLock;
use boson_core::util;
use boson_core::{kdebug, kwarn};

mod node;
mod write;

use node::LevelTable;

#[cfg(test)]
mod tests;

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Address bits consumed per tree level.
pub const BITS_PER_LEVEL: u32 = 6;
/// Entries per table level.
pub const LEVEL_ENTRIES: usize = 1 << BITS_PER_LEVEL;
/// Physical address width covered by the database.
pub const MAX_BITS: u32 = 48;
/// Granularity of ownership: one 4 KiB page.
pub const MIN_BITS: u32 = 12;
/// Stride covered by one entry of the root table.
pub const ROOT_ENTRY_BITS: u32 = MAX_BITS - BITS_PER_LEVEL;
/// Distinct owners representable in one bitmap leaf.
pub const BITMAP_OBJECTS: usize = 4;
/// Width of one packed owner ID in a bitmap leaf.
pub const BITMAP_ID_BITS: u32 = 2;

boson_core::static_assert!((MAX_BITS - MIN_BITS) % BITS_PER_LEVEL == 0);
boson_core::static_assert!(BITMAP_OBJECTS == 1 << BITMAP_ID_BITS);

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Kind tag of a database entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemdbType {
    /// Unowned. Zero so zero-initialized entries read as empty.
    NoType = 0,
    /// Next-level table (internal).
    LevelTable = 1,
    /// Next-level bitmap leaf (internal).
    LevelBitmap = 2,
    /// Owned by a partition; mappable.
    Partition = 3,
    /// Owned by a partition; never mappable into guests.
    PartitionNomap = 4,
    /// Owned by a memory extent.
    Extent = 5,
    /// Owned by a partition's allocator.
    Allocator = 6,
}

impl MemdbType {
    fn from_raw(raw: u64) -> Self {
        match raw {
            1 => Self::LevelTable,
            2 => Self::LevelBitmap,
            3 => Self::Partition,
            4 => Self::PartitionNomap,
            5 => Self::Extent,
            6 => Self::Allocator,
            _ => Self::NoType,
        }
    }

    fn is_level(self) -> bool {
        matches!(self, Self::LevelTable | Self::LevelBitmap)
    }
}

/// Address bits available for the object pointer in a packed entry.
const ENTRY_PTR_BITS: u32 = 56;

/// A packed `(object, type)` cell: type tag in the top byte, object pointer
/// (or opaque identity) in the low 56 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MemdbEntry(u64);

impl MemdbEntry {
    pub(crate) const EMPTY: Self = Self(0);

    pub(crate) fn for_object(object: usize, obj_type: MemdbType) -> Self {
        assert!(
            (object as u64) <= util::mask(ENTRY_PTR_BITS),
            "memdb object identity exceeds the entry pointer field"
        );
        Self(((obj_type as u64) << ENTRY_PTR_BITS) | object as u64)
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn entry_type(self) -> MemdbType {
        MemdbType::from_raw(self.0 >> ENTRY_PTR_BITS)
    }

    pub(crate) fn entry_ptr(self) -> usize {
        (self.0 & util::mask(ENTRY_PTR_BITS)) as usize
    }
}

/// Returns the entry index of `addr` at a level whose entries cover
/// `entry_bits` of address each.
pub(crate) fn entry_index(addr: u64, entry_bits: u32) -> usize {
    ((addr >> entry_bits) & util::mask(BITS_PER_LEVEL)) as usize
}

// ---------------------------------------------------------------------------
// The database
// ---------------------------------------------------------------------------

/// The memory ownership database.
///
/// The kernel uses one global instance created at cold boot; tests build
/// their own.
pub struct MemDb {
    /// Serializes all writers. Readers are RCU-only.
    lock: SpinLock<()>,
    root: LevelTable,
}

impl MemDb {
    /// Creates an empty database and registers the RCU release handlers for
    /// retired tree nodes.
    #[must_use]
    pub fn new() -> Self {
        node::init_release_classes();
        Self {
            lock: SpinLock::new(()),
            root: LevelTable::empty(),
        }
    }

    fn range_check(start: PhysAddr, end: PhysAddr) -> Result<()> {
        let (start, end) = (start.as_u64(), end.as_u64());
        if start >= end {
            Err(Error::ArgumentInvalid)
        } else if end >= util::bit(MAX_BITS) {
            Err(Error::ArgumentSize)
        } else if !util::is_p2aligned(start, MIN_BITS) || !util::is_p2aligned(end + 1, MIN_BITS) {
            Err(Error::ArgumentAlignment)
        } else {
            Ok(())
        }
    }

    /// Records `(object, obj_type)` as the owner of `[start, end]`, which
    /// must currently be unowned.
    pub fn insert(
        &self,
        start: PhysAddr,
        end: PhysAddr,
        object: usize,
        obj_type: MemdbType,
    ) -> Result<()> {
        self.update(start, end, object, obj_type, 0, MemdbType::NoType)
    }

    /// Atomically transfers ownership of `[start, end]` from
    /// `(prev_object, prev_type)` to `(object, obj_type)`.
    ///
    /// Fails with [`Error::MemdbNotOwner`] — leaving the database pointwise
    /// unchanged — if any byte of the range is not currently owned by the
    /// previous owner.
    pub fn update(
        &self,
        start: PhysAddr,
        end: PhysAddr,
        object: usize,
        obj_type: MemdbType,
        prev_object: usize,
        prev_type: MemdbType,
    ) -> Result<()> {
        assert!(!obj_type.is_level() && !prev_type.is_level());
        Self::range_check(start, end).inspect_err(|&err| {
            kwarn!(
                "memdb: range invalid for update: {start}..{end}: {err}",
            );
        })?;

        let new_entry = MemdbEntry::for_object(object, obj_type);
        let old_entry = MemdbEntry::for_object(prev_object, prev_type);

        let result = {
            let _guard = self.lock.lock();
            write::update_table(
                start.as_u64(),
                end.as_u64(),
                old_entry,
                new_entry,
                &self.root,
                ROOT_ENTRY_BITS,
            )
            .map(|_| ())
        };

        match result {
            Ok(()) => {
                kdebug!(
                    "memdb: update {start}..{end}: {:#x} -> {:#x}",
                    old_entry.raw(),
                    new_entry.raw()
                );
            }
            Err(err) => {
                kdebug!(
                    "memdb: error updating {start}..{end}: {:#x} -> {:#x}: {err}",
                    old_entry.raw(),
                    new_entry.raw()
                );
            }
        }
        result
    }

    /// Removes `(object, obj_type)`'s ownership of `[start, end]`, leaving
    /// the range unowned.
    pub fn remove(
        &self,
        start: PhysAddr,
        end: PhysAddr,
        object: usize,
        obj_type: MemdbType,
    ) -> Result<()> {
        self.update(start, end, 0, MemdbType::NoType, object, obj_type)
    }

    /// Clears `[start, end]` regardless of owner, provided the whole range
    /// has one owner. An already-empty range is left as is.
    pub fn clear(&self, start: PhysAddr, end: PhysAddr) -> Result<()> {
        Self::range_check(start, end)?;
        match self.lookup(start) {
            Ok((object, obj_type)) => self.update(start, end, 0, MemdbType::NoType, object, obj_type),
            Err(Error::MemdbEmpty) => {
                if self.is_ownership_contiguous(start, end, 0, MemdbType::NoType) {
                    Ok(())
                } else {
                    Err(Error::MemdbNotOwner)
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Returns the `(object, type)` owning the page containing `addr`.
    pub fn lookup(&self, addr: PhysAddr) -> Result<(usize, MemdbType)> {
        if addr.as_u64() >= util::bit(MAX_BITS) {
            return Err(Error::ArgumentInvalid);
        }
        boson_rcu::read_start();
        let result = Self::lookup_table(addr.as_u64(), &self.root, ROOT_ENTRY_BITS);
        boson_rcu::read_finish();
        result
    }

    fn lookup_table(addr: u64, table: &LevelTable, entry_bits: u32) -> Result<(usize, MemdbType)> {
        debug_assert!(entry_bits <= ROOT_ENTRY_BITS);
        let entry = table.load(entry_index(addr, entry_bits));

        match entry.entry_type() {
            MemdbType::NoType => Err(Error::MemdbEmpty),
            MemdbType::LevelTable => {
                // SAFETY: Level entries always point to live nodes; RCU
                // defers frees past this read section.
                let next = unsafe { &*(entry.entry_ptr() as *const LevelTable) };
                Self::lookup_table(addr, next, entry_bits - BITS_PER_LEVEL)
            }
            MemdbType::LevelBitmap => {
                // SAFETY: As above.
                let bitmap = unsafe { &*(entry.entry_ptr() as *const node::LevelBitmap) };
                let sub_bits = entry_bits - BITS_PER_LEVEL;
                let id = bitmap.id_at(entry_index(addr, sub_bits));
                let entry = bitmap.object(id);
                // Next-level entries would duplicate whole branches, so
                // they never appear inside a bitmap leaf.
                debug_assert!(!entry.entry_type().is_level());
                match entry.entry_type() {
                    MemdbType::NoType => Err(Error::MemdbEmpty),
                    t => Ok((entry.entry_ptr(), t)),
                }
            }
            t => Ok((entry.entry_ptr(), t)),
        }
    }

    /// Returns `true` iff every byte of `[start, end]` is owned by
    /// `(object, obj_type)`.
    #[must_use]
    pub fn is_ownership_contiguous(
        &self,
        start: PhysAddr,
        end: PhysAddr,
        object: usize,
        obj_type: MemdbType,
    ) -> bool {
        if start > end || end.as_u64() >= util::bit(MAX_BITS) {
            return false;
        }
        let entry = MemdbEntry::for_object(object, obj_type);
        boson_rcu::read_start();
        let result =
            Self::is_contig_table(start.as_u64(), end.as_u64(), entry, &self.root, ROOT_ENTRY_BITS);
        boson_rcu::read_finish();
        result
    }

    fn is_contig_table(
        start: u64,
        end: u64,
        entry: MemdbEntry,
        table: &LevelTable,
        entry_bits: u32,
    ) -> bool {
        debug_assert!(entry_bits <= ROOT_ENTRY_BITS);
        let start_index = entry_index(start, entry_bits);
        let end_index = entry_index(end, entry_bits);

        let mut entry_start = start;
        for i in start_index..=end_index {
            let cur_entry = table.load(i);
            let entry_end = core::cmp::min(end, entry_start | util::mask(entry_bits));

            if !Self::is_contig_entry(entry_start, entry_end, entry, cur_entry, entry_bits) {
                return false;
            }

            entry_start = entry_end + 1;
        }
        true
    }

    fn is_contig_bitmap(
        start: u64,
        end: u64,
        entry: MemdbEntry,
        bitmap: &node::LevelBitmap,
        entry_bits: u32,
    ) -> bool {
        let object_id = bitmap.find_object_any(entry);
        // Order the ID search before the bitmap reads (if it succeeded) and
        // anything conditional on the contiguity result (if it failed).
        fence(Ordering::Acquire);
        let Some(object_id) = object_id else {
            return false;
        };

        let start_index = entry_index(start, entry_bits);
        let end_index = entry_index(end, entry_bits);
        (start_index..=end_index).all(|i| bitmap.id_at(i) == object_id)
    }

    fn is_contig_entry(
        start: u64,
        end: u64,
        entry: MemdbEntry,
        cur_entry: MemdbEntry,
        entry_bits: u32,
    ) -> bool {
        debug_assert!(start >> entry_bits == end >> entry_bits);
        match cur_entry.entry_type() {
            MemdbType::LevelTable => {
                // SAFETY: Level entries point to live nodes under RCU.
                let next = unsafe { &*(cur_entry.entry_ptr() as *const LevelTable) };
                Self::is_contig_table(start, end, entry, next, entry_bits - BITS_PER_LEVEL)
            }
            MemdbType::LevelBitmap => {
                // SAFETY: As above.
                let bitmap = unsafe { &*(cur_entry.entry_ptr() as *const node::LevelBitmap) };
                Self::is_contig_bitmap(start, end, entry, bitmap, entry_bits - BITS_PER_LEVEL)
            }
            _ => entry == cur_entry,
        }
    }

    /// Calls `f` once per maximal contiguous subrange of `[start, end]`
    /// owned by `(object, obj_type)`, with the subrange base and size.
    ///
    /// Stops early and returns the error if `f` fails.
    pub fn range_walk(
        &self,
        object: usize,
        obj_type: MemdbType,
        start: PhysAddr,
        end: PhysAddr,
        f: &mut dyn FnMut(PhysAddr, u64) -> Result<()>,
    ) -> Result<()> {
        if obj_type == MemdbType::NoType {
            return Err(Error::ArgumentInvalid);
        }
        let entry = MemdbEntry::for_object(object, obj_type);

        // Truncate at the maximum address.
        let end = core::cmp::min(end.as_u64(), util::mask(MAX_BITS));
        if start.as_u64() > end {
            return Ok(());
        }

        boson_rcu::read_start();
        let result = Self::walk_table(entry, start.as_u64(), end, &self.root, ROOT_ENTRY_BITS, f, 0)
            .and_then(|pending| {
                if pending != 0 {
                    f(PhysAddr::new(end - pending + 1), pending)
                } else {
                    Ok(())
                }
            });
        boson_rcu::read_finish();
        result
    }

    /// Calls `f` once per maximal contiguous range owned by
    /// `(object, obj_type)` anywhere in the address space.
    pub fn walk(
        &self,
        object: usize,
        obj_type: MemdbType,
        f: &mut dyn FnMut(PhysAddr, u64) -> Result<()>,
    ) -> Result<()> {
        self.range_walk(
            object,
            obj_type,
            PhysAddr::new(0),
            PhysAddr::new(util::mask(MAX_BITS)),
            f,
        )
    }

    /// Walks a table level. `pending` is the size of the contiguous owned
    /// run ending just before `start`; returns the run still pending at the
    /// end of the range.
    fn walk_table(
        entry: MemdbEntry,
        start: u64,
        end: u64,
        table: &LevelTable,
        entry_bits: u32,
        f: &mut dyn FnMut(PhysAddr, u64) -> Result<()>,
        pending: u64,
    ) -> Result<u64> {
        let start_index = entry_index(start, entry_bits);
        let end_index = entry_index(end, entry_bits);

        let mut pending = pending;
        let mut entry_start = start;
        for i in start_index..=end_index {
            let cur_entry = table.load(i);
            let entry_end = core::cmp::min(end, entry_start | util::mask(entry_bits));

            pending = Self::walk_entry(entry, entry_start, entry_end, cur_entry, entry_bits, f, pending)?;

            entry_start = entry_end + 1;
        }
        Ok(pending)
    }

    fn walk_bitmap(
        entry: MemdbEntry,
        start: u64,
        end: u64,
        bitmap: &node::LevelBitmap,
        entry_bits: u32,
        f: &mut dyn FnMut(PhysAddr, u64) -> Result<()>,
        pending: u64,
    ) -> Result<u64> {
        let object_id = bitmap.find_object_any(entry);
        // Order the ID search before the bitmap reads (on success) and the
        // handler call (on failure).
        fence(Ordering::Acquire);

        let Some(object_id) = object_id else {
            // The owner is absent from this whole leaf; flush any pending
            // run that ended at its boundary.
            if pending != 0 {
                f(PhysAddr::new(start - pending), pending)?;
            }
            return Ok(0);
        };

        let start_index = entry_index(start, entry_bits);
        let end_index = entry_index(end, entry_bits);

        let mut pending = pending;
        let mut entry_start = start;
        for i in start_index..=end_index {
            let entry_end = core::cmp::min(end, entry_start | util::mask(entry_bits));
            if bitmap.id_at(i) == object_id {
                pending += entry_end - entry_start + 1;
            } else if pending != 0 {
                f(PhysAddr::new(entry_start - pending), pending)?;
                pending = 0;
            }
            entry_start = entry_end + 1;
        }
        Ok(pending)
    }

    fn walk_entry(
        entry: MemdbEntry,
        start: u64,
        end: u64,
        cur_entry: MemdbEntry,
        entry_bits: u32,
        f: &mut dyn FnMut(PhysAddr, u64) -> Result<()>,
        pending: u64,
    ) -> Result<u64> {
        match cur_entry.entry_type() {
            MemdbType::LevelTable => {
                // SAFETY: Level entries point to live nodes under RCU.
                let next = unsafe { &*(cur_entry.entry_ptr() as *const LevelTable) };
                Self::walk_table(entry, start, end, next, entry_bits - BITS_PER_LEVEL, f, pending)
            }
            MemdbType::LevelBitmap => {
                // SAFETY: As above.
                let bitmap = unsafe { &*(cur_entry.entry_ptr() as *const node::LevelBitmap) };
                Self::walk_bitmap(entry, start, end, bitmap, entry_bits - BITS_PER_LEVEL, f, pending)
            }
            _ if cur_entry == entry => Ok(pending + (end - start) + 1),
            _ => {
                if pending != 0 {
                    f(PhysAddr::new(start - pending), pending)?;
                }
                Ok(0)
            }
        }
    }
}

impl Default for MemDb {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global instance
// ---------------------------------------------------------------------------

static GLOBAL: core::sync::atomic::AtomicPtr<MemDb> =
    core::sync::atomic::AtomicPtr::new(core::ptr::null_mut());

/// Returns the system-wide ownership database, creating it on first use.
#[must_use]
pub fn global() -> &'static MemDb {
    let ptr = GLOBAL.load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: The global is leaked and never freed.
        return unsafe { &*ptr };
    }
    let fresh = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(MemDb::new()));
    match GLOBAL.compare_exchange(
        core::ptr::null_mut(),
        fresh,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        // SAFETY: Just installed; leaked for the process lifetime.
        Ok(_) => unsafe { &*fresh },
        Err(existing) => {
            // SAFETY: `fresh` lost the race and was never shared.
            drop(unsafe { alloc::boxed::Box::from_raw(fresh) });
            // SAFETY: The winner's install is permanent.
            unsafe { &*existing }
        }
    }
}
