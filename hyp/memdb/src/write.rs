//! The write path: recursive entry updates under the global writer lock.
//!
//! All functions here require the database lock to be held. Each level
//! processes its covered slice of the range one entry at a time; a failure
//! part-way through rolls back the already-updated entries of that level by
//! re-running them with the old and new owners swapped, so an error never
//! leaves a transient mixed state visible to later writers, and readers see
//! per-address atomic owner switches throughout.

use boson_core::error::{Error, Result};
use boson_core::util;

use crate::node::{self, LevelBitmap, LevelTable};
use crate::{BITMAP_OBJECTS, BITS_PER_LEVEL, LEVEL_ENTRIES, MIN_BITS, MemdbEntry, MemdbType, entry_index};

/// Updates `[start, end]` within `table`, whose entries each cover
/// `entry_bits` of address. Returns `true` if the table's entries have all
/// become equal to `new_entry` and the table can be collapsed by the caller.
pub(crate) fn update_table(
    start: u64,
    end: u64,
    old_entry: MemdbEntry,
    new_entry: MemdbEntry,
    table: &LevelTable,
    entry_bits: u32,
) -> Result<bool> {
    debug_assert!(
        start >> (entry_bits + BITS_PER_LEVEL) == end >> (entry_bits + BITS_PER_LEVEL)
    );

    let start_index = entry_index(start, entry_bits);
    let end_index = entry_index(end, entry_bits);
    let table_start = start & !util::mask(entry_bits + BITS_PER_LEVEL);

    let entry_range = |index: usize| {
        let entry_start = core::cmp::max(start, table_start + (index as u64) * util::bit(entry_bits));
        let entry_end = core::cmp::min(
            end,
            table_start + ((index as u64 + 1) * util::bit(entry_bits)) - 1,
        );
        (entry_start, entry_end)
    };

    let mut failure: Option<(Error, usize)> = None;
    for index in start_index..=end_index {
        let (entry_start, entry_end) = entry_range(index);
        if let Err(err) = update_table_entry(
            entry_start, entry_end, old_entry, new_entry, table, entry_bits, index,
        ) {
            failure = Some((err, index));
            break;
        }
    }

    if let Some((err, failed_index)) = failure {
        // Roll back the entries already updated, in reverse direction.
        for index in start_index..failed_index {
            let (entry_start, entry_end) = entry_range(index);
            if update_table_entry(
                entry_start, entry_end, new_entry, old_entry, table, entry_bits, index,
            )
            .is_err()
            {
                panic!("memdb: rollback failure");
            }
        }
        return Err(err);
    }

    Ok(check_contig(start_index, end_index, new_entry, table))
}

/// Determines whether `new_entry` now fills the whole table. Only the
/// entries at and outside the updated slice need checking; everything
/// strictly between them was just made equal to `new_entry`.
fn check_contig(
    start_index: usize,
    end_index: usize,
    new_entry: MemdbEntry,
    table: &LevelTable,
) -> bool {
    for i in 0..=start_index {
        if table.load(i) != new_entry {
            return false;
        }
    }
    for i in end_index..LEVEL_ENTRIES {
        if table.load(i) != new_entry {
            return false;
        }
    }
    true
}

/// Finds the ID of `old_entry` and verifies it covers every updated slot.
fn bitmap_check_owner(
    start_index: usize,
    end_index: usize,
    old_entry: MemdbEntry,
    bitmap: &LevelBitmap,
) -> Result<usize> {
    let old_id = (0..BITMAP_OBJECTS)
        .find(|&id| bitmap.count(id) != 0 && bitmap.object(id) == old_entry)
        .ok_or(Error::MemdbNotOwner)?;

    for i in start_index..=end_index {
        if bitmap.id_at(i) != old_id {
            return Err(Error::MemdbNotOwner);
        }
    }
    Ok(old_id)
}

/// Updates `[start, end]` within a bitmap leaf. Returns `true` if the leaf
/// became fully owned by `new_entry` and can be collapsed.
///
/// Errors:
/// - [`Error::MemdbNotOwner`]: the update is invalid; nothing was changed.
/// - [`Error::Busy`]: every owner ID is in live use, so the leaf must be
///   converted to a table.
/// - [`Error::Retry`]: the only free IDs were used before; the update must
///   run on a duplicate of the leaf so racing RCU readers can still safely
///   resolve the stale IDs through this one.
/// - [`Error::ArgumentAlignment`]: the range does not land on whole slots,
///   so the leaf must be converted to a table to grow a deeper level.
fn update_bitmap(
    start: u64,
    end: u64,
    old_entry: MemdbEntry,
    new_entry: MemdbEntry,
    bitmap: &LevelBitmap,
    entry_bits: u32,
) -> Result<bool> {
    debug_assert!(
        start >> (entry_bits + BITS_PER_LEVEL) == end >> (entry_bits + BITS_PER_LEVEL)
    );

    let start_index = entry_index(start, entry_bits);
    let end_index = entry_index(end, entry_bits);
    let changed = (end_index - start_index + 1) as i32;

    // All ownership checks run before any change: no rollback needed, and
    // an update that would fail anyway never triggers a conversion.
    let old_id = bitmap_check_owner(start_index, end_index, old_entry, bitmap)?;

    // The update will succeed; now determine whether the leaf can represent
    // it. The range must cover its slots exactly.
    if !util::is_p2aligned(start, entry_bits) || !util::is_p2aligned(end + 1, entry_bits) {
        return Err(Error::ArgumentAlignment);
    }

    // Prefer an ID that already holds the new entry (including one whose
    // count dropped to zero: its value is unchanged, so readers are safe).
    let new_id = match bitmap.find_object_any(new_entry) {
        Some(id) => id,
        None => {
            let mut should_retry = false;
            let mut claimed = None;
            for id in 0..BITMAP_OBJECTS {
                if bitmap.count(id) != 0 {
                    continue;
                }
                if bitmap.object(id) == MemdbEntry::EMPTY {
                    // Never used; safe to claim.
                    claimed = Some(id);
                    break;
                }
                // Previously used: recycling it in place would confuse
                // readers that already loaded its ID from the bitmap.
                should_retry = true;
            }
            match claimed {
                Some(id) => id,
                None if should_retry => return Err(Error::Retry),
                None => return Err(Error::Busy),
            }
        }
    };

    debug_assert!(new_id != old_id && new_id < BITMAP_OBJECTS);
    for i in start_index..=end_index {
        bitmap.set_id(i, new_id);
    }

    bitmap.set_object(new_id, new_entry);
    bitmap.adjust_count(new_id, changed);
    bitmap.adjust_count(old_id, -changed);

    // A count equal to the slot total means the leaf became contiguous.
    Ok(bitmap.count(new_id) == LEVEL_ENTRIES as u16)
}

fn update_entry_level_table(
    start: u64,
    end: u64,
    old_entry: MemdbEntry,
    new_entry: MemdbEntry,
    table: &LevelTable,
    entry_bits: u32,
    cur_entry: MemdbEntry,
    index: usize,
) -> Result<()> {
    // SAFETY: The entry was read from the tree under the writer lock.
    let next_table = unsafe { node::table_ref(cur_entry) };
    let is_contig = update_table(
        start,
        end,
        old_entry,
        new_entry,
        next_table,
        entry_bits - BITS_PER_LEVEL,
    )?;

    if is_contig {
        // The next level became uniform; collapse it into this entry and
        // retire the node.
        table.store(index, new_entry);
        node::release_table(core::ptr::from_ref(next_table).cast_mut());
    }
    Ok(())
}

fn update_entry_level_bitmap(
    start: u64,
    end: u64,
    old_entry: MemdbEntry,
    new_entry: MemdbEntry,
    table: &LevelTable,
    entry_bits: u32,
    cur_entry: MemdbEntry,
    index: usize,
) -> Result<()> {
    // SAFETY: The entry was read from the tree under the writer lock.
    let next_bitmap = unsafe { node::bitmap_ref(cur_entry) };
    let sub_bits = entry_bits - BITS_PER_LEVEL;

    match update_bitmap(start, end, old_entry, new_entry, next_bitmap, sub_bits) {
        Ok(true) => {
            table.store(index, new_entry);
            node::release_bitmap(core::ptr::from_ref(next_bitmap).cast_mut());
            Ok(())
        }
        Ok(false) => Ok(()),
        Err(Error::Busy) | Err(Error::ArgumentAlignment) => {
            // The update cannot be represented by a bitmap leaf; convert it
            // to a table and retry there.
            let new_table = node::convert_bitmap(next_bitmap)?;
            // SAFETY: Freshly allocated, not yet shared.
            let result = update_table(start, end, old_entry, new_entry, unsafe { &*new_table }, sub_bits);
            match result {
                Ok(false) => {
                    table.store(index, node::table_entry(new_table));
                    node::release_bitmap(core::ptr::from_ref(next_bitmap).cast_mut());
                    Ok(())
                }
                Ok(true) => {
                    // The update made the whole range uniform; skip the
                    // conversion entirely.
                    table.store(index, new_entry);
                    node::release_table(new_table);
                    node::release_bitmap(core::ptr::from_ref(next_bitmap).cast_mut());
                    Ok(())
                }
                Err(err) => {
                    node::release_table(new_table);
                    Err(err)
                }
            }
        }
        Err(Error::Retry) => {
            // Perform the update on a duplicate so stale IDs in the old
            // leaf stay valid for concurrent readers.
            let new_bitmap = node::duplicate_bitmap(next_bitmap)?;
            // SAFETY: Freshly allocated, not yet shared.
            let result = update_bitmap(start, end, old_entry, new_entry, unsafe { &*new_bitmap }, sub_bits);
            match result {
                Ok(false) => {
                    table.store(index, node::bitmap_entry(new_bitmap));
                    node::release_bitmap(core::ptr::from_ref(next_bitmap).cast_mut());
                    Ok(())
                }
                Ok(true) => {
                    table.store(index, new_entry);
                    node::release_bitmap(new_bitmap);
                    node::release_bitmap(core::ptr::from_ref(next_bitmap).cast_mut());
                    Ok(())
                }
                Err(err) => {
                    node::release_bitmap(new_bitmap);
                    Err(err)
                }
            }
        }
        Err(err) => Err(err),
    }
}

fn update_entry_split_bitmap(
    start: u64,
    end: u64,
    old_entry: MemdbEntry,
    new_entry: MemdbEntry,
    table: &LevelTable,
    entry_bits: u32,
    index: usize,
) -> Result<()> {
    let bitmap = node::create_bitmap(old_entry)?;
    // SAFETY: Freshly allocated, not yet shared.
    let result = update_bitmap(
        start,
        end,
        old_entry,
        new_entry,
        unsafe { &*bitmap },
        entry_bits - BITS_PER_LEVEL,
    );
    match result {
        Ok(is_contig) => {
            debug_assert!(!is_contig);
            table.store(index, node::bitmap_entry(bitmap));
            Ok(())
        }
        Err(err) => {
            node::release_bitmap(bitmap);
            Err(err)
        }
    }
}

fn update_entry_split_table(
    start: u64,
    end: u64,
    old_entry: MemdbEntry,
    new_entry: MemdbEntry,
    table: &LevelTable,
    entry_bits: u32,
    index: usize,
) -> Result<()> {
    let new_table = node::create_table(old_entry)?;
    // SAFETY: Freshly allocated, not yet shared.
    let result = update_table(
        start,
        end,
        old_entry,
        new_entry,
        unsafe { &*new_table },
        entry_bits - BITS_PER_LEVEL,
    );
    match result {
        Ok(is_contig) => {
            debug_assert!(!is_contig);
            table.store(index, node::table_entry(new_table));
            Ok(())
        }
        Err(err) => {
            node::release_table(new_table);
            Err(err)
        }
    }
}

/// Updates the slice `[start, end]` covered by entry `index` of `table`.
fn update_table_entry(
    start: u64,
    end: u64,
    old_entry: MemdbEntry,
    new_entry: MemdbEntry,
    table: &LevelTable,
    entry_bits: u32,
    index: usize,
) -> Result<()> {
    debug_assert!(start >> entry_bits == end >> entry_bits);

    let cur_entry = table.load(index);
    match cur_entry.entry_type() {
        MemdbType::LevelTable => update_entry_level_table(
            start, end, old_entry, new_entry, table, entry_bits, cur_entry, index,
        ),
        MemdbType::LevelBitmap => update_entry_level_bitmap(
            start, end, old_entry, new_entry, table, entry_bits, cur_entry, index,
        ),
        _ if cur_entry != old_entry => {
            // The resident entry must match the expected previous owner.
            Err(Error::MemdbNotOwner)
        }
        _ if util::is_p2aligned(start, entry_bits) && util::is_p2aligned(end + 1, entry_bits) => {
            // The entry's whole range is covered; replace it.
            table.store(index, new_entry);
            Ok(())
        }
        _ if entry_bits <= MIN_BITS => {
            // No deeper level exists, so the partial coverage is fatal.
            Err(Error::ArgumentAlignment)
        }
        _ if entry_bits == MIN_BITS + BITS_PER_LEVEL
            && util::is_p2aligned(start, MIN_BITS)
            && util::is_p2aligned(end + 1, MIN_BITS) =>
        {
            // Page-sized children on a page-aligned range: split into the
            // compact bitmap form.
            update_entry_split_bitmap(start, end, old_entry, new_entry, table, entry_bits, index)
        }
        _ => update_entry_split_table(start, end, old_entry, new_entry, table, entry_bits, index),
    }
}
