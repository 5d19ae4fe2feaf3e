//! Sparse memory extents: per-range mappings and donation.
//!
//! A sparse extent keeps one mapping slot per target address space; each
//! slot is a range table keyed by physical address holding the virtual
//! base and attributes of every mapped piece. Ownership of a sparse
//! extent's pages is not taken at activation (unless the parent cannot
//! donate): it moves page-granularly through explicit donate calls, and
//! the stage-2 state follows — a losing extent's translations for the
//! donated range are removed, a gaining extent re-applies its own covering
//! mapping records.

use core::sync::atomic::Ordering;

use boson_core::addr::{PhysAddr, VmAddr};
use boson_core::error::{Error, Result};
use boson_memdb::MemdbType;
use boson_obj::{HypObject, ObjRef, ObjectType, get_safe_raw, put_raw};

use crate::addrspace::Addrspace;
use crate::memextent::{MAX_MAPS, MappingView, MemExtent, SparseMapping};
use crate::types::{MappingAttrs, PgAccess};

/// Collects the ranges of `[phys, phys + size)` the extent currently owns.
fn owned_ranges(me: &MemExtent, phys: u64, size: u64) -> alloc::vec::Vec<(u64, u64)> {
    let mut ranges = alloc::vec::Vec::new();
    let _ = boson_memdb::global().range_walk(
        me.memdb_id(),
        MemdbType::Extent,
        PhysAddr::new(phys),
        PhysAddr::new(phys + size - 1),
        &mut |base, len| {
            ranges.push((base.as_u64(), len));
            Ok(())
        },
    );
    ranges
}

/// Finds the slot already mapping into `addrspace`.
fn find_slot<'a>(me: &'a MemExtent, addrspace: *const Addrspace) -> Option<&'a SparseMapping> {
    me.sparse_maps
        .iter()
        .find(|m| core::ptr::eq(m.addrspace.load(Ordering::Relaxed), addrspace))
}

/// Finds or claims a slot for `addrspace`.
fn find_or_claim_slot<'a>(
    me: &'a MemExtent,
    addrspace: *const Addrspace,
) -> Result<&'a SparseMapping> {
    if let Some(slot) = find_slot(me, addrspace) {
        return Ok(slot);
    }
    let Some(slot) = me
        .sparse_maps
        .iter()
        .find(|m| m.addrspace.load(Ordering::Acquire).is_null())
    else {
        return Err(Error::MemextentMappingsFull);
    };
    slot.addrspace.store(addrspace.cast_mut(), Ordering::Relaxed);
    Ok(slot)
}

/// Releases a slot whose range table became empty.
fn release_slot_if_empty(slot: &SparseMapping) {
    if slot.gpt.borrow().is_empty() {
        slot.addrspace.store(core::ptr::null_mut(), Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Activation / deactivation
// ---------------------------------------------------------------------------

pub(crate) fn activate(self_ref: &ObjRef<MemExtent>) -> Result<()> {
    let me = &**self_ref;
    let memdb = boson_memdb::global();

    let (phys_base, size, parent) = {
        let inner = me.inner.lock();
        (inner.phys_base, inner.size, inner.parent.clone())
    };
    let start = PhysAddr::new(phys_base);
    let end = PhysAddr::new(phys_base + size - 1);

    match &parent {
        None if me.is_device_mem() => {
            // Device memory cannot be donated; insert it outright.
            memdb.insert(start, end, me.memdb_id(), MemdbType::Extent)?;
        }
        None => {
            // Owned by the partition, which supports donation: ownership
            // arrives through donate calls.
        }
        Some(parent_ref) if !parent_ref.supports_donation() => {
            // The parent cannot donate, so take the entire range now.
            let result = memdb.update(
                start,
                end,
                me.memdb_id(),
                MemdbType::Extent,
                parent_ref.memdb_id(),
                MemdbType::Extent,
            );
            if result == Err(Error::MemdbNotOwner) {
                boson_rcu::sync();
                memdb.update(
                    start,
                    end,
                    me.memdb_id(),
                    MemdbType::Extent,
                    parent_ref.memdb_id(),
                    MemdbType::Extent,
                )?;
            } else {
                result?;
            }
        }
        Some(_) => {
            // Sparse parent: deferred to donation.
        }
    }

    if let Some(parent_ref) = parent {
        let mut parent_inner = parent_ref.inner.lock();
        parent_inner.children.push(core::ptr::from_ref(me));
    }
    Ok(())
}

pub(crate) fn deactivate(me: &MemExtent) {
    let _ = unmap_all(me);
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

pub(crate) fn map_partial(
    me: &MemExtent,
    addrspace: &ObjRef<Addrspace>,
    vm_base: VmAddr,
    offset: u64,
    size: u64,
    attrs: MappingAttrs,
) -> Result<()> {
    let inner = me.inner.lock();
    let phys = inner.phys_base + offset;

    let slot = find_or_claim_slot(me, addrspace.as_ptr())?;

    slot.gpt
        .borrow_mut()
        .insert(phys, size, (vm_base.as_u64(), attrs))?;

    // Apply stage-2 state for the pieces this extent actually owns.
    let ranges = owned_ranges(me, phys, size);
    let mut applied = 0;
    let mut result = Ok(());
    for &(base, len) in &ranges {
        result = addrspace.map(
            VmAddr::new(vm_base.as_u64() + (base - phys)),
            len,
            PhysAddr::new(base),
            attrs.memtype,
            attrs.kernel_access,
            attrs.user_access,
        );
        if result.is_err() {
            break;
        }
        applied += 1;
    }

    if result.is_err() {
        for &(base, len) in ranges.iter().take(applied) {
            addrspace
                .unmap(
                    VmAddr::new(vm_base.as_u64() + (base - phys)),
                    len,
                    PhysAddr::new(base),
                )
                .expect("rollback unmap must succeed");
        }
        slot.gpt
            .borrow_mut()
            .remove(phys, size, &(vm_base.as_u64(), attrs))
            .expect("mapping record was just inserted");
        release_slot_if_empty(slot);
    }

    drop(inner);
    result
}

pub(crate) fn unmap_partial(
    me: &MemExtent,
    addrspace: &ObjRef<Addrspace>,
    vm_base: VmAddr,
    offset: u64,
    size: u64,
) -> Result<()> {
    let inner = me.inner.lock();
    let phys = inner.phys_base + offset;

    let Some(slot) = find_slot(me, addrspace.as_ptr()) else {
        return Err(Error::AddrInvalid);
    };

    let removed = punch_range(slot, phys, size);
    if removed.is_empty() {
        return Err(Error::AddrInvalid);
    }

    for (piece_base, piece_size, (piece_vbase, _attrs)) in removed {
        debug_assert_eq!(piece_vbase, vm_base.as_u64() + (piece_base - phys));
        addrspace
            .unmap(VmAddr::new(piece_vbase), piece_size, PhysAddr::new(piece_base))
            .expect("stage-2 unmap must succeed");
    }

    release_slot_if_empty(slot);
    drop(inner);
    Ok(())
}

pub(crate) fn unmap_all(me: &MemExtent) -> bool {
    let _inner = me.inner.lock();

    boson_rcu::read_start();
    for slot in &me.sparse_maps {
        let asp_ptr = slot.addrspace.load(Ordering::Acquire);
        if asp_ptr.is_null() {
            continue;
        }
        // SAFETY: Weak pointer revalidated inside the read section.
        if !unsafe { get_safe_raw(ObjectType::Addrspace, asp_ptr.cast()) } {
            // The address space died; just drop the records.
            slot.gpt.borrow_mut().clear();
            slot.addrspace.store(core::ptr::null_mut(), Ordering::Release);
            continue;
        }
        // SAFETY: Safe-get succeeded above.
        let asp = unsafe { &*asp_ptr };

        let pieces: alloc::vec::Vec<_> = slot
            .gpt
            .borrow()
            .iter()
            .map(|(b, s, v)| (b, s, *v))
            .collect();
        for (base, len, (vbase, _attrs)) in pieces {
            asp.unmap(VmAddr::new(vbase), len, PhysAddr::new(base))
                .expect("stage-2 unmap must succeed");
        }
        slot.gpt.borrow_mut().clear();
        slot.addrspace.store(core::ptr::null_mut(), Ordering::Release);
        // SAFETY: Releases the safe-get above.
        unsafe { put_raw(ObjectType::Addrspace, asp_ptr.cast()) };
    }
    boson_rcu::read_finish();

    true
}

pub(crate) fn update_access(
    me: &MemExtent,
    addrspace: &ObjRef<Addrspace>,
    vm_base: VmAddr,
    kernel_access: PgAccess,
    user_access: PgAccess,
) -> Result<()> {
    let inner = me.inner.lock();

    let Some(slot) = find_slot(me, addrspace.as_ptr()) else {
        return Err(Error::AddrInvalid);
    };

    // Find the record placed at this virtual base.
    let record = slot
        .gpt
        .borrow()
        .iter()
        .find(|(_b, _s, (vbase, _a))| *vbase == vm_base.as_u64())
        .map(|(b, s, v)| (b, s, *v));
    let Some((base, len, (vbase, mut attrs))) = record else {
        return Err(Error::AddrInvalid);
    };

    let old_attrs = attrs;
    attrs.kernel_access = kernel_access;
    attrs.user_access = user_access;

    {
        let mut gpt = slot.gpt.borrow_mut();
        gpt.remove(base, len, &(vbase, old_attrs)).expect("record present");
        gpt.insert(base, len, (vbase, attrs)).expect("range was free");
    }

    // Re-apply the owned pieces with the new attributes.
    let mut result = Ok(());
    for (piece_base, piece_len) in owned_ranges(me, base, len) {
        result = addrspace.map(
            VmAddr::new(vbase + (piece_base - base)),
            piece_len,
            PhysAddr::new(piece_base),
            attrs.memtype,
            attrs.kernel_access,
            attrs.user_access,
        );
        if result.is_err() {
            break;
        }
    }

    if result.is_err() {
        // Restore the record and the stage-2 state.
        let mut gpt = slot.gpt.borrow_mut();
        gpt.remove(base, len, &(vbase, attrs)).expect("record present");
        gpt.insert(base, len, (vbase, old_attrs)).expect("range was free");
        drop(gpt);
        for (piece_base, piece_len) in owned_ranges(me, base, len) {
            addrspace
                .map(
                    VmAddr::new(vbase + (piece_base - base)),
                    piece_len,
                    PhysAddr::new(piece_base),
                    old_attrs.memtype,
                    old_attrs.kernel_access,
                    old_attrs.user_access,
                )
                .expect("restoring mapping attributes must succeed");
        }
    }

    drop(inner);
    result
}

/// Narrows or widens access on a sub-range of an existing mapping record:
/// the covered piece is split out of its record and re-applied with the
/// new access.
pub(crate) fn update_access_partial(
    me: &MemExtent,
    addrspace: &ObjRef<Addrspace>,
    vm_base: VmAddr,
    offset: u64,
    size: u64,
    kernel_access: PgAccess,
    user_access: PgAccess,
) -> Result<()> {
    let inner = me.inner.lock();
    let phys = inner.phys_base + offset;

    let Some(slot) = find_slot(me, addrspace.as_ptr()) else {
        return Err(Error::AddrInvalid);
    };

    // The whole range must be covered by one record placed at a matching
    // virtual base.
    let record = slot.gpt.borrow().lookup(phys).map(|(b, s, v)| (b, s, *v));
    let Some((rb, rs, (rvb, attrs))) = record else {
        return Err(Error::AddrInvalid);
    };
    if phys + size > rb + rs || rvb + (phys - rb) != vm_base.as_u64() {
        return Err(Error::AddrInvalid);
    }

    let mut new_attrs = attrs;
    new_attrs.kernel_access = kernel_access;
    new_attrs.user_access = user_access;
    if new_attrs == attrs {
        return Ok(());
    }

    // Split the covered piece out of the record and reinsert it with the
    // new attributes.
    let removed = punch_range(slot, phys, size);
    debug_assert_eq!(removed.len(), 1);
    drop(removed);
    slot.gpt
        .borrow_mut()
        .insert(phys, size, (vm_base.as_u64(), new_attrs))
        .expect("punched range is free");

    // Re-apply stage-2 state for the owned pieces.
    for (piece_base, piece_len) in owned_ranges(me, phys, size) {
        addrspace
            .map(
                VmAddr::new(vm_base.as_u64() + (piece_base - phys)),
                piece_len,
                PhysAddr::new(piece_base),
                new_attrs.memtype,
                new_attrs.kernel_access,
                new_attrs.user_access,
            )
            .expect("remap with changed access must succeed");
    }

    drop(inner);
    Ok(())
}

pub(crate) fn is_mapped(me: &MemExtent, addrspace: &ObjRef<Addrspace>, exclusive: bool) -> bool {
    let _inner = me.inner.lock();
    let mut ret = false;
    for slot in &me.sparse_maps {
        let asp = slot.addrspace.load(Ordering::Relaxed);
        if core::ptr::eq(asp, addrspace.as_ptr()) {
            ret = true;
        } else if !asp.is_null() {
            ret = false;
        } else {
            continue;
        }
        if ret != exclusive {
            break;
        }
    }
    ret
}

// ---------------------------------------------------------------------------
// Donation
// ---------------------------------------------------------------------------

/// Transfers `[phys, phys + size)` between this extent and its parent (or
/// owning partition when it has no parent). `reverse` donates back.
pub(crate) fn donate_child(me: &MemExtent, phys: PhysAddr, size: u64, reverse: bool) -> Result<()> {
    let memdb = boson_memdb::global();
    let parent = me.inner.lock().parent.clone();

    // Parent-first lock order, matching the rest of the extent tree.
    let _parent_guard = parent.as_ref().map(|p| p.inner.lock());
    let _guard = if _parent_guard.is_some() {
        me.inner.lock_nopreempt()
    } else {
        me.inner.lock()
    };

    let (other_id, other_type) = match &parent {
        Some(parent_ref) => (parent_ref.memdb_id(), MemdbType::Extent),
        None => {
            let partition = me
                .header()
                .partition()
                .cloned()
                .unwrap_or_else(boson_obj::partition::private);
            (partition.as_ptr() as usize, MemdbType::Partition)
        }
    };

    let end = PhysAddr::new(phys.as_u64() + size - 1);
    if reverse {
        // Remove our translations before the range stops being ours.
        drop_stage2_for_range(me, phys, size);
        memdb.update(phys, end, other_id, other_type, me.memdb_id(), MemdbType::Extent)?;
        if let Some(parent_ref) = &parent {
            apply_stage2_for_range(parent_ref, phys, size);
        }
    } else {
        if let Some(parent_ref) = &parent {
            drop_stage2_for_range(parent_ref, phys, size);
        }
        let result = memdb.update(phys, end, me.memdb_id(), MemdbType::Extent, other_id, other_type);
        if let Err(err) = result {
            // Restore the parent's translations for the range it kept.
            if let Some(parent_ref) = &parent {
                apply_stage2_for_range(parent_ref, phys, size);
            }
            return Err(err);
        }
        apply_stage2_for_range(me, phys, size);
    }
    Ok(())
}

/// Transfers `[phys, phys + size)` between two children of the same parent.
/// Locks are taken in address order of the extents to prevent deadlock.
pub(crate) fn donate_sibling(from: &MemExtent, to: &MemExtent, phys: PhysAddr, size: u64) -> Result<()> {
    let memdb = boson_memdb::global();

    let (first, second) = if core::ptr::from_ref(from) < core::ptr::from_ref(to) {
        (from, to)
    } else {
        (to, from)
    };
    let _first_guard = first.inner.lock();
    let _second_guard = second.inner.lock_nopreempt();

    drop_stage2_for_range(from, phys, size);
    memdb.update(
        phys,
        PhysAddr::new(phys.as_u64() + size - 1),
        to.memdb_id(),
        MemdbType::Extent,
        from.memdb_id(),
        MemdbType::Extent,
    )?;
    apply_stage2_for_range(to, phys, size);
    Ok(())
}

/// Removes an extent's stage-2 translations over `[phys, phys + size)`,
/// for every mapping slot, where the mapping records cover the range. The
/// records themselves stay: if the range is donated back later, they are
/// re-applied.
fn drop_stage2_for_range(me: &MemExtent, phys: PhysAddr, size: u64) {
    // For a basic extent (or a partition stand-in) the sparse slots are
    // all empty, so the loop is a no-op.
    boson_rcu::read_start();
    for slot in &me.sparse_maps {
        let asp_ptr = slot.addrspace.load(Ordering::Acquire);
        if asp_ptr.is_null() {
            continue;
        }
        // SAFETY: Weak pointer revalidated inside the read section.
        if !unsafe { get_safe_raw(ObjectType::Addrspace, asp_ptr.cast()) } {
            continue;
        }
        // SAFETY: Safe-get succeeded.
        let asp = unsafe { &*asp_ptr };
        for (base, len, vbase) in overlapping_pieces(slot, phys.as_u64(), size) {
            asp.unmap(VmAddr::new(vbase), len, PhysAddr::new(base))
                .expect("stage-2 unmap must succeed");
        }
        // SAFETY: Releases the safe-get above.
        unsafe { put_raw(ObjectType::Addrspace, asp_ptr.cast()) };
    }
    boson_rcu::read_finish();
}

/// Applies an extent's mapping records over a freshly gained range.
fn apply_stage2_for_range(me: &MemExtent, phys: PhysAddr, size: u64) {
    boson_rcu::read_start();
    for slot in &me.sparse_maps {
        let asp_ptr = slot.addrspace.load(Ordering::Acquire);
        if asp_ptr.is_null() {
            continue;
        }
        // SAFETY: Weak pointer revalidated inside the read section.
        if !unsafe { get_safe_raw(ObjectType::Addrspace, asp_ptr.cast()) } {
            continue;
        }
        // SAFETY: Safe-get succeeded.
        let asp = unsafe { &*asp_ptr };
        let attrs_of = |b: u64| -> Option<(u64, MappingAttrs)> {
            slot.gpt
                .borrow()
                .lookup(b)
                .map(|(rb, _rs, (vb, a))| (vb + (b - rb), *a))
        };
        for (base, len, _vbase) in overlapping_pieces(slot, phys.as_u64(), size) {
            if let Some((vbase, attrs)) = attrs_of(base) {
                asp.map(
                    VmAddr::new(vbase),
                    len,
                    PhysAddr::new(base),
                    attrs.memtype,
                    attrs.kernel_access,
                    attrs.user_access,
                )
                .expect("stage-2 map of donated range must succeed");
            }
        }
        // SAFETY: Releases the safe-get above.
        unsafe { put_raw(ObjectType::Addrspace, asp_ptr.cast()) };
    }
    boson_rcu::read_finish();
}

/// Returns the pieces of a slot's mapping records that overlap
/// `[phys, phys + size)`, as `(base, len, vbase)`.
fn overlapping_pieces(slot: &SparseMapping, phys: u64, size: u64) -> alloc::vec::Vec<(u64, u64, u64)> {
    let end = phys + size;
    slot.gpt
        .borrow()
        .iter()
        .filter_map(|(rb, rs, (vb, _a))| {
            let rend = rb + rs;
            let ob = rb.max(phys);
            let oe = rend.min(end);
            if ob < oe {
                Some((ob, oe - ob, vb + (ob - rb)))
            } else {
                None
            }
        })
        .collect()
}

/// Removes the parts of a slot's records overlapping `[phys, phys+size)`,
/// reinserting the non-overlapping remainders. Returns the removed pieces.
#[allow(clippy::type_complexity)]
fn punch_range(
    slot: &SparseMapping,
    phys: u64,
    size: u64,
) -> alloc::vec::Vec<(u64, u64, (u64, MappingAttrs))> {
    let end = phys + size;
    let mut removed = alloc::vec::Vec::new();

    let overlapping: alloc::vec::Vec<_> = slot
        .gpt
        .borrow()
        .iter()
        .filter(|(rb, rs, _)| *rb < end && rb + rs > phys)
        .map(|(rb, rs, v)| (rb, rs, *v))
        .collect();

    let mut gpt = slot.gpt.borrow_mut();
    for (rb, rs, (vb, attrs)) in overlapping {
        gpt.take(rb);
        let rend = rb + rs;
        // Leading remainder.
        if rb < phys {
            gpt.insert(rb, phys - rb, (vb, attrs)).expect("remainder is free");
        }
        // Trailing remainder.
        if rend > end {
            gpt.insert(end, rend - end, (vb + (end - rb), attrs))
                .expect("remainder is free");
        }
        let ob = rb.max(phys);
        let oe = rend.min(end);
        removed.push((ob, oe - ob, (vb + (ob - rb), attrs)));
    }
    removed
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

pub(crate) fn lookup_mapping(me: &MemExtent, phys: PhysAddr, size: u64, i: usize) -> MappingView {
    let _inner = me.inner.lock();
    lookup_mapping_raw(me, phys, size, i)
}

/// Slot `i`'s view of `[phys, phys + size)`, without taking the extent
/// lock (for callers already inside the lock chain).
pub(crate) fn lookup_mapping_raw(me: &MemExtent, phys: PhysAddr, size: u64, i: usize) -> MappingView {
    debug_assert!(i < MAX_MAPS);
    let slot = &me.sparse_maps[i];
    let asp = slot.addrspace.load(Ordering::Relaxed);
    if asp.is_null() {
        return MappingView::unmapped(size);
    }

    let gpt = slot.gpt.borrow();
    match gpt.lookup(phys.as_u64()) {
        Some((rb, rs, (vb, attrs))) => {
            let covered = (rb + rs - phys.as_u64()).min(size);
            MappingView {
                addrspace: asp,
                vbase: vb + (phys.as_u64() - rb),
                attrs: *attrs,
                size: covered,
            }
        }
        None => {
            // Unmapped prefix up to the next record (or the query end).
            let next = gpt
                .iter()
                .map(|(rb, _, _)| rb)
                .find(|&rb| rb > phys.as_u64())
                .unwrap_or(phys.as_u64() + size);
            MappingView::unmapped((next - phys.as_u64()).min(size))
        }
    }
}
