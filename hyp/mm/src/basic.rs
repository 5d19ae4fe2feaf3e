//! Basic memory extents: whole-extent mappings in fixed slots.

use core::sync::atomic::Ordering;

use boson_core::addr::PhysAddr;
use boson_core::error::{Error, Result};
use boson_core::util;
use boson_memdb::MemdbType;
use boson_obj::{HypObject, ObjRef, ObjectType, get_safe_raw, put_raw};

use crate::addrspace::Addrspace;
use crate::memextent::{BasicMapping, ExtentType, Inner, MAX_MAPS, MappingView, MemExtent};
use crate::types::{MappingAttrs, PgAccess};

/// Applies one slot's mapping over `[offset, offset + size)` of the extent.
///
/// The caller must hold a reference (or retained safe-get) on the slot's
/// address space.
fn do_map(inner: &Inner, map: &BasicMapping, offset: u64, size: u64) -> Result<()> {
    debug_assert!(size > 0 && size <= inner.size);
    let asp_ptr = map.addrspace.load(Ordering::Relaxed);
    debug_assert!(!asp_ptr.is_null());
    // SAFETY: Per the caller contract the address space is referenced.
    let asp = unsafe { &*asp_ptr };
    debug_assert!(!asp.is_read_only());

    let attrs = map.attrs.get();
    asp.map(
        boson_core::addr::VmAddr::new(map.vbase.get() + offset),
        size,
        PhysAddr::new(inner.phys_base + offset),
        attrs.memtype,
        attrs.kernel_access,
        attrs.user_access,
    )
}

/// Removes one slot's mapping over `[offset, offset + size)`.
fn do_unmap(inner: &Inner, map: &BasicMapping, offset: u64, size: u64) {
    let asp_ptr = map.addrspace.load(Ordering::Relaxed);
    debug_assert!(!asp_ptr.is_null());
    // SAFETY: Per the caller contract the address space is referenced.
    let asp = unsafe { &*asp_ptr };

    let err = asp.unmap(
        boson_core::addr::VmAddr::new(map.vbase.get() + offset),
        size,
        PhysAddr::new(inner.phys_base + offset),
    );
    assert!(err.is_ok());
}

/// Unlinks a slot from its address space's mapping list and clears it.
fn remove_map_from_addrspace_list(map: &BasicMapping) {
    let asp_ptr = map.addrspace.load(Ordering::Relaxed);
    debug_assert!(!asp_ptr.is_null());
    // SAFETY: Per the caller contract the address space is referenced.
    let asp = unsafe { &*asp_ptr };

    let key = core::ptr::from_ref(map) as usize;
    let mut list = asp.mapping_list.lock_nopreempt();
    list.retain(|&m| m != key);
    drop(list);

    map.addrspace.store(core::ptr::null_mut(), Ordering::Release);
}

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

// ---------------------------------------------------------------------------
// Activation
// ---------------------------------------------------------------------------

/// Takes the extent's memory at activation.
pub(crate) fn activate(self_ref: &ObjRef<MemExtent>) -> Result<()> {
    let me = &**self_ref;
    let has_parent = me.inner.lock().parent.is_some();
    if has_parent {
        activate_derive(self_ref)
    } else {
        activate_root(me)
    }
}

fn activate_root(me: &MemExtent) -> Result<()> {
    let memdb = boson_memdb::global();
    let (phys_base, size) = {
        let inner = me.inner.lock();
        (inner.phys_base, inner.size)
    };
    let start = PhysAddr::new(phys_base);
    let end = PhysAddr::new(phys_base + size - 1);

    if me.is_device_mem() {
        memdb.insert(start, end, me.memdb_id(), MemdbType::Extent)
    } else {
        let partition = me
            .header()
            .partition()
            .cloned()
            .unwrap_or_else(boson_obj::partition::private);
        let partition_id = partition.as_ptr() as usize;

        let result = memdb.update(
            start,
            end,
            me.memdb_id(),
            MemdbType::Extent,
            partition_id,
            MemdbType::Partition,
        );
        if result == Err(Error::MemdbNotOwner) {
            // A previously deleted extent may not have been reclaimed yet;
            // wait out a grace period and retry once. A second failure is a
            // real conflict.
            boson_rcu::sync();
            memdb.update(
                start,
                end,
                me.memdb_id(),
                MemdbType::Extent,
                partition_id,
                MemdbType::Partition,
            )
        } else {
            result
        }
    }
}

fn activate_derive(self_ref: &ObjRef<MemExtent>) -> Result<()> {
    let me = &**self_ref;
    let memdb = boson_memdb::global();

    let parent = me.inner.lock().parent.clone().expect("derived extent");
    let parent_type = parent.extent_type();

    let mut retried = false;
    loop {
        let parent_inner = parent.inner.lock();
        if parent_inner.attached.is_some() {
            return Err(Error::Busy);
        }

        let inner = me.inner.lock_nopreempt();
        let start = PhysAddr::new(inner.phys_base);
        let end = PhysAddr::new(inner.phys_base + inner.size - 1);

        let result = memdb.update(
            start,
            end,
            me.memdb_id(),
            MemdbType::Extent,
            parent.memdb_id(),
            MemdbType::Extent,
        );
        match result {
            Ok(()) => {
                return finish_activate_derive(self_ref, &parent, parent_type, inner, parent_inner);
            }
            Err(Error::MemdbNotOwner) if !retried => {
                // Drop the locks, wait out a grace period for a deleted
                // predecessor, and retry once.
                drop(inner);
                drop(parent_inner);
                boson_rcu::sync();
                retried = true;
            }
            Err(err) => return Err(err),
        }
    }
}

fn finish_activate_derive(
    self_ref: &ObjRef<MemExtent>,
    parent: &ObjRef<MemExtent>,
    parent_type: ExtentType,
    inner: boson_core::sync::SpinLockGuard<'_, Inner>,
    parent_inner: boson_core::sync::SpinLockGuard<'_, Inner>,
) -> Result<()> {
    let me = &**self_ref;
    let memdb = boson_memdb::global();
    let phys_base = inner.phys_base;
    let size = inner.size;
    let access = inner.access;

    retain_mappings(parent);

    let mut result = Ok(());
    for i in 0..MAX_MAPS {
        let map = &me.basic_maps[i];
        let parent_map =
            lookup_mapping_for(parent, &parent_inner, parent_type, PhysAddr::new(phys_base), size, i);

        if parent_map.size != size {
            // The parent is partially mapped over the child's range; a
            // basic extent cannot represent that.
            result = Err(Error::Denied);
            break;
        }
        if parent_map.addrspace.is_null() {
            continue;
        }

        map.addrspace
            .store(parent_map.addrspace.cast_mut(), Ordering::Relaxed);
        map.vbase.set(parent_map.vbase);
        map.attrs.set(parent_map.attrs);

        // SAFETY: The parent's retain pass holds the address space.
        let asp = unsafe { &*parent_map.addrspace };
        asp.mapping_list
            .lock_nopreempt()
            .push(core::ptr::from_ref(map) as usize);

        // Inherit with reduced access; only remap if that changed anything.
        let mut attrs = parent_map.attrs;
        attrs.user_access = attrs.user_access.mask(access);
        attrs.kernel_access = attrs.kernel_access.mask(access);
        map.attrs.set(attrs);

        if attrs != parent_map.attrs {
            result = do_map(&inner, map, 0, size);
            if result.is_err() {
                remove_map_from_addrspace_list(map);
                break;
            }
        }
    }

    if let Err(err) = result {
        // Revert remappings already applied.
        for i in 0..MAX_MAPS {
            let map = &me.basic_maps[i];
            if map.addrspace.load(Ordering::Relaxed).is_null() {
                continue;
            }
            let parent_map = lookup_mapping_for(
                parent,
                &parent_inner,
                parent_type,
                PhysAddr::new(phys_base),
                size,
                i,
            );
            debug_assert!(core::ptr::eq(
                map.addrspace.load(Ordering::Relaxed),
                parent_map.addrspace.cast_mut()
            ));

            if map.attrs.get() != parent_map.attrs {
                map.attrs.set(parent_map.attrs);
                do_map(&inner, map, 0, size).expect("parent remap must succeed");
            }
            remove_map_from_addrspace_list(map);
        }

        // Revert the memdb transfer.
        memdb
            .update(
                PhysAddr::new(phys_base),
                PhysAddr::new(phys_base + size - 1),
                parent.memdb_id(),
                MemdbType::Extent,
                me.memdb_id(),
                MemdbType::Extent,
            )
            .expect("memdb revert must succeed");

        release_mappings(parent, false);
        return Err(err);
    }

    release_mappings(parent, false);

    let mut parent_inner = parent_inner;
    parent_inner.children.push(core::ptr::from_ref(me));
    Ok(())
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

pub(crate) fn map(
    me: &MemExtent,
    addrspace: &ObjRef<Addrspace>,
    vm_base: boson_core::addr::VmAddr,
    attrs: MappingAttrs,
) -> Result<()> {
    let inner = me.inner.lock();
    if util::add_overflows(vm_base.as_u64(), inner.size - 1) {
        return Err(Error::AddrOverflow);
    }

    // A slot freed by a deactivated address space is observed with an
    // acquire load, pairing with the release store of its removal.
    let Some(map) = me
        .basic_maps
        .iter()
        .find(|m| m.addrspace.load(Ordering::Acquire).is_null())
    else {
        return Err(Error::MemextentMappingsFull);
    };

    addrspace
        .mapping_list
        .lock_nopreempt()
        .push(core::ptr::from_ref(map) as usize);
    map.addrspace
        .store(addrspace.as_ptr().cast_mut(), Ordering::Relaxed);
    map.vbase.set(vm_base.as_u64());
    map.attrs.set(attrs);

    let result = if inner.children.is_empty() {
        do_map(&inner, map, 0, inner.size)
    } else {
        // Map only the pieces the extent still owns, rolling back the
        // applied prefix on failure.
        let ranges = owned_ranges(me, inner.phys_base, inner.size);
        let mut applied = 0;
        let mut result = Ok(());
        for &(base, len) in &ranges {
            result = do_map(&inner, map, base - inner.phys_base, len);
            if result.is_err() {
                break;
            }
            applied += 1;
        }
        if result.is_err() {
            for &(base, len) in ranges.iter().take(applied) {
                do_unmap(&inner, map, base - inner.phys_base, len);
            }
        }
        result
    };

    if result.is_err() {
        remove_map_from_addrspace_list(map);
    }
    result
}

pub(crate) fn unmap(
    me: &MemExtent,
    addrspace: &ObjRef<Addrspace>,
    vm_base: boson_core::addr::VmAddr,
) -> Result<()> {
    let inner = me.inner.lock();

    let Some(map) = me.basic_maps.iter().find(|m| {
        core::ptr::eq(m.addrspace.load(Ordering::Relaxed), addrspace.as_ptr())
            && m.vbase.get() == vm_base.as_u64()
    }) else {
        return Err(Error::AddrInvalid);
    };

    if inner.children.is_empty() {
        do_unmap(&inner, map, 0, inner.size);
    } else {
        for (base, len) in owned_ranges(me, inner.phys_base, inner.size) {
            do_unmap(&inner, map, base - inner.phys_base, len);
        }
    }

    remove_map_from_addrspace_list(map);
    Ok(())
}

pub(crate) fn unmap_all(me: &MemExtent) -> bool {
    let inner = me.inner.lock();

    // The address-space back-references are weak; revalidate each before
    // touching its translation tables.
    boson_rcu::read_start();
    let mut walk_maps: [Option<&BasicMapping>; MAX_MAPS] = [None; MAX_MAPS];
    let mut walk_count = 0;
    for map in &me.basic_maps {
        let asp_ptr = map.addrspace.load(Ordering::Acquire);
        if asp_ptr.is_null() {
            continue;
        }
        // SAFETY: A non-null weak pointer read inside a read section is
        // examinable; get_safe refuses it once released.
        if !unsafe { get_safe_raw(ObjectType::Addrspace, asp_ptr.cast()) } {
            continue;
        }
        if inner.children.is_empty() {
            do_unmap(&inner, map, 0, inner.size);
            remove_map_from_addrspace_list(map);
            // SAFETY: Releases the safe-get above.
            unsafe { put_raw(ObjectType::Addrspace, asp_ptr.cast()) };
        } else {
            walk_maps[walk_count] = Some(map);
            walk_count += 1;
        }
    }
    boson_rcu::read_finish();

    if walk_count != 0 {
        for (base, len) in owned_ranges(me, inner.phys_base, inner.size) {
            for map in walk_maps.iter().flatten() {
                do_unmap(&inner, map, base - inner.phys_base, len);
            }
        }
        for map in walk_maps.iter().flatten() {
            let asp_ptr = map.addrspace.load(Ordering::Relaxed);
            remove_map_from_addrspace_list(map);
            // SAFETY: Releases the safe-get taken in the collection pass.
            unsafe { put_raw(ObjectType::Addrspace, asp_ptr.cast()) };
        }
    }

    true
}

pub(crate) fn update_access(
    me: &MemExtent,
    addrspace: &ObjRef<Addrspace>,
    vm_base: boson_core::addr::VmAddr,
    kernel_access: PgAccess,
    user_access: PgAccess,
) -> Result<()> {
    let inner = me.inner.lock();

    let Some(map) = me.basic_maps.iter().find(|m| {
        core::ptr::eq(m.addrspace.load(Ordering::Relaxed), addrspace.as_ptr())
            && m.vbase.get() == vm_base.as_u64()
    }) else {
        return Err(Error::AddrInvalid);
    };

    let old_attrs = map.attrs.get();
    let mut new_attrs = old_attrs;
    new_attrs.kernel_access = kernel_access;
    new_attrs.user_access = user_access;
    map.attrs.set(new_attrs);

    let result = if inner.children.is_empty() {
        do_map(&inner, map, 0, inner.size)
    } else {
        let ranges = owned_ranges(me, inner.phys_base, inner.size);
        let mut result = Ok(());
        let mut applied = 0;
        for &(base, len) in &ranges {
            result = do_map(&inner, map, base - inner.phys_base, len);
            if result.is_err() {
                break;
            }
            applied += 1;
        }
        if result.is_err() {
            map.attrs.set(old_attrs);
            for &(base, len) in ranges.iter().take(applied) {
                do_map(&inner, map, base - inner.phys_base, len)
                    .expect("restoring mapping attributes must succeed");
            }
        }
        result
    };

    if result.is_err() {
        map.attrs.set(old_attrs);
    }
    result
}

pub(crate) fn is_mapped(me: &MemExtent, addrspace: &ObjRef<Addrspace>, exclusive: bool) -> bool {
    let _inner = me.inner.lock();
    let mut ret = false;
    for map in &me.basic_maps {
        let asp = map.addrspace.load(Ordering::Relaxed);
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
// Retain/release and lookup
// ---------------------------------------------------------------------------

/// Pins each slot's address space with a safe-get so lookups stay valid
/// while the caller works through the mappings.
pub(crate) fn retain_mappings(me: &MemExtent) {
    boson_rcu::read_start();
    for map in &me.basic_maps {
        let asp = map.addrspace.load(Ordering::Acquire);
        // SAFETY: Weak pointer revalidation inside a read section.
        if !asp.is_null() && unsafe { get_safe_raw(ObjectType::Addrspace, asp.cast()) } {
            map.retained.set(true);
        }
    }
    boson_rcu::read_finish();
}

/// Drops the references taken by [`retain_mappings`]; with `clear`, also
/// removes the mappings from their address spaces' lists.
pub(crate) fn release_mappings(me: &MemExtent, clear: bool) {
    for map in &me.basic_maps {
        if !map.retained.get() {
            continue;
        }
        let asp = map.addrspace.load(Ordering::Relaxed);
        debug_assert!(!asp.is_null());
        if clear {
            remove_map_from_addrspace_list(map);
        }
        // SAFETY: Releases the retain pass's safe-get.
        unsafe { put_raw(ObjectType::Addrspace, asp.cast()) };
        map.retained.set(false);
    }
}

/// Slot `i`'s view of `[phys, phys + size)`. Only meaningful between
/// retain and release.
pub(crate) fn lookup_mapping(me: &MemExtent, phys: PhysAddr, size: u64, i: usize) -> MappingView {
    debug_assert!(i < MAX_MAPS);
    let inner = me.inner.lock();
    debug_assert!(
        phys.as_u64() >= inner.phys_base
            && phys.as_u64() + (size - 1) <= inner.phys_base + (inner.size - 1)
    );
    lookup_mapping_locked(me, &inner, phys, size, i)
}

pub(crate) fn lookup_mapping_locked(
    me: &MemExtent,
    inner: &Inner,
    phys: PhysAddr,
    size: u64,
    i: usize,
) -> MappingView {
    let map = &me.basic_maps[i];
    if !map.retained.get() {
        return MappingView::unmapped(size);
    }
    let asp = map.addrspace.load(Ordering::Relaxed);
    debug_assert!(!asp.is_null());
    MappingView {
        addrspace: asp,
        vbase: map.vbase.get() + (phys.as_u64() - inner.phys_base),
        attrs: map.attrs.get(),
        size,
    }
}

fn lookup_mapping_for(
    extent: &MemExtent,
    extent_inner: &Inner,
    xtype: ExtentType,
    phys: PhysAddr,
    size: u64,
    i: usize,
) -> MappingView {
    // Called with the extent's lock already held by the caller's chain, so
    // dispatch without re-locking.
    match xtype {
        ExtentType::Basic => lookup_mapping_locked(extent, extent_inner, phys, size, i),
        ExtentType::Sparse => crate::sparse::lookup_mapping_raw(extent, phys, size, i),
    }
}

// ---------------------------------------------------------------------------
// Deactivation
// ---------------------------------------------------------------------------

pub(crate) fn deactivate(me: &MemExtent) {
    let has_parent = me.inner.lock().parent.is_some();
    if has_parent {
        revert_mappings(me);
    } else {
        let _ = unmap_all(me);
    }
}

/// Reverts a derived extent's mappings to its parent's, assuming the
/// extent has no children.
fn revert_mappings(me: &MemExtent) {
    let parent = me.inner.lock().parent.clone().expect("derived extent");
    let parent_type = parent.extent_type();

    let parent_inner = parent.inner.lock();
    let inner = me.inner.lock_nopreempt();
    debug_assert!(inner.children.is_empty());

    retain_mappings(me);
    retain_mappings(&parent);

    let phys = PhysAddr::new(inner.phys_base);
    let size = inner.size;

    let child_views: [MappingView; MAX_MAPS] =
        core::array::from_fn(|i| lookup_mapping_locked(me, &inner, phys, size, i));
    let mut parent_views: [MappingView; MAX_MAPS] = [MappingView::unmapped(size); MAX_MAPS];
    let mut child_match = [false; MAX_MAPS];
    let mut parent_match = [false; MAX_MAPS];

    for i in 0..MAX_MAPS {
        parent_views[i] = lookup_mapping_for(&parent, &parent_inner, parent_type, phys, size, i);
        let pmap = &parent_views[i];
        if pmap.addrspace.is_null() {
            continue;
        }
        for (j, cmap) in child_views.iter().enumerate() {
            if cmap.addrspace.is_null() || !core::ptr::eq(cmap.addrspace, pmap.addrspace) {
                continue;
            }
            let vbase_match = cmap.vbase == pmap.vbase;
            let attrs_match = cmap.attrs == pmap.attrs;
            // A child mapping only needs unmapping when the vbase differs;
            // matching vbase with different attrs is fixed by re-applying
            // the parent's mapping over it.
            parent_match[i] = vbase_match && attrs_match;
            child_match[j] = vbase_match;
        }
    }

    for i in 0..MAX_MAPS {
        let cmap = &child_views[i];
        if !cmap.addrspace.is_null() && !child_match[i] {
            // SAFETY: The retain pass holds the address space.
            let asp = unsafe { &*cmap.addrspace };
            asp.unmap(boson_core::addr::VmAddr::new(cmap.vbase), size, phys)
                .expect("unmap of reverted mapping must succeed");
        }

        let pmap = &parent_views[i];
        if !pmap.addrspace.is_null() && !parent_match[i] {
            // SAFETY: As above.
            let asp = unsafe { &*pmap.addrspace };
            asp.map(
                boson_core::addr::VmAddr::new(pmap.vbase),
                size,
                phys,
                pmap.attrs.memtype,
                pmap.attrs.kernel_access,
                pmap.attrs.user_access,
            )
            .expect("failed revert to parent mapping");
        }
    }

    release_mappings(&parent, false);
    release_mappings(me, true);

    drop(inner);
    drop(parent_inner);
}
