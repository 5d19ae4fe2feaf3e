use boson_core::addr::{PhysAddr, VmAddr};
use boson_core::cpulocal::set_current_cpu;
use boson_core::error::Error;
use boson_memdb::MemdbType;
use boson_obj::{HypObject, ObjRef, ObjectState, Partition};

use crate::addrspace::Addrspace;
use crate::memextent::{ExtentAttrs, ExtentType, MemExtent};
use crate::types::{MappingAttrs, MemType, PgAccess, VmMemType};

const PAGE: u64 = 0x1000;

fn basic_attrs() -> ExtentAttrs {
    ExtentAttrs {
        xtype: ExtentType::Basic,
        memtype: MemType::Any,
        access: PgAccess::RWX,
    }
}

fn sparse_attrs() -> ExtentAttrs {
    ExtentAttrs {
        xtype: ExtentType::Sparse,
        memtype: MemType::Any,
        access: PgAccess::RWX,
    }
}

fn rw() -> MappingAttrs {
    MappingAttrs::normal(PgAccess::RW)
}

/// A partition with `size` bytes of ownership starting at `base`.
fn partition_with_range(base: u64, size: u64) -> ObjRef<Partition> {
    let part = Partition::new(None);
    part.header().set_state(ObjectState::Active);
    boson_memdb::global()
        .insert(
            PhysAddr::new(base),
            PhysAddr::new(base + size - 1),
            part.as_ptr() as usize,
            MemdbType::Partition,
        )
        .unwrap();
    part
}

fn active_extent(
    part: &ObjRef<Partition>,
    base: u64,
    size: u64,
    attrs: ExtentAttrs,
) -> ObjRef<MemExtent> {
    let me = MemExtent::new(Some(part.clone()), false);
    me.configure(PhysAddr::new(base), size, attrs).unwrap();
    MemExtent::activate(&me).unwrap();
    me.header().set_state(ObjectState::Active);
    me
}

fn active_addrspace(vmid: u16) -> ObjRef<Addrspace> {
    let asp = Addrspace::new(None);
    asp.configure(vmid).unwrap();
    asp.activate().unwrap();
    asp.header().set_state(ObjectState::Active);
    asp
}

#[test]
fn extent_activation_takes_ownership() {
    set_current_cpu(27);
    // Each test uses a disjoint physical window of the shared database.
    let base = 0x10_0000_0000;
    let part = partition_with_range(base, 0x10000);
    let me = active_extent(&part, base, 0x4000, basic_attrs());

    let db = boson_memdb::global();
    assert!(db.is_ownership_contiguous(
        PhysAddr::new(base),
        PhysAddr::new(base + 0x3fff),
        me.as_ptr() as usize,
        MemdbType::Extent
    ));
    assert!(db.is_ownership_contiguous(
        PhysAddr::new(base + 0x4000),
        PhysAddr::new(base + 0xffff),
        part.as_ptr() as usize,
        MemdbType::Partition
    ));

    // Activation of an overlapping extent fails: the partition no longer
    // owns those pages.
    let thief = MemExtent::new(Some(part.clone()), false);
    thief
        .configure(PhysAddr::new(base), 0x2000, basic_attrs())
        .unwrap();
    assert_eq!(MemExtent::activate(&thief), Err(Error::MemdbNotOwner));

    // Dropping the extent returns the pages to the partition.
    drop(me);
    assert!(db.is_ownership_contiguous(
        PhysAddr::new(base),
        PhysAddr::new(base + 0xffff),
        part.as_ptr() as usize,
        MemdbType::Partition
    ));
    set_current_cpu(0);
}

#[test]
fn extent_map_and_addrspace_lookup() {
    // Spec scenario: a one-page extent mapped read-write at 0x10000; a
    // lookup inside the page resolves to the backing physical offset.
    set_current_cpu(27);
    let base = 0x11_0000_0000;
    let part = partition_with_range(base, PAGE);
    let me = active_extent(&part, base, PAGE, basic_attrs());
    let asp = active_addrspace(50);

    me.map(&asp, VmAddr::new(0x10000), rw()).unwrap();

    let lookup = asp.lookup(VmAddr::new(0x10000), PAGE).unwrap();
    assert_eq!(lookup.phys, PhysAddr::new(base));
    assert_eq!(lookup.kernel_access, PgAccess::RW);
    // 0x10123 resolves to physical offset 0x123.
    assert_eq!(lookup.phys.as_u64() + 0x123, base + 0x123);

    me.unmap(&asp, VmAddr::new(0x10000)).unwrap();
    assert_eq!(
        asp.lookup(VmAddr::new(0x10000), PAGE).unwrap_err(),
        Error::AddrInvalid
    );
    set_current_cpu(0);
}

#[test]
fn mapping_attrs_validated_against_extent() {
    set_current_cpu(27);
    let base = 0x12_0000_0000;
    let part = partition_with_range(base, PAGE);
    let me = MemExtent::new(Some(part.clone()), false);
    me.configure(
        PhysAddr::new(base),
        PAGE,
        ExtentAttrs {
            xtype: ExtentType::Basic,
            memtype: MemType::Uncached,
            access: PgAccess::R,
        },
    )
    .unwrap();
    MemExtent::activate(&me).unwrap();
    let asp = active_addrspace(51);

    // Write access exceeds the extent's grant.
    assert_eq!(
        me.map(&asp, VmAddr::new(0), rw()),
        Err(Error::ArgumentInvalid)
    );
    // Cacheable mapping on an uncached extent.
    assert_eq!(
        me.map(
            &asp,
            VmAddr::new(0),
            MappingAttrs {
                memtype: VmMemType::NormalWB,
                kernel_access: PgAccess::R,
                user_access: PgAccess::R,
            }
        ),
        Err(Error::ArgumentInvalid)
    );
    // Non-cacheable read mapping fits.
    me.map(
        &asp,
        VmAddr::new(0),
        MappingAttrs {
            memtype: VmMemType::NormalNC,
            kernel_access: PgAccess::R,
            user_access: PgAccess::R,
        },
    )
    .unwrap();
    set_current_cpu(0);
}

#[test]
fn derived_extent_inherits_and_reverts_mappings() {
    set_current_cpu(28);
    let base = 0x13_0000_0000;
    let part = partition_with_range(base, 0x4000);
    let parent = active_extent(&part, base, 0x4000, basic_attrs());
    let asp = active_addrspace(52);

    parent.map(&asp, VmAddr::new(0x80000), rw()).unwrap();

    // Derive a read-only child over the whole range and activate it; the
    // inherited mapping is re-applied with reduced access.
    let child = MemExtent::new(Some(part.clone()), false);
    child
        .configure_derive(
            &parent,
            0,
            0x4000,
            ExtentAttrs {
                xtype: ExtentType::Basic,
                memtype: MemType::Any,
                access: PgAccess::R,
            },
        )
        .unwrap();
    MemExtent::activate(&child).unwrap();
    child.header().set_state(ObjectState::Active);

    let lookup = asp.lookup(VmAddr::new(0x80000), 0x4000).unwrap();
    assert_eq!(lookup.kernel_access, PgAccess::R);
    assert_eq!(lookup.size, 0x4000);

    // Dropping the child reverts to the parent's RW mapping and returns
    // ownership.
    drop(child);
    let lookup = asp.lookup(VmAddr::new(0x80000), 0x4000).unwrap();
    assert_eq!(lookup.kernel_access, PgAccess::RW);
    assert!(boson_memdb::global().is_ownership_contiguous(
        PhysAddr::new(base),
        PhysAddr::new(base + 0x3fff),
        parent.as_ptr() as usize,
        MemdbType::Extent
    ));
    set_current_cpu(0);
}

#[test]
fn update_access_changes_stage2() {
    set_current_cpu(28);
    let base = 0x14_0000_0000;
    let part = partition_with_range(base, 0x2000);
    let me = active_extent(&part, base, 0x2000, basic_attrs());
    let asp = active_addrspace(53);

    me.map(&asp, VmAddr::new(0x20000), rw()).unwrap();
    me.update_access(&asp, VmAddr::new(0x20000), PgAccess::R, PgAccess::R)
        .unwrap();

    let lookup = asp.lookup(VmAddr::new(0x20000), 0x2000).unwrap();
    assert_eq!(lookup.kernel_access, PgAccess::R);
    assert_eq!(lookup.user_access, PgAccess::R);

    // A vbase with no mapping is refused.
    assert_eq!(
        me.update_access(&asp, VmAddr::new(0x50000), PgAccess::R, PgAccess::R)
            .unwrap_err(),
        Error::AddrInvalid
    );
    set_current_cpu(0);
}

#[test]
fn retained_mappings_are_visible_to_lookup() {
    set_current_cpu(29);
    let base = 0x1b_0000_0000;
    let part = partition_with_range(base, 0x2000);
    let me = active_extent(&part, base, 0x2000, basic_attrs());
    let asp = active_addrspace(58);

    me.map(&asp, VmAddr::new(0x60000), rw()).unwrap();

    // Without a retain pass, slots report unmapped.
    let view = me.lookup_mapping(PhysAddr::new(base + 0x1000), 0x1000, 0);
    assert!(view.addrspace.is_null());

    crate::basic::retain_mappings(&me);
    let view = me.lookup_mapping(PhysAddr::new(base + 0x1000), 0x1000, 0);
    assert!(core::ptr::eq(view.addrspace, asp.as_ptr()));
    assert_eq!(view.vbase, 0x61000);
    assert_eq!(view.attrs.kernel_access, PgAccess::RW);
    assert_eq!(view.size, 0x1000);
    crate::basic::release_mappings(&me, false);
    set_current_cpu(0);
}

#[test]
fn is_mapped_and_exclusive() {
    set_current_cpu(29);
    let base = 0x15_0000_0000;
    let part = partition_with_range(base, PAGE);
    let me = active_extent(&part, base, PAGE, basic_attrs());
    let asp_a = active_addrspace(54);
    let asp_b = active_addrspace(55);

    assert!(!me.is_mapped(&asp_a, false));
    me.map(&asp_a, VmAddr::new(0x1000), rw()).unwrap();
    assert!(me.is_mapped(&asp_a, false));
    assert!(me.is_mapped(&asp_a, true));

    me.map(&asp_b, VmAddr::new(0x2000), rw()).unwrap();
    assert!(me.is_mapped(&asp_a, false));
    assert!(!me.is_mapped(&asp_a, true));
    set_current_cpu(0);
}

#[test]
fn sparse_extent_donation_moves_pages_and_mappings() {
    set_current_cpu(29);
    let base = 0x16_0000_0000;
    let part = partition_with_range(base, 0x8000);
    let db = boson_memdb::global();

    // A sparse parent taking the whole range from the partition up front.
    let parent = MemExtent::new(Some(part.clone()), false);
    parent
        .configure(PhysAddr::new(base), 0x8000, sparse_attrs())
        .unwrap();
    MemExtent::activate(&parent).unwrap();
    parent.header().set_state(ObjectState::Active);
    // Sparse activation defers ownership; donate the range in.
    parent.donate_child(0, 0x8000, false).unwrap();
    assert!(db.is_ownership_contiguous(
        PhysAddr::new(base),
        PhysAddr::new(base + 0x7fff),
        parent.as_ptr() as usize,
        MemdbType::Extent
    ));

    let asp = active_addrspace(56);
    parent.map(&asp, VmAddr::new(0x40000), rw()).unwrap();
    assert!(asp.lookup(VmAddr::new(0x40000), 0x8000).is_ok());

    // Derive a sparse child over the middle and donate two pages into it.
    let child = MemExtent::new(Some(part.clone()), false);
    child
        .configure_derive(&parent, 0x2000, 0x2000, sparse_attrs())
        .unwrap();
    MemExtent::activate(&child).unwrap();
    child.header().set_state(ObjectState::Active);
    child.donate_child(0, 0x2000, false).unwrap();

    assert!(db.is_ownership_contiguous(
        PhysAddr::new(base + 0x2000),
        PhysAddr::new(base + 0x3fff),
        child.as_ptr() as usize,
        MemdbType::Extent
    ));
    // The parent's stage-2 translations over the donated pages are gone;
    // the rest survive.
    assert_eq!(
        asp.lookup(VmAddr::new(0x42000), PAGE).unwrap_err(),
        Error::AddrInvalid
    );
    assert!(asp.lookup(VmAddr::new(0x40000), 0x2000).is_ok());
    assert!(asp.lookup(VmAddr::new(0x44000), 0x4000).is_ok());

    // The child maps its pages at its own base.
    child
        .map_partial(&asp, VmAddr::new(0x90000), 0, 0x2000, rw())
        .unwrap();
    let lookup = asp.lookup(VmAddr::new(0x90000), 0x2000).unwrap();
    assert_eq!(lookup.phys, PhysAddr::new(base + 0x2000));

    // Donating back restores the parent's mapping record over the range.
    child.donate_child(0, 0x2000, true).unwrap();
    assert!(db.is_ownership_contiguous(
        PhysAddr::new(base),
        PhysAddr::new(base + 0x7fff),
        parent.as_ptr() as usize,
        MemdbType::Extent
    ));
    assert!(asp.lookup(VmAddr::new(0x42000), 0x2000).is_ok());
    assert_eq!(
        asp.lookup(VmAddr::new(0x90000), PAGE).unwrap_err(),
        Error::AddrInvalid
    );
    set_current_cpu(0);
}

#[test]
fn sibling_donation_requires_shared_parent_and_sparse_target() {
    set_current_cpu(30);
    let base = 0x17_0000_0000;
    let part = partition_with_range(base, 0x8000);

    let parent = MemExtent::new(Some(part.clone()), false);
    parent
        .configure(PhysAddr::new(base), 0x8000, sparse_attrs())
        .unwrap();
    MemExtent::activate(&parent).unwrap();
    parent.donate_child(0, 0x8000, false).unwrap();

    let make_child = |offset: u64, size: u64| {
        let c = MemExtent::new(Some(part.clone()), false);
        c.configure_derive(&parent, offset, size, sparse_attrs()).unwrap();
        MemExtent::activate(&c).unwrap();
        c
    };
    let a = make_child(0, 0x4000);
    let b = make_child(0x2000, 0x4000);
    a.donate_child(0, 0x4000, false).unwrap();

    // The shared overlap region moves from a to b.
    MemExtent::donate_sibling(&a, &b, 0x2000, 0x2000).unwrap();
    let db = boson_memdb::global();
    assert!(db.is_ownership_contiguous(
        PhysAddr::new(base + 0x2000),
        PhysAddr::new(base + 0x3fff),
        b.as_ptr() as usize,
        MemdbType::Extent
    ));

    // Unrelated extents cannot exchange pages.
    let other_base = 0x17_1000_0000;
    let other_part = partition_with_range(other_base, 0x2000);
    let stranger = MemExtent::new(Some(other_part.clone()), false);
    stranger
        .configure(PhysAddr::new(other_base), 0x2000, sparse_attrs())
        .unwrap();
    MemExtent::activate(&stranger).unwrap();
    assert_eq!(
        MemExtent::donate_sibling(&a, &stranger, 0, PAGE),
        Err(Error::ArgumentInvalid)
    );
    set_current_cpu(0);
}

#[test]
fn zero_range_clears_owned_memory() {
    set_current_cpu(30);
    let base = 0x18_0000_0000;
    // Register a backing buffer so the extent's pages are writable.
    let mut backing = vec![0xffu8; 0x2000];
    boson_core::phys::register_buffer(PhysAddr::new(base), &mut backing);

    let part = partition_with_range(base, 0x2000);
    let me = active_extent(&part, base, 0x2000, basic_attrs());

    me.zero_range(0x1000, 0x1000).unwrap();
    assert!(backing[0..0x1000].iter().all(|&b| b == 0xff));
    assert!(backing[0x1000..0x2000].iter().all(|&b| b == 0));

    // Device extents refuse cache maintenance.
    let dev = MemExtent::new(Some(part.clone()), true);
    dev.configure(
        PhysAddr::new(0x18_2000_0000),
        PAGE,
        ExtentAttrs {
            xtype: ExtentType::Basic,
            memtype: MemType::Device,
            access: PgAccess::RW,
        },
    )
    .unwrap();
    MemExtent::activate(&dev).unwrap();
    assert_eq!(dev.zero_range(0, PAGE), Err(Error::Denied));
    set_current_cpu(0);
}

#[test]
fn attach_requires_owner_and_rw() {
    set_current_cpu(31);
    let base = 0x19_0000_0000;
    let part = partition_with_range(base, PAGE);
    let me = active_extent(&part, base, PAGE, basic_attrs());

    let other = Partition::new(None);
    assert_eq!(me.attach(&other, 0x1000_0000, PAGE), Err(Error::Denied));
    me.attach(&part, 0x1000_0000, PAGE).unwrap();
    me.detach(&part);
    set_current_cpu(0);
}

#[test]
fn info_area_configuration_checks() {
    set_current_cpu(31);
    let base = 0x1a_0000_0000;
    let part = partition_with_range(base, PAGE);
    let me = active_extent(&part, base, PAGE, basic_attrs());

    let asp = Addrspace::new(None);
    asp.configure(57).unwrap();

    // Unaligned IPA.
    assert_eq!(
        asp.configure_info_area(&me, VmAddr::new(0x123)),
        Err(Error::AddrInvalid)
    );
    asp.configure_info_area(&me, VmAddr::new(0x7000_0000)).unwrap();
    assert_eq!(asp.info_area_ipa(), Some(VmAddr::new(0x7000_0000)));
    set_current_cpu(0);
}
