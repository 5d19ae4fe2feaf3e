use super::*;

use boson_core::cpulocal::set_current_cpu;

const PAGE: u64 = 0x1000;

/// Opaque owner identities. Real callers pass object pointers; the database
/// only compares them.
const PART: usize = 0x10;
const ALLOC: usize = 0x20;
const EXT_A: usize = 0x30;
const EXT_B: usize = 0x40;
const EXT_C: usize = 0x50;
const EXT_D: usize = 0x60;

fn pa(addr: u64) -> PhysAddr {
    PhysAddr::new(addr)
}

/// Lets the global RCU state retire replaced tree nodes.
fn pump_rcu() {
    for _ in 0..8 {
        boson_rcu::global().pump_current_cpu();
    }
}

#[test]
fn insert_lookup_remove_roundtrip() {
    set_current_cpu(14);
    let db = MemDb::new();

    db.insert(pa(0x4000), pa(0x7fff), PART, MemdbType::Partition)
        .unwrap();
    assert_eq!(db.lookup(pa(0x4000)), Ok((PART, MemdbType::Partition)));
    assert_eq!(db.lookup(pa(0x7abc)), Ok((PART, MemdbType::Partition)));
    assert_eq!(db.lookup(pa(0x3fff)), Err(Error::MemdbEmpty));
    assert_eq!(db.lookup(pa(0x8000)), Err(Error::MemdbEmpty));

    db.remove(pa(0x4000), pa(0x7fff), PART, MemdbType::Partition)
        .unwrap();
    assert_eq!(db.lookup(pa(0x4000)), Err(Error::MemdbEmpty));
    assert_eq!(db.lookup(pa(0x7fff)), Err(Error::MemdbEmpty));
    pump_rcu();
    set_current_cpu(0);
}

#[test]
fn range_and_alignment_validation() {
    set_current_cpu(14);
    let db = MemDb::new();
    // start >= end
    assert_eq!(
        db.insert(pa(0x2000), pa(0x1000), PART, MemdbType::Partition),
        Err(Error::ArgumentInvalid)
    );
    // beyond MAX_BITS
    assert_eq!(
        db.insert(pa(0), pa(util::bit(MAX_BITS)), PART, MemdbType::Partition),
        Err(Error::ArgumentSize)
    );
    // unaligned
    assert_eq!(
        db.insert(pa(0x1080), pa(0x1fff), PART, MemdbType::Partition),
        Err(Error::ArgumentAlignment)
    );
    assert_eq!(
        db.insert(pa(0x1000), pa(0x1f00), PART, MemdbType::Partition),
        Err(Error::ArgumentAlignment)
    );
    set_current_cpu(0);
}

#[test]
fn update_transfers_ownership() {
    // Spec scenario: a 16 KiB partition range handed to its allocator.
    set_current_cpu(15);
    let db = MemDb::new();

    db.insert(pa(0x30_0000_0000), pa(0x30_0000_3fff), PART, MemdbType::Partition)
        .unwrap();
    db.update(
        pa(0x30_0000_0000),
        pa(0x30_0000_3fff),
        ALLOC,
        MemdbType::Allocator,
        PART,
        MemdbType::Partition,
    )
    .unwrap();

    assert!(db.is_ownership_contiguous(
        pa(0x30_0000_0000),
        pa(0x30_0000_3fff),
        ALLOC,
        MemdbType::Allocator
    ));
    assert!(!db.is_ownership_contiguous(
        pa(0x30_0000_0000),
        pa(0x30_0000_3fff),
        PART,
        MemdbType::Partition
    ));
    pump_rcu();
    set_current_cpu(0);
}

#[test]
fn update_with_wrong_owner_changes_nothing() {
    set_current_cpu(15);
    let db = MemDb::new();

    db.insert(pa(0x10_0000), pa(0x10_ffff), PART, MemdbType::Partition)
        .unwrap();
    // Half the range belongs to the allocator now.
    db.update(
        pa(0x10_0000),
        pa(0x10_7fff),
        ALLOC,
        MemdbType::Allocator,
        PART,
        MemdbType::Partition,
    )
    .unwrap();

    // An update claiming the whole range came from the partition must fail
    // and leave both halves exactly as they were.
    assert_eq!(
        db.update(
            pa(0x10_0000),
            pa(0x10_ffff),
            EXT_A,
            MemdbType::Extent,
            PART,
            MemdbType::Partition,
        ),
        Err(Error::MemdbNotOwner)
    );
    assert!(db.is_ownership_contiguous(pa(0x10_0000), pa(0x10_7fff), ALLOC, MemdbType::Allocator));
    assert!(db.is_ownership_contiguous(pa(0x10_8000), pa(0x10_ffff), PART, MemdbType::Partition));
    pump_rcu();
    set_current_cpu(0);
}

#[test]
fn page_granular_split_uses_bitmap_leaf() {
    set_current_cpu(16);
    let db = MemDb::new();

    // One 256 KiB leaf region, fully partition-owned.
    db.insert(pa(0), pa(0x3_ffff), PART, MemdbType::Partition)
        .unwrap();

    // Carve single pages out to two extents.
    db.update(pa(0), pa(PAGE - 1), EXT_A, MemdbType::Extent, PART, MemdbType::Partition)
        .unwrap();
    db.update(
        pa(5 * PAGE),
        pa(6 * PAGE - 1),
        EXT_B,
        MemdbType::Extent,
        PART,
        MemdbType::Partition,
    )
    .unwrap();

    assert_eq!(db.lookup(pa(0x123)), Ok((EXT_A, MemdbType::Extent)));
    assert_eq!(db.lookup(pa(5 * PAGE + 8)), Ok((EXT_B, MemdbType::Extent)));
    assert_eq!(db.lookup(pa(PAGE)), Ok((PART, MemdbType::Partition)));
    assert_eq!(db.lookup(pa(0x3_ffff)), Ok((PART, MemdbType::Partition)));

    // Putting everything back collapses the leaf again.
    db.update(pa(0), pa(PAGE - 1), PART, MemdbType::Partition, EXT_A, MemdbType::Extent)
        .unwrap();
    db.update(
        pa(5 * PAGE),
        pa(6 * PAGE - 1),
        PART,
        MemdbType::Partition,
        EXT_B,
        MemdbType::Extent,
    )
    .unwrap();
    assert!(db.is_ownership_contiguous(pa(0), pa(0x3_ffff), PART, MemdbType::Partition));
    pump_rcu();
    set_current_cpu(0);
}

#[test]
fn five_owners_force_table_conversion() {
    set_current_cpu(16);
    let db = MemDb::new();

    db.insert(pa(0x100_0000), pa(0x103_ffff), PART, MemdbType::Partition)
        .unwrap();

    // Four more owners on distinct pages exceed the four-ID budget of a
    // bitmap leaf (the partition occupies one), forcing conversion.
    let owners = [EXT_A, EXT_B, EXT_C, EXT_D];
    for (i, &owner) in owners.iter().enumerate() {
        let base = 0x100_0000 + (i as u64) * PAGE;
        db.update(
            pa(base),
            pa(base + PAGE - 1),
            owner,
            MemdbType::Extent,
            PART,
            MemdbType::Partition,
        )
        .unwrap();
    }

    for (i, &owner) in owners.iter().enumerate() {
        let base = 0x100_0000 + (i as u64) * PAGE;
        assert_eq!(db.lookup(pa(base)), Ok((owner, MemdbType::Extent)));
    }
    assert_eq!(db.lookup(pa(0x100_4000)), Ok((PART, MemdbType::Partition)));
    pump_rcu();
    set_current_cpu(0);
}

#[test]
fn stale_id_triggers_leaf_duplication() {
    set_current_cpu(17);
    let db = MemDb::new();

    db.insert(pa(0x200_0000), pa(0x203_ffff), PART, MemdbType::Partition)
        .unwrap();

    // Occupy three extra IDs.
    db.update(pa(0x200_0000), pa(0x200_0fff), EXT_A, MemdbType::Extent, PART, MemdbType::Partition)
        .unwrap();
    db.update(pa(0x200_1000), pa(0x200_1fff), EXT_B, MemdbType::Extent, PART, MemdbType::Partition)
        .unwrap();
    db.update(pa(0x200_2000), pa(0x200_2fff), EXT_C, MemdbType::Extent, PART, MemdbType::Partition)
        .unwrap();

    // Retire EXT_A's only page: its ID keeps the stale value with a zero
    // use count.
    db.update(pa(0x200_0000), pa(0x200_0fff), EXT_B, MemdbType::Extent, EXT_A, MemdbType::Extent)
        .unwrap();

    // A fourth distinct owner needs a free ID; the only candidate is the
    // stale one, so the update must go through a duplicated leaf.
    db.update(pa(0x200_3000), pa(0x200_3fff), EXT_D, MemdbType::Extent, PART, MemdbType::Partition)
        .unwrap();

    assert_eq!(db.lookup(pa(0x200_0000)), Ok((EXT_B, MemdbType::Extent)));
    assert_eq!(db.lookup(pa(0x200_1000)), Ok((EXT_B, MemdbType::Extent)));
    assert_eq!(db.lookup(pa(0x200_2000)), Ok((EXT_C, MemdbType::Extent)));
    assert_eq!(db.lookup(pa(0x200_3000)), Ok((EXT_D, MemdbType::Extent)));
    assert_eq!(db.lookup(pa(0x200_4000)), Ok((PART, MemdbType::Partition)));
    pump_rcu();
    set_current_cpu(0);
}

#[test]
fn large_range_spans_levels() {
    set_current_cpu(17);
    let db = MemDb::new();

    // 1 GiB starting at an odd 2 MiB offset: exercises multi-level splits.
    let start = 0x4020_0000;
    let end = start + 0x4000_0000 - 1;
    db.insert(pa(start), pa(end), PART, MemdbType::Partition).unwrap();

    assert_eq!(db.lookup(pa(start)), Ok((PART, MemdbType::Partition)));
    assert_eq!(db.lookup(pa(end)), Ok((PART, MemdbType::Partition)));
    assert_eq!(db.lookup(pa(start + 0x2000_0000)), Ok((PART, MemdbType::Partition)));
    assert_eq!(db.lookup(pa(start - 1)), Err(Error::MemdbEmpty));
    assert_eq!(db.lookup(pa(end + 1)), Err(Error::MemdbEmpty));
    assert!(db.is_ownership_contiguous(pa(start), pa(end), PART, MemdbType::Partition));
    assert!(!db.is_ownership_contiguous(pa(start - PAGE), pa(end), PART, MemdbType::Partition));

    db.remove(pa(start), pa(end), PART, MemdbType::Partition).unwrap();
    assert_eq!(db.lookup(pa(start)), Err(Error::MemdbEmpty));
    pump_rcu();
    set_current_cpu(0);
}

#[test]
fn range_walk_reports_maximal_runs() {
    set_current_cpu(18);
    let db = MemDb::new();

    // Owned: [0x0000, 0x2fff] and [0x4000, 0x4fff]; a hole at 0x3000.
    db.insert(pa(0), pa(0x2fff), EXT_A, MemdbType::Extent).unwrap();
    db.insert(pa(0x3000), pa(0x3fff), EXT_B, MemdbType::Extent).unwrap();
    db.insert(pa(0x4000), pa(0x4fff), EXT_A, MemdbType::Extent).unwrap();

    let mut runs = Vec::new();
    db.range_walk(EXT_A, MemdbType::Extent, pa(0), pa(0xffff), &mut |base, size| {
        runs.push((base.as_u64(), size));
        Ok(())
    })
    .unwrap();
    assert_eq!(runs, vec![(0, 0x3000), (0x4000, 0x1000)]);

    // walk() covers the whole address space.
    let mut total = 0;
    db.walk(EXT_A, MemdbType::Extent, &mut |_base, size| {
        total += size;
        Ok(())
    })
    .unwrap();
    assert_eq!(total, 0x4000);
    pump_rcu();
    set_current_cpu(0);
}

#[test]
fn range_walk_error_stops_early() {
    set_current_cpu(18);
    let db = MemDb::new();
    db.insert(pa(0x8000), pa(0x8fff), EXT_B, MemdbType::Extent).unwrap();
    db.insert(pa(0xa000), pa(0xafff), EXT_B, MemdbType::Extent).unwrap();

    let mut calls = 0;
    let result = db.range_walk(EXT_B, MemdbType::Extent, pa(0), pa(0xffff), &mut |_b, _s| {
        calls += 1;
        Err(Error::Denied)
    });
    assert_eq!(result, Err(Error::Denied));
    assert_eq!(calls, 1);
    set_current_cpu(0);
}

#[test]
fn clear_requires_single_owner() {
    set_current_cpu(19);
    let db = MemDb::new();
    db.insert(pa(0x6000), pa(0x7fff), PART, MemdbType::Partition).unwrap();

    // Mixed ownership over the requested range.
    db.update(pa(0x6000), pa(0x6fff), ALLOC, MemdbType::Allocator, PART, MemdbType::Partition)
        .unwrap();
    assert_eq!(db.clear(pa(0x6000), pa(0x7fff)), Err(Error::MemdbNotOwner));

    assert_eq!(db.clear(pa(0x6000), pa(0x6fff)), Ok(()));
    assert_eq!(db.clear(pa(0x7000), pa(0x7fff)), Ok(()));
    // Clearing an already-empty range succeeds.
    assert_eq!(db.clear(pa(0x6000), pa(0x7fff)), Ok(()));
    pump_rcu();
    set_current_cpu(0);
}
