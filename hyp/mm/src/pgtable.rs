//! Software-walked stage-2 translation tables.
//!
//! A four-level radix over 48-bit intermediate physical addresses with a
//! 4 KiB granule. The walker structure is shared between the kernel target
//! and host tests; only the commit barrier differs. Mutations are bracketed
//! by [`VmPgtable::start`] / [`VmPgtable::commit`]: commit orders the last
//! table write before any dependent access with a DSB and broadcasts a
//! TLB invalidate for the VMID on kernel targets, and is a no-op on the
//! host.

use alloc::boxed::Box;

use boson_core::addr::{PAGE_BITS, PAGE_SIZE, PhysAddr, VmAddr};
use boson_core::error::{Error, Result};
use boson_core::util;

use crate::types::MappingAttrs;

/// Bits resolved per level.
const LEVEL_BITS: u32 = 9;
/// Entries per level.
const LEVEL_ENTRIES: usize = 1 << LEVEL_BITS;
/// Total IPA width.
const IPA_BITS: u32 = 48;
/// Number of levels (48 = 12 + 4 * 9).
const NUM_LEVELS: u32 = (IPA_BITS - PAGE_BITS) / LEVEL_BITS;

/// One translation: a page's output address and attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Output physical address of the page.
    pub phys: PhysAddr,
    /// Mapping attributes.
    pub attrs: MappingAttrs,
}

enum Entry {
    Empty,
    Table(Box<Level>),
    Page(Translation),
}

struct Level {
    entries: [Entry; LEVEL_ENTRIES],
}

impl Level {
    fn new() -> Box<Self> {
        Box::new(Self {
            entries: core::array::from_fn(|_| Entry::Empty),
        })
    }

    fn index(vbase: u64, level: u32) -> usize {
        let shift = PAGE_BITS + (NUM_LEVELS - 1 - level) * LEVEL_BITS;
        ((vbase >> shift) & util::mask(LEVEL_BITS)) as usize
    }

    fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| matches!(e, Entry::Empty))
    }
}

/// A per-VM stage-2 translation table.
pub struct VmPgtable {
    vmid: u16,
    root: Box<Level>,
}

impl VmPgtable {
    /// Creates an empty table tagged with `vmid`.
    #[must_use]
    pub fn new(vmid: u16) -> Self {
        Self {
            vmid,
            root: Level::new(),
        }
    }

    /// Returns the VMID this table is tagged with.
    #[must_use]
    pub fn vmid(&self) -> u16 {
        self.vmid
    }

    /// Begins a mutation batch.
    pub fn start(&mut self) {}

    /// Commits a mutation batch: orders the table writes before any
    /// dependent access and invalidates this VMID's cached translations on
    /// all CPUs.
    pub fn commit(&mut self) {
        #[cfg(all(target_os = "none", target_arch = "aarch64"))]
        // SAFETY: Barrier and broadcast invalidate; no memory operands.
        unsafe {
            core::arch::asm!(
                "dsb ish",
                "tlbi vmalls12e1is",
                "dsb ish",
                "isb",
                options(nostack),
            );
        }
    }

    fn walk_mut(&mut self, vbase: u64, create: bool) -> Option<&mut Entry> {
        let mut level = &mut self.root;
        for depth in 0..NUM_LEVELS - 1 {
            let index = Level::index(vbase, depth);
            if matches!(level.entries[index], Entry::Empty) {
                if !create {
                    return None;
                }
                level.entries[index] = Entry::Table(Level::new());
            }
            match &mut level.entries[index] {
                Entry::Table(next) => level = next,
                // Page entries never appear at intermediate levels.
                _ => return None,
            }
        }
        Some(&mut level.entries[Level::index(vbase, NUM_LEVELS - 1)])
    }

    /// Maps `[vbase, vbase + size)` to `[phys, phys + size)` with `attrs`.
    ///
    /// The caller is expected to know whether it is overwriting an existing
    /// mapping; overwrites are applied silently.
    pub fn map(
        &mut self,
        vbase: VmAddr,
        size: u64,
        phys: PhysAddr,
        attrs: MappingAttrs,
    ) -> Result<()> {
        check_range(vbase, size)?;
        if !phys.is_page_aligned() {
            return Err(Error::ArgumentAlignment);
        }

        let mut offset = 0;
        while offset < size {
            let entry = self
                .walk_mut(vbase.as_u64() + offset, true)
                .ok_or(Error::NoMem)?;
            *entry = Entry::Page(Translation {
                phys: PhysAddr::new(phys.as_u64() + offset),
                attrs,
            });
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    /// Unmaps pages of `[vbase, vbase + size)` whose output address matches
    /// the corresponding page of `phys`. Non-matching and absent pages are
    /// left untouched.
    pub fn unmap_matching(&mut self, vbase: VmAddr, size: u64, phys: PhysAddr) -> Result<()> {
        check_range(vbase, size)?;

        let mut offset = 0;
        while offset < size {
            if let Some(entry) = self.walk_mut(vbase.as_u64() + offset, false) {
                if let Entry::Page(translation) = entry {
                    if translation.phys.as_u64() == phys.as_u64() + offset {
                        *entry = Entry::Empty;
                    }
                }
            }
            offset += PAGE_SIZE;
        }
        self.prune();
        Ok(())
    }

    /// Looks up the translation of the page containing `vbase`.
    #[must_use]
    pub fn lookup(&self, vbase: VmAddr) -> Option<Translation> {
        let mut level = &self.root;
        for depth in 0..NUM_LEVELS - 1 {
            match &level.entries[Level::index(vbase.as_u64(), depth)] {
                Entry::Table(next) => level = next,
                _ => return None,
            }
        }
        match &level.entries[Level::index(vbase.as_u64(), NUM_LEVELS - 1)] {
            Entry::Page(translation) => Some(*translation),
            _ => None,
        }
    }

    /// Frees intermediate levels that became empty.
    fn prune(&mut self) {
        fn prune_level(level: &mut Level, depth: u32) {
            if depth >= NUM_LEVELS - 1 {
                return;
            }
            for entry in &mut level.entries {
                if let Entry::Table(next) = entry {
                    prune_level(next, depth + 1);
                    if next.is_empty() {
                        *entry = Entry::Empty;
                    }
                }
            }
        }
        prune_level(&mut self.root, 0);
    }
}

fn check_range(vbase: VmAddr, size: u64) -> Result<()> {
    if size == 0 {
        return Err(Error::ArgumentSize);
    }
    if !vbase.is_page_aligned() || !util::is_aligned(size, PAGE_SIZE) {
        return Err(Error::ArgumentAlignment);
    }
    if util::add_overflows(vbase.as_u64(), size - 1) || vbase.as_u64() + size > util::bit(IPA_BITS)
    {
        return Err(Error::AddrOverflow);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PgAccess, VmMemType};

    fn attrs(access: PgAccess) -> MappingAttrs {
        MappingAttrs {
            memtype: VmMemType::NormalWB,
            kernel_access: access,
            user_access: access,
        }
    }

    #[test]
    fn map_lookup_unmap() {
        let mut pt = VmPgtable::new(3);
        pt.start();
        pt.map(
            VmAddr::new(0x10000),
            0x3000,
            PhysAddr::new(0x8000),
            attrs(PgAccess::RW),
        )
        .unwrap();
        pt.commit();

        let t = pt.lookup(VmAddr::new(0x11000)).unwrap();
        assert_eq!(t.phys, PhysAddr::new(0x9000));
        assert_eq!(t.attrs.kernel_access, PgAccess::RW);
        assert!(pt.lookup(VmAddr::new(0x13000)).is_none());

        pt.start();
        pt.unmap_matching(VmAddr::new(0x10000), 0x3000, PhysAddr::new(0x8000))
            .unwrap();
        pt.commit();
        assert!(pt.lookup(VmAddr::new(0x10000)).is_none());
        assert!(pt.lookup(VmAddr::new(0x11000)).is_none());
    }

    #[test]
    fn unmap_matching_skips_foreign_pages() {
        let mut pt = VmPgtable::new(3);
        pt.map(VmAddr::new(0x0), PAGE_SIZE, PhysAddr::new(0x5000), attrs(PgAccess::R))
            .unwrap();
        // Expecting a different physical page: nothing is removed.
        pt.unmap_matching(VmAddr::new(0x0), PAGE_SIZE, PhysAddr::new(0x6000))
            .unwrap();
        assert!(pt.lookup(VmAddr::new(0x0)).is_some());
    }

    #[test]
    fn rejects_bad_ranges() {
        let mut pt = VmPgtable::new(1);
        let a = attrs(PgAccess::R);
        assert_eq!(
            pt.map(VmAddr::new(0x10), PAGE_SIZE, PhysAddr::new(0), a),
            Err(Error::ArgumentAlignment)
        );
        assert_eq!(
            pt.map(VmAddr::new(0), 0, PhysAddr::new(0), a),
            Err(Error::ArgumentSize)
        );
        assert_eq!(
            pt.map(VmAddr::new(util::bit(IPA_BITS) - PAGE_SIZE), 2 * PAGE_SIZE, PhysAddr::new(0), a),
            Err(Error::AddrOverflow)
        );
    }

    #[test]
    fn distant_mappings_share_nothing() {
        let mut pt = VmPgtable::new(7);
        let a = attrs(PgAccess::RWX);
        pt.map(VmAddr::new(0x0000_1000), PAGE_SIZE, PhysAddr::new(0x1000), a)
            .unwrap();
        pt.map(VmAddr::new(0x7fff_ffff_f000), PAGE_SIZE, PhysAddr::new(0x2000), a)
            .unwrap();
        assert_eq!(
            pt.lookup(VmAddr::new(0x7fff_ffff_f000)).unwrap().phys,
            PhysAddr::new(0x2000)
        );
        assert_eq!(pt.lookup(VmAddr::new(0x1000)).unwrap().phys, PhysAddr::new(0x1000));
    }
}
