//! Guest address spaces.
//!
//! An address space owns a stage-2 translation table tagged with a unique
//! VMID, the list of extent mappings targeting it, an optional guest-MMIO
//! range table consulted on stage-2 aborts, and the bookkeeping for VCPU
//! stacks and the shared info page. VMID 0 is reserved at boot; activation
//! claims the configured VMID from a global atomic bitmap and fails with
//! `BUSY` on collision.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use boson_core::addr::{PAGE_SIZE, PhysAddr, VmAddr};
use boson_core::bitmap::AtomicBitmap;
use boson_core::error::{Error, Result};
use boson_core::sync::SpinLock;
use boson_core::util;

use boson_obj::{HypObject, ObjRef, ObjectHeader, ObjectType, Partition};

use crate::gpt::RangeMap;
use crate::pgtable::{Translation, VmPgtable};
use crate::types::{MappingAttrs, PgAccess, VmMemType};

/// Number of VMIDs in the base platform's namespace (8-bit VMIDs; a VMID16
/// platform only changes this constant).
pub const NUM_VMIDS: usize = 256;

/// Guest IPA width accepted for mappings and the info area.
pub const VM_ADDRESS_BITS: u32 = 48;

/// VCPUs attachable to one address space (bounded by the stack map slots).
pub const MAX_THREADS: usize = 32;

/// Guest-MMIO ranges registrable per address space.
pub const MAX_VMMIO_RANGES: usize = 32;

static VMIDS: AtomicBitmap<{ NUM_VMIDS / 64 }> = AtomicBitmap::new();
static VMID_ZERO_RESERVED: AtomicBool = AtomicBool::new(false);

/// Reserves VMID 0 (cold boot; idempotent for host tests).
pub fn init_vmids() {
    if !VMID_ZERO_RESERVED.swap(true, Ordering::AcqRel) {
        let already_set = VMIDS.test_and_set(0);
        assert!(!already_set);
    }
}

/// A merged stage-2 lookup result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrspaceLookup {
    /// Output physical address of the start of the range.
    pub phys: PhysAddr,
    /// Contiguously translated size.
    pub size: u64,
    /// Memory type of the whole range.
    pub memtype: VmMemType,
    /// Guest-kernel access of the whole range.
    pub kernel_access: PgAccess,
    /// Guest-user access of the whole range.
    pub user_access: PgAccess,
}

/// The info area: a basic extent mapped both at a guest IPA and into the
/// hypervisor, used as a fast shared communication page.
pub(crate) struct InfoArea {
    pub(crate) ipa: Option<VmAddr>,
    pub(crate) extent: Option<ObjRef<crate::memextent::MemExtent>>,
}

/// A guest stage-2 translation regime.
pub struct Addrspace {
    header: ObjectHeader,
    /// Configured VMID; claimed globally at activation.
    vmid: Cell<u16>,
    /// Whether this address space currently holds its VMID's bitmap bit.
    vmid_claimed: Cell<bool>,
    /// Read-only address spaces refuse every mapping mutation.
    read_only: Cell<bool>,
    pgtable: SpinLock<VmPgtable>,
    /// Mapping records of extents targeting this address space. Entries are
    /// opaque to the address space; extents own them.
    pub(crate) mapping_list: SpinLock<alloc::vec::Vec<usize>>,
    vmmio: SpinLock<VmmioRanges>,
    /// Stack map slots for attached VCPUs.
    stack_bitmap: AtomicBitmap<1>,
    pub(crate) info_area: SpinLock<InfoArea>,
}

struct VmmioRanges {
    ranges: RangeMap<()>,
    count: usize,
}

impl HypObject for Addrspace {
    const TYPE: ObjectType = ObjectType::Addrspace;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn deactivate(&self) {
        let mut info = self.info_area.lock();
        info.extent = None;
        info.ipa = None;
        drop(info);

        if self.vmid_claimed.get() {
            let was_set = VMIDS.test_and_clear(self.vmid.get() as usize);
            assert!(was_set, "VMID bitmap never set or already cleared");
            self.vmid_claimed.set(false);
            self.vmid.set(0);
        }
    }
}

// SAFETY: The Cells are written only while the object is in Init state
// (configure) or tearing down (deactivate), both single-threaded by the
// lifecycle; everything else is lock- or atomic-protected.
unsafe impl Send for Addrspace {}
unsafe impl Sync for Addrspace {}

impl Addrspace {
    /// Creates an unconfigured address space.
    #[must_use]
    pub fn new(partition: Option<ObjRef<Partition>>) -> ObjRef<Self> {
        init_vmids();
        ObjRef::new(Self {
            header: ObjectHeader::new(ObjectType::Addrspace, partition),
            vmid: Cell::new(0),
            vmid_claimed: Cell::new(false),
            read_only: Cell::new(false),
            pgtable: SpinLock::new(VmPgtable::new(0)),
            mapping_list: SpinLock::new(alloc::vec::Vec::new()),
            vmmio: SpinLock::new(VmmioRanges {
                ranges: RangeMap::new(),
                count: 0,
            }),
            stack_bitmap: AtomicBitmap::new(),
            info_area: SpinLock::new(InfoArea {
                ipa: None,
                extent: None,
            }),
        })
    }

    /// Sets the VMID. Only valid before activation; VMID 0 is reserved.
    pub fn configure(&self, vmid: u16) -> Result<()> {
        assert_eq!(self.header.state(), boson_obj::ObjectState::Init);
        if vmid == 0 || vmid as usize >= NUM_VMIDS {
            return Err(Error::ArgumentInvalid);
        }
        self.vmid.set(vmid);
        Ok(())
    }

    /// Marks the address space read-only (mapping mutations are refused).
    pub fn set_read_only(&self) {
        assert_eq!(self.header.state(), boson_obj::ObjectState::Init);
        self.read_only.set(true);
    }

    /// Returns the VMID.
    #[must_use]
    pub fn vmid(&self) -> u16 {
        self.vmid.get()
    }

    /// Returns whether mapping mutations are refused.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.get()
    }

    /// Claims the VMID and initializes the stage-2 table. Fails with
    /// [`Error::Busy`] if the VMID is already active.
    pub fn activate(&self) -> Result<()> {
        let vmid = self.vmid.get();
        if vmid == 0 {
            return Err(Error::ObjectConfig);
        }
        if VMIDS.test_and_set(vmid as usize) {
            return Err(Error::Busy);
        }
        self.vmid_claimed.set(true);
        *self.pgtable.lock() = VmPgtable::new(vmid);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stage-2 mappings
    // -----------------------------------------------------------------------

    /// Installs a stage-2 mapping.
    pub fn map(
        &self,
        vbase: VmAddr,
        size: u64,
        phys: PhysAddr,
        memtype: VmMemType,
        kernel_access: PgAccess,
        user_access: PgAccess,
    ) -> Result<()> {
        if self.read_only.get() {
            return Err(Error::Denied);
        }
        self.check_range(vbase, size)?;
        let attrs = MappingAttrs {
            memtype,
            kernel_access,
            user_access,
        };
        let mut pgtable = self.pgtable.lock();
        pgtable.start();
        let result = pgtable.map(vbase, size, phys, attrs);
        pgtable.commit();
        result
    }

    /// Removes stage-2 mappings of `[vbase, vbase+size)` whose output still
    /// matches `phys`.
    pub fn unmap(&self, vbase: VmAddr, size: u64, phys: PhysAddr) -> Result<()> {
        if self.read_only.get() {
            return Err(Error::Denied);
        }
        let mut pgtable = self.pgtable.lock();
        pgtable.start();
        let result = pgtable.unmap_matching(vbase, size, phys);
        pgtable.commit();
        result
    }

    /// Looks up the translation of `[vbase, vbase+size)`, merging
    /// physically contiguous pages with identical attributes. The returned
    /// size may be shorter than requested if the mapping changes or ends.
    pub fn lookup(&self, vbase: VmAddr, size: u64) -> Result<AddrspaceLookup> {
        if size == 0 {
            return Err(Error::ArgumentSize);
        }
        if util::add_overflows(vbase.as_u64(), size - 1) {
            return Err(Error::AddrOverflow);
        }
        if !vbase.is_page_aligned() || !util::is_aligned(size, PAGE_SIZE) {
            return Err(Error::ArgumentAlignment);
        }

        let pgtable = self.pgtable.lock();
        let mut merged: Option<AddrspaceLookup> = None;

        let mut offset = 0;
        while offset < size {
            let Some(Translation { phys, attrs }) =
                pgtable.lookup(VmAddr::new(vbase.as_u64() + offset))
            else {
                break;
            };
            match &mut merged {
                None => {
                    merged = Some(AddrspaceLookup {
                        phys,
                        size: PAGE_SIZE,
                        memtype: attrs.memtype,
                        kernel_access: attrs.kernel_access,
                        user_access: attrs.user_access,
                    });
                }
                Some(lookup) => {
                    let contiguous = lookup.phys.as_u64() + lookup.size == phys.as_u64()
                        && lookup.memtype == attrs.memtype
                        && lookup.kernel_access == attrs.kernel_access
                        && lookup.user_access == attrs.user_access;
                    if !contiguous {
                        break;
                    }
                    lookup.size += PAGE_SIZE;
                }
            }
            offset += PAGE_SIZE;
        }

        merged.ok_or(Error::AddrInvalid)
    }

    fn check_range(&self, vbase: VmAddr, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::ArgumentSize);
        }
        if util::add_overflows(vbase.as_u64(), size - 1)
            || vbase.as_u64() + (size - 1) >= util::bit(VM_ADDRESS_BITS)
        {
            return Err(Error::AddrOverflow);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Guest-MMIO ranges
    // -----------------------------------------------------------------------

    /// Registers `[base, base+size)` as guest-MMIO, to be forwarded rather
    /// than faulted on unhandled stage-2 aborts.
    pub fn add_vmmio_range(&self, base: VmAddr, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::ArgumentSize);
        }
        if util::add_overflows(base.as_u64(), size) {
            return Err(Error::AddrOverflow);
        }

        let mut vmmio = self.vmmio.lock();
        if vmmio.count == MAX_VMMIO_RANGES {
            return Err(Error::NoResources);
        }
        vmmio.ranges.insert(base.as_u64(), size, ())?;
        vmmio.count += 1;
        Ok(())
    }

    /// Removes a previously registered guest-MMIO range. The base and size
    /// must match the registration exactly.
    pub fn remove_vmmio_range(&self, base: VmAddr, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::ArgumentSize);
        }
        if util::add_overflows(base.as_u64(), size) {
            return Err(Error::AddrOverflow);
        }

        let mut vmmio = self.vmmio.lock();
        vmmio.ranges.remove(base.as_u64(), size, &())?;
        debug_assert!(vmmio.count > 0);
        vmmio.count -= 1;
        Ok(())
    }

    /// Returns `true` if `addr` falls in a registered guest-MMIO range.
    #[must_use]
    pub fn is_vmmio_addr(&self, addr: VmAddr) -> bool {
        self.vmmio.lock().ranges.lookup(addr.as_u64()).is_some()
    }

    // -----------------------------------------------------------------------
    // VCPU stack slots and the info area
    // -----------------------------------------------------------------------

    /// Claims a stack map slot for an attaching VCPU.
    pub fn allocate_stack_index(&self) -> Result<usize> {
        loop {
            let Some(index) = self.stack_bitmap.first_clear(MAX_THREADS) else {
                return Err(Error::NoMem);
            };
            if !self.stack_bitmap.test_and_set(index) {
                return Ok(index);
            }
        }
    }

    /// Releases a stack map slot on detach.
    pub fn free_stack_index(&self, index: usize) {
        let was_set = self.stack_bitmap.test_and_clear(index);
        debug_assert!(was_set);
    }

    /// Configures the info area: a basic RW extent of suitable size to be
    /// mapped at `ipa` and into the hypervisor at activation.
    pub fn configure_info_area(
        &self,
        extent: &ObjRef<crate::memextent::MemExtent>,
        ipa: VmAddr,
    ) -> Result<()> {
        assert_eq!(self.header.state(), boson_obj::ObjectState::Init);

        let size = extent.size();
        assert!(size != 0);

        if !ipa.is_page_aligned()
            || util::add_overflows(ipa.as_u64(), size)
            || ipa.as_u64() + size > util::bit(VM_ADDRESS_BITS)
        {
            return Err(Error::AddrInvalid);
        }

        if !extent.is_basic()
            || !extent.access().allows(PgAccess::RW)
            || extent.memtype() != crate::types::MemType::Any
        {
            return Err(Error::ArgumentInvalid);
        }

        let mut info = self.info_area.lock();
        info.ipa = Some(ipa);
        info.extent = Some(extent.clone());
        Ok(())
    }

    /// Returns the configured info-area IPA, if any.
    #[must_use]
    pub fn info_area_ipa(&self) -> Option<VmAddr> {
        self.info_area.lock().ipa
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boson_core::cpulocal::set_current_cpu;
    use boson_obj::ObjectState;

    fn active_addrspace(vmid: u16) -> ObjRef<Addrspace> {
        let asp = Addrspace::new(None);
        asp.configure(vmid).unwrap();
        asp.activate().unwrap();
        asp.header().set_state(ObjectState::Active);
        asp
    }

    #[test]
    fn vmid_claims_are_exclusive() {
        set_current_cpu(25);
        let a = active_addrspace(41);
        let b = Addrspace::new(None);
        b.configure(41).unwrap();
        assert_eq!(b.activate(), Err(Error::Busy));

        // Deactivation releases the VMID for reuse.
        drop(a);
        assert_eq!(b.activate(), Ok(()));

        // VMID 0 and out-of-range VMIDs are rejected at configure.
        let c = Addrspace::new(None);
        assert_eq!(c.configure(0), Err(Error::ArgumentInvalid));
        set_current_cpu(0);
    }

    #[test]
    fn map_lookup_merges_contiguous_pages() {
        set_current_cpu(25);
        let asp = active_addrspace(42);
        asp.map(
            VmAddr::new(0x10000),
            0x3000,
            PhysAddr::new(0x40000),
            VmMemType::NormalWB,
            PgAccess::RW,
            PgAccess::RW,
        )
        .unwrap();

        let lookup = asp.lookup(VmAddr::new(0x10000), 0x3000).unwrap();
        assert_eq!(lookup.phys, PhysAddr::new(0x40000));
        assert_eq!(lookup.size, 0x3000);
        assert_eq!(lookup.kernel_access, PgAccess::RW);

        // A hole truncates the merged result.
        asp.unmap(VmAddr::new(0x11000), 0x1000, PhysAddr::new(0x41000))
            .unwrap();
        let lookup = asp.lookup(VmAddr::new(0x10000), 0x3000).unwrap();
        assert_eq!(lookup.size, 0x1000);
        assert_eq!(
            asp.lookup(VmAddr::new(0x11000), 0x1000).unwrap_err(),
            Error::AddrInvalid
        );
        set_current_cpu(0);
    }

    #[test]
    fn read_only_refuses_mutations() {
        set_current_cpu(25);
        let asp = Addrspace::new(None);
        asp.configure(43).unwrap();
        asp.set_read_only();
        asp.activate().unwrap();
        assert_eq!(
            asp.map(
                VmAddr::new(0),
                PAGE_SIZE,
                PhysAddr::new(0),
                VmMemType::NormalWB,
                PgAccess::R,
                PgAccess::R,
            ),
            Err(Error::Denied)
        );
        assert_eq!(
            asp.unmap(VmAddr::new(0), PAGE_SIZE, PhysAddr::new(0)),
            Err(Error::Denied)
        );
        set_current_cpu(0);
    }

    #[test]
    fn vmmio_ranges_register_and_resolve() {
        set_current_cpu(26);
        let asp = active_addrspace(44);
        asp.add_vmmio_range(VmAddr::new(0x1000_0000), 0x1000).unwrap();
        assert!(asp.is_vmmio_addr(VmAddr::new(0x1000_0abc)));
        assert!(!asp.is_vmmio_addr(VmAddr::new(0x1000_1000)));

        // Exact-match removal only.
        assert_eq!(
            asp.remove_vmmio_range(VmAddr::new(0x1000_0000), 0x2000),
            Err(Error::ArgumentInvalid)
        );
        asp.remove_vmmio_range(VmAddr::new(0x1000_0000), 0x1000).unwrap();
        assert!(!asp.is_vmmio_addr(VmAddr::new(0x1000_0abc)));
        set_current_cpu(0);
    }

    #[test]
    fn stack_slots_are_bounded() {
        set_current_cpu(26);
        let asp = active_addrspace(45);
        let mut slots: Vec<_> = (0..MAX_THREADS)
            .map(|_| asp.allocate_stack_index().unwrap())
            .collect();
        slots.sort_unstable();
        assert_eq!(slots, (0..MAX_THREADS).collect::<Vec<_>>());
        assert_eq!(asp.allocate_stack_index(), Err(Error::NoMem));
        asp.free_stack_index(7);
        assert_eq!(asp.allocate_stack_index(), Ok(7));
        set_current_cpu(0);
    }
}
