//! Memory extents.
//!
//! An extent is a physically contiguous region owned by a partition or
//! carved out of a parent extent, together with the set of guest mappings
//! it maintains. *Basic* extents keep a small fixed array of whole-extent
//! mappings; *sparse* extents track per-range mappings in a range table and
//! support donation, so ownership of their pages can move page-granularly
//! between parent and children or between siblings.
//!
//! Activation is the point where an extent takes its memory: device extents
//! insert fresh ownership into the memory database, normal basic extents
//! transfer it from the owning partition (or parent extent), and sparse
//! extents defer the transfer to explicit donate calls. An activation that
//! loses the ownership transfer to a not-yet-reclaimed predecessor retries
//! once after a grace period.
//!
//! Mapping back-references to address spaces are weak: an atomic pointer
//! revalidated with a safe-get before use, so a dying address space never
//! keeps an extent alive or vice versa.

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use boson_core::addr::{PAGE_SIZE, PhysAddr, VmAddr};
use boson_core::error::{Error, Result};
use boson_core::sync::SpinLock;
use boson_core::util;
use boson_memdb::MemdbType;
use boson_obj::{HypObject, ObjRef, ObjectHeader, ObjectType, Partition};

use crate::addrspace::Addrspace;
use crate::gpt::RangeMap;
use crate::types::{MappingAttrs, MemType, PgAccess, check_memtype, validate_extent_memtype};
use crate::{basic, sparse};

/// Mapping slots per extent.
pub const MAX_MAPS: usize = 4;

/// Extent kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentType {
    /// Whole-extent mappings in a fixed slot array.
    Basic,
    /// Per-range mappings; supports donation.
    Sparse,
}

/// Creation-time attributes.
#[derive(Debug, Clone, Copy)]
pub struct ExtentAttrs {
    /// Extent kind.
    pub xtype: ExtentType,
    /// Memory-type class constraining mappings.
    pub memtype: MemType,
    /// Maximum access grantable by mappings.
    pub access: PgAccess,
}

/// One whole-extent mapping slot of a basic extent.
///
/// The address-space pointer is a weak back-reference maintained with
/// atomics; the remaining fields are guarded by the extent lock.
pub(crate) struct BasicMapping {
    pub(crate) addrspace: AtomicPtr<Addrspace>,
    pub(crate) vbase: Cell<u64>,
    pub(crate) attrs: Cell<MappingAttrs>,
    pub(crate) retained: Cell<bool>,
}

impl BasicMapping {
    const fn new() -> Self {
        Self {
            addrspace: AtomicPtr::new(core::ptr::null_mut()),
            vbase: Cell::new(0),
            attrs: Cell::new(MappingAttrs {
                memtype: crate::types::VmMemType::NormalWB,
                kernel_access: PgAccess::empty(),
                user_access: PgAccess::empty(),
            }),
            retained: Cell::new(false),
        }
    }
}

/// One per-addrspace mapping slot of a sparse extent: a range table keyed
/// by physical address holding `(vbase, attrs)` per mapped piece.
pub(crate) struct SparseMapping {
    pub(crate) addrspace: AtomicPtr<Addrspace>,
    pub(crate) gpt: RefCell<RangeMap<(u64, MappingAttrs)>>,
}

impl SparseMapping {
    fn new() -> Self {
        Self {
            addrspace: AtomicPtr::new(core::ptr::null_mut()),
            gpt: RefCell::new(RangeMap::new()),
        }
    }
}

/// Configuration and structural state guarded by the extent lock.
pub(crate) struct Inner {
    pub(crate) configured: bool,
    pub(crate) phys_base: u64,
    pub(crate) size: u64,
    pub(crate) xtype: ExtentType,
    pub(crate) memtype: MemType,
    pub(crate) access: PgAccess,
    pub(crate) parent: Option<ObjRef<MemExtent>>,
    /// Non-owning child links; a child owns a reference to its parent.
    pub(crate) children: alloc::vec::Vec<*const MemExtent>,
    /// Hypervisor attachment, if any: `(hyp_va, size)`.
    pub(crate) attached: Option<(usize, u64)>,
}

/// A donatable, mappable region of physical memory.
pub struct MemExtent {
    header: ObjectHeader,
    device_mem: bool,
    active: AtomicBool,
    pub(crate) inner: SpinLock<Inner>,
    pub(crate) basic_maps: [BasicMapping; MAX_MAPS],
    pub(crate) sparse_maps: [SparseMapping; MAX_MAPS],
}

// SAFETY: Cells and RefCells in the mapping slots are only mutated under
// the extent lock; the weak address-space pointers are atomic.
unsafe impl Send for MemExtent {}
unsafe impl Sync for MemExtent {}

impl HypObject for MemExtent {
    const TYPE: ObjectType = ObjectType::Memextent;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn deactivate(&self) {
        if !self.active.load(Ordering::Acquire) {
            // Never activated: no ownership or mappings were taken.
            return;
        }

        match self.extent_type() {
            ExtentType::Basic => basic::deactivate(self),
            ExtentType::Sparse => sparse::deactivate(self),
        }
        self.cleanup();
    }
}

impl MemExtent {
    /// Creates an unconfigured extent. `device_mem` marks regions whose
    /// ownership is inserted fresh rather than transferred from a
    /// partition.
    #[must_use]
    pub fn new(partition: Option<ObjRef<Partition>>, device_mem: bool) -> ObjRef<Self> {
        ObjRef::new(Self {
            header: ObjectHeader::new(ObjectType::Memextent, partition),
            device_mem,
            active: AtomicBool::new(false),
            inner: SpinLock::new(Inner {
                configured: false,
                phys_base: 0,
                size: 0,
                xtype: ExtentType::Basic,
                memtype: MemType::Any,
                access: PgAccess::empty(),
                parent: None,
                children: alloc::vec::Vec::new(),
                attached: None,
            }),
            basic_maps: [const { BasicMapping::new() }; MAX_MAPS],
            sparse_maps: core::array::from_fn(|_| SparseMapping::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Returns the physical base address.
    #[must_use]
    pub fn phys_base(&self) -> PhysAddr {
        PhysAddr::new(self.inner.lock().phys_base)
    }

    /// Returns the extent size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Returns the extent kind.
    #[must_use]
    pub fn extent_type(&self) -> ExtentType {
        self.inner.lock().xtype
    }

    /// Returns `true` for basic extents.
    #[must_use]
    pub fn is_basic(&self) -> bool {
        self.extent_type() == ExtentType::Basic
    }

    /// Returns the memory-type class.
    #[must_use]
    pub fn memtype(&self) -> MemType {
        self.inner.lock().memtype
    }

    /// Returns the maximum grantable access.
    #[must_use]
    pub fn access(&self) -> PgAccess {
        self.inner.lock().access
    }

    /// Returns whether activation has completed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Returns whether this extent's memory was device-inserted.
    #[must_use]
    pub fn is_device_mem(&self) -> bool {
        self.device_mem
    }

    /// Returns the extent's memdb identity.
    pub(crate) fn memdb_id(&self) -> usize {
        core::ptr::from_ref(self) as usize
    }

    pub(crate) fn range_valid(inner: &Inner, phys: u64, size: u64) -> bool {
        debug_assert!(!util::add_overflows(phys, size - 1));
        inner.phys_base <= phys
            && inner.phys_base + (inner.size - 1) >= phys + (size - 1)
    }

    fn validate_attrs(attrs: ExtentAttrs) -> Result<()> {
        validate_extent_memtype(attrs.memtype)?;
        if attrs.access.is_empty() {
            return Err(Error::ArgumentInvalid);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Configure
    // -----------------------------------------------------------------------

    /// Configures a root extent covering `[phys_base, phys_base + size)`.
    pub fn configure(&self, phys_base: PhysAddr, size: u64, attrs: ExtentAttrs) -> Result<()> {
        assert_eq!(self.header.state(), boson_obj::ObjectState::Init);

        // The range must not wrap the end of the address space.
        if size == 0 || util::add_overflows(phys_base.as_u64(), size - 1) {
            return Err(Error::ArgumentInvalid);
        }
        if !phys_base.is_page_aligned() || !util::is_aligned(size, PAGE_SIZE) {
            return Err(Error::ArgumentAlignment);
        }
        Self::validate_attrs(attrs)?;

        let mut inner = self.inner.lock();
        inner.configured = true;
        inner.phys_base = phys_base.as_u64();
        inner.size = size;
        inner.xtype = attrs.xtype;
        inner.memtype = attrs.memtype;
        inner.access = attrs.access;
        inner.parent = None;
        Ok(())
    }

    /// Configures this extent as a child of `parent`, covering
    /// `[parent.base + offset, + size)`.
    ///
    /// The child's access must be a subset of the parent's and its memory
    /// type must be compatible.
    pub fn configure_derive(
        &self,
        parent: &ObjRef<MemExtent>,
        offset: u64,
        size: u64,
        attrs: ExtentAttrs,
    ) -> Result<()> {
        assert_eq!(self.header.state(), boson_obj::ObjectState::Init);

        let parent_inner = parent.inner.lock();

        if size == 0 || util::add_overflows(offset, size - 1) {
            return Err(Error::ArgumentInvalid);
        }
        if util::add_overflows(parent_inner.phys_base, offset)
            || offset >= parent_inner.size
            || offset + size > parent_inner.size
        {
            return Err(Error::AddrInvalid);
        }
        if !util::is_aligned(offset, PAGE_SIZE) || !util::is_aligned(size, PAGE_SIZE) {
            return Err(Error::ArgumentAlignment);
        }
        Self::validate_attrs(attrs)?;

        if !parent_inner.access.allows(attrs.access) {
            return Err(Error::ArgumentInvalid);
        }
        if parent_inner.memtype != MemType::Any && parent_inner.memtype != attrs.memtype {
            return Err(Error::ArgumentInvalid);
        }

        let phys_base = parent_inner.phys_base + offset;
        drop(parent_inner);

        let mut inner = self.inner.lock();
        inner.configured = true;
        inner.phys_base = phys_base;
        inner.size = size;
        inner.xtype = attrs.xtype;
        inner.memtype = attrs.memtype;
        inner.access = attrs.access;
        inner.parent = Some(parent.clone());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Activate
    // -----------------------------------------------------------------------

    /// Takes ownership of the extent's memory (unless deferred to donation)
    /// and installs the extent under its parent.
    pub fn activate(self_ref: &ObjRef<MemExtent>) -> Result<()> {
        let me = &**self_ref;
        let (configured, size, memtype, access, xtype, parent) = {
            let inner = me.inner.lock();
            (
                inner.configured,
                inner.size,
                inner.memtype,
                inner.access,
                inner.xtype,
                inner.parent.clone(),
            )
        };
        if !configured || size == 0 {
            return Err(Error::ObjectConfig);
        }

        if let Some(parent) = &parent {
            assert!(!me.device_mem);

            // Re-check memtype compatibility: the parent may have been
            // reconfigured between derive and activate.
            let parent_memtype = parent.memtype();
            match parent_memtype {
                MemType::Any => {}
                _ if parent_memtype == memtype => {}
                _ => return Err(Error::ObjectConfig),
            }
            debug_assert!(parent.access().allows(access));
        }

        match xtype {
            ExtentType::Basic => basic::activate(self_ref)?,
            ExtentType::Sparse => sparse::activate(self_ref)?,
        }

        me.active.store(true, Ordering::Release);
        Ok(())
    }

    /// Final teardown: returns memory-database ownership to the parent (or
    /// the owning partition) and unlinks from the parent's children list.
    fn cleanup(&self) {
        let inner = self.inner.lock();
        let (new_owner, new_type) = match &inner.parent {
            Some(parent) => (parent.memdb_id(), MemdbType::Extent),
            None => {
                let partition = self
                    .header
                    .partition()
                    .cloned()
                    .unwrap_or_else(boson_obj::partition::private);
                (partition.as_ptr() as usize, MemdbType::Partition)
            }
        };
        let phys_base = inner.phys_base;
        let size = inner.size;
        let parent = inner.parent.clone();
        drop(inner);

        // Walk the ranges this extent still owns and hand each back.
        let memdb = boson_memdb::global();
        let mut ranges = alloc::vec::Vec::new();
        let _ = memdb.range_walk(
            self.memdb_id(),
            MemdbType::Extent,
            PhysAddr::new(phys_base),
            PhysAddr::new(phys_base + size - 1),
            &mut |base, len| {
                ranges.push((base, len));
                Ok(())
            },
        );
        for (base, len) in ranges {
            let end = PhysAddr::new(base.as_u64() + len - 1);
            if self.device_mem && parent.is_none() {
                memdb
                    .remove(base, end, self.memdb_id(), MemdbType::Extent)
                    .expect("memdb cleanup failed");
            } else {
                memdb
                    .update(base, end, new_owner, new_type, self.memdb_id(), MemdbType::Extent)
                    .expect("memdb cleanup failed");
            }
        }

        if let Some(parent) = parent {
            let mut parent_inner = parent.inner.lock();
            let me_ptr = core::ptr::from_ref(self);
            parent_inner.children.retain(|&c| !core::ptr::eq(c, me_ptr));
        }
    }

    /// Returns whether this extent supports incoming/outgoing donation.
    #[must_use]
    pub fn supports_donation(&self) -> bool {
        self.extent_type() == ExtentType::Sparse
    }

    // -----------------------------------------------------------------------
    // Mapping operations (dispatch)
    // -----------------------------------------------------------------------

    fn check_map_attrs(&self, attrs: MappingAttrs) -> Result<()> {
        let inner = self.inner.lock();
        if !inner.access.allows(attrs.user_access) || !inner.access.allows(attrs.kernel_access) {
            return Err(Error::ArgumentInvalid);
        }
        if !check_memtype(inner.memtype, attrs.memtype) {
            return Err(Error::ArgumentInvalid);
        }
        Ok(())
    }

    /// Maps the whole extent into `addrspace` at `vm_base`.
    pub fn map(
        &self,
        addrspace: &ObjRef<Addrspace>,
        vm_base: VmAddr,
        attrs: MappingAttrs,
    ) -> Result<()> {
        if !vm_base.is_page_aligned() {
            return Err(Error::ArgumentAlignment);
        }
        self.check_map_attrs(attrs)?;
        if addrspace.is_read_only() {
            return Err(Error::Denied);
        }
        match self.extent_type() {
            ExtentType::Basic => basic::map(self, addrspace, vm_base, attrs),
            ExtentType::Sparse => {
                let size = self.size();
                sparse::map_partial(self, addrspace, vm_base, 0, size, attrs)
            }
        }
    }

    /// Maps `[offset, offset + size)` of the extent at `vm_base`.
    pub fn map_partial(
        &self,
        addrspace: &ObjRef<Addrspace>,
        vm_base: VmAddr,
        offset: u64,
        size: u64,
        attrs: MappingAttrs,
    ) -> Result<()> {
        self.check_partial_args(vm_base, offset, size)?;
        self.check_map_attrs(attrs)?;
        if addrspace.is_read_only() {
            return Err(Error::Denied);
        }
        match self.extent_type() {
            // Basic extents only track whole-extent mappings.
            ExtentType::Basic => Err(Error::Unimplemented),
            ExtentType::Sparse => sparse::map_partial(self, addrspace, vm_base, offset, size, attrs),
        }
    }

    /// Removes the whole-extent mapping at `vm_base`.
    pub fn unmap(&self, addrspace: &ObjRef<Addrspace>, vm_base: VmAddr) -> Result<()> {
        if !vm_base.is_page_aligned() {
            return Err(Error::ArgumentAlignment);
        }
        if addrspace.is_read_only() {
            return Err(Error::Denied);
        }
        match self.extent_type() {
            ExtentType::Basic => basic::unmap(self, addrspace, vm_base),
            ExtentType::Sparse => {
                let size = self.size();
                sparse::unmap_partial(self, addrspace, vm_base, 0, size)
            }
        }
    }

    /// Removes the mapping of `[offset, offset + size)` at `vm_base`.
    pub fn unmap_partial(
        &self,
        addrspace: &ObjRef<Addrspace>,
        vm_base: VmAddr,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        self.check_partial_args(vm_base, offset, size)?;
        if addrspace.is_read_only() {
            return Err(Error::Denied);
        }
        match self.extent_type() {
            ExtentType::Basic => Err(Error::Unimplemented),
            ExtentType::Sparse => sparse::unmap_partial(self, addrspace, vm_base, offset, size),
        }
    }

    /// Removes every mapping of the extent, in every address space.
    pub fn unmap_all(&self) {
        let handled = match self.extent_type() {
            ExtentType::Basic => basic::unmap_all(self),
            ExtentType::Sparse => sparse::unmap_all(self),
        };
        assert!(handled, "invalid memory extent unmap all");
    }

    /// Changes the access of the mapping at `vm_base`.
    pub fn update_access(
        &self,
        addrspace: &ObjRef<Addrspace>,
        vm_base: VmAddr,
        kernel_access: PgAccess,
        user_access: PgAccess,
    ) -> Result<()> {
        {
            let inner = self.inner.lock();
            if !inner.access.allows(kernel_access) || !inner.access.allows(user_access) {
                return Err(Error::ArgumentInvalid);
            }
        }
        if !vm_base.is_page_aligned() {
            return Err(Error::ArgumentAlignment);
        }
        if addrspace.is_read_only() {
            return Err(Error::Denied);
        }
        match self.extent_type() {
            ExtentType::Basic => basic::update_access(self, addrspace, vm_base, kernel_access, user_access),
            ExtentType::Sparse => {
                sparse::update_access(self, addrspace, vm_base, kernel_access, user_access)
            }
        }
    }

    /// Changes the access of `[offset, offset + size)` of the mapping at
    /// `vm_base`. Only sparse extents track sub-extent attribute ranges.
    pub fn update_access_partial(
        &self,
        addrspace: &ObjRef<Addrspace>,
        vm_base: VmAddr,
        offset: u64,
        size: u64,
        kernel_access: PgAccess,
        user_access: PgAccess,
    ) -> Result<()> {
        {
            let inner = self.inner.lock();
            if !inner.access.allows(kernel_access) || !inner.access.allows(user_access) {
                return Err(Error::ArgumentInvalid);
            }
        }
        self.check_partial_args(vm_base, offset, size)?;
        if addrspace.is_read_only() {
            return Err(Error::Denied);
        }
        match self.extent_type() {
            ExtentType::Basic => Err(Error::Unimplemented),
            ExtentType::Sparse => sparse::update_access_partial(
                self,
                addrspace,
                vm_base,
                offset,
                size,
                kernel_access,
                user_access,
            ),
        }
    }

    /// Returns whether the extent is mapped in `addrspace`; with
    /// `exclusive`, whether it is mapped there and nowhere else.
    #[must_use]
    pub fn is_mapped(&self, addrspace: &ObjRef<Addrspace>, exclusive: bool) -> bool {
        match self.extent_type() {
            ExtentType::Basic => basic::is_mapped(self, addrspace, exclusive),
            ExtentType::Sparse => sparse::is_mapped(self, addrspace, exclusive),
        }
    }

    fn check_partial_args(&self, vm_base: VmAddr, offset: u64, size: u64) -> Result<()> {
        if !vm_base.is_page_aligned()
            || !util::is_aligned(offset, PAGE_SIZE)
            || !util::is_aligned(size, PAGE_SIZE)
        {
            return Err(Error::ArgumentAlignment);
        }
        if size == 0
            || util::add_overflows(offset, size - 1)
            || util::add_overflows(vm_base.as_u64(), size - 1)
        {
            return Err(Error::ArgumentSize);
        }
        if offset + (size - 1) >= self.size() {
            return Err(Error::ArgumentSize);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Donation
    // -----------------------------------------------------------------------

    /// Donates `[offset, offset + size)` from this extent's parent (or its
    /// owning partition) to this extent, or back when `reverse`.
    pub fn donate_child(&self, offset: u64, size: u64, reverse: bool) -> Result<()> {
        if !util::is_aligned(offset, PAGE_SIZE) || !util::is_aligned(size, PAGE_SIZE) {
            return Err(Error::ArgumentAlignment);
        }
        let inner = self.inner.lock();
        if util::add_overflows(inner.phys_base, offset) {
            return Err(Error::ArgumentInvalid);
        }
        let phys = inner.phys_base + offset;
        if size == 0 || util::add_overflows(phys, size - 1) {
            return Err(Error::ArgumentSize);
        }
        if !Self::range_valid(&inner, phys, size) {
            return Err(Error::ArgumentInvalid);
        }
        drop(inner);

        if self.extent_type() != ExtentType::Sparse {
            return Err(Error::Unimplemented);
        }
        sparse::donate_child(self, PhysAddr::new(phys), size, reverse)
    }

    /// Donates `[from.base + offset, + size)` from `from` to `to`; both
    /// must share the same parent and `to` must be sparse.
    pub fn donate_sibling(from: &MemExtent, to: &MemExtent, offset: u64, size: u64) -> Result<()> {
        if !util::is_aligned(offset, PAGE_SIZE) || !util::is_aligned(size, PAGE_SIZE) {
            return Err(Error::ArgumentAlignment);
        }
        let from_inner = from.inner.lock();
        if util::add_overflows(from_inner.phys_base, offset) {
            return Err(Error::ArgumentInvalid);
        }
        let phys = from_inner.phys_base + offset;
        if size == 0 || util::add_overflows(phys, size - 1) {
            return Err(Error::ArgumentSize);
        }
        if !Self::range_valid(&from_inner, phys, size) {
            return Err(Error::ArgumentInvalid);
        }
        let from_parent = from_inner.parent.clone();
        drop(from_inner);

        {
            let to_inner = to.inner.lock();
            if !Self::range_valid(&to_inner, phys, size) {
                return Err(Error::ArgumentInvalid);
            }
            match (&from_parent, &to_inner.parent) {
                (Some(fp), Some(tp)) if fp.as_ptr() == tp.as_ptr() => {}
                _ => return Err(Error::ArgumentInvalid),
            }
        }
        if core::ptr::eq(from, to) {
            return Err(Error::ArgumentInvalid);
        }
        if to.extent_type() != ExtentType::Sparse {
            return Err(Error::Unimplemented);
        }
        sparse::donate_sibling(from, to, PhysAddr::new(phys), size)
    }

    // -----------------------------------------------------------------------
    // Cache maintenance and hypervisor attachment
    // -----------------------------------------------------------------------

    fn clean_range(&self, offset: u64, size: u64, zero: bool) -> Result<()> {
        {
            let inner = self.inner.lock();
            if inner.memtype == MemType::Device || !inner.access.allows(PgAccess::W) {
                return Err(Error::Denied);
            }
            if !util::is_aligned(offset, PAGE_SIZE) || !util::is_aligned(size, PAGE_SIZE) {
                return Err(Error::ArgumentAlignment);
            }
            if util::add_overflows(inner.phys_base, offset) {
                return Err(Error::ArgumentInvalid);
            }
            let phys = inner.phys_base + offset;
            if size == 0 || util::add_overflows(phys, size - 1) {
                return Err(Error::ArgumentSize);
            }
            if !Self::range_valid(&inner, phys, size) {
                return Err(Error::ArgumentInvalid);
            }
        }

        let phys = self.phys_base().as_u64() + offset;
        boson_memdb::global().range_walk(
            self.memdb_id(),
            MemdbType::Extent,
            PhysAddr::new(phys),
            PhysAddr::new(phys + size - 1),
            &mut |base, len| {
                if zero {
                    boson_core::phys::zero_range(base, len as usize)?;
                }
                cache_clean_range(base, len);
                Ok(())
            },
        )
    }

    /// Zeroes the owned pages of `[offset, offset + size)` and cleans them
    /// to the point of coherency.
    pub fn zero_range(&self, offset: u64, size: u64) -> Result<()> {
        self.clean_range(offset, size, true)
    }

    /// Cleans the owned pages of the range by cache maintenance.
    pub fn cache_clean_range(&self, offset: u64, size: u64) -> Result<()> {
        self.clean_range(offset, size, false)
    }

    /// Cleans and invalidates the owned pages of the range.
    pub fn cache_flush_range(&self, offset: u64, size: u64) -> Result<()> {
        // The software model does not distinguish clean from flush; the
        // argument checks and walk are shared.
        self.clean_range(offset, size, false)
    }

    /// Attaches the extent into the hypervisor address space for direct
    /// access (e.g. the VM info page).
    pub fn attach(&self, owner: &ObjRef<Partition>, hyp_va: usize, size: u64) -> Result<()> {
        match self.header.partition() {
            Some(p) if p.as_ptr() == owner.as_ptr() => {}
            _ => return Err(Error::Denied),
        }

        let mut inner = self.inner.lock();
        if !inner.access.allows(PgAccess::RW) {
            return Err(Error::Denied);
        }
        if inner.size < size {
            return Err(Error::ArgumentSize);
        }
        if !inner.children.is_empty() {
            return Err(Error::Busy);
        }
        inner.attached = Some((hyp_va, size));
        Ok(())
    }

    /// Detaches a previous hypervisor attachment.
    pub fn detach(&self, owner: &ObjRef<Partition>) {
        match self.header.partition() {
            Some(p) => assert_eq!(p.as_ptr(), owner.as_ptr()),
            None => panic!("detach of unowned extent"),
        }
        let mut inner = self.inner.lock();
        assert!(inner.attached.is_some());
        inner.attached = None;
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Returns mapping slot `i`'s view of `[phys, phys + size)`: the target
    /// address space (if the slot is retained), the virtual base of the
    /// range, and its attributes.
    #[must_use]
    pub(crate) fn lookup_mapping(&self, phys: PhysAddr, size: u64, i: usize) -> MappingView {
        match self.extent_type() {
            ExtentType::Basic => basic::lookup_mapping(self, phys, size, i),
            ExtentType::Sparse => sparse::lookup_mapping(self, phys, size, i),
        }
    }

    /// Translates a physical range to an extent offset.
    pub fn get_offset_for_pa(&self, pa: PhysAddr, size: u64) -> Result<u64> {
        let inner = self.inner.lock();
        if size == 0 || util::add_overflows(pa.as_u64(), size - 1) {
            return Err(Error::AddrOverflow);
        }
        if pa.as_u64() < inner.phys_base
            || pa.as_u64() + (size - 1) > inner.phys_base + (inner.size - 1)
        {
            return Err(Error::AddrInvalid);
        }
        Ok(pa.as_u64() - inner.phys_base)
    }
}

/// One mapping slot's view of a physical range.
#[derive(Clone, Copy)]
pub(crate) struct MappingView {
    /// Target address space (raw weak pointer), if the slot is in use.
    pub(crate) addrspace: *const Addrspace,
    /// Virtual base corresponding to the queried physical base.
    pub(crate) vbase: u64,
    /// Attributes of the mapping.
    pub(crate) attrs: MappingAttrs,
    /// Size of the uniformly-mapped (or unmapped) prefix of the query.
    pub(crate) size: u64,
}

impl MappingView {
    pub(crate) fn unmapped(size: u64) -> Self {
        Self {
            addrspace: core::ptr::null(),
            vbase: 0,
            attrs: MappingAttrs {
                memtype: crate::types::VmMemType::NormalWB,
                kernel_access: PgAccess::empty(),
                user_access: PgAccess::empty(),
            },
            size,
        }
    }
}

fn cache_clean_range(_base: PhysAddr, _len: u64) {
    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    {
        // Clean by VA over the linear map, one line at a time.
        if let Ok(ptr) = boson_core::phys::access(_base, _len as usize) {
            let mut addr = ptr as usize;
            let end = addr + _len as usize;
            while addr < end {
                // SAFETY: The linear map covers the owned range.
                unsafe {
                    core::arch::asm!("dc cvac, {}", in(reg) addr, options(nostack));
                }
                addr += 64;
            }
            // SAFETY: Completion barrier for the cache maintenance.
            unsafe { core::arch::asm!("dsb ish", options(nostack)) };
        }
    }
}
