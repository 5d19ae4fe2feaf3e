//! Partitions: resource owners.
//!
//! A partition owns physical memory (tracked in the memory database under
//! its identity) and pays for every allocation made on behalf of its
//! objects. Allocations are served from the hypervisor heap and accounted
//! per partition; freeing must pass back the same layout.

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use boson_core::error::{Error, Result};

use crate::object::{HypObject, ObjRef, ObjectHeader, ObjectState, ObjectType};

/// A resource owner with an allocator and a memdb identity.
pub struct Partition {
    header: ObjectHeader,
    /// Bytes currently allocated on behalf of this partition.
    allocated_bytes: AtomicU64,
    /// Number of live allocations.
    allocation_count: AtomicU64,
}

impl HypObject for Partition {
    const TYPE: ObjectType = ObjectType::Partition;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

impl Partition {
    /// Creates a partition owned by `parent` (or none, for the private
    /// hypervisor partition).
    #[must_use]
    pub fn new(parent: Option<ObjRef<Partition>>) -> ObjRef<Self> {
        ObjRef::new(Self {
            header: ObjectHeader::new(ObjectType::Partition, parent),
            allocated_bytes: AtomicU64::new(0),
            allocation_count: AtomicU64::new(0),
        })
    }

    /// Allocates `size` bytes with `align` alignment from this partition.
    ///
    /// The memory is zeroed; object constructors rely on this.
    pub fn alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(size, align).map_err(|_| Error::ArgumentInvalid)?;
        // SAFETY: The layout has non-zero size at every call site; guard
        // anyway since a zero-size layout would be UB to allocate.
        if size == 0 {
            return Err(Error::ArgumentSize);
        }
        // SAFETY: Layout validity checked above.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(p) => {
                self.allocated_bytes
                    .fetch_add(size as u64, Ordering::Relaxed);
                self.allocation_count.fetch_add(1, Ordering::Relaxed);
                Ok(p)
            }
            None => Err(Error::NoMem),
        }
    }

    /// Frees memory previously returned by [`alloc`](Self::alloc).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc` on this partition with the same `size`
    /// and `align`, and must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let layout = Layout::from_size_align(size, align).expect("layout was valid at alloc time");
        // SAFETY: Per the caller contract.
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
        self.allocated_bytes
            .fetch_sub(size as u64, Ordering::Relaxed);
        self.allocation_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns the number of bytes currently allocated.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Returns the number of live allocations.
    #[must_use]
    pub fn allocation_count(&self) -> u64 {
        self.allocation_count.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// The hypervisor's private partition
// ---------------------------------------------------------------------------

static PRIVATE: AtomicPtr<Partition> = AtomicPtr::new(core::ptr::null_mut());

/// Initializes the hypervisor's private partition (cold boot only; host
/// tests may call it repeatedly, later calls are ignored).
pub fn init_private() {
    let part = Partition::new(None);
    part.header().set_state(ObjectState::Active);
    let raw = part.as_ptr().cast_mut();
    if PRIVATE
        .compare_exchange(
            core::ptr::null_mut(),
            raw,
            Ordering::Release,
            Ordering::Relaxed,
        )
        .is_ok()
    {
        // The global pointer holds the reference forever.
        core::mem::forget(part);
    }
}

/// Returns the hypervisor's private partition.
///
/// # Panics
///
/// Panics if [`init_private`] has not run.
#[must_use]
pub fn private() -> ObjRef<Partition> {
    let raw = PRIVATE.load(Ordering::Acquire);
    assert!(!raw.is_null(), "private partition not initialized");
    // SAFETY: The global holds a never-dropped reference, so the object is
    // alive; get_safe can only see a nonzero count.
    unsafe { ObjRef::get_safe(raw) }.expect("private partition never released")
}

#[cfg(test)]
mod tests {
    use super::*;
    use boson_core::cpulocal::set_current_cpu;

    #[test]
    fn alloc_accounts_and_frees() {
        set_current_cpu(12);
        let part = Partition::new(None);
        let p = part.alloc(256, 16).unwrap();
        assert_eq!(part.allocated_bytes(), 256);
        assert_eq!(part.allocation_count(), 1);
        // Memory is zeroed.
        // SAFETY: 256 bytes were just allocated.
        unsafe {
            assert!(core::slice::from_raw_parts(p.as_ptr(), 256)
                .iter()
                .all(|&b| b == 0));
            part.free(p, 256, 16);
        }
        assert_eq!(part.allocated_bytes(), 0);
        assert_eq!(part.allocation_count(), 0);
        set_current_cpu(0);
    }

    #[test]
    fn zero_size_alloc_rejected() {
        set_current_cpu(12);
        let part = Partition::new(None);
        assert_eq!(part.alloc(0, 8), Err(Error::ArgumentSize));
        set_current_cpu(0);
    }

    #[test]
    fn private_partition_is_singleton() {
        set_current_cpu(13);
        init_private();
        init_private();
        let a = private();
        let b = private();
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert!(a.header().is_active());
        set_current_cpu(0);
    }
}
