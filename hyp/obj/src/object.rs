//! Object headers, lifecycle states and owning references.

use alloc::boxed::Box;
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, Ordering};

use boson_core::sync::SpinLock;
use boson_rcu::{RcuClass, RcuEntry};

use crate::caplist::CapList;
use crate::partition::Partition;

/// Type tag of a capability-addressable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    /// Wildcard accepted by type-generic lookups. Never stored in a cap.
    Any = 0,
    /// Resource owner with an allocator and a memdb identity.
    Partition = 1,
    /// Capability space.
    Cspace = 2,
    /// Stage-2 translation regime.
    Addrspace = 3,
    /// Physically contiguous donatable memory region.
    Memextent = 4,
    /// Schedulable execution context.
    Thread = 5,
    /// Bounded FIFO message queue.
    MsgQueue = 6,
    /// VirtIO MMIO virtual device.
    VirtioMmio = 7,
}

impl ObjectType {
    /// Decodes a raw type tag.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Any),
            1 => Some(Self::Partition),
            2 => Some(Self::Cspace),
            3 => Some(Self::Addrspace),
            4 => Some(Self::Memextent),
            5 => Some(Self::Thread),
            6 => Some(Self::MsgQueue),
            7 => Some(Self::VirtioMmio),
            _ => None,
        }
    }
}

/// Lifecycle state of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectState {
    /// Created but not yet activated; configuration calls are allowed.
    Init = 0,
    /// Activated and usable through capabilities.
    Active = 1,
    /// Being torn down.
    Destroying = 2,
}

/// Header embedded in every hypervisor object.
///
/// The [`RcuEntry`] must stay the first field: the final-release handler
/// receives the entry pointer and casts it back to the header.
#[repr(C)]
pub struct ObjectHeader {
    rcu_entry: RcuEntry,
    otype: ObjectType,
    state: AtomicU8,
    refcount: AtomicU32,
    /// Caps referencing this object, master at the head. Protected by its
    /// own lock; lock order is cspace allocation lock → cap-list lock →
    /// revoked-list lock (nopreempt).
    pub cap_list: SpinLock<CapList>,
    /// Owning partition. `None` only for the hypervisor's private partition.
    partition: Option<ObjRef<Partition>>,
    /// Type-erased pointer to the containing allocation and its dropper,
    /// set when the object is boxed into an [`ObjRef`].
    container: core::cell::Cell<*mut ()>,
    release: core::cell::Cell<unsafe fn(*mut ())>,
}

// SAFETY: All mutable header state is atomic or lock-protected; the
// container pointer is only consumed once, by the RCU release handler.
unsafe impl Send for ObjectHeader {}
unsafe impl Sync for ObjectHeader {}

impl ObjectHeader {
    /// Creates a header for an object of type `otype` owned by `partition`.
    ///
    /// Objects start in [`ObjectState::Init`] with a single reference, which
    /// becomes the master capability's reference.
    #[must_use]
    pub fn new(otype: ObjectType, partition: Option<ObjRef<Partition>>) -> Self {
        assert!(otype != ObjectType::Any);
        Self {
            rcu_entry: RcuEntry::new(),
            otype,
            state: AtomicU8::new(ObjectState::Init as u8),
            refcount: AtomicU32::new(1),
            cap_list: SpinLock::new(CapList::new()),
            partition,
            container: core::cell::Cell::new(core::ptr::null_mut()),
            release: core::cell::Cell::new(|_| {}),
        }
    }

    /// Returns the object's type tag.
    #[must_use]
    pub fn object_type(&self) -> ObjectType {
        self.otype
    }

    /// Returns the owning partition, if any.
    #[must_use]
    pub fn partition(&self) -> Option<&ObjRef<Partition>> {
        self.partition.as_ref()
    }

    /// Returns the current lifecycle state.
    ///
    /// Uses an acquire load so that observing [`ObjectState::Active`] also
    /// makes the activation-time initialization visible.
    #[must_use]
    pub fn state(&self) -> ObjectState {
        match self.state.load(Ordering::Acquire) {
            0 => ObjectState::Init,
            1 => ObjectState::Active,
            _ => ObjectState::Destroying,
        }
    }

    /// Publishes a new lifecycle state with release ordering.
    pub fn set_state(&self, state: ObjectState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Returns `true` if the object is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == ObjectState::Active
    }

    fn get(&self) {
        let prev = self.refcount.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev != 0, "object resurrected after release");
    }

    /// Attempts to take a reference, failing if the count already hit zero.
    ///
    /// Only meaningful inside an RCU read section, where a zero count means
    /// the object is awaiting its deferred free but the memory is still
    /// valid to examine.
    fn get_safe(&self) -> bool {
        let mut count = self.refcount.load(Ordering::Relaxed);
        loop {
            if count == 0 {
                return false;
            }
            match self.refcount.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => count = observed,
            }
        }
    }

    /// Drops a reference; returns `true` if this was the last one.
    ///
    /// The release/acquire pair orders all accesses to the object before
    /// the teardown that the last put triggers.
    fn put(&self) -> bool {
        let prev = self.refcount.fetch_sub(1, Ordering::Release);
        debug_assert!(prev != 0, "unbalanced object put");
        if prev == 1 {
            core::sync::atomic::fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }
}

/// Implemented by every hypervisor object type.
pub trait HypObject: Sized + Send + Sync + 'static {
    /// The type tag stored in capabilities referencing this object.
    const TYPE: ObjectType;

    /// Returns the embedded header.
    fn header(&self) -> &ObjectHeader;

    /// Tears down the object's external state when its last reference is
    /// dropped, before the memory is freed. Runs at most once, on the CPU
    /// that dropped the last reference.
    fn deactivate(&self) {}
}

fn release_handler(entry: *mut RcuEntry) -> bool {
    // SAFETY: Only ObjectHeader rcu entries are enqueued with the
    // ObjectRelease class, and the entry is the first field of the header.
    let header = unsafe { &*entry.cast::<ObjectHeader>() };
    let container = header.container.get();
    let release = header.release.get();
    // SAFETY: The container/release pair was set by ObjRef::new and is
    // consumed exactly once.
    unsafe { release(container) };
    false
}

/// Registers the object-release RCU handler. Called once during boot (and
/// implicitly by the first `ObjRef::new` so host tests need no setup).
pub fn init() {
    boson_rcu::set_class_handler(RcuClass::ObjectRelease, release_handler);
}

// ---------------------------------------------------------------------------
// Type dispatch for type-erased object pointers
// ---------------------------------------------------------------------------

/// Per-type operations used where the object type is only known at runtime
/// (capability slots hold a `(type, pointer)` pair).
#[derive(Clone, Copy)]
struct TypeOps {
    header_of: unsafe fn(*const ()) -> *const ObjectHeader,
    acquire: unsafe fn(*const ()) -> bool,
    release: unsafe fn(*const ()),
}

const NUM_TYPES: usize = 8;

static TYPE_OPS: [AtomicPtr<TypeOps>; NUM_TYPES] =
    [const { AtomicPtr::new(core::ptr::null_mut()) }; NUM_TYPES];

fn register_type<T: HypObject>() {
    let slot = &TYPE_OPS[T::TYPE as usize];
    if !slot.load(Ordering::Acquire).is_null() {
        return;
    }
    unsafe fn header_of<T: HypObject>(ptr: *const ()) -> *const ObjectHeader {
        // SAFETY: The pointer was stored with type tag T::TYPE.
        unsafe { core::ptr::from_ref((*ptr.cast::<T>()).header()) }
    }
    unsafe fn acquire<T: HypObject>(ptr: *const ()) -> bool {
        // SAFETY: As above; caller is inside an RCU read section.
        unsafe { (*ptr.cast::<T>()).header().get_safe() }
    }
    unsafe fn release<T: HypObject>(ptr: *const ()) {
        // SAFETY: As above; the caller transfers one reference.
        let taken = ObjRef::<T> {
            // SAFETY: Stored pointers are never null.
            ptr: unsafe { NonNull::new_unchecked(ptr.cast::<T>().cast_mut()) },
            _marker: PhantomData,
        };
        drop(taken);
    }
    let ops = Box::new(TypeOps {
        header_of: header_of::<T>,
        acquire: acquire::<T>,
        release: release::<T>,
    });
    let raw = Box::into_raw(ops);
    if slot
        .compare_exchange(
            core::ptr::null_mut(),
            raw,
            Ordering::Release,
            Ordering::Relaxed,
        )
        .is_err()
    {
        // Lost the registration race.
        // SAFETY: `raw` was just created and never shared.
        drop(unsafe { Box::from_raw(raw) });
    }
}

fn type_ops(otype: ObjectType) -> TypeOps {
    let ptr = TYPE_OPS[otype as usize].load(Ordering::Acquire);
    assert!(!ptr.is_null(), "object type never registered");
    // SAFETY: Registered entries are leaked boxes.
    unsafe { *ptr }
}

/// Returns the header of a type-erased object pointer.
///
/// # Safety
///
/// `ptr` must identify a live (or RCU-grace-protected) object of `otype`.
#[must_use]
pub unsafe fn header_of_raw<'a>(otype: ObjectType, ptr: *const ()) -> &'a ObjectHeader {
    // SAFETY: Forwarded contract.
    unsafe { &*(type_ops(otype).header_of)(ptr) }
}

/// Attempts to take a reference on a type-erased object pointer.
///
/// # Safety
///
/// `ptr` must identify an object of `otype` read inside the current RCU
/// read section.
#[must_use]
pub unsafe fn get_safe_raw(otype: ObjectType, ptr: *const ()) -> bool {
    // SAFETY: Forwarded contract.
    unsafe { (type_ops(otype).acquire)(ptr) }
}

/// Releases one reference on a type-erased object pointer.
///
/// # Safety
///
/// The caller must own the reference being released.
pub unsafe fn put_raw(otype: ObjectType, ptr: *const ()) {
    // SAFETY: Forwarded contract.
    unsafe { (type_ops(otype).release)(ptr) }
}

/// An owning reference to an object whose type is only known at runtime.
pub struct AnyObjRef {
    otype: ObjectType,
    ptr: *const (),
}

// SAFETY: The underlying objects are Send + Sync; the refcount is atomic.
unsafe impl Send for AnyObjRef {}
unsafe impl Sync for AnyObjRef {}

impl AnyObjRef {
    /// Wraps an owned reference to `(otype, ptr)`.
    ///
    /// # Safety
    ///
    /// The caller must transfer exactly one reference it owns.
    #[must_use]
    pub unsafe fn from_raw(otype: ObjectType, ptr: *const ()) -> Self {
        Self { otype, ptr }
    }

    /// Returns the object's type tag.
    #[must_use]
    pub fn object_type(&self) -> ObjectType {
        self.otype
    }

    /// Returns the raw object pointer.
    #[must_use]
    pub fn as_ptr(&self) -> *const () {
        self.ptr
    }

    /// Returns the object's header.
    #[must_use]
    pub fn header(&self) -> &ObjectHeader {
        // SAFETY: This reference keeps the object alive.
        unsafe { header_of_raw(self.otype, self.ptr) }
    }

    /// Downcasts to a typed reference, consuming this one.
    pub fn downcast<T: HypObject>(self) -> core::result::Result<ObjRef<T>, Self> {
        if self.otype == T::TYPE {
            let r = ObjRef {
                // SAFETY: Stored pointers are never null and the type tag
                // matches.
                ptr: unsafe { NonNull::new_unchecked(self.ptr.cast::<T>().cast_mut()) },
                _marker: PhantomData,
            };
            core::mem::forget(self);
            Ok(r)
        } else {
            Err(self)
        }
    }
}

impl Drop for AnyObjRef {
    fn drop(&mut self) {
        // SAFETY: This value owned one reference.
        unsafe { put_raw(self.otype, self.ptr) };
    }
}

/// An owning reference to a hypervisor object.
///
/// Semantics match the classic get/put model: clone takes a reference, drop
/// releases one, the final drop calls [`HypObject::deactivate`] and defers
/// the free to RCU.
pub struct ObjRef<T: HypObject> {
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

// SAFETY: ObjRef hands out only &T; T is Sync, and the refcount is atomic.
unsafe impl<T: HypObject> Send for ObjRef<T> {}
unsafe impl<T: HypObject> Sync for ObjRef<T> {}

impl<T: HypObject> ObjRef<T> {
    /// Moves `object` to the heap and takes ownership of its initial
    /// reference.
    pub fn new(object: T) -> Self {
        init();
        register_type::<T>();
        let ptr = NonNull::from(Box::leak(Box::new(object)));
        unsafe fn drop_container<T>(container: *mut ()) {
            // SAFETY: The container was produced by Box::leak above.
            drop(unsafe { Box::from_raw(container.cast::<T>()) });
        }
        // SAFETY: The object was just leaked and nothing else references it
        // yet; the cells are only read once, by the release handler.
        unsafe {
            let header = ptr.as_ref().header();
            header.container.set(ptr.as_ptr().cast());
            header.release.set(drop_container::<T>);
        }
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// Attempts to take a reference from a raw pointer read inside an RCU
    /// read section.
    ///
    /// Returns `None` if the object's count already reached zero (it is
    /// awaiting its deferred free).
    ///
    /// # Safety
    ///
    /// `ptr` must have been obtained from an [`ObjRef`] and the caller must
    /// be inside an RCU read section (the deferred free is what keeps the
    /// memory valid to examine here).
    #[must_use]
    pub unsafe fn get_safe(ptr: *const T) -> Option<Self> {
        // SAFETY: Per the caller contract the memory is still valid.
        let obj = unsafe { &*ptr };
        if obj.header().get_safe() {
            Some(Self {
                // SAFETY: Non-null by construction from an ObjRef.
                ptr: unsafe { NonNull::new_unchecked(ptr.cast_mut()) },
                _marker: PhantomData,
            })
        } else {
            None
        }
    }

    /// Returns the raw pointer identifying this object.
    #[must_use]
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }
}

impl<T: HypObject> Clone for ObjRef<T> {
    fn clone(&self) -> Self {
        self.header().get();
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T: HypObject> core::ops::Deref for ObjRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The reference held by this ObjRef keeps the object alive.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: HypObject> Drop for ObjRef<T> {
    fn drop(&mut self) {
        // SAFETY: As in deref; the object stays alive until the deferred
        // free that the final put schedules.
        let obj = unsafe { self.ptr.as_ref() };
        if obj.header().put() {
            obj.header().set_state(ObjectState::Destroying);
            obj.deactivate();
            let entry = core::ptr::from_ref(&obj.header().rcu_entry).cast_mut();
            // SAFETY: The entry lives inside the object, which stays valid
            // until the release handler consumes it; it is enqueued exactly
            // once.
            unsafe { boson_rcu::enqueue(entry, RcuClass::ObjectRelease) };
        }
    }
}

impl<T: HypObject + core::fmt::Debug> core::fmt::Debug for ObjRef<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        (**self).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boson_core::cpulocal::set_current_cpu;
    use core::sync::atomic::AtomicUsize;

    static DEACTIVATED: AtomicUsize = AtomicUsize::new(0);

    struct Dummy {
        header: ObjectHeader,
        value: u32,
    }

    impl core::fmt::Debug for Dummy {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.debug_struct("Dummy").field("value", &self.value).finish()
        }
    }

    impl HypObject for Dummy {
        const TYPE: ObjectType = ObjectType::MsgQueue;

        fn header(&self) -> &ObjectHeader {
            &self.header
        }

        fn deactivate(&self) {
            DEACTIVATED.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn new_dummy(value: u32) -> ObjRef<Dummy> {
        ObjRef::new(Dummy {
            header: ObjectHeader::new(ObjectType::MsgQueue, None),
            value,
        })
    }

    #[test]
    fn clone_and_deref() {
        set_current_cpu(10);
        let a = new_dummy(7);
        let b = a.clone();
        assert_eq!(a.value, 7);
        assert_eq!(b.value, 7);
        assert_eq!(a.as_ptr(), b.as_ptr());
        set_current_cpu(0);
    }

    #[test]
    fn state_transitions() {
        set_current_cpu(10);
        let a = new_dummy(1);
        assert_eq!(a.header().state(), ObjectState::Init);
        assert!(!a.header().is_active());
        a.header().set_state(ObjectState::Active);
        assert!(a.header().is_active());
        set_current_cpu(0);
    }

    #[test]
    fn last_put_deactivates_and_defers_free() {
        set_current_cpu(11);
        let before = DEACTIVATED.load(Ordering::Relaxed);
        let a = new_dummy(2);
        let raw = a.as_ptr();

        // get_safe succeeds while a reference exists.
        boson_rcu::read_start();
        // SAFETY: raw comes from a live ObjRef, inside a read section.
        let extra = unsafe { ObjRef::get_safe(raw) }.expect("live object");
        boson_rcu::read_finish();

        drop(a);
        assert_eq!(DEACTIVATED.load(Ordering::Relaxed), before);

        boson_rcu::read_start();
        drop(extra);
        // Deactivate ran on the final put; the memory is still valid until
        // the grace period ends, so a racing get_safe sees count zero.
        assert_eq!(DEACTIVATED.load(Ordering::Relaxed), before + 1);
        // SAFETY: Inside a read section; the free is still deferred.
        assert!(unsafe { ObjRef::get_safe(raw) }.is_none());
        boson_rcu::read_finish();
        set_current_cpu(0);
    }
}
