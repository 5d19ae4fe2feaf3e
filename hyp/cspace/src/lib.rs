//! Capability spaces.
//!
//! A cspace is a randomized two-level table of capability slots. The first
//! level is a fixed array of atomic table pointers; second-level tables are
//! allocated on demand from the owning partition and hold the actual cap
//! slots. Lookups are lock-free: they decode the ID, chase the table
//! pointer with an acquire load (pairing with the release store that
//! published the initialized table), read the slot's payload atomically,
//! and validate state, type and rights — all inside an RCU read section,
//! with the final reference taken by the object's conditional safe-get.
//!
//! Mutations serialize per slot through the payload cell's
//! compare-exchange, and structurally on the cspace allocation lock (slot
//! accounting), each object's cap-list lock (list membership), and each
//! cspace's revoked-list lock. Lock order: allocation lock → cap-list lock
//! → revoked-list lock (taken without preemption bookkeeping when nested).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use boson_core::bitmap::AtomicBitmap;
use boson_core::error::{Error, Result};
use boson_core::sync::SpinLock;
use boson_core::util;
use boson_obj::{
    AnyObjRef, CapList, HypObject, ObjRef, ObjectHeader, ObjectType, Partition, header_of_raw,
    put_raw,
};
use boson_rcu::{RcuClass, RcuEntry};

mod cell;
mod id;
pub mod rights;
mod table;

pub use cell::{CapCell, CapData, CapState};
pub use id::{CapId, IdEncoder};
pub use table::{Cap, CapTable};

use rights::CapRights;

#[cfg(test)]
mod tests;

/// First-level slots per cspace.
pub const NUM_CAP_TABLES: usize = 64;
/// Capability slots per second-level table.
pub const CAP_SLOTS_PER_TABLE: usize = 64;
/// Hard cap on `max_caps`.
pub const MAX_CAP_COUNT_SUPPORTED: u32 = (NUM_CAP_TABLES * CAP_SLOTS_PER_TABLE) as u32;

/// Slot-allocation state guarded by the cspace allocation lock.
struct CapAlloc {
    /// Tables attached and not yet full.
    available_tables: u64,
    /// Live caps in this cspace.
    cap_count: u32,
    /// Configured capacity; zero until `configure`.
    max_caps: u32,
}

/// A capability space.
pub struct Cspace {
    header: ObjectHeader,
    encoder: IdEncoder,
    tables: [AtomicPtr<CapTable>; NUM_CAP_TABLES],
    /// First-level slots claimed (table allocation in progress or done).
    allocated_tables: AtomicBitmap<1>,
    alloc: SpinLock<CapAlloc>,
    /// Revoked caps of this cspace, awaiting their delete.
    revoked_caps: SpinLock<CapList>,
}

impl HypObject for Cspace {
    const TYPE: ObjectType = ObjectType::Cspace;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn deactivate(&self) {
        // Destroy all remaining lower levels. No lookups can race: the
        // last reference is gone.
        for table in &self.tables {
            let ptr = table.load(Ordering::Relaxed);
            if !ptr.is_null() {
                // SAFETY: The table was attached to this cspace and is
                // detached here exactly once.
                unsafe { destroy_cap_table(ptr) };
            }
        }
    }
}

impl Cspace {
    /// Creates a cspace with boot-randomized cap IDs.
    #[must_use]
    pub fn new(partition: Option<ObjRef<Partition>>) -> ObjRef<Self> {
        Self::with_encoder(partition, IdEncoder::new_random())
    }

    /// Creates a cspace with an explicit ID encoder.
    #[must_use]
    pub fn with_encoder(
        partition: Option<ObjRef<Partition>>,
        encoder: IdEncoder,
    ) -> ObjRef<Self> {
        boson_rcu::set_class_handler(RcuClass::CspaceReleaseTable, release_table_handler);
        ObjRef::new(Self {
            header: ObjectHeader::new(ObjectType::Cspace, partition),
            encoder,
            tables: [const { AtomicPtr::new(core::ptr::null_mut()) }; NUM_CAP_TABLES],
            allocated_tables: AtomicBitmap::new(),
            alloc: SpinLock::new(CapAlloc {
                available_tables: 0,
                cap_count: 0,
                max_caps: 0,
            }),
            revoked_caps: SpinLock::new(CapList::new()),
        })
    }

    /// Sets the capability capacity. Only valid before activation.
    pub fn configure(&self, max_caps: u32) -> Result<()> {
        assert_eq!(self.header.state(), boson_obj::ObjectState::Init);
        if max_caps <= MAX_CAP_COUNT_SUPPORTED {
            self.alloc.lock().max_caps = max_caps;
            Ok(())
        } else {
            Err(Error::ArgumentInvalid)
        }
    }

    /// Validates the configuration at activation time.
    pub fn activate_check(&self) -> Result<()> {
        if self.alloc.lock().max_caps != 0 {
            Ok(())
        } else {
            Err(Error::ObjectConfig)
        }
    }

    // -----------------------------------------------------------------------
    // Slot allocation
    // -----------------------------------------------------------------------

    fn allocate_cap_table(&self) -> Result<(NonNull<CapTable>, usize)> {
        let index = loop {
            let Some(index) = self.allocated_tables.first_clear(NUM_CAP_TABLES) else {
                return Err(Error::CspaceFull);
            };
            // Loop until we successfully change the bit state.
            if !self.allocated_tables.test_and_set(index) {
                break index;
            }
        };

        let partition = self
            .header
            .partition()
            .cloned()
            .unwrap_or_else(boson_obj::partition::private);
        let size = core::mem::size_of::<CapTable>();
        let align = core::mem::align_of::<CapTable>();
        match partition.alloc(size, align) {
            Ok(mem) => {
                let ptr = mem.cast::<CapTable>();
                // SAFETY: Freshly allocated, zeroed, correctly sized memory.
                unsafe { CapTable::init_at(ptr, index, self, partition) };
                Ok((ptr, index))
            }
            Err(_) => {
                self.allocated_tables.test_and_clear(index);
                Err(Error::NoMem)
            }
        }
    }

    /// Allocates a slot and its VM-visible ID.
    ///
    /// Must be called inside an RCU read section; if a new table has to be
    /// allocated, the read section is exited around the allocator call and
    /// re-entered (allocation may need preemption).
    fn allocate_cap_slot(&self) -> Result<(&Cap, CapId)> {
        let mut alloc = self.alloc.lock();

        if alloc.cap_count == alloc.max_caps {
            return Err(Error::CspaceFull);
        }

        let (table_ptr, upper) = match first_set_u64(alloc.available_tables) {
            Some(upper) => (self.tables[upper].load(Ordering::Relaxed), upper),
            None => {
                // Allocation may require preemption, so drop the lock and
                // leave the read section.
                drop(alloc);
                boson_rcu::read_finish();
                let allocated = self.allocate_cap_table();
                boson_rcu::read_start();
                let (ptr, upper) = allocated?;

                alloc = self.alloc.lock();
                // Store with release: table initialization must be ordered
                // before table attachment.
                self.tables[upper].store(ptr.as_ptr(), Ordering::Release);
                alloc.available_tables |= util::bit(upper as u32);
                (ptr.as_ptr(), upper)
            }
        };

        // SAFETY: Attached tables stay live until the cspace retires them.
        let table = unsafe { &*table_ptr };
        table.cap_count.set(table.cap_count.get() + 1);
        alloc.cap_count += 1;

        if table.cap_count.get() == CAP_SLOTS_PER_TABLE as u32 {
            alloc.available_tables &= !util::bit(upper as u32);
        }

        drop(alloc);

        let lower = loop {
            let Some(lower) = table.used_slots.first_clear(CAP_SLOTS_PER_TABLE) else {
                panic!("cap table has incorrect cap_count on allocate");
            };
            // Loop until we successfully change the bit state.
            if !table.used_slots.test_and_set(lower) {
                break lower;
            }
        };

        Ok((table.slot(lower), self.encoder.encode(upper, lower)))
    }

    /// Frees a slot whose payload has already been set to null.
    fn free_cap_slot(&self, cap: &Cap) {
        let table = cap.table();
        let lower = table.slot_index(cap);
        let upper = table.index;

        table.used_slots.test_and_clear(lower);

        let mut alloc = self.alloc.lock();

        if table.cap_count.get() == CAP_SLOTS_PER_TABLE as u32 {
            alloc.available_tables |= util::bit(upper as u32);
        }

        table.cap_count.set(table.cap_count.get() - 1);
        alloc.cap_count -= 1;

        if table.cap_count.get() == 0 {
            self.allocated_tables.test_and_clear(upper);
            alloc.available_tables &= !util::bit(upper as u32);
            self.tables[upper].store(core::ptr::null_mut(), Ordering::Relaxed);
            // Readers may still hold the table pointer; free it after a
            // grace period.
            let entry = core::ptr::from_ref(&table.rcu_entry).cast_mut();
            // SAFETY: The table is detached and enqueued exactly once.
            unsafe { boson_rcu::enqueue(entry, RcuClass::CspaceReleaseTable) };
        }
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    fn lookup_cap_slot(&self, cap_id: CapId) -> Result<&Cap> {
        let (upper, lower) = self.encoder.decode(cap_id)?;
        let table = self.tables[upper].load(Ordering::Acquire);
        if table.is_null() {
            return Err(Error::CapNull);
        }
        // SAFETY: A non-null table pointer read inside the caller's RCU
        // read section stays valid until at least the section's end.
        Ok(unsafe { &*table }.slot(lower))
    }

    fn check_cap_data(data: &CapData, otype: ObjectType, rights: CapRights) -> Result<()> {
        match data.state {
            CapState::Valid => {
                if data.otype != otype && otype != ObjectType::Any {
                    return Err(Error::WrongObjectType);
                }
            }
            CapState::Null => return Err(Error::CapNull),
            CapState::Revoked => return Err(Error::CapRevoked),
        }
        if data.rights & rights != rights {
            return Err(Error::InsufficientRights);
        }
        Ok(())
    }

    /// Looks up a capability and takes a reference on its object.
    ///
    /// Never blocks. `active_only` additionally requires the object to have
    /// been activated.
    pub fn lookup_object<T: HypObject>(
        &self,
        cap_id: CapId,
        required_rights: CapRights,
        active_only: bool,
    ) -> Result<ObjRef<T>> {
        assert!(T::TYPE != ObjectType::Any);
        boson_rcu::read_start();
        let result = (|| {
            let cap = self.lookup_cap_slot(cap_id)?;
            let data = cap.data.load();
            Self::check_cap_data(&data, T::TYPE, required_rights)?;
            if active_only {
                // SAFETY: The payload was valid, so the pointer identifies
                // an object of its type; the read section keeps it
                // examinable.
                let header = unsafe { header_of_raw(data.otype, data.object) };
                if !header.is_active() {
                    return Err(Error::ObjectState);
                }
            }
            // SAFETY: As above; get_safe refuses already-released objects.
            unsafe { ObjRef::get_safe(data.object.cast::<T>()) }.ok_or(Error::CapNull)
        })();
        boson_rcu::read_finish();
        result
    }

    /// Looks up a capability of any type, returning the object with its
    /// runtime type tag. Only generic rights may be required.
    pub fn lookup_object_any(
        &self,
        cap_id: CapId,
        required_rights: CapRights,
    ) -> Result<AnyObjRef> {
        assert_eq!(required_rights & !rights::generic::ALL, 0);
        boson_rcu::read_start();
        let result = (|| {
            let cap = self.lookup_cap_slot(cap_id)?;
            let data = cap.data.load();
            Self::check_cap_data(&data, ObjectType::Any, required_rights)?;
            // SAFETY: Valid payload inside the read section.
            if unsafe { boson_obj::get_safe_raw(data.otype, data.object) } {
                // SAFETY: get_safe_raw just granted us a reference.
                Ok(unsafe { AnyObjRef::from_raw(data.otype, data.object) })
            } else {
                Err(Error::CapNull)
            }
        })();
        boson_rcu::read_finish();
        result
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Creates the master capability for `object` in this cspace.
    ///
    /// The cap list collectively holds one object reference, taken here;
    /// it is released when the last cap for the object is deleted.
    pub fn create_master_cap<T: HypObject>(&self, object: &ObjRef<T>) -> Result<CapId> {
        assert!(T::TYPE != ObjectType::Any);

        let data = CapData {
            object: object.as_ptr().cast(),
            otype: T::TYPE,
            state: CapState::Valid,
            rights: rights::rights_all(T::TYPE),
            master: true,
        };

        boson_rcu::read_start();
        let result = match self.allocate_cap_slot() {
            Ok((cap, cap_id)) => {
                // The cap is not reachable through the cspace until its
                // payload goes valid, so the list insert cannot race with
                // another cap operation on this object.
                let list_reference = object.clone();
                object.header().cap_list.lock().insert_head(cap.as_slot_ptr());
                cap.data.store(data);
                core::mem::forget(list_reference);
                Ok(cap_id)
            }
            Err(err) => Err(err),
        };
        boson_rcu::read_finish();
        result
    }

    /// Copies the cap `parent_id` of `parent_cspace` into this cspace with
    /// `rights_mask` applied.
    ///
    /// The new cap is linked immediately after its parent on the object's
    /// cap list and never carries the master flag.
    pub fn copy_cap_from(
        &self,
        parent_cspace: &Cspace,
        parent_id: CapId,
        rights_mask: CapRights,
    ) -> Result<CapId> {
        boson_rcu::read_start();
        let result = (|| {
            // Allocate the destination slot first: doing it later would
            // mean dropping the object's cap-list lock to allow preemption.
            let (new_cap, new_cap_id) = self.allocate_cap_slot()?;

            let free_on_err = |err| {
                new_cap.data.store(CapData::NULL);
                self.free_cap_slot(new_cap);
                err
            };

            let parent_cap = match parent_cspace.lookup_cap_slot(parent_id) {
                Ok(cap) => cap,
                Err(err) => return Err(free_on_err(err)),
            };

            let data = parent_cap.data.load();
            if let Err(err) = Self::check_cap_data(&data, ObjectType::Any, 0) {
                return Err(free_on_err(err));
            }
            let masked_rights = data.rights & rights_mask;
            if masked_rights == 0 {
                return Err(free_on_err(Error::InsufficientRights));
            }

            // SAFETY: Valid payload inside the read section.
            let header = unsafe { header_of_raw(data.otype, data.object) };
            let mut cap_list = header.cap_list.lock();

            // Reload the parent payload via a no-op exchange: if it changed
            // since the read above, a concurrent delete or revoke won.
            let result = parent_cap.data.compare_exchange(data, data);
            match result {
                Ok(()) => {
                    let mut new_data = data;
                    new_data.rights = masked_rights;
                    new_data.master = false;
                    new_cap.data.store(new_data);
                    cap_list.insert_after(parent_cap.as_slot_ptr(), new_cap.as_slot_ptr());
                    drop(cap_list);
                    Ok(new_cap_id)
                }
                Err(err) => {
                    drop(cap_list);
                    Err(free_on_err(err))
                }
            }
        })();
        boson_rcu::read_finish();
        result
    }

    /// Deletes the cap `cap_id`. Valid and revoked caps can be deleted; the
    /// object's reference is released when its cap list empties.
    pub fn delete_cap(&self, cap_id: CapId) -> Result<()> {
        boson_rcu::read_start();
        let result = (|| {
            let cap = self.lookup_cap_slot(cap_id)?;
            let data = cap.data.load();
            let mut cap_list_empty = false;

            match data.state {
                CapState::Valid => {
                    // SAFETY: Valid payload inside the read section.
                    let header = unsafe { header_of_raw(data.otype, data.object) };
                    let mut cap_list = header.cap_list.lock();
                    cap.data.compare_exchange(data, CapData::NULL)?;
                    cap_list.remove(cap.as_slot_ptr());
                    cap_list_empty = cap_list.is_empty();
                }
                CapState::Revoked => {
                    let mut revoked = self.revoked_caps.lock();
                    cap.data.compare_exchange(data, CapData::NULL)?;
                    revoked.remove(cap.as_slot_ptr());
                }
                CapState::Null => return Err(Error::CapNull),
            }

            self.free_cap_slot(cap);
            if cap_list_empty {
                // SAFETY: The emptied list owned one object reference.
                unsafe { put_raw(data.otype, data.object) };
            }
            Ok(())
        })();
        boson_rcu::read_finish();
        result
    }

    /// Revokes every cap derived from the master cap `master_cap_id`, in
    /// all cspaces. The master cap itself stays valid.
    pub fn revoke_caps(&self, master_cap_id: CapId) -> Result<()> {
        boson_rcu::read_start();
        let result = (|| {
            let master_cap = self.lookup_cap_slot(master_cap_id)?;
            let master_data = master_cap.data.load();
            Self::check_cap_data(&master_data, ObjectType::Any, 0)?;
            if !master_data.master {
                return Err(Error::InsufficientRights);
            }

            // SAFETY: Valid payload inside the read section.
            let header = unsafe { header_of_raw(master_data.otype, master_data.object) };
            let mut cap_list = header.cap_list.lock();

            // No-op update: fails if the master payload changed since the
            // load above.
            master_cap.data.compare_exchange(master_data, master_data)?;

            // Children are always inserted after their parent, so the
            // master sits at the head.
            debug_assert_eq!(cap_list.head(), Some(master_cap.as_slot_ptr()));

            for slot in cap_list.snapshot() {
                if slot == master_cap.as_slot_ptr() {
                    continue;
                }
                // SAFETY: Slots on a cap list are live Cap references.
                let child: &Cap = unsafe { slot.cast::<Cap>().as_ref() };

                let mut child_data = child.data.load();
                child_data.state = CapState::Revoked;
                // Clear the object pointer: the object may be freed by a
                // later delete of the last valid cap, and revoked caps
                // pointing at freed memory would make debugging confusing.
                child_data.object = core::ptr::null();

                // The child cap's cspace is safe to reach: the cap must be
                // destroyed before its cspace can be, which cannot happen
                // while we hold the cap-list lock.
                let child_cspace = child.table().cspace();
                let mut revoked = child_cspace.revoked_caps.lock_nopreempt();

                // The child payload cannot change while both locks are
                // held; store the revoked payload directly.
                child.data.store(child_data);
                cap_list.remove(slot);
                revoked.insert_head(slot);
            }
            Ok(())
        })();
        boson_rcu::read_finish();
        result
    }

    /// Returns the number of live caps (for diagnostics and tests).
    #[must_use]
    pub fn cap_count(&self) -> u32 {
        self.alloc.lock().cap_count
    }
}

fn first_set_u64(bits: u64) -> Option<usize> {
    if bits == 0 {
        None
    } else {
        Some(bits.trailing_zeros() as usize)
    }
}

/// Tears down a detached cap table: drops any caps still valid (releasing
/// object references as their lists empty), then returns the memory to the
/// owning partition.
///
/// # Safety
///
/// `table` must be detached from its cspace with no new references possible.
unsafe fn destroy_cap_table(table: *mut CapTable) {
    // SAFETY: Per the caller contract.
    let t = unsafe { &*table };

    // If called from cspace teardown there may still be valid caps that
    // need their list membership and references unwound.
    while t.cap_count.get() > 0 {
        let Some(index) = t.used_slots.first_set(CAP_SLOTS_PER_TABLE) else {
            panic!("cap table has incorrect cap_count on delete");
        };
        let cap = t.slot(index);
        let data = cap.data.load();

        t.used_slots.clear(index);
        t.cap_count.set(t.cap_count.get() - 1);

        if data.state != CapState::Valid {
            continue;
        }

        // SAFETY: Valid caps reference live objects.
        let header = unsafe { header_of_raw(data.otype, data.object) };
        let mut cap_list = header.cap_list.lock();
        cap_list.remove(cap.as_slot_ptr());
        let cap_list_empty = cap_list.is_empty();
        drop(cap_list);

        if cap_list_empty {
            // SAFETY: The emptied list owned one object reference.
            unsafe { put_raw(data.otype, data.object) };
        }
    }

    let partition = t.partition.clone();
    let size = core::mem::size_of::<CapTable>();
    let align = core::mem::align_of::<CapTable>();
    // SAFETY: The table is detached; nothing else references it.
    unsafe {
        core::ptr::drop_in_place(table);
        partition.free(NonNull::new_unchecked(table.cast()), size, align);
    }
}

fn release_table_handler(entry: *mut RcuEntry) -> bool {
    // SAFETY: Only detached CapTable nodes are enqueued with this class,
    // and the rcu entry is their first field.
    unsafe { destroy_cap_table(entry.cast::<CapTable>()) };
    false
}
