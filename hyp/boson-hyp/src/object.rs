//! Object lifecycle dispatch.
//!
//! Creation hands out an object in `Init` state whose master capability
//! lands in the creator's cspace; configuration calls are only legal in
//! `Init`; activation runs the type's activation handler and publishes
//! `Active` with release ordering, pairing with the acquire in capability
//! lookups so a looked-up active object is always fully initialized.

use boson_core::error::{Error, Result};
use boson_cspace::Cspace;
use boson_ipc::MsgQueue;
use boson_mm::{Addrspace, MemExtent};
use boson_obj::{AnyObjRef, HypObject, ObjRef, ObjectState, Partition};
use boson_sched::{Thread, ThreadKind, VcpuOptions};
use boson_vm::VirtioMmio;

fn activate_common<T: HypObject>(object: &ObjRef<T>, activate: impl FnOnce() -> Result<()>) -> Result<()> {
    if object.header().state() != ObjectState::Init {
        return Err(Error::ObjectState);
    }
    activate()?;
    object.header().set_state(ObjectState::Active);
    Ok(())
}

/// Activates a cspace.
pub fn activate_cspace(cspace: &ObjRef<Cspace>) -> Result<()> {
    activate_common(cspace, || cspace.activate_check())
}

/// Activates an address space, claiming its VMID.
pub fn activate_addrspace(addrspace: &ObjRef<Addrspace>) -> Result<()> {
    activate_common(addrspace, || addrspace.activate())
}

/// Activates a memory extent, transferring (or deferring) its memory.
pub fn activate_memextent(extent: &ObjRef<MemExtent>) -> Result<()> {
    activate_common(extent, || MemExtent::activate(extent))
}

/// Activates a message queue, allocating its ring.
pub fn activate_msgqueue(queue: &ObjRef<MsgQueue>) -> Result<()> {
    activate_common(queue, || queue.activate())
}

/// Activates a VirtIO MMIO device.
pub fn activate_virtio_mmio(device: &ObjRef<VirtioMmio>) -> Result<()> {
    activate_common(device, || Ok(()))
}

/// Activates a partition.
pub fn activate_partition(partition: &ObjRef<Partition>) -> Result<()> {
    activate_common(partition, || Ok(()))
}

/// Activates a thread. VCPUs must have a cspace and an address space
/// attached; the scheduler applies the VCPU options (HLOS primary
/// tracking, pinning) and releases the lifecycle block.
pub fn activate_thread(thread: &ObjRef<Thread>, options: VcpuOptions) -> Result<()> {
    if thread.header().state() != ObjectState::Init {
        return Err(Error::ObjectState);
    }
    if thread.kind() == ThreadKind::Vcpu {
        if thread.cspace().is_none() || thread.addrspace().is_none() {
            return Err(Error::ObjectConfig);
        }
        if !boson_sched::global().vcpu_activate(thread, options) {
            return Err(Error::Denied);
        }
    }
    boson_sched::global().activate_thread(thread)?;
    thread.header().set_state(ObjectState::Active);
    Ok(())
}

/// Activates an object of runtime-determined type with default options.
pub fn activate_any(object: &AnyObjRef) -> Result<()> {
    let any = object;
    match any.object_type() {
        boson_obj::ObjectType::Cspace => {
            let r = typed::<Cspace>(any)?;
            activate_cspace(&r)
        }
        boson_obj::ObjectType::Addrspace => {
            let r = typed::<Addrspace>(any)?;
            activate_addrspace(&r)
        }
        boson_obj::ObjectType::Memextent => {
            let r = typed::<MemExtent>(any)?;
            activate_memextent(&r)
        }
        boson_obj::ObjectType::MsgQueue => {
            let r = typed::<MsgQueue>(any)?;
            activate_msgqueue(&r)
        }
        boson_obj::ObjectType::VirtioMmio => {
            let r = typed::<VirtioMmio>(any)?;
            activate_virtio_mmio(&r)
        }
        boson_obj::ObjectType::Partition => {
            let r = typed::<Partition>(any)?;
            activate_partition(&r)
        }
        boson_obj::ObjectType::Thread => {
            let r = typed::<Thread>(any)?;
            activate_thread(&r, VcpuOptions::empty())
        }
        boson_obj::ObjectType::Any => Err(Error::ArgumentInvalid),
    }
}

fn typed<T: HypObject>(any: &AnyObjRef) -> Result<ObjRef<T>> {
    // Downcast through a clone of the runtime-typed reference.
    boson_rcu::read_protected(|| {
        if any.object_type() == T::TYPE {
            // SAFETY: The type tag matches and `any` holds a reference.
            unsafe { ObjRef::get_safe(any.as_ptr().cast()) }.ok_or(Error::CapNull)
        } else {
            Err(Error::WrongObjectType)
        }
    })
}
