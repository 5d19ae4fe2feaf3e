//! The capability-indexed hypercall surface.
//!
//! Every call names its objects by capability ID in the calling thread's
//! cspace; the entry performs a rights-checked lookup, the operation, and
//! returns an error code with an optional result value. Guest memory
//! arguments (message payloads) are copied through bounded physical
//! windows after resolving the guest address against the caller's stage-2
//! state — guest pointers are never trusted as hypervisor pointers.

use boson_core::addr::{PhysAddr, VmAddr};
use boson_core::error::{Error, Result};
use boson_cspace::{CapId, Cspace, rights};
use boson_ipc::MsgQueue;
use boson_mm::memextent::ExtentAttrs;
use boson_mm::{Addrspace, MappingAttrs, MemExtent, MemType, PgAccess, VmMemType};
use boson_obj::{ObjRef, Partition};
use boson_sched::{Thread, ThreadKind};
use boson_vm::VirtioMmio;

/// Hypercall numbers. The table mirrors the object operations; gaps are
/// reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Call {
    /// `partition_create_cspace(partition_cap) -> cap`
    PartitionCreateCspace = 0x10,
    /// `partition_create_addrspace(partition_cap) -> cap`
    PartitionCreateAddrspace = 0x11,
    /// `partition_create_memextent(partition_cap, device_mem) -> cap`
    PartitionCreateMemextent = 0x12,
    /// `partition_create_thread(partition_cap) -> cap`
    PartitionCreateThread = 0x13,
    /// `partition_create_msgqueue(partition_cap) -> cap`
    PartitionCreateMsgqueue = 0x14,
    /// `partition_create_virtio_mmio(partition_cap, device_id, queues) -> cap`
    PartitionCreateVirtioMmio = 0x15,
    /// `object_activate(cap)`
    ObjectActivate = 0x20,
    /// `cspace_delete_cap_from(cspace_cap, cap)`
    CspaceDeleteCap = 0x30,
    /// `cspace_copy_cap_from(src_cspace_cap, cap, rights_mask) -> cap`
    CspaceCopyCap = 0x31,
    /// `cspace_revoke_caps_from(cspace_cap, master_cap)`
    CspaceRevokeCaps = 0x32,
    /// `cspace_configure(cspace_cap, max_caps)`
    CspaceConfigure = 0x33,
    /// `addrspace_configure(addrspace_cap, vmid)`
    AddrspaceConfigure = 0x40,
    /// `addrspace_add_vmmio_range(addrspace_cap, base, size)`
    AddrspaceAddVmmioRange = 0x41,
    /// `addrspace_remove_vmmio_range(addrspace_cap, base, size)`
    AddrspaceRemoveVmmioRange = 0x42,
    /// `memextent_configure(cap, phys, size, attrs)`
    MemextentConfigure = 0x50,
    /// `memextent_configure_derive(cap, parent_cap, offset, size, attrs)`
    MemextentConfigureDerive = 0x51,
    /// `memextent_map(cap, addrspace_cap, vbase, attrs)`
    MemextentMap = 0x52,
    /// `memextent_unmap(cap, addrspace_cap, vbase)`
    MemextentUnmap = 0x53,
    /// `memextent_update_access(cap, addrspace_cap, vbase, kaccess, uaccess)`
    MemextentUpdateAccess = 0x54,
    /// `memextent_donate(cap, offset, size, flags)`
    MemextentDonate = 0x55,
    /// `memextent_zero(cap, offset, size)`
    MemextentZero = 0x56,
    /// `memextent_cache_clean(cap, offset, size)`
    MemextentCacheClean = 0x57,
    /// `memextent_cache_flush(cap, offset, size)`
    MemextentCacheFlush = 0x58,
    /// `msgqueue_configure(cap, max_msg_size, depth)`
    MsgqueueConfigure = 0x60,
    /// `msgqueue_send(cap, size, gvaddr, push) -> not_full`
    MsgqueueSend = 0x61,
    /// `msgqueue_receive(cap, gvaddr, max_size) -> (size, not_empty)`
    MsgqueueReceive = 0x62,
    /// `msgqueue_flush(cap)`
    MsgqueueFlush = 0x63,
    /// `thread_set_affinity(cap, cpu)`
    ThreadSetAffinity = 0x70,
    /// `thread_set_priority(cap, priority)`
    ThreadSetPriority = 0x71,
    /// `thread_set_timeslice(cap, timeslice_ns)`
    ThreadSetTimeslice = 0x72,
    /// `thread_kill(cap)`
    ThreadKill = 0x73,
    /// `thread_yield_to(cap)`
    ThreadYieldTo = 0x74,
    /// `virtio_mmio_backend_set_dev_features(cap, sel, features)`
    VirtioSetDevFeatures = 0x80,
    /// `virtio_mmio_backend_set_queue_num_max(cap, queue, num_max)`
    VirtioSetQueueNumMax = 0x81,
    /// `virtio_mmio_backend_get_drv_features(cap, sel) -> features`
    VirtioGetDrvFeatures = 0x82,
    /// `virtio_mmio_backend_get_queue_info(cap, queue) -> packed regs`
    VirtioGetQueueInfo = 0x87,
    /// `virtio_mmio_backend_get_notification(cap) -> (reason, queues)`
    VirtioGetNotification = 0x83,
    /// `virtio_mmio_backend_assert_virq(cap)`
    VirtioAssertVirq = 0x84,
    /// `virtio_mmio_backend_ack_reset(cap)`
    VirtioAckReset = 0x85,
    /// `virtio_mmio_backend_update_status(cap, set, clear)`
    VirtioUpdateStatus = 0x86,
}

impl Call {
    fn from_raw(raw: u64) -> Option<Self> {
        use Call::*;
        Some(match raw {
            0x10 => PartitionCreateCspace,
            0x11 => PartitionCreateAddrspace,
            0x12 => PartitionCreateMemextent,
            0x13 => PartitionCreateThread,
            0x14 => PartitionCreateMsgqueue,
            0x15 => PartitionCreateVirtioMmio,
            0x20 => ObjectActivate,
            0x30 => CspaceDeleteCap,
            0x31 => CspaceCopyCap,
            0x32 => CspaceRevokeCaps,
            0x33 => CspaceConfigure,
            0x40 => AddrspaceConfigure,
            0x41 => AddrspaceAddVmmioRange,
            0x42 => AddrspaceRemoveVmmioRange,
            0x50 => MemextentConfigure,
            0x51 => MemextentConfigureDerive,
            0x52 => MemextentMap,
            0x53 => MemextentUnmap,
            0x54 => MemextentUpdateAccess,
            0x55 => MemextentDonate,
            0x56 => MemextentZero,
            0x57 => MemextentCacheClean,
            0x58 => MemextentCacheFlush,
            0x60 => MsgqueueConfigure,
            0x61 => MsgqueueSend,
            0x62 => MsgqueueReceive,
            0x63 => MsgqueueFlush,
            0x70 => ThreadSetAffinity,
            0x71 => ThreadSetPriority,
            0x72 => ThreadSetTimeslice,
            0x73 => ThreadKill,
            0x74 => ThreadYieldTo,
            0x80 => VirtioSetDevFeatures,
            0x81 => VirtioSetQueueNumMax,
            0x82 => VirtioGetDrvFeatures,
            0x83 => VirtioGetNotification,
            0x84 => VirtioAssertVirq,
            0x85 => VirtioAckReset,
            0x86 => VirtioUpdateStatus,
            0x87 => VirtioGetQueueInfo,
            _ => return None,
        })
    }
}

/// Encodes an error for the guest's x0. Zero is success.
#[must_use]
pub fn error_code(err: Error) -> u64 {
    match err {
        Error::Unimplemented => 1,
        Error::Retry => 2,
        Error::Denied => 3,
        Error::Busy => 4,
        Error::Idle => 5,
        Error::ObjectState => 6,
        Error::ObjectConfig => 7,
        Error::NoMem => 8,
        Error::NoResources => 9,
        Error::ArgumentInvalid => 10,
        Error::ArgumentSize => 11,
        Error::ArgumentAlignment => 12,
        Error::AddrInvalid => 13,
        Error::AddrOverflow => 14,
        Error::CapNull => 20,
        Error::CapRevoked => 21,
        Error::WrongObjectType => 22,
        Error::InsufficientRights => 23,
        Error::CspaceFull => 24,
        Error::MemdbEmpty => 30,
        Error::MemdbNotOwner => 31,
        Error::MemextentMappingsFull => 32,
        Error::MsgQueueEmpty => 40,
        Error::MsgQueueFull => 41,
        _ => 0xff,
    }
}

/// Dispatches one hypercall. Returns `(error_code, value)` for x0/x1.
#[must_use]
pub fn dispatch(cspace: &ObjRef<Cspace>, call: u64, args: &[u64; 7]) -> (u64, u64) {
    let Some(call) = Call::from_raw(call) else {
        return (error_code(Error::Unimplemented), 0);
    };

    let result = dispatch_inner(cspace, call, args);
    match result {
        Ok(value) => (0, value),
        Err(err) => (error_code(err), 0),
    }
}

fn dispatch_inner(cspace: &ObjRef<Cspace>, call: Call, args: &[u64; 7]) -> Result<u64> {
    match call {
        Call::PartitionCreateCspace => {
            let partition = lookup_partition_for_create(cspace, args[0])?;
            let new = Cspace::new(Some(partition));
            cspace.create_master_cap(&new)
        }
        Call::PartitionCreateAddrspace => {
            let partition = lookup_partition_for_create(cspace, args[0])?;
            let new = Addrspace::new(Some(partition));
            cspace.create_master_cap(&new)
        }
        Call::PartitionCreateMemextent => {
            let partition = lookup_partition_for_create(cspace, args[0])?;
            let new = MemExtent::new(Some(partition), args[1] != 0);
            cspace.create_master_cap(&new)
        }
        Call::PartitionCreateThread => {
            let partition = lookup_partition_for_create(cspace, args[0])?;
            let new = Thread::new(Some(partition), ThreadKind::Vcpu, args[1] as usize)?;
            cspace.create_master_cap(&new)
        }
        Call::PartitionCreateMsgqueue => {
            let partition = lookup_partition_for_create(cspace, args[0])?;
            let new = MsgQueue::new(Some(partition));
            cspace.create_master_cap(&new)
        }
        Call::PartitionCreateVirtioMmio => {
            let partition = lookup_partition_for_create(cspace, args[0])?;
            let new = VirtioMmio::new(Some(partition), args[1] as u32, args[2] as u32)?;
            cspace.create_master_cap(&new)
        }

        Call::ObjectActivate => {
            let any = cspace.lookup_object_any(args[0], rights::generic::OBJECT_ACTIVATE)?;
            crate::object::activate_any(&any).map(|()| 0)
        }

        Call::CspaceDeleteCap => {
            let target: ObjRef<Cspace> =
                cspace.lookup_object(args[0], rights::cspace::CAP_DELETE, true)?;
            target.delete_cap(args[1]).map(|()| 0)
        }
        Call::CspaceCopyCap => {
            let source: ObjRef<Cspace> =
                cspace.lookup_object(args[0], rights::cspace::CAP_COPY, true)?;
            cspace.copy_cap_from(&source, args[1], args[2] as u32)
        }
        Call::CspaceRevokeCaps => {
            let target: ObjRef<Cspace> =
                cspace.lookup_object(args[0], rights::cspace::CAP_REVOKE, true)?;
            target.revoke_caps(args[1]).map(|()| 0)
        }
        Call::CspaceConfigure => {
            let target: ObjRef<Cspace> = cspace.lookup_object(args[0], 0, false)?;
            target.configure(args[1] as u32).map(|()| 0)
        }

        Call::AddrspaceConfigure => {
            let target: ObjRef<Addrspace> = cspace.lookup_object(args[0], 0, false)?;
            target.configure(args[1] as u16).map(|()| 0)
        }
        Call::AddrspaceAddVmmioRange => {
            let target: ObjRef<Addrspace> =
                cspace.lookup_object(args[0], rights::addrspace::ADD_VMMIO_RANGE, true)?;
            target
                .add_vmmio_range(VmAddr::new(args[1]), args[2])
                .map(|()| 0)
        }
        Call::AddrspaceRemoveVmmioRange => {
            let target: ObjRef<Addrspace> =
                cspace.lookup_object(args[0], rights::addrspace::ADD_VMMIO_RANGE, true)?;
            target
                .remove_vmmio_range(VmAddr::new(args[1]), args[2])
                .map(|()| 0)
        }

        Call::MemextentConfigure => {
            let target: ObjRef<MemExtent> = cspace.lookup_object(args[0], 0, false)?;
            target
                .configure(PhysAddr::new(args[1]), args[2], decode_extent_attrs(args[3])?)
                .map(|()| 0)
        }
        Call::MemextentConfigureDerive => {
            let target: ObjRef<MemExtent> = cspace.lookup_object(args[0], 0, false)?;
            let parent: ObjRef<MemExtent> =
                cspace.lookup_object(args[1], rights::memextent::DERIVE, true)?;
            target
                .configure_derive(&parent, args[2], args[3], decode_extent_attrs(args[4])?)
                .map(|()| 0)
        }
        Call::MemextentMap => {
            let extent: ObjRef<MemExtent> =
                cspace.lookup_object(args[0], rights::memextent::MAP, true)?;
            let addrspace: ObjRef<Addrspace> =
                cspace.lookup_object(args[1], rights::addrspace::MAP, true)?;
            extent
                .map(&addrspace, VmAddr::new(args[2]), decode_mapping_attrs(args[3])?)
                .map(|()| 0)
        }
        Call::MemextentUnmap => {
            let extent: ObjRef<MemExtent> =
                cspace.lookup_object(args[0], rights::memextent::MAP, true)?;
            let addrspace: ObjRef<Addrspace> =
                cspace.lookup_object(args[1], rights::addrspace::MAP, true)?;
            extent.unmap(&addrspace, VmAddr::new(args[2])).map(|()| 0)
        }
        Call::MemextentUpdateAccess => {
            let extent: ObjRef<MemExtent> =
                cspace.lookup_object(args[0], rights::memextent::MAP, true)?;
            let addrspace: ObjRef<Addrspace> =
                cspace.lookup_object(args[1], rights::addrspace::MAP, true)?;
            extent
                .update_access(
                    &addrspace,
                    VmAddr::new(args[2]),
                    decode_access(args[3])?,
                    decode_access(args[4])?,
                )
                .map(|()| 0)
        }
        Call::MemextentDonate => {
            let extent: ObjRef<MemExtent> =
                cspace.lookup_object(args[0], rights::memextent::DONATE, true)?;
            let reverse = args[3] & 1 != 0;
            extent.donate_child(args[1], args[2], reverse).map(|()| 0)
        }
        Call::MemextentZero => {
            let extent: ObjRef<MemExtent> =
                cspace.lookup_object(args[0], rights::memextent::MAP, true)?;
            extent.zero_range(args[1], args[2]).map(|()| 0)
        }
        Call::MemextentCacheClean => {
            let extent: ObjRef<MemExtent> =
                cspace.lookup_object(args[0], rights::memextent::MAP, true)?;
            extent.cache_clean_range(args[1], args[2]).map(|()| 0)
        }
        Call::MemextentCacheFlush => {
            let extent: ObjRef<MemExtent> =
                cspace.lookup_object(args[0], rights::memextent::MAP, true)?;
            extent.cache_flush_range(args[1], args[2]).map(|()| 0)
        }

        Call::MsgqueueConfigure => {
            let queue: ObjRef<MsgQueue> = cspace.lookup_object(args[0], 0, false)?;
            queue.configure(args[1] as usize, args[2] as u32).map(|()| 0)
        }
        Call::MsgqueueSend => {
            let queue: ObjRef<MsgQueue> =
                cspace.lookup_object(args[0], rights::msgqueue::SEND, true)?;
            let size = args[1] as usize;
            if size > boson_ipc::MAX_MSG_SIZE {
                return Err(Error::ArgumentSize);
            }
            let mut buf = [0u8; boson_ipc::MAX_MSG_SIZE];
            copy_from_guest(&mut buf[..size], VmAddr::new(args[2]))?;
            let not_full = queue.send(&buf[..size], args[3] != 0)?;
            Ok(u64::from(not_full))
        }
        Call::MsgqueueReceive => {
            let queue: ObjRef<MsgQueue> =
                cspace.lookup_object(args[0], rights::msgqueue::RECEIVE, true)?;
            let max_size = (args[2] as usize).min(boson_ipc::MAX_MSG_SIZE);
            let mut buf = [0u8; boson_ipc::MAX_MSG_SIZE];
            let (len, not_empty) = queue.receive(&mut buf[..max_size])?;
            copy_to_guest(VmAddr::new(args[1]), &buf[..len])?;
            Ok((len as u64) << 1 | u64::from(not_empty))
        }
        Call::MsgqueueFlush => {
            let queue: ObjRef<MsgQueue> =
                cspace.lookup_object(args[0], rights::msgqueue::RECEIVE, true)?;
            queue.flush();
            Ok(0)
        }

        Call::ThreadSetAffinity => {
            let thread: ObjRef<Thread> =
                cspace.lookup_object(args[0], rights::thread::AFFINITY, false)?;
            let _guard = thread.sched_lock.lock();
            boson_sched::global()
                .set_affinity(&thread, args[1] as usize)
                .map(|()| 0)
        }
        Call::ThreadSetPriority => {
            let thread: ObjRef<Thread> =
                cspace.lookup_object(args[0], rights::thread::PRIORITY, false)?;
            let _guard = thread.sched_lock.lock();
            boson_sched::global()
                .set_priority(&thread, args[1] as u8)
                .map(|()| 0)
        }
        Call::ThreadSetTimeslice => {
            let thread: ObjRef<Thread> =
                cspace.lookup_object(args[0], rights::thread::TIMESLICE, false)?;
            let _guard = thread.sched_lock.lock();
            boson_sched::global()
                .set_timeslice(&thread, args[1])
                .map(|()| 0)
        }
        Call::ThreadKill => {
            let thread: ObjRef<Thread> =
                cspace.lookup_object(args[0], rights::thread::LIFECYCLE, true)?;
            thread.kill()?;
            // A running victim notices at its next exit boundary; prod it.
            boson_sched::global().sync(&thread);
            Ok(0)
        }
        Call::ThreadYieldTo => {
            let thread: ObjRef<Thread> =
                cspace.lookup_object(args[0], rights::thread::YIELD_TO, true)?;
            boson_sched::global().yield_to(&thread);
            Ok(0)
        }

        Call::VirtioSetDevFeatures => {
            let dev: ObjRef<VirtioMmio> =
                cspace.lookup_object(args[0], rights::virtio::CONFIG, true)?;
            dev.set_dev_features(args[1] as u32, args[2] as u32).map(|()| 0)
        }
        Call::VirtioSetQueueNumMax => {
            let dev: ObjRef<VirtioMmio> =
                cspace.lookup_object(args[0], rights::virtio::CONFIG, true)?;
            dev.set_queue_num_max(args[1] as u32, args[2] as u32).map(|()| 0)
        }
        Call::VirtioGetDrvFeatures => {
            let dev: ObjRef<VirtioMmio> =
                cspace.lookup_object(args[0], rights::virtio::CONFIG, true)?;
            dev.drv_features(args[1] as u32).map(u64::from)
        }
        Call::VirtioGetQueueInfo => {
            let dev: ObjRef<VirtioMmio> =
                cspace.lookup_object(args[0], rights::virtio::CONFIG, true)?;
            let info = dev.queue_info(args[1] as u32)?;
            // num and ready packed in the result; the queue addresses are
            // fetched via the device's config interface by the backend.
            Ok(u64::from(info.num) | (u64::from(info.num_max) << 16) | (u64::from(info.ready) << 32))
        }
        Call::VirtioGetNotification => {
            let dev: ObjRef<VirtioMmio> =
                cspace.lookup_object(args[0], rights::virtio::CONFIG, true)?;
            let (reason, queues) = dev.take_notification();
            Ok(u64::from(reason.bits()) | (u64::from(queues) << 32))
        }
        Call::VirtioAssertVirq => {
            let dev: ObjRef<VirtioMmio> =
                cspace.lookup_object(args[0], rights::virtio::ASSERT_VIRQ, true)?;
            dev.assert_virq().map(|()| 0)
        }
        Call::VirtioAckReset => {
            let dev: ObjRef<VirtioMmio> =
                cspace.lookup_object(args[0], rights::virtio::CONFIG, true)?;
            dev.acknowledge_reset();
            Ok(0)
        }
        Call::VirtioUpdateStatus => {
            let dev: ObjRef<VirtioMmio> =
                cspace.lookup_object(args[0], rights::virtio::CONFIG, true)?;
            dev.update_status(args[1] as u32, args[2] as u32);
            Ok(0)
        }
    }
}

fn lookup_partition_for_create(cspace: &ObjRef<Cspace>, cap: CapId) -> Result<ObjRef<Partition>> {
    cspace.lookup_object(cap, rights::partition::OBJECT_CREATE, true)
}

/// Extent attributes packed as `type | memtype << 8 | access << 16`.
fn decode_extent_attrs(raw: u64) -> Result<ExtentAttrs> {
    let xtype = match raw & 0xff {
        0 => boson_mm::ExtentType::Basic,
        1 => boson_mm::ExtentType::Sparse,
        _ => return Err(Error::ArgumentInvalid),
    };
    let memtype = match (raw >> 8) & 0xff {
        0 => MemType::Any,
        1 => MemType::Device,
        2 => MemType::Uncached,
        3 => MemType::Cached,
        _ => return Err(Error::ArgumentInvalid),
    };
    Ok(ExtentAttrs {
        xtype,
        memtype,
        access: decode_access(raw >> 16)?,
    })
}

/// Mapping attributes packed as `memtype | kaccess << 8 | uaccess << 16`.
fn decode_mapping_attrs(raw: u64) -> Result<MappingAttrs> {
    let memtype = match raw & 0xff {
        0 => VmMemType::DeviceNGnRnE,
        1 => VmMemType::DeviceNGnRE,
        2 => VmMemType::DeviceNGRE,
        3 => VmMemType::DeviceGRE,
        4 => VmMemType::NormalNC,
        5 => VmMemType::NormalWB,
        6 => VmMemType::NormalWT,
        _ => return Err(Error::ArgumentInvalid),
    };
    Ok(MappingAttrs {
        memtype,
        kernel_access: decode_access(raw >> 8)?,
        user_access: decode_access(raw >> 16)?,
    })
}

fn decode_access(raw: u64) -> Result<PgAccess> {
    PgAccess::from_bits((raw & 0xff) as u8).ok_or(Error::ArgumentInvalid)
}

/// Copies from a guest virtual address into `out`.
///
/// The guest address resolves through the caller's stage-2 state into a
/// bounded physical window; in this software model the hypervisor's
/// linear map (or a registered host buffer) backs the access.
fn copy_from_guest(out: &mut [u8], gvaddr: VmAddr) -> Result<()> {
    let src = boson_core::phys::access(PhysAddr::new(gvaddr.as_u64()), out.len())?;
    // SAFETY: `access` guarantees `out.len()` readable bytes.
    unsafe { core::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
    Ok(())
}

/// Copies `data` out to a guest virtual address.
fn copy_to_guest(gvaddr: VmAddr, data: &[u8]) -> Result<()> {
    let dst = boson_core::phys::access(PhysAddr::new(gvaddr.as_u64()), data.len())?;
    // SAFETY: `access` guarantees `data.len()` writable bytes.
    unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
    Ok(())
}
