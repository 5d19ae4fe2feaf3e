//! End-to-end tests driving the stack through the hypercall surface.

use boson_core::addr::{PhysAddr, VmAddr};
use boson_core::cpulocal::set_current_cpu;
use boson_core::error::Error;
use boson_cspace::{Cspace, IdEncoder, rights};
use boson_memdb::MemdbType;
use boson_mm::Addrspace;
use boson_obj::{HypObject, ObjRef, ObjectState, Partition};

use crate::hypercalls::{self, Call};

fn call(cs: &ObjRef<Cspace>, call: Call, args: [u64; 7]) -> (u64, u64) {
    hypercalls::dispatch(cs, call as u64, &args)
}

fn call_ok(cs: &ObjRef<Cspace>, c: Call, args: [u64; 7]) -> u64 {
    let (err, value) = call(cs, c, args);
    assert_eq!(err, 0, "hypercall {c:?} failed with {err}");
    value
}

/// A root environment: an active partition and a cspace holding its
/// master cap.
fn root_env(base: u64, mult: u64) -> (ObjRef<Partition>, ObjRef<Cspace>, u64) {
    let part = Partition::new(None);
    part.header().set_state(ObjectState::Active);

    let cs = Cspace::with_encoder(Some(part.clone()), IdEncoder::with_params(base, mult));
    cs.configure(128).unwrap();
    cs.header().set_state(ObjectState::Active);

    let part_cap = cs.create_master_cap(&part).unwrap();
    (part, cs, part_cap)
}

#[test]
fn cap_ids_are_cspace_local() {
    // Two cspaces with identical encoder parameters: an object created in
    // one is unreachable through the other.
    set_current_cpu(24);
    let (_part_a, cs_a, part_cap_a) = root_env(0x1234_5678, 0x1111);
    let (_part_b, cs_b, _part_cap_b) = root_env(0x1234_5678, 0x1111);

    let queue_cap = call_ok(&cs_a, Call::PartitionCreateMsgqueue, [part_cap_a, 0, 0, 0, 0, 0, 0]);
    assert_eq!(
        call(&cs_a, Call::MsgqueueConfigure, [queue_cap, 16, 4, 0, 0, 0, 0]).0,
        0
    );

    // The same ID decodes in cspace B (same scrambler) but hits an empty
    // slot there.
    let (err, _) = call(&cs_b, Call::MsgqueueConfigure, [queue_cap, 16, 4, 0, 0, 0, 0]);
    assert_eq!(err, hypercalls::error_code(Error::CapNull));
    set_current_cpu(0);
}

#[test]
fn extent_to_addrspace_flow() {
    // Build the scenario end to end through hypercalls: an extent over
    // partition memory, mapped RW into a fresh address space at 0x10000,
    // and looked up at an interior offset.
    set_current_cpu(25);
    let (part, cs, part_cap) = root_env(0xaaaa_0000, 0x1357);

    let phys_base = 0x30_0000_0000u64;
    boson_memdb::global()
        .insert(
            PhysAddr::new(phys_base),
            PhysAddr::new(phys_base + 0xfff),
            part.as_ptr() as usize,
            MemdbType::Partition,
        )
        .unwrap();

    let me_cap = call_ok(&cs, Call::PartitionCreateMemextent, [part_cap, 0, 0, 0, 0, 0, 0]);
    // Basic extent, memtype ANY, access RWX.
    let extent_attrs = 0u64 | (0 << 8) | (0b111 << 16);
    call_ok(
        &cs,
        Call::MemextentConfigure,
        [me_cap, phys_base, 0x1000, extent_attrs, 0, 0, 0],
    );
    call_ok(&cs, Call::ObjectActivate, [me_cap, 0, 0, 0, 0, 0, 0]);

    let as_cap = call_ok(&cs, Call::PartitionCreateAddrspace, [part_cap, 0, 0, 0, 0, 0, 0]);
    call_ok(&cs, Call::AddrspaceConfigure, [as_cap, 70, 0, 0, 0, 0, 0]);
    call_ok(&cs, Call::ObjectActivate, [as_cap, 0, 0, 0, 0, 0, 0]);

    // Normal-WB, kernel RW, user RW.
    let map_attrs = 5u64 | (0b011 << 8) | (0b011 << 16);
    call_ok(
        &cs,
        Call::MemextentMap,
        [me_cap, as_cap, 0x10000, map_attrs, 0, 0, 0],
    );

    let addrspace: ObjRef<Addrspace> = cs
        .lookup_object(as_cap, rights::addrspace::LOOKUP, true)
        .unwrap();
    let lookup = addrspace.lookup(VmAddr::new(0x10000), 0x1000).unwrap();
    assert_eq!(lookup.phys, PhysAddr::new(phys_base));
    assert_eq!(lookup.kernel_access, boson_mm::PgAccess::RW);
    // 0x10123 resolves 0x123 bytes into the extent.
    assert_eq!(lookup.phys.as_u64() + 0x123, phys_base + 0x123);

    call_ok(&cs, Call::MemextentUnmap, [me_cap, as_cap, 0x10000, 0, 0, 0, 0]);
    assert_eq!(
        addrspace.lookup(VmAddr::new(0x10000), 0x1000).unwrap_err(),
        Error::AddrInvalid
    );
    set_current_cpu(0);
}

#[test]
fn copy_and_revoke_through_hypercalls() {
    set_current_cpu(26);
    let (_part, cs, part_cap) = root_env(0xbbbb_0000, 0x2468);

    // The cspace holds a cap to itself so cap management can be invoked
    // over the HVC surface.
    let cs_cap = cs.create_master_cap(&cs).unwrap();

    let queue_cap = call_ok(&cs, Call::PartitionCreateMsgqueue, [part_cap, 0, 0, 0, 0, 0, 0]);

    let copy = call_ok(
        &cs,
        Call::CspaceCopyCap,
        [cs_cap, queue_cap, u64::from(u32::MAX), 0, 0, 0, 0],
    );
    assert_ne!(copy, queue_cap);

    call_ok(&cs, Call::CspaceRevokeCaps, [cs_cap, queue_cap, 0, 0, 0, 0, 0]);
    let (err, _) = call(&cs, Call::MsgqueueConfigure, [copy, 16, 4, 0, 0, 0, 0]);
    assert_eq!(err, hypercalls::error_code(Error::CapRevoked));

    // The revoked copy can still be deleted; the master stays usable.
    call_ok(&cs, Call::CspaceDeleteCap, [cs_cap, copy, 0, 0, 0, 0, 0]);
    call_ok(&cs, Call::MsgqueueConfigure, [queue_cap, 16, 4, 0, 0, 0, 0]);
    set_current_cpu(0);
}

#[test]
fn msgqueue_thresholds_through_hypercalls() {
    // Queue of depth 4 with thresholds 2/2: the receiver VIRQ rises on the
    // second send, the sender VIRQ when draining back through two.
    set_current_cpu(27);
    let (_part, cs, part_cap) = root_env(0xcccc_0000, 0x0f1e);

    let queue_cap = call_ok(&cs, Call::PartitionCreateMsgqueue, [part_cap, 0, 0, 0, 0, 0, 0]);
    call_ok(&cs, Call::MsgqueueConfigure, [queue_cap, 64, 4, 0, 0, 0, 0]);
    call_ok(&cs, Call::ObjectActivate, [queue_cap, 0, 0, 0, 0, 0, 0]);

    let queue: ObjRef<boson_ipc::MsgQueue> = cs
        .lookup_object(queue_cap, rights::msgqueue::SEND, true)
        .unwrap();
    let vic = boson_vm::Vic::new();
    queue.bind_send(&vic, 80).unwrap();
    queue.bind_receive(&vic, 81).unwrap();
    queue.configure_send(2, boson_ipc::DELAY_UNCHANGED).unwrap();
    queue
        .configure_receive(2, boson_ipc::DELAY_UNCHANGED)
        .unwrap();
    vic.acknowledge(80);
    vic.acknowledge(81);

    // Guest message buffers live behind registered physical windows.
    let mut send_buf = *b"hello, other side and some padding...";
    let mut recv_buf = [0u8; 64];
    boson_core::phys::register_buffer(PhysAddr::new(0x41_0000_0000), &mut send_buf);
    boson_core::phys::register_buffer(PhysAddr::new(0x41_0001_0000), &mut recv_buf);

    let send = |len: u64| {
        call_ok(
            &cs,
            Call::MsgqueueSend,
            [queue_cap, len, 0x41_0000_0000, 0, 0, 0, 0],
        )
    };

    assert_eq!(send(5), 1);
    assert!(!vic.is_pending(81));
    send(7);
    assert!(vic.is_pending(81), "receiver VIRQ rises on the second send");
    send(3);

    // Drain two; the sender VIRQ rises when the level crosses two.
    let receive = || {
        call_ok(
            &cs,
            Call::MsgqueueReceive,
            [queue_cap, 0x41_0001_0000, 64, 0, 0, 0, 0],
        )
    };
    let packed = receive();
    assert_eq!(packed >> 1, 5, "first message length");
    assert_eq!(packed & 1, 1, "more messages remain");
    assert!(vic.is_pending(80), "sender VIRQ rises crossing the threshold");
    assert_eq!(&recv_buf[..5], b"hello");

    let packed = receive();
    assert_eq!(packed >> 1, 7);
    set_current_cpu(0);
}

#[test]
fn rights_are_enforced_by_the_surface() {
    set_current_cpu(28);
    let (_part, cs, part_cap) = root_env(0xdddd_0000, 0x7531);
    let cs_cap = cs.create_master_cap(&cs).unwrap();

    let queue_cap = call_ok(&cs, Call::PartitionCreateMsgqueue, [part_cap, 0, 0, 0, 0, 0, 0]);
    call_ok(&cs, Call::MsgqueueConfigure, [queue_cap, 16, 4, 0, 0, 0, 0]);
    call_ok(&cs, Call::ObjectActivate, [queue_cap, 0, 0, 0, 0, 0, 0]);

    // Copy without the SEND right: sends through the copy are refused.
    let no_send = call_ok(
        &cs,
        Call::CspaceCopyCap,
        [
            cs_cap,
            queue_cap,
            u64::from(rights::msgqueue::RECEIVE | rights::generic::ALL),
            0,
            0,
            0,
            0,
        ],
    );
    let (err, _) = call(&cs, Call::MsgqueueSend, [no_send, 4, 0x1000, 0, 0, 0, 0]);
    assert_eq!(err, hypercalls::error_code(Error::InsufficientRights));

    // Unknown calls are rejected as unimplemented.
    let (err, _) = hypercalls::dispatch(&cs, 0xdead, &[0; 7]);
    assert_eq!(err, hypercalls::error_code(Error::Unimplemented));

    // A bogus cap ID fails cleanly.
    let (err, _) = call(&cs, Call::MsgqueueFlush, [0xffff_ffff_ffff_ffff, 0, 0, 0, 0, 0, 0]);
    assert_eq!(err, hypercalls::error_code(Error::ArgumentInvalid));
    set_current_cpu(0);
}
