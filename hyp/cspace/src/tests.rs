use super::*;

use boson_core::cpulocal::set_current_cpu;
use boson_obj::{ObjectState, Partition};

/// A minimal capability-addressable object for cap tests.
struct Widget {
    header: ObjectHeader,
    serial: u32,
}

impl core::fmt::Debug for Widget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Widget").field("serial", &self.serial).finish()
    }
}

impl HypObject for Widget {
    const TYPE: ObjectType = ObjectType::MsgQueue;

    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

fn widget(serial: u32) -> ObjRef<Widget> {
    let w = ObjRef::new(Widget {
        header: ObjectHeader::new(ObjectType::MsgQueue, None),
        serial,
    });
    w.header().set_state(ObjectState::Active);
    w
}

fn new_cspace(base: u64, mult: u64) -> ObjRef<Cspace> {
    let cs = Cspace::with_encoder(
        Some(Partition::new(None)),
        IdEncoder::with_params(base, mult),
    );
    cs.configure(256).unwrap();
    cs.activate_check().unwrap();
    cs.header().set_state(ObjectState::Active);
    cs
}

#[test]
fn lookup_succeeds_only_in_owning_cspace() {
    // Two cspaces with the same encoder parameters: an ID minted by one
    // must still be null in the other.
    set_current_cpu(20);
    let cs_a = new_cspace(0x1234_5678, 0x1111);
    let cs_b = new_cspace(0x1234_5678, 0x1111);

    let obj = widget(7);
    let id = cs_a.create_master_cap(&obj).unwrap();

    let found = cs_a
        .lookup_object::<Widget>(id, rights::msgqueue::ALL, false)
        .unwrap();
    assert_eq!(found.serial, 7);
    assert_eq!(found.as_ptr(), obj.as_ptr());

    assert_eq!(
        cs_b.lookup_object::<Widget>(id, 0, false).unwrap_err(),
        Error::CapNull
    );
    set_current_cpu(0);
}

#[test]
fn lookup_validates_type_rights_and_state() {
    set_current_cpu(20);
    let cs = new_cspace(0xaa55_1234, 0x2b2b);
    let obj = widget(1);
    let id = cs.create_master_cap(&obj).unwrap();

    // Wrong type.
    struct Other {
        header: ObjectHeader,
    }
    impl core::fmt::Debug for Other {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.debug_struct("Other").finish()
        }
    }
    impl HypObject for Other {
        const TYPE: ObjectType = ObjectType::Addrspace;
        fn header(&self) -> &ObjectHeader {
            &self.header
        }
    }
    assert_eq!(
        cs.lookup_object::<Other>(id, 0, false).unwrap_err(),
        Error::WrongObjectType
    );

    // Missing rights: copy with a narrow mask, then demand more.
    let narrow = cs
        .copy_cap_from(&cs, id, rights::msgqueue::SEND)
        .unwrap();
    assert_eq!(
        cs.lookup_object::<Widget>(narrow, rights::msgqueue::RECEIVE, false)
            .unwrap_err(),
        Error::InsufficientRights
    );

    // Inactive object with active_only.
    obj.header().set_state(ObjectState::Init);
    assert_eq!(
        cs.lookup_object::<Widget>(id, 0, true).unwrap_err(),
        Error::ObjectState
    );
    obj.header().set_state(ObjectState::Active);
    assert!(cs.lookup_object::<Widget>(id, 0, true).is_ok());
    set_current_cpu(0);
}

#[test]
fn copy_narrows_rights_and_clears_master() {
    set_current_cpu(21);
    let cs_a = new_cspace(0x1111_0000, 0x0f0f);
    let cs_b = new_cspace(0x2222_0000, 0x0f0f);
    let obj = widget(2);

    let master = cs_a.create_master_cap(&obj).unwrap();
    let copy = cs_b
        .copy_cap_from(&cs_a, master, rights::msgqueue::SEND)
        .unwrap();

    // The copy works in its own cspace with the narrowed rights.
    assert!(
        cs_b.lookup_object::<Widget>(copy, rights::msgqueue::SEND, false)
            .is_ok()
    );
    // A copy of the copy cannot regain rights.
    let recopy = cs_a
        .copy_cap_from(&cs_b, copy, rights::msgqueue::ALL)
        .unwrap();
    assert_eq!(
        cs_a.lookup_object::<Widget>(recopy, rights::msgqueue::RECEIVE, false)
            .unwrap_err(),
        Error::InsufficientRights
    );
    // Zero surviving rights refuse the copy outright.
    assert_eq!(
        cs_a.copy_cap_from(&cs_b, copy, rights::msgqueue::RECEIVE)
            .unwrap_err(),
        Error::InsufficientRights
    );
    set_current_cpu(0);
}

#[test]
fn revoke_invalidates_children_everywhere() {
    set_current_cpu(22);
    let cs_a = new_cspace(0x3333_0000, 0x1357);
    let cs_b = new_cspace(0x4444_0000, 0x1357);
    let obj = widget(3);

    let master = cs_a.create_master_cap(&obj).unwrap();
    let child_a = cs_a.copy_cap_from(&cs_a, master, rights::msgqueue::ALL).unwrap();
    let child_b = cs_b.copy_cap_from(&cs_a, master, rights::msgqueue::ALL).unwrap();
    let grandchild = cs_b.copy_cap_from(&cs_b, child_b, rights::msgqueue::SEND).unwrap();

    cs_a.revoke_caps(master).unwrap();

    // Every non-master cap reports revoked, in both cspaces.
    for (cs, id) in [(&cs_a, child_a), (&cs_b, child_b), (&cs_b, grandchild)] {
        assert_eq!(
            cs.lookup_object::<Widget>(id, 0, false).unwrap_err(),
            Error::CapRevoked
        );
    }
    // The master cap is untouched.
    assert!(cs_a.lookup_object::<Widget>(master, 0, false).is_ok());

    // Revoked caps can still be deleted, freeing their slots.
    cs_a.delete_cap(child_a).unwrap();
    cs_b.delete_cap(child_b).unwrap();
    cs_b.delete_cap(grandchild).unwrap();
    assert_eq!(cs_a.cap_count(), 1);
    assert_eq!(cs_b.cap_count(), 0);

    // Revoking with a non-master cap is refused.
    let child = cs_a.copy_cap_from(&cs_a, master, rights::msgqueue::ALL).unwrap();
    assert_eq!(cs_a.revoke_caps(child).unwrap_err(), Error::InsufficientRights);
    set_current_cpu(0);
}

#[test]
fn delete_releases_object_on_last_cap() {
    set_current_cpu(23);
    let cs = new_cspace(0x5555_0000, 0x4242);
    let obj = widget(4);
    let raw = obj.as_ptr();

    let master = cs.create_master_cap(&obj).unwrap();
    let copy = cs.copy_cap_from(&cs, master, rights::msgqueue::ALL).unwrap();

    // Drop our handle; the cap list keeps the object alive.
    drop(obj);
    boson_rcu::read_start();
    // SAFETY: raw was live when the caps were created; read section.
    assert!(unsafe { ObjRef::<Widget>::get_safe(raw) }.is_some());
    boson_rcu::read_finish();

    cs.delete_cap(copy).unwrap();
    boson_rcu::read_start();
    // SAFETY: As above.
    assert!(unsafe { ObjRef::<Widget>::get_safe(raw) }.is_some());

    cs.delete_cap(master).unwrap();
    // The last cap released the object's reference.
    // SAFETY: Still inside the read section, so the memory is examinable.
    assert!(unsafe { ObjRef::<Widget>::get_safe(raw) }.is_none());
    boson_rcu::read_finish();

    assert_eq!(cs.delete_cap(master).unwrap_err(), Error::CapNull);
    set_current_cpu(0);
}

#[test]
fn lookup_any_returns_runtime_type() {
    set_current_cpu(23);
    let cs = new_cspace(0x6666_0000, 0x6666);
    let obj = widget(5);
    let id = cs.create_master_cap(&obj).unwrap();

    let any = cs.lookup_object_any(id, 0).unwrap();
    assert_eq!(any.object_type(), ObjectType::MsgQueue);
    let typed = any.downcast::<Widget>().ok().unwrap();
    assert_eq!(typed.serial, 5);
    set_current_cpu(0);
}

#[test]
fn capacity_limit_is_enforced() {
    set_current_cpu(24);
    let cs = Cspace::with_encoder(
        Some(Partition::new(None)),
        IdEncoder::with_params(0x7777, 0x1111),
    );
    cs.configure(2).unwrap();
    cs.header().set_state(ObjectState::Active);

    let a = widget(10);
    let b = widget(11);
    let c = widget(12);
    let _ida = cs.create_master_cap(&a).unwrap();
    let _idb = cs.create_master_cap(&b).unwrap();
    assert_eq!(cs.create_master_cap(&c).unwrap_err(), Error::CspaceFull);

    // Unconfigured cspaces hold no caps at all.
    let empty = Cspace::with_encoder(None, IdEncoder::with_params(1, 1));
    assert_eq!(empty.activate_check().unwrap_err(), Error::ObjectConfig);
    assert_eq!(empty.create_master_cap(&c).unwrap_err(), Error::CspaceFull);
    set_current_cpu(0);
}

#[test]
fn slots_spill_into_second_table() {
    set_current_cpu(24);
    let cs = new_cspace(0x8888_0000, 0x0101);

    // Fill more than one table's worth of caps and look them all up.
    let objs: Vec<_> = (0..(CAP_SLOTS_PER_TABLE as u32 + 8)).map(widget).collect();
    let ids: Vec<_> = objs
        .iter()
        .map(|o| cs.create_master_cap(o).unwrap())
        .collect();

    for (obj, id) in objs.iter().zip(&ids) {
        let found = cs.lookup_object::<Widget>(*id, 0, false).unwrap();
        assert_eq!(found.serial, obj.serial);
    }

    // Delete everything; the empty tables are retired through RCU.
    for id in ids {
        cs.delete_cap(id).unwrap();
    }
    assert_eq!(cs.cap_count(), 0);
    for _ in 0..8 {
        boson_rcu::global().pump_current_cpu();
    }
    set_current_cpu(0);
}
