use super::*;

use boson_core::cpulocal::set_current_cpu;
use boson_core::error::Error;
use boson_core::ipi::{self, IpiReason};
use boson_core::sync::preempt;
use boson_core::time;
use boson_obj::{HypObject, ObjRef, ObjectState, Partition};

fn setup(cpu: usize) -> (SchedState, ObjRef<Partition>) {
    set_current_cpu(cpu);
    let sched = SchedState::new();
    let part = Partition::new(None);
    part.header().set_state(ObjectState::Active);
    sched.init_cpu(Some(part.clone())).unwrap();
    (sched, part)
}

fn vcpu(sched: &SchedState, part: &ObjRef<Partition>, priority: u8, cpu: usize) -> ObjRef<Thread> {
    let t = Thread::new(Some(part.clone()), ThreadKind::Vcpu, 0).unwrap();
    {
        let _guard = t.sched_lock.lock();
        sched.set_affinity(&t, cpu).unwrap();
        sched.set_priority(&t, priority).unwrap();
    }
    t
}

fn block(sched: &SchedState, t: &ObjRef<Thread>, reason: BlockReason) {
    let _guard = t.sched_lock.lock();
    sched.block(t, reason);
}

fn unblock(sched: &SchedState, t: &ObjRef<Thread>, reason: BlockReason) -> bool {
    let _guard = t.sched_lock.lock();
    sched.unblock(t, reason)
}

fn is_current(sched: &SchedState, t: &ObjRef<Thread>) -> bool {
    core::ptr::eq(sched.current().as_ptr(), t.as_ptr())
}

#[test]
fn cpu_starts_on_idle() {
    let (sched, _part) = setup(0);
    let idle = sched.idle_thread(0);
    assert!(is_current(&sched, &idle));
    assert_eq!(idle.kind(), ThreadKind::Idle);
    // With nothing runnable, a scheduler pass stays on idle.
    assert!(!sched.schedule());
    assert!(is_current(&sched, &idle));
}

#[test]
fn higher_priority_unblock_preempts() {
    // Two VCPUs at priorities 10 and 20 pinned to one CPU; the priority-10
    // one starts first, and the moment the priority-20 one unblocks, the
    // next scheduler pass must switch to it.
    let (sched, part) = setup(1);
    let t10 = vcpu(&sched, &part, 10, 1);
    let t20 = vcpu(&sched, &part, 20, 1);

    block(&sched, &t20, BlockReason::VcpuOff);
    sched.activate_thread(&t10).unwrap();
    sched.activate_thread(&t20).unwrap();

    sched.schedule();
    assert!(is_current(&sched, &t10));

    let need = unblock(&sched, &t20, BlockReason::VcpuOff);
    assert!(need, "a higher-priority runnable thread must force a pass");
    sched.schedule();
    assert!(is_current(&sched, &t20));

    // The lower-priority thread went back to the queue, not away.
    block(&sched, &t20, BlockReason::VcpuOff);
    sched.schedule();
    assert!(is_current(&sched, &t10));
}

#[test]
fn lower_priority_unblock_does_not_preempt() {
    let (sched, part) = setup(2);
    let hi = vcpu(&sched, &part, 40, 2);
    let lo = vcpu(&sched, &part, 8, 2);

    block(&sched, &lo, BlockReason::VcpuOff);
    sched.activate_thread(&hi).unwrap();
    sched.activate_thread(&lo).unwrap();
    sched.schedule();
    assert!(is_current(&sched, &hi));

    let need = unblock(&sched, &lo, BlockReason::VcpuOff);
    assert!(!need);
    sched.schedule();
    assert!(is_current(&sched, &hi));
}

#[test]
fn equal_priority_rotates_on_timeslice_expiry() {
    let (sched, part) = setup(3);
    let a = vcpu(&sched, &part, 30, 3);
    let b = vcpu(&sched, &part, 30, 3);

    sched.activate_thread(&a).unwrap();
    sched.activate_thread(&b).unwrap();
    sched.schedule();
    assert!(is_current(&sched, &a));

    // Timeslice remaining: stays put.
    sched.schedule();
    assert!(is_current(&sched, &a));

    // A reschedule timeout is armed while an equal-priority thread waits.
    assert!(sched.timeout_for(3).is_some());

    // Burn through the timeslice: the next pass rotates to b.
    time::advance_ticks(time::ns_to_ticks(scheduler::DEFAULT_TIMESLICE_NS) + 1);
    sched.schedule();
    assert!(is_current(&sched, &b));

    time::advance_ticks(time::ns_to_ticks(scheduler::DEFAULT_TIMESLICE_NS) + 1);
    sched.schedule();
    assert!(is_current(&sched, &a));
}

#[test]
fn yield_zeroes_timeslice_and_rotates() {
    let (sched, part) = setup(4);
    let a = vcpu(&sched, &part, 30, 4);
    let b = vcpu(&sched, &part, 30, 4);

    sched.activate_thread(&a).unwrap();
    sched.activate_thread(&b).unwrap();
    sched.schedule();
    assert!(is_current(&sched, &a));

    // No expiry, but an explicit yield gives the CPU up.
    sched.yield_now();
    assert!(is_current(&sched, &b));
}

#[test]
fn yield_to_donates_and_returns() {
    let (sched, part) = setup(5);
    let donor = vcpu(&sched, &part, 30, 5);
    let target = vcpu(&sched, &part, 20, 5);

    sched.activate_thread(&donor).unwrap();
    sched.activate_thread(&target).unwrap();
    sched.schedule();
    assert!(is_current(&sched, &donor));

    // The target has lower priority and would never be picked by itself;
    // the directed yield donates the donor's slice.
    sched.yield_to(&target);
    assert!(is_current(&sched, &target));

    // A plain yield from the beneficiary hands control back to the donor.
    sched.yield_now();
    assert!(is_current(&sched, &donor));
}

#[test]
fn unblock_while_running_marks_requeue() {
    let (sched, part) = setup(6);
    let t = vcpu(&sched, &part, 30, 6);
    sched.activate_thread(&t).unwrap();
    sched.schedule();
    assert!(is_current(&sched, &t));

    // Block and immediately unblock the running thread: it cannot be
    // queued while still on the CPU, so it is marked for requeue and the
    // next pass puts it back.
    block(&sched, &t, BlockReason::VcpuSuspend);
    let _ = unblock(&sched, &t, BlockReason::VcpuSuspend);
    sched.schedule();
    assert!(is_current(&sched, &t));
    assert_eq!(t.state(), ThreadState::Ready);
}

#[test]
fn blocked_thread_leaves_cpu() {
    let (sched, part) = setup(7);
    let t = vcpu(&sched, &part, 30, 7);
    sched.activate_thread(&t).unwrap();
    sched.schedule();
    assert!(is_current(&sched, &t));

    block(&sched, &t, BlockReason::VcpuOff);
    sched.schedule();
    assert!(is_current(&sched, &sched.idle_thread(7)));
}

#[test]
fn cross_cpu_unblock_sends_reschedule_ipi() {
    let (sched, part) = setup(8);
    set_current_cpu(9);
    sched.init_cpu(Some(part.clone())).unwrap();
    set_current_cpu(8);

    let t = vcpu(&sched, &part, 30, 9);
    block(&sched, &t, BlockReason::VcpuOff);
    sched.activate_thread(&t).unwrap();

    // Unblocked from CPU 8 while homed on CPU 9: the work arrives there.
    let _ = ipi::clear(IpiReason::Reschedule);
    let need = unblock(&sched, &t, BlockReason::VcpuOff);
    assert!(!need);
    assert!(ipi::is_pending(IpiReason::Reschedule, 9));

    set_current_cpu(9);
    assert!(ipi::clear(IpiReason::Reschedule));
    sched.schedule();
    assert!(is_current(&sched, &t));
    set_current_cpu(0);
}

#[test]
fn affinity_change_migrates_blocked_thread() {
    let (sched, part) = setup(10);
    set_current_cpu(11);
    sched.init_cpu(Some(part.clone())).unwrap();
    set_current_cpu(10);

    let t = vcpu(&sched, &part, 30, 10);
    block(&sched, &t, BlockReason::VcpuOff);
    sched.activate_thread(&t).unwrap();

    {
        let _guard = t.sched_lock.lock();
        sched.set_affinity(&t, 11).unwrap();
        assert_eq!(sched.affinity(&t), Some(11));
    }

    let _ = unblock(&sched, &t, BlockReason::VcpuOff);
    set_current_cpu(11);
    sched.schedule();
    assert!(is_current(&sched, &t));
    set_current_cpu(0);
}

#[test]
fn pinned_thread_refuses_migration() {
    let (sched, part) = setup(12);
    let t = vcpu(&sched, &part, 30, 12);

    assert!(sched.vcpu_activate(&t, VcpuOptions::PINNED));
    assert!(t.vcpu_options().contains(VcpuOptions::PINNED));

    let _guard = t.sched_lock.lock();
    assert_eq!(sched.set_affinity(&t, 13), Err(Error::Denied));
}

#[test]
fn first_hlos_vcpu_becomes_primary() {
    let (sched, part) = setup(13);
    let a = vcpu(&sched, &part, 30, 13);
    let b = vcpu(&sched, &part, 30, 13);

    assert!(sched.vcpu_activate(&a, VcpuOptions::HLOS_VM));
    assert_eq!(
        sched.primary_vcpu(13).map(|p| p.as_ptr().cast_const()),
        Some(a.as_ptr())
    );
    // Pinning is implied for the primary.
    assert!(a.vcpu_options().contains(VcpuOptions::PINNED));

    // A second HLOS VCPU on the same CPU is refused.
    assert!(!sched.vcpu_activate(&b, VcpuOptions::HLOS_VM));
}

#[test]
fn kill_takes_effect_at_exit_boundary() {
    let (sched, part) = setup(14);
    let t = vcpu(&sched, &part, 30, 14);

    // Kill before activation is refused.
    assert_eq!(t.kill(), Err(Error::ObjectState));

    sched.activate_thread(&t).unwrap();
    sched.schedule();
    assert!(is_current(&sched, &t));

    t.kill().unwrap();
    assert!(t.is_dying());
    // Still current until the exit boundary.
    assert!(is_current(&sched, &t));

    sched.handle_exit_to_user();
    assert_eq!(t.state(), ThreadState::Exited);
    assert!(is_current(&sched, &sched.idle_thread(14)));

    // Killing an exited thread is a no-op.
    assert_eq!(t.kill(), Ok(()));
}

#[test]
fn timer_is_armed_only_when_preemption_matters() {
    let (sched, part) = setup(15);
    let t = vcpu(&sched, &part, 30, 15);
    sched.activate_thread(&t).unwrap();
    sched.schedule();

    // Sole runnable thread: no reschedule timeout.
    assert_eq!(sched.timeout_for(15), None);

    let other = vcpu(&sched, &part, 30, 15);
    sched.activate_thread(&other).unwrap();
    sched.schedule();
    assert!(sched.timeout_for(15).is_some());

    preempt::disable();
    sched.handle_timer();
    preempt::enable();
    assert_eq!(sched.timeout_for(15), None);
    assert!(ipi::is_pending(IpiReason::Reschedule, 15));
    let _ = ipi::clear(IpiReason::Reschedule);
}
