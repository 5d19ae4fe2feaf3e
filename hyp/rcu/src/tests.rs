use super::*;

use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A heap-allocated callback target. The handler consumes the box, so a
/// dispatched entry is also a freed entry — any double dispatch would be
/// caught by the allocator or the hit counter.
#[repr(C)]
struct TestEntry {
    entry: RcuEntry,
    hits: &'static AtomicUsize,
}

fn counting_handler(entry: *mut RcuEntry) -> bool {
    // SAFETY: All entries enqueued by these tests with the ObjectRelease
    // class are leaked boxes of TestEntry with the RcuEntry first.
    let test = unsafe { Box::from_raw(entry.cast::<TestEntry>()) };
    test.hits.fetch_add(1, Ordering::Relaxed);
    false
}

fn enqueue_counting(rcu: &RcuState, hits: &'static AtomicUsize) {
    set_class_handler(RcuClass::ObjectRelease, counting_handler);
    let entry = Box::leak(Box::new(TestEntry {
        entry: RcuEntry::new(),
        hits,
    }));
    // SAFETY: The entry is leaked; the handler reclaims it.
    unsafe { rcu.enqueue(&raw mut entry.entry, RcuClass::ObjectRelease) };
}

/// Pumps the current CPU until `cond` holds or the iteration budget is
/// exhausted. Grace periods converge in a handful of quiesce rounds, so the
/// budget only guards against state-machine bugs hanging the test.
fn pump_until(rcu: &RcuState, cond: impl Fn() -> bool) {
    for _ in 0..64 {
        if cond() {
            return;
        }
        rcu.pump_current_cpu();
    }
    assert!(cond(), "RCU state machine failed to converge");
}

#[test]
fn callback_runs_after_grace_period() {
    static HITS: AtomicUsize = AtomicUsize::new(0);
    cpulocal::set_current_cpu(3);
    let rcu = RcuState::new();

    boson_core::sync::preempt::disable();
    rcu.activate_cpu();
    boson_core::sync::preempt::enable();

    enqueue_counting(&rcu, &HITS);

    // The callback must not run before any grace period has elapsed.
    assert_eq!(HITS.load(Ordering::Relaxed), 0);

    pump_until(&rcu, || HITS.load(Ordering::Relaxed) == 1);
    assert!(!rcu.has_pending_updates());
    cpulocal::set_current_cpu(0);
}

#[test]
fn hundred_callbacks_after_idle_transition() {
    // Enqueue 100 callbacks, force the CPU through an idle transition, and
    // require that rcu.sync() only returns once all of them have run.
    static HITS: AtomicUsize = AtomicUsize::new(0);
    cpulocal::set_current_cpu(0);
    let rcu = RcuState::new();

    boson_core::sync::preempt::disable();
    rcu.activate_cpu();
    boson_core::sync::preempt::enable();

    for _ in 0..100 {
        enqueue_counting(&rcu, &HITS);
    }
    assert_eq!(HITS.load(Ordering::Relaxed), 0);
    assert!(rcu.has_pending_updates());

    // Idle transition: the CPU deactivates and quiesces.
    boson_core::sync::preempt::disable();
    let _ = rcu.handle_idle_yield();
    boson_core::sync::preempt::enable();

    rcu.sync();
    assert_eq!(HITS.load(Ordering::Relaxed), 100);
    assert!(!rcu.has_pending_updates());
}

#[test]
fn grace_period_waits_for_second_cpu() {
    static HITS: AtomicUsize = AtomicUsize::new(0);
    let rcu = RcuState::new();

    // CPU 5 and CPU 6 are both active.
    cpulocal::set_current_cpu(5);
    boson_core::sync::preempt::disable();
    rcu.activate_cpu();
    boson_core::sync::preempt::enable();

    cpulocal::set_current_cpu(6);
    boson_core::sync::preempt::disable();
    rcu.activate_cpu();
    boson_core::sync::preempt::enable();

    // Enqueue on CPU 5 and pump only CPU 5: the grace period cannot close
    // because CPU 6 never acknowledges.
    cpulocal::set_current_cpu(5);
    enqueue_counting(&rcu, &HITS);
    for _ in 0..16 {
        rcu.pump_current_cpu();
    }
    assert_eq!(HITS.load(Ordering::Relaxed), 0);

    // CPU 6 passes a scheduler quiescent point; now CPU 5 can finish.
    cpulocal::set_current_cpu(6);
    boson_core::sync::preempt::disable();
    let _ = rcu.handle_scheduler_quiescent();
    boson_core::sync::preempt::enable();
    // The second period also needs an acknowledgement from CPU 6.
    let pump_six = || {
        cpulocal::set_current_cpu(6);
        boson_core::sync::preempt::disable();
        let _ = rcu.handle_scheduler_quiescent();
        boson_core::sync::preempt::enable();
    };
    pump_six();

    cpulocal::set_current_cpu(5);
    pump_until(&rcu, || {
        pump_six();
        cpulocal::set_current_cpu(5);
        HITS.load(Ordering::Relaxed) == 1
    });
    cpulocal::set_current_cpu(0);
}

#[test]
fn idle_cpu_deactivates_and_stops_blocking() {
    static HITS: AtomicUsize = AtomicUsize::new(0);
    let rcu = RcuState::new();

    // CPU 8 is sitting in its idle loop. With no waiters, idle_yield leaves
    // it in the active set (tracking costs nothing while RCU is idle).
    cpulocal::set_current_cpu(8);
    boson_core::sync::preempt::disable();
    rcu.activate_cpu();
    let _ = rcu.handle_idle_yield();
    boson_core::sync::preempt::enable();

    // CPU 7 enqueues the first update; this prods all active CPUs with a
    // reschedule so the idle one re-evaluates.
    cpulocal::set_current_cpu(7);
    boson_core::sync::preempt::disable();
    rcu.activate_cpu();
    boson_core::sync::preempt::enable();
    enqueue_counting(&rcu, &HITS);
    assert!(ipi::is_pending(IpiReason::Reschedule, 8));

    // CPU 8's idle loop reacts: this time idle_yield deactivates it, so it
    // stops holding grace periods open.
    cpulocal::set_current_cpu(8);
    assert!(ipi::clear(IpiReason::Reschedule));
    boson_core::sync::preempt::disable();
    let _ = rcu.handle_idle_yield();
    boson_core::sync::preempt::enable();

    // From here CPU 7 can retire the update alone.
    cpulocal::set_current_cpu(7);
    pump_until(&rcu, || HITS.load(Ordering::Relaxed) == 1);
    cpulocal::set_current_cpu(0);
}

#[test]
fn suspend_refused_with_pending_updates() {
    static HITS: AtomicUsize = AtomicUsize::new(0);
    cpulocal::set_current_cpu(9);
    let rcu = RcuState::new();

    boson_core::sync::preempt::disable();
    rcu.activate_cpu();
    boson_core::sync::preempt::enable();

    enqueue_counting(&rcu, &HITS);
    assert_eq!(
        rcu.handle_cpu_suspend(),
        Err(boson_core::error::Error::Busy)
    );

    pump_until(&rcu, || HITS.load(Ordering::Relaxed) == 1);
    assert_eq!(rcu.handle_cpu_suspend(), Ok(()));
    cpulocal::set_current_cpu(0);
}

#[test]
fn wrap_safe_generation_compare() {
    assert!(is_before(0, 1));
    assert!(!is_before(1, 0));
    assert!(!is_before(5, 5));
    // Near the wrap point, a small forward step is still "after".
    assert!(is_before(u32::MAX, 1));
    assert!(!is_before(1, u32::MAX));
}
