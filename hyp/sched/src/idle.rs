//! The per-CPU idle loop.
//!
//! Idle threads are never queued; the scheduler falls back to them when no
//! runnable thread is homed on the CPU. The loop gives RCU a chance to
//! deactivate the CPU, then waits for an interrupt and re-runs the
//! scheduler when anything arrives.

use boson_core::ipi::{self, IpiReason};
use boson_core::sync::preempt;

/// Runs one iteration of the idle loop: RCU housekeeping, an interrupt
/// wait, then a scheduler pass if one was requested. Returns `true` if a
/// reschedule happened.
pub fn idle_step(sched: &crate::scheduler::SchedState) -> bool {
    preempt::disable();

    let mut reschedule = boson_rcu::global().handle_idle_yield();

    let can_idle = sched.current_can_idle();
    preempt::enable();

    if !can_idle || ipi::is_pending(IpiReason::Reschedule, boson_core::cpulocal::current_cpu()) {
        let _ = ipi::clear(IpiReason::Reschedule);
        reschedule = true;
    } else {
        wait_for_interrupt();
    }

    let _ = boson_rcu::global().pump_current_cpu();
    if reschedule {
        sched.schedule();
        return true;
    }
    false
}

/// The idle thread's run loop (kernel target).
#[cfg(all(target_os = "none", target_arch = "aarch64"))]
pub fn idle_loop() -> ! {
    let sched = crate::scheduler::global();
    boson_core::sync::preempt::enable();
    loop {
        let _ = idle_step(sched);
    }
}

fn wait_for_interrupt() {
    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    // SAFETY: Standby wait; resumes on any interrupt, including masked
    // ones (they are handled after preemption is re-enabled).
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack));
    }
    #[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
    core::hint::spin_loop();
}
