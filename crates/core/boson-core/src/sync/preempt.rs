//! Explicit preemption control.
//!
//! Hypervisor threads are never preempted arbitrarily; rescheduling happens
//! only at points where the preemption-disable count is zero. Critical
//! regions and RCU read sections bracket themselves with [`disable`] /
//! [`enable`]. On kernel targets the 0↔1 transitions also mask and unmask
//! asynchronous exceptions; on the host the count is a thread-local so each
//! simulated CPU tracks its own depth.

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
mod imp {
    use crate::cpulocal::{CpuLocal, MAX_CPUS};
    use core::sync::atomic::{AtomicU32, Ordering};

    static COUNTS: CpuLocal<AtomicU32> = CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);

    pub fn disable() {
        if COUNTS.get().fetch_add(1, Ordering::Relaxed) == 0 {
            // SAFETY: Masking IRQ and FIQ is always safe at EL2.
            unsafe { core::arch::asm!("msr DAIFSet, #3", options(nomem, nostack)) };
        }
    }

    pub fn enable() {
        let prev = COUNTS.get().fetch_sub(1, Ordering::Relaxed);
        assert!(prev != 0, "preempt_enable() without matching disable");
        if prev == 1 {
            // SAFETY: Unmasking IRQ and FIQ once the count reaches zero.
            unsafe { core::arch::asm!("msr DAIFClr, #3", options(nomem, nostack)) };
        }
    }

    pub fn count() -> u32 {
        COUNTS.get().load(Ordering::Relaxed)
    }
}

#[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
mod imp {
    use core::cell::Cell;

    std::thread_local! {
        static COUNT: Cell<u32> = const { Cell::new(0) };
    }

    pub fn disable() {
        COUNT.with(|c| c.set(c.get() + 1));
    }

    pub fn enable() {
        COUNT.with(|c| {
            let prev = c.get();
            assert!(prev != 0, "preempt_enable() without matching disable");
            c.set(prev - 1);
        });
    }

    pub fn count() -> u32 {
        COUNT.with(Cell::get)
    }
}

/// Disables preemption on the current CPU. Nestable.
#[inline]
pub fn disable() {
    imp::disable();
}

/// Re-enables preemption on the current CPU.
///
/// # Panics
///
/// Panics if preemption is not currently disabled.
#[inline]
pub fn enable() {
    imp::enable();
}

/// Returns the current preemption-disable depth.
#[inline]
#[must_use]
pub fn count() -> u32 {
    imp::count()
}

/// Asserts that preemption is disabled.
///
/// Used at the top of functions whose callers must hold a preemption-disabled
/// region (scheduler internals, RCU quiesce paths).
#[inline]
pub fn assert_disabled() {
    debug_assert!(count() > 0, "preemption unexpectedly enabled");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting() {
        assert_eq!(count(), 0);
        disable();
        disable();
        assert_eq!(count(), 2);
        enable();
        assert_eq!(count(), 1);
        enable();
        assert_eq!(count(), 0);
    }

    #[test]
    #[should_panic(expected = "without matching disable")]
    fn unbalanced_enable_panics() {
        enable();
    }
}
