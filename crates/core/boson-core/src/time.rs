//! Monotonic tick source.
//!
//! Scheduling accounting runs on the platform's monotonic tick counter. On
//! kernel targets the source is the generic timer's physical counter
//! (`CNTPCT_EL0`, frequency from `CNTFRQ_EL0`); on the host it is a global
//! atomic that tests advance with [`advance_ticks`], so timeslice expiry is
//! fully deterministic under `cargo test`.

use core::sync::atomic::{AtomicU64, Ordering};

/// A monotonic timestamp in timer ticks.
pub type Ticks = u64;

/// Nanoseconds per second.
const NS_PER_S: u128 = 1_000_000_000;

/// Tick frequency in Hz. Defaults to the common 19.2 MHz generic-timer
/// frequency; the kernel overwrites it from `CNTFRQ_EL0` during boot.
static TICK_FREQ: AtomicU64 = AtomicU64::new(19_200_000);

/// Sets the tick frequency in Hz (boot only).
pub fn set_frequency(hz: u64) {
    assert!(hz != 0);
    TICK_FREQ.store(hz, Ordering::Relaxed);
}

/// Returns the tick frequency in Hz.
#[must_use]
pub fn frequency() -> u64 {
    TICK_FREQ.load(Ordering::Relaxed)
}

/// Converts nanoseconds to ticks (rounding down).
#[must_use]
pub fn ns_to_ticks(ns: u64) -> Ticks {
    (u128::from(ns) * u128::from(frequency()) / NS_PER_S) as Ticks
}

/// Converts ticks to nanoseconds (rounding down).
#[must_use]
pub fn ticks_to_ns(ticks: Ticks) -> u64 {
    (u128::from(ticks) * NS_PER_S / u128::from(frequency())) as u64
}

/// Returns the current monotonic tick count.
#[must_use]
pub fn current_ticks() -> Ticks {
    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    {
        let ticks: u64;
        // SAFETY: Reading the physical counter has no side effects.
        unsafe {
            core::arch::asm!("isb; mrs {}, CNTPCT_EL0", out(reg) ticks, options(nomem, nostack));
        }
        ticks
    }
    #[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
    {
        HOST_TICKS.load(Ordering::Relaxed)
    }
}

#[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
static HOST_TICKS: AtomicU64 = AtomicU64::new(0);

/// Advances the host tick counter (host only).
#[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
pub fn advance_ticks(delta: Ticks) -> Ticks {
    HOST_TICKS.fetch_add(delta, Ordering::Relaxed) + delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_roundtrip() {
        // 1 ms at 19.2 MHz is 19200 ticks.
        assert_eq!(ns_to_ticks(1_000_000), 19_200);
        assert_eq!(ticks_to_ns(19_200), 1_000_000);
    }

    #[test]
    fn host_clock_advances() {
        let before = current_ticks();
        advance_ticks(100);
        assert!(current_ticks() >= before + 100);
    }
}
