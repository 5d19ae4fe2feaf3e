//! Per-CPU storage.
//!
//! Provides [`CpuLocal`] indexed by CPU index. On kernel targets the index
//! comes from the per-CPU data block whose pointer is kept in `TPIDR_EL2`.
//! On host targets the index is a thread-local that each test thread sets
//! with [`set_current_cpu`], so multi-CPU interactions can be simulated by
//! ordinary `cargo test` threads.

/// Maximum supported physical CPUs.
///
/// The RCU grace-period bitmap packs one bit per CPU next to the generation
/// counter, which caps this at 32.
pub const MAX_CPUS: usize = 32;

/// Index of a physical CPU, in `0..MAX_CPUS`.
pub type CpuIndex = usize;

/// Sentinel stored in atomic cells that hold an optional CPU index.
pub const CPU_INDEX_INVALID: usize = usize::MAX;

/// Returns `true` if `cpu` is a valid CPU index.
#[inline]
#[must_use]
pub const fn index_valid(cpu: CpuIndex) -> bool {
    cpu < MAX_CPUS
}

/// Per-CPU storage. Wraps `[T; MAX_CPUS]`, indexed by the current CPU.
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Creates a new `CpuLocal` wrapping the given array.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns a reference to the current CPU's instance.
    pub fn get(&self) -> &T {
        &self.data[current_cpu()]
    }

    /// Returns a reference to a specific CPU's instance.
    ///
    /// # Panics
    ///
    /// Panics if `cpu >= MAX_CPUS`.
    pub fn get_for(&self, cpu: CpuIndex) -> &T {
        &self.data[cpu]
    }

    /// Returns an iterator over all CPUs' instances.
    pub fn iter(&self) -> core::slice::Iter<'_, T> {
        self.data.iter()
    }
}

impl<T: Default> Default for CpuLocal<T> {
    fn default() -> Self {
        Self {
            data: core::array::from_fn(|_| T::default()),
        }
    }
}

// SAFETY: CpuLocal<T> is designed for per-CPU access; Send/Sync are safe
// because each CPU primarily accesses its own slot, and cross-slot access is
// mediated by the contained type's own synchronization.
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send + Sync> Sync for CpuLocal<T> {}

/// Returns the current CPU index.
///
/// On kernel targets this reads the index field of the per-CPU data block
/// pointed to by `TPIDR_EL2` (offset 0, set up during CPU cold boot). On
/// host targets it reads the thread-local set by [`set_current_cpu`],
/// defaulting to 0.
#[inline]
#[must_use]
pub fn current_cpu() -> CpuIndex {
    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    {
        let percpu: u64;
        // SAFETY: TPIDR_EL2 is initialized to point at this CPU's per-CPU
        // block before any CpuLocal access; offset 0 is the CPU index.
        unsafe {
            core::arch::asm!("mrs {}, TPIDR_EL2", out(reg) percpu, options(nomem, nostack));
            (*(percpu as *const u64)) as usize
        }
    }
    #[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
    {
        CURRENT_CPU.with(|c| c.get())
    }
}

#[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
std::thread_local! {
    static CURRENT_CPU: core::cell::Cell<usize> = const { core::cell::Cell::new(0) };
}

/// Sets the current thread's CPU index (host only).
///
/// Test harnesses use this to play the role of a specific CPU.
#[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
pub fn set_current_cpu(cpu: CpuIndex) {
    assert!(cpu < MAX_CPUS);
    CURRENT_CPU.with(|c| c.set(cpu));
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn indexes_by_current_cpu() {
        static SLOTS: CpuLocal<AtomicU64> = CpuLocal::new([const { AtomicU64::new(0) }; MAX_CPUS]);
        set_current_cpu(3);
        SLOTS.get().store(33, Ordering::Relaxed);
        set_current_cpu(4);
        SLOTS.get().store(44, Ordering::Relaxed);
        assert_eq!(SLOTS.get_for(3).load(Ordering::Relaxed), 33);
        assert_eq!(SLOTS.get_for(4).load(Ordering::Relaxed), 44);
        set_current_cpu(0);
    }

    #[test]
    fn validity() {
        assert!(index_valid(0));
        assert!(index_valid(MAX_CPUS - 1));
        assert!(!index_valid(CPU_INDEX_INVALID));
    }
}
