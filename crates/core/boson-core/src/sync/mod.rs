//! Synchronization primitives.
//!
//! The hypervisor uses strict spin locks under an explicit-preemption model:
//! preemption is never asynchronous within the hypervisor, it is disabled by
//! [`preempt::disable`] (or by taking a [`SpinLock`]) and re-enabled on
//! release. The `nopreempt` lock variants skip the preemption bookkeeping
//! for nesting inside a region that already disabled it.

pub mod preempt;
mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
