//! Threads and scheduling for the Boson hypervisor.
//!
//! Provides the thread object (VCPUs and per-CPU idle threads), the
//! fixed-priority round-robin scheduler with directed-yield donation, and
//! the architecture context switch.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub(crate) mod arch;
pub mod idle;
pub mod scheduler;
pub mod thread;

pub use scheduler::{SchedState, global};
pub use thread::{BlockReason, Thread, ThreadKind, ThreadState, VcpuOptions, VcpuRegs, VcpuSysRegs};

#[cfg(test)]
mod tests;
