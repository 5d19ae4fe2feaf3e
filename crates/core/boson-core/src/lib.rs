//! Core types and primitives for the Boson hypervisor.
//!
//! This crate contains host-testable abstractions shared by every other
//! crate in the workspace: physical/virtual address types, atomic bitmaps,
//! spin locks and the explicit-preemption model, per-CPU storage, IPI
//! bookkeeping, the monotonic tick source, logging, the boot PRNG, and the
//! hypervisor-wide error type.
//!
//! By living below the subsystem crates, these types can be tested with
//! `cargo test` on the host without a kernel target. Anything that touches
//! real hardware (system registers, SGIs, the physical timer) sits behind a
//! swappable hook that the kernel crate installs at boot and that tests
//! replace with recording stubs.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod addr;
pub mod bitmap;
pub mod cpulocal;
pub mod error;
pub mod ipi;
pub mod log;
pub mod phys;
pub mod rand;
pub mod static_assert;
pub mod sync;
pub mod time;
pub mod util;
