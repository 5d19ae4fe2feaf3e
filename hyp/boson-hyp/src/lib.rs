//! The Boson hypervisor kernel crate.
//!
//! Ties the subsystem crates together: object lifecycle dispatch (create /
//! configure / activate / attach across the typed objects), the
//! capability-indexed hypercall surface, stage-2 abort and trap routing,
//! and boot initialization. The subsystem logic itself lives in the
//! host-testable crates below this one; everything here is glue, and all
//! of it except the exception vectors runs under `cargo test`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// ── Always-available modules (pure logic, host-testable) ─────────────────

pub mod boot;
pub mod hypercalls;
pub mod object;
pub mod trap;
pub mod vdevice;

// ── Kernel-runtime modules (require target_os = "none") ──────────────────

#[cfg(target_os = "none")]
pub mod arch;

#[cfg(test)]
mod tests;
