//! Virtual interrupts, VirtIO MMIO devices and VCPU trap emulation.
//!
//! This crate carries the guest-facing device and exception machinery:
//! bindable VIRQ sources with edge-triggered delivery, the VirtIO MMIO
//! register block emulation, trapped system-register emulation with
//! virtualized ID registers, and synchronous-abort injection into guest
//! EL1.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod esr;
pub mod exception;
pub mod sysreg;
pub mod virq;
pub mod virtio_mmio;

pub use exception::{InjectResult, inject_abort, inject_undef};
pub use sysreg::{SysregResult, VirtIdRegs, handle_sysreg_trap};
pub use virq::{Vic, Virq, VirqSource};
pub use virtio_mmio::{NotifyReason, QueueRegs, VirtioMmio};
