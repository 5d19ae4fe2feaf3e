//! Memory extents, address spaces and stage-2 translation for the Boson
//! hypervisor.
//!
//! The ownership chain runs partition → extent → child extent, tracked in
//! the memory database; the mapping chain runs extent → address space,
//! tracked in per-extent mapping sets and the per-VM stage-2 tables. This
//! crate owns both chains and the stage-2 tables themselves.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addrspace;
pub(crate) mod basic;
pub mod gpt;
pub mod memextent;
pub mod pgtable;
pub(crate) mod sparse;
pub mod types;

pub use addrspace::{Addrspace, AddrspaceLookup};
pub use memextent::{ExtentAttrs, ExtentType, MemExtent};
pub use types::{MappingAttrs, MemType, PgAccess, VmMemType};

#[cfg(test)]
mod tests;
