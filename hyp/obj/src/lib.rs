//! Hypervisor object model.
//!
//! Every capability-addressable object (partition, cspace, address space,
//! memory extent, thread, message queue, virtual device) embeds an
//! [`ObjectHeader`] carrying its type tag, lifecycle state, reference count
//! and capability list. [`ObjRef`] is the owning smart pointer: cloning
//! takes a reference, dropping releases one, and the final release defers
//! the actual free to an RCU grace period so that lock-free lookups holding
//! a raw pointer inside a read section never observe freed memory.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod caplist;
pub mod object;
pub mod partition;

pub use caplist::CapList;
pub use object::{
    AnyObjRef, HypObject, ObjRef, ObjectHeader, ObjectState, ObjectType, get_safe_raw,
    header_of_raw, put_raw,
};
pub use partition::Partition;
