//! Capability rights.
//!
//! Rights are a 32-bit bitmap whose meaning depends on the referenced
//! object's type, except for the generic bits shared by every type. A
//! lookup demands a set of required rights; a copy can only narrow them.

use boson_obj::ObjectType;

/// A rights bitmap. Interpretation is per object type.
pub type CapRights = u32;

/// Rights valid for every object type.
pub mod generic {
    /// Permission to activate the object.
    pub const OBJECT_ACTIVATE: u32 = 1 << 0;
    /// All generic rights.
    pub const ALL: u32 = OBJECT_ACTIVATE;
}

/// Cspace-specific rights.
pub mod cspace {
    /// Create caps in this cspace.
    pub const CAP_CREATE: u32 = 1 << 1;
    /// Delete caps from this cspace.
    pub const CAP_DELETE: u32 = 1 << 2;
    /// Copy caps out of this cspace.
    pub const CAP_COPY: u32 = 1 << 3;
    /// Revoke children of a master cap held in this cspace.
    pub const CAP_REVOKE: u32 = 1 << 4;
    /// Attach threads to this cspace.
    pub const ATTACH: u32 = 1 << 5;
    /// All cspace rights.
    pub const ALL: u32 = super::generic::ALL | CAP_CREATE | CAP_DELETE | CAP_COPY | CAP_REVOKE | ATTACH;
}

/// Address-space-specific rights.
pub mod addrspace {
    /// Attach threads (VCPUs) to this address space.
    pub const ATTACH: u32 = 1 << 1;
    /// Map extents into this address space.
    pub const MAP: u32 = 1 << 2;
    /// Look up translations.
    pub const LOOKUP: u32 = 1 << 3;
    /// Add or remove virtual-MMIO ranges.
    pub const ADD_VMMIO_RANGE: u32 = 1 << 4;
    /// All address-space rights.
    pub const ALL: u32 = super::generic::ALL | ATTACH | MAP | LOOKUP | ADD_VMMIO_RANGE;
}

/// Memextent-specific rights.
pub mod memextent {
    /// Map the extent into address spaces.
    pub const MAP: u32 = 1 << 1;
    /// Derive child extents.
    pub const DERIVE: u32 = 1 << 2;
    /// Donate memory to or from the extent.
    pub const DONATE: u32 = 1 << 3;
    /// Attach the extent to hypervisor objects.
    pub const ATTACH: u32 = 1 << 4;
    /// Look up mappings and offsets.
    pub const LOOKUP: u32 = 1 << 5;
    /// All memextent rights.
    pub const ALL: u32 = super::generic::ALL | MAP | DERIVE | DONATE | ATTACH | LOOKUP;
}

/// Thread-specific rights.
pub mod thread {
    /// Power the VCPU on or off.
    pub const POWER: u32 = 1 << 1;
    /// Change affinity.
    pub const AFFINITY: u32 = 1 << 2;
    /// Change priority.
    pub const PRIORITY: u32 = 1 << 3;
    /// Change timeslice.
    pub const TIMESLICE: u32 = 1 << 4;
    /// Be the target of a directed yield.
    pub const YIELD_TO: u32 = 1 << 5;
    /// Kill the thread.
    pub const LIFECYCLE: u32 = 1 << 6;
    /// All thread rights.
    pub const ALL: u32 = super::generic::ALL | POWER | AFFINITY | PRIORITY | TIMESLICE | YIELD_TO | LIFECYCLE;
}

/// Partition-specific rights.
pub mod partition {
    /// Create objects owned by this partition.
    pub const OBJECT_CREATE: u32 = 1 << 1;
    /// Donate memory ranges out of this partition.
    pub const DONATE: u32 = 1 << 2;
    /// All partition rights.
    pub const ALL: u32 = super::generic::ALL | OBJECT_CREATE | DONATE;
}

/// Message-queue-specific rights.
pub mod msgqueue {
    /// Send messages.
    pub const SEND: u32 = 1 << 1;
    /// Receive messages.
    pub const RECEIVE: u32 = 1 << 2;
    /// Bind the send-side VIRQ.
    pub const BIND_SEND: u32 = 1 << 3;
    /// Bind the receive-side VIRQ.
    pub const BIND_RECEIVE: u32 = 1 << 4;
    /// All message-queue rights.
    pub const ALL: u32 = super::generic::ALL | SEND | RECEIVE | BIND_SEND | BIND_RECEIVE;
}

/// VirtIO-MMIO-specific rights.
pub mod virtio {
    /// Backend configuration calls.
    pub const CONFIG: u32 = 1 << 1;
    /// Assert the frontend VIRQ.
    pub const ASSERT_VIRQ: u32 = 1 << 2;
    /// Bind backend or frontend VIRQs.
    pub const BIND_VIRQ: u32 = 1 << 3;
    /// All VirtIO rights.
    pub const ALL: u32 = super::generic::ALL | CONFIG | ASSERT_VIRQ | BIND_VIRQ;
}

/// Returns the full rights mask for an object type; the master cap is
/// created with these.
#[must_use]
pub fn rights_all(otype: ObjectType) -> CapRights {
    match otype {
        ObjectType::Any => generic::ALL,
        ObjectType::Partition => partition::ALL,
        ObjectType::Cspace => cspace::ALL,
        ObjectType::Addrspace => addrspace::ALL,
        ObjectType::Memextent => memextent::ALL,
        ObjectType::Thread => thread::ALL,
        ObjectType::MsgQueue => msgqueue::ALL,
        ObjectType::VirtioMmio => virtio::ALL,
    }
}
