//! Hypervisor-wide error codes.
//!
//! Every fallible operation returns [`Error`] through the [`Result`] alias.
//! There is no hidden unwinding: an operation that mutates several pieces of
//! state rolls its changes back before surfacing an error. A handful of
//! invariant violations (programmer error, never guest misbehavior) panic
//! instead.

use core::fmt;

/// Result alias used throughout the hypervisor.
pub type Result<T> = core::result::Result<T, Error>;

/// Error codes returned by hypervisor operations and hypercalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The operation is not implemented for this object or platform.
    Unimplemented,
    /// Transient internal conflict; retry after an RCU grace period.
    Retry,
    /// The caller is not allowed to perform this operation.
    Denied,
    /// A racing operation got there first; the caller may retry.
    Busy,
    /// No pending work was found.
    Idle,
    /// The object is in the wrong lifecycle state for this operation.
    ObjectState,
    /// The object's configuration is incomplete or inconsistent.
    ObjectConfig,
    /// Memory allocation failed.
    NoMem,
    /// A fixed-capacity resource (other than memory) is exhausted.
    NoResources,
    /// An argument value is invalid.
    ArgumentInvalid,
    /// An argument size is zero, too large, or wraps.
    ArgumentSize,
    /// An argument violates an alignment requirement.
    ArgumentAlignment,
    /// An address is outside the valid range.
    AddrInvalid,
    /// An address computation overflowed.
    AddrOverflow,
    /// The capability slot is empty.
    CapNull,
    /// The capability has been revoked.
    CapRevoked,
    /// The capability references an object of a different type.
    WrongObjectType,
    /// The capability does not carry the required rights.
    InsufficientRights,
    /// The capability space has no free slots left.
    CspaceFull,
    /// No owner is recorded for the queried physical address.
    MemdbEmpty,
    /// The recorded owner does not match the expected one.
    MemdbNotOwner,
    /// All mapping slots of a basic memory extent are in use.
    MemextentMappingsFull,
    /// The message queue is empty.
    MsgQueueEmpty,
    /// The message queue is full.
    MsgQueueFull,
}

impl Error {
    /// Returns the short name used in logs and hypercall traces.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Retry => "RETRY",
            Self::Denied => "DENIED",
            Self::Busy => "BUSY",
            Self::Idle => "IDLE",
            Self::ObjectState => "OBJECT_STATE",
            Self::ObjectConfig => "OBJECT_CONFIG",
            Self::NoMem => "NOMEM",
            Self::NoResources => "NORESOURCES",
            Self::ArgumentInvalid => "ARGUMENT_INVALID",
            Self::ArgumentSize => "ARGUMENT_SIZE",
            Self::ArgumentAlignment => "ARGUMENT_ALIGNMENT",
            Self::AddrInvalid => "ADDR_INVALID",
            Self::AddrOverflow => "ADDR_OVERFLOW",
            Self::CapNull => "CAP_NULL",
            Self::CapRevoked => "CAP_REVOKED",
            Self::WrongObjectType => "WRONG_OBJECT_TYPE",
            Self::InsufficientRights => "INSUFFICIENT_RIGHTS",
            Self::CspaceFull => "CSPACE_FULL",
            Self::MemdbEmpty => "MEMDB_EMPTY",
            Self::MemdbNotOwner => "MEMDB_NOT_OWNER",
            Self::MemextentMappingsFull => "MEMEXTENT_MAPPINGS_FULL",
            Self::MsgQueueEmpty => "MSGQUEUE_EMPTY",
            Self::MsgQueueFull => "MSGQUEUE_FULL",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl core::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_stable() {
        assert_eq!(Error::MemdbNotOwner.name(), "MEMDB_NOT_OWNER");
        assert_eq!(Error::CapNull.name(), "CAP_NULL");
        assert_eq!(format!("{}", Error::Busy), "BUSY");
    }
}
