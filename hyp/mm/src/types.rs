//! Access permissions, memory types and mapping attributes.

use bitflags::bitflags;

use boson_core::error::{Error, Result};

bitflags! {
    /// Access permissions for a mapping or an extent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PgAccess: u8 {
        /// Readable.
        const R = 1 << 0;
        /// Writable.
        const W = 1 << 1;
        /// Executable.
        const X = 1 << 2;
    }
}

impl PgAccess {
    /// Read-write.
    pub const RW: Self = Self::R.union(Self::W);
    /// Read-execute.
    pub const RX: Self = Self::R.union(Self::X);
    /// Read-write-execute.
    pub const RWX: Self = Self::R.union(Self::W).union(Self::X);

    /// Returns `true` if `self` grants everything `requested` needs.
    #[must_use]
    pub fn allows(self, requested: Self) -> bool {
        self.contains(requested)
    }

    /// Masks `self` down to what `limit` allows.
    #[must_use]
    pub fn mask(self, limit: Self) -> Self {
        self & limit
    }
}

/// Stage-2 memory type of a guest mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VmMemType {
    /// Device, non-gathering, non-reordering, no early ack.
    DeviceNGnRnE = 0,
    /// Device, non-gathering, non-reordering, early ack.
    DeviceNGnRE = 1,
    /// Device, non-gathering, reordering allowed.
    DeviceNGRE = 2,
    /// Device, gathering and reordering allowed.
    DeviceGRE = 3,
    /// Normal non-cacheable.
    NormalNC = 4,
    /// Normal write-back cacheable.
    NormalWB = 5,
    /// Normal write-through cacheable.
    NormalWT = 6,
}

impl VmMemType {
    /// Returns `true` for the device classes.
    #[must_use]
    pub fn is_device(self) -> bool {
        matches!(
            self,
            Self::DeviceNGnRnE | Self::DeviceNGnRE | Self::DeviceNGRE | Self::DeviceGRE
        )
    }
}

/// Memory-type class an extent constrains its mappings to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemType {
    /// Any mapping memory type is acceptable.
    Any = 0,
    /// Device classes only.
    Device = 1,
    /// Uncached: device classes or normal non-cacheable.
    Uncached = 2,
    /// Forced cacheable. Requires stage-2 forced write-back.
    Cached = 3,
}

/// Whether the platform implements stage-2 forced write-back (S2FWB).
/// Without it, cached mappings cannot be forced on guests and the `Cached`
/// extent class is rejected at configure time.
pub const HAVE_S2FWB: bool = false;

/// Checks an extent memory-type class against a requested mapping type.
#[must_use]
pub fn check_memtype(extent_type: MemType, map_type: VmMemType) -> bool {
    match map_type {
        VmMemType::DeviceNGnRnE
        | VmMemType::DeviceNGnRE
        | VmMemType::DeviceNGRE
        | VmMemType::DeviceGRE => matches!(
            extent_type,
            MemType::Any | MemType::Device | MemType::Uncached
        ),
        VmMemType::NormalNC => matches!(extent_type, MemType::Any | MemType::Uncached),
        VmMemType::NormalWB => {
            extent_type == MemType::Any || (HAVE_S2FWB && extent_type == MemType::Cached)
        }
        VmMemType::NormalWT => extent_type == MemType::Any,
    }
}

/// Validates an extent memory-type class at configure time.
pub fn validate_extent_memtype(memtype: MemType) -> Result<()> {
    match memtype {
        MemType::Any | MemType::Device | MemType::Uncached => Ok(()),
        MemType::Cached if HAVE_S2FWB => Ok(()),
        MemType::Cached => Err(Error::ArgumentInvalid),
    }
}

/// Attributes of one guest mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingAttrs {
    /// Stage-2 memory type.
    pub memtype: VmMemType,
    /// Access granted to guest kernel (EL1).
    pub kernel_access: PgAccess,
    /// Access granted to guest user (EL0).
    pub user_access: PgAccess,
}

impl MappingAttrs {
    /// Normal write-back with the given access for both ELs.
    #[must_use]
    pub fn normal(access: PgAccess) -> Self {
        Self {
            memtype: VmMemType::NormalWB,
            kernel_access: access,
            user_access: access,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_subset_checks() {
        assert!(PgAccess::RWX.allows(PgAccess::RW));
        assert!(!PgAccess::RX.allows(PgAccess::W));
        assert_eq!(PgAccess::RWX.mask(PgAccess::RW), PgAccess::RW);
    }

    #[test]
    fn memtype_matrix() {
        assert!(check_memtype(MemType::Any, VmMemType::NormalWB));
        assert!(check_memtype(MemType::Any, VmMemType::DeviceNGnRnE));
        assert!(check_memtype(MemType::Device, VmMemType::DeviceNGnRE));
        assert!(!check_memtype(MemType::Device, VmMemType::NormalWB));
        assert!(check_memtype(MemType::Uncached, VmMemType::NormalNC));
        assert!(check_memtype(MemType::Uncached, VmMemType::DeviceGRE));
        assert!(!check_memtype(MemType::Uncached, VmMemType::NormalWB));
        // Without S2FWB, forced-cacheable extents are unusable.
        assert!(!check_memtype(MemType::Cached, VmMemType::NormalWB));
        assert!(validate_extent_memtype(MemType::Cached).is_err());
    }
}
