//! Virtual-device address registry.
//!
//! VirtIO MMIO devices occupy guest-physical pages of an address space;
//! a stage-2 abort landing in one of them is emulated instead of faulted.
//! The registry maps `(addrspace VMID, IPA range)` to the device in a
//! fixed-capacity table under a global lock — registration is a slow
//! path, and the abort path takes the lock uncontended.

use planck_noalloc::vec::ArrayVec;

use boson_core::addr::{PAGE_SIZE, VmAddr};
use boson_core::error::{Error, Result};
use boson_core::sync::SpinLock;
use boson_core::util;
use boson_mm::Addrspace;
use boson_obj::ObjRef;
use boson_vm::VirtioMmio;

/// Maximum simultaneously bound virtual devices, across all VMs.
pub const MAX_VDEVICES: usize = 32;

struct Registration {
    vmid: u16,
    ipa: u64,
    size: u64,
    device: ObjRef<VirtioMmio>,
}

static REGISTRY: SpinLock<ArrayVec<Registration, MAX_VDEVICES>> =
    SpinLock::new(ArrayVec::new());

/// Attaches `device` to `[ipa, ipa + size)` of `addrspace`.
pub fn bind(
    device: &ObjRef<VirtioMmio>,
    addrspace: &ObjRef<Addrspace>,
    ipa: VmAddr,
    size: u64,
) -> Result<()> {
    if size == 0 || !util::is_aligned(ipa.as_u64(), PAGE_SIZE) || !util::is_aligned(size, PAGE_SIZE)
    {
        return Err(Error::ArgumentAlignment);
    }

    let mut registry = REGISTRY.lock();
    let vmid = addrspace.vmid();
    let overlaps = registry
        .iter()
        .any(|r| r.vmid == vmid && r.ipa < ipa.as_u64() + size && ipa.as_u64() < r.ipa + r.size);
    if overlaps {
        return Err(Error::Busy);
    }
    registry
        .try_push(Registration {
            vmid,
            ipa: ipa.as_u64(),
            size,
            device: device.clone(),
        })
        .map_err(|_| Error::NoResources)
}

/// Detaches `device` from `addrspace`.
pub fn unbind(device: &ObjRef<VirtioMmio>, addrspace: &ObjRef<Addrspace>) {
    let vmid = addrspace.vmid();
    let mut registry = REGISTRY.lock();
    let mut i = 0;
    while i < registry.len() {
        if registry[i].vmid == vmid && core::ptr::eq(registry[i].device.as_ptr(), device.as_ptr())
        {
            registry.swap_remove(i);
        } else {
            i += 1;
        }
    }
}

/// Resolves an IPA of `vmid` to a bound device and the register offset.
#[must_use]
pub fn lookup(vmid: u16, ipa: VmAddr) -> Option<(ObjRef<VirtioMmio>, u64)> {
    let registry = REGISTRY.lock();
    registry.iter().find_map(|r| {
        (r.vmid == vmid && (r.ipa..r.ipa + r.size).contains(&ipa.as_u64()))
            .then(|| (r.device.clone(), ipa.as_u64() - r.ipa))
    })
}
