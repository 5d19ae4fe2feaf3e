//! Hypervisor access windows onto physical memory.
//!
//! Memory-extent zero/clean operations and message-queue copies need a
//! hypervisor pointer for a guest-owned physical range. On kernel targets
//! every RAM page is covered by the linear map, so the window is just the
//! physical address plus the linear-map offset. On the host there is no
//! physical memory; tests register ordinary buffers against fake physical
//! ranges with [`register_buffer`].

use crate::addr::PhysAddr;
use crate::error::{Error, Result};

#[cfg(target_os = "none")]
mod imp {
    use super::{Error, PhysAddr, Result};
    use core::sync::atomic::{AtomicU64, Ordering};

    /// Virtual-minus-physical offset of the linear map, set during boot.
    static LINEAR_OFFSET: AtomicU64 = AtomicU64::new(0);

    /// Records the linear map offset (boot only).
    pub fn set_linear_offset(offset: u64) {
        LINEAR_OFFSET.store(offset, Ordering::Release);
    }

    pub fn access(pa: PhysAddr, _size: usize) -> Result<*mut u8> {
        let offset = LINEAR_OFFSET.load(Ordering::Acquire);
        if offset == 0 {
            return Err(Error::AddrInvalid);
        }
        Ok((pa.as_u64().wrapping_add(offset)) as *mut u8)
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    use super::{Error, PhysAddr, Result};
    use crate::sync::SpinLock;
    use alloc::vec::Vec;

    struct Window {
        base: u64,
        len: usize,
        ptr: usize,
    }

    static WINDOWS: SpinLock<Vec<Window>> = SpinLock::new(Vec::new());

    /// Registers `buf` as backing the physical range starting at `pa`.
    ///
    /// The caller keeps ownership of the buffer and must keep it alive for
    /// the duration of the test.
    pub fn register_buffer(pa: PhysAddr, buf: &mut [u8]) {
        WINDOWS.lock().push(Window {
            base: pa.as_u64(),
            len: buf.len(),
            ptr: buf.as_mut_ptr() as usize,
        });
    }

    pub fn access(pa: PhysAddr, size: usize) -> Result<*mut u8> {
        let windows = WINDOWS.lock();
        for w in windows.iter() {
            let offset = pa.as_u64().wrapping_sub(w.base);
            if pa.as_u64() >= w.base && (offset as usize).saturating_add(size) <= w.len {
                return Ok((w.ptr + offset as usize) as *mut u8);
            }
        }
        Err(Error::AddrInvalid)
    }
}

#[cfg(target_os = "none")]
pub use imp::set_linear_offset;

#[cfg(not(target_os = "none"))]
pub use imp::register_buffer;

/// Returns a hypervisor pointer covering `size` bytes at physical `pa`.
///
/// Fails with [`Error::AddrInvalid`] if the range is not covered by the
/// linear map (or, on the host, by a registered buffer).
pub fn access(pa: PhysAddr, size: usize) -> Result<*mut u8> {
    imp::access(pa, size)
}

/// Zeroes `size` bytes of physical memory at `pa`.
pub fn zero_range(pa: PhysAddr, size: usize) -> Result<()> {
    let ptr = access(pa, size)?;
    // SAFETY: `access` guarantees `size` writable bytes at `ptr`.
    unsafe { core::ptr::write_bytes(ptr, 0, size) };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_window_resolves() {
        let mut buf = [0xaau8; 64];
        let base = buf.as_mut_ptr() as usize;
        register_buffer(PhysAddr::new(0xdead_0000), &mut buf);
        let p = access(PhysAddr::new(0xdead_0010), 16).unwrap();
        assert_eq!(p as usize, base + 0x10);
        assert!(access(PhysAddr::new(0xdead_0000), 65).is_err());
        assert!(access(PhysAddr::new(0x1234_0000), 4).is_err());
    }

    #[test]
    fn zero_range_clears() {
        let mut buf = [0xffu8; 32];
        register_buffer(PhysAddr::new(0xbeef_0000), &mut buf);
        zero_range(PhysAddr::new(0xbeef_0008), 8).unwrap();
        assert_eq!(&buf[0..8], &[0xff; 8]);
        assert_eq!(&buf[8..16], &[0; 8]);
        assert_eq!(&buf[16..32], &[0xff; 16]);
    }
}
