//! Atomically updatable capability data.
//!
//! A capability's payload — object pointer, type, state, rights and the
//! master flag — must change as one unit: lookups race with copy, delete
//! and revoke, and must never observe a half-written cap. The payload packs
//! into two 64-bit words; [`CapCell`] makes the pair effectively atomic
//! with a sequence-lock. Readers are lock-free (they retry on a torn read),
//! writers serialize per slot on the odd/even sequence word. This is the
//! portable rendition of a double-word-CAS cell; slots are never observed
//! blocking a lookup.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

use boson_core::error::{Error, Result};
use boson_obj::ObjectType;

use crate::rights::CapRights;

/// Lifecycle state of a capability slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CapState {
    /// Empty slot. Zero, so a zeroed cell reads as null.
    Null = 0,
    /// Live capability.
    Valid = 1,
    /// Revoked; only deletable.
    Revoked = 2,
}

/// The 16-byte capability payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapData {
    /// Referenced object, or null for NULL/REVOKED caps.
    pub object: *const (),
    /// Type of the referenced object.
    pub otype: ObjectType,
    /// Slot state.
    pub state: CapState,
    /// Rights bitmap.
    pub rights: CapRights,
    /// Set on the object's master cap (the revocation anchor).
    pub master: bool,
}

// SAFETY: CapData is a plain value; the pointed-to object's thread safety
// is the object's own concern.
unsafe impl Send for CapData {}
unsafe impl Sync for CapData {}

impl CapData {
    /// The empty-slot payload.
    pub const NULL: Self = Self {
        object: core::ptr::null(),
        otype: ObjectType::Any,
        state: CapState::Null,
        rights: 0,
        master: false,
    };

    fn pack(self) -> (u64, u64) {
        let info = u64::from(self.rights)
            | (self.otype as u64) << 32
            | (self.state as u64) << 40
            | u64::from(self.master) << 42;
        (self.object as u64, info)
    }

    fn unpack(words: (u64, u64)) -> Self {
        let (object, info) = words;
        let state = match (info >> 40) & 0x3 {
            0 => CapState::Null,
            1 => CapState::Valid,
            _ => CapState::Revoked,
        };
        Self {
            object: object as *const (),
            otype: ObjectType::from_raw(((info >> 32) & 0xff) as u8).unwrap_or(ObjectType::Any),
            state,
            rights: info as u32,
            master: (info >> 42) & 1 != 0,
        }
    }
}

/// A sequence-locked two-word cell holding a [`CapData`].
pub struct CapCell {
    /// Even: stable. Odd: a writer is mid-update.
    seq: AtomicU32,
    w0: AtomicU64,
    w1: AtomicU64,
}

impl CapCell {
    /// Creates a cell holding [`CapData::NULL`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            w0: AtomicU64::new(0),
            w1: AtomicU64::new(0),
        }
    }

    /// Reads the payload. Lock-free; retries while a writer is mid-update.
    pub fn load(&self) -> CapData {
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 & 1 != 0 {
                core::hint::spin_loop();
                continue;
            }
            let w0 = self.w0.load(Ordering::Acquire);
            let w1 = self.w1.load(Ordering::Acquire);
            // Order the data loads before the re-check.
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == s1 {
                return CapData::unpack((w0, w1));
            }
            core::hint::spin_loop();
        }
    }

    /// Acquires the writer side of the sequence lock.
    fn write_lock(&self) -> u32 {
        loop {
            let s = self.seq.load(Ordering::Relaxed);
            if s & 1 == 0
                && self
                    .seq
                    .compare_exchange_weak(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return s;
            }
            core::hint::spin_loop();
        }
    }

    fn write_unlock(&self, s: u32) {
        self.seq.store(s.wrapping_add(2), Ordering::Release);
    }

    /// Unconditionally stores `data`.
    pub fn store(&self, data: CapData) {
        let (w0, w1) = data.pack();
        let s = self.write_lock();
        self.w0.store(w0, Ordering::Release);
        self.w1.store(w1, Ordering::Release);
        self.write_unlock(s);
    }

    /// Stores `new` only if the cell still holds `expected`.
    ///
    /// Fails with [`Error::Busy`] if the payload changed since it was read;
    /// with `new == expected` this doubles as a has-it-changed check.
    pub fn compare_exchange(&self, expected: CapData, new: CapData) -> Result<()> {
        let s = self.write_lock();
        let current = CapData::unpack((
            self.w0.load(Ordering::Relaxed),
            self.w1.load(Ordering::Relaxed),
        ));
        let result = if current == expected {
            let (w0, w1) = new.pack();
            self.w0.store(w0, Ordering::Release);
            self.w1.store(w1, Ordering::Release);
            Ok(())
        } else {
            Err(Error::Busy)
        };
        self.write_unlock(s);
        result
    }
}

impl Default for CapCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(object: usize) -> CapData {
        CapData {
            object: object as *const (),
            otype: ObjectType::MsgQueue,
            state: CapState::Valid,
            rights: 0xa5a5_0f0f,
            master: true,
        }
    }

    #[test]
    fn pack_roundtrip() {
        let data = sample(0x1234_5678_9abc);
        assert_eq!(CapData::unpack(data.pack()), data);
        assert_eq!(CapData::unpack(CapData::NULL.pack()), CapData::NULL);
    }

    #[test]
    fn store_load() {
        let cell = CapCell::new();
        assert_eq!(cell.load(), CapData::NULL);
        cell.store(sample(0x4000));
        assert_eq!(cell.load(), sample(0x4000));
    }

    #[test]
    fn compare_exchange_detects_change() {
        let cell = CapCell::new();
        cell.store(sample(0x4000));
        // No-op exchange succeeds while unchanged.
        assert_eq!(cell.compare_exchange(sample(0x4000), sample(0x4000)), Ok(()));
        assert_eq!(cell.compare_exchange(sample(0x4000), sample(0x8000)), Ok(()));
        // Stale expectation fails.
        assert_eq!(
            cell.compare_exchange(sample(0x4000), CapData::NULL),
            Err(Error::Busy)
        );
        assert_eq!(cell.load(), sample(0x8000));
    }

    #[test]
    fn torn_reads_are_impossible_across_threads() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicBool;

        let cell = Arc::new(CapCell::new());
        let stop = Arc::new(AtomicBool::new(false));
        let a = sample(0xaaaa_0000);
        let b = sample(0xbbbb_0000);

        let writer = {
            let cell = Arc::clone(&cell);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    cell.store(a);
                    cell.store(b);
                }
            })
        };

        for _ in 0..100_000 {
            let seen = cell.load();
            assert!(seen == a || seen == b || seen == CapData::NULL);
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }
}
