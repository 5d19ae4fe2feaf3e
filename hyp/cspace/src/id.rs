//! Capability ID randomization.
//!
//! VM-visible cap IDs are scrambled so that guests cannot predict or probe
//! the internally linear cspace index space, and so IDs differ on every
//! boot. Encoding multiplies the linear `(upper, lower)` index pair by a
//! random 16-bit multiplier and XORs in a random 64-bit base; decoding
//! multiplies by the precomputed fixed-point inverse and validates that
//! both halves round-trip.
//!
//! A larger multiplier would scramble better, but would need 128-bit
//! multiplies and a more involved inverse computation.

use boson_core::error::{Error, Result};
use boson_core::rand;

use crate::{CAP_SLOTS_PER_TABLE, NUM_CAP_TABLES};

/// A VM-visible capability identifier.
pub type CapId = u64;

/// The per-cspace cap-ID scrambler.
#[derive(Debug, Clone)]
pub struct IdEncoder {
    base: u64,
    mult: u64,
    inv: u64,
}

impl IdEncoder {
    /// Creates an encoder with freshly drawn randomness.
    #[must_use]
    pub fn new_random() -> Self {
        // Cap IDs of the form 0xffffffff_xxxxxxxx are reserved for special
        // values (the invalid cap is -1, for instance), so re-draw any base
        // that could produce them.
        let mut base = rand::next_u64();
        while (base >> 32) >= 0xffff_ff00 {
            base = rand::next_u64();
        }

        // Pick a non-zero 16-bit multiplier.
        let mut mult = rand::next_u64();
        while mult & 0xffff == 0 {
            mult = (0x5555u64 << 48) | (mult >> 16);
        }

        Self::with_params(base, mult & 0xffff)
    }

    /// Creates an encoder with explicit parameters.
    ///
    /// # Panics
    ///
    /// Panics if `mult` is zero or wider than 16 bits.
    #[must_use]
    pub fn with_params(base: u64, mult: u64) -> Self {
        assert!(mult != 0 && mult <= 0xffff);
        Self {
            base,
            mult,
            inv: (1u64 << 32) / mult + 1,
        }
    }

    fn pack(upper: usize, lower: usize) -> u64 {
        debug_assert!(upper < NUM_CAP_TABLES && lower < CAP_SLOTS_PER_TABLE);
        ((upper as u64) << 8) | lower as u64
    }

    /// Encodes a table/slot index pair as a VM-visible cap ID.
    #[must_use]
    pub fn encode(&self, upper: usize, lower: usize) -> CapId {
        (Self::pack(upper, lower).wrapping_mul(self.mult)) ^ self.base
    }

    /// Decodes a cap ID back to its `(upper, lower)` index pair.
    pub fn decode(&self, id: CapId) -> Result<(usize, usize)> {
        let r = id ^ self.base;
        let v = r.wrapping_mul(self.inv) >> 32;

        if r != u64::from(r as u32) || v != u64::from(v as u16) {
            return Err(Error::ArgumentInvalid);
        }

        let upper = (v >> 8) as usize;
        let lower = (v & 0xff) as usize;
        if upper < NUM_CAP_TABLES && lower < CAP_SLOTS_PER_TABLE {
            Ok((upper, lower))
        } else {
            Err(Error::ArgumentInvalid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_indices() {
        let enc = IdEncoder::with_params(0x1234_5678, 0x1111);
        for upper in 0..NUM_CAP_TABLES {
            for lower in 0..CAP_SLOTS_PER_TABLE {
                let id = enc.encode(upper, lower);
                assert_eq!(enc.decode(id), Ok((upper, lower)));
            }
        }
    }

    #[test]
    fn ids_are_unique() {
        let enc = IdEncoder::with_params(0xdead_beef, 0x2b2b);
        let mut seen = std::collections::HashSet::new();
        for upper in 0..NUM_CAP_TABLES {
            for lower in 0..CAP_SLOTS_PER_TABLE {
                assert!(seen.insert(enc.encode(upper, lower)));
            }
        }
    }

    #[test]
    fn garbage_ids_rejected() {
        let enc = IdEncoder::with_params(0x1234_5678, 0x1111);
        assert_eq!(enc.decode(u64::MAX), Err(Error::ArgumentInvalid));
        assert_eq!(enc.decode(0xffff_ffff_0000_0000), Err(Error::ArgumentInvalid));
        // An index beyond the table limits decodes but is rejected.
        let big = ((0xffu64 << 8) | 0xff).wrapping_mul(0x1111) ^ 0x1234_5678;
        assert_eq!(enc.decode(big), Err(Error::ArgumentInvalid));
    }

    #[test]
    fn random_encoder_avoids_reserved_range() {
        for _ in 0..64 {
            let enc = IdEncoder::new_random();
            assert!(enc.base >> 32 < 0xffff_ff00);
            assert!(enc.mult != 0 && enc.mult <= 0xffff);
        }
    }
}
