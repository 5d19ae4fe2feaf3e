//! Boot-seeded pseudo-random numbers.
//!
//! Capability-space ID randomization needs a modest-quality PRNG seeded once
//! per boot. The generator is SplitMix64 over a global atomic state, which
//! is lock-free and good enough for ID scrambling (it is not a CSPRNG and
//! nothing here treats it as one). The kernel seeds it from platform entropy
//! during cold boot; host builds start from a fixed default so tests are
//! deterministic unless they reseed.

use core::sync::atomic::{AtomicU64, Ordering};

static STATE: AtomicU64 = AtomicU64::new(0x9e37_79b9_7f4a_7c15);

/// Seeds the generator (boot only).
pub fn seed(value: u64) {
    STATE.store(value, Ordering::Relaxed);
}

/// Returns the next pseudo-random 64-bit value.
#[must_use]
pub fn next_u64() -> u64 {
    let mut z = STATE.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
