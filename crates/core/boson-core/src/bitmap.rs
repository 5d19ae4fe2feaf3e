//! Fixed-size atomic bitmaps.
//!
//! [`AtomicBitmap`] backs the structures that need lock-free bit state:
//! cap-table slot allocation, the VMID namespace, and per-CPU IPI reasons.
//! Word-level scanning with `trailing_zeros()` keeps find-first operations
//! cheap. Multi-bit packed fields (used by the memory database's bitmap
//! leaves) are provided by [`AtomicBitmap::extract`] and
//! [`AtomicBitmap::insert`]; a field never spans two words as long as its
//! width is a power of two, which keeps single-load/store accesses atomic.

use core::sync::atomic::{AtomicU64, Ordering};

/// Number of bits per bitmap word.
pub const WORD_BITS: usize = 64;

/// Returns the number of `u64` words needed to hold `bits` bits.
#[must_use]
pub const fn words_for(bits: usize) -> usize {
    bits.div_ceil(WORD_BITS)
}

/// A fixed-size bitmap of `WORDS * 64` bits with atomic bit operations.
pub struct AtomicBitmap<const WORDS: usize> {
    words: [AtomicU64; WORDS],
}

impl<const WORDS: usize> AtomicBitmap<WORDS> {
    /// Creates a bitmap with all bits clear.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            words: [const { AtomicU64::new(0) }; WORDS],
        }
    }

    /// Returns the total number of bits.
    #[must_use]
    pub const fn len(&self) -> usize {
        WORDS * WORD_BITS
    }

    /// Returns `true` if no bit is set in the first `bits` bits.
    #[must_use]
    pub fn is_empty(&self, bits: usize) -> bool {
        self.first_set(bits).is_none()
    }

    /// Reads bit `index`.
    #[must_use]
    pub fn test(&self, index: usize) -> bool {
        let word = self.words[index / WORD_BITS].load(Ordering::Relaxed);
        word & (1u64 << (index % WORD_BITS)) != 0
    }

    /// Sets bit `index`.
    pub fn set(&self, index: usize) {
        self.words[index / WORD_BITS].fetch_or(1u64 << (index % WORD_BITS), Ordering::Relaxed);
    }

    /// Clears bit `index`.
    pub fn clear(&self, index: usize) {
        self.words[index / WORD_BITS].fetch_and(!(1u64 << (index % WORD_BITS)), Ordering::Relaxed);
    }

    /// Atomically sets bit `index`, returning its previous value.
    pub fn test_and_set(&self, index: usize) -> bool {
        let bit = 1u64 << (index % WORD_BITS);
        self.words[index / WORD_BITS].fetch_or(bit, Ordering::Relaxed) & bit != 0
    }

    /// Atomically clears bit `index`, returning its previous value.
    pub fn test_and_clear(&self, index: usize) -> bool {
        let bit = 1u64 << (index % WORD_BITS);
        self.words[index / WORD_BITS].fetch_and(!bit, Ordering::Relaxed) & bit != 0
    }

    /// Returns the index of the first set bit among the first `bits` bits.
    #[must_use]
    pub fn first_set(&self, bits: usize) -> Option<usize> {
        self.scan(bits, |w| w)
    }

    /// Returns the index of the first clear bit among the first `bits` bits.
    #[must_use]
    pub fn first_clear(&self, bits: usize) -> Option<usize> {
        self.scan(bits, |w| !w)
    }

    fn scan(&self, bits: usize, xform: impl Fn(u64) -> u64) -> Option<usize> {
        debug_assert!(bits <= self.len());
        for (wi, word) in self.words.iter().enumerate().take(words_for(bits)) {
            let w = xform(word.load(Ordering::Relaxed));
            if w != 0 {
                let index = wi * WORD_BITS + w.trailing_zeros() as usize;
                if index < bits {
                    return Some(index);
                }
            }
        }
        None
    }

    /// Extracts a `width`-bit field starting at bit `offset`.
    ///
    /// `width` must be a power of two no larger than 64, and the field must
    /// not span a word boundary (guaranteed when `offset` is a multiple of
    /// `width`).
    #[must_use]
    pub fn extract(&self, offset: usize, width: u32) -> u64 {
        debug_assert!(width.is_power_of_two() && width as usize <= WORD_BITS);
        debug_assert_eq!(offset % width as usize, 0);
        let word = self.words[offset / WORD_BITS].load(Ordering::Relaxed);
        (word >> (offset % WORD_BITS)) & crate::util::mask(width)
    }

    /// Stores `value` into a `width`-bit field starting at bit `offset`.
    ///
    /// Same constraints as [`extract`](Self::extract). The update is a single
    /// read-modify-write on the containing word.
    pub fn insert(&self, offset: usize, width: u32, value: u64) {
        debug_assert!(width.is_power_of_two() && width as usize <= WORD_BITS);
        debug_assert_eq!(offset % width as usize, 0);
        debug_assert!(value <= crate::util::mask(width));
        let shift = offset % WORD_BITS;
        let field_mask = crate::util::mask(width) << shift;
        let word = &self.words[offset / WORD_BITS];
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            let new = (cur & !field_mask) | (value << shift);
            match word.compare_exchange_weak(cur, new, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }
}

impl<const WORDS: usize> Default for AtomicBitmap<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_test() {
        let bm = AtomicBitmap::<2>::new();
        assert!(!bm.test(70));
        bm.set(70);
        assert!(bm.test(70));
        bm.clear(70);
        assert!(!bm.test(70));
    }

    #[test]
    fn test_and_set_reports_previous() {
        let bm = AtomicBitmap::<1>::new();
        assert!(!bm.test_and_set(3));
        assert!(bm.test_and_set(3));
        assert!(bm.test_and_clear(3));
        assert!(!bm.test_and_clear(3));
    }

    #[test]
    fn first_set_and_clear() {
        let bm = AtomicBitmap::<2>::new();
        assert_eq!(bm.first_set(128), None);
        assert_eq!(bm.first_clear(128), Some(0));
        bm.set(0);
        bm.set(1);
        assert_eq!(bm.first_clear(128), Some(2));
        bm.set(100);
        assert_eq!(bm.first_set(128), Some(0));
        bm.clear(0);
        bm.clear(1);
        assert_eq!(bm.first_set(128), Some(100));
        // A set bit past the scan limit is not reported.
        assert_eq!(bm.first_set(100), None);
    }

    #[test]
    fn is_empty_respects_limit() {
        let bm = AtomicBitmap::<1>::new();
        bm.set(10);
        assert!(!bm.is_empty(64));
        assert!(bm.is_empty(10));
    }

    #[test]
    fn packed_fields() {
        let bm = AtomicBitmap::<2>::new();
        // 2-bit fields, 64 of them.
        for i in 0..64 {
            bm.insert(i * 2, 2, (i % 4) as u64);
        }
        for i in 0..64 {
            assert_eq!(bm.extract(i * 2, 2), (i % 4) as u64);
        }
        bm.insert(10, 2, 3);
        assert_eq!(bm.extract(10, 2), 3);
        // Neighbors untouched.
        assert_eq!(bm.extract(8, 2), 0);
        assert_eq!(bm.extract(12, 2), 2);
    }
}
