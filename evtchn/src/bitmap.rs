//! # Atomic Bitmaps
//!
//! Word-granular bitmaps over `AtomicU64`. Every bit operation is a single
//! atomic read-modify-write so the bitmaps can be shared with the
//! hypervisor and with other CPUs without a lock.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::BITS_PER_WORD;

/// Fixed-capacity bitmap of atomic words
#[derive(Debug)]
pub struct AtomicBitmap {
    words: Box<[AtomicU64]>,
}

impl AtomicBitmap {
    /// Create a bitmap able to hold `bits` bits, all clear
    pub fn new(bits: usize) -> Self {
        Self::filled(bits, false)
    }

    /// Create a bitmap with every word set to all-ones or all-zeroes
    pub fn filled(bits: usize, set: bool) -> Self {
        let nwords = bits.div_ceil(BITS_PER_WORD);
        let init = if set { u64::MAX } else { 0 };
        let words: Vec<AtomicU64> = (0..nwords).map(|_| AtomicU64::new(init)).collect();
        Self {
            words: words.into_boxed_slice(),
        }
    }

    /// Number of words
    #[inline]
    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Number of addressable bits
    #[inline]
    pub fn capacity(&self) -> usize {
        self.words.len() * BITS_PER_WORD
    }

    #[inline]
    fn locate(&self, bit: usize) -> (&AtomicU64, u64) {
        (&self.words[bit / BITS_PER_WORD], 1u64 << (bit % BITS_PER_WORD))
    }

    /// Set a bit
    #[inline]
    pub fn set(&self, bit: usize) {
        let (word, mask) = self.locate(bit);
        word.fetch_or(mask, Ordering::SeqCst);
    }

    /// Clear a bit
    #[inline]
    pub fn clear(&self, bit: usize) {
        let (word, mask) = self.locate(bit);
        word.fetch_and(!mask, Ordering::SeqCst);
    }

    /// Test a bit
    #[inline]
    pub fn test(&self, bit: usize) -> bool {
        let (word, mask) = self.locate(bit);
        word.load(Ordering::SeqCst) & mask != 0
    }

    /// Set a bit, returning its previous value
    #[inline]
    pub fn test_and_set(&self, bit: usize) -> bool {
        let (word, mask) = self.locate(bit);
        word.fetch_or(mask, Ordering::SeqCst) & mask != 0
    }

    /// Clear a bit, returning its previous value
    #[inline]
    pub fn test_and_clear(&self, bit: usize) -> bool {
        let (word, mask) = self.locate(bit);
        word.fetch_and(!mask, Ordering::SeqCst) & mask != 0
    }

    /// Read a whole word
    #[inline]
    pub fn word(&self, index: usize) -> u64 {
        self.words[index].load(Ordering::SeqCst)
    }

    /// Overwrite every word with the same value
    pub fn fill(&self, value: u64) {
        for word in self.words.iter() {
            word.store(value, Ordering::SeqCst);
        }
    }

    /// Iterate over the indices of set bits, lowest first
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.word_count()).flat_map(move |index| {
            let mut bits = self.word(index);
            core::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(index * BITS_PER_WORD + bit)
            })
        })
    }
}
