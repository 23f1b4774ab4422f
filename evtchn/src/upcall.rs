//! # Upcall Demultiplexer
//!
//! Runs on every upcall and turns pending channels into line dispatches.
//!
//! ## Two-Level Scan
//!
//! The level-1 selector says which 64-bit words of the pending bitmap may
//! hold work; the level-2 words hold one bit per channel. A channel is
//! delivered on this CPU when it is pending, not masked, and present in the
//! CPU's affinity cache.
//!
//! ## Fairness
//!
//! Each CPU remembers where its last scan stopped, and the next scan starts
//! just after that point. The starting word is visited twice: from the
//! cursor to its end first, then from its beginning once every other word
//! has had its turn. A channel that fires continuously cannot starve the
//! channels behind it.
//!
//! ## Re-entry
//!
//! A dispatch may re-enable interrupts and take another upcall on the same
//! CPU. The nested call only bumps the per-CPU nesting counter and returns;
//! the outer call sees the bumped counter and runs another pass.
//!
//! This path takes no lock and never logs.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::events::EventChannels;
use crate::hypervisor::Hypervisor;
use crate::lines::LineSubsystem;
use crate::types::{Channel, CpuId};
use crate::{EventResult, BITS_PER_WORD, NR_CHANNEL_WORDS};

/// Per-CPU demultiplexer state
#[derive(Debug, Default)]
pub struct UpcallState {
    nesting: AtomicU32,
    word: AtomicUsize,
    bit: AtomicUsize,
}

impl UpcallState {
    /// Fresh state: not running, cursor at the first channel
    pub const fn new() -> Self {
        Self {
            nesting: AtomicU32::new(0),
            word: AtomicUsize::new(0),
            bit: AtomicUsize::new(0),
        }
    }

    /// Where the next scan starts, as `(word, bit)`
    #[inline]
    pub fn cursor(&self) -> (usize, usize) {
        (self.word.load(Ordering::Relaxed), self.bit.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_cursor(&self, word: usize, bit: usize) {
        self.word.store(word, Ordering::Relaxed);
        self.bit.store(bit, Ordering::Relaxed);
    }

    /// Upcalls entered and not yet drained
    #[inline]
    pub fn nesting(&self) -> u32 {
        self.nesting.load(Ordering::Relaxed)
    }
}

/// Bits of `value` at or above `index`
#[inline]
const fn mask_lsbs(value: u64, index: usize) -> u64 {
    value & (u64::MAX << index)
}

impl<H: Hypervisor, L: LineSubsystem> EventChannels<H, L> {
    /// Demultiplex pending channels on `cpu`
    ///
    /// Called from the upcall entry with interrupts disabled. Every pending,
    /// unmasked channel owned by `cpu` is masked, cleared and dispatched to
    /// its line exactly once per pass; channels without a line are masked
    /// and cleared only.
    ///
    /// # Panics
    /// If `cpu` is not below the configured CPU count. The trap entry passes
    /// the CPU it runs on, so it is not checked on this path.
    pub fn do_upcall(&self, cpu: CpuId) {
        let state = &self.upcall[cpu.index()];
        let vcpu = self.masks.shared().vcpu(cpu);

        loop {
            vcpu.clear_upcall_pending();

            if state.nesting.fetch_add(1, Ordering::SeqCst) != 0 {
                return;
            }

            let mut pending_words = vcpu.take_pending_words();

            let (start_word, start_bit) = state.cursor();
            let mut word_idx = start_word;
            let mut pass = 0usize;

            while pending_words != 0 {
                let words = mask_lsbs(pending_words, word_idx);

                // Nothing at or after the cursor; wrap around.
                if words == 0 {
                    word_idx = 0;
                    pass += 1;
                    continue;
                }
                word_idx = words.trailing_zeros() as usize;

                let pending_bits = self.masks.active(cpu, word_idx);
                let mut bit_idx = if word_idx == start_word && pass == 0 {
                    start_bit
                } else {
                    0
                };

                loop {
                    let bits = mask_lsbs(pending_bits, bit_idx);
                    if bits == 0 {
                        break;
                    }
                    bit_idx = bits.trailing_zeros() as usize;

                    self.deliver(word_idx, bit_idx);

                    bit_idx = (bit_idx + 1) % BITS_PER_WORD;

                    // Next scan starts just after the channel delivered last.
                    let next_word = if bit_idx != 0 {
                        word_idx
                    } else {
                        (word_idx + 1) % NR_CHANNEL_WORDS
                    };
                    state.set_cursor(next_word, bit_idx);

                    if bit_idx == 0 {
                        break;
                    }
                }

                // The start word is scanned twice, every other word once.
                if word_idx != start_word || pass != 0 {
                    pending_words &= !(1u64 << word_idx);
                }

                word_idx = (word_idx + 1) % NR_CHANNEL_WORDS;
                pass += 1;
            }

            let count = state.nesting.swap(0, Ordering::SeqCst);
            if count == 1 && !vcpu.upcall_pending() {
                break;
            }
        }
    }

    /// Mask, clear and dispatch the channel at `(word, bit)`
    #[inline]
    fn deliver(&self, word: usize, bit: usize) {
        let index = word * BITS_PER_WORD + bit;
        let shared = self.masks.shared();
        shared.mask().set(index);
        shared.pending().clear(index);

        if let Some(line) = Channel::from_position(word, bit).and_then(|channel| self.table.line_of(channel)) {
            self.lines.dispatch(line);
        }
    }

    /// Where `cpu`'s next scan starts, as `(word, bit)`
    pub fn upcall_cursor(&self, cpu: CpuId) -> EventResult<(usize, usize)> {
        self.check_cpu(cpu)?;
        Ok(self.upcall[cpu.index()].cursor())
    }

    /// Upcalls entered on `cpu` and not yet drained
    pub fn upcall_nesting(&self, cpu: CpuId) -> EventResult<u32> {
        self.check_cpu(cpu)?;
        Ok(self.upcall[cpu.index()].nesting())
    }
}
