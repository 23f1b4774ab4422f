//! # Channel Mask Control
//!
//! Raw bit operations on the shared pending/mask bitmaps and on the
//! per-CPU affinity caches. A channel is visible to CPU `n`'s upcall scan
//! only while its bit is set in CPU `n`'s cache; at rest every channel's
//! bit is set in exactly one cache.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::bitmap::AtomicBitmap;
use crate::shared::SharedInfo;
use crate::types::{Channel, CpuId};
use crate::NR_CHANNELS;

/// Shared bitmaps plus the per-CPU affinity caches
#[derive(Debug)]
pub struct ChannelMasks {
    shared: Arc<SharedInfo>,
    cpu_masks: Box<[AtomicBitmap]>,
}

impl ChannelMasks {
    /// Create the caches with every channel owned by CPU 0
    pub fn new(shared: Arc<SharedInfo>, nr_cpus: usize) -> Self {
        let cpu_masks: Vec<AtomicBitmap> = (0..nr_cpus)
            .map(|cpu| AtomicBitmap::filled(NR_CHANNELS, cpu == 0))
            .collect();
        Self {
            shared,
            cpu_masks: cpu_masks.into_boxed_slice(),
        }
    }

    /// Shared information page
    #[inline]
    pub fn shared(&self) -> &SharedInfo {
        &self.shared
    }

    /// Affinity cache of one CPU
    #[inline]
    pub fn cpu_mask(&self, cpu: CpuId) -> &AtomicBitmap {
        &self.cpu_masks[cpu.index()]
    }

    /// Hand every channel back to CPU 0
    pub fn reset_cpu_bindings(&self) {
        for (cpu, mask) in self.cpu_masks.iter().enumerate() {
            mask.fill(if cpu == 0 { u64::MAX } else { 0 });
        }
    }

    // -------------------------------------------------------------------------
    // Shared bitmap operations
    // -------------------------------------------------------------------------

    /// Mask a channel
    #[inline]
    pub fn mask(&self, channel: Channel) {
        self.shared.mask().set(channel.index());
    }

    /// Mask a channel, returning whether it was already masked
    #[inline]
    pub fn test_and_mask(&self, channel: Channel) -> bool {
        self.shared.mask().test_and_set(channel.index())
    }

    /// Mask every channel
    pub fn mask_all(&self) {
        self.shared.mask().fill(u64::MAX);
    }

    /// Clear a channel's pending bit
    #[inline]
    pub fn clear(&self, channel: Channel) {
        self.shared.pending().clear(channel.index());
    }

    /// Set a channel's pending bit
    #[inline]
    pub fn set(&self, channel: Channel) {
        self.shared.pending().set(channel.index());
    }

    /// Test a channel's pending bit
    #[inline]
    pub fn test(&self, channel: Channel) -> bool {
        self.shared.pending().test(channel.index())
    }

    /// Unmask a channel owned by `cpu`, the calling CPU
    ///
    /// A real interrupt controller loses the edge while the source is
    /// masked; the hypervisor does not, so a pending channel re-raises the
    /// level-1 selector and the upcall here.
    pub fn unmask_local(&self, channel: Channel, cpu: CpuId) {
        self.shared.mask().clear(channel.index());
        if self.test(channel) {
            self.shared.vcpu(cpu).mark_word_pending(channel.word());
        }
    }

    // -------------------------------------------------------------------------
    // Affinity caches
    // -------------------------------------------------------------------------

    /// Channels in `word` that are pending, unmasked and owned by `cpu`
    #[inline]
    pub fn active(&self, cpu: CpuId, word: usize) -> u64 {
        self.shared.pending().word(word) & self.cpu_mask(cpu).word(word) & !self.shared.mask().word(word)
    }

    /// Move a channel from one CPU's cache to another's
    ///
    /// The old bit is cleared before the new one is set. A scan racing
    /// with the move may briefly see the channel in neither cache (the
    /// next pass delivers it) but never in both.
    pub fn move_channel(&self, channel: Channel, from: CpuId, to: CpuId) {
        self.cpu_mask(from).clear(channel.index());
        self.cpu_mask(to).set(channel.index());
    }
}
