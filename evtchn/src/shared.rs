//! # Shared Information Page
//!
//! The state the hypervisor and the guest both write:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ pending[NR_CHANNEL_WORDS]   set by hypervisor, cleared   │
//! │                             by the guest                 │
//! │ mask[NR_CHANNEL_WORDS]      owned by the guest           │
//! ├──────────────────────────────────────────────────────────┤
//! │ vcpu[n].upcall_pending      "an upcall is wanted"        │
//! │ vcpu[n].upcall_mask         upcalls blocked on this vcpu │
//! │ vcpu[n].pending_sel         level-1: words with pending  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything is atomic; neither side ever takes a lock on this page.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::bitmap::AtomicBitmap;
use crate::types::{Channel, CpuId};
use crate::NR_CHANNELS;

// =============================================================================
// Per-VCPU info
// =============================================================================

/// Per-VCPU upcall state
#[derive(Debug, Default)]
pub struct VcpuInfo {
    /// Set by the hypervisor when an upcall is wanted
    pub upcall_pending: AtomicBool,
    /// Upcalls are blocked while set
    pub upcall_mask: AtomicBool,
    /// Level-1 selector: bit `w` set means word `w` may hold pending channels
    pub pending_sel: AtomicU64,
}

impl VcpuInfo {
    /// Flag word `word` in the selector, raising the upcall if it was clear
    ///
    /// Returns `true` if this call raised the upcall.
    #[inline]
    pub fn mark_word_pending(&self, word: usize) -> bool {
        let bit = 1u64 << word;
        if self.pending_sel.fetch_or(bit, Ordering::SeqCst) & bit == 0 {
            self.upcall_pending.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Take the whole selector, leaving it empty
    #[inline]
    pub fn take_pending_words(&self) -> u64 {
        self.pending_sel.swap(0, Ordering::SeqCst)
    }

    /// Whether an upcall has been requested since the flag was last cleared
    #[inline]
    pub fn upcall_pending(&self) -> bool {
        self.upcall_pending.load(Ordering::SeqCst)
    }

    /// Clear the upcall request flag
    #[inline]
    pub fn clear_upcall_pending(&self) {
        self.upcall_pending.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Shared info
// =============================================================================

/// Guest view of the shared information page
#[derive(Debug)]
pub struct SharedInfo {
    pending: AtomicBitmap,
    mask: AtomicBitmap,
    vcpus: Box<[VcpuInfo]>,
}

impl SharedInfo {
    /// Create the page for `nr_cpus` virtual CPUs, every channel idle and unmasked
    pub fn new(nr_cpus: usize) -> Self {
        let vcpus: Vec<VcpuInfo> = (0..nr_cpus).map(|_| VcpuInfo::default()).collect();
        Self {
            pending: AtomicBitmap::new(NR_CHANNELS),
            mask: AtomicBitmap::new(NR_CHANNELS),
            vcpus: vcpus.into_boxed_slice(),
        }
    }

    /// Global pending bitmap
    #[inline]
    pub fn pending(&self) -> &AtomicBitmap {
        &self.pending
    }

    /// Global mask bitmap
    #[inline]
    pub fn mask(&self) -> &AtomicBitmap {
        &self.mask
    }

    /// Upcall state of one VCPU
    #[inline]
    pub fn vcpu(&self, cpu: CpuId) -> &VcpuInfo {
        &self.vcpus[cpu.index()]
    }

    /// Number of VCPUs described by the page
    #[inline]
    pub fn nr_vcpus(&self) -> usize {
        self.vcpus.len()
    }

    /// Whether a channel is pending
    #[inline]
    pub fn is_pending(&self, channel: Channel) -> bool {
        self.pending.test(channel.index())
    }

    /// Whether a channel is globally masked
    #[inline]
    pub fn is_masked(&self, channel: Channel) -> bool {
        self.mask.test(channel.index())
    }
}
