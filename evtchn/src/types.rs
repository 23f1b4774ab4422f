//! # Identifiers
//!
//! Validated handles for the two number spaces this crate joins together:
//! hypervisor channels and native interrupt lines, plus the small keys used
//! by the per-CPU binding tables.

use core::fmt;

use crate::{BITS_PER_WORD, NR_CHANNELS, NR_IPIS, NR_VIRQS};

// =============================================================================
// Channel
// =============================================================================

/// Hypervisor event channel (port) number
///
/// Port 0 is never allocated by the hypervisor, so a `Channel` is always
/// in `1..NR_CHANNELS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel(u32);

impl Channel {
    /// Validate a raw port number
    #[inline]
    pub const fn new(raw: u32) -> Option<Self> {
        if raw != 0 && (raw as usize) < NR_CHANNELS {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Build a channel from a (word, bit) position in the bitmaps
    #[inline]
    pub const fn from_position(word: usize, bit: usize) -> Option<Self> {
        Self::new((word * BITS_PER_WORD + bit) as u32)
    }

    /// Raw port number
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Index into channel-sized tables
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Bitmap word holding this channel
    #[inline]
    pub const fn word(self) -> usize {
        self.index() / BITS_PER_WORD
    }

    /// Bit position inside its word
    #[inline]
    pub const fn bit(self) -> usize {
        self.index() % BITS_PER_WORD
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {}", self.0)
    }
}

// =============================================================================
// Line
// =============================================================================

/// Native interrupt line number
///
/// Only bounds-checked against the configured line space at the public
/// API boundary; everything past that trusts the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Line(u32);

impl Line {
    /// Wrap a raw line number
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw line number
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Index into line-sized tables
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "irq {}", self.0)
    }
}

// =============================================================================
// CPU and domain identifiers
// =============================================================================

/// Virtual CPU number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CpuId(u32);

impl CpuId {
    /// The boot CPU, which owns every channel by default
    pub const BOOT: Self = Self(0);

    /// Wrap a raw CPU number
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw CPU number
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Index into per-CPU tables
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Hypervisor domain identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainId(pub u16);

impl DomainId {
    /// The calling domain
    pub const SELF: Self = Self(0x7FF0);
}

// =============================================================================
// Per-CPU binding keys
// =============================================================================

/// Virtual interrupt number (timer, console, debug, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Virq(u32);

impl Virq {
    /// Per-CPU timer tick
    pub const TIMER: Self = Self(0);
    /// Request for the guest to dump debug state
    pub const DEBUG: Self = Self(1);
    /// Emergency console
    pub const CONSOLE: Self = Self(2);
    /// Domain has been destroyed
    pub const DOM_EXC: Self = Self(3);
    /// Trace buffer has records
    pub const TBUF: Self = Self(4);
    /// Debugger attention
    pub const DEBUGGER: Self = Self(6);
    /// Xenoprof overflow
    pub const XENOPROF: Self = Self(7);
    /// Console ring has data
    pub const CON_RING: Self = Self(8);
    /// Physical CPU state change
    pub const PCPU_STATE: Self = Self(9);

    /// Validate a raw virtual interrupt number
    #[inline]
    pub const fn new(raw: u32) -> Option<Self> {
        if (raw as usize) < NR_VIRQS {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Raw number as understood by the hypervisor
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Index into per-CPU virtual interrupt tables
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Inter-processor interrupt vectors carried over event channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IpiVector {
    /// Ask the target to reschedule
    Reschedule = 0,
    /// Run a queued function on many CPUs
    CallFunction = 1,
    /// Run a queued function on one CPU
    CallFunctionSingle = 2,
    /// Kick a waiter spinning on a lock
    SpinUnlock = 3,
    /// Run pending irq work
    IrqWork = 4,
    /// Non-maskable request
    Nmi = 5,
}

impl IpiVector {
    /// Every vector, in table order
    pub const ALL: [Self; NR_IPIS] = [
        Self::Reschedule,
        Self::CallFunction,
        Self::CallFunctionSingle,
        Self::SpinUnlock,
        Self::IrqWork,
        Self::Nmi,
    ];

    /// Index into per-CPU IPI tables
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}
