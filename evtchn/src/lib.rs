//! # Helix Event Channels
//!
//! Interrupt virtualization for guests running on a hypervisor that
//! signals through a fixed bank of event channels instead of interrupt
//! lines. Channels are multiplexed onto the native line space so ordinary
//! drivers can keep using enable/disable/acknowledge on lines.
//!
//! ## Channel Sources
//!
//! - **Inter-domain**: virtual device notifications from another domain
//! - **VIRQ**: per-CPU virtual interrupts such as the timer tick
//! - **IPI**: inter-processor interrupts
//! - **PIRQ**: physical interrupts passed through by the hypervisor
//!
//! ## Components
//!
//! ```text
//!   driver ──bind──► BindingTable ◄──lock── AffinityTracker / PIRQ lifecycle
//!                        ▲
//!                        │ lock-free lookup
//!   upcall ──► Demultiplexer ──► LineSubsystem::dispatch(line)
//!                        │
//!                        ▼
//!              ChannelMasks (shared pending/mask, per-CPU caches)
//! ```
//!
//! All table mutations serialize on one update lock. The upcall path never
//! takes it: it only performs atomic bit operations and lock-free lookups.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod affinity;
pub mod allocator;
pub mod binding;
pub mod bitmap;
pub mod chip;
pub mod config;
pub mod debug;
pub mod events;
pub mod hypervisor;
pub mod lines;
pub mod mask;
pub mod pirq;
pub mod resume;
pub mod shared;
pub mod types;
pub mod upcall;

#[cfg(test)]
mod testing;

use core::fmt;

pub use affinity::AffinityChange;
pub use binding::{LineDescriptor, LineKind, PirqInfo};
pub use chip::{ChipOp, ChipOutcome};
pub use config::EventConfig;
pub use events::EventChannels;
pub use hypervisor::{Hypervisor, HypercallError, HypercallResult};
pub use lines::{Controller, HandlerFlags, IrqResult, LineError, LineHandler, LineStatus, LineSubsystem};
pub use shared::{SharedInfo, VcpuInfo};
pub use types::{Channel, CpuId, DomainId, IpiVector, Line, Virq};

// =============================================================================
// Constants
// =============================================================================

/// Channels per guest
pub const NR_CHANNELS: usize = 1024;

/// Bits per bitmap word
pub const BITS_PER_WORD: usize = 64;

/// Words in each channel bitmap
pub const NR_CHANNEL_WORDS: usize = NR_CHANNELS / BITS_PER_WORD;

/// Virtual interrupt numbers per CPU
pub const NR_VIRQS: usize = 24;

/// IPI vectors per CPU
pub const NR_IPIS: usize = 6;

static_assertions::const_assert_eq!(NR_CHANNELS % BITS_PER_WORD, 0);
// The level-1 selector is a single word.
static_assertions::const_assert!(NR_CHANNEL_WORDS <= BITS_PER_WORD);
static_assertions::const_assert!(NR_CHANNELS <= u16::MAX as usize);

// =============================================================================
// Errors
// =============================================================================

/// Result type for event channel operations
pub type EventResult<T> = Result<T, EventError>;

/// Event channel errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventError {
    /// The hypervisor rejected a call
    Hypercall(HypercallError),
    /// The line subsystem refused a handler
    Line(LineError),
    /// No channel could be obtained for the line
    NoChannel,
    /// The line is not bound
    NotBound,
    /// The line is bound, but not to the kind the operation needs
    WrongKind,
    /// No line or vector available for the request
    NoSpace,
    /// Line number outside the line space
    InvalidLine,
    /// CPU number outside the configured CPUs
    InvalidCpu,
}

impl From<HypercallError> for EventError {
    fn from(err: HypercallError) -> Self {
        EventError::Hypercall(err)
    }
}

impl From<LineError> for EventError {
    fn from(err: LineError) -> Self {
        EventError::Line(err)
    }
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::Hypercall(err) => write!(f, "{}", err),
            EventError::Line(err) => write!(f, "line subsystem: {}", err),
            EventError::NoChannel => f.write_str("no event channel available"),
            EventError::NotBound => f.write_str("line not bound"),
            EventError::WrongKind => f.write_str("wrong binding kind"),
            EventError::NoSpace => f.write_str("no space"),
            EventError::InvalidLine => f.write_str("invalid line"),
            EventError::InvalidCpu => f.write_str("invalid cpu"),
        }
    }
}
