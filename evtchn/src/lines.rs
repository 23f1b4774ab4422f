//! # Line Interrupt Subsystem Interface
//!
//! The generic, line-based interrupt layer that drivers attach handlers to.
//! This crate registers a controller for every line it binds and feeds
//! demultiplexed channels into [`LineSubsystem::dispatch`].

use core::fmt;

use crate::types::{CpuId, Line};

/// Result of a line handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqResult {
    /// Interrupt was handled
    Handled,
    /// Interrupt was not for this handler
    NotHandled,
}

/// Line handler function type
pub type LineHandler = fn(line: Line, cookie: usize) -> IrqResult;

bitflags::bitflags! {
    /// Flags attached to a handler registration
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandlerFlags: u32 {
        /// Line may be shared between handlers
        const SHARED = 1 << 0;
        /// Keep the line live across suspend
        const NO_SUSPEND = 1 << 1;
        /// Force re-enable on resume
        const FORCE_RESUME = 1 << 2;
        /// Resume before ordinary devices
        const EARLY_RESUME = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Generic line state relevant to the event controllers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LineStatus: u32 {
        /// Line has been disabled by its consumer
        const DISABLED = 1 << 0;
        /// An edge arrived while the line was disabled
        const PENDING = 1 << 1;
    }
}

/// Error returned when a handler cannot be attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineError {
    /// Line already has an exclusive handler
    Busy,
    /// Line number out of range
    InvalidLine,
    /// Out of memory for the registration
    NoMemory,
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineError::Busy => f.write_str("line busy"),
            LineError::InvalidLine => f.write_str("invalid line"),
            LineError::NoMemory => f.write_str("out of memory"),
        }
    }
}

/// Controller installed on a bound line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Controller {
    /// Inter-domain and plain channels
    Dynamic,
    /// Per-CPU virtual interrupts and IPIs
    PerCpu,
    /// Physical interrupts routed through the hypervisor
    Pirq,
}

/// Generic line interrupt subsystem
pub trait LineSubsystem: Send + Sync {
    /// Install `controller` on `line`
    fn register_controller(&self, line: Line, controller: Controller, name: &'static str);

    /// Forget the controller and any per-line state for `line`
    fn release_controller(&self, line: Line);

    /// Generic dispatch entry point
    fn dispatch(&self, line: Line);

    /// Attach a handler
    fn request_handler(
        &self,
        line: Line,
        handler: LineHandler,
        flags: HandlerFlags,
        name: &'static str,
        cookie: usize,
    ) -> Result<(), LineError>;

    /// Detach a handler previously attached with `cookie`
    fn release_handler(&self, line: Line, cookie: usize);

    /// Record the CPU the line is routed to
    fn set_line_affinity(&self, line: Line, cpu: CpuId);

    /// Disable a line (nesting)
    fn disable_line(&self, line: Line);

    /// Re-enable a line
    fn enable_line(&self, line: Line);

    /// Current generic state of a line
    fn line_status(&self, line: Line) -> LineStatus;

    /// Flags of the first handler attached to `line`, if any
    fn handler_flags(&self, line: Line) -> Option<HandlerFlags>;

    /// Whether `line` is owned by some other interrupt controller
    fn is_foreign(&self, _line: Line) -> bool {
        false
    }
}
