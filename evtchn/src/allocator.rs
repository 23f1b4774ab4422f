//! # Line Allocator
//!
//! Lines below the hardware threshold are identity-mapped to GSIs. Lines
//! for channels, virtual interrupts and IPIs are handed out from the top of
//! the line space downward so they never collide with hardware lines.

use crate::binding::TableGuard;
use crate::lines::LineSubsystem;
use crate::types::Line;

/// Line number allocator
#[derive(Debug, Clone, Copy)]
pub struct LineAllocator {
    nr_lines: u32,
    nr_hw_lines: u32,
}

impl LineAllocator {
    /// Create an allocator for `nr_lines` lines, the first `nr_hw_lines` of
    /// which belong to hardware
    pub const fn new(nr_lines: u32, nr_hw_lines: u32) -> Self {
        Self { nr_lines, nr_hw_lines }
    }

    /// Whether `raw` is an identity-mapped hardware line
    #[inline]
    pub const fn is_identity_mapped(&self, raw: u32) -> bool {
        raw < self.nr_hw_lines
    }

    /// Whether `raw` names a line inside the line space
    #[inline]
    pub const fn contains(&self, raw: u32) -> bool {
        raw < self.nr_lines
    }

    /// Find the highest free dynamic line
    ///
    /// Skips lines the generic subsystem has given to another controller.
    /// The caller must keep `table` locked until the line is installed.
    pub fn find_unbound<L: LineSubsystem + ?Sized>(&self, table: &TableGuard<'_>, lines: &L) -> Option<Line> {
        (self.nr_hw_lines + 1..self.nr_lines)
            .rev()
            .map(Line::new)
            .find(|&line| !lines.is_foreign(line) && !table.kind(line).is_bound())
    }
}
