//! # Channel Affinity
//!
//! Moves a line's channel between CPUs. The hypervisor is told first; the
//! per-CPU caches, the line's owning CPU and the generic subsystem's view
//! follow only once it has accepted.

use crate::binding::TableGuard;
use crate::events::EventChannels;
use crate::hypervisor::Hypervisor;
use crate::lines::LineSubsystem;
use crate::types::{Channel, CpuId, Line};
use crate::EventResult;

/// Outcome of an affinity request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityChange {
    /// The channel now delivers to the requested CPU
    Moved,
    /// Nothing changed: no channel, pinned delivery, or the hypervisor refused
    Unchanged,
}

impl<H: Hypervisor, L: LineSubsystem> EventChannels<H, L> {
    /// Route a line's channel to `cpu`
    ///
    /// Never-bound channels and platforms that only deliver to CPU 0 are
    /// left alone. A hypervisor refusal (VIRQ and IPI channels are pinned
    /// to the CPU they were bound on) is reported as
    /// [`AffinityChange::Unchanged`] rather than an error.
    pub fn set_affinity(&self, line: Line, cpu: CpuId) -> EventResult<AffinityChange> {
        self.check_line(line)?;
        self.check_cpu(cpu)?;

        let mut table = self.table.lock();

        let Some(channel) = table.channel_of(line) else {
            return Ok(AffinityChange::Unchanged);
        };
        if self.delivers_to_boot_cpu_only() {
            return Ok(AffinityChange::Unchanged);
        }

        match self.hv.bind_vcpu(channel, cpu) {
            Ok(()) => {
                self.bind_channel_to_cpu(&mut table, channel, cpu);
                Ok(AffinityChange::Moved)
            },
            Err(err) => {
                log::debug!("{} stays on cpu {}: {}", channel, table.cpu_of(line).raw(), err);
                Ok(AffinityChange::Unchanged)
            },
        }
    }

    /// Record that `channel` now delivers to `cpu`
    ///
    /// Updates the generic subsystem's affinity, moves the channel between
    /// per-CPU caches and sets the line's owning CPU. Must be called with
    /// the update lock held.
    ///
    /// # Panics
    /// If the channel has no line.
    pub(crate) fn bind_channel_to_cpu(&self, table: &mut TableGuard<'_>, channel: Channel, cpu: CpuId) {
        let Some(line) = table.line_of(channel) else {
            log::error!("{} moved to cpu {} without a line", channel, cpu.raw());
            panic!("affinity change on unbound event channel");
        };

        self.lines.set_line_affinity(line, cpu);
        self.masks.move_channel(channel, table.cpu_of(line), cpu);
        table.set_cpu(line, cpu);
    }
}
