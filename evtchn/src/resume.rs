//! # Suspend/Resume
//!
//! The hypervisor forgets every channel across a suspend. On resume the
//! per-CPU virtual interrupts and IPIs are re-bound from the keys kept in
//! the per-CPU tables; the fresh channel numbers need not match the old
//! ones. Physical interrupts are re-discovered by their owners, and
//! driver channels are re-established through
//! [`EventChannels::rebind_channel_line`].

use core::sync::atomic::Ordering;

use crate::binding::LineDescriptor;
use crate::events::EventChannels;
use crate::hypervisor::Hypervisor;
use crate::lines::{HandlerFlags, LineStatus, LineSubsystem};
use crate::types::CpuId;

impl<H: Hypervisor, L: LineSubsystem> EventChannels<H, L> {
    /// Re-establish bindings after the guest resumes
    ///
    /// # Panics
    /// If the hypervisor refuses to re-bind a virtual interrupt or IPI, or
    /// to take back the need-EOI bitmap. The guest cannot run without them.
    pub fn resume(&self) {
        let mut table = self.table.lock();

        self.masks.reset_cpu_bindings();

        // The new channel space is not live yet.
        self.masks.mask_all();
        table.clear_all_channels();

        let mut rebound = 0usize;
        for raw in 0..self.config.nr_cpus {
            let cpu = CpuId::new(raw);

            for (virq, line) in table.virq_bindings(cpu) {
                let channel = match self.hv.bind_virq(virq, cpu) {
                    Ok(channel) => channel,
                    Err(err) => {
                        log::error!("resume: virq {} on cpu {} not re-bound: {}", virq.raw(), raw, err);
                        panic!("virq re-bind rejected on resume");
                    },
                };
                table.install(line, LineDescriptor::virq(channel, virq));
                self.bind_channel_to_cpu(&mut table, channel, cpu);
                rebound += 1;
            }

            for (ipi, line) in table.ipi_bindings(cpu) {
                let channel = match self.hv.bind_ipi(cpu) {
                    Ok(channel) => channel,
                    Err(err) => {
                        log::error!("resume: ipi {:?} on cpu {} not re-bound: {}", ipi, raw, err);
                        panic!("ipi re-bind rejected on resume");
                    },
                };
                table.install(line, LineDescriptor::ipi(channel, ipi));
                self.bind_channel_to_cpu(&mut table, channel, cpu);
                rebound += 1;
            }
        }

        let lines = table.bound_lines();
        drop(table);

        // Lines that stay live across suspend are unmasked straight away.
        for line in lines {
            let survives = self
                .lines
                .handler_flags(line)
                .is_some_and(|flags| flags.contains(HandlerFlags::NO_SUSPEND));
            if !survives || self.lines.line_status(line).contains(LineStatus::DISABLED) {
                continue;
            }
            if let Some(channel) = self.table.channel_of(line) {
                self.unmask_channel(channel);
            }
        }

        if self.eoi_does_unmask.load(Ordering::Acquire) {
            if let Err(err) = self.hv.register_pirq_eoi_bitmap(&self.needs_eoi) {
                log::error!("resume: need-EOI bitmap refused: {}", err);
                panic!("need-EOI bitmap re-registration rejected");
            }
        }

        log::info!("Event channels resumed: {} per-cpu bindings restored", rebound);
    }
}
