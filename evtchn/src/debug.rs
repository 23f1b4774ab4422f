//! # Debug Dump
//!
//! Renders the shared and per-CPU event state for the debug virtual
//! interrupt. Bitmaps are printed most significant word first, eight words
//! per row.

use alloc::string::String;
use core::fmt::{self, Write};
use core::sync::atomic::Ordering;

use crate::events::EventChannels;
use crate::hypervisor::Hypervisor;
use crate::lines::{IrqResult, LineSubsystem};
use crate::types::{Channel, CpuId};
use crate::{BITS_PER_WORD, NR_CHANNELS, NR_CHANNEL_WORDS};

/// Words per row
const ROW: usize = 8;

fn write_words<W: Write>(out: &mut W, title: fmt::Arguments<'_>, word: impl Fn(usize) -> u64) -> fmt::Result {
    write!(out, "\n{}:\n   ", title)?;
    for i in (0..NR_CHANNEL_WORDS).rev() {
        let sep = if i % ROW == 0 { "\n   " } else { " " };
        write!(out, "{:016x}{}", word(i), sep)?;
    }
    Ok(())
}

impl<H: Hypervisor, L: LineSubsystem> EventChannels<H, L> {
    /// Write the event state as seen from `cpu`
    ///
    /// # Panics
    /// If `cpu` is not below the configured CPU count.
    pub fn dump_state<W: Write>(&self, cpu: CpuId, out: &mut W) -> fmt::Result {
        let shared = self.masks.shared();
        let local = self.masks.cpu_mask(cpu);

        write!(out, "\nvcpu {}\n  ", cpu.raw())?;
        for i in 0..self.config.nr_cpus {
            let v = shared.vcpu(CpuId::new(i));
            write!(
                out,
                "{}: masked={} pending={} event_sel {:016x}\n  ",
                i,
                u8::from(v.upcall_mask.load(Ordering::Relaxed)),
                u8::from(v.upcall_pending()),
                v.pending_sel.load(Ordering::Relaxed),
            )?;
        }

        write_words(out, format_args!("pending"), |i| shared.pending().word(i))?;
        write_words(out, format_args!("global mask"), |i| shared.mask().word(i))?;
        write_words(out, format_args!("globally unmasked"), |i| {
            shared.pending().word(i) & !shared.mask().word(i)
        })?;
        write_words(out, format_args!("local cpu{} mask", cpu.raw()), |i| local.word(i))?;
        write_words(out, format_args!("locally unmasked"), |i| {
            shared.pending().word(i) & !shared.mask().word(i) & local.word(i)
        })?;

        let sel = shared.vcpu(cpu).pending_sel.load(Ordering::Relaxed);

        writeln!(out, "\npending list:")?;
        for index in shared.pending().iter_ones().filter(|&index| index < NR_CHANNELS) {
            let owner = Channel::new(index as u32)
                .map(|channel| self.table.cpu_of_channel(channel))
                .unwrap_or(CpuId::BOOT);
            write!(out, "  {}: event {} -> ", owner.raw(), index)?;
            match Channel::new(index as u32).and_then(|channel| self.table.line_of(channel)) {
                Some(line) => write!(out, "{}", line)?,
                None => out.write_str("unbound")?,
            }

            if sel & (1 << (index / BITS_PER_WORD)) == 0 {
                out.write_str(" l2-clear")?;
            }
            if shared.mask().test(index) {
                out.write_str(" globally-masked")?;
            }
            if !local.test(index) {
                out.write_str(" locally-masked")?;
            }
            out.write_char('\n')?;
        }

        Ok(())
    }

    /// Handler for the debug virtual interrupt: log the state of `cpu`
    pub fn debug_interrupt(&self, cpu: CpuId) -> IrqResult {
        if self.check_cpu(cpu).is_err() {
            return IrqResult::NotHandled;
        }
        let mut dump = String::new();
        if self.dump_state(cpu, &mut dump).is_ok() {
            for line in dump.lines() {
                log::info!("{}", line);
            }
        }
        IrqResult::Handled
    }
}
