//! # Event Channel Bindings
//!
//! The driver-facing half of the layer: binding channels, virtual
//! interrupts, IPIs and inter-domain connections to lines, unbinding them,
//! and the small per-line operations drivers use directly (notify, pending
//! bit manipulation, polling).
//!
//! The controller operations live in [`crate::chip`], physical interrupts in
//! [`crate::pirq`], the upcall scanner in [`crate::upcall`] and suspend
//! handling in [`crate::resume`]; all of them are methods of
//! [`EventChannels`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::allocator::LineAllocator;
use crate::binding::{BindingTable, LineDescriptor, LineKind, TableGuard};
use crate::bitmap::AtomicBitmap;
use crate::config::EventConfig;
use crate::hypervisor::{Hypervisor, CALLBACK_VIA_VECTOR};
use crate::lines::{Controller, HandlerFlags, LineHandler, LineSubsystem};
use crate::mask::ChannelMasks;
use crate::shared::SharedInfo;
use crate::types::{Channel, CpuId, DomainId, IpiVector, Line, Virq};
use crate::upcall::UpcallState;
use crate::{EventError, EventResult};

/// Event channel interrupt layer
pub struct EventChannels<H: Hypervisor, L: LineSubsystem> {
    pub(crate) config: EventConfig,
    pub(crate) hv: H,
    pub(crate) lines: L,
    pub(crate) masks: ChannelMasks,
    pub(crate) table: BindingTable,
    pub(crate) allocator: LineAllocator,
    /// One bit per hardware interrupt needing an explicit EOI
    pub(crate) needs_eoi: Arc<AtomicBitmap>,
    /// The hypervisor maintains `needs_eoi` and EOI also unmasks
    pub(crate) eoi_does_unmask: AtomicBool,
    pub(crate) vector_callback: AtomicBool,
    pub(crate) upcall: Box<[UpcallState]>,
}

impl<H: Hypervisor, L: LineSubsystem> core::fmt::Debug for EventChannels<H, L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventChannels")
            .field("config", &self.config)
            .field("eoi_does_unmask", &self.eoi_does_unmask.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<H: Hypervisor, L: LineSubsystem> EventChannels<H, L> {
    // =========================================================================
    // Initialization
    // =========================================================================

    /// Set up the layer
    ///
    /// Registers the need-EOI bitmap with the hypervisor, hands every
    /// channel to CPU 0 and masks all channels: none is live until bound.
    ///
    /// # Panics
    /// If the shared page describes fewer VCPUs than `config.nr_cpus`.
    pub fn new(config: EventConfig, hv: H, lines: L, shared: Arc<SharedInfo>) -> Self {
        let nr_cpus = config.nr_cpus as usize;
        if shared.nr_vcpus() < nr_cpus {
            log::error!(
                "shared info describes {} vcpus, {} configured",
                shared.nr_vcpus(),
                nr_cpus
            );
            panic!("shared info too small for configured cpus");
        }

        let needs_eoi = Arc::new(AtomicBitmap::new(config.nr_lines as usize));
        let eoi_does_unmask = hv.register_pirq_eoi_bitmap(&needs_eoi).is_ok();

        let upcall: Vec<UpcallState> = (0..nr_cpus).map(|_| UpcallState::new()).collect();

        let events = Self {
            config,
            hv,
            lines,
            masks: ChannelMasks::new(shared, nr_cpus),
            table: BindingTable::new(config.nr_lines as usize, nr_cpus),
            allocator: LineAllocator::new(config.nr_lines, config.nr_hw_lines),
            needs_eoi,
            eoi_does_unmask: AtomicBool::new(eoi_does_unmask),
            vector_callback: AtomicBool::new(config.vector_callback),
            upcall: upcall.into_boxed_slice(),
        };

        events.masks.reset_cpu_bindings();
        events.masks.mask_all();

        log::info!(
            "Event channels: {} lines ({} hardware), {} cpus, eoi-unmask {}",
            config.nr_lines,
            config.nr_hw_lines,
            nr_cpus,
            eoi_does_unmask
        );

        events
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Active configuration
    #[inline]
    pub fn config(&self) -> &EventConfig {
        &self.config
    }

    /// Hypervisor transport
    #[inline]
    pub fn hypervisor(&self) -> &H {
        &self.hv
    }

    /// Generic line subsystem
    #[inline]
    pub fn lines(&self) -> &L {
        &self.lines
    }

    /// Shared information page
    #[inline]
    pub fn shared(&self) -> &SharedInfo {
        self.masks.shared()
    }

    /// Whether an EOI call also unmasks physical interrupts
    #[inline]
    pub fn eoi_does_unmask(&self) -> bool {
        self.eoi_does_unmask.load(Ordering::Acquire)
    }

    /// Line bound to a channel
    #[inline]
    pub fn line_of_channel(&self, channel: Channel) -> Option<Line> {
        self.table.line_of(channel)
    }

    /// Channel bound to a line
    #[inline]
    pub fn channel_of(&self, line: Line) -> Option<Channel> {
        if self.allocator.contains(line.raw()) {
            self.table.channel_of(line)
        } else {
            None
        }
    }

    /// CPU a line is delivered to
    pub fn cpu_of(&self, line: Line) -> EventResult<CpuId> {
        self.check_line(line)?;
        Ok(self.table.cpu_of(line))
    }

    /// Snapshot of a line's binding
    pub fn descriptor(&self, line: Line) -> EventResult<LineDescriptor> {
        self.check_line(line)?;
        Ok(self.table.descriptor(line))
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[inline]
    pub(crate) fn check_line(&self, line: Line) -> EventResult<()> {
        if self.allocator.contains(line.raw()) {
            Ok(())
        } else {
            Err(EventError::InvalidLine)
        }
    }

    #[inline]
    pub(crate) fn check_cpu(&self, cpu: CpuId) -> EventResult<()> {
        if cpu.raw() < self.config.nr_cpus {
            Ok(())
        } else {
            Err(EventError::InvalidCpu)
        }
    }

    /// Pick a free dynamic line
    ///
    /// # Panics
    /// If the line space is exhausted; the kernel cannot run without
    /// interrupt capacity.
    pub(crate) fn find_line(&self, table: &TableGuard<'_>) -> Line {
        match self.allocator.find_unbound(table, &self.lines) {
            Some(line) => line,
            None => {
                log::error!("No available line to bind to: increase nr_lines");
                panic!("event channel line space exhausted");
            },
        }
    }

    // =========================================================================
    // Binding
    // =========================================================================

    /// Bind a channel to a line, reusing the existing binding if any
    pub fn bind_channel(&self, channel: Channel) -> EventResult<Line> {
        let mut table = self.table.lock();

        if let Some(line) = table.line_of(channel) {
            return Ok(line);
        }

        let line = self.find_line(&table);
        self.lines.register_controller(line, Controller::Dynamic, "event");
        table.install(line, LineDescriptor::channel(channel));

        log::debug!("bound {} to {}", channel, line);
        Ok(line)
    }

    /// Connect to `remote_port` in `remote_domain` and bind the local end
    pub fn bind_interdomain(&self, remote_domain: DomainId, remote_port: u32) -> EventResult<Line> {
        let channel = self.hv.bind_interdomain(remote_domain, remote_port)?;
        self.bind_channel(channel)
    }

    /// Bind virtual interrupt `virq` on `cpu`, once per `(cpu, virq)`
    pub fn bind_virq(&self, virq: Virq, cpu: CpuId) -> EventResult<Line> {
        self.check_cpu(cpu)?;
        let mut table = self.table.lock();

        if let Some(line) = table.virq_line(cpu, virq) {
            return Ok(line);
        }

        let line = self.find_line(&table);
        let channel = self.hv.bind_virq(virq, cpu).map_err(|err| {
            log::warn!("bind virq {} on cpu {} failed: {}", virq.raw(), cpu.raw(), err);
            err
        })?;

        self.lines.register_controller(line, Controller::PerCpu, "virq");
        table.install(line, LineDescriptor::virq(channel, virq));
        table.set_virq_line(cpu, virq, Some(line));
        self.bind_channel_to_cpu(&mut table, channel, cpu);

        log::debug!("bound virq {} on cpu {} to {} ({})", virq.raw(), cpu.raw(), line, channel);
        Ok(line)
    }

    /// Bind IPI vector `ipi` on `cpu`, once per `(cpu, ipi)`
    pub fn bind_ipi(&self, ipi: IpiVector, cpu: CpuId) -> EventResult<Line> {
        self.check_cpu(cpu)?;
        let mut table = self.table.lock();

        if let Some(line) = table.ipi_line(cpu, ipi) {
            return Ok(line);
        }

        let line = self.find_line(&table);
        let channel = self.hv.bind_ipi(cpu).map_err(|err| {
            log::warn!("bind ipi {:?} on cpu {} failed: {}", ipi, cpu.raw(), err);
            err
        })?;

        self.lines.register_controller(line, Controller::PerCpu, "ipi");
        table.install(line, LineDescriptor::ipi(channel, ipi));
        table.set_ipi_line(cpu, ipi, Some(line));
        self.bind_channel_to_cpu(&mut table, channel, cpu);

        log::debug!("bound ipi {:?} on cpu {} to {} ({})", ipi, cpu.raw(), line, channel);
        Ok(line)
    }

    // -------------------------------------------------------------------------
    // Binding plus handler registration
    // -------------------------------------------------------------------------

    fn attach(
        &self,
        line: Line,
        handler: LineHandler,
        flags: HandlerFlags,
        name: &'static str,
        cookie: usize,
    ) -> EventResult<Line> {
        if let Err(err) = self.lines.request_handler(line, handler, flags, name, cookie) {
            self.unbind(line)?;
            return Err(err.into());
        }
        Ok(line)
    }

    /// Bind a channel and attach a handler to its line
    pub fn bind_channel_handler(
        &self,
        channel: Channel,
        handler: LineHandler,
        flags: HandlerFlags,
        name: &'static str,
        cookie: usize,
    ) -> EventResult<Line> {
        let line = self.bind_channel(channel)?;
        self.attach(line, handler, flags, name, cookie)
    }

    /// Connect to a remote port and attach a handler to the local line
    pub fn bind_interdomain_handler(
        &self,
        remote_domain: DomainId,
        remote_port: u32,
        handler: LineHandler,
        flags: HandlerFlags,
        name: &'static str,
        cookie: usize,
    ) -> EventResult<Line> {
        let line = self.bind_interdomain(remote_domain, remote_port)?;
        self.attach(line, handler, flags, name, cookie)
    }

    /// Bind a virtual interrupt and attach a handler to its line
    pub fn bind_virq_handler(
        &self,
        virq: Virq,
        cpu: CpuId,
        handler: LineHandler,
        flags: HandlerFlags,
        name: &'static str,
        cookie: usize,
    ) -> EventResult<Line> {
        let line = self.bind_virq(virq, cpu)?;
        self.attach(line, handler, flags, name, cookie)
    }

    /// Bind an IPI and attach a handler that survives suspend
    pub fn bind_ipi_handler(
        &self,
        ipi: IpiVector,
        cpu: CpuId,
        handler: LineHandler,
        flags: HandlerFlags,
        name: &'static str,
        cookie: usize,
    ) -> EventResult<Line> {
        let line = self.bind_ipi(ipi, cpu)?;
        let flags = flags | HandlerFlags::NO_SUSPEND | HandlerFlags::FORCE_RESUME | HandlerFlags::EARLY_RESUME;
        self.attach(line, handler, flags, name, cookie)
    }

    // =========================================================================
    // Unbinding
    // =========================================================================

    /// Unbind a line
    ///
    /// Closes the channel, drops the per-CPU table entry and returns the
    /// line to the free pool. A physical line shared by several claimants
    /// is only torn down when its last claim is released. Unbinding an
    /// unbound line does nothing.
    ///
    /// # Panics
    /// If the hypervisor refuses to close the channel.
    pub fn unbind(&self, line: Line) -> EventResult<()> {
        self.check_line(line)?;
        let mut table = self.table.lock();
        let kind = table.kind(line);

        if let LineKind::Physical(info) = kind {
            let remaining = table.drop_claim(line);
            if remaining > 0 {
                log::debug!("{} (gsi {}) still has {} claims", line, info.gsi, remaining);
                return Ok(());
            }
        }

        if let Some(channel) = table.channel_of(line) {
            self.close_channel(channel);

            let cpu = table.cpu_of(line);
            match kind {
                LineKind::Virtual { virq } => table.set_virq_line(cpu, virq, None),
                LineKind::InterProcessor { ipi } => table.set_ipi_line(cpu, ipi, None),
                _ => {},
            }

            // Closed ports are implicitly re-bound to CPU 0.
            self.bind_channel_to_cpu(&mut table, channel, CpuId::BOOT);
            table.unmap_channel(channel);
        }

        if kind.is_bound() {
            table.reset(line);
            self.lines.release_controller(line);
            log::debug!("unbound {}", line);
        }

        Ok(())
    }

    /// Detach a handler and unbind its line
    pub fn unbind_handler(&self, line: Line, cookie: usize) -> EventResult<()> {
        self.check_line(line)?;
        self.lines.release_handler(line, cookie);
        self.unbind(line)
    }

    /// Close a channel with the hypervisor
    ///
    /// # Panics
    /// If the hypervisor refuses; the channel's state would be unknown.
    pub(crate) fn close_channel(&self, channel: Channel) {
        if let Err(err) = self.hv.close(channel) {
            log::error!("close of {} failed: {}", channel, err);
            panic!("event channel close rejected");
        }
    }

    /// Install a fresh channel on a line that was bound before
    ///
    /// Used by drivers re-establishing a connection after resume. The new
    /// channel is routed to CPU 0 and the line re-enabled.
    ///
    /// # Panics
    /// If the channel already has a line, or the line was never bound.
    pub fn rebind_channel_line(&self, channel: Channel, line: Line) -> EventResult<()> {
        self.check_line(line)?;

        // The new channel starts masked; keep the line quiet until it is in place.
        self.lines.disable_line(line);

        {
            let mut table = self.table.lock();

            if let Some(owner) = table.line_of(channel) {
                log::error!("{} already bound to {}", channel, owner);
                panic!("rebinding an owned event channel");
            }
            if !table.kind(line).is_bound() {
                log::error!("{} was never bound", line);
                panic!("rebinding an unbound line");
            }

            if let Some(old) = table.channel_of(line) {
                table.unmap_channel(old);
            }
            table.install(line, LineDescriptor::channel(channel));
            table.set_cpu(line, CpuId::BOOT);
        }

        self.set_affinity(line, CpuId::BOOT)?;
        self.lines.enable_line(line);
        Ok(())
    }

    // =========================================================================
    // Per-line operations
    // =========================================================================

    /// Signal the remote end of a line's channel
    ///
    /// Silently dropped when the line has no live channel, so stale
    /// bindings across save/restore never fault.
    pub fn notify(&self, line: Line) {
        if let Some(channel) = self.channel_of(line) {
            let _ = self.hv.send(channel);
        }
    }

    /// Send an IPI to `cpu`
    ///
    /// # Panics
    /// If `ipi` was never bound on `cpu`.
    pub fn send_ipi(&self, cpu: CpuId, ipi: IpiVector) -> EventResult<()> {
        self.check_cpu(cpu)?;
        match self.table.ipi_line(cpu, ipi) {
            Some(line) => {
                self.notify(line);
                Ok(())
            },
            None => {
                log::error!("ipi {:?} not bound on cpu {}", ipi, cpu.raw());
                panic!("ipi sent before it was bound");
            },
        }
    }

    /// Clear a line's pending bit, typically before polling on it
    pub fn clear_pending(&self, line: Line) {
        if let Some(channel) = self.channel_of(line) {
            self.masks.clear(channel);
        }
    }

    /// Set a line's pending bit
    pub fn set_pending(&self, line: Line) {
        if let Some(channel) = self.channel_of(line) {
            self.masks.set(channel);
        }
    }

    /// Test a line's pending bit; unbound lines are never pending
    pub fn test_pending(&self, line: Line) -> bool {
        self.channel_of(line)
            .map(|channel| self.masks.test(channel))
            .unwrap_or(false)
    }

    /// Block until the line's channel is pending or `timeout` expires
    ///
    /// Usually called with the line disabled so no upcall is delivered.
    /// Never retries; the caller re-checks state.
    pub fn poll_with_timeout(&self, line: Line, timeout: u64) {
        if let Some(channel) = self.channel_of(line) {
            if let Err(err) = self.hv.poll(channel, timeout) {
                log::warn!("poll on {} failed: {}", channel, err);
            }
        }
    }

    /// Block until the line's channel is pending
    pub fn poll(&self, line: Line) {
        self.poll_with_timeout(line, 0);
    }

    /// Unmask a channel, taking the hypervisor path for remote channels
    pub(crate) fn unmask_channel(&self, channel: Channel) {
        let cpu = self.hv.current_vcpu();
        if cpu != self.table.cpu_of_channel(channel) {
            if let Err(err) = self.hv.unmask(channel) {
                log::warn!("remote unmask of {} failed: {}", channel, err);
            }
        } else {
            self.masks.unmask_local(channel, cpu);
        }
    }

    // =========================================================================
    // Upcall delivery method
    // =========================================================================

    /// Choose how upcalls reach a hardware-virtualised guest
    pub fn set_callback_via(&self, via: u64) -> EventResult<()> {
        self.hv.set_callback_via(via)?;
        Ok(())
    }

    /// Deliver upcalls through IDT vector `vector`
    ///
    /// On rejection every channel falls back to CPU 0 delivery for good.
    pub fn setup_callback_vector(&self, vector: u8) -> bool {
        if !self.vector_callback.load(Ordering::Acquire) {
            return false;
        }
        match self.set_callback_via(CALLBACK_VIA_VECTOR | u64::from(vector)) {
            Ok(()) => {
                log::info!("Event channels: callback vector {:#x} enabled", vector);
                true
            },
            Err(err) => {
                log::error!("Request for callback vector failed: {}", err);
                self.vector_callback.store(false, Ordering::Release);
                false
            },
        }
    }

    /// Whether the platform pins every channel to CPU 0
    #[inline]
    pub fn delivers_to_boot_cpu_only(&self) -> bool {
        self.config.hvm && !self.vector_callback.load(Ordering::Acquire)
    }
}
