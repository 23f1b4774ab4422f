//! # Physical Interrupt Lifecycle
//!
//! Hardware interrupts passed through by the hypervisor. A physical line is
//! allocated first (GSI and vector known, no channel yet), started when the
//! generic layer enables it, and shut down when it is disabled for good.
//!
//! ```text
//!   Unbound ──allocate──► Allocated ──startup──► Started ──eoi──► Started
//!      ▲                      ▲                     │
//!      │                      └──────shutdown───────┘
//!      └────────────unbind (last claim) / destroy────────────┘
//! ```
//!
//! ## End Of Interrupt
//!
//! Some hardware lines need an explicit EOI call to the hypervisor besides
//! unmasking the channel. Whether they do is cached per GSI in the need-EOI
//! bitmap. When the hypervisor maintains that bitmap itself, the EOI call
//! also unmasks and the local unmask is skipped.

use core::sync::atomic::Ordering;

use crate::binding::{LineDescriptor, LineKind, PirqInfo, TableGuard};
use crate::events::EventChannels;
use crate::hypervisor::{BindPirqFlags, Hypervisor, IrqStatusFlags, MapPirqRequest};
use crate::lines::{Controller, LineStatus, LineSubsystem};
use crate::types::{CpuId, DomainId, Line};
use crate::{EventError, EventResult};

impl<H: Hypervisor, L: LineSubsystem> EventChannels<H, L> {
    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a line for hardware interrupt `gsi`
    ///
    /// No channel is bound until the line is started. A repeated request
    /// for the same GSI returns the existing line and adds a claim; the
    /// line is only torn down when [`EventChannels::unbind`] has been
    /// called once per claim.
    pub fn allocate_pirq(&self, gsi: u32, shareable: bool, name: &'static str) -> EventResult<Line> {
        let mut table = self.table.lock();

        if let Some(line) = table.find_pirq(gsi) {
            let claims = table.add_claim(line);
            log::info!("allocate_pirq: returning {} for gsi {} ({} claims)", line, gsi, claims);
            return Ok(line);
        }

        // Unprivileged guests have no GSI space of their own; identity map.
        let line = if self.allocator.is_identity_mapped(gsi) || !self.config.initial_domain {
            if !self.allocator.contains(gsi) {
                return Err(EventError::InvalidLine);
            }
            let line = Line::new(gsi);
            if table.kind(line).is_bound() {
                log::warn!("gsi {} collides with bound {}", gsi, line);
                return Err(EventError::NoSpace);
            }
            line
        } else {
            self.find_line(&table)
        };

        let vector = if self.config.initial_domain {
            match self.hv.alloc_irq_vector(gsi) {
                Ok(vector) => vector,
                Err(err) => {
                    log::warn!("no vector for gsi {}: {}", gsi, err);
                    return Err(EventError::NoSpace);
                },
            }
        } else {
            0
        };

        let info = PirqInfo {
            gsi,
            vector,
            shareable,
            domain: DomainId::SELF,
        };
        self.lines.register_controller(line, Controller::Pirq, name);
        table.install(line, LineDescriptor::pirq(None, info));
        table.add_claim(line);

        log::debug!("allocated {} for gsi {} vector {:#x}", line, gsi, vector);
        Ok(line)
    }

    /// Map an MSI or MSI-X source and allocate a line for it
    ///
    /// The caller has already read the bus, device/function and MSI-X
    /// table location from configuration space.
    pub fn map_pirq(&self, request: &MapPirqRequest, name: &'static str) -> EventResult<Line> {
        let mut table = self.table.lock();
        let line = self.find_line(&table);

        let mapped = self.hv.map_pirq(request).map_err(|err| {
            log::warn!("map pirq for {:02x}:{:02x} failed: {}", request.bus, request.devfn, err);
            err
        })?;

        let info = PirqInfo {
            gsi: mapped.pirq,
            vector: mapped.index,
            shareable: false,
            domain: request.domain,
        };
        self.lines.register_controller(line, Controller::Pirq, name);
        table.install(line, LineDescriptor::pirq(None, info));
        table.add_claim(line);

        log::debug!("mapped pirq {} ({:?}) to {}", mapped.pirq, request.kind, line);
        Ok(line)
    }

    /// Unmap a physical line made by [`EventChannels::map_pirq`] and free it
    ///
    /// Only the privileged domain talks to the hypervisor here; on a
    /// rejected unmap the line is left as it was.
    pub fn destroy_pirq(&self, line: Line) -> EventResult<()> {
        self.check_line(line)?;
        let mut table = self.table.lock();

        let info = match table.kind(line) {
            LineKind::Physical(info) => info,
            LineKind::Unbound => return Err(EventError::NotBound),
            _ => return Err(EventError::WrongKind),
        };

        if self.config.initial_domain {
            if let Err(err) = self.hv.unmap_pirq(info.gsi, info.domain) {
                log::warn!("unmap pirq {} failed: {}", info.gsi, err);
                return Err(err.into());
            }
        }

        self.shutdown_locked(&mut table, line);
        table.reset(line);
        self.lines.release_controller(line);

        log::debug!("destroyed {} (pirq {})", line, info.gsi);
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    fn pirq_info(&self, line: Line) -> EventResult<PirqInfo> {
        self.check_line(line)?;
        match self.table.lock().kind(line) {
            LineKind::Physical(info) => Ok(info),
            LineKind::Unbound => Err(EventError::NotBound),
            _ => Err(EventError::WrongKind),
        }
    }

    /// Hardware interrupt number of a physical line
    pub fn gsi_of(&self, line: Line) -> EventResult<u32> {
        self.check_line(line)?;
        match (self.table.gsi_of(line), self.table.controller_of(line)) {
            (Some(gsi), _) => Ok(gsi),
            (None, None) => Err(EventError::NotBound),
            (None, Some(_)) => Err(EventError::WrongKind),
        }
    }

    /// Vector allocated for a physical line
    pub fn vector_of(&self, line: Line) -> EventResult<u8> {
        self.pirq_info(line).map(|info| info.vector)
    }

    /// Whether a physical line is private to this guest
    ///
    /// False if the hypervisor reports it shared or the query fails.
    pub fn ignore_line(&self, line: Line) -> EventResult<bool> {
        let info = self.pirq_info(line)?;
        Ok(match self.hv.irq_status_query(info.gsi) {
            Ok(flags) => !flags.contains(IrqStatusFlags::SHARED),
            Err(_) => false,
        })
    }

    /// Whether `gsi` needs an explicit EOI call
    #[inline]
    pub fn pirq_needs_eoi(&self, gsi: u32) -> bool {
        let gsi = gsi as usize;
        gsi < self.needs_eoi.capacity() && self.needs_eoi.test(gsi)
    }

    /// Refresh the cached need-EOI bit of `gsi`
    fn query_unmask(&self, gsi: u32) {
        if self.eoi_does_unmask() || gsi as usize >= self.needs_eoi.capacity() {
            return;
        }

        let flags = self.hv.irq_status_query(gsi).unwrap_or(IrqStatusFlags::empty());

        self.needs_eoi.clear(gsi as usize);
        if flags.contains(IrqStatusFlags::NEEDS_EOI) {
            self.needs_eoi.set(gsi as usize);
        }
    }

    // =========================================================================
    // Controller operations
    // =========================================================================

    /// Start a physical line, binding its channel on first use
    ///
    /// A bind rejection leaves the line allocated and returns
    /// [`EventError::NoChannel`]; it is only logged when a handler is
    /// attached (drivers test for the line before claiming it).
    ///
    /// # Panics
    /// If the line is not a physical line.
    pub fn startup_pirq(&self, line: Line) -> EventResult<()> {
        self.check_line(line)?;

        {
            let mut table = self.table.lock();
            let info = Self::expect_pirq(&table, line);

            if table.channel_of(line).is_none() {
                let flags = if info.shareable {
                    BindPirqFlags::WILL_SHARE
                } else {
                    BindPirqFlags::empty()
                };

                let channel = match self.hv.bind_pirq(info.gsi, flags) {
                    Ok(channel) => channel,
                    Err(err) => {
                        if self.lines.handler_flags(line).is_some() {
                            log::info!("Failed to obtain physical {} (gsi {}): {}", line, info.gsi, err);
                        }
                        return Err(EventError::NoChannel);
                    },
                };

                self.query_unmask(info.gsi);
                table.install(line, LineDescriptor::pirq(Some(channel), info));
                self.bind_channel_to_cpu(&mut table, channel, CpuId::BOOT);
            }
        }

        self.pirq_eoi(line);
        Ok(())
    }

    /// Close a physical line's channel, keeping the line allocated
    ///
    /// # Panics
    /// If the line is not a physical line, or the hypervisor refuses the close.
    pub fn shutdown_pirq(&self, line: Line) -> EventResult<()> {
        self.check_line(line)?;
        let mut table = self.table.lock();
        Self::expect_pirq(&table, line);
        self.shutdown_locked(&mut table, line);
        Ok(())
    }

    /// Acknowledge a physical line
    pub fn ack_pirq(&self, line: Line) {
        self.pirq_eoi(line);
    }

    /// Finish a level-triggered interrupt
    ///
    /// A line that was disabled while an edge arrived is shut down rather
    /// than re-armed.
    pub fn end_pirq(&self, line: Line) -> EventResult<()> {
        self.check_line(line)?;
        let status = self.lines.line_status(line);

        if status.contains(LineStatus::DISABLED | LineStatus::PENDING) {
            self.shutdown_pirq(line)
        } else {
            if self.table.channel_of(line).is_some() {
                self.pirq_eoi(line);
            }
            Ok(())
        }
    }

    /// Unmask and/or EOI a physical line
    ///
    /// The local unmask comes first, and is skipped when the EOI call
    /// unmasks on its own. Runs from dispatch, so it never takes the update
    /// lock.
    pub fn pirq_eoi(&self, line: Line) {
        let Some(channel) = self.channel_of(line) else {
            return;
        };
        let Some(gsi) = self.table.gsi_of(line) else {
            return;
        };

        let need_eoi = self.pirq_needs_eoi(gsi);

        if !need_eoi || !self.eoi_does_unmask.load(Ordering::Acquire) {
            self.unmask_channel(channel);
        }

        if need_eoi {
            if let Err(err) = self.hv.physdev_eoi(gsi) {
                log::warn!("EOI of gsi {} failed: {}", gsi, err);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn expect_pirq(table: &TableGuard<'_>, line: Line) -> PirqInfo {
        match table.kind(line) {
            LineKind::Physical(info) => info,
            kind => {
                log::error!("{} is {:?}, not a physical line", line, kind);
                panic!("physical interrupt operation on non-physical line");
            },
        }
    }

    /// Close the channel of a started physical line
    pub(crate) fn shutdown_locked(&self, table: &mut TableGuard<'_>, line: Line) {
        let Some(channel) = table.channel_of(line) else {
            return;
        };

        self.masks.mask(channel);
        self.close_channel(channel);
        self.bind_channel_to_cpu(table, channel, CpuId::BOOT);
        table.unmap_channel(channel);
        table.set_channel(line, None);

        log::debug!("shut down {} ({})", line, channel);
    }
}
