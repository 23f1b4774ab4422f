//! # Line Controllers
//!
//! The generic line layer drives bound lines through controller operations
//! (mask, unmask, acknowledge and so on). Each binding kind gets one of
//! three controllers, and each controller implements a subset of the
//! operations:
//!
//! | Operation     | Dynamic | PerCpu | Pirq |
//! |---------------|---------|--------|------|
//! | startup       |         |        | ✓    |
//! | shutdown      |         |        | ✓    |
//! | enable        |         |        | EOI  |
//! | disable, mask | ✓       | ✓      | ✓    |
//! | unmask        | ✓       | ✓      | ✓    |
//! | ack           |         | ✓      |      |
//! | eoi           | ack     |        | EOI  |
//! | end           |         |        | ✓    |
//! | set-affinity  | ✓       |        | ✓    |
//! | retrigger     | ✓       |        | ✓    |

use crate::affinity::AffinityChange;
use crate::binding::LineKind;
use crate::events::EventChannels;
use crate::hypervisor::Hypervisor;
use crate::lines::{Controller, LineStatus, LineSubsystem};
use crate::types::{CpuId, Line};
use crate::{EventError, EventResult};

/// Operation requested by the generic line layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipOp {
    /// Bring the line up
    Startup,
    /// Take the line down
    Shutdown,
    /// Enable delivery
    Enable,
    /// Disable delivery
    Disable,
    /// Mask the source
    Mask,
    /// Unmask the source
    Unmask,
    /// Acknowledge before handling
    Ack,
    /// End of interrupt after handling
    Eoi,
    /// Level-triggered end of handling
    End,
    /// Route the line to a CPU
    SetAffinity(CpuId),
    /// Re-deliver the interrupt
    Retrigger,
}

/// Result of a controller operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipOutcome {
    /// The operation ran
    Done,
    /// The line's controller does not implement the operation
    Unsupported,
    /// Retrigger result: whether the interrupt was re-raised
    Retriggered(bool),
    /// Affinity result
    Affinity(AffinityChange),
}

/// Controller serving a binding kind
pub const fn controller_for(kind: LineKind) -> Option<Controller> {
    match kind {
        LineKind::Unbound => None,
        LineKind::Channel => Some(Controller::Dynamic),
        LineKind::Virtual { .. } | LineKind::InterProcessor { .. } => Some(Controller::PerCpu),
        LineKind::Physical(_) => Some(Controller::Pirq),
    }
}

impl<H: Hypervisor, L: LineSubsystem> EventChannels<H, L> {
    /// Run a controller operation on a bound line
    ///
    /// The generic layer calls this from dispatch. Masking, acknowledge and
    /// EOI are lock-free; startup, shutdown and affinity changes take the
    /// update lock and must not be requested from the upcall path.
    pub fn controller_op(&self, line: Line, op: ChipOp) -> EventResult<ChipOutcome> {
        self.check_line(line)?;
        let controller = self.table.controller_of(line).ok_or(EventError::NotBound)?;

        match (controller, op) {
            (_, ChipOp::Mask | ChipOp::Disable) => self.mask_line(line),
            (_, ChipOp::Unmask) => self.unmask_line(line),

            (Controller::Dynamic, ChipOp::Eoi) | (Controller::PerCpu, ChipOp::Ack) => self.ack_dynamic(line),

            (Controller::Dynamic | Controller::Pirq, ChipOp::SetAffinity(cpu)) => {
                return self.set_affinity(line, cpu).map(ChipOutcome::Affinity);
            },
            (Controller::Dynamic | Controller::Pirq, ChipOp::Retrigger) => {
                return Ok(ChipOutcome::Retriggered(self.retrigger(line)));
            },

            (Controller::Pirq, ChipOp::Startup) => self.startup_pirq(line)?,
            (Controller::Pirq, ChipOp::Shutdown) => self.shutdown_pirq(line)?,
            (Controller::Pirq, ChipOp::Enable | ChipOp::Eoi) => self.ack_pirq(line),
            (Controller::Pirq, ChipOp::End) => self.end_pirq(line)?,

            _ => return Ok(ChipOutcome::Unsupported),
        }

        Ok(ChipOutcome::Done)
    }

    /// Mask a line's channel
    pub fn mask_line(&self, line: Line) {
        if let Some(channel) = self.channel_of(line) {
            self.masks.mask(channel);
        }
    }

    /// Unmask a line's channel
    pub fn unmask_line(&self, line: Line) {
        if let Some(channel) = self.channel_of(line) {
            self.unmask_channel(channel);
        }
    }

    /// Re-arm a line after delivery unless its consumer disabled it
    pub fn ack_dynamic(&self, line: Line) {
        let Some(channel) = self.channel_of(line) else {
            return;
        };
        if !self.lines.line_status(line).contains(LineStatus::DISABLED) {
            self.unmask_channel(channel);
        }
    }

    /// Re-deliver a line's interrupt
    ///
    /// Marks the channel pending; if it was unmasked, unmasking it again
    /// re-raises the upcall. Returns whether a channel was there to retrigger.
    pub fn retrigger(&self, line: Line) -> bool {
        let Some(channel) = self.channel_of(line) else {
            return false;
        };

        let masked = self.masks.test_and_mask(channel);
        self.masks.set(channel);
        if !masked {
            self.unmask_channel(channel);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventConfig;
    use crate::testing::{events, port, raise};
    use crate::types::{IpiVector, Virq};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_controller_for_kind() {
        assert_eq!(controller_for(LineKind::Unbound), None);
        assert_eq!(controller_for(LineKind::Channel), Some(Controller::Dynamic));
        assert_eq!(controller_for(LineKind::Virtual { virq: Virq::TIMER }), Some(Controller::PerCpu));
        assert_eq!(
            controller_for(LineKind::InterProcessor { ipi: IpiVector::Nmi }),
            Some(Controller::PerCpu)
        );
    }

    #[test]
    fn test_mask_unmask() {
        let ev = events(EventConfig::PV_GUEST);
        let line = ev.bind_channel(port(8)).unwrap();
        assert_eq!(ev.controller_op(line, ChipOp::Unmask), Ok(ChipOutcome::Done));
        assert!(!ev.shared().is_masked(port(8)));
        assert_eq!(ev.controller_op(line, ChipOp::Disable), Ok(ChipOutcome::Done));
        assert!(ev.shared().is_masked(port(8)));
    }

    #[test]
    fn test_dynamic_eoi_respects_disabled() {
        let ev = events(EventConfig::PV_GUEST);
        let line = ev.bind_channel(port(8)).unwrap();
        ev.lines().set_status(line, LineStatus::DISABLED);
        ev.controller_op(line, ChipOp::Eoi).unwrap();
        assert!(ev.shared().is_masked(port(8)));

        ev.lines().set_status(line, LineStatus::empty());
        ev.controller_op(line, ChipOp::Eoi).unwrap();
        assert!(!ev.shared().is_masked(port(8)));
    }

    #[test]
    fn test_unsupported_ops() {
        let ev = events(EventConfig::PV_GUEST);
        let dynamic = ev.bind_channel(port(8)).unwrap();
        let percpu = ev.bind_virq(Virq::TIMER, CpuId::BOOT).unwrap();
        assert_eq!(ev.controller_op(dynamic, ChipOp::Startup), Ok(ChipOutcome::Unsupported));
        assert_eq!(ev.controller_op(dynamic, ChipOp::Ack), Ok(ChipOutcome::Unsupported));
        assert_eq!(ev.controller_op(percpu, ChipOp::Retrigger), Ok(ChipOutcome::Unsupported));
        assert_eq!(
            ev.controller_op(percpu, ChipOp::SetAffinity(CpuId::new(1))),
            Ok(ChipOutcome::Unsupported)
        );
        assert_eq!(ev.controller_op(Line::new(100), ChipOp::Mask), Err(EventError::NotBound));
    }

    #[test]
    fn test_set_affinity_op() {
        let ev = events(EventConfig::PV_GUEST);
        let line = ev.bind_channel(port(8)).unwrap();
        assert_eq!(
            ev.controller_op(line, ChipOp::SetAffinity(CpuId::new(3))),
            Ok(ChipOutcome::Affinity(AffinityChange::Moved))
        );
        assert_eq!(ev.cpu_of(line).unwrap(), CpuId::new(3));
    }

    #[test]
    fn test_retrigger_unmasked_channel_raises_upcall() {
        let ev = events(EventConfig::PV_GUEST);
        let line = ev.bind_channel(port(70)).unwrap();
        ev.unmask_line(line);

        assert_eq!(ev.controller_op(line, ChipOp::Retrigger), Ok(ChipOutcome::Retriggered(true)));
        assert!(ev.shared().is_pending(port(70)));
        assert!(!ev.shared().is_masked(port(70)));
        let vcpu = ev.shared().vcpu(CpuId::BOOT);
        assert!(vcpu.upcall_pending());

        ev.do_upcall(CpuId::BOOT);
        assert_eq!(ev.lines().take_dispatched(), vec![line]);
    }

    #[test]
    fn test_retrigger_masked_channel_stays_masked() {
        let ev = events(EventConfig::PV_GUEST);
        let line = ev.bind_channel(port(70)).unwrap();
        assert!(ev.retrigger(line));
        assert!(ev.shared().is_pending(port(70)));
        assert!(ev.shared().is_masked(port(70)));
        assert!(!ev.shared().vcpu(CpuId::BOOT).upcall_pending());

        ev.unbind(line).unwrap();
        assert!(!ev.retrigger(line));
    }

    #[test]
    fn test_pirq_ops() {
        let ev = events(EventConfig::PV_GUEST);
        let line = ev.allocate_pirq(9, false, "ata").unwrap();
        assert_eq!(ev.controller_op(line, ChipOp::Startup), Ok(ChipOutcome::Done));
        assert!(ev.channel_of(line).is_some());
        assert_eq!(ev.controller_op(line, ChipOp::Ack), Ok(ChipOutcome::Unsupported));
        assert_eq!(ev.controller_op(line, ChipOp::Shutdown), Ok(ChipOutcome::Done));
        assert_eq!(ev.channel_of(line), None);
    }

    #[test]
    fn test_dispatch_ops_run_while_update_lock_is_held() {
        let ev = Arc::new(events(EventConfig::PV_GUEST));
        let dynamic = ev.bind_channel(port(9)).unwrap();
        ev.unmask_line(dynamic);
        let pirq = ev.allocate_pirq(5, false, "kbd").unwrap();
        ev.startup_pirq(pirq).unwrap();
        let pirq_channel = ev.channel_of(pirq).unwrap();

        let inner = Arc::downgrade(&ev);
        ev.lines().on_dispatch(Arc::new(move |line| {
            let Some(ev) = inner.upgrade() else { return };
            assert_eq!(ev.controller_op(line, ChipOp::Mask), Ok(ChipOutcome::Done));
            assert_eq!(ev.controller_op(line, ChipOp::Eoi), Ok(ChipOutcome::Done));
        }));

        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let holder = {
            let ev = Arc::clone(&ev);
            thread::spawn(move || {
                let _table = ev.table.lock();
                locked_tx.send(()).unwrap();
                // Let go eventually so a regression fails instead of hanging.
                let _ = release_rx.recv_timeout(Duration::from_millis(400));
            })
        };
        locked_rx.recv().unwrap();

        raise(ev.shared(), port(9), CpuId::BOOT);
        raise(ev.shared(), pirq_channel, CpuId::BOOT);
        let start = Instant::now();
        ev.do_upcall(CpuId::BOOT);
        let elapsed = start.elapsed();

        let _ = release_tx.send(());
        holder.join().unwrap();
        ev.lines().clear_on_dispatch();

        assert!(elapsed < Duration::from_millis(200), "dispatch waited {:?}", elapsed);
        assert_eq!(ev.lines().take_dispatched(), vec![pirq, dynamic]);
        assert!(!ev.shared().is_masked(port(9)));
        assert!(!ev.shared().is_masked(pirq_channel));
    }
}
