//! # Test Fakes
//!
//! A recording hypervisor and a recording line subsystem, enough to drive
//! [`EventChannels`] through every path from host unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::bitmap::AtomicBitmap;
use crate::config::EventConfig;
use crate::events::EventChannels;
use crate::hypervisor::{
    BindPirqFlags, HypercallError, HypercallResult, Hypervisor, IrqStatusFlags, MapPirqRequest, MappedPirq,
};
use crate::lines::{Controller, HandlerFlags, IrqResult, LineError, LineHandler, LineStatus, LineSubsystem};
use crate::shared::SharedInfo;
use crate::types::{Channel, CpuId, DomainId, Line, Virq};
use crate::NR_CHANNELS;

// =============================================================================
// Helpers
// =============================================================================

/// Event layer wired to fresh fakes
pub fn events(config: EventConfig) -> EventChannels<FakeHypervisor, FakeLines> {
    events_with(config, FakeHypervisor::new())
}

/// Event layer wired to a pre-configured fake hypervisor
pub fn events_with(config: EventConfig, hv: FakeHypervisor) -> EventChannels<FakeHypervisor, FakeLines> {
    let shared = Arc::new(SharedInfo::new(config.nr_cpus as usize));
    EventChannels::new(config, hv, FakeLines::new(), shared)
}

/// Channel from a raw port number
pub fn port(raw: u32) -> Channel {
    Channel::new(raw).unwrap()
}

/// Raise a channel the way the hypervisor does
pub fn raise(shared: &SharedInfo, channel: Channel, cpu: CpuId) {
    shared.pending().set(channel.index());
    if !shared.is_masked(channel) {
        shared.vcpu(cpu).mark_word_pending(channel.word());
    }
}

/// Handler that claims every interrupt
pub fn handler(_line: Line, _cookie: usize) -> IrqResult {
    IrqResult::Handled
}

// =============================================================================
// Fake hypervisor
// =============================================================================

/// Hypervisor call, as recorded by [`FakeHypervisor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeOp {
    BindInterdomain,
    BindVirq,
    BindIpi,
    BindPirq,
    BindVcpu,
    Close,
    Unmask,
    Send,
    PhysdevEoi,
    IrqStatusQuery,
    AllocIrqVector,
    MapPirq,
    UnmapPirq,
    RegisterEoiBitmap,
    SetCallbackVia,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortKind {
    Interdomain,
    Virq,
    Ipi,
    Pirq,
}

struct HvState {
    ops: Vec<FakeOp>,
    ports: BTreeMap<u32, PortKind>,
    reserved: BTreeSet<u32>,
    closed: Vec<Channel>,
    sent: Vec<Channel>,
    rejects: Vec<(FakeOp, HypercallError)>,
    needs_eoi: BTreeSet<u32>,
    shared: BTreeSet<u32>,
    pirq_flags: BTreeMap<u32, BindPirqFlags>,
    accept_eoi_bitmap: bool,
    eoi_bitmap: Option<Arc<AtomicBitmap>>,
    unmapped: Vec<(u32, DomainId)>,
    callback_via: Option<u64>,
    next_pirq: u32,
}

/// Recording hypervisor with lowest-free port allocation
pub struct FakeHypervisor {
    state: Mutex<HvState>,
    current: AtomicU32,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HvState {
                ops: Vec::new(),
                ports: BTreeMap::new(),
                reserved: BTreeSet::new(),
                closed: Vec::new(),
                sent: Vec::new(),
                rejects: Vec::new(),
                needs_eoi: BTreeSet::new(),
                shared: BTreeSet::new(),
                pirq_flags: BTreeMap::new(),
                accept_eoi_bitmap: true,
                eoi_bitmap: None,
                unmapped: Vec::new(),
                callback_via: None,
                next_pirq: 200,
            }),
            current: AtomicU32::new(0),
        }
    }

    /// Vector handed out for `gsi`
    pub const fn vector_for(gsi: u32) -> u8 {
        (0x20 + gsi % 0xd0) as u8
    }

    /// Accept or refuse the need-EOI bitmap
    pub fn accept_eoi_bitmap(&self, accept: bool) {
        self.state.lock().accept_eoi_bitmap = accept;
    }

    /// Report `gsi` as needing an explicit EOI
    pub fn set_needs_eoi(&self, gsi: u32) {
        let mut state = self.state.lock();
        state.needs_eoi.insert(gsi);
        if let Some(bitmap) = &state.eoi_bitmap {
            bitmap.set(gsi as usize);
        }
    }

    /// Report `gsi` as shared with other guests
    pub fn set_shared(&self, gsi: u32) {
        self.state.lock().shared.insert(gsi);
    }

    /// Fail every later `op` with `err`
    pub fn reject(&self, op: FakeOp, err: HypercallError) {
        self.state.lock().rejects.push((op, err));
    }

    /// Calls made so far, rejected ones included
    pub fn ops(&self) -> Vec<FakeOp> {
        self.state.lock().ops.clone()
    }

    /// Number of calls of one kind
    pub fn count(&self, op: FakeOp) -> usize {
        self.state.lock().ops.iter().filter(|&&o| o == op).count()
    }

    pub fn closed(&self, channel: Channel) -> bool {
        self.state.lock().closed.contains(&channel)
    }

    pub fn sent(&self) -> Vec<Channel> {
        self.state.lock().sent.clone()
    }

    pub fn unmapped(&self) -> Vec<(u32, DomainId)> {
        self.state.lock().unmapped.clone()
    }

    pub fn callback_via(&self) -> Option<u64> {
        self.state.lock().callback_via
    }

    pub fn pirq_flags(&self, pirq: u32) -> Option<BindPirqFlags> {
        self.state.lock().pirq_flags.get(&pirq).copied()
    }

    pub fn set_current_vcpu(&self, cpu: CpuId) {
        self.current.store(cpu.raw(), Ordering::SeqCst);
    }

    /// Drop every port, as a suspend does
    pub fn forget_all(&self) {
        self.state.lock().ports.clear();
    }

    /// Never hand out `channel`
    pub fn reserve(&self, channel: Channel) {
        self.state.lock().reserved.insert(channel.raw());
    }

    fn call(&self, op: FakeOp) -> HypercallResult<spin::MutexGuard<'_, HvState>> {
        let mut state = self.state.lock();
        state.ops.push(op);
        let rejected = state.rejects.iter().find(|(o, _)| *o == op).map(|&(_, err)| err);
        match rejected {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }

    fn alloc_port(state: &mut HvState, kind: PortKind) -> HypercallResult<Channel> {
        let raw = (1..NR_CHANNELS as u32)
            .find(|raw| !state.ports.contains_key(raw) && !state.reserved.contains(raw))
            .ok_or(HypercallError::ENOSPC)?;
        state.ports.insert(raw, kind);
        Ok(port(raw))
    }
}

impl Hypervisor for FakeHypervisor {
    fn current_vcpu(&self) -> CpuId {
        CpuId::new(self.current.load(Ordering::SeqCst))
    }

    fn bind_interdomain(&self, _remote_domain: DomainId, _remote_port: u32) -> HypercallResult<Channel> {
        let mut state = self.call(FakeOp::BindInterdomain)?;
        Self::alloc_port(&mut state, PortKind::Interdomain)
    }

    fn bind_virq(&self, _virq: Virq, _vcpu: CpuId) -> HypercallResult<Channel> {
        let mut state = self.call(FakeOp::BindVirq)?;
        Self::alloc_port(&mut state, PortKind::Virq)
    }

    fn bind_ipi(&self, _vcpu: CpuId) -> HypercallResult<Channel> {
        let mut state = self.call(FakeOp::BindIpi)?;
        Self::alloc_port(&mut state, PortKind::Ipi)
    }

    fn bind_pirq(&self, pirq: u32, flags: BindPirqFlags) -> HypercallResult<Channel> {
        let mut state = self.call(FakeOp::BindPirq)?;
        state.pirq_flags.insert(pirq, flags);
        Self::alloc_port(&mut state, PortKind::Pirq)
    }

    fn bind_vcpu(&self, channel: Channel, _vcpu: CpuId) -> HypercallResult<()> {
        let state = self.call(FakeOp::BindVcpu)?;
        match state.ports.get(&channel.raw()) {
            Some(PortKind::Virq | PortKind::Ipi) => Err(HypercallError::EINVAL),
            _ => Ok(()),
        }
    }

    fn close(&self, channel: Channel) -> HypercallResult<()> {
        let mut state = self.call(FakeOp::Close)?;
        state.ports.remove(&channel.raw());
        state.closed.push(channel);
        Ok(())
    }

    fn unmask(&self, _channel: Channel) -> HypercallResult<()> {
        self.call(FakeOp::Unmask).map(drop)
    }

    fn send(&self, channel: Channel) -> HypercallResult<()> {
        self.call(FakeOp::Send)?.sent.push(channel);
        Ok(())
    }

    fn physdev_eoi(&self, _pirq: u32) -> HypercallResult<()> {
        self.call(FakeOp::PhysdevEoi).map(drop)
    }

    fn irq_status_query(&self, pirq: u32) -> HypercallResult<IrqStatusFlags> {
        let state = self.call(FakeOp::IrqStatusQuery)?;
        let mut flags = IrqStatusFlags::empty();
        flags.set(IrqStatusFlags::NEEDS_EOI, state.needs_eoi.contains(&pirq));
        flags.set(IrqStatusFlags::SHARED, state.shared.contains(&pirq));
        Ok(flags)
    }

    fn alloc_irq_vector(&self, gsi: u32) -> HypercallResult<u8> {
        self.call(FakeOp::AllocIrqVector)?;
        Ok(Self::vector_for(gsi))
    }

    fn map_pirq(&self, _request: &MapPirqRequest) -> HypercallResult<MappedPirq> {
        let mut state = self.call(FakeOp::MapPirq)?;
        let pirq = state.next_pirq;
        state.next_pirq += 1;
        Ok(MappedPirq {
            pirq,
            index: Self::vector_for(pirq),
        })
    }

    fn unmap_pirq(&self, pirq: u32, domain: DomainId) -> HypercallResult<()> {
        self.call(FakeOp::UnmapPirq)?.unmapped.push((pirq, domain));
        Ok(())
    }

    fn register_pirq_eoi_bitmap(&self, bitmap: &Arc<AtomicBitmap>) -> HypercallResult<()> {
        let mut state = self.call(FakeOp::RegisterEoiBitmap)?;
        if !state.accept_eoi_bitmap {
            return Err(HypercallError::ENOSYS);
        }
        for &gsi in &state.needs_eoi {
            bitmap.set(gsi as usize);
        }
        state.eoi_bitmap = Some(bitmap.clone());
        Ok(())
    }

    fn set_callback_via(&self, via: u64) -> HypercallResult<()> {
        self.call(FakeOp::SetCallbackVia)?.callback_via = Some(via);
        Ok(())
    }

    fn poll(&self, _channel: Channel, _timeout: u64) -> HypercallResult<()> {
        self.call(FakeOp::Poll).map(drop)
    }
}

// =============================================================================
// Fake line subsystem
// =============================================================================

/// Callback run after a line is dispatched
pub type DispatchHook = Arc<dyn Fn(Line) + Send + Sync>;

#[derive(Default)]
struct LinesState {
    controllers: BTreeMap<Line, Controller>,
    dispatched: Vec<Line>,
    handlers: BTreeMap<Line, Vec<(usize, HandlerFlags)>>,
    affinity: BTreeMap<Line, CpuId>,
    status: BTreeMap<Line, LineStatus>,
    foreign: BTreeSet<Line>,
    reject_handlers: bool,
    enabled: BTreeMap<Line, u32>,
    disabled: BTreeMap<Line, u32>,
}

/// Recording line subsystem
pub struct FakeLines {
    state: Mutex<LinesState>,
    hook: Mutex<Option<DispatchHook>>,
}

impl FakeLines {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LinesState::default()),
            hook: Mutex::new(None),
        }
    }

    pub fn mark_foreign(&self, line: Line) {
        self.state.lock().foreign.insert(line);
    }

    pub fn dispatched(&self) -> Vec<Line> {
        self.state.lock().dispatched.clone()
    }

    pub fn take_dispatched(&self) -> Vec<Line> {
        core::mem::take(&mut self.state.lock().dispatched)
    }

    pub fn set_status(&self, line: Line, status: LineStatus) {
        self.state.lock().status.insert(line, status);
    }

    pub fn controller(&self, line: Line) -> Option<Controller> {
        self.state.lock().controllers.get(&line).copied()
    }

    pub fn affinity(&self, line: Line) -> Option<CpuId> {
        self.state.lock().affinity.get(&line).copied()
    }

    pub fn reject_handlers(&self, reject: bool) {
        self.state.lock().reject_handlers = reject;
    }

    pub fn enable_count(&self, line: Line) -> u32 {
        self.state.lock().enabled.get(&line).copied().unwrap_or(0)
    }

    pub fn disable_count(&self, line: Line) -> u32 {
        self.state.lock().disabled.get(&line).copied().unwrap_or(0)
    }

    /// Run `hook` after every dispatch
    pub fn on_dispatch(&self, hook: DispatchHook) {
        *self.hook.lock() = Some(hook);
    }

    pub fn clear_on_dispatch(&self) {
        *self.hook.lock() = None;
    }
}

impl LineSubsystem for FakeLines {
    fn register_controller(&self, line: Line, controller: Controller, _name: &'static str) {
        self.state.lock().controllers.insert(line, controller);
    }

    fn release_controller(&self, line: Line) {
        self.state.lock().controllers.remove(&line);
    }

    fn dispatch(&self, line: Line) {
        self.state.lock().dispatched.push(line);
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(line);
        }
    }

    fn request_handler(
        &self,
        line: Line,
        _handler: LineHandler,
        flags: HandlerFlags,
        _name: &'static str,
        cookie: usize,
    ) -> Result<(), LineError> {
        let mut state = self.state.lock();
        if state.reject_handlers {
            return Err(LineError::Busy);
        }
        state.handlers.entry(line).or_default().push((cookie, flags));
        Ok(())
    }

    fn release_handler(&self, line: Line, cookie: usize) {
        let mut state = self.state.lock();
        if let Some(handlers) = state.handlers.get_mut(&line) {
            handlers.retain(|&(c, _)| c != cookie);
            if handlers.is_empty() {
                state.handlers.remove(&line);
            }
        }
    }

    fn set_line_affinity(&self, line: Line, cpu: CpuId) {
        self.state.lock().affinity.insert(line, cpu);
    }

    fn disable_line(&self, line: Line) {
        *self.state.lock().disabled.entry(line).or_default() += 1;
    }

    fn enable_line(&self, line: Line) {
        *self.state.lock().enabled.entry(line).or_default() += 1;
    }

    fn line_status(&self, line: Line) -> LineStatus {
        self.state.lock().status.get(&line).copied().unwrap_or_default()
    }

    fn handler_flags(&self, line: Line) -> Option<HandlerFlags> {
        self.state.lock().handlers.get(&line).and_then(|h| h.first()).map(|&(_, flags)| flags)
    }

    fn is_foreign(&self, line: Line) -> bool {
        self.state.lock().foreign.contains(&line)
    }
}
