//! # Binding Table
//!
//! Bidirectional map between channels and lines, plus the per-line
//! descriptor and the per-CPU singleton tables for virtual interrupts and
//! IPIs.
//!
//! ## Locking
//!
//! The fields the upcall path, the controller operations and IPI senders
//! read (channel to line, line to channel, owning CPU, controller, hardware
//! interrupt number, the per-CPU IPI table) are atomics and are read
//! without any lock. Every mutation goes through a [`TableGuard`], which
//! holds the global update lock for its whole lifetime. Full line kinds,
//! claim counts and the virtual interrupt table live entirely behind that
//! lock.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use spin::{Mutex, MutexGuard};

use crate::chip::controller_for;
use crate::lines::Controller;
use crate::types::{Channel, CpuId, DomainId, IpiVector, Line, Virq};
use crate::{NR_CHANNELS, NR_IPIS, NR_VIRQS};

/// Sentinel for "no line" in the reverse table
const NO_LINE: u32 = u32::MAX;

/// Sentinel for "no channel" in the line table (port 0 is never valid)
const NO_CHANNEL: u32 = 0;

/// Sentinel for "no controller" in the controller table
const NO_CONTROLLER: u8 = 0;

const fn encode_controller(controller: Option<Controller>) -> u8 {
    match controller {
        None => NO_CONTROLLER,
        Some(Controller::Dynamic) => 1,
        Some(Controller::PerCpu) => 2,
        Some(Controller::Pirq) => 3,
    }
}

const fn decode_controller(raw: u8) -> Option<Controller> {
    match raw {
        1 => Some(Controller::Dynamic),
        2 => Some(Controller::PerCpu),
        3 => Some(Controller::Pirq),
        _ => None,
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// Physical interrupt payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PirqInfo {
    /// Hardware interrupt (GSI or mapped PIRQ) number
    pub gsi: u32,
    /// Vector allocated for the interrupt
    pub vector: u8,
    /// Other guests may share the interrupt
    pub shareable: bool,
    /// Domain owning the device
    pub domain: DomainId,
}

/// Kind of binding, with its kind-specific payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Not bound
    Unbound,
    /// Physical interrupt routed through the hypervisor
    Physical(PirqInfo),
    /// Per-CPU virtual interrupt
    Virtual {
        /// Virtual interrupt number
        virq: Virq,
    },
    /// Per-CPU inter-processor interrupt
    InterProcessor {
        /// IPI vector
        ipi: IpiVector,
    },
    /// Plain or inter-domain channel
    Channel,
}

impl LineKind {
    /// Whether the line is bound at all
    #[inline]
    pub const fn is_bound(&self) -> bool {
        !matches!(self, LineKind::Unbound)
    }
}

/// Snapshot of one line's binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineDescriptor {
    /// Kind and payload
    pub kind: LineKind,
    /// Bound channel
    pub channel: Option<Channel>,
    /// CPU the channel is delivered to
    pub cpu: CpuId,
}

impl LineDescriptor {
    /// Descriptor of a free line
    pub const fn unbound() -> Self {
        Self {
            kind: LineKind::Unbound,
            channel: None,
            cpu: CpuId::BOOT,
        }
    }

    /// Plain channel binding
    pub const fn channel(channel: Channel) -> Self {
        Self {
            kind: LineKind::Channel,
            channel: Some(channel),
            cpu: CpuId::BOOT,
        }
    }

    /// Virtual interrupt binding
    pub const fn virq(channel: Channel, virq: Virq) -> Self {
        Self {
            kind: LineKind::Virtual { virq },
            channel: Some(channel),
            cpu: CpuId::BOOT,
        }
    }

    /// IPI binding
    pub const fn ipi(channel: Channel, ipi: IpiVector) -> Self {
        Self {
            kind: LineKind::InterProcessor { ipi },
            channel: Some(channel),
            cpu: CpuId::BOOT,
        }
    }

    /// Physical interrupt binding, possibly not started yet
    pub const fn pirq(channel: Option<Channel>, info: PirqInfo) -> Self {
        Self {
            kind: LineKind::Physical(info),
            channel,
            cpu: CpuId::BOOT,
        }
    }
}

// =============================================================================
// Table
// =============================================================================

/// State protected by the update lock
#[derive(Debug)]
struct TableState {
    kinds: Vec<LineKind>,
    /// Outstanding claims on each physical line
    claims: Vec<u16>,
    virq_to_line: Vec<[Option<Line>; NR_VIRQS]>,
}

/// Channel/line binding table
#[derive(Debug)]
pub struct BindingTable {
    channel_to_line: Box<[AtomicU32]>,
    line_channel: Box<[AtomicU32]>,
    line_cpu: Box<[AtomicU32]>,
    line_controller: Box<[AtomicU8]>,
    /// Hardware interrupt number of physical lines
    line_gsi: Box<[AtomicU32]>,
    /// `(cpu, ipi)` to line, `NR_IPIS` slots per CPU; read by senders
    ipi_to_line: Box<[AtomicU32]>,
    state: Mutex<TableState>,
}

fn atomic_array(len: usize, init: u32) -> Box<[AtomicU32]> {
    let v: Vec<AtomicU32> = (0..len).map(|_| AtomicU32::new(init)).collect();
    v.into_boxed_slice()
}

impl BindingTable {
    /// Create an empty table for `nr_lines` lines and `nr_cpus` CPUs
    pub fn new(nr_lines: usize, nr_cpus: usize) -> Self {
        Self {
            channel_to_line: atomic_array(NR_CHANNELS, NO_LINE),
            line_channel: atomic_array(nr_lines, NO_CHANNEL),
            line_cpu: atomic_array(nr_lines, 0),
            line_controller: (0..nr_lines).map(|_| AtomicU8::new(NO_CONTROLLER)).collect(),
            line_gsi: atomic_array(nr_lines, 0),
            ipi_to_line: atomic_array(nr_cpus * NR_IPIS, NO_LINE),
            state: Mutex::new(TableState {
                kinds: vec![LineKind::Unbound; nr_lines],
                claims: vec![0; nr_lines],
                virq_to_line: vec![[None; NR_VIRQS]; nr_cpus],
            }),
        }
    }

    /// Take the update lock
    pub fn lock(&self) -> TableGuard<'_> {
        TableGuard {
            table: self,
            state: self.state.lock(),
        }
    }

    // -------------------------------------------------------------------------
    // Lock-free lookups
    // -------------------------------------------------------------------------

    /// Line a channel is bound to
    #[inline]
    pub fn line_of(&self, channel: Channel) -> Option<Line> {
        match self.channel_to_line[channel.index()].load(Ordering::Acquire) {
            NO_LINE => None,
            raw => Some(Line::new(raw)),
        }
    }

    /// Channel bound to a line
    #[inline]
    pub fn channel_of(&self, line: Line) -> Option<Channel> {
        Channel::new(self.line_channel[line.index()].load(Ordering::Acquire))
    }

    /// CPU a line's channel is delivered to
    #[inline]
    pub fn cpu_of(&self, line: Line) -> CpuId {
        CpuId::new(self.line_cpu[line.index()].load(Ordering::Acquire))
    }

    /// CPU a channel is delivered to; CPU 0 for unbound channels
    #[inline]
    pub fn cpu_of_channel(&self, channel: Channel) -> CpuId {
        self.line_of(channel)
            .map(|line| self.cpu_of(line))
            .unwrap_or(CpuId::BOOT)
    }

    /// Controller serving a line; `None` while it is unbound
    #[inline]
    pub fn controller_of(&self, line: Line) -> Option<Controller> {
        decode_controller(self.line_controller[line.index()].load(Ordering::Acquire))
    }

    /// Hardware interrupt number of a physical line
    #[inline]
    pub fn gsi_of(&self, line: Line) -> Option<u32> {
        match self.controller_of(line) {
            Some(Controller::Pirq) => Some(self.line_gsi[line.index()].load(Ordering::Acquire)),
            _ => None,
        }
    }

    /// Line bound to `(cpu, ipi)`
    #[inline]
    pub fn ipi_line(&self, cpu: CpuId, ipi: IpiVector) -> Option<Line> {
        match self.ipi_to_line[cpu.index() * NR_IPIS + ipi.index()].load(Ordering::Acquire) {
            NO_LINE => None,
            raw => Some(Line::new(raw)),
        }
    }

    /// Snapshot a line's descriptor
    pub fn descriptor(&self, line: Line) -> LineDescriptor {
        self.lock().descriptor(line)
    }
}

// =============================================================================
// Guard
// =============================================================================

/// Holder of the update lock; all table mutations go through it
pub struct TableGuard<'a> {
    table: &'a BindingTable,
    state: MutexGuard<'a, TableState>,
}

impl TableGuard<'_> {
    /// Kind of a line
    #[inline]
    pub fn kind(&self, line: Line) -> LineKind {
        self.state.kinds[line.index()]
    }

    /// Line a channel is bound to
    #[inline]
    pub fn line_of(&self, channel: Channel) -> Option<Line> {
        self.table.line_of(channel)
    }

    /// Channel bound to a line
    #[inline]
    pub fn channel_of(&self, line: Line) -> Option<Channel> {
        self.table.channel_of(line)
    }

    /// CPU a line's channel is delivered to
    #[inline]
    pub fn cpu_of(&self, line: Line) -> CpuId {
        self.table.cpu_of(line)
    }

    /// Snapshot a line's descriptor
    pub fn descriptor(&self, line: Line) -> LineDescriptor {
        LineDescriptor {
            kind: self.kind(line),
            channel: self.channel_of(line),
            cpu: self.cpu_of(line),
        }
    }

    /// Replace a line's descriptor, publishing its channel mapping
    ///
    /// The owning CPU is left untouched; affinity is moved separately so
    /// the per-CPU caches follow it.
    ///
    /// # Panics
    /// If the channel is already owned by a different line.
    pub fn install(&mut self, line: Line, descriptor: LineDescriptor) {
        self.set_kind(line, descriptor.kind);
        self.set_channel(line, descriptor.channel);
        if let Some(channel) = descriptor.channel {
            self.map_channel(channel, line);
        }
    }

    /// Record a line's kind and publish its controller
    fn set_kind(&mut self, line: Line, kind: LineKind) {
        self.state.kinds[line.index()] = kind;
        if let LineKind::Physical(info) = kind {
            self.table.line_gsi[line.index()].store(info.gsi, Ordering::Release);
        }
        self.table.line_controller[line.index()].store(encode_controller(controller_for(kind)), Ordering::Release);
    }

    /// Set or zap a line's channel field without touching the reverse map
    #[inline]
    pub fn set_channel(&mut self, line: Line, channel: Option<Channel>) {
        let raw = channel.map_or(NO_CHANNEL, Channel::raw);
        self.table.line_channel[line.index()].store(raw, Ordering::Release);
    }

    /// Record the owning CPU of a line
    #[inline]
    pub fn set_cpu(&mut self, line: Line, cpu: CpuId) {
        self.table.line_cpu[line.index()].store(cpu.raw(), Ordering::Release);
    }

    /// Point a channel at a line
    ///
    /// # Panics
    /// If the channel is already owned by a different line.
    pub fn map_channel(&mut self, channel: Channel, line: Line) {
        if let Some(owner) = self.line_of(channel) {
            if owner != line {
                log::error!("{} already bound to {}, refusing {}", channel, owner, line);
                panic!("event channel bound twice");
            }
        }
        self.table.channel_to_line[channel.index()].store(line.raw(), Ordering::Release);
    }

    /// Drop a channel's reverse mapping
    #[inline]
    pub fn unmap_channel(&mut self, channel: Channel) {
        self.table.channel_to_line[channel.index()].store(NO_LINE, Ordering::Release);
    }

    /// Return a line to the unbound state
    pub fn reset(&mut self, line: Line) {
        self.set_kind(line, LineKind::Unbound);
        self.state.claims[line.index()] = 0;
        self.set_channel(line, None);
        self.set_cpu(line, CpuId::BOOT);
    }

    /// Zap every channel binding: reverse map, line channels and owners
    ///
    /// Kinds and per-CPU tables survive so bindings can be re-created.
    pub fn clear_all_channels(&mut self) {
        for slot in self.table.channel_to_line.iter() {
            slot.store(NO_LINE, Ordering::Release);
        }
        for slot in self.table.line_channel.iter() {
            slot.store(NO_CHANNEL, Ordering::Release);
        }
        for slot in self.table.line_cpu.iter() {
            slot.store(0, Ordering::Release);
        }
    }

    // -------------------------------------------------------------------------
    // Per-CPU singleton tables
    // -------------------------------------------------------------------------

    /// Line bound to `(cpu, virq)`
    #[inline]
    pub fn virq_line(&self, cpu: CpuId, virq: Virq) -> Option<Line> {
        self.state.virq_to_line[cpu.index()][virq.index()]
    }

    /// Record the line bound to `(cpu, virq)`
    #[inline]
    pub fn set_virq_line(&mut self, cpu: CpuId, virq: Virq, line: Option<Line>) {
        self.state.virq_to_line[cpu.index()][virq.index()] = line;
    }

    /// Line bound to `(cpu, ipi)`
    #[inline]
    pub fn ipi_line(&self, cpu: CpuId, ipi: IpiVector) -> Option<Line> {
        self.table.ipi_line(cpu, ipi)
    }

    /// Record the line bound to `(cpu, ipi)`
    #[inline]
    pub fn set_ipi_line(&mut self, cpu: CpuId, ipi: IpiVector, line: Option<Line>) {
        let raw = line.map_or(NO_LINE, Line::raw);
        self.table.ipi_to_line[cpu.index() * NR_IPIS + ipi.index()].store(raw, Ordering::Release);
    }

    /// All `(virq, line)` bindings of one CPU
    pub fn virq_bindings(&self, cpu: CpuId) -> Vec<(Virq, Line)> {
        self.state.virq_to_line[cpu.index()]
            .iter()
            .enumerate()
            .filter_map(|(raw, line)| Some((Virq::new(raw as u32)?, (*line)?)))
            .collect()
    }

    /// All `(ipi, line)` bindings of one CPU
    pub fn ipi_bindings(&self, cpu: CpuId) -> Vec<(IpiVector, Line)> {
        IpiVector::ALL
            .iter()
            .filter_map(|&ipi| Some((ipi, self.ipi_line(cpu, ipi)?)))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Physical lines
    // -------------------------------------------------------------------------

    /// Find the physical line already allocated for `gsi`
    pub fn find_pirq(&self, gsi: u32) -> Option<Line> {
        self.state
            .kinds
            .iter()
            .position(|kind| matches!(kind, LineKind::Physical(info) if info.gsi == gsi))
            .map(|index| Line::new(index as u32))
    }

    /// Add a claim, returning the new count
    #[inline]
    pub fn add_claim(&mut self, line: Line) -> u16 {
        let claims = &mut self.state.claims[line.index()];
        *claims = claims.saturating_add(1);
        *claims
    }

    /// Drop a claim, returning the remaining count
    #[inline]
    pub fn drop_claim(&mut self, line: Line) -> u16 {
        let claims = &mut self.state.claims[line.index()];
        *claims = claims.saturating_sub(1);
        *claims
    }

    /// Lines currently bound, lowest first
    pub fn bound_lines(&self) -> Vec<Line> {
        self.state
            .kinds
            .iter()
            .enumerate()
            .filter(|(_, kind)| kind.is_bound())
            .map(|(index, _)| Line::new(index as u32))
            .collect()
    }
}
