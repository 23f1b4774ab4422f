//! # Hypervisor Transport
//!
//! The synchronous request/response calls this crate issues to the
//! hypervisor. Each call either completes or returns the hypervisor's
//! negative status code; none of them is ever assumed to be asynchronous.

use alloc::sync::Arc;
use core::fmt;

use crate::bitmap::AtomicBitmap;
use crate::types::{Channel, CpuId, DomainId, Virq};

// =============================================================================
// Errors
// =============================================================================

/// A rejected hypervisor call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HypercallError(pub i32);

impl HypercallError {
    /// Operation not permitted
    pub const EPERM: Self = Self(-1);
    /// No such object
    pub const ENOENT: Self = Self(-2);
    /// Out of resources
    pub const ENOSPC: Self = Self(-28);
    /// Invalid argument
    pub const EINVAL: Self = Self(-22);
    /// Not implemented by this hypervisor
    pub const ENOSYS: Self = Self(-38);

    /// Raw status code
    #[inline]
    pub const fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for HypercallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hypercall failed with status {}", self.0)
    }
}

/// Result of a hypervisor call
pub type HypercallResult<T> = Result<T, HypercallError>;

// =============================================================================
// Flags
// =============================================================================

bitflags::bitflags! {
    /// Flags for binding a physical interrupt
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BindPirqFlags: u32 {
        /// Other domains may bind the same physical interrupt
        const WILL_SHARE = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Physical interrupt status as reported by the hypervisor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqStatusFlags: u32 {
        /// Acknowledgement needs an explicit EOI call
        const NEEDS_EOI = 1 << 0;
        /// The interrupt is shared with other guests
        const SHARED = 1 << 1;
    }
}

/// Callback-via type: deliver upcalls through an IDT vector
pub const CALLBACK_VIA_VECTOR: u64 = 2 << 56;

// =============================================================================
// Physical interrupt mapping
// =============================================================================

/// Kind of source for a physical interrupt mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapPirqKind {
    /// Legacy GSI routed through the IO-APIC
    Gsi,
    /// Message-signalled interrupt
    Msi,
    /// MSI-X table entry
    MsiX,
}

/// Request to map a device interrupt to a physical interrupt number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapPirqRequest {
    /// Domain owning the device
    pub domain: DomainId,
    /// Source kind
    pub kind: MapPirqKind,
    /// PCI bus number
    pub bus: u8,
    /// PCI device/function
    pub devfn: u8,
    /// MSI-X table base address (MSI-X only)
    pub table_base: u64,
    /// MSI-X entry number (MSI-X only)
    pub entry_nr: u16,
}

/// Result of a successful mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPirq {
    /// Physical interrupt number assigned by the hypervisor
    pub pirq: u32,
    /// Vector or index chosen for the mapping
    pub index: u8,
}

// =============================================================================
// Transport
// =============================================================================

/// Hypervisor call transport
pub trait Hypervisor: Send + Sync {
    /// VCPU executing the caller
    fn current_vcpu(&self) -> CpuId;

    /// Connect a local channel to `remote_port` in `remote_domain`
    fn bind_interdomain(&self, remote_domain: DomainId, remote_port: u32) -> HypercallResult<Channel>;

    /// Allocate a channel delivering `virq` to `vcpu`
    fn bind_virq(&self, virq: Virq, vcpu: CpuId) -> HypercallResult<Channel>;

    /// Allocate an IPI channel targeting `vcpu`
    fn bind_ipi(&self, vcpu: CpuId) -> HypercallResult<Channel>;

    /// Allocate a channel for physical interrupt `pirq`
    fn bind_pirq(&self, pirq: u32, flags: BindPirqFlags) -> HypercallResult<Channel>;

    /// Redirect future notifications on `channel` to `vcpu`
    fn bind_vcpu(&self, channel: Channel, vcpu: CpuId) -> HypercallResult<()>;

    /// Close a channel
    fn close(&self, channel: Channel) -> HypercallResult<()>;

    /// Unmask a channel owned by a remote VCPU
    fn unmask(&self, channel: Channel) -> HypercallResult<()>;

    /// Notify the remote end of a channel
    fn send(&self, channel: Channel) -> HypercallResult<()>;

    /// Signal end-of-interrupt for physical interrupt `pirq`
    fn physdev_eoi(&self, pirq: u32) -> HypercallResult<()>;

    /// Query status flags of physical interrupt `pirq`
    fn irq_status_query(&self, pirq: u32) -> HypercallResult<IrqStatusFlags>;

    /// Allocate a vector for `gsi` (privileged domain only)
    fn alloc_irq_vector(&self, gsi: u32) -> HypercallResult<u8>;

    /// Map a device interrupt to a physical interrupt number
    fn map_pirq(&self, request: &MapPirqRequest) -> HypercallResult<MappedPirq>;

    /// Tear down a mapping made by [`Hypervisor::map_pirq`]
    fn unmap_pirq(&self, pirq: u32, domain: DomainId) -> HypercallResult<()>;

    /// Share the need-EOI bitmap with the hypervisor
    ///
    /// On success the hypervisor keeps the bitmap up to date and an EOI
    /// call also unmasks the channel.
    fn register_pirq_eoi_bitmap(&self, bitmap: &Arc<AtomicBitmap>) -> HypercallResult<()>;

    /// Set the upcall delivery method for a hardware-virtualised guest
    fn set_callback_via(&self, via: u64) -> HypercallResult<()>;

    /// Block until `channel` is pending or `timeout` expires (0: no timeout)
    fn poll(&self, channel: Channel, timeout: u64) -> HypercallResult<()>;
}
