//! # Event Channel Configuration

/// Guest configuration for the event channel layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventConfig {
    /// Size of the native line space
    pub nr_lines: u32,
    /// Lines below this are identity-mapped to hardware GSIs
    pub nr_hw_lines: u32,
    /// Number of virtual CPUs
    pub nr_cpus: u32,
    /// Running as the privileged, hardware-owning domain
    pub initial_domain: bool,
    /// Hardware-virtualised guest (upcalls arrive through a callback)
    pub hvm: bool,
    /// HVM guest has a per-CPU callback vector
    pub vector_callback: bool,
}

impl EventConfig {
    /// Unprivileged paravirtualised guest
    pub const PV_GUEST: Self = Self {
        nr_lines: 512,
        nr_hw_lines: 16,
        nr_cpus: 4,
        initial_domain: false,
        hvm: false,
        vector_callback: false,
    };

    /// Privileged paravirtualised domain owning the hardware
    pub const PV_INITIAL_DOMAIN: Self = Self {
        nr_lines: 1024,
        nr_hw_lines: 48,
        nr_cpus: 8,
        initial_domain: true,
        hvm: false,
        vector_callback: false,
    };

    /// Hardware-virtualised guest with a callback vector
    pub const HVM_GUEST: Self = Self {
        nr_lines: 512,
        nr_hw_lines: 16,
        nr_cpus: 4,
        initial_domain: false,
        hvm: true,
        vector_callback: true,
    };

    /// Default configuration
    pub const fn default() -> Self {
        Self::PV_GUEST
    }

    /// Override the number of CPUs
    pub const fn with_cpus(mut self, nr_cpus: u32) -> Self {
        self.nr_cpus = nr_cpus;
        self
    }

    /// Enable or disable the per-CPU callback vector
    pub const fn with_vector_callback(mut self, vector_callback: bool) -> Self {
        self.vector_callback = vector_callback;
        self
    }
}
