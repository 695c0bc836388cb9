//! Capability bitmask and status-core info queried at device open.

use bitflags::bitflags;

bitflags! {
    /// Capability bits recognised by the runtime, as reported by the
    /// status core's capability register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// Address Translation Services / Page Request Interface.
        const ATSPRI = 1 << 0;
        /// ATS capability can be queried and checked at runtime.
        const ATSCHECK = 1 << 1;
        /// PE-local memory is available for `Local` arguments.
        const PE_LOCAL_MEM = 1 << 2;
        /// The device supports dynamically queried base addresses rather
        /// than the fixed `SLOT_STRIDE` layout.
        const DYNAMIC_ADDRESS_MAP = 1 << 3;
        /// Running under the AWS EC2 F1 platform shim.
        const AWS_EC2_PLATFORM = 1 << 6;
    }
}

/// Static platform information cached at device open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    /// Base address of the control-register window and each mapped window.
    pub base_addrs: BaseAddresses,
    /// Design clock frequency, in Hz.
    pub design_clock_hz: u32,
    /// Memory clock frequency, in Hz.
    pub memory_clock_hz: u32,
    /// Unix timestamp the bitstream was composed (`tapasco compose`).
    pub compose_ts: u64,
    /// Vivado version the bitstream was built with, encoded as `major.minor`.
    pub vivado_version: (u16, u16),
    /// Runtime API version the bitstream reports support for.
    pub tapasco_version: (u16, u16),
    /// Number of interrupt controllers present on `gp1`.
    pub num_intc: u32,
}

/// Base addresses of the three mapped register windows, relative to the
/// process's own address space once mapped (not device addresses).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseAddresses {
    /// Base of the PE control-register aperture (`gp0`).
    pub slots: u64,
    /// Base of the interrupt controller window (`gp1`).
    pub interrupt_controller: u64,
    /// Base of the read-only status window.
    pub status: u64,
}
