//! Error taxonomy for the TaPaSCo host runtime.
//!
//! Every fallible operation in the runtime returns [`TapascoError`]. The
//! variants mirror the language-neutral error kinds of the wire-level
//! specification this runtime implements; each carries a stable
//! [`TapascoError::code`] in addition to its `Display` message, so callers
//! that need a numeric ABI (e.g. a C shim) are not forced to match on
//! strings.

use std::fmt;

/// The full error taxonomy surfaced by the TaPaSCo host runtime.
#[derive(Debug, thiserror::Error)]
pub enum TapascoError {
    /// The caller's requested API version does not match the runtime's
    /// built-in version (major mismatch, or minor newer than supported).
    #[error("API version mismatch: requested {requested}, runtime provides {available}")]
    VersionMismatch {
        /// Version string requested by the caller.
        requested: String,
        /// Version string implemented by the runtime.
        available: String,
    },

    /// The kernel character device could not be opened.
    #[error("failed to open device node {path}: {source}")]
    OpenDevFailed {
        /// Path of the device node that failed to open.
        path: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A register or status window could not be mapped into the process.
    #[error("mmap of {window} window failed: {source}")]
    MmapFailed {
        /// Name of the window being mapped (status, slots, interrupt controller).
        window: &'static str,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A control-register access addressed a location outside any mapped window.
    #[error("control address {addr:#x} is not within a mapped window")]
    InvalidCtlAddress {
        /// The offending address.
        addr: u64,
    },

    /// A control-register access had a length the hardware contract forbids.
    #[error("control access length {len} is not a valid multiple of 4 bytes")]
    InvalidCtlSize {
        /// The offending length in bytes.
        len: usize,
    },

    /// A DMA copy to or from the device failed.
    #[error("DMA transfer failed: {source}")]
    DmaFailure {
        /// Underlying OS/driver error.
        #[source]
        source: std::io::Error,
    },

    /// Waiting for a completion interrupt failed (not a timeout: device
    /// shutdown uses [`TapascoError::DeviceShutDown`] instead).
    #[error("waiting for completion interrupt on slot {slot} failed: {source}")]
    IrqWaitFailed {
        /// Slot id the wait was for.
        slot: u32,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A device-memory allocator is out of space for the requested size.
    #[error("device memory allocator exhausted for a request of {len} bytes")]
    MemAllocOom {
        /// Requested length in bytes.
        len: usize,
    },

    /// A device-memory allocation request had an invalid size (zero, or
    /// larger than the allocator's maximum order).
    #[error("invalid device memory allocation size: {len} bytes")]
    MemAllocInvalidSize {
        /// Requested length in bytes.
        len: usize,
    },

    /// A `HostHandle` did not correspond to a live allocation.
    #[error("device memory handle {handle:#x} is not a valid allocation")]
    InvalidHandle {
        /// The offending handle, as a raw device address.
        handle: u64,
    },

    /// No PE implementing the requested kernel id was free and the caller
    /// asked for a non-blocking acquire.
    #[error("no free processing element for kernel id {kernel_id}")]
    PeBusy {
        /// The kernel id that had no free instance.
        kernel_id: u32,
    },

    /// The requested kernel id is not instantiated anywhere in the loaded
    /// bitstream.
    #[error("kernel id {kernel_id} has no instances in this bitstream")]
    UnknownKernel {
        /// The unrecognised kernel id.
        kernel_id: u32,
    },

    /// A job's processing element reported failure (or the host detected one).
    #[error("job {job_id} on slot {slot} failed")]
    JobFailed {
        /// The job that failed.
        job_id: u64,
        /// The slot the job was bound to.
        slot: u32,
    },

    /// The device was torn down (`destroy_device`) while the call was in
    /// flight; outstanding waits are cancelled with this error.
    #[error("device was shut down while the operation was in flight")]
    DeviceShutDown,

    /// The requested operation is recognised but not implemented for this
    /// platform or configuration.
    #[error("operation not implemented: {0}")]
    NotImplemented(&'static str),
}

impl TapascoError {
    /// A stable numeric code for ABI consumers that cannot match on the
    /// Rust enum directly (e.g. a C shim exposing `tapasco_strerror`).
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            TapascoError::VersionMismatch { .. } => 1,
            TapascoError::OpenDevFailed { .. } => 2,
            TapascoError::MmapFailed { .. } => 3,
            TapascoError::InvalidCtlAddress { .. } => 4,
            TapascoError::InvalidCtlSize { .. } => 5,
            TapascoError::DmaFailure { .. } => 6,
            TapascoError::IrqWaitFailed { .. } => 7,
            TapascoError::MemAllocOom { .. } => 8,
            TapascoError::MemAllocInvalidSize { .. } => 9,
            TapascoError::InvalidHandle { .. } => 10,
            TapascoError::PeBusy { .. } => 11,
            TapascoError::UnknownKernel { .. } => 12,
            TapascoError::JobFailed { .. } => 13,
            TapascoError::DeviceShutDown => 14,
            TapascoError::NotImplemented(_) => 15,
        }
    }

    /// Human-readable name of the variant, stable across message wording
    /// changes. Mirrors the `strerror`-style symbolic name from the
    /// specification's error kind list.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            TapascoError::VersionMismatch { .. } => "VERSION_MISMATCH",
            TapascoError::OpenDevFailed { .. } => "OPEN_DEV_FAILED",
            TapascoError::MmapFailed { .. } => "MMAP_FAILED",
            TapascoError::InvalidCtlAddress { .. } => "INVALID_CTL_ADDRESS",
            TapascoError::InvalidCtlSize { .. } => "INVALID_CTL_SIZE",
            TapascoError::DmaFailure { .. } => "DMA_FAILURE",
            TapascoError::IrqWaitFailed { .. } => "IRQ_WAIT_FAILED",
            TapascoError::MemAllocOom { .. } => "MEM_ALLOC_OOM",
            TapascoError::MemAllocInvalidSize { .. } => "MEM_ALLOC_INVALID_SIZE",
            TapascoError::InvalidHandle { .. } => "INVALID_HANDLE",
            TapascoError::PeBusy { .. } => "PE_BUSY",
            TapascoError::UnknownKernel { .. } => "UNKNOWN_KERNEL",
            TapascoError::JobFailed { .. } => "JOB_FAILED",
            TapascoError::DeviceShutDown => "DEVICE_SHUT_DOWN",
            TapascoError::NotImplemented(_) => "NOT_IMPLEMENTED",
        }
    }
}

/// Convenience alias used throughout the runtime crates.
pub type Result<T> = std::result::Result<T, TapascoError>;

impl fmt::Display for CodeOnly<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0.kind_name(), self.0.code())
    }
}

/// Wrapper that formats an error as `SYMBOLIC_NAME (code)`, for logs that
/// want the stable identifier rather than the prose message.
pub struct CodeOnly<'a>(pub &'a TapascoError);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_unique() {
        let variants: Vec<TapascoError> = vec![
            TapascoError::VersionMismatch { requested: "1.5".into(), available: "1.0".into() },
            TapascoError::OpenDevFailed { path: "/dev/x".into(), source: std::io::Error::other("e") },
            TapascoError::MmapFailed { window: "status", source: std::io::Error::other("e") },
            TapascoError::InvalidCtlAddress { addr: 0 },
            TapascoError::InvalidCtlSize { len: 3 },
            TapascoError::DmaFailure { source: std::io::Error::other("e") },
            TapascoError::IrqWaitFailed { slot: 0, source: std::io::Error::other("e") },
            TapascoError::MemAllocOom { len: 1 },
            TapascoError::MemAllocInvalidSize { len: 0 },
            TapascoError::InvalidHandle { handle: 0 },
            TapascoError::PeBusy { kernel_id: 14 },
            TapascoError::UnknownKernel { kernel_id: 99 },
            TapascoError::JobFailed { job_id: 1, slot: 0 },
            TapascoError::DeviceShutDown,
            TapascoError::NotImplemented("x"),
        ];
        let mut codes: Vec<i32> = variants.iter().map(TapascoError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), variants.len());
    }

    #[test]
    fn kind_name_matches_spec_symbol() {
        assert_eq!(TapascoError::PeBusy { kernel_id: 1 }.kind_name(), "PE_BUSY");
        assert_eq!(TapascoError::DeviceShutDown.kind_name(), "DEVICE_SHUT_DOWN");
    }

    #[test]
    fn code_only_formats_symbol_and_number() {
        let e = TapascoError::UnknownKernel { kernel_id: 42 };
        assert_eq!(format!("{}", CodeOnly(&e)), "UNKNOWN_KERNEL (12)");
    }
}
