//! The tagged argument variants a caller builds a job's argument list from.

/// A host-side buffer pointer, tagged with the direction the caller
/// permits. The marshaller never reads through `ReadOnly` as mutable or
/// writes through it; callers are responsible for the pointer remaining
/// valid for the duration of one `stage`/`unstage` pair.
pub enum HostBuffer {
    /// A buffer the device may only read from.
    ReadOnly(*const u8),
    /// A buffer the device may read from, write to, or both.
    ReadWrite(*mut u8),
}

impl HostBuffer {
    pub(crate) fn read_ptr(&self) -> *const u8 {
        match self {
            HostBuffer::ReadOnly(p) => *p,
            HostBuffer::ReadWrite(p) => (*p).cast_const(),
        }
    }

    pub(crate) fn write_ptr(&self) -> Option<*mut u8> {
        match self {
            HostBuffer::ReadOnly(_) => None,
            HostBuffer::ReadWrite(p) => Some(*p),
        }
    }

    /// Copies the tagged raw pointer, not the pointee. Used to let a
    /// `RetVal` argument keep its own handle to the caller's buffer
    /// alongside the positional argument list.
    pub(crate) fn dup(&self) -> HostBuffer {
        match self {
            HostBuffer::ReadOnly(p) => HostBuffer::ReadOnly(*p),
            HostBuffer::ReadWrite(p) => HostBuffer::ReadWrite(*p),
        }
    }
}

// SAFETY: a `HostBuffer` is only ever dereferenced by the thread driving
// `stage`/`unstage` for the job it was built for; the caller contract
// guarantees the pointee outlives that single round trip, which is the
// same contract `PlatformGateway::copy_to`/`copy_from` already place on
// their raw-pointer parameters.
unsafe impl Send for HostBuffer {}

/// Which direction(s) a [`ArgumentSpec::WrappedPtr`] transfers data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapDirection {
    /// Copy host to device before start; no copy back.
    ToDevice,
    /// No copy before start; copy device to host after completion.
    FromDevice,
    /// Copy both directions.
    Bidirectional,
}

/// One positional job argument, tagged by how the marshaller should stage
/// and encode it.
pub enum ArgumentSpec {
    /// A value that fits directly in one 64-bit argument register; no
    /// device buffer is staged.
    Scalar64(u64),
    /// A value larger than 8 bytes, staged bidirectionally: copied
    /// host-to-device before start, copied back and freed after completion.
    ScalarPtr {
        /// The host buffer.
        host: HostBuffer,
        /// Length in bytes; must be a multiple of 4.
        len: u64,
    },
    /// Staged host-to-device before start; freed after completion with no
    /// copy back.
    InOnly {
        /// The host buffer, read-only from the device's perspective.
        host: HostBuffer,
        /// Length in bytes; must be a multiple of 4.
        len: u64,
    },
    /// Allocated with no pre-copy; copied device-to-host and freed after completion.
    OutOnly {
        /// The host buffer the result is written into.
        host: HostBuffer,
        /// Length in bytes; must be a multiple of 4.
        len: u64,
    },
    /// Staged like [`ArgumentSpec::OutOnly`], preferring PE-local memory
    /// when the `PE_LOCAL_MEM` capability is present.
    Local {
        /// The host buffer the result is written into.
        host: HostBuffer,
        /// Length in bytes; must be a multiple of 4.
        len: u64,
    },
    /// Wraps another argument, adding a byte offset applied only to the
    /// register value handed to the PE; `free` still uses the
    /// allocation's true base address.
    Offset {
        /// The wrapped argument.
        inner: Box<ArgumentSpec>,
        /// Byte offset added to the device base for the register write.
        offset: u64,
    },
    /// An explicit-length pointer argument, mandatory for arrays (the
    /// length is never inferred from a Rust type).
    WrappedPtr {
        /// The host buffer.
        host: HostBuffer,
        /// Length in bytes; must be a multiple of 4.
        len: u64,
        /// Which copies the marshaller performs.
        direction: WrapDirection,
    },
    /// First positional argument only: after completion, the scheduler
    /// writes the PE's return register into this host location instead
    /// of treating it as a device argument.
    RetVal {
        /// The host location the return value is written into.
        host: HostBuffer,
        /// Width of the return value in bytes (4 or 8).
        len: u64,
    },
}
