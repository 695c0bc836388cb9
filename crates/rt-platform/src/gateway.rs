//! The single process-wide handle to an opened `tlkm` character device.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

use memmap2::{Mmap, MmapMut, MmapOptions};
use nix::unistd::write;
use rt_error::{Result, TapascoError};

use crate::caps::{BaseAddresses, Capabilities, PlatformInfo};
use crate::ioctl;
use crate::windows::{StatusCoreView, INTC_WINDOW_LEN, MAX_SLOTS, SLOT_STRIDE, STATUS_CORE_MIN_LEN};

/// DMA copy surface, implemented by [`PlatformGateway`] and by test
/// doubles that stand in for a live device.
pub trait DeviceCopier {
    /// Copies `len` bytes from `host_ptr` to device address `dev_addr`.
    fn copy_to(&self, host_ptr: *const u8, dev_addr: u64, len: u64) -> Result<()>;
    /// Copies `len` bytes from device address `dev_addr` to `host_ptr`.
    fn copy_from(&self, dev_addr: u64, host_ptr: *mut u8, len: u64) -> Result<()>;
}

/// The control-register and completion-wait surface a scheduler drives a
/// launch through, implemented by [`PlatformGateway`] and by in-process
/// test doubles.
pub trait Device: DeviceCopier {
    /// Reads `len` bytes at `addr` in `window` into `buf`.
    fn read_ctl(&self, window: Window, addr: u64, buf: &mut [u8]) -> Result<()>;
    /// Writes `buf` to `addr` in `window`.
    fn write_ctl(&self, window: Window, addr: u64, buf: &[u8]) -> Result<()>;
    /// Blocks until `slot_id`'s completion interrupt fires.
    fn wait_irq(&self, slot_id: u32) -> Result<()>;
    /// Capability bitmask reported by the status core.
    fn capabilities(&self) -> Capabilities;
    /// Static platform information cached at open.
    fn info(&self) -> PlatformInfo;
    /// A byte-for-byte copy of the mapped status window, for building a
    /// [`StatusCoreView`] without tying its lifetime to the device handle.
    fn status_snapshot(&self) -> Vec<u8>;
}

/// A mapped register window, named for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// The read-only status core.
    Status,
    /// The PE control-register aperture.
    Slots,
    /// The interrupt controller window.
    InterruptController,
}

impl Window {
    fn name(self) -> &'static str {
        match self {
            Window::Status => "status",
            Window::Slots => "slots",
            Window::InterruptController => "interrupt_controller",
        }
    }
}

/// Client handle to the kernel's character-device surface for one device.
///
/// Owns the `_control` and `_wait` file descriptors and three mapped
/// windows (`_tapasco_status`, `_gp0`, `_gp1`). `read_ctl`/`write_ctl` are
/// independently re-entrant; the kernel driver serialises ioctls itself,
/// so every method here takes `&self`.
pub struct PlatformGateway {
    control: File,
    wait: File,
    status: Mmap,
    gp0: MmapMut,
    gp1: MmapMut,
    info: PlatformInfo,
}

impl PlatformGateway {
    /// Opens `/dev/<device_prefix>_{control,wait,tapasco_status,gp0,gp1}`
    /// and maps all three register windows.
    pub fn open(device_prefix: &str) -> Result<Self> {
        let control_path = format!("/dev/{device_prefix}_control");
        let wait_path = format!("/dev/{device_prefix}_wait");
        let status_path = format!("/dev/{device_prefix}_tapasco_status");
        let gp0_path = format!("/dev/{device_prefix}_gp0");
        let gp1_path = format!("/dev/{device_prefix}_gp1");

        let control = open_rw(&control_path)?;
        let wait = open_rw(&wait_path)?;
        let status_file = open_ro(&status_path)?;
        let gp0_file = open_rw(&gp0_path)?;
        let gp1_file = open_rw(&gp1_path)?;

        // SAFETY: the kernel guarantees these nodes map to device-backed,
        // fixed-size register windows for the lifetime of the open file.
        let status = unsafe { MmapOptions::new().len(STATUS_CORE_MIN_LEN).map(&status_file) }
            .map_err(|source| TapascoError::MmapFailed { window: "status", source })?;
        let gp0 = unsafe { MmapOptions::new().len(MAX_SLOTS * SLOT_STRIDE as usize).map_mut(&gp0_file) }
            .map_err(|source| TapascoError::MmapFailed { window: "slots", source })?;
        let gp1 = unsafe { MmapOptions::new().len(INTC_WINDOW_LEN).map_mut(&gp1_file) }
            .map_err(|source| TapascoError::MmapFailed { window: "interrupt_controller", source })?;

        let info = read_info(&status);

        Ok(Self { control, wait, status, gp0, gp1, info })
    }

    /// Reads `len` bytes at `addr` (an offset into whichever window
    /// `addr` falls in) into `buf`.
    pub fn read_ctl(&self, window: Window, addr: u64, buf: &mut [u8]) -> Result<()> {
        validate_ctl_access(addr, buf.len())?;
        let src = self.window_bytes(window, addr, buf.len())?;
        buf.copy_from_slice(src);
        Ok(())
    }

    /// Writes `buf` to `addr` in the given window.
    ///
    /// Takes `&self`: the driver's contract is that distinct slots occupy
    /// disjoint register ranges, so concurrent writes from different
    /// threads racing on different slots are sound. The scheduler is
    /// responsible for never writing outside the slot range a job holds
    /// exclusively.
    pub fn write_ctl(&self, window: Window, addr: u64, buf: &[u8]) -> Result<()> {
        validate_ctl_access(addr, buf.len())?;
        let len = buf.len();
        let (window_len, base) = match window {
            Window::Status => return Err(TapascoError::InvalidCtlAddress { addr }),
            Window::Slots => (self.gp0.len(), self.gp0.as_ptr().cast_mut()),
            Window::InterruptController => (self.gp1.len(), self.gp1.as_ptr().cast_mut()),
        };
        let start = bounds_check(addr, len, window_len, window)?;
        // SAFETY: `start..start+len` was bounds-checked against the
        // window's mapped length; the caller contract above makes
        // concurrent writes to disjoint sub-ranges data-race-free.
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), base.add(start), len) };
        Ok(())
    }

    fn window_bytes(&self, window: Window, addr: u64, len: usize) -> Result<&[u8]> {
        let bytes: &[u8] = match window {
            Window::Status => &self.status,
            Window::Slots => &self.gp0,
            Window::InterruptController => &self.gp1,
        };
        slice_at(bytes, addr, len, window)
    }

    /// Allocates `len` bytes of device memory through the kernel driver
    /// directly, bypassing [`rt_mem::BuddyPool`](../rt_mem/struct.BuddyPool.html).
    pub fn alloc_dev(&self, len: u64) -> Result<u64> {
        ioctl::alloc(self.control.as_raw_fd(), 0, len)
    }

    /// Frees a handle previously returned by [`Self::alloc_dev`].
    pub fn free_dev(&self, handle: u64) -> Result<()> {
        ioctl::free(self.control.as_raw_fd(), handle)
    }

    /// Blocks the calling thread until the kernel reports completion for
    /// `slot_id`. Not spurious: a successful return means the slot's
    /// interrupt has fired since this call began.
    pub fn wait_irq(&self, slot_id: u32) -> Result<()> {
        let payload = slot_id.to_ne_bytes();
        write(&self.wait, &payload)
            .map_err(|errno| TapascoError::IrqWaitFailed { slot: slot_id, source: errno.into() })?;
        Ok(())
    }

    /// Capability bitmask reported by the status core.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::from_bits_truncate(StatusCoreView::new(&self.status).capabilities_raw())
    }

    /// Static platform information cached at open.
    #[must_use]
    pub fn info(&self) -> &PlatformInfo {
        &self.info
    }

    /// A read-only view over the status core, for enumerating PE slots.
    #[must_use]
    pub fn status_core(&self) -> StatusCoreView<'_> {
        StatusCoreView::new(&self.status)
    }
}

impl DeviceCopier for PlatformGateway {
    fn copy_to(&self, host_ptr: *const u8, dev_addr: u64, len: u64) -> Result<()> {
        ioctl::copy_to(self.control.as_raw_fd(), dev_addr, host_ptr as u64, len)
    }

    fn copy_from(&self, dev_addr: u64, host_ptr: *mut u8, len: u64) -> Result<()> {
        ioctl::copy_from(self.control.as_raw_fd(), dev_addr, host_ptr as u64, len)
    }
}

impl Device for PlatformGateway {
    fn read_ctl(&self, window: Window, addr: u64, buf: &mut [u8]) -> Result<()> {
        PlatformGateway::read_ctl(self, window, addr, buf)
    }

    fn write_ctl(&self, window: Window, addr: u64, buf: &[u8]) -> Result<()> {
        PlatformGateway::write_ctl(self, window, addr, buf)
    }

    fn wait_irq(&self, slot_id: u32) -> Result<()> {
        PlatformGateway::wait_irq(self, slot_id)
    }

    fn capabilities(&self) -> Capabilities {
        PlatformGateway::capabilities(self)
    }

    fn info(&self) -> PlatformInfo {
        PlatformGateway::info(self).clone()
    }

    fn status_snapshot(&self) -> Vec<u8> {
        self.status.to_vec()
    }
}

fn read_info(status: &Mmap) -> PlatformInfo {
    let view = StatusCoreView::new(status);
    let (design_clock_hz, memory_clock_hz) = view.clocks();
    PlatformInfo {
        base_addrs: BaseAddresses {
            slots: 0,
            interrupt_controller: 0,
            status: 0,
        },
        design_clock_hz,
        memory_clock_hz,
        compose_ts: view.compose_ts(),
        vivado_version: view.vivado_version(),
        tapasco_version: view.tapasco_version(),
        num_intc: view.num_intc(),
    }
}

fn validate_ctl_access(addr: u64, len: usize) -> Result<()> {
    if len % 4 != 0 {
        return Err(TapascoError::InvalidCtlSize { len });
    }
    if addr % 4 != 0 {
        return Err(TapascoError::InvalidCtlAddress { addr });
    }
    Ok(())
}

fn slice_at(bytes: &[u8], addr: u64, len: usize, window: Window) -> Result<&[u8]> {
    let start = usize::try_from(addr).map_err(|_| TapascoError::InvalidCtlAddress { addr })?;
    bytes.get(start..start + len).ok_or_else(|| {
        tracing::debug!(addr, len, window = window.name(), "control address out of range for window");
        TapascoError::InvalidCtlAddress { addr }
    })
}

fn bounds_check(addr: u64, len: usize, window_len: usize, window: Window) -> Result<usize> {
    let start = usize::try_from(addr).map_err(|_| TapascoError::InvalidCtlAddress { addr })?;
    let in_range = matches!(start.checked_add(len), Some(end) if end <= window_len);
    if !in_range {
        tracing::debug!(addr, len, window = window.name(), "control address out of range for window");
        return Err(TapascoError::InvalidCtlAddress { addr });
    }
    Ok(start)
}

fn open_rw(path: &str) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)
        .map_err(|source| TapascoError::OpenDevFailed { path: path.to_owned(), source })
}

fn open_ro(path: &str) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)
        .map_err(|source| TapascoError::OpenDevFailed { path: path.to_owned(), source })
}
