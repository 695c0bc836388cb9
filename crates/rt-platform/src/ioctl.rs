//! ioctl request structs and codes for the `/dev/<NAME>_control` node.

use std::os::unix::io::RawFd;

use nix::{ioctl_readwrite, ioctl_write_ptr};
use rt_error::{Result, TapascoError};

const IOCTL_MAGIC: u8 = b'T';

/// `ALLOC({id, length}) -> dma_addr`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct AllocReq {
    /// Caller-chosen allocation tag, echoed back by the kernel but otherwise opaque.
    pub id: u64,
    /// Requested length in bytes.
    pub length: u64,
    /// Device address of the allocation, filled in by the kernel on success.
    pub dma_addr: u64,
}

/// `FREE({dma_addr})`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct FreeReq {
    /// Device address previously returned by `ALLOC`.
    pub dma_addr: u64,
}

/// `COPYTO`/`COPYFROM({dma_addr, length, host_ptr})`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct CopyReq {
    /// Device address of the transfer.
    pub dma_addr: u64,
    /// Transfer length in bytes.
    pub length: u64,
    /// Host-side virtual address participating in the transfer.
    pub host_ptr: u64,
}

ioctl_readwrite!(alloc_ioctl, IOCTL_MAGIC, 1, AllocReq);
ioctl_write_ptr!(free_ioctl, IOCTL_MAGIC, 2, FreeReq);
ioctl_write_ptr!(copyto_ioctl, IOCTL_MAGIC, 3, CopyReq);
ioctl_write_ptr!(copyfrom_ioctl, IOCTL_MAGIC, 4, CopyReq);

/// Issues `ALLOC` and returns the device address the kernel assigned.
pub fn alloc(fd: RawFd, id: u64, length: u64) -> Result<u64> {
    let mut req = AllocReq { id, length, dma_addr: 0 };
    // SAFETY: `req` is a valid `AllocReq` the kernel driver reads and writes in place.
    unsafe { alloc_ioctl(fd, &mut req) }.map_err(|errno| TapascoError::DmaFailure { source: errno.into() })?;
    Ok(req.dma_addr)
}

/// Issues `FREE` for a previously allocated device address.
pub fn free(fd: RawFd, dma_addr: u64) -> Result<()> {
    let req = FreeReq { dma_addr };
    // SAFETY: `req` is a valid `FreeReq`; the kernel only reads it.
    unsafe { free_ioctl(fd, &req) }.map_err(|errno| TapascoError::DmaFailure { source: errno.into() })?;
    Ok(())
}

/// Issues `COPYTO`: copies `length` bytes from `host_ptr` to `dma_addr`.
pub fn copy_to(fd: RawFd, dma_addr: u64, host_ptr: u64, length: u64) -> Result<()> {
    let req = CopyReq { dma_addr, length, host_ptr };
    // SAFETY: `req` describes a transfer the kernel validates against its own bookkeeping.
    unsafe { copyto_ioctl(fd, &req) }.map_err(|errno| TapascoError::DmaFailure { source: errno.into() })?;
    Ok(())
}

/// Issues `COPYFROM`: copies `length` bytes from `dma_addr` to `host_ptr`.
pub fn copy_from(fd: RawFd, dma_addr: u64, host_ptr: u64, length: u64) -> Result<()> {
    let req = CopyReq { dma_addr, length, host_ptr };
    // SAFETY: see `copy_to`.
    unsafe { copyfrom_ioctl(fd, &req) }.map_err(|errno| TapascoError::DmaFailure { source: errno.into() })?;
    Ok(())
}
