//! Client for the kernel `tlkm` character-device surface.
//!
//! [`PlatformGateway`] is the only component in the runtime that talks to
//! the kernel driver: control-register read/write, DMA copy, device-memory
//! ioctls, and blocking IRQ wait all funnel through it.

mod caps;
mod gateway;
mod ioctl;
mod windows;

pub use caps::{BaseAddresses, Capabilities, PlatformInfo};
pub use gateway::{Device, DeviceCopier, PlatformGateway, Window};
pub use windows::{
    fence_before_start, slot_offset, StatusCoreView, MAX_SLOTS, NO_KERNEL, SLOT_STRIDE, STATUS_CORE_MIN_LEN,
};
