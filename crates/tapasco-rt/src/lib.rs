//! Host runtime for dispatching jobs to FPGA processing elements over the
//! `tlkm` kernel character-device surface.
//!
//! [`RuntimeContext::init`] negotiates the API version and bootstraps
//! logging; [`DeviceContext::create`] opens one device, scans its status
//! core, and exposes [`DeviceContext::launch`]/[`DeviceContext::launch_async`]
//! over the argument marshaller and scheduler in `rt_args`/`rt_sched`.

mod config;
mod device;
mod runtime;

pub use config::Config;
pub use device::{AccessMode, DeviceContext};
pub use runtime::{RuntimeContext, BUILT_IN_VERSION};

pub use rt_args::{ArgumentSpec, HostBuffer, WrapDirection};
pub use rt_error::{Result, TapascoError};
pub use rt_mem::PoolLayout;
pub use rt_platform::{Capabilities, Device, PlatformGateway, PlatformInfo};
pub use rt_sched::{JobFuture, JobId, LaunchOutcome};
