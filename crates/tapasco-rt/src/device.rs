//! Per-device handle: opens the register windows, scans the status core and
//! builds the PE directory, memory pools and job registry a scheduler needs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use rt_args::ArgumentSpec;
use rt_error::{Result, TapascoError};
use rt_mem::BuddyPool;
use rt_pe::PeDirectory;
use rt_platform::{Capabilities, Device as DeviceTrait, PlatformGateway, PlatformInfo, StatusCoreView};
use rt_sched::{launch, launch_async, JobFuture, LaunchOutcome, SchedulerRegistry};

use crate::config::Config;
use crate::runtime::RuntimeContext;

/// How a process holds an opened device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Only one process may hold the device. Creation fails if another
    /// exclusive holder already exists.
    Exclusive,
    /// Multiple processes may hold the device concurrently.
    Shared,
    /// Read-only observation; launch and memory-mutating calls are refused.
    Monitor,
}

/// Device ids currently held `Exclusive`, process-wide. Creating a second
/// exclusive context for the same id fails rather than silently racing a
/// live one for the same register windows.
static EXCLUSIVE_HOLDERS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// A handle to one opened FPGA device: register windows, PE directory,
/// memory pools and job registry.
///
/// Generic over the register/IRQ surface ([`rt_platform::Device`]) so tests
/// can build one around an in-process fake rather than a live `tlkm` node.
/// [`DeviceContext::create`] is the real-hardware constructor; it always
/// yields `DeviceContext<PlatformGateway>`.
pub struct DeviceContext<G: DeviceTrait = PlatformGateway> {
    dev_id: String,
    access: AccessMode,
    gateway: Arc<G>,
    directory: PeDirectory,
    pool: Arc<BuddyPool>,
    registry: Arc<SchedulerRegistry>,
}

impl DeviceContext<PlatformGateway> {
    /// Opens `/dev/<prefix><dev_id>_*`, queries capabilities and info, scans
    /// the status core for populated PE slots, and builds the directory,
    /// memory pools and job registry.
    pub fn create(_ctx: &RuntimeContext, dev_id: &str, access: AccessMode, config: &Config) -> Result<Self> {
        if access == AccessMode::Exclusive {
            let mut holders = EXCLUSIVE_HOLDERS.lock().unwrap_or_else(|e| e.into_inner());
            if !holders.insert(dev_id.to_owned()) {
                return Err(TapascoError::OpenDevFailed {
                    path: format!("{}{dev_id}", config.device_prefix),
                    source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, "device already held exclusively"),
                });
            }
        }

        let prefix = format!("{}{dev_id}", config.device_prefix);
        match PlatformGateway::open(&prefix) {
            Ok(gateway) => Ok(Self::from_gateway(dev_id, access, gateway, config)),
            Err(err) => {
                if access == AccessMode::Exclusive {
                    EXCLUSIVE_HOLDERS.lock().unwrap_or_else(|e| e.into_inner()).remove(dev_id);
                }
                Err(err)
            }
        }
    }
}

impl<G: DeviceTrait> DeviceContext<G> {
    /// Builds a context around an already-open gateway: scans its status
    /// core and builds the directory, memory pools and job registry. Used
    /// by [`DeviceContext::create`] for a live device, and directly by
    /// tests wiring up an in-process fake.
    pub fn from_gateway(dev_id: impl Into<String>, access: AccessMode, gateway: G, config: &Config) -> Self {
        let status = gateway.status_snapshot();
        let directory = PeDirectory::scan(&StatusCoreView::new(&status));
        let registry = SchedulerRegistry::new(&directory);
        let pool = BuddyPool::new(config.small_pool, config.medium_pool, config.large_pool);
        Self {
            dev_id: dev_id.into(),
            access,
            gateway: Arc::new(gateway),
            directory,
            pool: Arc::new(pool),
            registry: Arc::new(registry),
        }
    }

    /// The access mode this context was created with.
    #[must_use]
    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// The underlying register/IRQ handle this context drives.
    #[must_use]
    pub fn gateway(&self) -> &G {
        self.gateway.as_ref()
    }

    /// Capability bitmask reported by the status core.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.gateway.capabilities()
    }

    /// Static platform information cached at open.
    #[must_use]
    pub fn info(&self) -> PlatformInfo {
        self.gateway.info()
    }

    /// Number of PE instances implementing `kernel_id` in this device's bitstream.
    #[must_use]
    pub fn pe_count(&self, kernel_id: u32) -> usize {
        self.directory.pe_count(kernel_id)
    }

    /// Runs one job to completion on the calling thread.
    pub fn launch(&self, kernel_id: u32, args: &[ArgumentSpec], blocking_acquire: bool) -> Result<LaunchOutcome> {
        self.require_writable()?;
        launch(kernel_id, args, blocking_acquire, &self.registry, &self.pool, self.gateway.as_ref(), self.capabilities())
    }

    /// Allocates `len` bytes of device memory directly, outside a job launch.
    pub fn alloc(&self, len: u64) -> Result<u64> {
        self.require_writable()?;
        self.pool.alloc(len)
    }

    /// Frees an address returned by [`DeviceContext::alloc`].
    pub fn free(&self, addr: u64) -> Result<()> {
        self.require_writable()?;
        self.pool.free(addr);
        Ok(())
    }

    /// Copies `len` bytes from `host_ptr` to device address `dev_addr`.
    pub fn copy_to(&self, host_ptr: *const u8, dev_addr: u64, len: u64) -> Result<()> {
        self.require_writable()?;
        self.gateway.copy_to(host_ptr, dev_addr, len)
    }

    /// Copies `len` bytes from device address `dev_addr` to `host_ptr`.
    pub fn copy_from(&self, dev_addr: u64, host_ptr: *mut u8, len: u64) -> Result<()> {
        self.require_writable()?;
        self.gateway.copy_from(dev_addr, host_ptr, len)
    }

    /// Releases the exclusive-holder record, if any. Pending waits and
    /// outstanding futures are not forcibly cancelled by this call; a real
    /// device surfaces their failure as `DEVICE_SHUT_DOWN` when its kernel
    /// IRQ channel is actually closed, which this in-process model does not
    /// otherwise represent.
    pub fn destroy(self) {
        if self.access == AccessMode::Exclusive {
            EXCLUSIVE_HOLDERS.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.dev_id);
        }
        tracing::info!(dev_id = %self.dev_id, "device context torn down");
    }

    fn require_writable(&self) -> Result<()> {
        if self.access == AccessMode::Monitor {
            return Err(TapascoError::NotImplemented("monitor-access device contexts cannot launch jobs or mutate device memory"));
        }
        Ok(())
    }
}

impl<G: DeviceTrait + Send + Sync + 'static> DeviceContext<G> {
    /// Runs a job's pre-start effects inline and hands completion to a
    /// helper thread, returning a future that resolves once it finishes.
    pub fn launch_async(&self, kernel_id: u32, args: &[ArgumentSpec], blocking_acquire: bool) -> Result<JobFuture> {
        self.require_writable()?;
        launch_async(
            kernel_id,
            args,
            blocking_acquire,
            Arc::clone(&self.registry),
            Arc::clone(&self.pool),
            Arc::clone(&self.gateway),
            self.capabilities(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_platform::{DeviceCopier, Window, NO_KERNEL, STATUS_CORE_MIN_LEN};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct StubDevice {
        status: Vec<u8>,
        registers: StdMutex<HashMap<u64, u32>>,
    }

    impl StubDevice {
        fn new(populated: &[(usize, u32)]) -> Self {
            let mut buf = vec![0u8; STATUS_CORE_MIN_LEN];
            for slot in 0..rt_platform::MAX_SLOTS {
                let off = 0x20 + slot * 4;
                buf[off..off + 4].copy_from_slice(&NO_KERNEL.to_ne_bytes());
            }
            for &(slot, kernel_id) in populated {
                let off = 0x20 + slot * 4;
                buf[off..off + 4].copy_from_slice(&kernel_id.to_ne_bytes());
            }
            Self { status: buf, registers: StdMutex::new(HashMap::new()) }
        }
    }

    impl DeviceCopier for StubDevice {
        fn copy_to(&self, _host_ptr: *const u8, _dev_addr: u64, _len: u64) -> Result<()> {
            Ok(())
        }
        fn copy_from(&self, _dev_addr: u64, _host_ptr: *mut u8, _len: u64) -> Result<()> {
            Ok(())
        }
    }

    impl DeviceTrait for StubDevice {
        fn read_ctl(&self, _window: Window, addr: u64, buf: &mut [u8]) -> Result<()> {
            let regs = self.registers.lock().unwrap();
            buf.copy_from_slice(&regs.get(&addr).copied().unwrap_or(0).to_ne_bytes());
            Ok(())
        }

        fn write_ctl(&self, _window: Window, addr: u64, buf: &[u8]) -> Result<()> {
            self.registers.lock().unwrap().insert(addr, u32::from_ne_bytes(buf[0..4].try_into().unwrap()));
            Ok(())
        }

        fn wait_irq(&self, _slot_id: u32) -> Result<()> {
            Ok(())
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::empty()
        }

        fn info(&self) -> PlatformInfo {
            unimplemented!("not exercised by these tests")
        }

        fn status_snapshot(&self) -> Vec<u8> {
            self.status.clone()
        }
    }

    fn tiny_config() -> Config {
        Config::default()
            .with_small_pool(rt_mem::PoolLayout { base: 0, size: 1 << 16, min_order: 10, max_order: 15 })
            .with_medium_pool(rt_mem::PoolLayout { base: 1 << 20, size: 1 << 22, min_order: 16, max_order: 21 })
            .with_large_pool(rt_mem::PoolLayout { base: 1 << 30, size: 1u64 << 32, min_order: 22, max_order: 31 })
    }

    #[test]
    fn monitor_access_rejects_launch_and_alloc() {
        let ctx = DeviceContext::from_gateway("dev0", AccessMode::Monitor, StubDevice::new(&[(0, 14)]), &tiny_config());
        assert!(matches!(ctx.launch(14, &[], false), Err(TapascoError::NotImplemented(_))));
        assert!(matches!(ctx.alloc(16), Err(TapascoError::NotImplemented(_))));
    }

    #[test]
    fn shared_access_allows_launch() {
        let ctx = DeviceContext::from_gateway("dev0", AccessMode::Shared, StubDevice::new(&[(0, 14)]), &tiny_config());
        assert!(ctx.launch(14, &[ArgumentSpec::Scalar64(1)], false).is_ok());
    }

    #[test]
    fn pe_count_reflects_scanned_directory() {
        let ctx = DeviceContext::from_gateway("dev0", AccessMode::Shared, StubDevice::new(&[(0, 14), (1, 14)]), &tiny_config());
        assert_eq!(ctx.pe_count(14), 2);
        assert_eq!(ctx.pe_count(99), 0);
    }
}
