//! Device memory-region layout and kernel device-node naming, overridable
//! by environment variables read once at [`crate::DeviceContext::create`] time.

use rt_mem::PoolLayout;

/// Device-node prefix and the three `BuddyPool` region layouts a
/// [`crate::DeviceContext`] is built with.
///
/// Defaults match the runtime's external-interface contract (small pool at
/// `0x2000_0000`, medium at `0x3000_0000`, large at `0x6000_0000`). Use
/// [`Config::from_env`] to apply `TAPASCO_*` overrides, or the `with_*`
/// builder methods to set fields explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    /// Device node prefix; the per-device suffix (e.g. `_control`) and the
    /// device id are appended to this to form `/dev/<prefix><dev_id>_control`.
    pub device_prefix: String,
    /// Layout of the small-allocation pool.
    pub small_pool: PoolLayout,
    /// Layout of the medium-allocation pool.
    pub medium_pool: PoolLayout,
    /// Layout of the large-allocation pool.
    pub large_pool: PoolLayout,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_prefix: "tlkm".to_owned(),
            small_pool: PoolLayout::default_small(),
            medium_pool: PoolLayout::default_medium(),
            large_pool: PoolLayout::default_large(),
        }
    }
}

impl Config {
    /// Starts from [`Config::default`] and applies any recognised
    /// environment variable override. A malformed value is logged and the
    /// field is left at its default rather than failing construction:
    ///
    /// - `TAPASCO_DEVICE_PREFIX`
    /// - `TAPASCO_SMALL_POOL_BASE`, `TAPASCO_MEDIUM_POOL_BASE`, `TAPASCO_LARGE_POOL_BASE`
    ///   (decimal, or hex with a `0x` prefix)
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(prefix) = std::env::var("TAPASCO_DEVICE_PREFIX") {
            config.device_prefix = prefix;
        }
        override_base("TAPASCO_SMALL_POOL_BASE", &mut config.small_pool.base);
        override_base("TAPASCO_MEDIUM_POOL_BASE", &mut config.medium_pool.base);
        override_base("TAPASCO_LARGE_POOL_BASE", &mut config.large_pool.base);
        config
    }

    /// Overrides the device node prefix.
    #[must_use]
    pub fn with_device_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.device_prefix = prefix.into();
        self
    }

    /// Overrides the small-pool layout.
    #[must_use]
    pub fn with_small_pool(mut self, layout: PoolLayout) -> Self {
        self.small_pool = layout;
        self
    }

    /// Overrides the medium-pool layout.
    #[must_use]
    pub fn with_medium_pool(mut self, layout: PoolLayout) -> Self {
        self.medium_pool = layout;
        self
    }

    /// Overrides the large-pool layout.
    #[must_use]
    pub fn with_large_pool(mut self, layout: PoolLayout) -> Self {
        self.large_pool = layout;
        self
    }
}

fn override_base(var: &str, slot: &mut u64) {
    let Ok(raw) = std::env::var(var) else { return };
    let parsed = raw.strip_prefix("0x").map_or_else(|| raw.parse::<u64>(), |hex| u64::from_str_radix(hex, 16));
    match parsed {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(var, raw, "ignoring malformed environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_external_interface_layout() {
        let config = Config::default();
        assert_eq!(config.small_pool.base, 0x2000_0000);
        assert_eq!(config.medium_pool.base, 0x3000_0000);
        assert_eq!(config.large_pool.base, 0x6000_0000);
        assert_eq!(config.device_prefix, "tlkm");
    }

    #[test]
    fn builder_methods_override_individual_fields() {
        let config = Config::default().with_device_prefix("fpga0").with_small_pool(PoolLayout {
            base: 0x1000,
            size: 4096,
            min_order: 4,
            max_order: 8,
        });
        assert_eq!(config.device_prefix, "fpga0");
        assert_eq!(config.small_pool.base, 0x1000);
        assert_eq!(config.medium_pool.base, 0x3000_0000);
    }

    #[test]
    fn override_base_ignores_malformed_value_and_keeps_default() {
        let mut base = 0x2000_0000u64;
        override_base("TAPASCO_RT_CONFIG_TEST_UNSET_VAR", &mut base);
        assert_eq!(base, 0x2000_0000);
    }

    #[test]
    fn override_base_accepts_hex_and_decimal() {
        let mut base = 0u64;
        std::env::set_var("TAPASCO_RT_CONFIG_TEST_HEX", "0x1234");
        override_base("TAPASCO_RT_CONFIG_TEST_HEX", &mut base);
        assert_eq!(base, 0x1234);
        std::env::remove_var("TAPASCO_RT_CONFIG_TEST_HEX");

        let mut base = 0u64;
        std::env::set_var("TAPASCO_RT_CONFIG_TEST_DEC", "4096");
        override_base("TAPASCO_RT_CONFIG_TEST_DEC", &mut base);
        assert_eq!(base, 4096);
        std::env::remove_var("TAPASCO_RT_CONFIG_TEST_DEC");
    }
}
