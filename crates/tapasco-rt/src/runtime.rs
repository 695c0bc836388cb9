//! Process-wide lifecycle: API version negotiation and logging bootstrap.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rt_error::{Result, TapascoError};

/// API version this build of the runtime implements.
pub const BUILT_IN_VERSION: (u16, u16) = (1, 0);

/// Process-wide handle returned by [`RuntimeContext::init`]. Every
/// [`crate::DeviceContext`] is created from one and must not outlive it.
#[derive(Debug)]
pub struct RuntimeContext {
    version: (u16, u16),
}

impl RuntimeContext {
    /// Verifies `requested_version` against [`BUILT_IN_VERSION`] (major must
    /// match, minor must be no newer than the runtime's) and bootstraps
    /// logging. Fails closed: on a version mismatch no context is returned
    /// and no partial state remains.
    pub fn init(requested_version: &str) -> Result<Self> {
        bootstrap_logging();
        let requested = parse_version(requested_version)?;
        if requested.0 != BUILT_IN_VERSION.0 || requested.1 > BUILT_IN_VERSION.1 {
            return Err(TapascoError::VersionMismatch {
                requested: requested_version.to_owned(),
                available: format_version(BUILT_IN_VERSION),
            });
        }
        tracing::info!(requested = requested_version, "runtime context initialised");
        Ok(Self { version: requested })
    }

    /// The negotiated `(major, minor)` version this context was opened with.
    #[must_use]
    pub fn version(&self) -> (u16, u16) {
        self.version
    }

    /// Releases the runtime-wide handle. Calling [`RuntimeContext::init`]
    /// again afterwards is safe.
    pub fn deinit(self) {
        tracing::info!("runtime context torn down");
    }
}

fn bootstrap_logging() {
    // `try_init` rather than `init`: a reinitialised context, or a host
    // application that already installed its own subscriber, must not panic.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_env("TAPASCO_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

fn parse_version(s: &str) -> Result<(u16, u16)> {
    let mismatch = || TapascoError::VersionMismatch { requested: s.to_owned(), available: format_version(BUILT_IN_VERSION) };
    let (major, minor) = s.split_once('.').ok_or_else(mismatch)?;
    let major = major.parse::<u16>().map_err(|_| mismatch())?;
    let minor = minor.parse::<u16>().map_err(|_| mismatch())?;
    Ok((major, minor))
}

fn format_version(v: (u16, u16)) -> String {
    format!("{}.{}", v.0, v.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_major_with_older_or_equal_minor_succeeds() {
        assert!(RuntimeContext::init("1.0").is_ok());
    }

    #[test]
    fn mismatched_major_is_rejected() {
        let err = RuntimeContext::init("2.0").unwrap_err();
        assert!(matches!(err, TapascoError::VersionMismatch { .. }));
    }

    #[test]
    fn newer_minor_than_built_in_is_rejected() {
        let err = RuntimeContext::init("1.9").unwrap_err();
        assert!(matches!(err, TapascoError::VersionMismatch { .. }));
    }

    #[test]
    fn malformed_version_string_is_rejected() {
        assert!(matches!(RuntimeContext::init("garbage"), Err(TapascoError::VersionMismatch { .. })));
        assert!(matches!(RuntimeContext::init("1.x"), Err(TapascoError::VersionMismatch { .. })));
    }

    #[test]
    fn reinitialisation_after_deinit_is_safe() {
        let ctx = RuntimeContext::init("1.0").unwrap();
        ctx.deinit();
        assert!(RuntimeContext::init("1.0").is_ok());
    }
}
