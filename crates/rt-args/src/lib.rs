//! Converts a positional argument list into a device-buffer staging plan
//! and a register-write list, and the inverse post-completion stream.
//!
//! `stage` performs every pre-start effect (allocate, copy host to
//! device); `unstage` performs every post-completion effect (copy device
//! to host, free, write the return value). Both take the pool and gateway
//! by reference rather than owning them, since a [`StagedJob`] outlives
//! the call that built it (it is carried inside a job's payload between
//! launch and completion).

mod spec;

pub use spec::{ArgumentSpec, HostBuffer, WrapDirection};

use rt_error::{Result, TapascoError};
use rt_mem::BuddyPool;
use rt_platform::{Capabilities, DeviceCopier};

struct PostAction {
    /// Device address to free; every staged buffer argument has one.
    free_addr: u64,
    /// Copy-back target, if this argument's direction includes one.
    copy_back: Option<(*mut u8, u64)>,
}

/// The result of [`stage`]: register writes ready for the scheduler, plus
/// enough bookkeeping to run [`unstage`] after the job completes.
pub struct StagedJob {
    registers: Vec<(usize, u64)>,
    post_actions: Vec<PostAction>,
    ret_val: Option<(HostBuffer, u64)>,
}

// SAFETY: the raw pointers held inside `PostAction`/`ret_val` come from
// `HostBuffer::write_ptr()` and inherit that type's caller contract: valid
// for the duration of the `stage`/`unstage` round trip, which may cross
// the thread boundary when a job's async completion runs on a different
// worker than the one that called `stage`.
unsafe impl Send for StagedJob {}

impl StagedJob {
    /// Register values to write, in `(argument_index, value)` pairs. The
    /// scheduler writes each as a 4-byte-aligned low/high word pair at
    /// `base + 0x20 + 0x10 * index`.
    #[must_use]
    pub fn registers(&self) -> &[(usize, u64)] {
        &self.registers
    }

    /// Whether this job declared a `RetVal` argument.
    #[must_use]
    pub fn expects_return_value(&self) -> bool {
        self.ret_val.is_some()
    }

    /// Writes the PE's return register value into the `RetVal` argument's
    /// host location, if one was declared. Truncates to the declared width.
    pub fn write_return(&self, value: u64) {
        let Some((host, len)) = &self.ret_val else { return };
        let Some(ptr) = host.write_ptr() else { return };
        let bytes = value.to_ne_bytes();
        let n = (*len as usize).min(8);
        // SAFETY: caller contract on `HostBuffer` guarantees `ptr` is
        // valid for at least `len` bytes for this round trip.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, n) };
    }
}

/// Stages every argument's pre-start effects: allocates device buffers and
/// issues host-to-device copies where the argument's direction requires
/// one, in positional order. On any failure, everything allocated so far
/// is freed before returning the error.
pub fn stage<G: DeviceCopier>(
    args: &[ArgumentSpec],
    pool: &BuddyPool,
    gateway: &G,
    capabilities: Capabilities,
) -> Result<StagedJob> {
    let mut registers = Vec::with_capacity(args.len());
    let mut post_actions = Vec::with_capacity(args.len());
    let mut ret_val = None;

    let result = (|| {
        for (index, arg) in args.iter().enumerate() {
            if let ArgumentSpec::RetVal { host, len } = arg {
                if index != 0 {
                    return Err(TapascoError::NotImplemented("RetVal must be the first positional argument"));
                }
                ret_val = Some((host.dup(), *len));
                continue;
            }
            stage_one(index, arg, pool, gateway, capabilities, &mut registers, &mut post_actions)?;
        }
        Ok(())
    })();

    if let Err(err) = result {
        for action in &post_actions {
            pool.free(action.free_addr);
        }
        return Err(err);
    }

    Ok(StagedJob { registers, post_actions, ret_val })
}

fn stage_one<G: DeviceCopier>(
    index: usize,
    arg: &ArgumentSpec,
    pool: &BuddyPool,
    gateway: &G,
    capabilities: Capabilities,
    registers: &mut Vec<(usize, u64)>,
    post_actions: &mut Vec<PostAction>,
) -> Result<()> {
    match arg {
        ArgumentSpec::Scalar64(v) => {
            registers.push((index, *v));
            Ok(())
        }
        ArgumentSpec::ScalarPtr { host, len } => {
            stage_buffer(index, host, *len, 0, true, true, pool, gateway, registers, post_actions)
        }
        ArgumentSpec::InOnly { host, len } => {
            stage_buffer(index, host, *len, 0, true, false, pool, gateway, registers, post_actions)
        }
        ArgumentSpec::OutOnly { host, len } => {
            stage_buffer(index, host, *len, 0, false, true, pool, gateway, registers, post_actions)
        }
        ArgumentSpec::Local { host, len } => {
            if capabilities.contains(Capabilities::PE_LOCAL_MEM) {
                tracing::debug!(index, "PE-local pools are not separately modeled; staging from the shared pool");
            } else {
                tracing::debug!(index, "PE_LOCAL_MEM not present; Local argument falls back to the shared pool");
            }
            stage_buffer(index, host, *len, 0, false, true, pool, gateway, registers, post_actions)
        }
        ArgumentSpec::Offset { inner, offset } => {
            if matches!(inner.as_ref(), ArgumentSpec::Offset { .. }) {
                return Err(TapascoError::NotImplemented("nested Offset arguments are not supported"));
            }
            let before = registers.len();
            stage_one(index, inner, pool, gateway, capabilities, registers, post_actions)?;
            if let Some(entry) = registers.get_mut(before) {
                entry.1 += offset;
            }
            Ok(())
        }
        ArgumentSpec::WrappedPtr { host, len, direction } => {
            let (pre, post) = match direction {
                WrapDirection::ToDevice => (true, false),
                WrapDirection::FromDevice => (false, true),
                WrapDirection::Bidirectional => (true, true),
            };
            stage_buffer(index, host, *len, 0, pre, post, pool, gateway, registers, post_actions)
        }
        ArgumentSpec::RetVal { .. } => unreachable!("RetVal is handled by the caller before reaching stage_one"),
    }
}

#[allow(clippy::too_many_arguments)]
fn stage_buffer<G: DeviceCopier>(
    index: usize,
    host: &HostBuffer,
    len: u64,
    extra_offset: u64,
    copy_to_device: bool,
    copy_back: bool,
    pool: &BuddyPool,
    gateway: &G,
    registers: &mut Vec<(usize, u64)>,
    post_actions: &mut Vec<PostAction>,
) -> Result<()> {
    validate_length(len)?;
    let base = pool.alloc(len)?;
    if copy_to_device {
        if let Err(err) = gateway.copy_to(host.read_ptr(), base, len) {
            pool.free(base);
            return Err(err);
        }
    }
    registers.push((index, base + extra_offset));
    post_actions.push(PostAction { free_addr: base, copy_back: if copy_back { host.write_ptr().map(|p| (p, len)) } else { None } });
    Ok(())
}

fn validate_length(len: u64) -> Result<()> {
    if len % 4 != 0 {
        return Err(TapascoError::InvalidCtlSize { len: len as usize });
    }
    Ok(())
}

/// Runs every staged argument's post-completion effects in staging order:
/// device-to-host copies, then frees. Frees always run, even if a copy
/// failed, so device memory is never leaked; the first error encountered
/// (if any) is returned after every action has run.
pub fn unstage<G: DeviceCopier>(staged: &StagedJob, gateway: &G, pool: &BuddyPool) -> Result<()> {
    let mut first_err = None;
    for action in &staged.post_actions {
        if let Some((host_ptr, len)) = action.copy_back {
            if let Err(err) = gateway.copy_from(action.free_addr, host_ptr, len) {
                first_err.get_or_insert(err);
            }
        }
    }
    for action in &staged.post_actions {
        pool.free(action.free_addr);
    }
    first_err.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_mem::PoolLayout;

    fn test_pool() -> BuddyPool {
        BuddyPool::new(
            PoolLayout { base: 0, size: 1 << 16, min_order: 10, max_order: 15 },
            PoolLayout { base: 1 << 20, size: 1 << 22, min_order: 16, max_order: 21 },
            PoolLayout { base: 1 << 30, size: 1u64 << 32, min_order: 22, max_order: 31 },
        )
    }

    #[test]
    fn validate_length_rejects_non_multiple_of_four() {
        assert!(matches!(validate_length(3), Err(TapascoError::InvalidCtlSize { len: 3 })));
        assert!(validate_length(4).is_ok());
    }

    #[test]
    fn offset_register_value_adds_offset_but_frees_base() {
        let pool = test_pool();
        let base = pool.alloc(16).unwrap();
        let mut registers = vec![(0, base)];
        let post_actions = vec![PostAction { free_addr: base, copy_back: None }];
        registers[0].1 += 8;
        assert_eq!(registers[0].1, base + 8);
        assert_eq!(post_actions[0].free_addr, base);
    }

    #[test]
    fn scalar_argument_produces_no_post_action() {
        let mut registers = Vec::new();
        let mut post_actions = Vec::new();
        let pool = test_pool();
        let gateway = NeverCalledGateway;
        stage_one(0, &ArgumentSpec::Scalar64(100), &pool, &gateway, Capabilities::empty(), &mut registers, &mut post_actions).unwrap();
        assert_eq!(registers, vec![(0, 100)]);
        assert!(post_actions.is_empty());
    }

    /// A `DeviceCopier` whose methods panic if called. `Scalar64` never
    /// stages a buffer, so this is sufficient for that test; every other
    /// variant is exercised against a real device in `tapasco-rt`'s
    /// end-to-end suite instead.
    struct NeverCalledGateway;

    impl DeviceCopier for NeverCalledGateway {
        fn copy_to(&self, _host_ptr: *const u8, _dev_addr: u64, _len: u64) -> Result<()> {
            unreachable!("scalar arguments never copy")
        }

        fn copy_from(&self, _dev_addr: u64, _host_ptr: *mut u8, _len: u64) -> Result<()> {
            unreachable!("scalar arguments never copy")
        }
    }
}
