//! Drives one job from argument staging through PE start, completion wait
//! and result collection.
//!
//! [`launch`] runs all nine steps inline on the calling thread. [`launch_async`]
//! runs steps 1–5 (acquire, stage, write arguments, assert start) inline and
//! hands steps 6–9 (wait, read-back, unstage, release) to a spawned thread,
//! returning a [`JobFuture`] that resolves once that thread finishes. There
//! is no async runtime in this stack, so "task" here means an OS thread; the
//! future itself is a plain hand-rolled one-shot, wakeable from any executor
//! that polls it.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread;

use rt_args::{stage, unstage, ArgumentSpec, StagedJob};
use rt_error::{Result, TapascoError};
use rt_job::JobRegistry;
use rt_mem::BuddyPool;
use rt_pe::PeDirectory;
use rt_platform::{slot_offset, Capabilities, Device};

pub use rt_job::JobId;

/// Per-slot payload a [`JobRegistry`] carries between acquire and release:
/// the staging plan built for the job currently bound to that slot.
pub type SchedulerRegistry = JobRegistry<Option<StagedJob>>;

/// Result of a completed launch.
#[derive(Debug, Clone, Copy)]
pub struct LaunchOutcome {
    /// The job that ran. Already released by the time this is returned.
    pub job_id: JobId,
    /// The PE's return register value, if the job declared a `RetVal` argument.
    pub return_value: Option<u64>,
}

/// Runs one job to completion on the calling thread: acquire, stage,
/// write arguments, start, wait, read back, unstage, release.
pub fn launch<G: Device>(
    kernel_id: u32,
    args: &[ArgumentSpec],
    blocking_acquire: bool,
    registry: &SchedulerRegistry,
    pool: &BuddyPool,
    gateway: &G,
    capabilities: Capabilities,
) -> Result<LaunchOutcome> {
    let job_id = registry.acquire(kernel_id, blocking_acquire)?;

    if let Err(err) = stage_into_registry(job_id, args, registry, pool, gateway, capabilities) {
        let _ = registry.mark_failed(job_id);
        let _ = registry.release(job_id);
        return Err(err);
    }

    if let Err(err) = start(job_id, registry, gateway) {
        let _ = registry.mark_failed(job_id);
        let _ = registry.release(job_id);
        return Err(err);
    }

    let slot_id = registry.slot_of(job_id)?;
    let result = finish(job_id, slot_id, registry, gateway, pool);
    let _ = registry.release(job_id);
    result
}

/// Runs one job's pre-start effects and returns a handle to its
/// post-completion effects, which run on a helper thread.
///
/// `registry`, `pool` and `gateway` are shared with the helper thread, so
/// they are taken by `Arc` rather than by reference.
pub fn launch_async<G: Device + Send + Sync + 'static>(
    kernel_id: u32,
    args: &[ArgumentSpec],
    blocking_acquire: bool,
    registry: Arc<SchedulerRegistry>,
    pool: Arc<BuddyPool>,
    gateway: Arc<G>,
    capabilities: Capabilities,
) -> Result<JobFuture> {
    let job_id = registry.acquire(kernel_id, blocking_acquire)?;

    if let Err(err) = stage_into_registry(job_id, args, &registry, &pool, gateway.as_ref(), capabilities) {
        let _ = registry.mark_failed(job_id);
        let _ = registry.release(job_id);
        return Err(err);
    }

    if let Err(err) = start(job_id, &registry, gateway.as_ref()) {
        let _ = registry.mark_failed(job_id);
        let _ = registry.release(job_id);
        return Err(err);
    }

    let slot_id = registry.slot_of(job_id)?;
    let shared = Arc::new(FutureState::default());
    let shared_for_thread = Arc::clone(&shared);

    thread::spawn(move || {
        let result = finish(job_id, slot_id, &registry, gateway.as_ref(), &pool);
        let _ = registry.release(job_id);
        shared_for_thread.resolve(result);
    });

    Ok(JobFuture { shared })
}

/// Step 2: stages the argument list and stores the resulting plan in the
/// slot's own job record, where [`start`] and [`finish`] retrieve it from.
fn stage_into_registry<G: Device>(
    job_id: JobId,
    args: &[ArgumentSpec],
    registry: &SchedulerRegistry,
    pool: &BuddyPool,
    gateway: &G,
    capabilities: Capabilities,
) -> Result<()> {
    let staged = stage(args, pool, gateway, capabilities)?;
    registry.with_payload_mut(job_id, |slot| *slot = Some(staged))
}

/// Steps 3–5: compute the slot's control-register base, write each
/// argument register, transition to `Running`, fence, then assert start.
fn start<G: Device>(job_id: JobId, registry: &SchedulerRegistry, gateway: &G) -> Result<()> {
    let slot_id = registry.slot_of(job_id)?;
    let base = PeDirectory::slot_base(slot_id);

    let registers = registry.with_payload_mut(job_id, |slot| {
        slot.as_ref().map(|staged| staged.registers().to_vec()).unwrap_or_default()
    })?;

    for (index, value) in registers {
        let addr = base + slot_offset::ARGS_BASE + slot_offset::ARG_STRIDE * index as u64;
        gateway.write_ctl(rt_platform::Window::Slots, addr, &value.to_ne_bytes())?;
    }

    registry.mark_running(job_id)?;
    rt_platform::fence_before_start();
    gateway.write_ctl(rt_platform::Window::Slots, base + slot_offset::CTRL, &1u32.to_ne_bytes())
}

/// Steps 6–9: wait for completion, read the return register, run the
/// post-stream, and transition to `Finished`/`Failed`. Does not release
/// the slot; callers do that once this returns.
fn finish<G: Device>(
    job_id: JobId,
    slot_id: u32,
    registry: &SchedulerRegistry,
    gateway: &G,
    pool: &BuddyPool,
) -> Result<LaunchOutcome> {
    let wait_result = gateway.wait_irq(slot_id);

    let base = PeDirectory::slot_base(slot_id);
    let return_value = wait_result.and_then(|()| {
        let mut buf = [0u8; 8];
        gateway.read_ctl(rt_platform::Window::Slots, base + slot_offset::RETURN_LO, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    });

    let staged = registry.with_payload_mut(job_id, |slot| slot.take())?;
    let Some(staged) = staged else {
        let _ = registry.mark_failed(job_id);
        return Err(TapascoError::InvalidHandle { handle: job_id.raw() });
    };

    let unstage_result = unstage(&staged, gateway, pool);

    match (return_value, unstage_result) {
        (Ok(value), Ok(())) => {
            if staged.expects_return_value() {
                staged.write_return(value);
            }
            registry.mark_finished(job_id)?;
            Ok(LaunchOutcome { job_id, return_value: staged.expects_return_value().then_some(value) })
        }
        (Err(err), _) | (_, Err(err)) => {
            let _ = registry.mark_failed(job_id);
            Err(err)
        }
    }
}

#[derive(Default)]
struct FutureState {
    result: Mutex<Option<Result<LaunchOutcome>>>,
    waker: Mutex<Option<Waker>>,
}

impl FutureState {
    fn resolve(&self, result: Result<LaunchOutcome>) {
        *self.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
        if let Some(waker) = self.waker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            waker.wake();
        }
    }
}

/// A one-shot future resolving once a job launched with [`launch_async`]
/// completes. Not fused: polling again after it has already returned
/// `Ready` parks forever, since the helper thread only resolves once.
pub struct JobFuture {
    shared: Arc<FutureState>,
}

impl Future for JobFuture {
    type Output = Result<LaunchOutcome>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut result = self.shared.result.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(outcome) = result.take() {
            return Poll::Ready(outcome);
        }
        drop(result);
        *self.shared.waker.lock().unwrap_or_else(|e| e.into_inner()) = Some(cx.waker().clone());
        Poll::Pending
    }
}
