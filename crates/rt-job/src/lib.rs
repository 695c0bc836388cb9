//! Pool of job records bound to processing-element slots.
//!
//! One job record exists per PE slot. Acquiring a job for a kernel
//! id pops a free slot id off that kernel's [`rt_sync::LockFreeStack`];
//! when none is free, a blocking caller parks on a condition variable that
//! `release` signals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use rt_error::{Result, TapascoError};
use rt_pe::PeDirectory;
use rt_sync::LockFreeStack;

/// State machine a job record moves through over one job's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Not bound to any job.
    Free,
    /// Bound, arguments staged, not yet started.
    Ready,
    /// Start asserted, awaiting completion.
    Running,
    /// Completed successfully; results not yet fetched or already fetched.
    Finished,
    /// Completed with an error, or the host detected a failure.
    Failed,
}

/// An opaque handle to an acquired job. Zero is never a valid value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl JobId {
    fn encode(generation: u64, slot_id: u32) -> Self {
        Self((generation << 32) | (u64::from(slot_id) + 1))
    }

    fn slot_id(self) -> u32 {
        ((self.0 & 0xFFFF_FFFF) - 1) as u32
    }

    /// The raw value, for embedding in an ABI-facing handle.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

struct Record<P> {
    state: JobState,
    current_job: Option<JobId>,
    payload: P,
}

/// Pool of job records, one per PE slot, with per-kernel free-slot stacks.
///
/// Generic over `P`, the per-job payload the owning scheduler attaches to
/// a slot between acquire and release (argument cells, pending transfers,
/// a return-value buffer); this crate only manages slot lifecycle and
/// never interprets `P` itself.
pub struct JobRegistry<P> {
    records: Vec<Mutex<Record<P>>>,
    free_by_kernel: HashMap<u32, LockFreeStack<u32>>,
    slot_kernel: HashMap<u32, u32>,
    wake_lock: Mutex<()>,
    wake_condvar: Condvar,
    generation: AtomicU64,
}

impl<P: Default> JobRegistry<P> {
    /// Builds a registry sized to `directory`'s slot count, with each
    /// kernel id's free stack seeded from its instantiated slots.
    #[must_use]
    pub fn new(directory: &PeDirectory) -> Self {
        let total = rt_platform::MAX_SLOTS;
        let mut records = Vec::with_capacity(total);
        for _ in 0..total {
            records.push(Mutex::new(Record { state: JobState::Free, current_job: None, payload: P::default() }));
        }

        let mut free_by_kernel = HashMap::new();
        let mut slot_kernel = HashMap::new();
        for slot_id in 0..total as u32 {
            if let Ok(kernel_id) = directory.kernel_of(slot_id) {
                let stack: &LockFreeStack<u32> = free_by_kernel.entry(kernel_id).or_insert_with(LockFreeStack::new);
                stack.push(slot_id);
                slot_kernel.insert(slot_id, kernel_id);
            }
        }

        Self {
            records,
            free_by_kernel,
            slot_kernel,
            wake_lock: Mutex::new(()),
            wake_condvar: Condvar::new(),
            generation: AtomicU64::new(1),
        }
    }

    /// Acquires a free slot implementing `kernel_id`. If `blocking` is
    /// `false` and every slot is in use, returns `PE_BUSY` immediately;
    /// otherwise parks until `release` frees one.
    pub fn acquire(&self, kernel_id: u32, blocking: bool) -> Result<JobId> {
        let Some(stack) = self.free_by_kernel.get(&kernel_id) else {
            return Err(TapascoError::UnknownKernel { kernel_id });
        };

        loop {
            if let Some(slot_id) = stack.pop() {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let job_id = JobId::encode(generation, slot_id);
                let mut record = self.records[slot_id as usize].lock().unwrap_or_else(|e| e.into_inner());
                record.state = JobState::Ready;
                record.current_job = Some(job_id);
                return Ok(job_id);
            }

            if !blocking {
                return Err(TapascoError::PeBusy { kernel_id });
            }

            let guard = self.wake_lock.lock().unwrap_or_else(|e| e.into_inner());
            if stack.is_empty() {
                drop(self.wake_condvar.wait(guard));
            }
        }
    }

    /// Transitions a job from `Ready` to `Running`, i.e. start has been asserted.
    pub fn mark_running(&self, job_id: JobId) -> Result<()> {
        self.transition(job_id, &[JobState::Ready], JobState::Running)
    }

    /// Transitions a job to `Finished` after a successful completion.
    pub fn mark_finished(&self, job_id: JobId) -> Result<()> {
        self.transition(job_id, &[JobState::Running], JobState::Finished)
    }

    /// Transitions a job to `Failed`, from any in-flight state.
    pub fn mark_failed(&self, job_id: JobId) -> Result<()> {
        self.transition(job_id, &[JobState::Ready, JobState::Running], JobState::Failed)
    }

    fn transition(&self, job_id: JobId, allowed: &[JobState], next: JobState) -> Result<()> {
        let slot_id = job_id.slot_id();
        let mut record = self.record_for(slot_id, job_id)?;
        if !allowed.contains(&record.state) {
            return Err(TapascoError::InvalidHandle { handle: job_id.raw() });
        }
        record.state = next;
        Ok(())
    }

    /// Releases `job_id` back to its kernel's free stack and clears its
    /// payload. Valid only from `Ready`, `Finished` or `Failed`; releasing
    /// a `Running` job is an error and the slot is not leaked.
    pub fn release(&self, job_id: JobId) -> Result<()> {
        let slot_id = job_id.slot_id();
        let kernel_id = {
            let mut record = self.record_for(slot_id, job_id)?;
            if !matches!(record.state, JobState::Ready | JobState::Finished | JobState::Failed) {
                return Err(TapascoError::InvalidHandle { handle: job_id.raw() });
            }
            record.state = JobState::Free;
            record.current_job = None;
            record.payload = P::default();
            self.slot_kernel.get(&slot_id).copied()
        };

        if let Some(kernel_id) = kernel_id {
            if let Some(stack) = self.free_by_kernel.get(&kernel_id) {
                stack.push(slot_id);
            }
        } else {
            tracing::warn!(slot_id, "released a slot with no known owning kernel id");
        }

        let _guard = self.wake_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.wake_condvar.notify_one();
        Ok(())
    }

    /// Runs `f` with mutable access to `job_id`'s payload.
    pub fn with_payload_mut<R>(&self, job_id: JobId, f: impl FnOnce(&mut P) -> R) -> Result<R> {
        let mut record = self.record_for(job_id.slot_id(), job_id)?;
        Ok(f(&mut record.payload))
    }

    /// The PE slot id currently bound to `job_id`.
    pub fn slot_of(&self, job_id: JobId) -> Result<u32> {
        self.record_for(job_id.slot_id(), job_id)?;
        Ok(job_id.slot_id())
    }

    /// The current lifecycle state of `job_id`.
    pub fn state_of(&self, job_id: JobId) -> Result<JobState> {
        Ok(self.record_for(job_id.slot_id(), job_id)?.state)
    }

    fn record_for(&self, slot_id: u32, job_id: JobId) -> Result<std::sync::MutexGuard<'_, Record<P>>> {
        let record = self
            .records
            .get(slot_id as usize)
            .ok_or(TapascoError::InvalidHandle { handle: job_id.raw() })?
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if record.current_job != Some(job_id) {
            return Err(TapascoError::InvalidHandle { handle: job_id.raw() });
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory_with(slots: &[(u32, u32)]) -> PeDirectory {
        let mut buf = vec![0u8; rt_platform::STATUS_CORE_MIN_LEN];
        for slot in 0..rt_platform::MAX_SLOTS {
            let off = 0x20 + slot * 4;
            buf[off..off + 4].copy_from_slice(&rt_platform::NO_KERNEL.to_ne_bytes());
        }
        for &(slot_id, kernel_id) in slots {
            let off = 0x20 + slot_id as usize * 4;
            buf[off..off + 4].copy_from_slice(&kernel_id.to_ne_bytes());
        }
        PeDirectory::scan(&rt_platform::StatusCoreView::new(&buf))
    }

    #[test]
    fn acquire_unknown_kernel_fails() {
        let dir = directory_with(&[(0, 14)]);
        let reg: JobRegistry<()> = JobRegistry::new(&dir);
        assert!(matches!(reg.acquire(99, false), Err(TapascoError::UnknownKernel { kernel_id: 99 })));
    }

    #[test]
    fn non_blocking_acquire_fails_when_saturated() {
        let dir = directory_with(&[(0, 14)]);
        let reg: JobRegistry<()> = JobRegistry::new(&dir);
        let job = reg.acquire(14, false).unwrap();
        assert!(matches!(reg.acquire(14, false), Err(TapascoError::PeBusy { kernel_id: 14 })));
        reg.release(job).unwrap();
        assert!(reg.acquire(14, false).is_ok());
    }

    #[test]
    fn lifecycle_transitions_in_order() {
        let dir = directory_with(&[(0, 14)]);
        let reg: JobRegistry<()> = JobRegistry::new(&dir);
        let job = reg.acquire(14, false).unwrap();
        assert_eq!(reg.state_of(job).unwrap(), JobState::Ready);
        reg.mark_running(job).unwrap();
        assert_eq!(reg.state_of(job).unwrap(), JobState::Running);
        reg.mark_finished(job).unwrap();
        assert_eq!(reg.state_of(job).unwrap(), JobState::Finished);
        reg.release(job).unwrap();
        assert!(reg.state_of(job).is_err());
    }

    #[test]
    fn releasing_a_running_job_is_rejected() {
        let dir = directory_with(&[(0, 14)]);
        let reg: JobRegistry<()> = JobRegistry::new(&dir);
        let job = reg.acquire(14, false).unwrap();
        reg.mark_running(job).unwrap();
        assert!(matches!(reg.release(job), Err(TapascoError::InvalidHandle { .. })));
        assert_eq!(reg.state_of(job).unwrap(), JobState::Running);
    }

    #[test]
    fn payload_round_trips_through_with_payload_mut() {
        let dir = directory_with(&[(0, 14)]);
        let reg: JobRegistry<u32> = JobRegistry::new(&dir);
        let job = reg.acquire(14, false).unwrap();
        reg.with_payload_mut(job, |p| *p = 42).unwrap();
        let seen = reg.with_payload_mut(job, |p| *p).unwrap();
        assert_eq!(seen, 42);
    }

    #[test]
    fn blocking_acquire_wakes_after_release() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let dir = directory_with(&[(0, 14)]);
        let reg = Arc::new(JobRegistry::<()>::new(&dir));
        let job = reg.acquire(14, false).unwrap();

        let reg2 = Arc::clone(&reg);
        let waiter = thread::spawn(move || reg2.acquire(14, true).unwrap());

        thread::sleep(Duration::from_millis(20));
        reg.release(job).unwrap();

        let second = waiter.join().unwrap();
        assert_eq!(reg.slot_of(second).unwrap(), 0);
    }
}
