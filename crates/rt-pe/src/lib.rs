//! Enumerates the processing elements instantiated in a loaded bitstream
//! and maps kernel ids to the slots that implement them.

use std::collections::HashMap;

use rt_error::{Result, TapascoError};
use rt_platform::{StatusCoreView, MAX_SLOTS, SLOT_STRIDE};

/// Directory of PE slots built once at device open by scanning the status
/// core's per-slot kernel id array.
#[derive(Debug, Clone)]
pub struct PeDirectory {
    kernel_to_slots: HashMap<u32, Vec<u32>>,
    slot_to_kernel: HashMap<u32, u32>,
    slot_mem_size: HashMap<u32, u64>,
}

impl PeDirectory {
    /// Scans `status` for populated slots and builds the kernel-id-to-slot
    /// mapping. Slot ids are dense in `[0, MAX_SLOTS)`; unpopulated slots
    /// are simply absent from the resulting maps.
    #[must_use]
    pub fn scan(status: &StatusCoreView<'_>) -> Self {
        let mut kernel_to_slots: HashMap<u32, Vec<u32>> = HashMap::new();
        let mut slot_to_kernel = HashMap::new();
        let mut slot_mem_size = HashMap::new();

        for slot in 0..MAX_SLOTS {
            let Some(kernel_id) = status.kernel_id(slot) else { continue };
            let slot_id = slot as u32;
            kernel_to_slots.entry(kernel_id).or_default().push(slot_id);
            slot_to_kernel.insert(slot_id, kernel_id);
            slot_mem_size.insert(slot_id, status.mem_size(slot));
        }

        Self { kernel_to_slots, slot_to_kernel, slot_mem_size }
    }

    /// The set of slot ids that instantiate `kernel_id`, in ascending order.
    #[must_use]
    pub fn slots_for(&self, kernel_id: u32) -> &[u32] {
        self.kernel_to_slots.get(&kernel_id).map_or(&[], Vec::as_slice)
    }

    /// The kernel id instantiated at `slot_id`, or `UNKNOWN_KERNEL` if the
    /// slot does not exist or is unpopulated.
    pub fn kernel_of(&self, slot_id: u32) -> Result<u32> {
        self.slot_to_kernel.get(&slot_id).copied().ok_or(TapascoError::UnknownKernel { kernel_id: slot_id })
    }

    /// Number of slots implementing `kernel_id`.
    #[must_use]
    pub fn pe_count(&self, kernel_id: u32) -> usize {
        self.slots_for(kernel_id).len()
    }

    /// `Err(UNKNOWN_KERNEL)` if no PE in the bitstream implements `kernel_id`.
    pub fn require_kernel(&self, kernel_id: u32) -> Result<()> {
        if self.pe_count(kernel_id) == 0 {
            return Err(TapascoError::UnknownKernel { kernel_id });
        }
        Ok(())
    }

    /// PE-local memory size for `slot_id`, or `0` if the slot has none.
    #[must_use]
    pub fn local_mem_size(&self, slot_id: u32) -> u64 {
        self.slot_mem_size.get(&slot_id).copied().unwrap_or(0)
    }

    /// Control-register base address of `slot_id` within the `gp0` window.
    #[must_use]
    pub fn slot_base(slot_id: u32) -> u64 {
        u64::from(slot_id) * SLOT_STRIDE
    }

    /// Total number of populated slots across all kernel ids.
    #[must_use]
    pub fn total_slots(&self) -> usize {
        self.slot_to_kernel.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_with_slots(populated: &[(usize, u32)]) -> Vec<u8> {
        let mut buf = vec![0u8; rt_platform::STATUS_CORE_MIN_LEN];
        for slot in 0..MAX_SLOTS {
            let off = 0x20 + slot * 4;
            buf[off..off + 4].copy_from_slice(&rt_platform::NO_KERNEL.to_ne_bytes());
        }
        for &(slot, kernel_id) in populated {
            let off = 0x20 + slot * 4;
            buf[off..off + 4].copy_from_slice(&kernel_id.to_ne_bytes());
        }
        buf
    }

    #[test]
    fn scan_groups_slots_by_kernel_id() {
        let buf = status_with_slots(&[(0, 14), (1, 14), (2, 7)]);
        let dir = PeDirectory::scan(&StatusCoreView::new(&buf));
        assert_eq!(dir.slots_for(14), &[0, 1]);
        assert_eq!(dir.slots_for(7), &[2]);
        assert_eq!(dir.pe_count(14), 2);
        assert_eq!(dir.total_slots(), 3);
    }

    #[test]
    fn kernel_of_unpopulated_slot_is_unknown() {
        let buf = status_with_slots(&[]);
        let dir = PeDirectory::scan(&StatusCoreView::new(&buf));
        assert!(matches!(dir.kernel_of(5), Err(TapascoError::UnknownKernel { .. })));
    }

    #[test]
    fn require_kernel_rejects_absent_kernel_id() {
        let buf = status_with_slots(&[(0, 14)]);
        let dir = PeDirectory::scan(&StatusCoreView::new(&buf));
        assert!(dir.require_kernel(14).is_ok());
        assert!(matches!(dir.require_kernel(99), Err(TapascoError::UnknownKernel { kernel_id: 99 })));
    }

    #[test]
    fn slot_base_is_slot_times_stride() {
        assert_eq!(PeDirectory::slot_base(0), 0);
        assert_eq!(PeDirectory::slot_base(2), 2 * SLOT_STRIDE);
    }
}
