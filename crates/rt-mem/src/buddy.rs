//! Layered buddy allocator over three disjoint device-memory regions.

use std::sync::Mutex;

use rt_error::{Result, TapascoError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Free,
    Split,
    Allocated,
}

/// One power-of-two arena, represented as an implicit binary tree stored
/// in a flat array (index `0` is the root covering the whole arena;
/// `2i+1`/`2i+2` are a node's children).
struct BuddyTree {
    base: u64,
    min_order: u32,
    max_order: u32,
    states: Vec<NodeState>,
}

impl BuddyTree {
    fn new(base: u64, min_order: u32, max_order: u32) -> Self {
        let levels = (max_order - min_order) as usize;
        let len = (1usize << (levels + 1)) - 1;
        Self { base, min_order, max_order, states: vec![NodeState::Free; len] }
    }

    fn size_at_level(&self, level: u32) -> u64 {
        1u64 << (self.max_order - level)
    }

    fn target_level(&self, order: u32) -> u32 {
        self.max_order - order
    }

    fn left(index: usize) -> usize {
        2 * index + 1
    }

    fn right(index: usize) -> usize {
        2 * index + 2
    }

    fn sibling(index: usize) -> usize {
        if index % 2 == 1 { index + 1 } else { index - 1 }
    }

    /// Recursively finds a free node at `target_level`, splitting a larger
    /// free ancestor on the way down if no exact match exists yet.
    fn find_and_alloc(&mut self, index: usize, level: u32, target_level: u32) -> Option<usize> {
        match self.states[index] {
            NodeState::Allocated => None,
            NodeState::Free => {
                if level == target_level {
                    self.states[index] = NodeState::Allocated;
                    Some(index)
                } else {
                    self.states[index] = NodeState::Split;
                    self.states[Self::left(index)] = NodeState::Free;
                    self.states[Self::right(index)] = NodeState::Free;
                    self.find_and_alloc(Self::left(index), level + 1, target_level)
                }
            }
            NodeState::Split => {
                if level == target_level {
                    None
                } else {
                    self.find_and_alloc(Self::left(index), level + 1, target_level)
                        .or_else(|| self.find_and_alloc(Self::right(index), level + 1, target_level))
                }
            }
        }
    }

    /// Allocates a block of exactly `1 << order` bytes, `min_order <= order
    /// <= max_order`. Returns its base address.
    fn alloc(&mut self, order: u32) -> Option<u64> {
        if order < self.min_order || order > self.max_order {
            return None;
        }
        let target_level = self.target_level(order);
        let index = self.find_and_alloc(0, 0, target_level)?;
        Some(self.address_of(index, target_level))
    }

    /// Computes the base address of `index` at `level` by walking down
    /// from the root, tracking which half was taken at each step.
    fn address_of(&self, mut index: usize, level: u32) -> u64 {
        // Reconstruct the path from the root to `index`: at each level the
        // node is either a left child (offset 0) or a right child (offset
        // `size_at_level(level)`).
        let mut addr = self.base;
        let mut depth = level;
        let mut path = Vec::with_capacity(level as usize);
        while depth > 0 {
            path.push(index % 2 == 0); // true if this is a right child (index odd means left... see below)
            index = (index - 1) / 2;
            depth -= 1;
        }
        // `path` was built leaf-to-root; walk root-to-leaf applying offsets.
        for (d, is_right_child) in path.into_iter().rev().enumerate() {
            let child_level = d as u32 + 1;
            if is_right_child {
                addr += self.size_at_level(child_level);
            }
        }
        addr
    }

    /// Frees the allocation at `addr`, merging with its sibling while both
    /// are free. Returns `true` if `addr` was a live allocation.
    fn free(&mut self, addr: u64) -> bool {
        let Some(mut index) = self.locate_allocated(addr) else { return false };
        self.states[index] = NodeState::Free;
        while index != 0 {
            let parent = (index - 1) / 2;
            let sibling = Self::sibling(index);
            if self.states[sibling] == NodeState::Free {
                self.states[parent] = NodeState::Free;
                index = parent;
            } else {
                break;
            }
        }
        true
    }

    fn locate_allocated(&self, addr: u64) -> Option<usize> {
        let mut index = 0usize;
        let mut level = 0u32;
        let mut node_base = self.base;
        loop {
            match self.states[index] {
                NodeState::Split => {
                    let half = self.size_at_level(level + 1);
                    if addr < node_base + half {
                        index = Self::left(index);
                    } else {
                        node_base += half;
                        index = Self::right(index);
                    }
                    level += 1;
                }
                NodeState::Allocated => {
                    return if node_base == addr { Some(index) } else { None };
                }
                NodeState::Free => return None,
            }
        }
    }
}

/// Minimum and maximum power-of-two order, and total byte size, of one of
/// the three [`BuddyPool`] regions.
#[derive(Debug, Clone, Copy)]
pub struct PoolLayout {
    /// Base address of the region in device address space.
    pub base: u64,
    /// Total size of the region in bytes.
    pub size: u64,
    /// Smallest allocation order (`2^min_order` bytes).
    pub min_order: u32,
    /// Largest allocation order (`2^max_order` bytes) — also the arena size.
    pub max_order: u32,
}

impl PoolLayout {
    /// The default small pool: 32 MiB at `0x2000_0000`, 1 KiB..32 KiB blocks.
    #[must_use]
    pub fn default_small() -> Self {
        Self { base: 0x2000_0000, size: 32 * 1024 * 1024, min_order: 10, max_order: 15 }
    }

    /// The default medium pool: 512 MiB at `0x3000_0000`, 64 KiB..2 MiB blocks.
    #[must_use]
    pub fn default_medium() -> Self {
        Self { base: 0x3000_0000, size: 512 * 1024 * 1024, min_order: 16, max_order: 21 }
    }

    /// The default large pool: 3 GiB at `0x6000_0000`, 4 MiB..2 GiB blocks.
    #[must_use]
    pub fn default_large() -> Self {
        Self { base: 0x6000_0000, size: 3 * 1024 * 1024 * 1024, min_order: 22, max_order: 31 }
    }
}

/// One region, managed as a forest of identically-sized buddy arenas.
///
/// A configured region size that is not an exact multiple of the arena
/// size (`1 << max_order`) leaves the remainder unmanaged; this is logged
/// once at construction rather than silently dropped.
struct Region {
    arenas: Vec<BuddyTree>,
    layout: PoolLayout,
}

impl Region {
    fn new(layout: PoolLayout) -> Self {
        let arena_size = 1u64 << layout.max_order;
        let arena_count = layout.size / arena_size;
        if arena_count == 0 {
            tracing::warn!(
                base = layout.base,
                size = layout.size,
                max_order = layout.max_order,
                "pool region is smaller than one buddy arena; it will never satisfy an allocation"
            );
        } else if layout.size % arena_size != 0 {
            tracing::warn!(
                remainder = layout.size % arena_size,
                "pool region size is not a multiple of the arena size; remainder is unmanaged"
            );
        }
        let arenas = (0..arena_count)
            .map(|i| BuddyTree::new(layout.base + i * arena_size, layout.min_order, layout.max_order))
            .collect();
        Self { arenas, layout }
    }

    fn alloc(&mut self, order: u32) -> Option<u64> {
        self.arenas.iter_mut().find_map(|a| a.alloc(order))
    }

    fn free(&mut self, addr: u64) -> bool {
        let arena_size = 1u64 << self.layout.max_order;
        let Some(arena) = self.arenas.iter_mut().find(|a| addr >= a.base && addr < a.base + arena_size) else {
            return false;
        };
        arena.free(addr)
    }

    fn covers(&self, len: u64) -> bool {
        len <= (1u64 << self.layout.max_order)
    }

    fn total_capacity(&self) -> u64 {
        (self.arenas.len() as u64) << self.layout.max_order
    }
}

fn round_up_order(len: u64, min_order: u32) -> u32 {
    let mut order = min_order;
    while (1u64 << order) < len {
        order += 1;
    }
    order
}

/// Three independently-locked buddy arenas (small / medium / large) over
/// disjoint device-memory regions, selected by requested size.
pub struct BuddyPool {
    small: Mutex<Region>,
    medium: Mutex<Region>,
    large: Mutex<Region>,
}

impl BuddyPool {
    /// Builds a pool with the default region layout (§6 of the runtime's
    /// external-interface contract: small at `0x2000_0000`/32 MiB, medium
    /// at `0x3000_0000`/512 MiB, large at `0x6000_0000`/3 GiB).
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(PoolLayout::default_small(), PoolLayout::default_medium(), PoolLayout::default_large())
    }

    /// Builds a pool with explicit region layouts, e.g. for tests that
    /// want a small address space.
    #[must_use]
    pub fn new(small: PoolLayout, medium: PoolLayout, large: PoolLayout) -> Self {
        Self {
            small: Mutex::new(Region::new(small)),
            medium: Mutex::new(Region::new(medium)),
            large: Mutex::new(Region::new(large)),
        }
    }

    /// Allocates `len` bytes from whichever region's maximum block size
    /// covers the request, rounding up to the nearest valid power of two.
    pub fn alloc(&self, len: u64) -> Result<u64> {
        if len == 0 {
            return Err(TapascoError::MemAllocInvalidSize { len: 0 });
        }

        let regions = [&self.small, &self.medium, &self.large];
        for region in regions {
            let mut guard = region.lock().unwrap_or_else(|e| e.into_inner());
            if guard.covers(len) {
                let order = round_up_order(len, guard.layout.min_order);
                return guard.alloc(order).map_or_else(
                    || Err(TapascoError::MemAllocOom { len: len as usize }),
                    Ok,
                );
            }
        }
        Err(TapascoError::MemAllocInvalidSize { len: len as usize })
    }

    /// Frees a previously allocated address. Freeing an address that is
    /// not currently allocated in any region is a logged no-op, per the
    /// specification's resolution of that otherwise-ambiguous case.
    pub fn free(&self, addr: u64) {
        let regions = [&self.small, &self.medium, &self.large];
        for region in regions {
            let mut guard = region.lock().unwrap_or_else(|e| e.into_inner());
            if guard.free(addr) {
                return;
            }
        }
        tracing::warn!(addr, "freed an address that was not a live allocation in any pool; ignoring");
    }

    /// Total free capacity across all three regions, used by tests to
    /// assert that capacity returns to its initial value after an
    /// alloc/free workload.
    #[must_use]
    pub fn total_capacity(&self) -> u64 {
        self.small.lock().unwrap().total_capacity()
            + self.medium.lock().unwrap().total_capacity()
            + self.large.lock().unwrap().total_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_layouts() -> (PoolLayout, PoolLayout, PoolLayout) {
        (
            PoolLayout { base: 0x1000, size: 256, min_order: 4, max_order: 8 }, // 16B..256B, one arena
            PoolLayout { base: 0x2000, size: 4096, min_order: 9, max_order: 12 }, // 512B..4KiB
            PoolLayout { base: 0x3000, size: 1 << 16, min_order: 13, max_order: 16 },
        )
    }

    #[test]
    fn alloc_zero_is_invalid() {
        let pool = BuddyPool::new(tiny_layouts().0, tiny_layouts().1, tiny_layouts().2);
        assert!(matches!(pool.alloc(0), Err(TapascoError::MemAllocInvalidSize { len: 0 })));
    }

    #[test]
    fn alloc_larger_than_large_pool_is_invalid() {
        let pool = BuddyPool::new(tiny_layouts().0, tiny_layouts().1, tiny_layouts().2);
        assert!(matches!(pool.alloc(1 << 20), Err(TapascoError::MemAllocInvalidSize { .. })));
    }

    #[test]
    fn sequential_alloc_is_aligned_and_in_bounds() {
        let pool = BuddyPool::new(tiny_layouts().0, tiny_layouts().1, tiny_layouts().2);
        let a = pool.alloc(16).unwrap();
        assert_eq!(a % 16, 0);
        assert!((0x1000..0x1100).contains(&a));
    }

    #[test]
    fn buddy_merge_reclaims_whole_arena() {
        // a=alloc(16); b=alloc(16); c=alloc(16); d=alloc(16);
        // free(b); free(d); free(a); free(c) -> fully merged back.
        let layout = PoolLayout { base: 0, size: 64, min_order: 4, max_order: 6 };
        let mut arena = BuddyTree::new(layout.base, layout.min_order, layout.max_order);
        let order = round_up_order(16, layout.min_order);
        let a = arena.alloc(order).unwrap();
        let b = arena.alloc(order).unwrap();
        let c = arena.alloc(order).unwrap();
        let d = arena.alloc(order).unwrap();
        assert_eq!([a, b, c, d], [0, 16, 32, 48]);

        assert!(arena.free(b));
        assert!(arena.free(d));
        assert!(arena.free(a));
        assert!(arena.free(c));

        // Tree is fully merged: root is the only Free node.
        assert_eq!(arena.states[0], NodeState::Free);
        assert!(arena.states[1..].iter().all(|s| *s != NodeState::Allocated));
        // And a full-size allocation succeeds again.
        assert_eq!(arena.alloc(layout.max_order), Some(0));
    }

    #[test]
    fn freeing_unknown_address_is_a_logged_no_op() {
        let pool = BuddyPool::new(tiny_layouts().0, tiny_layouts().1, tiny_layouts().2);
        let before = pool.total_capacity();
        pool.free(0xdead_beef);
        assert_eq!(pool.total_capacity(), before);
    }

    #[test]
    fn alloc_free_round_trip_restores_capacity() {
        let pool = BuddyPool::new(tiny_layouts().0, tiny_layouts().1, tiny_layouts().2);
        let before = pool.total_capacity();
        let mut allocs = Vec::new();
        for _ in 0..8 {
            allocs.push(pool.alloc(16).unwrap());
        }
        for a in allocs {
            pool.free(a);
        }
        assert_eq!(pool.total_capacity(), before);
    }

    #[test]
    fn concurrent_alloc_free_never_double_allocates() {
        use std::collections::HashSet;
        use std::sync::{Arc, Mutex as StdMutex};
        use std::thread;

        let pool = Arc::new(BuddyPool::new(
            PoolLayout { base: 0, size: 1 << 16, min_order: 10, max_order: 15 },
            PoolLayout { base: 1 << 20, size: 1 << 22, min_order: 16, max_order: 21 },
            PoolLayout { base: 1 << 30, size: 1u64 << 32, min_order: 22, max_order: 31 },
        ));
        let live = Arc::new(StdMutex::new(HashSet::new()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let live = Arc::clone(&live);
                thread::spawn(move || {
                    for i in 0..200u64 {
                        let len = 1024 + (i % 8) * 1024;
                        if let Ok(addr) = pool.alloc(len) {
                            assert!(live.lock().unwrap().insert(addr), "double allocation at {addr:#x}");
                            pool.free(addr);
                            live.lock().unwrap().remove(&addr);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(live.lock().unwrap().is_empty());
    }
}
