//! Size accounting of the object heap.
//!
//! A [`HeapSpace`] decides whether a pool may be taken from the object space
//! at all: it keeps a logical `current_size` between `min_size` and
//! `max_size`, refuses allocations that do not fit it, and resizes it when a
//! collection ends. [`GenerationalSpaces`] does the same for a young and a
//! tenured generation sharing one object space.
//!
//! Refusals are `NULLPOOL` or `None`; deciding to collect and retry is up to
//! the caller. While a collection runs (`set_is_work_gc(true)`), a space may
//! grow up to its maximum so that the collector itself is never refused.
//!
//! Both types borrow the [`MmapMemPool`] they carve from. Their own lock is
//! always taken before the pool manager's.
//!
//! [`HeapSpace`]: struct.HeapSpace.html
//! [`GenerationalSpaces`]: struct.GenerationalSpaces.html
//! [`MmapMemPool`]: ../mmap_mem_pool/struct.MmapMemPool.html

use core::cmp;
use core::ptr::NonNull;

use log::{debug, warn};
use spin::RwLock;

use crate::arena::{Arena, ArenaPlacement};
use crate::config::{GenerationalConfig, HeapConfig, DEFAULT_YOUNG_SPACE_SIZE};
use crate::error::ConfigError;
use crate::mem_pool::MemPool;
use crate::mmap_mem_pool::MmapMemPool;
use crate::os::VirtualMemory;
use crate::pool::{
    align_down, align_up, checked_align_up, AllocatorType, OsPagesAllocPolicy, OsPagesPolicy,
    Pool, SpaceType, DEFAULT_ALIGNMENT, NULLPOOL, POOL_ALIGNMENT,
};

/// The sizing state of one space.
///
/// `min_size <= current_size <= max_size` holds at all times.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMemorySpace {
    current_size: usize,
    min_size: usize,
    max_size: usize,
    /// Size of the last refused pool; the next resize makes room for it.
    saved_pool_size: usize,
    min_free_percentage: u32,
    max_free_percentage: u32,
    is_work_gc: bool,
}

// Smallest size in which `used` bytes leave `free_percentage` percent free.
fn size_for_free_share(used: usize, free_percentage: u32) -> usize {
    if free_percentage >= 100 {
        return usize::MAX;
    }
    let size = used as u128 * 100 / (100 - free_percentage) as u128;
    cmp::min(size, usize::MAX as u128) as usize
}

impl ObjectMemorySpace {
    pub fn new(
        initial_size: usize,
        max_size: usize,
        min_free_percentage: u32,
        max_free_percentage: u32,
    ) -> Self {
        assert!(initial_size <= max_size);
        ObjectMemorySpace {
            current_size: initial_size,
            min_size: initial_size,
            max_size,
            saved_pool_size: 0,
            min_free_percentage,
            max_free_percentage,
            is_work_gc: false,
        }
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn saved_pool_size(&self) -> usize {
        self.saved_pool_size
    }

    pub fn is_work_gc(&self) -> bool {
        self.is_work_gc
    }

    /// How much the space has to grow for `bytes` to fit, given
    /// `free_bytes` currently free in it. `None` means refused.
    pub fn will_alloc(&self, bytes: usize, free_bytes: usize) -> Option<usize> {
        debug_assert!(
            bytes <= self.max_size,
            "Request of {} bytes exceeds the space maximum {}",
            bytes,
            self.max_size
        );
        if bytes <= free_bytes {
            return Some(0);
        }
        let increase = bytes - free_bytes;
        if self.is_work_gc && self.current_size + increase <= self.max_size {
            return Some(increase);
        }
        None
    }

    pub fn increase_by(&mut self, bytes: usize) {
        let size = align_up(self.current_size + bytes, DEFAULT_ALIGNMENT);
        self.current_size = cmp::min(size, self.max_size);
    }

    pub fn reduce_by(&mut self, bytes: usize) {
        assert!(self.current_size >= bytes);
        let size = align_up(self.current_size - bytes, DEFAULT_ALIGNMENT);
        self.current_size = cmp::max(size, self.min_size);
    }

    /// Resize after a collection so the free share of the space lands
    /// between the two percentages, within `[min_size, max_size]`.
    pub fn compute_new_size(&mut self, free_bytes: usize) {
        assert!(self.current_size >= free_bytes);
        let used = self.current_size - free_bytes;

        let grow_to = cmp::min(
            size_for_free_share(used, self.min_free_percentage),
            self.max_size,
        );
        if self.current_size < grow_to {
            self.increase_by(grow_to - self.current_size);
            return;
        }

        let shrink_to = cmp::max(
            size_for_free_share(used, self.max_free_percentage),
            self.min_size,
        );
        if self.current_size > shrink_to {
            self.reduce_by(self.current_size - shrink_to);
        }
    }

    /// Lower the maximum; never below the current size.
    pub fn clamp_new_max_size(&mut self, new_max_size: usize) {
        assert!(new_max_size >= self.current_size);
        self.max_size = cmp::min(new_max_size, self.max_size);
    }

    fn set_is_work_gc(&mut self, value: bool) {
        self.is_work_gc = value;
    }

    fn save_pool_size(&mut self, size: usize) {
        self.saved_pool_size = size;
    }

    // The end-of-collection resize, including the growth owed to the last
    // refused pool. `free_bytes` computes the free bytes of this space.
    fn resize_after_gc<F: Fn(&ObjectMemorySpace) -> usize>(&mut self, free_bytes: F) {
        self.compute_new_size(free_bytes(self));
        let free_after = free_bytes(self);
        if self.saved_pool_size > free_after {
            self.increase_by(self.saved_pool_size - free_after);
            self.saved_pool_size = 0;
            // The saved pool takes everything that is free now.
            self.compute_new_size(0);
        }
        self.is_work_gc = false;
    }
}

fn current_free_bytes<V: VirtualMemory>(
    pools: &MmapMemPool<V>,
    space: &ObjectMemorySpace,
    bytes_not_in_this_space: usize,
) -> usize {
    let used = pools.object_used_bytes().saturating_sub(bytes_not_in_this_space);
    space.current_size.saturating_sub(used)
}

// Pool sizes as the pool manager will hand them out; `None` when no pool
// can be that large.
fn pool_size(size: usize) -> Option<usize> {
    checked_align_up(size, POOL_ALIGNMENT)
}

fn arena_pool_size(size: usize) -> Option<usize> {
    pool_size(ArenaPlacement::required_total(size)?)
}

#[allow(clippy::too_many_arguments)]
fn try_alloc_pool_base<V: VirtualMemory>(
    pools: &MmapMemPool<V>,
    space: &mut ObjectMemorySpace,
    free_bytes: usize,
    size: usize,
    space_type: SpaceType,
    allocator_type: AllocatorType,
    allocator_addr: Option<NonNull<u8>>,
    policy: OsPagesAllocPolicy,
) -> Pool {
    let size = match pool_size(size) {
        Some(size) => size,
        None => {
            debug!("Refused a pool of {} bytes", size);
            return NULLPOOL;
        }
    };
    match space.will_alloc(size, free_bytes) {
        Some(increase) => {
            let pool = pools.alloc_pool_with_policy(
                size,
                space_type,
                allocator_type,
                allocator_addr,
                policy,
            );
            if !pool.is_null() {
                space.increase_by(increase);
            }
            pool
        }
        None => {
            debug!(
                "Refused a pool of {} bytes, {} free of {}",
                size, free_bytes, space.current_size
            );
            space.save_pool_size(size);
            NULLPOOL
        }
    }
}

fn try_alloc_arena_base<V: VirtualMemory>(
    pools: &MmapMemPool<V>,
    space: &mut ObjectMemorySpace,
    free_bytes: usize,
    size: usize,
    space_type: SpaceType,
    allocator_type: AllocatorType,
    allocator_addr: Option<NonNull<u8>>,
) -> Option<NonNull<Arena>> {
    let total = match arena_pool_size(size) {
        Some(total) => total,
        None => {
            debug!("Refused an arena of {} bytes", size);
            return None;
        }
    };
    match space.will_alloc(total, free_bytes) {
        Some(increase) => {
            let arena = pools.alloc_arena(size, space_type, allocator_type, allocator_addr)?;
            space.increase_by(increase);
            Some(arena)
        }
        None => {
            debug!("Refused an arena of {} bytes, {} free", total, free_bytes);
            space.save_pool_size(total);
            None
        }
    }
}

/// A single object heap.
pub struct HeapSpace<'p, V: VirtualMemory> {
    pools: &'p MmapMemPool<V>,
    space: RwLock<ObjectMemorySpace>,
}

impl<'p, V: VirtualMemory> HeapSpace<'p, V> {
    pub fn initialize(
        pools: &'p MmapMemPool<V>,
        config: &HeapConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.max_size > pools.total_object_size() {
            return Err(ConfigError::TooLarge {
                what: "max heap size",
                size: config.max_size,
                max: pools.total_object_size(),
            });
        }
        Ok(HeapSpace {
            pools,
            space: RwLock::new(ObjectMemorySpace::new(
                config.initial_size,
                config.max_size,
                config.min_free_percentage,
                config.max_free_percentage,
            )),
        })
    }

    /// A copy of the sizing state.
    pub fn object_memory_space(&self) -> ObjectMemorySpace {
        self.space.read().clone()
    }

    pub fn current_size(&self) -> usize {
        self.space.read().current_size
    }

    pub fn max_size(&self) -> usize {
        self.space.read().max_size
    }

    pub fn current_free_bytes(&self) -> usize {
        let space = self.space.read();
        current_free_bytes(self.pools, &space, 0)
    }

    /// Take a pool if it fits the current size, or if a collection is running
    /// and the space can grow enough. Returns `NULLPOOL` otherwise.
    pub fn try_alloc_pool(
        &self,
        size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        allocator_addr: Option<NonNull<u8>>,
    ) -> Pool {
        let mut space = self.space.write();
        let free_bytes = current_free_bytes(self.pools, &space, 0);
        try_alloc_pool_base(
            self.pools,
            &mut space,
            free_bytes,
            size,
            space_type,
            allocator_type,
            allocator_addr,
            OsPagesAllocPolicy::NoPolicy,
        )
    }

    pub fn try_alloc_arena(
        &self,
        size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        allocator_addr: Option<NonNull<u8>>,
    ) -> Option<NonNull<Arena>> {
        let mut space = self.space.write();
        let free_bytes = current_free_bytes(self.pools, &space, 0);
        try_alloc_arena_base(
            self.pools,
            &mut space,
            free_bytes,
            size,
            space_type,
            allocator_type,
            allocator_addr,
        )
    }

    /// # Safety
    ///
    /// The pool must come from this heap and not be used afterwards.
    pub unsafe fn free_pool(&self, mem: *mut u8, size: usize, policy: OsPagesPolicy) {
        let _space = self.space.write();
        self.pools.free_pool_with_policy(mem, size, policy);
    }

    /// # Safety
    ///
    /// The arena must come from this heap and not be used afterwards.
    pub unsafe fn free_arena(&self, arena: NonNull<Arena>) {
        let _space = self.space.write();
        self.pools.free_arena(arena);
    }

    pub fn set_is_work_gc(&self, value: bool) {
        self.space.write().set_is_work_gc(value);
    }

    /// Resize the heap at the end of a collection and mark it finished.
    pub fn compute_new_size(&self) {
        let mut space = self.space.write();
        let pools = self.pools;
        space.resize_after_gc(|space| current_free_bytes(pools, space, 0));
        debug!("Heap resized to {} bytes", space.current_size);
    }

    /// Stop the heap from growing past its current size, and give free pages
    /// back to the OS.
    pub fn clamp_current_max_heap_size(&self) {
        let mut space = self.space.write();
        let current = space.current_size;
        space.clamp_new_max_size(current);
        let released = self.pools.release_free_pages_to_os();
        debug!("Heap maximum clamped to {}, released {} bytes", current, released);
    }
}

#[derive(Clone, Debug)]
struct GenerationalState {
    young: ObjectMemorySpace,
    tenured: ObjectMemorySpace,
    young_size_in_separate_pools: usize,
    young_size_in_shared_pools: usize,
    tenured_size_in_separate_pools: usize,
    tenured_size_in_shared_pools: usize,
    shared_pools_size: usize,
}

impl GenerationalState {
    fn free_young_size(&self) -> usize {
        let occupied = self.young_size_in_separate_pools + self.young_size_in_shared_pools;
        debug_assert!(self.young.current_size >= occupied);
        self.young.current_size.saturating_sub(occupied)
    }

    // Bytes of used object pools that do not belong to the tenured space.
    fn bytes_not_in_tenured(&self) -> usize {
        debug_assert!(self.shared_pools_size >= self.tenured_size_in_shared_pools);
        self.young_size_in_separate_pools + self.shared_pools_size
            - self.tenured_size_in_shared_pools
    }

    fn check_shared(&self) {
        debug_assert!(
            self.young_size_in_shared_pools + self.tenured_size_in_shared_pools
                <= self.shared_pools_size,
            "Shared pools over-occupied: {:?}",
            self
        );
    }
}

/// A young and a tenured space over one object space.
pub struct GenerationalSpaces<'p, V: VirtualMemory> {
    pools: &'p MmapMemPool<V>,
    state: RwLock<GenerationalState>,
}

impl<'p, V: VirtualMemory> GenerationalSpaces<'p, V> {
    /// Split the heap of `config` into young and tenured.
    ///
    /// If only the maximum young size is set, the young space starts at it.
    /// If the initial young size exceeds the maximum, the maximum is raised.
    /// The tenured space gets whatever the young space leaves.
    pub fn initialize(
        pools: &'p MmapMemPool<V>,
        config: &GenerationalConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let heap = &config.heap;
        if heap.max_size > pools.total_object_size() {
            return Err(ConfigError::TooLarge {
                what: "max heap size",
                size: heap.max_size,
                max: pools.total_object_size(),
            });
        }

        let (initial_young, max_young) = match (config.initial_young_size, config.max_young_size) {
            (None, Some(max)) => (max, max),
            (initial, max) => {
                let initial = initial.unwrap_or(DEFAULT_YOUNG_SPACE_SIZE);
                let max = max.unwrap_or(DEFAULT_YOUNG_SPACE_SIZE);
                if initial > max {
                    if config.initial_young_size.is_some() && config.max_young_size.is_some() {
                        warn!(
                            "Initial young size {} is larger than the maximum young size {}, \
                             raising the maximum to {}",
                            initial, max, initial
                        );
                    }
                    (initial, initial)
                } else {
                    (initial, max)
                }
            }
        };
        if initial_young > heap.initial_size || max_young > heap.max_size {
            return Err(ConfigError::InvertedBounds {
                lower: "young space size",
                upper: "heap size",
            });
        }

        let young = ObjectMemorySpace::new(
            initial_young,
            max_young,
            heap.min_free_percentage,
            heap.max_free_percentage,
        );
        let tenured = ObjectMemorySpace::new(
            heap.initial_size - initial_young,
            heap.max_size - max_young,
            heap.min_free_percentage,
            heap.max_free_percentage,
        );
        debug!("Young space {:?}, tenured space {:?}", young, tenured);

        Ok(GenerationalSpaces {
            pools,
            state: RwLock::new(GenerationalState {
                young,
                tenured,
                young_size_in_separate_pools: 0,
                young_size_in_shared_pools: 0,
                tenured_size_in_separate_pools: 0,
                tenured_size_in_shared_pools: 0,
                shared_pools_size: 0,
            }),
        })
    }

    fn free_tenured_size(&self, state: &GenerationalState) -> usize {
        current_free_bytes(self.pools, &state.tenured, state.bytes_not_in_tenured())
    }

    pub fn young_space(&self) -> ObjectMemorySpace {
        self.state.read().young.clone()
    }

    pub fn tenured_space(&self) -> ObjectMemorySpace {
        self.state.read().tenured.clone()
    }

    pub fn current_free_young_size(&self) -> usize {
        self.state.read().free_young_size()
    }

    pub fn current_free_tenured_size(&self) -> usize {
        let state = self.state.read();
        self.free_tenured_size(&state)
    }

    /// Would a chunk of `size` bytes be allowed in the given generation?
    pub fn can_alloc_in_space(&self, is_young: bool, size: usize) -> bool {
        let state = self.state.read();
        if is_young {
            state.young.will_alloc(size, state.free_young_size()).is_some()
        } else {
            state.tenured.will_alloc(size, self.free_tenured_size(&state)).is_some()
        }
    }

    /// One pool spanning the whole maximum young size, for collectors with a
    /// contiguous young space.
    pub fn alloc_alone_pool_for_young(
        &self,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        allocator_addr: Option<NonNull<u8>>,
    ) -> Pool {
        let mut state = self.state.write();
        let size = align_down(state.young.max_size, POOL_ALIGNMENT);
        if size == 0 {
            debug!("Young space of {} bytes is too small for a pool", state.young.max_size);
            return NULLPOOL;
        }
        let pool = self.pools.alloc_pool(size, space_type, allocator_type, allocator_addr);
        if pool.is_null() {
            return NULLPOOL;
        }
        state.young_size_in_separate_pools += pool.size();
        // The pool spans the young space; its current size must cover it.
        let occupied = state.young_size_in_separate_pools + state.young_size_in_shared_pools;
        let shortfall = occupied.saturating_sub(state.young.current_size);
        state.young.increase_by(shortfall);
        pool
    }

    pub fn try_alloc_pool_for_young(
        &self,
        size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        allocator_addr: Option<NonNull<u8>>,
    ) -> Pool {
        let mut state = self.state.write();
        let free_bytes = state.free_young_size();
        let pool = try_alloc_pool_base(
            self.pools,
            &mut state.young,
            free_bytes,
            size,
            space_type,
            allocator_type,
            allocator_addr,
            OsPagesAllocPolicy::NoPolicy,
        );
        state.young_size_in_separate_pools += pool.size();
        pool
    }

    pub fn try_alloc_pool_for_tenured(
        &self,
        size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        allocator_addr: Option<NonNull<u8>>,
        policy: OsPagesAllocPolicy,
    ) -> Pool {
        let mut state = self.state.write();
        let free_bytes = self.free_tenured_size(&state);
        let pool = try_alloc_pool_base(
            self.pools,
            &mut state.tenured,
            free_bytes,
            size,
            space_type,
            allocator_type,
            allocator_addr,
            policy,
        );
        state.tenured_size_in_separate_pools += pool.size();
        pool
    }

    /// Pools taken without a generation go to the tenured space.
    pub fn try_alloc_pool(
        &self,
        size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        allocator_addr: Option<NonNull<u8>>,
    ) -> Pool {
        self.try_alloc_pool_for_tenured(
            size,
            space_type,
            allocator_type,
            allocator_addr,
            OsPagesAllocPolicy::NoPolicy,
        )
    }

    pub fn try_alloc_arena_for_tenured(
        &self,
        size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        allocator_addr: Option<NonNull<u8>>,
    ) -> Option<NonNull<Arena>> {
        let mut state = self.state.write();
        let free_bytes = self.free_tenured_size(&state);
        let arena = try_alloc_arena_base(
            self.pools,
            &mut state.tenured,
            free_bytes,
            size,
            space_type,
            allocator_type,
            allocator_addr,
        )?;
        state.tenured_size_in_separate_pools += unsafe { arena.as_ref() }.total_size();
        Some(arena)
    }

    /// # Safety
    ///
    /// The arena must come from `try_alloc_arena_for_tenured` and not be used
    /// afterwards.
    pub unsafe fn free_tenured_arena(&self, arena: NonNull<Arena>) {
        let mut state = self.state.write();
        let size = arena.as_ref().total_size();
        assert!(state.tenured_size_in_separate_pools >= size);
        state.tenured_size_in_separate_pools -= size;
        self.pools.free_arena(arena);
    }

    /// A pool backing objects of both generations. It is not charged to
    /// either until its chunks are occupied.
    pub fn alloc_shared_pool(
        &self,
        size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        allocator_addr: Option<NonNull<u8>>,
    ) -> Pool {
        let mut state = self.state.write();
        let pool = self
            .pools
            .alloc_pool(size, space_type, allocator_type, allocator_addr);
        state.shared_pools_size += pool.size();
        pool
    }

    /// # Safety
    ///
    /// The pool must come from `alloc_shared_pool` and not be used
    /// afterwards.
    pub unsafe fn free_shared_pool(&self, mem: *mut u8, size: usize) {
        let mut state = self.state.write();
        assert!(state.shared_pools_size >= size);
        state.shared_pools_size -= size;
        state.check_shared();
        self.pools.free_pool(mem, size);
    }

    /// # Safety
    ///
    /// The pool must be a young pool of this heap and not be used afterwards.
    pub unsafe fn free_young_pool(&self, mem: *mut u8, size: usize, policy: OsPagesPolicy) {
        let mut state = self.state.write();
        assert!(state.young_size_in_separate_pools >= size);
        state.young_size_in_separate_pools -= size;
        self.pools.free_pool_with_policy(mem, size, policy);
    }

    /// # Safety
    ///
    /// The pool must be a tenured pool of this heap and not be used
    /// afterwards.
    pub unsafe fn free_tenured_pool(&self, mem: *mut u8, size: usize, policy: OsPagesPolicy) {
        let mut state = self.state.write();
        assert!(state.tenured_size_in_separate_pools >= size);
        state.tenured_size_in_separate_pools -= size;
        self.pools.free_pool_with_policy(mem, size, policy);
    }

    /// Move a young pool to the tenured space, growing it if needed.
    pub fn promote_young_pool(&self, size: usize) {
        let mut state = self.state.write();
        assert!(state.young_size_in_separate_pools >= size);
        // Counted as young until the move, so it is not free in tenured yet.
        let free_bytes = self.free_tenured_size(&state);
        let increase = match state.tenured.will_alloc(size, free_bytes) {
            Some(increase) => increase,
            None => panic!(
                "Promoting a pool of {} bytes does not fit the tenured space ({} free)",
                size, free_bytes
            ),
        };
        state.young_size_in_separate_pools -= size;
        state.tenured.increase_by(increase);
        state.tenured_size_in_separate_pools += size;
    }

    /// Charge a chunk of a shared pool to the young space, growing it first
    /// if the chunk does not fit.
    pub fn increase_young_occupied_in_shared_pool(&self, size: usize) {
        let mut state = self.state.write();
        let free_bytes = state.free_young_size();
        state.young.increase_by(size.saturating_sub(free_bytes));
        state.young_size_in_shared_pools += size;
        state.check_shared();
    }

    pub fn increase_tenured_occupied_in_shared_pool(&self, size: usize) {
        let mut state = self.state.write();
        let free_bytes = self.free_tenured_size(&state);
        state.tenured.increase_by(size.saturating_sub(free_bytes));
        state.tenured_size_in_shared_pools += size;
        state.check_shared();
    }

    pub fn reduce_young_occupied_in_shared_pool(&self, size: usize) {
        let mut state = self.state.write();
        assert!(state.young_size_in_shared_pools >= size);
        state.young_size_in_shared_pools -= size;
    }

    pub fn reduce_tenured_occupied_in_shared_pool(&self, size: usize) {
        let mut state = self.state.write();
        assert!(state.tenured_size_in_shared_pools >= size);
        state.tenured_size_in_shared_pools -= size;
    }

    /// Set the young size directly. It never shrinks below what the young
    /// space occupies.
    pub fn update_young_size(&self, desired_size: usize) {
        let mut state = self.state.write();
        let current = state.young.current_size;
        if desired_size < current {
            let occupied = state.young_size_in_separate_pools + state.young_size_in_shared_pools;
            let target = cmp::max(desired_size, occupied);
            state.young.reduce_by(current - cmp::min(target, current));
        } else {
            state.young.increase_by(desired_size - current);
        }
    }

    pub fn set_is_work_gc(&self, value: bool) {
        let mut state = self.state.write();
        state.young.set_is_work_gc(value);
        state.tenured.set_is_work_gc(value);
    }

    /// Resize both generations at the end of a collection.
    pub fn compute_new_size(&self) {
        let mut state = self.state.write();

        let young_occupied = state.young_size_in_separate_pools + state.young_size_in_shared_pools;
        state
            .young
            .resize_after_gc(|young| young.current_size.saturating_sub(young_occupied));

        let pools = self.pools;
        let not_in_tenured = state.bytes_not_in_tenured();
        state
            .tenured
            .resize_after_gc(|tenured| current_free_bytes(pools, tenured, not_in_tenured));

        debug!(
            "Young resized to {}, tenured to {}",
            state.young.current_size, state.tenured.current_size
        );
    }
}
