//! The pool space manager.
//!
//! `MmapMemPool` reserves one contiguous object space up front and carves
//! pools from it: freed pools go to a [`FreePoolCache`] and are reused
//! best-fit, otherwise pools are cut from the untouched tail of the space.
//! Every object pool is registered in a [`PoolMap`] covering the object
//! space.
//!
//! Pools of the other spaces (internal, code, compiler, frames, native
//! stacks) are separate mappings. They are not cached; freeing one unmaps it.
//!
//! All state sits behind a single lock. Public methods take it once and work
//! on the unlocked inner state, so nothing ever needs to re-enter it.
//!
//! [`FreePoolCache`]: ../free_pools/struct.FreePoolCache.html
//! [`PoolMap`]: ../pool_map/struct.PoolMap.html

use alloc::collections::BTreeMap;
use core::cmp;
use core::ptr::{self, NonNull};

use log::{debug, info, trace};
use spin::Mutex;

use crate::arena::{Arena, ArenaPlacement};
use crate::config::MemConfig;
use crate::error::MemPoolError;
use crate::free_pools::{
    FreePoolCache, ReleasePagesControl, ReleasePagesStatus, Stats, Validity,
};
use crate::mem_pool::MemPool;
use crate::os::{VirtualMemory, VirtualMemoryStats};
use crate::pool::{
    align_up, checked_align_up, AllocatorInfo, AllocatorType, OsPagesAllocPolicy, OsPagesPolicy,
    Pool, SpaceType, NON_OBJECT_SPACES, NULLPOOL, POOL_ALIGNMENT, RELEASE_MEM_SIZE,
};
use crate::pool_map::PoolMap;

/// Non-object spaces, in the order of `SpaceType::non_object_index`.
const NON_OBJECT_SPACE_TYPES: [SpaceType; NON_OBJECT_SPACES] = [
    SpaceType::Internal,
    SpaceType::Code,
    SpaceType::Compiler,
    SpaceType::Frames,
    SpaceType::NativeStacks,
];

/// Ceiling and occupancy of a non-object space.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SpaceMemory {
    pub max_size: usize,
    pub occupied: usize,
}

impl SpaceMemory {
    pub fn free_space(&self) -> usize {
        self.max_size - self.occupied
    }
}

struct ObjectSpace {
    min_address: usize,
    max_size: usize,
    /// Bytes carved from the front of the space; the untouched tail starts
    /// right after them.
    occupied: usize,
    /// Length of the prefix of the space that may hold stale content. Only
    /// the part beyond `occupied` matters: carved pools track their own
    /// state in the cache.
    unreturned_to_os_size: usize,
}

impl ObjectSpace {
    fn tail(&self) -> usize {
        self.min_address + self.occupied
    }

    fn free_tail(&self) -> usize {
        self.max_size - self.occupied
    }

    fn dirty_end(&self) -> usize {
        self.min_address + self.unreturned_to_os_size
    }
}

#[derive(Copy, Clone, Debug)]
struct NonObjectPool {
    size: usize,
    space_type: SpaceType,
    allocator_type: AllocatorType,
    allocator_addr: usize,
}

struct Inner<V> {
    vm: V,
    object: ObjectSpace,
    object_pools: FreePoolCache,
    pool_map: PoolMap,
    spaces: [SpaceMemory; NON_OBJECT_SPACES],
    non_object_pools: BTreeMap<usize, NonObjectPool>,
}

pub struct MmapMemPool<V: VirtualMemory> {
    inner: Mutex<Inner<V>>,
}

// Fill `[start, end)` with zeroes.
unsafe fn zero_range(start: usize, end: usize) {
    if start < end {
        ptr::write_bytes(start as *mut u8, 0, end - start);
    }
}

impl<V: VirtualMemory> Inner<V> {
    ////////////////////////////////////////////////////////////
    // Object space

    fn alloc_object_pool(&mut self, size: usize, policy: OsPagesAllocPolicy) -> Option<Pool> {
        let zeroed = policy == OsPagesAllocPolicy::ZeroedMemory;

        if let Some(reused) = self.object_pools.pop_best_fit(size) {
            if zeroed && !reused.returned_to_os {
                unsafe { zero_range(reused.pool.addr(), reused.pool.end()) };
            }
            return Some(reused.pool);
        }

        let tail = self.object.tail();
        let free_tail = self.object.free_tail();
        let addr = if size <= free_tail {
            tail
        } else {
            // The highest free pool may touch the tail; together they might
            // be enough.
            let reused = match self.object_pools.pop_tail_adjacent(tail, size - free_tail) {
                Some(reused) => reused,
                None => {
                    debug!(
                        "Object space exhausted: {} bytes requested, {} in the tail",
                        size, free_tail
                    );
                    return None;
                }
            };
            if zeroed && !reused.returned_to_os {
                unsafe { zero_range(reused.pool.addr(), reused.pool.end()) };
            }
            trace!("Extending free pool {} into the tail", reused.pool);
            reused.pool.addr()
        };

        let end = addr + size;
        if zeroed {
            // Fresh tail pages only hold stale data below the dirty mark.
            let dirty_end = cmp::min(self.object.dirty_end(), end);
            unsafe { zero_range(tail, dirty_end) };
        }
        self.object.occupied = end - self.object.min_address;
        self.object_pools.add_new_pool(addr, size);
        debug!("Carved object pool {:#x}:{} from the tail", addr, size);
        Some(Pool::from_addr(addr, size))
    }

    unsafe fn free_object_pool(&mut self, addr: usize, size: usize, policy: OsPagesPolicy) {
        self.pool_map.unregister(addr, size);
        if policy == OsPagesPolicy::ImmediateReturn {
            self.vm.release_pages(addr, addr + size);
        }
        if let Some((free_bytes, policy)) = self.object_pools.push_free(addr, size, policy) {
            self.collapse_object_space(free_bytes, policy);
        }
    }

    // No used pool is left: forget the cached pools and start carving from
    // the start of the space again.
    fn collapse_object_space(&mut self, free_bytes: usize, policy: OsPagesPolicy) {
        let min = self.object.min_address;
        let stale_end = self.object_pools.reset().unwrap_or(min);
        let dirty_end = cmp::max(stale_end, self.object.dirty_end());
        match policy {
            OsPagesPolicy::ImmediateReturn => {
                unsafe { self.vm.release_pages(min, dirty_end) };
                self.object.unreturned_to_os_size = 0;
            }
            OsPagesPolicy::NoReturn => {
                self.object.unreturned_to_os_size = dirty_end - min;
            }
        }
        self.object.occupied = 0;
        debug!(
            "Object space emptied ({} free bytes), {} bytes left unreturned",
            free_bytes, self.object.unreturned_to_os_size
        );
    }

    // Release the dirty part of the untouched tail, in steps from its end.
    fn release_dirty_tail(&mut self, control: Option<&ReleasePagesControl>) -> ReleasePagesStatus {
        let tail = self.object.tail();
        while self.object.dirty_end() > tail {
            if control.map_or(false, ReleasePagesControl::should_interrupt) {
                return ReleasePagesStatus::WasInterrupted;
            }
            let end = self.object.dirty_end();
            let start = cmp::max(tail, end.saturating_sub(RELEASE_MEM_SIZE));
            unsafe { self.vm.release_pages(start, end) };
            self.object.unreturned_to_os_size = start - self.object.min_address;
        }
        self.object.unreturned_to_os_size =
            cmp::min(self.object.unreturned_to_os_size, self.object.occupied);
        ReleasePagesStatus::Finished
    }

    ////////////////////////////////////////////////////////////
    // Non-object spaces

    fn space(&self, space_type: SpaceType) -> &SpaceMemory {
        match space_type.non_object_index() {
            Some(index) => &self.spaces[index],
            None => panic!("{:?} is not a non-object space", space_type),
        }
    }

    fn space_mut(&mut self, space_type: SpaceType) -> &mut SpaceMemory {
        match space_type.non_object_index() {
            Some(index) => &mut self.spaces[index],
            None => panic!("{:?} is not a non-object space", space_type),
        }
    }

    fn alloc_non_object_pool(&mut self, size: usize, space_type: SpaceType) -> Option<Pool> {
        let space = self.space(space_type);
        if size > space.free_space() {
            debug!(
                "{:?} space exhausted: {} bytes requested, {} left",
                space_type,
                size,
                space.free_space()
            );
            return None;
        }
        let mem = match unsafe { self.vm.map_aligned(size, POOL_ALIGNMENT) } {
            Ok(mem) => mem,
            Err(err) => {
                debug!("Mapping {} bytes for the {:?} space failed: {:?}", size, space_type, err);
                return None;
            }
        };
        self.space_mut(space_type).occupied += size;
        debug!("Mapped {:?} pool {:p}:{}", space_type, mem, size);
        Some(Pool::new(mem.as_ptr(), size))
    }

    unsafe fn free_non_object_pool(&mut self, addr: usize, size: usize) {
        let pool = match self.non_object_pools.remove(&addr) {
            Some(pool) => pool,
            None => panic!("Freeing untracked pool {:#x}", addr),
        };
        assert_eq!(pool.size, size, "Freeing pool {:#x} with the wrong size", addr);
        self.vm.unmap(NonNull::new_unchecked(addr as *mut u8), size);
        self.space_mut(pool.space_type).occupied -= size;
        debug!("Unmapped {:?} pool {:#x}:{}", pool.space_type, addr, size);
    }

    // The non-object pool containing `addr`, if any.
    fn non_object_pool(&self, addr: usize) -> Option<(usize, &NonObjectPool)> {
        let (&base, pool) = self.non_object_pools.range(..=addr).next_back()?;
        if addr < base + pool.size {
            Some((base, pool))
        } else {
            None
        }
    }

    ////////////////////////////////////////////////////////////
    // Shared entry points

    fn alloc_pool(
        &mut self,
        size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        allocator_addr: Option<NonNull<u8>>,
        policy: OsPagesAllocPolicy,
    ) -> Pool {
        assert!(size > 0, "Allocating an empty pool");
        let size = match checked_align_up(size, POOL_ALIGNMENT) {
            Some(size) => size,
            None => {
                debug!("Refused a {:?} pool of {} bytes", space_type, size);
                return NULLPOOL;
            }
        };
        let pool = if space_type.is_object_space() {
            self.alloc_object_pool(size, policy)
        } else {
            self.alloc_non_object_pool(size, space_type)
        };
        let pool = match pool {
            Some(pool) => pool,
            None => return NULLPOOL,
        };

        let allocator_addr = allocator_addr.map_or(pool.addr(), |p| p.as_ptr() as usize);
        if space_type.is_object_space() {
            self.pool_map
                .register(pool.addr(), size, space_type, allocator_type, allocator_addr);
        } else {
            self.non_object_pools.insert(
                pool.addr(),
                NonObjectPool {
                    size,
                    space_type,
                    allocator_type,
                    allocator_addr,
                },
            );
        }
        pool
    }

    unsafe fn free_pool(&mut self, mem: *mut u8, size: usize, policy: OsPagesPolicy) {
        let addr = mem as usize;
        let size = align_up(size, POOL_ALIGNMENT);
        if self.pool_map.in_coverage(addr) {
            self.free_object_pool(addr, size, policy);
        } else {
            self.free_non_object_pool(addr, size);
        }
    }
}

impl<V: VirtualMemory> MmapMemPool<V> {
    /// Reserve the object space and set the ceilings of every space.
    pub fn new(mut vm: V, config: &MemConfig) -> Result<Self, MemPoolError<V::Err>> {
        config.validate()?;
        let object_size = config.object_pool_size;
        let base = unsafe { vm.map_aligned(object_size, POOL_ALIGNMENT) }.map_err(|source| {
            MemPoolError::Reserve {
                space: SpaceType::Object,
                size: object_size,
                source,
            }
        })?;
        let min_address = base.as_ptr() as usize;
        info!(
            "Reserved object space {:#x}..{:#x}",
            min_address,
            min_address + object_size
        );

        let mut spaces = [SpaceMemory::default(); NON_OBJECT_SPACES];
        for (space, &space_type) in spaces.iter_mut().zip(NON_OBJECT_SPACE_TYPES.iter()) {
            space.max_size = config.space_size(space_type);
        }

        Ok(MmapMemPool {
            inner: Mutex::new(Inner {
                vm,
                object: ObjectSpace {
                    min_address,
                    max_size: object_size,
                    occupied: 0,
                    unreturned_to_os_size: 0,
                },
                object_pools: FreePoolCache::new(),
                pool_map: PoolMap::new(min_address, object_size),
                spaces,
                non_object_pools: BTreeMap::new(),
            }),
        })
    }

    /// Could `pools_needed` pools of `pool_size` bytes be reused from the
    /// free-pool cache? The untouched tail is not counted.
    pub fn have_enough_pools_in_object_space(&self, pools_needed: usize, pool_size: usize) -> bool {
        let inner = self.inner.lock();
        inner
            .object_pools
            .have_enough_free_pools(pools_needed, align_up(pool_size, POOL_ALIGNMENT))
    }

    /// Bytes held by object pools currently handed out.
    pub fn object_used_bytes(&self) -> usize {
        let inner = self.inner.lock();
        inner.object.occupied - inner.object_pools.free_bytes()
    }

    /// Bytes of the object space not held by a used pool: cached pools plus
    /// the untouched tail.
    pub fn object_space_free_bytes(&self) -> usize {
        let inner = self.inner.lock();
        inner.object.free_tail() + inner.object_pools.free_bytes()
    }

    /// Bytes carved from the object space so far, used or cached.
    pub fn object_space_current_size(&self) -> usize {
        self.inner.lock().object.occupied
    }

    pub fn total_object_size(&self) -> usize {
        self.inner.lock().object.max_size
    }

    pub fn min_object_address(&self) -> usize {
        self.inner.lock().object.min_address
    }

    /// One past the last byte of the object space.
    pub fn max_object_address(&self) -> usize {
        let inner = self.inner.lock();
        inner.object.min_address + inner.object.max_size
    }

    pub fn is_in_object_space(&self, addr: *const u8) -> bool {
        self.inner.lock().pool_map.in_coverage(addr as usize)
    }

    /// Ceiling and occupancy of a non-object space.
    pub fn space_memory(&self, space_type: SpaceType) -> SpaceMemory {
        *self.inner.lock().space(space_type)
    }

    /// Give the pages of every free object pool, and of the stale part of the
    /// untouched tail, back to the OS. Returns the bytes released from pools.
    pub fn release_free_pages_to_os(&self) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let released = inner.object_pools.release_pages_in_free_pools(&mut inner.vm);
        inner.release_dirty_tail(None);
        released
    }

    /// Like `release_free_pages_to_os`, but stops between release steps when
    /// `control` is asked to interrupt. The next call resumes the sweep.
    pub fn release_free_pages_to_os_interruptible(
        &self,
        control: &ReleasePagesControl,
    ) -> ReleasePagesStatus {
        control.begin();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut status = inner
            .object_pools
            .release_pages_in_free_pools_interruptible(&mut inner.vm, control);
        if status == ReleasePagesStatus::Finished {
            status = inner.release_dirty_tail(Some(control));
        }
        if status == ReleasePagesStatus::Finished {
            control.finish();
        }
        status
    }

    /// Self check of the free-pool cache.
    pub fn stats(&self) -> (Validity, Stats) {
        self.inner.lock().object_pools.stats()
    }

    pub fn vm_stats(&self) -> VirtualMemoryStats {
        self.inner.lock().vm.stats()
    }
}

impl<V: VirtualMemory> MemPool for MmapMemPool<V> {
    fn alloc_pool_with_policy(
        &self,
        size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        allocator_addr: Option<NonNull<u8>>,
        policy: OsPagesAllocPolicy,
    ) -> Pool {
        self.inner
            .lock()
            .alloc_pool(size, space_type, allocator_type, allocator_addr, policy)
    }

    unsafe fn free_pool_with_policy(&self, mem: *mut u8, size: usize, policy: OsPagesPolicy) {
        self.inner.lock().free_pool(mem, size, policy)
    }

    fn alloc_arena(
        &self,
        size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        allocator_addr: Option<NonNull<u8>>,
    ) -> Option<NonNull<Arena>> {
        let total = ArenaPlacement::required_total(size)?;
        let mut inner = self.inner.lock();
        let pool = inner.alloc_pool(
            total,
            space_type,
            allocator_type,
            allocator_addr,
            OsPagesAllocPolicy::NoPolicy,
        );
        if pool.is_null() {
            return None;
        }
        let arena = unsafe { Arena::place(pool.addr(), pool.size()) };
        debug_assert!(arena.is_some(), "Pool {} too small for an arena", pool);
        arena
    }

    unsafe fn free_arena(&self, arena: NonNull<Arena>) {
        let (addr, size) = {
            let arena = arena.as_ref();
            (arena.header_addr(), arena.total_size())
        };
        ptr::drop_in_place(arena.as_ptr());
        self.inner
            .lock()
            .free_pool(addr as *mut u8, size, OsPagesPolicy::ImmediateReturn);
    }

    fn allocator_info_for_addr(&self, addr: *const u8) -> AllocatorInfo {
        let inner = self.inner.lock();
        let addr = addr as usize;
        if inner.pool_map.in_coverage(addr) {
            return inner.pool_map.allocator_info(addr);
        }
        match inner.non_object_pool(addr) {
            Some((_, pool)) => AllocatorInfo::new(pool.allocator_type, pool.allocator_addr),
            None => panic!("No pool registered at {:#x}", addr),
        }
    }

    fn space_type_for_addr(&self, addr: *const u8) -> SpaceType {
        let inner = self.inner.lock();
        let addr = addr as usize;
        if inner.pool_map.in_coverage(addr) {
            return inner.pool_map.space_type(addr);
        }
        inner
            .non_object_pool(addr)
            .map_or(SpaceType::Undefined, |(_, pool)| pool.space_type)
    }

    fn start_addr_pool_for_addr(&self, addr: *const u8) -> *mut u8 {
        let inner = self.inner.lock();
        let addr = addr as usize;
        if inner.pool_map.in_coverage(addr) {
            return inner.pool_map.first_byte_of_pool(addr) as *mut u8;
        }
        match inner.non_object_pool(addr) {
            Some((base, _)) => base as *mut u8,
            None => panic!("No pool registered at {:#x}", addr),
        }
    }
}

impl<V: VirtualMemory> Drop for MmapMemPool<V> {
    fn drop(&mut self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let used = inner.object_pools.used_count() + inner.non_object_pools.len();
        if used > 0 {
            debug!("Dropping pool manager with {} pools still in use", used);
        }
        let pools: alloc::vec::Vec<(usize, usize)> = inner
            .non_object_pools
            .iter()
            .map(|(&addr, pool)| (addr, pool.size))
            .collect();
        unsafe {
            for (addr, size) in pools {
                inner.vm.unmap(NonNull::new_unchecked(addr as *mut u8), size);
            }
            inner.vm.unmap(
                NonNull::new_unchecked(inner.object.min_address as *mut u8),
                inner.object.max_size,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    use crate::os::ToyMemory;
    use crate::pool::{KB, MB};

    fn toy_pool(object_size: usize) -> MmapMemPool<ToyMemory> {
        let config = MemConfig::new()
            .with_object_pool_size(object_size)
            .with_space_size(SpaceType::Code, MB)
            .with_space_size(SpaceType::Internal, 4 * MB);
        MmapMemPool::new(ToyMemory::new(object_size + 16 * MB), &config).unwrap()
    }

    fn alloc_object(pools: &MmapMemPool<ToyMemory>, size: usize) -> Pool {
        pools.alloc_pool(size, SpaceType::Object, AllocatorType::RunSlots, None)
    }

    fn fill(pool: Pool, byte: u8) {
        unsafe { ptr::write_bytes(pool.mem(), byte, pool.size()) };
    }

    fn is_zeroed(pool: Pool) -> bool {
        let bytes = unsafe { core::slice::from_raw_parts(pool.mem(), pool.size()) };
        bytes.iter().all(|&b| b == 0)
    }

    fn assert_conserved(pools: &MmapMemPool<ToyMemory>) {
        let (validity, stats) = pools.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.used_bytes, pools.object_used_bytes());
        assert_eq!(
            stats.used_bytes + stats.free_bytes,
            pools.object_space_current_size()
        );
        assert!(pools.object_space_current_size() <= pools.total_object_size());
    }

    #[test]
    fn test_have_enough_counts_cached_pools() {
        let pools = toy_pool(16 * MB);
        let a = alloc_object(&pools, 4 * MB);
        let b = alloc_object(&pools, 4 * MB);
        let c = alloc_object(&pools, 4 * MB);
        assert!(!c.is_null());
        unsafe {
            pools.free_pool(a.mem(), a.size());
            pools.free_pool(b.mem(), b.size());
        }
        assert_eq!(pools.object_used_bytes(), 4 * MB);
        assert_eq!(pools.object_space_free_bytes(), 12 * MB);
        assert!(pools.have_enough_pools_in_object_space(2, 4 * MB));
        assert!(!pools.have_enough_pools_in_object_space(3, 4 * MB));
        assert_conserved(&pools);
    }

    #[test]
    fn test_reuse_freed_pool_plus_tail() {
        let pools = toy_pool(10 * MB);
        let first = alloc_object(&pools, 7 * MB);
        unsafe { pools.free_pool(first.mem(), first.size()) };
        let second = alloc_object(&pools, 8 * MB);
        assert_eq!(second.size(), 8 * MB);
        assert_eq!(second.addr(), first.addr());
        assert_conserved(&pools);
    }

    #[test]
    fn test_extend_last_free_pool_into_tail() {
        let pools = toy_pool(16 * MB);
        let pinned = alloc_object(&pools, 2 * MB);
        let freed = alloc_object(&pools, 7 * MB);
        unsafe {
            pools.free_pool_with_policy(freed.mem(), freed.size(), OsPagesPolicy::NoReturn)
        };
        // 7 MB cached + 7 MB of tail; neither is enough alone.
        let grown = alloc_object(&pools, 8 * MB);
        assert_eq!(grown, Pool::from_addr(freed.addr(), 8 * MB));
        assert_eq!(pools.object_space_current_size(), 10 * MB);
        assert!(!pinned.is_null());
        assert!(alloc_object(&pools, 7 * MB).is_null());
        assert_conserved(&pools);
    }

    #[test]
    fn test_zeroed_memory_after_any_release_policy() {
        let pools = toy_pool(16 * MB);
        let policies = [OsPagesPolicy::NoReturn, OsPagesPolicy::ImmediateReturn];
        for round in 0..12 {
            // Keep a pool alive on odd rounds so the space does not always
            // collapse.
            let pinned = if round % 2 == 1 {
                Some(alloc_object(&pools, MB))
            } else {
                None
            };
            let pool = pools.alloc_pool_with_policy(
                4 * MB,
                SpaceType::Object,
                AllocatorType::Bump,
                None,
                OsPagesAllocPolicy::ZeroedMemory,
            );
            assert!(!pool.is_null());
            assert!(is_zeroed(pool), "round {}", round);
            fill(pool, 0xAB);
            let policy = policies[(round / 2) % 2];
            unsafe { pools.free_pool_with_policy(pool.mem(), pool.size(), policy) };
            if let Some(pinned) = pinned {
                // The cached pool is reused while the pinned one is alive.
                let reused = pools.alloc_pool_with_policy(
                    4 * MB,
                    SpaceType::Object,
                    AllocatorType::Bump,
                    None,
                    OsPagesAllocPolicy::ZeroedMemory,
                );
                assert_eq!(reused, pool);
                assert!(is_zeroed(reused), "round {}", round);
                fill(reused, 0xAB);
                unsafe { pools.free_pool_with_policy(reused.mem(), reused.size(), policy) };
                fill(pinned, 0xCD);
                unsafe { pools.free_pool_with_policy(pinned.mem(), pinned.size(), policy) };
            }
            assert_conserved(&pools);
        }
        let whole = pools.alloc_pool_with_policy(
            16 * MB,
            SpaceType::Object,
            AllocatorType::Humongous,
            None,
            OsPagesAllocPolicy::ZeroedMemory,
        );
        assert!(is_zeroed(whole));
    }

    #[test]
    fn test_classification_of_object_pools() {
        let pools = toy_pool(16 * MB);
        let header = 0x1234_5670 as *mut u8;
        let pool = pools.alloc_pool(
            MB,
            SpaceType::HumongousObject,
            AllocatorType::Humongous,
            NonNull::new(header),
        );
        let inside = (pool.addr() + MB / 2) as *const u8;
        let info = pools.allocator_info_for_addr(inside);
        assert_eq!(info.allocator_type(), AllocatorType::Humongous);
        assert_eq!(info.allocator_header_addr(), header as *const u8);
        assert_eq!(pools.space_type_for_addr(inside), SpaceType::HumongousObject);
        assert_eq!(pools.start_addr_pool_for_addr(inside), pool.mem());
        assert!(pools.is_in_object_space(inside));

        unsafe { pools.free_pool(pool.mem(), pool.size()) };
        assert_eq!(pools.space_type_for_addr(inside), SpaceType::Undefined);
        assert_eq!(pools.space_type_for_addr(core::ptr::null()), SpaceType::Undefined);
    }

    #[test]
    fn test_non_object_space_ceiling() {
        let pools = toy_pool(4 * MB);
        let a = pools.alloc_pool(512 * KB, SpaceType::Code, AllocatorType::Frame, None);
        assert!(!a.is_null());
        assert!(!pools.is_in_object_space(a.mem()));
        assert_eq!(pools.space_type_for_addr(a.mem()), SpaceType::Code);
        let info = pools.allocator_info_for_addr(unsafe { a.mem().add(100) });
        assert_eq!(info.allocator_header_addr(), a.mem() as *const u8);
        assert_eq!(pools.start_addr_pool_for_addr(unsafe { a.mem().add(100) }), a.mem());

        let b = pools.alloc_pool(768 * KB, SpaceType::Code, AllocatorType::Frame, None);
        assert!(b.is_null());
        assert_eq!(pools.space_memory(SpaceType::Code).occupied, 512 * KB);

        unsafe { pools.free_pool(a.mem(), a.size()) };
        assert_eq!(pools.space_memory(SpaceType::Code).occupied, 0);
        let b = pools.alloc_pool(768 * KB, SpaceType::Code, AllocatorType::Frame, None);
        assert_eq!(b.size(), 768 * KB);
        unsafe { pools.free_pool(b.mem(), b.size()) };
    }

    #[test]
    fn test_impossible_sizes_are_refused() {
        let pools = toy_pool(4 * MB);
        let spaces = [SpaceType::Object, SpaceType::HumongousObject, SpaceType::Internal];
        for &space_type in &spaces {
            for &size in &[usize::MAX, usize::MAX - 10, usize::MAX - POOL_ALIGNMENT + 2] {
                let pool = pools.alloc_pool(size, space_type, AllocatorType::Humongous, None);
                assert_eq!(pool, NULLPOOL);
                let arena = pools.alloc_arena(size, space_type, AllocatorType::Arena, None);
                assert!(arena.is_none());
            }
        }
        assert_eq!(pools.object_space_current_size(), 0);
        assert_eq!(pools.space_memory(SpaceType::Internal).occupied, 0);
        assert_conserved(&pools);
    }

    #[test]
    fn test_arena_lifecycle() {
        let pools = toy_pool(4 * MB);
        let mut arena_ptr = pools
            .alloc_arena(100 * KB, SpaceType::Internal, AllocatorType::Arena, None)
            .unwrap();
        let arena = unsafe { arena_ptr.as_mut() };
        assert!(arena.size() >= 100 * KB);
        let obj = arena.alloc(64).unwrap();
        let info = pools.allocator_info_for_addr(obj.as_ptr());
        assert_eq!(info.allocator_type(), AllocatorType::Arena);
        assert_eq!(info.allocator_header_addr() as usize, arena.header_addr());
        assert_eq!(pools.space_memory(SpaceType::Internal).occupied, arena.total_size());

        unsafe { pools.free_arena(arena_ptr) };
        assert_eq!(pools.space_memory(SpaceType::Internal).occupied, 0);

        let object_arena = pools
            .alloc_arena(MB, SpaceType::Object, AllocatorType::Arena, None)
            .unwrap();
        assert!(pools.is_in_object_space(object_arena.as_ptr() as *const u8));
        unsafe { pools.free_arena(object_arena) };
        assert_eq!(pools.object_used_bytes(), 0);
    }

    #[test]
    fn test_release_free_pages() {
        let pools = toy_pool(32 * MB);
        let pinned = alloc_object(&pools, MB);
        let big = alloc_object(&pools, 20 * MB);
        fill(big, 0xEE);
        unsafe { pools.free_pool_with_policy(big.mem(), big.size(), OsPagesPolicy::NoReturn) };
        let before = pools.vm_stats().released_bytes;

        let control = ReleasePagesControl::new();
        control.request_interrupt();
        let status = pools.release_free_pages_to_os_interruptible(&control);
        assert_eq!(status, ReleasePagesStatus::WasInterrupted);
        assert_eq!(pools.vm_stats().released_bytes, before);

        let status = pools.release_free_pages_to_os_interruptible(&control);
        assert_eq!(status, ReleasePagesStatus::Finished);
        assert_eq!(control.status(), ReleasePagesStatus::Finished);
        assert_eq!(pools.vm_stats().released_bytes - before, 20 * MB);
        assert!(is_zeroed(big));
        assert_eq!(pools.release_free_pages_to_os(), 0);
        unsafe { pools.free_pool(pinned.mem(), pinned.size()) };
    }

    #[test]
    fn test_release_covers_small_free_pools() {
        let pools = toy_pool(16 * MB);
        let front = alloc_object(&pools, MB);
        let small = alloc_object(&pools, 2 * MB);
        let back = alloc_object(&pools, MB);
        assert!(small.size() < RELEASE_MEM_SIZE);
        fill(small, 0x5A);
        unsafe { pools.free_pool_with_policy(small.mem(), small.size(), OsPagesPolicy::NoReturn) };
        let before = pools.vm_stats().released_bytes;

        pools.release_free_pages_to_os();
        assert_eq!(pools.vm_stats().released_bytes - before, 2 * MB);
        assert!(is_zeroed(small));
        unsafe {
            pools.free_pool(front.mem(), front.size());
            pools.free_pool(back.mem(), back.size());
        }
        assert_conserved(&pools);
    }

    #[test]
    fn test_release_dirty_tail_after_collapse() {
        let pools = toy_pool(16 * MB);
        let pool = alloc_object(&pools, 12 * MB);
        fill(pool, 0x11);
        unsafe { pools.free_pool_with_policy(pool.mem(), pool.size(), OsPagesPolicy::NoReturn) };
        assert_eq!(pools.object_space_current_size(), 0);
        let before = pools.vm_stats().released_bytes;
        assert_eq!(pools.release_free_pages_to_os(), 0);
        assert_eq!(pools.vm_stats().released_bytes - before, 12 * MB);
        assert!(is_zeroed(pool));
    }

    #[test]
    #[should_panic(expected = "Double free")]
    fn test_double_free_is_fatal() {
        let pools = toy_pool(4 * MB);
        let a = alloc_object(&pools, MB);
        let _b = alloc_object(&pools, MB);
        unsafe {
            pools.free_pool(a.mem(), a.size());
            pools.free_pool(a.mem(), a.size());
        }
    }
}
