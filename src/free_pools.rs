//! The cache of freed object-space pools.
//!
//! A [`FreePoolCache`](struct.FreePoolCache.html) tracks every pool carved
//! from the object space, used or free, in address order. Free pools are also
//! indexed by size so that reuse is best-fit. Each tracked pool keeps its own
//! size-index key; a pool without one is in use.
//!
//! It maintains a few internal invariants:
//!
//! - Tracked pools never overlap.
//! - A pool is free exactly when its size-index key is present in the index,
//!   and `free_bytes` is the sum of the free pools' sizes.
//! - Freeing a pool merges it with its successor if that one is free too.
//!   Predecessors are never merged on free, so two adjacent free pools can
//!   coexist.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cmp;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use log::{debug, trace};

use crate::os::VirtualMemory;
use crate::pool::{OsPagesPolicy, Pool, RELEASE_MEM_SIZE};

type PoolId = usize;

/// A pool carved from the object space, and whether it is free.
#[derive(Debug)]
pub struct TrackedPool {
    addr: usize,
    size: usize,
    returned_to_os: bool,
    // Key of this pool in the size index; `None` while the pool is in use.
    free_key: Option<(usize, usize)>,
}

impl TrackedPool {
    pub fn pool(&self) -> Pool {
        Pool::from_addr(self.addr, self.size)
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> usize {
        self.addr + self.size
    }

    pub fn is_free(&self) -> bool {
        self.free_key.is_some()
    }

    /// Whether the backing pages have been given back to the OS, so that the
    /// whole pool reads as zero.
    pub fn returned_to_os(&self) -> bool {
        self.returned_to_os
    }
}

/// A free pool in the middle of being returned to the OS: its last
/// `released_bytes` bytes are already released.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnreturnedToOsPool {
    id: PoolId,
    released_bytes: usize,
}

/// A pool popped from the cache.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReusedPool {
    pub pool: Pool,
    /// The whole pool is known to read as zero.
    pub returned_to_os: bool,
}

/// Progress of a page-release sweep, shared with whoever may interrupt it.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReleasePagesStatus {
    ReleasingPages = 0,
    NeedInterrupt = 1,
    WasInterrupted = 2,
    Finished = 3,
}

impl From<u8> for ReleasePagesStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => ReleasePagesStatus::ReleasingPages,
            1 => ReleasePagesStatus::NeedInterrupt,
            2 => ReleasePagesStatus::WasInterrupted,
            3 => ReleasePagesStatus::Finished,
            v => panic!("Unexpected release pages status {}", v),
        }
    }
}

/// The atomic flag an interruptible sweep polls between release steps.
pub struct ReleasePagesControl {
    status: AtomicU8,
}

impl Default for ReleasePagesControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleasePagesControl {
    pub const fn new() -> Self {
        ReleasePagesControl {
            status: AtomicU8::new(ReleasePagesStatus::Finished as u8),
        }
    }

    pub fn status(&self) -> ReleasePagesStatus {
        self.status.load(Ordering::SeqCst).into()
    }

    /// Ask a running sweep to stop at its next step.
    pub fn request_interrupt(&self) {
        self.status
            .store(ReleasePagesStatus::NeedInterrupt as u8, Ordering::SeqCst);
    }

    // A request made before the sweep starts is kept.
    pub(crate) fn begin(&self) {
        let _ = self.status.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
            if cur == ReleasePagesStatus::NeedInterrupt as u8 {
                None
            } else {
                Some(ReleasePagesStatus::ReleasingPages as u8)
            }
        });
    }

    pub(crate) fn should_interrupt(&self) -> bool {
        self.status
            .compare_exchange(
                ReleasePagesStatus::NeedInterrupt as u8,
                ReleasePagesStatus::WasInterrupted as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn finish(&self) {
        self.status
            .store(ReleasePagesStatus::Finished as u8, Ordering::SeqCst);
    }
}

/// Validity contains a representation of all invalid states found in a
/// FreePoolCache.
#[derive(Default, Debug)]
pub struct Validity {
    /// Number of tracked pools overlapping their successor.
    pub overlaps: usize,
    /// Number of pools whose free state disagrees with the size index.
    pub index_mismatches: usize,
    /// Whether the free and used counters disagree with the pools.
    pub counter_mismatch: bool,
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0 && self.index_mismatches == 0 && !self.counter_mismatch
    }
}

#[derive(Default, Debug, PartialEq, Eq)]
pub struct Stats {
    pub used_pools: usize,
    pub used_bytes: usize,
    pub free_pools: usize,
    pub free_bytes: usize,
}

#[derive(Default)]
pub struct FreePoolCache {
    records: Vec<Option<TrackedPool>>,
    vacant: Vec<PoolId>,
    by_addr: BTreeMap<usize, PoolId>,
    free_by_size: BTreeMap<(usize, usize), PoolId>,
    free_bytes: usize,
    used_count: usize,
    unreturned: Option<UnreturnedToOsPool>,
}

impl FreePoolCache {
    pub fn new() -> Self {
        Self::default()
    }

    ////////////////////////////////////////////////////////////
    // Record bookkeeping

    fn record(&self, id: PoolId) -> &TrackedPool {
        self.records[id].as_ref().expect("Stale pool id")
    }

    fn record_mut(&mut self, id: PoolId) -> &mut TrackedPool {
        self.records[id].as_mut().expect("Stale pool id")
    }

    fn insert_record(&mut self, pool: TrackedPool) -> PoolId {
        let addr = pool.addr;
        let id = match self.vacant.pop() {
            Some(id) => {
                self.records[id] = Some(pool);
                id
            }
            None => {
                self.records.push(Some(pool));
                self.records.len() - 1
            }
        };
        let old = self.by_addr.insert(addr, id);
        assert!(old.is_none(), "Two pools tracked at {:#x}", addr);
        id
    }

    fn remove_record(&mut self, id: PoolId) -> TrackedPool {
        let pool = self.records[id].take().expect("Stale pool id");
        debug_assert!(pool.free_key.is_none());
        self.by_addr.remove(&pool.addr);
        self.vacant.push(id);
        if self.unreturned.map(|u| u.id) == Some(id) {
            self.unreturned = None;
        }
        pool
    }

    fn mark_free(&mut self, id: PoolId) {
        let pool = self.record_mut(id);
        debug_assert!(pool.free_key.is_none());
        let key = (pool.size, pool.addr);
        pool.free_key = Some(key);
        let size = pool.size;
        self.free_by_size.insert(key, id);
        self.free_bytes += size;
    }

    fn mark_used(&mut self, id: PoolId) {
        let pool = self.record_mut(id);
        let key = pool.free_key.take().expect("Pool is not free");
        let size = pool.size;
        self.free_by_size.remove(&key);
        self.free_bytes -= size;
    }

    ////////////////////////////////////////////////////////////
    // Queries

    /// Bytes held in free pools.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Number of pools currently handed out.
    pub fn used_count(&self) -> usize {
        self.used_count
    }

    pub fn free_count(&self) -> usize {
        self.free_by_size.len()
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// The pool tracked at exactly `addr`, if any.
    pub fn get(&self, addr: usize) -> Option<&TrackedPool> {
        self.by_addr.get(&addr).map(|&id| self.record(id))
    }

    pub fn is_free(&self, addr: usize) -> bool {
        self.get(addr).map_or(false, TrackedPool::is_free)
    }

    /// All tracked pools in address order.
    pub fn iter(&self) -> impl Iterator<Item = &TrackedPool> + '_ {
        self.by_addr.values().map(move |&id| self.record(id))
    }

    pub fn unreturned_pool(&self) -> Option<UnreturnedToOsPool> {
        self.unreturned
    }

    /// Could `pools_needed` pools of `pool_size` bytes be cut from the free
    /// pools? Nothing is allocated.
    pub fn have_enough_free_pools(&self, pools_needed: usize, pool_size: usize) -> bool {
        assert!(pool_size != 0);
        let mut pools = 0;
        for &(size, _) in self.free_by_size.keys().rev() {
            if size < pool_size {
                return false;
            }
            pools += size / pool_size;
            if pools >= pools_needed {
                return true;
            }
        }
        pools >= pools_needed
    }

    ////////////////////////////////////////////////////////////
    // Allocation and deallocation

    /// Start tracking a pool freshly carved from untouched space. It is in use.
    pub fn add_new_pool(&mut self, addr: usize, size: usize) {
        self.insert_record(TrackedPool {
            addr,
            size,
            returned_to_os: false,
            free_key: None,
        });
        self.used_count += 1;
    }

    /// Take the smallest free pool of at least `size` bytes. A larger pool is
    /// split: its head is returned and its tail stays free.
    pub fn pop_best_fit(&mut self, size: usize) -> Option<ReusedPool> {
        let (&(found_size, addr), &id) = self.free_by_size.range((size, 0)..).next()?;
        self.mark_used(id);
        self.used_count += 1;
        let returned_to_os = self.record(id).returned_to_os;

        if found_size > size {
            let tail_size = found_size - size;
            let mut tail_returned = returned_to_os;
            let mut tracker = None;
            if let Some(unreturned) = self.unreturned.filter(|u| u.id == id) {
                self.unreturned = None;
                // The released bytes sit at the end of the pool, which is
                // where the tail is.
                if unreturned.released_bytes >= tail_size {
                    tail_returned = true;
                } else {
                    tracker = Some(unreturned.released_bytes);
                }
            }

            self.record_mut(id).size = size;
            let tail = self.insert_record(TrackedPool {
                addr: addr + size,
                size: tail_size,
                returned_to_os: tail_returned,
                free_key: None,
            });
            self.mark_free(tail);
            if let Some(released_bytes) = tracker {
                self.unreturned = Some(UnreturnedToOsPool {
                    id: tail,
                    released_bytes,
                });
            }
            trace!(
                "Split free pool {:#x}:{} into {} + {}",
                addr,
                found_size,
                size,
                tail_size
            );
        } else if self.unreturned.map(|u| u.id) == Some(id) {
            // Handed out half-released; the content counts as stale.
            self.unreturned = None;
        }

        debug!("Reusing free pool {:#x}:{}", addr, size);
        Some(ReusedPool {
            pool: Pool::from_addr(addr, size),
            returned_to_os,
        })
    }

    /// Stop tracking the highest free pool if it ends exactly at `tail_start`
    /// and holds at least `min_size` bytes, so the caller can grow it into
    /// the untouched space behind it.
    pub fn pop_tail_adjacent(&mut self, tail_start: usize, min_size: usize) -> Option<ReusedPool> {
        let (_, &id) = self.by_addr.iter().next_back()?;
        let last = self.record(id);
        if !last.is_free() || last.end() != tail_start || last.size < min_size {
            return None;
        }
        self.mark_used(id);
        let pool = self.remove_record(id);
        Some(ReusedPool {
            pool: pool.pool(),
            returned_to_os: pool.returned_to_os,
        })
    }

    /// Return a used pool to the cache, merging it with its successor when
    /// that one is free.
    ///
    /// If no used pool remains afterwards, returns the free byte count and
    /// the policy, so the caller can decide what to do with the whole region.
    pub fn push_free(
        &mut self,
        addr: usize,
        size: usize,
        policy: OsPagesPolicy,
    ) -> Option<(usize, OsPagesPolicy)> {
        let id = match self.by_addr.get(&addr) {
            Some(&id) => id,
            None => panic!("Freeing untracked pool {:#x}", addr),
        };
        {
            let pool = self.record_mut(id);
            assert!(!pool.is_free(), "Double free of pool {:#x}", addr);
            assert_eq!(pool.size, size, "Freeing pool {:#x} with the wrong size", addr);
            pool.returned_to_os = policy == OsPagesPolicy::ImmediateReturn;
        }
        self.used_count -= 1;

        let end = addr + size;
        let next = self
            .by_addr
            .range(end..)
            .next()
            .map(|(&next_addr, &next_id)| (next_addr, next_id));
        if let Some((next_addr, next_id)) = next {
            if next_addr == end && self.record(next_id).is_free() {
                let tracker = self.unreturned.filter(|u| u.id == next_id);
                self.mark_used(next_id);
                let next_pool = self.remove_record(next_id);
                let pool = self.record_mut(id);
                pool.size += next_pool.size;
                pool.returned_to_os = pool.returned_to_os && next_pool.returned_to_os;
                // Released bytes of the successor are still at the tail.
                if let Some(tracker) = tracker {
                    self.unreturned = Some(UnreturnedToOsPool { id, ..tracker });
                }
                trace!("Merged freed pool {:#x} with successor {:#x}", addr, next_addr);
            }
        }
        self.mark_free(id);

        if self.used_count == 0 {
            Some((self.free_bytes, policy))
        } else {
            None
        }
    }

    /// Forget every pool. All of them must be free.
    ///
    /// Returns the end of the highest pool whose pages may still hold stale
    /// content, or `None` if every pool was returned to the OS.
    pub fn reset(&mut self) -> Option<usize> {
        assert_eq!(self.used_count, 0, "Resetting a cache with used pools");
        let dirty_end = self
            .iter()
            .filter(|p| !p.returned_to_os)
            .map(TrackedPool::end)
            .max();
        *self = FreePoolCache::default();
        dirty_end
    }

    ////////////////////////////////////////////////////////////
    // Returning pages to the OS

    /// Release the pages of every free pool still holding them. Returns the
    /// number of bytes released.
    pub fn release_pages_in_free_pools<V: VirtualMemory>(&mut self, vm: &mut V) -> usize {
        let mut released = 0;
        let ids: Vec<PoolId> = self.by_addr.values().copied().collect();
        for id in ids {
            let pool = self.record_mut(id);
            if !pool.is_free() || pool.returned_to_os {
                continue;
            }
            unsafe { vm.release_pages(pool.addr, pool.end()) };
            pool.returned_to_os = true;
            released += pool.size;
        }
        self.unreturned = None;
        debug!("Released {} bytes of free pools", released);
        released
    }

    /// Continue releasing the pool a previous sweep stopped in, one
    /// `RELEASE_MEM_SIZE` step at a time, from its end towards its start.
    pub fn release_pages_in_unreturned_pool<V: VirtualMemory>(
        &mut self,
        vm: &mut V,
        control: &ReleasePagesControl,
    ) -> ReleasePagesStatus {
        let mut tracker = match self.unreturned {
            Some(tracker) => tracker,
            None => return ReleasePagesStatus::Finished,
        };

        loop {
            let (addr, end) = {
                let pool = self.record(tracker.id);
                (pool.addr, pool.end())
            };
            let remaining = end - addr - tracker.released_bytes;
            if remaining == 0 {
                self.record_mut(tracker.id).returned_to_os = true;
                self.unreturned = None;
                return ReleasePagesStatus::Finished;
            }
            if control.should_interrupt() {
                self.unreturned = Some(tracker);
                debug!(
                    "Page release interrupted in pool {:#x} with {} bytes left",
                    addr, remaining
                );
                return ReleasePagesStatus::WasInterrupted;
            }

            let step = cmp::min(RELEASE_MEM_SIZE, remaining);
            let step_end = end - tracker.released_bytes;
            unsafe { vm.release_pages(step_end - step, step_end) };
            tracker.released_bytes += step;
            self.unreturned = Some(tracker);
        }
    }

    /// Release free pools' pages, stopping between steps if `control` asks to.
    /// An interrupted sweep resumes where it stopped on the next call.
    pub fn release_pages_in_free_pools_interruptible<V: VirtualMemory>(
        &mut self,
        vm: &mut V,
        control: &ReleasePagesControl,
    ) -> ReleasePagesStatus {
        let status = self.release_pages_in_unreturned_pool(vm, control);
        if status == ReleasePagesStatus::WasInterrupted {
            return status;
        }

        let candidates: Vec<PoolId> = self
            .by_addr
            .values()
            .copied()
            .filter(|&id| {
                let pool = self.record(id);
                pool.is_free() && !pool.returned_to_os
            })
            .collect();
        for id in candidates {
            self.unreturned = Some(UnreturnedToOsPool {
                id,
                released_bytes: 0,
            });
            if self.release_pages_in_unreturned_pool(vm, control)
                == ReleasePagesStatus::WasInterrupted
            {
                return ReleasePagesStatus::WasInterrupted;
            }
        }
        ReleasePagesStatus::Finished
    }

    ////////////////////////////////////////////////////////////
    // Self checks

    /// Check the invariants, and gather the used/free totals.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();

        let mut previous_end: Option<usize> = None;
        for (&addr, &id) in &self.by_addr {
            let pool = self.record(id);
            if pool.addr != addr {
                validity.index_mismatches += 1;
            }
            if previous_end.map_or(false, |end| end > addr) {
                validity.overlaps += 1;
            }
            previous_end = Some(pool.end());

            match pool.free_key {
                Some(key) => {
                    if key != (pool.size, pool.addr) || self.free_by_size.get(&key) != Some(&id) {
                        validity.index_mismatches += 1;
                    }
                    stats.free_pools += 1;
                    stats.free_bytes += pool.size;
                }
                None => {
                    stats.used_pools += 1;
                    stats.used_bytes += pool.size;
                }
            }
        }

        validity.counter_mismatch = stats.free_bytes != self.free_bytes
            || stats.used_pools != self.used_count
            || stats.free_pools != self.free_by_size.len();

        (validity, stats)
    }
}

impl fmt::Display for FreePoolCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreePoolCache(")?;
        let mut start = true;
        for pool in self.iter() {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            let state = match (pool.is_free(), pool.returned_to_os) {
                (false, _) => "used",
                (true, false) => "free",
                (true, true) => "free/returned",
            };
            write!(f, "{:#x}:{} {}", pool.addr, pool.size, state)?;
        }
        write!(f, ")")
    }
}
