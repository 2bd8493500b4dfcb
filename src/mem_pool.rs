//! The interface every pool backend offers its clients.
//!
//! Backends are picked once, when the
//! [`PoolManager`](../pool_manager/struct.PoolManager.html) is initialized, and
//! are never swapped afterwards.

use core::ptr::NonNull;

use crate::arena::Arena;
use crate::pool::{
    AllocatorInfo, AllocatorType, OsPagesAllocPolicy, OsPagesPolicy, Pool, SpaceType,
};

pub trait MemPool {
    /// Allocate a pool of `size` bytes for the given space and allocator.
    ///
    /// `allocator_addr` is the header of the allocator that will own the
    /// pool; when omitted the pool's own base address is recorded. Returns
    /// `NULLPOOL` when the space is exhausted.
    fn alloc_pool(
        &self,
        size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        allocator_addr: Option<NonNull<u8>>,
    ) -> Pool {
        self.alloc_pool_with_policy(
            size,
            space_type,
            allocator_type,
            allocator_addr,
            OsPagesAllocPolicy::NoPolicy,
        )
    }

    fn alloc_pool_with_policy(
        &self,
        size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        allocator_addr: Option<NonNull<u8>>,
        policy: OsPagesAllocPolicy,
    ) -> Pool;

    /// Free a pool, returning its pages to the OS right away.
    ///
    /// # Safety
    ///
    /// `mem` and `size` must describe a pool returned by this backend and not
    /// freed since. Nothing may touch the pool afterwards.
    unsafe fn free_pool(&self, mem: *mut u8, size: usize) {
        self.free_pool_with_policy(mem, size, OsPagesPolicy::ImmediateReturn)
    }

    /// # Safety
    ///
    /// See [`free_pool`](#method.free_pool).
    unsafe fn free_pool_with_policy(&self, mem: *mut u8, size: usize, policy: OsPagesPolicy);

    /// Allocate a pool and place an arena header at its start. Returns `None`
    /// when the space is exhausted.
    fn alloc_arena(
        &self,
        size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        allocator_addr: Option<NonNull<u8>>,
    ) -> Option<NonNull<Arena>>;

    /// # Safety
    ///
    /// `arena` must come from `alloc_arena` on this backend and not have been
    /// freed. Every allocation made from it dies with it.
    unsafe fn free_arena(&self, arena: NonNull<Arena>);

    /// Which allocator owns `addr`. The address must be inside a live pool.
    fn allocator_info_for_addr(&self, addr: *const u8) -> AllocatorInfo;

    /// Space of `addr`, `Undefined` if it is not managed memory.
    fn space_type_for_addr(&self, addr: *const u8) -> SpaceType;

    /// Base address of the pool containing `addr`.
    fn start_addr_pool_for_addr(&self, addr: *const u8) -> *mut u8;
}
