//! A pool backend on top of the global allocator.
//!
//! `MallocMemPool` keeps no state at all: pools and arenas go straight to
//! `alloc::alloc`. Without a classification index it cannot tell which
//! allocator owns an address, so those queries are fatal.

use core::alloc::Layout;
use core::mem::align_of;
use core::ptr::{self, NonNull};

use log::{error, trace};

use crate::arena::{Arena, ArenaPlacement};
use crate::mem_pool::MemPool;
use crate::pool::{
    AllocatorInfo, AllocatorType, OsPagesAllocPolicy, OsPagesPolicy, Pool, SpaceType,
    DEFAULT_ALIGNMENT, NULLPOOL,
};

#[derive(Default, Debug)]
pub struct MallocMemPool {}

impl MallocMemPool {
    pub fn new() -> Self {
        MallocMemPool {}
    }

    fn pool_layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size, DEFAULT_ALIGNMENT).ok()
    }

    fn arena_layout(total: usize) -> Option<Layout> {
        Layout::from_size_align(total, align_of::<Arena>()).ok()
    }
}

impl MemPool for MallocMemPool {
    fn alloc_pool_with_policy(
        &self,
        size: usize,
        space_type: SpaceType,
        _allocator_type: AllocatorType,
        _allocator_addr: Option<NonNull<u8>>,
        policy: OsPagesAllocPolicy,
    ) -> Pool {
        assert!(size > 0, "Allocating an empty pool");
        let layout = match Self::pool_layout(size) {
            Some(layout) => layout,
            None => return NULLPOOL,
        };
        let mem = unsafe {
            match policy {
                OsPagesAllocPolicy::ZeroedMemory => alloc::alloc::alloc_zeroed(layout),
                OsPagesAllocPolicy::NoPolicy => alloc::alloc::alloc(layout),
            }
        };
        if mem.is_null() {
            return NULLPOOL;
        }
        trace!("Allocated {:?} pool {:p}:{}", space_type, mem, size);
        Pool::new(mem, size)
    }

    unsafe fn free_pool_with_policy(&self, mem: *mut u8, size: usize, _policy: OsPagesPolicy) {
        match Self::pool_layout(size) {
            Some(layout) => alloc::alloc::dealloc(mem, layout),
            None => panic!("Freeing pool {:p} with an impossible size {}", mem, size),
        }
    }

    fn alloc_arena(
        &self,
        size: usize,
        _space_type: SpaceType,
        _allocator_type: AllocatorType,
        _allocator_addr: Option<NonNull<u8>>,
    ) -> Option<NonNull<Arena>> {
        let total = ArenaPlacement::required_total(size)?;
        let layout = Self::arena_layout(total)?;
        let raw = NonNull::new(unsafe { alloc::alloc::alloc(layout) })?;
        let arena = unsafe { Arena::place(raw.as_ptr() as usize, total) };
        if arena.is_none() {
            unsafe { alloc::alloc::dealloc(raw.as_ptr(), layout) };
        }
        arena
    }

    unsafe fn free_arena(&self, arena: NonNull<Arena>) {
        let (addr, total) = {
            let arena = arena.as_ref();
            (arena.header_addr(), arena.total_size())
        };
        ptr::drop_in_place(arena.as_ptr());
        match Self::arena_layout(total) {
            Some(layout) => alloc::alloc::dealloc(addr as *mut u8, layout),
            None => panic!("Freeing arena {:#x} with an impossible size {}", addr, total),
        }
    }

    fn allocator_info_for_addr(&self, addr: *const u8) -> AllocatorInfo {
        error!("MallocMemPool can't classify {:p}", addr);
        panic!("allocator_info_for_addr is not implemented for MallocMemPool");
    }

    fn space_type_for_addr(&self, addr: *const u8) -> SpaceType {
        error!("MallocMemPool can't classify {:p}", addr);
        panic!("space_type_for_addr is not implemented for MallocMemPool");
    }

    fn start_addr_pool_for_addr(&self, addr: *const u8) -> *mut u8 {
        error!("MallocMemPool can't classify {:p}", addr);
        panic!("start_addr_pool_for_addr is not implemented for MallocMemPool");
    }
}
