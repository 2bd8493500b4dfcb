#![no_std]

//! Memory pools for a managed runtime.
//!
//! This crate hands out large, aligned extents of raw memory ("pools") to the
//! allocators of a runtime, and keeps track of who owns them.
//!
//! ## [`MmapMemPool`](mmap_mem_pool/struct.MmapMemPool.html)
//!
//! The main backend. It reserves an object space up front, carves pools from
//! it, caches freed pools for best-fit reuse, and can tell for any address
//! inside a pool which allocator owns it. Pools of the other spaces (code,
//! compiler, internal, frames, native stacks) are separate mappings.
//!
//! ## [`MallocMemPool`](malloc_mem_pool/struct.MallocMemPool.html)
//!
//! A fallback on top of the global allocator, with no caching and no
//! classification.
//!
//! ## [`HeapSpace`] and [`GenerationalSpaces`]
//!
//! Size accounting layered over `MmapMemPool`: they decide whether the heap
//! may take another pool, and resize the heap when a collection ends.
//!
//! ## [`PoolManager`](pool_manager/struct.PoolManager.html)
//!
//! The process-wide registry holding whichever backend was chosen.
//!
//! ## Running out of memory
//!
//! Exhaustion is never an error: it is reported as
//! [`NULLPOOL`](pool/constant.NULLPOOL.html) or `None`, and the caller decides
//! whether to collect and retry. Misuse (freeing twice, querying an
//! unregistered address, initializing twice) panics.
//!
//! [`HeapSpace`]: heap_space/struct.HeapSpace.html
//! [`GenerationalSpaces`]: heap_space/struct.GenerationalSpaces.html

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod arena;
pub mod config;
pub mod error;
pub mod free_pools;
pub mod heap_space;
pub mod malloc_mem_pool;
pub mod mem_pool;
pub mod mmap_mem_pool;
pub mod os;
pub mod pool;
pub mod pool_manager;
pub mod pool_map;

pub use arena::Arena;
pub use config::{GenerationalConfig, HeapConfig, MemConfig};
pub use error::{ConfigError, MemPoolError};
pub use free_pools::{ReleasePagesControl, ReleasePagesStatus};
pub use heap_space::{GenerationalSpaces, HeapSpace, ObjectMemorySpace};
pub use malloc_mem_pool::MallocMemPool;
pub use mem_pool::MemPool;
pub use mmap_mem_pool::MmapMemPool;
pub use os::{LibcVirtualMemory, ToyMemory, VirtualMemory};
pub use pool::{
    AllocatorInfo, AllocatorType, OsPagesAllocPolicy, OsPagesPolicy, Pool, SpaceType, NULLPOOL,
};
pub use pool_manager::{PoolBackend, PoolManager, PoolType};
