//! The process-wide pool backend.
//!
//! Exactly one backend is live between `PoolManager::initialize` and
//! `PoolManager::finalize`. Code that can be handed a backend explicitly
//! should be; the registry exists for the collector and compiler, which need
//! ambient access.

use alloc::sync::Arc;
use core::ptr::NonNull;

use errno::Errno;
use log::info;
use spin::RwLock;

use crate::arena::Arena;
use crate::config::MemConfig;
use crate::error::MemPoolError;
use crate::malloc_mem_pool::MallocMemPool;
use crate::mem_pool::MemPool;
use crate::mmap_mem_pool::MmapMemPool;
use crate::os::LibcVirtualMemory;
use crate::pool::{AllocatorType, SpaceType};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PoolType {
    Malloc,
    Mmap,
}

/// The backend chosen at initialization.
#[derive(Clone)]
pub enum PoolBackend {
    Malloc(Arc<MallocMemPool>),
    Mmap(Arc<MmapMemPool<LibcVirtualMemory>>),
}

impl PoolBackend {
    pub fn pool_type(&self) -> PoolType {
        match self {
            PoolBackend::Malloc(_) => PoolType::Malloc,
            PoolBackend::Mmap(_) => PoolType::Mmap,
        }
    }
}

static POOL_BACKEND: RwLock<Option<PoolBackend>> = RwLock::new(None);

pub struct PoolManager;

impl PoolManager {
    /// Create the backend with the default configuration.
    pub fn initialize(pool_type: PoolType) -> Result<(), MemPoolError<Errno>> {
        Self::initialize_with_config(pool_type, &MemConfig::default())
    }

    /// Create the backend. Initializing twice is a bug.
    pub fn initialize_with_config(
        pool_type: PoolType,
        config: &MemConfig,
    ) -> Result<(), MemPoolError<Errno>> {
        let mut slot = POOL_BACKEND.write();
        assert!(slot.is_none(), "PoolManager is already initialized");
        let backend = match pool_type {
            PoolType::Malloc => PoolBackend::Malloc(Arc::new(MallocMemPool::new())),
            PoolType::Mmap => PoolBackend::Mmap(Arc::new(MmapMemPool::new(
                LibcVirtualMemory::new(),
                config,
            )?)),
        };
        *slot = Some(backend);
        info!("PoolManager initialized with the {:?} backend", pool_type);
        Ok(())
    }

    /// Drop the backend. Handles still held elsewhere keep it alive until
    /// they go.
    pub fn finalize() {
        let backend = POOL_BACKEND.write().take();
        assert!(backend.is_some(), "PoolManager is not initialized");
        info!("PoolManager finalized");
    }

    pub fn is_initialized() -> bool {
        POOL_BACKEND.read().is_some()
    }

    pub fn pool_type() -> Option<PoolType> {
        POOL_BACKEND.read().as_ref().map(PoolBackend::pool_type)
    }

    pub fn backend() -> PoolBackend {
        match &*POOL_BACKEND.read() {
            Some(backend) => backend.clone(),
            None => panic!("PoolManager is not initialized"),
        }
    }

    /// The mmap backend. Asking for it while another backend is live is a
    /// bug.
    pub fn get_mmap_mem_pool() -> Arc<MmapMemPool<LibcVirtualMemory>> {
        match Self::backend() {
            PoolBackend::Mmap(pools) => pools,
            other => panic!(
                "PoolManager holds the {:?} backend, not Mmap",
                other.pool_type()
            ),
        }
    }

    pub fn get_malloc_mem_pool() -> Arc<MallocMemPool> {
        match Self::backend() {
            PoolBackend::Malloc(pools) => pools,
            other => panic!(
                "PoolManager holds the {:?} backend, not Malloc",
                other.pool_type()
            ),
        }
    }

    pub fn alloc_arena(
        size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        allocator_addr: Option<NonNull<u8>>,
    ) -> Option<NonNull<Arena>> {
        match Self::backend() {
            PoolBackend::Malloc(pools) => {
                pools.alloc_arena(size, space_type, allocator_type, allocator_addr)
            }
            PoolBackend::Mmap(pools) => {
                pools.alloc_arena(size, space_type, allocator_type, allocator_addr)
            }
        }
    }

    /// # Safety
    ///
    /// The arena must come from `PoolManager::alloc_arena` under the current
    /// backend and not be used afterwards.
    pub unsafe fn free_arena(arena: NonNull<Arena>) {
        match Self::backend() {
            PoolBackend::Malloc(pools) => pools.free_arena(arena),
            PoolBackend::Mmap(pools) => pools.free_arena(arena),
        }
    }
}
