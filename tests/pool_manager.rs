use std::sync::{Mutex, MutexGuard};

use heap_pools::config::MemConfig;
use heap_pools::pool::{AllocatorType, SpaceType, MB};
use heap_pools::{MemPool, PoolManager, PoolType};

use test_env_log::test;

// The registry is process-wide; tests touching it take turns.
static REGISTRY: Mutex<()> = Mutex::new(());

fn exclusive() -> MutexGuard<'static, ()> {
    let guard = REGISTRY.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if PoolManager::is_initialized() {
        PoolManager::finalize();
    }
    guard
}

fn small_config() -> MemConfig {
    MemConfig::new().with_object_pool_size(32 * MB)
}

#[test]
fn test_mmap_lifecycle() {
    let _guard = exclusive();
    assert!(!PoolManager::is_initialized());
    PoolManager::initialize_with_config(PoolType::Mmap, &small_config()).unwrap();
    assert_eq!(PoolManager::pool_type(), Some(PoolType::Mmap));

    let pools = PoolManager::get_mmap_mem_pool();
    let pool = pools.alloc_pool(4 * MB, SpaceType::Object, AllocatorType::Bump, None);
    assert!(!pool.is_null());
    assert_eq!(pools.space_type_for_addr(pool.mem()), SpaceType::Object);
    assert_eq!(pools.object_used_bytes(), 4 * MB);
    unsafe { pools.free_pool(pool.mem(), pool.size()) };
    drop(pools);

    PoolManager::finalize();
    assert!(!PoolManager::is_initialized());
    assert_eq!(PoolManager::pool_type(), None);
}

#[test]
fn test_arenas_follow_the_backend() {
    let _guard = exclusive();
    for &pool_type in &[PoolType::Malloc, PoolType::Mmap] {
        PoolManager::initialize_with_config(pool_type, &small_config()).unwrap();
        let mut arena_ptr =
            PoolManager::alloc_arena(64 * 1024, SpaceType::Internal, AllocatorType::Arena, None)
                .unwrap();
        let arena = unsafe { arena_ptr.as_mut() };
        let chunk = arena.alloc(1024).unwrap();
        unsafe { core::ptr::write_bytes(chunk.as_ptr(), 7, 1024) };
        unsafe { PoolManager::free_arena(arena_ptr) };
        PoolManager::finalize();
    }
}

#[test]
fn test_bad_config_leaves_registry_empty() {
    let _guard = exclusive();
    let config = MemConfig::new().with_object_pool_size(MB + 1);
    assert!(PoolManager::initialize_with_config(PoolType::Mmap, &config).is_err());
    assert!(!PoolManager::is_initialized());
}

#[test]
#[should_panic(expected = "already initialized")]
fn test_double_initialize_is_fatal() {
    let _guard = exclusive();
    PoolManager::initialize(PoolType::Malloc).unwrap();
    let _ = PoolManager::initialize(PoolType::Malloc);
}

#[test]
#[should_panic(expected = "not Mmap")]
fn test_wrong_backend_is_fatal() {
    let _guard = exclusive();
    PoolManager::initialize(PoolType::Malloc).unwrap();
    PoolManager::get_mmap_mem_pool();
}
