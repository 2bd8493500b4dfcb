use core::ptr::NonNull;

use heap_pools::config::MemConfig;
use heap_pools::mmap_mem_pool::MmapMemPool;
use heap_pools::os::ToyMemory;
use heap_pools::pool::{
    AllocatorType, OsPagesAllocPolicy, OsPagesPolicy, Pool, SpaceType, MB, NULLPOOL,
    POOL_ALIGNMENT,
};
use heap_pools::MemPool;

use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use test_env_log::test;

const OBJECT_SPACE: usize = 64 * MB;
const INTERNAL_SPACE: usize = 16 * MB;

// A live pool and the fake allocator header it was registered with.
#[derive(Copy, Clone)]
struct Slot {
    pool: Pool,
    space_type: SpaceType,
    header: usize,
}

fn validate(pools: &MmapMemPool<ToyMemory>, slots: &[Option<Slot>]) {
    let (validity, stats) = pools.stats();
    log::info!("Validity: {:?}, Stats: {:?}", validity, stats);
    assert!(validity.is_valid());

    // Conservation: used plus cached bytes are exactly what was carved.
    assert_eq!(
        stats.used_bytes + stats.free_bytes,
        pools.object_space_current_size()
    );
    assert!(pools.object_space_current_size() <= OBJECT_SPACE);
    let live_object_bytes: usize = slots
        .iter()
        .flatten()
        .filter(|slot| slot.space_type.is_object_space())
        .map(|slot| slot.pool.size())
        .sum();
    assert_eq!(live_object_bytes, pools.object_used_bytes());
    let live_internal_bytes: usize = slots
        .iter()
        .flatten()
        .filter(|slot| slot.space_type == SpaceType::Internal)
        .map(|slot| slot.pool.size())
        .sum();
    assert_eq!(
        live_internal_bytes,
        pools.space_memory(SpaceType::Internal).occupied
    );

    // Classification answers for every live pool, at its edges.
    for slot in slots.iter().flatten() {
        for &addr in &[slot.pool.addr(), slot.pool.end() - 1] {
            let info = pools.allocator_info_for_addr(addr as *const u8);
            assert_eq!(info.allocator_header_addr() as usize, slot.header);
            assert_eq!(pools.space_type_for_addr(addr as *const u8), slot.space_type);
            assert_eq!(
                pools.start_addr_pool_for_addr(addr as *const u8),
                slot.pool.mem()
            );
        }
    }
}

// Stamp the first and last byte of a pool with its header tag.
fn stamp(slot: &Slot) {
    let tag = slot.header as u8;
    unsafe {
        *slot.pool.mem() = tag;
        *(slot.pool.end() as *mut u8).sub(1) = tag;
    }
}

fn check_stamp(slot: &Slot) {
    let tag = slot.header as u8;
    unsafe {
        assert_eq!(*slot.pool.mem(), tag, "Pool {} was overwritten", slot.pool);
        assert_eq!(*(slot.pool.end() as *const u8).sub(1), tag);
    }
}

// Stamps only ever land next to granule boundaries; check those bytes.
fn stamp_sites_zeroed(pool: Pool) -> bool {
    (0..pool.size()).step_by(POOL_ALIGNMENT).all(|offset| unsafe {
        *pool.mem().add(offset) == 0 && *pool.mem().add(offset + POOL_ALIGNMENT - 1) == 0
    })
}

#[test]
fn test_stress() {
    let config = MemConfig::new()
        .with_object_pool_size(OBJECT_SPACE)
        .with_space_size(SpaceType::Internal, INTERNAL_SPACE);
    let pools = MmapMemPool::new(ToyMemory::new(512 * MB), &config).unwrap();
    let mut slots: [Option<Slot>; 64] = [None; 64];

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut refused = 0;
    for step in 0..4096 {
        let index = rng.gen_range(0, slots.len());
        match slots[index] {
            None => {
                let space_type = *[
                    SpaceType::Object,
                    SpaceType::Object,
                    SpaceType::HumongousObject,
                    SpaceType::NonMovableObject,
                    SpaceType::Internal,
                ]
                .choose(&mut rng)
                .unwrap();
                // Internal pools are fresh mappings every time; keep them small.
                let granules = if space_type == SpaceType::Internal {
                    rng.gen_range(1, 3)
                } else {
                    rng.gen_range(1, 9) * rng.gen_range(1, 5)
                };
                let size = granules * POOL_ALIGNMENT;
                let zeroed = rng.gen_bool(0.5);
                let policy = if zeroed {
                    OsPagesAllocPolicy::ZeroedMemory
                } else {
                    OsPagesAllocPolicy::NoPolicy
                };
                // Distinct, non-null, and its low byte doubles as a stamp.
                let header = (index + 1) * 0x1000 + index + 1;
                let pool = pools.alloc_pool_with_policy(
                    size,
                    space_type,
                    AllocatorType::RunSlots,
                    NonNull::new(header as *mut u8),
                    policy,
                );
                log::info!("Allocating {} in {:?}: {}", size, space_type, pool);
                if pool == NULLPOOL {
                    refused += 1;
                    continue;
                }
                assert_eq!(pool.size(), size);
                if zeroed {
                    assert!(stamp_sites_zeroed(pool), "Pool {} is not zeroed", pool);
                }
                let slot = Slot {
                    pool,
                    space_type,
                    header,
                };
                stamp(&slot);
                slots[index] = Some(slot);
            }
            Some(slot) => {
                check_stamp(&slot);
                let policy = if rng.gen_bool(0.5) {
                    OsPagesPolicy::NoReturn
                } else {
                    OsPagesPolicy::ImmediateReturn
                };
                log::info!("Freeing {} ({:?})", slot.pool, policy);
                unsafe { pools.free_pool_with_policy(slot.pool.mem(), slot.pool.size(), policy) };
                slots[index] = None;
            }
        }

        if step % 64 == 0 && rng.gen_bool(0.5) {
            pools.release_free_pages_to_os();
        }
        validate(&pools, &slots);
    }
    log::info!("{} requests refused", refused);

    for slot in slots.iter_mut() {
        if let Some(live) = slot.take() {
            check_stamp(&live);
            unsafe { pools.free_pool(live.pool.mem(), live.pool.size()) };
        }
    }
    validate(&pools, &slots);
    assert_eq!(pools.object_space_current_size(), 0);
}
