//! The address classification index.
//!
//! `PoolMap` is a flat table with one [`PoolInfo`](struct.PoolInfo.html) per
//! `POOL_MAP_GRANULARITY` bytes of a fixed, pre-reserved address range. Given
//! any address inside a registered pool it answers in O(1): which allocator
//! owns this memory, which space it belongs to, and where the pool starts.
//!
//! Every granule of a pool records the number of the pool's first granule,
//! so finding the start of a pool never has to search.

use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

use crate::pool::{is_aligned, AllocatorInfo, AllocatorType, SpaceType, POOL_MAP_GRANULARITY};

/// The record kept for a single granule.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolInfo {
    allocator_type: AllocatorType,
    space_type: SpaceType,
    allocator_addr: usize,
    first_granule: usize,
}

impl PoolInfo {
    pub fn is_empty(&self) -> bool {
        self.space_type == SpaceType::Undefined
    }

    pub fn allocator_type(&self) -> AllocatorType {
        self.allocator_type
    }

    pub fn space_type(&self) -> SpaceType {
        self.space_type
    }
}

pub struct PoolMap {
    min_address: usize,
    granules: Vec<PoolInfo>,
}

impl PoolMap {
    /// An empty index covering `[min_address, min_address + coverage)`.
    pub fn new(min_address: usize, coverage: usize) -> Self {
        assert!(is_aligned(min_address, POOL_MAP_GRANULARITY));
        assert!(is_aligned(coverage, POOL_MAP_GRANULARITY));
        PoolMap {
            min_address,
            granules: vec![PoolInfo::default(); coverage / POOL_MAP_GRANULARITY],
        }
    }

    pub fn coverage(&self) -> Range<usize> {
        self.min_address..self.min_address + self.granules.len() * POOL_MAP_GRANULARITY
    }

    pub fn in_coverage(&self, addr: usize) -> bool {
        self.coverage().contains(&addr)
    }

    fn granule(&self, addr: usize) -> usize {
        assert!(
            self.in_coverage(addr),
            "Address {:#x} is outside of the pool map coverage {:#x?}",
            addr,
            self.coverage()
        );
        (addr - self.min_address) / POOL_MAP_GRANULARITY
    }

    fn granule_range(&self, pool_addr: usize, pool_size: usize) -> Range<usize> {
        assert!(
            is_aligned(pool_addr, POOL_MAP_GRANULARITY),
            "Pool address {:#x} is not granule aligned",
            pool_addr
        );
        assert!(
            pool_size > 0 && is_aligned(pool_size, POOL_MAP_GRANULARITY),
            "Pool size {} is not a positive multiple of the granule",
            pool_size
        );
        let first = self.granule(pool_addr);
        let last = self.granule(pool_addr + pool_size - 1);
        first..last + 1
    }

    /// Record that `[pool_addr, pool_addr + pool_size)` belongs to the given
    /// allocator.
    pub fn register(
        &mut self,
        pool_addr: usize,
        pool_size: usize,
        space_type: SpaceType,
        allocator_type: AllocatorType,
        allocator_addr: usize,
    ) {
        assert!(allocator_addr != 0, "Allocator header address must not be null");
        assert!(space_type != SpaceType::Undefined);
        let range = self.granule_range(pool_addr, pool_size);
        let info = PoolInfo {
            allocator_type,
            space_type,
            allocator_addr,
            first_granule: range.start,
        };
        for entry in &mut self.granules[range] {
            debug_assert!(entry.is_empty(), "Granule registered twice");
            *entry = info;
        }
    }

    /// Restore every granule of the pool to the empty state.
    pub fn unregister(&mut self, pool_addr: usize, pool_size: usize) {
        let range = self.granule_range(pool_addr, pool_size);
        for entry in &mut self.granules[range] {
            *entry = PoolInfo::default();
        }
    }

    fn registered(&self, addr: usize) -> &PoolInfo {
        let info = &self.granules[self.granule(addr)];
        assert!(!info.is_empty(), "No pool registered at {:#x}", addr);
        info
    }

    /// Which allocator owns `addr`. The address must be inside a live pool.
    pub fn allocator_info(&self, addr: usize) -> AllocatorInfo {
        let info = self.registered(addr);
        AllocatorInfo::new(info.allocator_type, info.allocator_addr)
    }

    /// Space of `addr`, or `Undefined` for anything not registered, including
    /// addresses outside the coverage.
    pub fn space_type(&self, addr: usize) -> SpaceType {
        if !self.in_coverage(addr) {
            return SpaceType::Undefined;
        }
        self.granules[self.granule(addr)].space_type
    }

    /// Base address of the pool containing `addr`.
    pub fn first_byte_of_pool(&self, addr: usize) -> usize {
        let info = self.registered(addr);
        self.min_address + info.first_granule * POOL_MAP_GRANULARITY
    }

    /// Full scan; only meant for teardown checks and tests.
    pub fn is_empty(&self) -> bool {
        self.granules.iter().all(PoolInfo::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    use crate::pool::MB;

    const BASE: usize = 0x4000_0000;

    fn map() -> PoolMap {
        PoolMap::new(BASE, 16 * MB)
    }

    #[test]
    fn test_round_trip_every_granule() {
        let mut map = map();
        let pool_addr = BASE + 2 * POOL_MAP_GRANULARITY;
        let pool_size = 6 * POOL_MAP_GRANULARITY;
        let header = 0xdead_b000;
        map.register(pool_addr, pool_size, SpaceType::Object, AllocatorType::RunSlots, header);

        for addr in (pool_addr..pool_addr + pool_size).step_by(POOL_MAP_GRANULARITY / 4) {
            let info = map.allocator_info(addr);
            assert_eq!(info.allocator_type(), AllocatorType::RunSlots);
            assert_eq!(info.allocator_header_addr() as usize, header);
            assert_eq!(map.space_type(addr), SpaceType::Object);
            assert_eq!(map.first_byte_of_pool(addr), pool_addr);
        }
        assert_eq!(map.first_byte_of_pool(pool_addr + pool_size - 1), pool_addr);
        assert_eq!(map.space_type(pool_addr - 1), SpaceType::Undefined);
        assert_eq!(map.space_type(pool_addr + pool_size), SpaceType::Undefined);
        assert!(!map.is_empty());

        map.unregister(pool_addr, pool_size);
        assert!(map.is_empty());
        assert_eq!(map.space_type(pool_addr), SpaceType::Undefined);
    }

    #[test]
    fn test_neighbouring_pools_keep_their_own_start() {
        let mut map = map();
        let a = BASE;
        let b = BASE + 2 * POOL_MAP_GRANULARITY;
        map.register(a, 2 * POOL_MAP_GRANULARITY, SpaceType::Object, AllocatorType::Bump, a);
        map.register(
            b,
            POOL_MAP_GRANULARITY,
            SpaceType::HumongousObject,
            AllocatorType::Humongous,
            b,
        );
        assert_eq!(map.first_byte_of_pool(b - 1), a);
        assert_eq!(map.first_byte_of_pool(b), b);
        assert_eq!(map.space_type(b), SpaceType::HumongousObject);
        assert_eq!(map.allocator_info(a + 10).allocator_type(), AllocatorType::Bump);
    }

    #[test]
    fn test_space_type_outside_coverage_is_undefined() {
        let map = map();
        assert_eq!(map.space_type(0), SpaceType::Undefined);
        assert_eq!(map.space_type(BASE - 1), SpaceType::Undefined);
        assert_eq!(map.space_type(BASE + 16 * MB), SpaceType::Undefined);
        assert_eq!(map.coverage(), BASE..BASE + 16 * MB);
    }

    #[test]
    #[should_panic(expected = "not granule aligned")]
    fn test_misaligned_register_is_fatal() {
        let mut map = map();
        map.register(BASE + 4096, POOL_MAP_GRANULARITY, SpaceType::Object, AllocatorType::Bump, 1);
    }

    #[test]
    #[should_panic(expected = "outside of the pool map coverage")]
    fn test_register_outside_coverage_is_fatal() {
        let mut map = map();
        map.register(
            BASE + 16 * MB,
            POOL_MAP_GRANULARITY,
            SpaceType::Object,
            AllocatorType::Bump,
            1,
        );
    }

    #[test]
    #[should_panic(expected = "No pool registered")]
    fn test_allocator_info_of_empty_granule_is_fatal() {
        let map = map();
        map.allocator_info(BASE);
    }
}
