//! Pools and the small vocabulary types shared by every backend.
//!
//! A [`Pool`](struct.Pool.html) is a contiguous, aligned extent of raw memory
//! handed to a higher-level allocator. The "no memory" signal is the
//! [`NULLPOOL`](constant.NULLPOOL.html) sentinel, never an error.

use core::fmt;
use core::ptr::null_mut;

use static_assertions::const_assert;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;
pub const GB: usize = 1024 * MB;

/// Every object-space pool starts and ends on this boundary. It is also the
/// resolution of the address classification index.
pub const POOL_ALIGNMENT: usize = 256 * KB;

/// Granule of the [`PoolMap`](../pool_map/struct.PoolMap.html).
pub const POOL_MAP_GRANULARITY: usize = POOL_ALIGNMENT;

/// Alignment of arena buffers and of heap-space size adjustments.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Free pools are returned to the OS in steps of this many bytes, so an
/// interruptible sweep never blocks for longer than one step.
pub const RELEASE_MEM_SIZE: usize = 8 * MB;

const_assert!(POOL_ALIGNMENT.is_power_of_two());
const_assert!(DEFAULT_ALIGNMENT.is_power_of_two());
const_assert!(POOL_MAP_GRANULARITY == POOL_ALIGNMENT);
const_assert!(RELEASE_MEM_SIZE % POOL_ALIGNMENT == 0);

// Round up value to the nearest multiple of increment
pub fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

/// Align `value` up to `align`, which must be a power of two.
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Like [`align_up`](fn.align_up.html), but `None` if the result does not
/// fit in a `usize`.
#[inline]
pub fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// Align `value` down to `align`, which must be a power of two.
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[inline]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// A contiguous extent of memory: base address and size in bytes.
///
/// Equality is structural. The all-zero pool is [`NULLPOOL`](constant.NULLPOOL.html).
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Pool {
    size: usize,
    mem: *mut u8,
}

// A Pool is a plain (address, size) pair; ownership of the memory behind it is
// tracked by the pool manager, not by the value.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

/// Returned whenever a pool request cannot be satisfied.
pub const NULLPOOL: Pool = Pool {
    size: 0,
    mem: null_mut(),
};

impl Pool {
    pub const fn new(mem: *mut u8, size: usize) -> Pool {
        Pool { size, mem }
    }

    pub(crate) fn from_addr(addr: usize, size: usize) -> Pool {
        Pool {
            size,
            mem: addr as *mut u8,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mem(&self) -> *mut u8 {
        self.mem
    }

    pub fn addr(&self) -> usize {
        self.mem as usize
    }

    /// One past the last byte of the pool.
    pub fn end(&self) -> usize {
        self.addr() + self.size
    }

    pub fn is_null(&self) -> bool {
        self.mem.is_null()
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr() && addr < self.end()
    }
}

impl Default for Pool {
    fn default() -> Self {
        NULLPOOL
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pool({:p}, {})", self.mem, self.size)
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pool({:p}..{:#x}, {} bytes)", self.mem, self.end(), self.size)
    }
}

/// The logical space a pool belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SpaceType {
    /// No pool is registered (or the address is not managed memory at all).
    Undefined,
    Object,
    HumongousObject,
    NonMovableObject,
    Internal,
    Code,
    Compiler,
    Frames,
    NativeStacks,
}

impl Default for SpaceType {
    fn default() -> Self {
        SpaceType::Undefined
    }
}

/// Number of spaces that live outside the object space.
pub const NON_OBJECT_SPACES: usize = 5;

impl SpaceType {
    /// Object, humongous and non-movable pools are all carved from the
    /// contiguous object space.
    pub fn is_object_space(self) -> bool {
        matches!(
            self,
            SpaceType::Object | SpaceType::HumongousObject | SpaceType::NonMovableObject
        )
    }

    /// Slot of a non-object space in per-space tables.
    pub(crate) fn non_object_index(self) -> Option<usize> {
        match self {
            SpaceType::Internal => Some(0),
            SpaceType::Code => Some(1),
            SpaceType::Compiler => Some(2),
            SpaceType::Frames => Some(3),
            SpaceType::NativeStacks => Some(4),
            _ => None,
        }
    }
}

/// The kind of allocator that owns a pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AllocatorType {
    Undefined,
    RunSlots,
    FreeList,
    Humongous,
    Arena,
    Tlab,
    Bump,
    Region,
    Frame,
    NativeStacks,
}

impl Default for AllocatorType {
    fn default() -> Self {
        AllocatorType::Undefined
    }
}

/// What to do with the physical pages of a pool when it is freed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OsPagesPolicy {
    /// Keep the pages resident for fast reuse; content stays stale.
    NoReturn,
    /// Release the pages to the OS right away; they read as zero afterwards.
    ImmediateReturn,
}

/// What the caller of an allocation expects of the pool's content.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OsPagesAllocPolicy {
    NoPolicy,
    /// The returned pool must read as all zeroes.
    ZeroedMemory,
}

/// Which allocator owns the memory at some address.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocatorInfo {
    allocator_type: AllocatorType,
    allocator_addr: usize,
}

impl AllocatorInfo {
    pub const fn new(allocator_type: AllocatorType, allocator_addr: usize) -> Self {
        AllocatorInfo {
            allocator_type,
            allocator_addr,
        }
    }

    pub fn allocator_type(&self) -> AllocatorType {
        self.allocator_type
    }

    /// Address of the allocator header registered with the pool.
    pub fn allocator_header_addr(&self) -> *const u8 {
        self.allocator_addr as *const u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(1, POOL_ALIGNMENT), POOL_ALIGNMENT);
        assert_eq!(align_up(POOL_ALIGNMENT, POOL_ALIGNMENT), POOL_ALIGNMENT);
        assert_eq!(align_down(POOL_ALIGNMENT + 1, POOL_ALIGNMENT), POOL_ALIGNMENT);
        assert!(is_aligned(3 * POOL_ALIGNMENT, POOL_ALIGNMENT));
        assert!(!is_aligned(3 * POOL_ALIGNMENT + 8, POOL_ALIGNMENT));
        assert_eq!(round_up(0, 64), 0);
        assert_eq!(round_up(65, 64), 128);
    }

    #[test]
    fn test_pool_equality_is_structural() {
        let a = Pool::from_addr(0x4000_0000, 4 * MB);
        let b = Pool::new(0x4000_0000 as *mut u8, 4 * MB);
        assert_eq!(a, b);
        assert_ne!(a, Pool::from_addr(0x4000_0000, 2 * MB));
        assert!(NULLPOOL.is_null());
        assert_eq!(Pool::default(), NULLPOOL);
        assert!(a.contains(a.addr()));
        assert!(a.contains(a.end() - 1));
        assert!(!a.contains(a.end()));
    }

    #[test]
    fn test_space_routing() {
        assert!(SpaceType::HumongousObject.is_object_space());
        assert!(!SpaceType::Code.is_object_space());
        assert_eq!(SpaceType::Object.non_object_index(), None);
        assert_eq!(SpaceType::NativeStacks.non_object_index(), Some(4));
    }
}
