//! The virtual-memory layer underneath the pool manager.
//!
//! ## [`VirtualMemory`](trait.VirtualMemory.html)
//!
//! A small trait abstracting the calls to the OS: map an aligned, zero-filled
//! range, give a sub-range's physical pages back while keeping it mapped, and
//! unmap a range.
//!
//! ## [`LibcVirtualMemory`](struct.LibcVirtualMemory.html)
//!
//! The real implementation, through `mmap`, `madvise` and `munmap`.
//!
//! ## [`ToyMemory`](struct.ToyMemory.html)
//!
//! A fixed heap buffer pretending to be an address space. Released and
//! unmapped ranges are zero-filled, which is what the OS guarantees for
//! released anonymous pages. It is mainly useful for testing.

use core::alloc::Layout;
use core::cmp;
use core::fmt;
use core::ptr::{self, null_mut, NonNull};

use errno::Errno;
use log::{debug, trace, warn};

use crate::pool::{align_down, align_up, round_up, POOL_ALIGNMENT};

/// Counters kept by every virtual-memory backend.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VirtualMemoryStats {
    /// Live mappings.
    pub mappings: usize,
    /// Bytes currently mapped.
    pub mapped_bytes: usize,
    /// Bytes handed back to the OS through `release_pages`, cumulative.
    pub released_bytes: usize,
}

pub trait VirtualMemory {
    type Err: fmt::Debug;

    /// Map at least `size` bytes of readable, writable memory whose start is
    /// aligned to `align` (a power of two). Fresh memory reads as zero.
    ///
    /// # Safety
    ///
    /// The returned memory is untracked by any other Rust code; the caller
    /// owns it until it is passed back to `unmap`.
    unsafe fn map_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Unmap a range returned by `map_aligned`.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must describe exactly one live mapping, and nothing
    /// may touch the memory afterwards.
    unsafe fn unmap(&mut self, ptr: NonNull<u8>, size: usize);

    /// Give the physical pages of `[start, end)` back to the OS while keeping
    /// the range mapped. The range reads as zero afterwards. Bounds are
    /// trimmed inwards to page boundaries.
    ///
    /// # Safety
    ///
    /// The range must be mapped and its content must no longer be needed.
    unsafe fn release_pages(&mut self, start: usize, end: usize);

    fn page_size(&self) -> usize;

    fn stats(&self) -> VirtualMemoryStats;
}

/// `LibcVirtualMemory` maps anonymous private memory through libc.
#[derive(Default)]
pub struct LibcVirtualMemory {
    stats: VirtualMemoryStats,
}

impl LibcVirtualMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VirtualMemory for LibcVirtualMemory {
    type Err = Errno;

    unsafe fn map_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, Errno> {
        let pagesize = sysconf::page::pagesize();
        let size = round_up(size, pagesize);
        let align = cmp::max(align, pagesize);
        // Over-map so an aligned start always exists, then trim both ends.
        let to_map = size + align - pagesize;

        let ptr = libc::mmap(
            null_mut(),
            to_map,
            libc::PROT_READ | libc::PROT_WRITE,
            // NORESERVE: large spaces are reserved up front and only touched
            // as pools are handed out.
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }

        let raw = ptr as usize;
        let aligned = align_up(raw, align);
        let head = aligned - raw;
        let tail = raw + to_map - (aligned + size);
        if head > 0 {
            libc::munmap(raw as *mut libc::c_void, head);
        }
        if tail > 0 {
            libc::munmap((aligned + size) as *mut libc::c_void, tail);
        }

        self.stats.mappings += 1;
        self.stats.mapped_bytes += size;
        trace!("mmap {:#x}..{:#x}", aligned, aligned + size);

        Ok(NonNull::new_unchecked(aligned as *mut u8))
    }

    unsafe fn unmap(&mut self, ptr: NonNull<u8>, size: usize) {
        let size = round_up(size, sysconf::page::pagesize());
        if libc::munmap(ptr.as_ptr() as *mut libc::c_void, size) != 0 {
            warn!("munmap({:p}, {}) failed: {}", ptr, size, errno::errno());
            return;
        }
        self.stats.mappings -= 1;
        self.stats.mapped_bytes -= size;
    }

    unsafe fn release_pages(&mut self, start: usize, end: usize) {
        let pagesize = sysconf::page::pagesize();
        let start = align_up(start, pagesize);
        let end = align_down(end, pagesize);
        if start >= end {
            return;
        }
        let len = end - start;
        if libc::madvise(start as *mut libc::c_void, len, libc::MADV_DONTNEED) != 0 {
            warn!("madvise({:#x}, {}) failed: {}", start, len, errno::errno());
            return;
        }
        self.stats.released_bytes += len;
    }

    fn page_size(&self) -> usize {
        sysconf::page::pagesize()
    }

    fn stats(&self) -> VirtualMemoryStats {
        self.stats
    }
}

/// A pretend address space backed by one heap allocation.
///
/// Mappings are bumped off the front and never reused.
pub struct ToyMemory {
    pub page_size: usize,
    base: NonNull<u8>,
    layout: Layout,
    used: usize,
    stats: VirtualMemoryStats,
}

// The buffer is exclusively owned by the ToyMemory.
unsafe impl Send for ToyMemory {}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ToyMemoryExhausted {
    pub requested: usize,
    pub available: usize,
}

impl fmt::Display for ToyMemoryExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "toy memory exhausted: requested {} bytes, {} available",
            self.requested, self.available
        )
    }
}

impl ToyMemory {
    /// A toy address space of `capacity` bytes, aligned to `POOL_ALIGNMENT`.
    pub fn new(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity, POOL_ALIGNMENT)
            .expect("Toy memory capacity overflows a Layout");
        let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let base = match NonNull::new(raw) {
            Some(base) => base,
            None => alloc::alloc::handle_alloc_error(layout),
        };
        debug!("Toy memory of {} bytes at {:p}", capacity, base);
        ToyMemory {
            page_size: 4096,
            base,
            layout,
            used: 0,
            stats: VirtualMemoryStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    fn contains(&self, start: usize, end: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        start >= base && end <= base + self.used
    }
}

impl Drop for ToyMemory {
    fn drop(&mut self) {
        unsafe { alloc::alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl VirtualMemory for ToyMemory {
    type Err = ToyMemoryExhausted;

    unsafe fn map_aligned(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, ToyMemoryExhausted> {
        let base = self.base.as_ptr() as usize;
        let size = round_up(size, self.page_size);
        let start = align_up(base + self.used, cmp::max(align, self.page_size));
        let available = (base + self.capacity()).saturating_sub(start);
        if size > available {
            return Err(ToyMemoryExhausted {
                requested: size,
                available,
            });
        }

        self.used = start + size - base;
        self.stats.mappings += 1;
        self.stats.mapped_bytes += size;
        Ok(NonNull::new_unchecked(start as *mut u8))
    }

    unsafe fn unmap(&mut self, ptr: NonNull<u8>, size: usize) {
        let size = round_up(size, self.page_size);
        let start = ptr.as_ptr() as usize;
        assert!(
            self.contains(start, start + size),
            "Unmapping {:#x}..{:#x} outside of toy memory",
            start,
            start + size
        );
        // Unmapped memory is never handed out again; zero it so stale content
        // can't leak into a test that peeks at it.
        ptr::write_bytes(ptr.as_ptr(), 0, size);
        self.stats.mappings -= 1;
        self.stats.mapped_bytes -= size;
    }

    unsafe fn release_pages(&mut self, start: usize, end: usize) {
        let start = align_up(start, self.page_size);
        let end = align_down(end, self.page_size);
        if start >= end {
            return;
        }
        assert!(
            self.contains(start, end),
            "Releasing {:#x}..{:#x} outside of toy memory",
            start,
            end
        );
        ptr::write_bytes(start as *mut u8, 0, end - start);
        self.stats.released_bytes += end - start;
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn stats(&self) -> VirtualMemoryStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    use crate::pool::{is_aligned, MB};

    #[test]
    fn test_toy_memory_maps_aligned() {
        let mut toy = ToyMemory::new(4 * MB);
        let a = unsafe { toy.map_aligned(4096, POOL_ALIGNMENT).unwrap() };
        let b = unsafe { toy.map_aligned(4096, POOL_ALIGNMENT).unwrap() };
        assert!(is_aligned(a.as_ptr() as usize, POOL_ALIGNMENT));
        assert!(is_aligned(b.as_ptr() as usize, POOL_ALIGNMENT));
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, POOL_ALIGNMENT);
        assert_eq!(toy.stats().mappings, 2);

        let err = unsafe { toy.map_aligned(8 * MB, POOL_ALIGNMENT) }.unwrap_err();
        assert_eq!(err.requested, 8 * MB);
    }

    #[test]
    fn test_toy_release_zeroes_whole_pages() {
        let mut toy = ToyMemory::new(MB);
        let ptr = unsafe { toy.map_aligned(64 * 1024, POOL_ALIGNMENT).unwrap() };
        let start = ptr.as_ptr() as usize;
        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 0xAB, 64 * 1024);
            // Unaligned bounds are trimmed inwards: only the middle pages go.
            toy.release_pages(start + 1, start + 3 * 4096 + 1);
            assert_eq!(*ptr.as_ptr(), 0xAB);
            assert_eq!(*ptr.as_ptr().add(4096), 0);
            assert_eq!(*ptr.as_ptr().add(2 * 4096 + 100), 0);
            assert_eq!(*ptr.as_ptr().add(3 * 4096), 0xAB);
        }
        assert_eq!(toy.stats().released_bytes, 2 * 4096);
    }

    #[test]
    fn test_libc_map_release_unmap() {
        let mut vm = LibcVirtualMemory::new();
        let size = 2 * POOL_ALIGNMENT;
        let ptr = unsafe { vm.map_aligned(size, POOL_ALIGNMENT).unwrap() };
        let start = ptr.as_ptr() as usize;
        assert!(is_aligned(start, POOL_ALIGNMENT));
        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 0x5A, size);
            vm.release_pages(start, start + size);
            let bytes = core::slice::from_raw_parts(ptr.as_ptr(), size);
            assert!(bytes.iter().all(|&b| b == 0));
            vm.unmap(ptr, size);
        }
        assert_eq!(vm.stats().mappings, 0);
        assert_eq!(vm.stats().released_bytes, size);
    }
}
