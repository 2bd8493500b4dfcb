//! Arenas: pools that carry their own header in-band.
//!
//! An arena header is written at the start of the memory it manages, and the
//! arena's buffer begins at the first [`DEFAULT_ALIGNMENT`] boundary after the
//! header. Both backends place arenas through [`ArenaPlacement`], so the
//! padding arithmetic lives in one place.
//!
//! [`DEFAULT_ALIGNMENT`]: ../pool/constant.DEFAULT_ALIGNMENT.html
//! [`ArenaPlacement`]: struct.ArenaPlacement.html

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::pool::{align_up, is_aligned, DEFAULT_ALIGNMENT};

/// Header of an arena. Lives at the very start of the arena's memory.
#[repr(C)]
pub struct Arena {
    buff: NonNull<u8>,
    size: usize,
    cur_pos: usize,
    next: Option<NonNull<Arena>>,
}

pub const ARENA_HEADER_SIZE: usize = size_of::<Arena>();

/// Worst-case padding between the end of the header and the aligned buffer,
/// given the header itself is only aligned to `align_of::<Arena>()`.
pub const MAX_ALIGNMENT_DRIFT: usize = if DEFAULT_ALIGNMENT > align_of::<Arena>() {
    DEFAULT_ALIGNMENT - align_of::<Arena>()
} else {
    0
};

const_assert!(align_of::<Arena>() <= DEFAULT_ALIGNMENT);
const_assert!(ARENA_HEADER_SIZE % align_of::<Arena>() == 0);

/// Where an arena header and its buffer land inside a raw block.
///
/// Invariants: `header` is aligned for `Arena`, `buff` is aligned to
/// `DEFAULT_ALIGNMENT`, `header + ARENA_HEADER_SIZE <= buff`, and
/// `buff + buff_size` is the end of the raw block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArenaPlacement {
    pub header: usize,
    pub buff: usize,
    pub buff_size: usize,
}

impl ArenaPlacement {
    /// Lay out an arena in the block `[start, start + total)`.
    ///
    /// Returns `None` if the block cannot hold the header and the padding.
    pub fn compute(start: usize, total: usize) -> Option<ArenaPlacement> {
        assert!(
            is_aligned(start, align_of::<Arena>()),
            "Arena header at {:#x} is misaligned",
            start
        );
        let end = start.checked_add(total)?;
        let buff = align_up(start + ARENA_HEADER_SIZE, DEFAULT_ALIGNMENT);
        if buff > end {
            return None;
        }
        let placement = ArenaPlacement {
            header: start,
            buff,
            buff_size: end - buff,
        };
        debug_assert!(placement.buff - placement.header <= ARENA_HEADER_SIZE + MAX_ALIGNMENT_DRIFT);
        Some(placement)
    }

    /// Size of a raw block guaranteed to fit a buffer of at least
    /// `buff_size` bytes wherever the header lands, or `None` if no such
    /// block size exists.
    pub fn required_total(buff_size: usize) -> Option<usize> {
        buff_size.checked_add(ARENA_HEADER_SIZE + MAX_ALIGNMENT_DRIFT)
    }
}

impl Arena {
    /// Write an arena header into the raw block `[start, start + total)`.
    ///
    /// # Safety
    ///
    /// The block must be writable, owned by the caller, and not in use by
    /// anything else for as long as the arena lives.
    pub unsafe fn place(start: usize, total: usize) -> Option<NonNull<Arena>> {
        let placement = ArenaPlacement::compute(start, total)?;
        let header = placement.header as *mut Arena;
        core::ptr::write(
            header,
            Arena {
                buff: NonNull::new_unchecked(placement.buff as *mut u8),
                size: placement.buff_size,
                cur_pos: 0,
                next: None,
            },
        );
        NonNull::new(header)
    }

    /// Bump-allocate `size` bytes aligned to `DEFAULT_ALIGNMENT`.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.alloc_aligned(size, DEFAULT_ALIGNMENT)
    }

    pub fn alloc_aligned(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        let base = self.buff.as_ptr() as usize;
        let start = align_up(base + self.cur_pos, align);
        let end = start.checked_add(size)?;
        if end > base + self.size {
            return None;
        }
        self.cur_pos = end - base;
        NonNull::new(start as *mut u8)
    }

    /// Forget every allocation made from this arena.
    pub fn reset(&mut self) {
        self.cur_pos = 0;
    }

    /// Size of the buffer, excluding the header.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn free_size(&self) -> usize {
        self.size - self.cur_pos
    }

    pub fn occupied_size(&self) -> usize {
        self.cur_pos
    }

    pub fn allocated_start(&self) -> *mut u8 {
        self.buff.as_ptr()
    }

    pub fn allocated_end(&self) -> *mut u8 {
        // SAFETY: cur_pos never exceeds the buffer size.
        unsafe { self.buff.as_ptr().add(self.cur_pos) }
    }

    pub fn in_arena(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.buff.as_ptr() as usize;
        addr >= base && addr < base + self.cur_pos
    }

    /// Address of the header (the start of the arena's raw block).
    pub fn header_addr(&self) -> usize {
        self as *const Arena as usize
    }

    /// Size of the whole raw block: header, padding and buffer.
    pub fn total_size(&self) -> usize {
        self.size + (self.buff.as_ptr() as usize - self.header_addr())
    }

    pub fn next(&self) -> Option<NonNull<Arena>> {
        self.next
    }

    pub fn link_next(&mut self, next: Option<NonNull<Arena>>) {
        self.next = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_placement_padding() {
        // Header aligned only to its own alignment, never to DEFAULT_ALIGNMENT.
        let start = 0x1000 + align_of::<Arena>();
        let placement = ArenaPlacement::compute(start, 4096).unwrap();
        assert!(is_aligned(placement.buff, DEFAULT_ALIGNMENT));
        assert!(placement.buff >= start + ARENA_HEADER_SIZE);
        assert_eq!(placement.buff + placement.buff_size, start + 4096);

        let too_small = ArenaPlacement::compute(0x1000, ARENA_HEADER_SIZE - 1);
        assert!(too_small.is_none());

        let wanted = 1000;
        let total = ArenaPlacement::required_total(wanted).unwrap();
        let placement = ArenaPlacement::compute(start, total).unwrap();
        assert!(placement.buff_size >= wanted);
        assert_eq!(ArenaPlacement::required_total(usize::MAX - 1), None);
    }

    #[test]
    fn test_bump_allocation() {
        let mut backing = vec![0u64; 512];
        let start = backing.as_mut_ptr() as usize;
        let total = backing.len() * 8;

        let mut arena_ptr = unsafe { Arena::place(start, total).unwrap() };
        let arena = unsafe { arena_ptr.as_mut() };

        assert_eq!(arena.header_addr(), start);
        assert_eq!(arena.total_size(), total);
        assert_eq!(arena.occupied_size(), 0);

        let a = arena.alloc(10).unwrap();
        let b = arena.alloc(10).unwrap();
        assert!(is_aligned(a.as_ptr() as usize, DEFAULT_ALIGNMENT));
        assert!(is_aligned(b.as_ptr() as usize, DEFAULT_ALIGNMENT));
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, DEFAULT_ALIGNMENT);
        assert!(arena.in_arena(a.as_ptr()));
        assert!(!arena.in_arena(arena.allocated_end()));

        assert!(arena.alloc(arena.free_size() + 1).is_none());
        let rest = arena.free_size();
        assert!(arena.alloc_aligned(rest, 1).is_some());
        assert_eq!(arena.free_size(), 0);

        arena.reset();
        assert_eq!(arena.free_size(), arena.size());
    }
}
