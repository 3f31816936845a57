use crate::managed::Slice;

use super::{Block, Error, Result};

/// Bytes of a block header: next offset, previous offset, used flag.
const HDR: u32 = 12;

/// Smallest payload a block may have.
///
/// Smaller values save space at the cost of more blocks; this matches the
/// customary choice of three words.
const MIN_SIZE: u32 = 12;

fn align(size: usize) -> usize {
    (size + 3) & !3
}

/// A best-fit heap with immediate coalescing.
///
/// Blocks form an implicit list ordered by address: every block starts with a
/// header holding the offsets of the next and previous headers plus a used
/// flag. Allocation searches first-fit starting from the `lowest_free` cursor
/// and splits the found block when the remainder can hold a minimal block.
/// Freeing merges with the physically preceding and following blocks at once,
/// so no two adjacent free blocks ever coexist.
///
/// The arena ends in a permanently used sentinel header so that the merge
/// logic needs no special case for the last block.
#[derive(Debug)]
pub struct Heap<'a> {
    arena: Slice<'a, u8>,
    /// Offset of the sentinel header.
    sentinel: u32,
    /// Offset of the lowest free block header; search starts here.
    lowest_free: u32,
}

impl<'a> Heap<'a> {
    /// Create a heap with `size` bytes of owned arena.
    #[cfg(feature = "std")]
    pub fn new(size: usize) -> Self {
        Self::with_storage(vec![0; size])
    }

    /// Create a heap over caller-provided storage.
    ///
    /// # Panics
    ///
    /// Panics when the storage can not hold even a single minimal block.
    pub fn with_storage<T>(storage: T) -> Self
        where T: Into<Slice<'a, u8>>
    {
        let arena = storage.into();
        let total = arena.len();
        assert!(total >= (2 * HDR + MIN_SIZE) as usize, "Heap storage too small");
        assert!(total < u32::max_value() as usize, "Heap storage too large");

        let sentinel = (total as u32 - HDR) & !3;
        let mut heap = Heap {
            arena,
            sentinel,
            lowest_free: 0,
        };
        heap.write_header(0, sentinel, 0, false);
        heap.write_header(sentinel, sentinel, 0, true);
        heap
    }

    /// Allocate a contiguous region of at least `size` bytes.
    pub fn alloc(&mut self, size: usize) -> Result<Block> {
        if size >= self.sentinel as usize {
            return Err(Error::BadSize);
        }
        let size = align(size).max(MIN_SIZE as usize) as u32;

        let mut off = self.lowest_free;
        while off < self.sentinel {
            let next = self.next_of(off);
            debug_assert!(next > off && next <= self.sentinel, "heap: corrupt block list");
            if !self.used(off) && next - off - HDR >= size {
                self.take(off, size);
                if off == self.lowest_free {
                    self.advance_lowest_free();
                }
                return Ok(Block(off + HDR));
            }
            off = next;
        }

        net_debug!("heap: no region of {} bytes", size);
        Err(Error::Exhausted)
    }

    /// Release a block, merging with free neighbors.
    pub fn free(&mut self, block: Block) {
        let off = block.0 - HDR;
        debug_assert!(off < self.sentinel);
        debug_assert!(self.used(off), "heap: double free");

        self.set_used(off, false);
        if off < self.lowest_free {
            self.lowest_free = off;
        }
        self.plug_holes(off);
    }

    /// Shrink an allocation in place.
    ///
    /// When the block borders a free neighbor the freed tail joins it
    /// immediately. Otherwise a remainder large enough for a minimal block is
    /// carved off as a new free block. A smaller remainder stays attached to
    /// the allocation: those few bytes are unusable until the block is freed,
    /// which is accepted in exchange for never creating undersized blocks.
    pub fn trim(&mut self, block: Block, new_size: usize) -> Result<()> {
        let off = block.0 - HDR;
        debug_assert!(self.used(off));

        let new_size = align(new_size).max(MIN_SIZE as usize) as u32;
        let current = self.size_of(off);
        if new_size > current {
            return Err(Error::BadSize);
        }
        if new_size == current {
            return Ok(());
        }

        let next = self.next_of(off);
        let moved = off + HDR + new_size;
        if next != self.sentinel && !self.used(next) {
            // Slide the following free block's header down over the tail.
            if self.lowest_free == next {
                self.lowest_free = moved;
            }
            let after = self.next_of(next);
            self.write_header(moved, after, off, false);
            self.set_next(off, moved);
            if after != self.sentinel {
                self.set_prev(after, moved);
            }
        } else if current - new_size >= HDR + MIN_SIZE {
            self.write_header(moved, next, off, false);
            self.set_next(off, moved);
            if next != self.sentinel {
                self.set_prev(next, moved);
            }
            if moved < self.lowest_free {
                self.lowest_free = moved;
            }
        }
        // Near fit: the remainder stays with the block.
        Ok(())
    }

    /// The usable size of a block.
    pub fn size(&self, block: Block) -> usize {
        self.size_of(block.0 - HDR) as usize
    }

    /// Access the bytes of a block.
    pub fn bytes(&self, block: Block) -> &[u8] {
        let size = self.size(block);
        let start = block.0 as usize;
        &self.arena[start..start + size]
    }

    /// Access the bytes of a block mutably.
    pub fn bytes_mut(&mut self, block: Block) -> &mut [u8] {
        let size = self.size(block);
        let start = block.0 as usize;
        &mut self.arena[start..start + size]
    }

    fn take(&mut self, off: u32, size: u32) {
        let next = self.next_of(off);
        let avail = next - off - HDR;
        if avail - size >= HDR + MIN_SIZE {
            let split = off + HDR + size;
            self.write_header(split, next, off, false);
            self.set_next(off, split);
            if next != self.sentinel {
                self.set_prev(next, split);
            }
        }
        self.set_used(off, true);
    }

    fn plug_holes(&mut self, off: u32) {
        // Merge the following block into this one.
        let next = self.next_of(off);
        if next != self.sentinel && !self.used(next) {
            if self.lowest_free == next {
                self.lowest_free = off;
            }
            let after = self.next_of(next);
            self.set_next(off, after);
            if after != self.sentinel {
                self.set_prev(after, off);
            }
        }

        // Merge this block into a free predecessor.
        let prev = self.prev_of(off);
        if prev != off && !self.used(prev) {
            if self.lowest_free == off {
                self.lowest_free = prev;
            }
            let after = self.next_of(off);
            self.set_next(prev, after);
            if after != self.sentinel {
                self.set_prev(after, prev);
            }
        }
    }

    fn advance_lowest_free(&mut self) {
        let mut cursor = self.lowest_free;
        while cursor < self.sentinel && self.used(cursor) {
            cursor = self.next_of(cursor);
        }
        self.lowest_free = cursor;
    }

    fn size_of(&self, off: u32) -> u32 {
        self.next_of(off) - off - HDR
    }

    fn read_word(&self, at: u32) -> u32 {
        let start = at as usize;
        let mut word = [0; 4];
        word.copy_from_slice(&self.arena[start..start + 4]);
        u32::from_ne_bytes(word)
    }

    fn write_word(&mut self, at: u32, value: u32) {
        let start = at as usize;
        self.arena[start..start + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn next_of(&self, off: u32) -> u32 {
        self.read_word(off)
    }

    fn set_next(&mut self, off: u32, value: u32) {
        self.write_word(off, value)
    }

    fn prev_of(&self, off: u32) -> u32 {
        self.read_word(off + 4)
    }

    fn set_prev(&mut self, off: u32, value: u32) {
        self.write_word(off + 4, value)
    }

    fn used(&self, off: u32) -> bool {
        self.read_word(off + 8) != 0
    }

    fn set_used(&mut self, off: u32, used: bool) {
        self.write_word(off + 8, used as u32)
    }

    fn write_header(&mut self, off: u32, next: u32, prev: u32, used: bool) {
        self.set_next(off, next);
        self.set_prev(off, prev);
        self.set_used(off, used);
    }

    /// Walk the block list and assert the coalescing invariant.
    #[cfg(test)]
    fn assert_coalesced(&self) {
        let mut off = 0;
        let mut previous_free = false;
        while off < self.sentinel {
            let free = !self.used(off);
            assert!(!(free && previous_free), "adjacent free blocks at {}", off);
            previous_free = free;
            off = self.next_of(off);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_reuse() {
        let mut heap = Heap::new(512);
        let a = heap.alloc(32).unwrap();
        let b = heap.alloc(32).unwrap();
        heap.assert_coalesced();

        heap.free(a);
        heap.assert_coalesced();
        // First-fit from the lowest free block returns the same region.
        let c = heap.alloc(32).unwrap();
        assert_eq!(a, c);

        heap.free(b);
        heap.free(c);
        heap.assert_coalesced();
    }

    #[test]
    fn merges_both_neighbors() {
        let mut heap = Heap::new(512);
        let a = heap.alloc(48).unwrap();
        let b = heap.alloc(48).unwrap();
        let c = heap.alloc(48).unwrap();
        let _guard = heap.alloc(48).unwrap();

        heap.free(a);
        heap.free(c);
        heap.assert_coalesced();
        // Freeing the middle block must fuse all three into one region.
        heap.free(b);
        heap.assert_coalesced();

        let big = heap.alloc(3 * 48 + 2 * 12).unwrap();
        assert_eq!(big, a);
    }

    #[test]
    fn split_leaves_remainder_usable() {
        let mut heap = Heap::new(256);
        let a = heap.alloc(64).unwrap();
        heap.free(a);
        let b = heap.alloc(16).unwrap();
        assert_eq!(a, b);
        // The split remainder serves further requests.
        let c = heap.alloc(16).unwrap();
        assert!(c != b);
        heap.assert_coalesced();
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut heap = Heap::new(96);
        let a = heap.alloc(24).unwrap();
        assert_eq!(heap.alloc(512), Err(Error::BadSize));
        assert_eq!(heap.alloc(64), Err(Error::Exhausted));
        heap.free(a);
        assert!(heap.alloc(24).is_ok());
    }

    #[test]
    fn trim_carves_free_block() {
        let mut heap = Heap::new(512);
        let a = heap.alloc(128).unwrap();
        let _guard = heap.alloc(32).unwrap();
        heap.trim(a, 32).unwrap();
        assert_eq!(heap.size(a), 32);
        // The carved tail is allocatable again.
        let b = heap.alloc(64).unwrap();
        assert!(b.0 > a.0 && b.0 < _guard.0);
        heap.assert_coalesced();
    }

    #[test]
    fn trim_near_fit_keeps_bytes_attached() {
        let mut heap = Heap::new(512);
        let a = heap.alloc(64).unwrap();
        let _guard = heap.alloc(32).unwrap();
        // 8 trailing bytes are too few for a header plus minimal block; they
        // remain part of the allocation until it is freed.
        heap.trim(a, 56).unwrap();
        assert_eq!(heap.size(a), 64);
        heap.assert_coalesced();
    }

    #[test]
    fn trim_joins_following_free_block() {
        let mut heap = Heap::new(512);
        let a = heap.alloc(64).unwrap();
        let b = heap.alloc(64).unwrap();
        let _guard = heap.alloc(32).unwrap();
        heap.free(b);
        heap.trim(a, 16).unwrap();
        assert_eq!(heap.size(a), 16);
        heap.assert_coalesced();
        // Tail and the former `b` region now form one free block.
        let big = heap.alloc(64 + 48).unwrap();
        assert_eq!(big.0, a.0 + 16 + 12);
    }

    #[test]
    fn trim_cannot_grow() {
        let mut heap = Heap::new(256);
        let a = heap.alloc(32).unwrap();
        assert_eq!(heap.trim(a, 64), Err(Error::BadSize));
    }
}
