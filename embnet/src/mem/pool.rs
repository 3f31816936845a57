use crate::config::PoolClass;
use crate::managed::Slice;

use super::{Block, Error, Result};

/// Marker for an empty free list.
const NONE: u32 = u32::max_value();

/// Maximum number of size classes, matching the configuration array.
const MAX_CLASSES: usize = 8;

#[derive(Debug, Default, Clone, Copy)]
struct Class {
    /// Block payload size in bytes.
    size: u32,
    /// First byte of this class's region in the arena.
    base: u32,
    /// One past the last byte of the region.
    end: u32,
    /// Offset of the first free block, `NONE` when exhausted.
    free: u32,
    /// Free blocks remaining.
    avail: u32,
}

/// A fixed-size-class pool allocator.
///
/// The arena is carved into per-class regions at construction. Free blocks of
/// a class form a singly linked list threaded through the blocks themselves,
/// so the allocator needs no bookkeeping storage beyond the class table.
/// Allocation picks the smallest class that fits and pops its list; when that
/// class is exhausted the allocation either fails or, if configured, spills
/// into the next larger classes.
///
/// ```
/// use embnet::config::PoolClass;
/// use embnet::mem::Pool;
///
/// let classes = [PoolClass { size: 64, count: 4 }, PoolClass { size: 128, count: 2 }];
/// let mut storage = vec![0u8; Pool::storage_for(&classes)];
/// let mut pool = Pool::with_storage(&classes, false, &mut storage[..]);
///
/// let block = pool.alloc(48).unwrap();
/// assert_eq!(pool.size(block), 64);
/// pool.free(block);
/// ```
#[derive(Debug)]
pub struct Pool<'a> {
    arena: Slice<'a, u8>,
    classes: [Class; MAX_CLASSES],
    class_count: usize,
    spill: bool,
}

impl<'a> Pool<'a> {
    /// Bytes of storage required for a class configuration.
    pub fn storage_for(classes: &[PoolClass]) -> usize {
        classes.iter()
            .map(|class| class.size as usize * class.count as usize)
            .sum()
    }

    /// Create a pool with owned storage sized for the configuration.
    #[cfg(feature = "std")]
    pub fn new(classes: &[PoolClass], spill: bool) -> Self {
        Self::with_storage(classes, spill, vec![0; Self::storage_for(classes)])
    }

    /// Create a pool over caller-provided storage.
    ///
    /// Classes must be given in ascending block size and there may be at most
    /// eight of them; classes with `count == 0` are skipped. The storage must
    /// hold at least [`storage_for`] bytes.
    ///
    /// # Panics
    ///
    /// Panics when the configuration is malformed or the storage too small.
    /// Configurations are build-time constants of a port, so this is a
    /// deployment error, not a runtime condition.
    ///
    /// [`storage_for`]: #method.storage_for
    pub fn with_storage<T>(classes: &[PoolClass], spill: bool, storage: T) -> Self
        where T: Into<Slice<'a, u8>>
    {
        let arena = storage.into();
        assert!(arena.len() >= Self::storage_for(classes), "Pool storage too small");

        let mut table = [Class::default(); MAX_CLASSES];
        let mut count = 0;
        let mut offset = 0u32;
        let mut last_size = 0;
        for config in classes.iter().filter(|class| class.count > 0) {
            assert!(count < MAX_CLASSES, "Too many pool classes");
            assert!(config.size as usize >= core::mem::size_of::<u32>(),
                "Pool class too small for a free-list link");
            assert!(config.size > last_size, "Pool classes must ascend in size");
            last_size = config.size;

            let size = u32::from(config.size);
            let end = offset + size * u32::from(config.count);
            table[count] = Class {
                size,
                base: offset,
                end,
                free: NONE,
                avail: 0,
            };
            count += 1;
            offset = end;
        }

        let mut pool = Pool {
            arena,
            classes: table,
            class_count: count,
            spill,
        };
        for index in 0..count {
            let class = pool.classes[index];
            let mut block = class.base;
            while block < class.end {
                pool.push_free(index, block);
                block += class.size;
            }
        }
        pool
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// The smallest fitting class serves the request; with spilling enabled,
    /// larger classes are tried in turn when it is empty.
    pub fn alloc(&mut self, size: usize) -> Result<Block> {
        let first = self.classes[..self.class_count]
            .iter()
            .position(|class| class.size as usize >= size)
            .ok_or(Error::BadSize)?;

        let last = if self.spill { self.class_count } else { first + 1 };
        for index in first..last {
            if let Some(block) = self.pop_free(index) {
                return Ok(Block(block));
            }
        }

        net_debug!("pool: out of blocks for size {}", size);
        Err(Error::Exhausted)
    }

    /// Return a block to its class.
    pub fn free(&mut self, block: Block) {
        let index = self.class_of(block);
        debug_assert!(!self.on_free_list(index, block.0), "pool: double free");
        self.push_free(index, block.0);
    }

    /// The usable size of a block, which is its class's block size.
    pub fn size(&self, block: Block) -> usize {
        self.classes[self.class_of(block)].size as usize
    }

    /// The largest block size any class can serve.
    pub fn max_size(&self) -> usize {
        self.classes[..self.class_count]
            .last()
            .map_or(0, |class| class.size as usize)
    }

    /// Free blocks remaining in the class serving `size`.
    pub fn avail(&self, size: usize) -> usize {
        self.classes[..self.class_count]
            .iter()
            .find(|class| class.size as usize >= size)
            .map_or(0, |class| class.avail as usize)
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

    fn class_of(&self, block: Block) -> usize {
        let index = self.classes[..self.class_count]
            .iter()
            .position(|class| class.base <= block.0 && block.0 < class.end)
            .expect("Block from a foreign arena");
        let class = &self.classes[index];
        debug_assert_eq!((block.0 - class.base) % class.size, 0);
        index
    }

    fn push_free(&mut self, index: usize, offset: u32) {
        let head = self.classes[index].free;
        let start = offset as usize;
        self.arena[start..start + 4].copy_from_slice(&head.to_ne_bytes());
        self.classes[index].free = offset;
        self.classes[index].avail += 1;
    }

    fn pop_free(&mut self, index: usize) -> Option<u32> {
        let head = self.classes[index].free;
        if head == NONE {
            return None;
        }
        let start = head as usize;
        let mut link = [0; 4];
        link.copy_from_slice(&self.arena[start..start + 4]);
        self.classes[index].free = u32::from_ne_bytes(link);
        self.classes[index].avail -= 1;
        Some(head)
    }

    #[cfg(debug_assertions)]
    fn on_free_list(&self, index: usize, offset: u32) -> bool {
        let mut cursor = self.classes[index].free;
        while cursor != NONE {
            if cursor == offset {
                return true;
            }
            let start = cursor as usize;
            let mut link = [0; 4];
            link.copy_from_slice(&self.arena[start..start + 4]);
            cursor = u32::from_ne_bytes(link);
        }
        false
    }

    #[cfg(not(debug_assertions))]
    fn on_free_list(&self, _index: usize, _offset: u32) -> bool {
        false
    }
}
