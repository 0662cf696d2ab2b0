//! Bump-style memory arena with block reuse.
//!
//! The arena serves small requests from a chain of fixed-capacity blocks and
//! oversized requests from standalone allocations kept on a side list.
//!
//! # Layout
//!
//! ```text
//!  blocks[0]          blocks[1]          blocks[n] (tail)
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │used │ free   │ → │used    │free │ → │used│  free   │
//! └──────────────┘   └──────────────┘   └──────────────┘
//!        ▲ current (searches start here)
//!
//!  large ─► [record] ─► [record] ─► ∅      records live inside small blocks
//! ```
//!
//! Rules:
//! - every returned region is 16-byte aligned and zero-filled;
//! - small-block bytes come back only on [`Arena::reset`];
//! - large allocations are freed on reset or drop, never reused.
//!
//! Pointers handed out stay valid until the next `reset` or until the arena is
//! dropped. Callers that turn them into references own that contract.

use std::alloc::{self, Layout};
use std::mem;
use std::ptr::{self, NonNull};

use tracing::{debug, error, trace};

use crate::error::{Error, Result};

/// Alignment of every region handed out by the arena.
pub const ALIGNMENT: usize = 16;

/// Small-block capacity used when the caller has no preference.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Smallest block capacity accepted; a block must at least hold one large record.
const MIN_CAPACITY: usize = 64;

/// Failed searches a block tolerates before `current` moves past it.
const MAX_FAILED: usize = 4;

struct SmallBlock {
    base: NonNull<u8>,
    cursor: usize,
    failed: usize,
}

impl SmallBlock {
    fn new(capacity: usize) -> Result<Self> {
        let base = allocate_zeroed(capacity)?;
        Ok(Self {
            base,
            cursor: 0,
            failed: 0,
        })
    }

    /// Carves `size` zeroed bytes out of the block, or `None` if they don't fit.
    fn bump(&mut self, size: usize, capacity: usize) -> Option<NonNull<u8>> {
        let start = align_up(self.cursor, ALIGNMENT);
        let end = start.checked_add(size)?;
        if end > capacity {
            return None;
        }
        self.cursor = end;

        // SAFETY: `start..end` lies inside the `capacity` bytes owned by this block.
        unsafe {
            let p = self.base.as_ptr().add(start);
            ptr::write_bytes(p, 0, size);
            Some(NonNull::new_unchecked(p))
        }
    }

    fn rewind(&mut self) {
        self.cursor = 0;
        self.failed = 0;
    }
}

/// Management record of one oversized allocation.
///
/// Stored inside a small block, linked from `Arena::large`.
struct LargeRecord {
    alloc: Option<NonNull<u8>>,
    size: usize,
    next: Option<NonNull<LargeRecord>>,
}

/// Snapshot of the arena's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Capacity of every small block.
    pub capacity: usize,
    /// Blocks in the small chain, including the first one.
    pub small_blocks: usize,
    /// Live oversized allocations.
    pub large_blocks: usize,
    /// Bytes held by live oversized allocations.
    pub large_bytes: usize,
    /// Bytes consumed across all small blocks (alignment padding included).
    pub small_used: usize,
    /// Index of the block where searches start.
    pub current: usize,
}

/// A bump allocator made of fixed-capacity blocks plus a large-allocation list.
pub struct Arena {
    blocks: Vec<SmallBlock>,
    large: Option<NonNull<LargeRecord>>,
    current: usize,
    capacity: usize,
}

impl Arena {
    /// Creates an arena whose small blocks hold `capacity` bytes each.
    ///
    /// The first block is allocated immediately.
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = capacity.max(MIN_CAPACITY);
        let first = SmallBlock::new(capacity)?;

        debug!(capacity, "arena created");
        Ok(Self {
            blocks: vec![first],
            large: None,
            current: 0,
            capacity,
        })
    }

    /// Capacity of each small block; requests above it go to the large list.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `size` zeroed bytes aligned to [`ALIGNMENT`].
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        if size <= self.capacity {
            self.allocate_small(size)
        } else {
            self.allocate_large(size)
        }
    }

    fn allocate_small(&mut self, size: usize) -> Result<NonNull<u8>> {
        let capacity = self.capacity;
        for block in &mut self.blocks[self.current..] {
            if let Some(p) = block.bump(size, capacity) {
                trace!(size, "arena: served from existing block");
                return Ok(p);
            }
        }

        let block = SmallBlock::new(capacity)?;

        // Every block that just failed is charged; chronic failures stop
        // being searched at all.
        let tail = self.blocks.len() - 1;
        for idx in self.current..tail {
            let failed = self.blocks[idx].failed;
            self.blocks[idx].failed += 1;
            if failed > MAX_FAILED {
                self.current = idx + 1;
                trace!(current = self.current, "arena: current block advanced");
            }
        }

        self.blocks.push(block);
        debug!(blocks = self.blocks.len(), "arena: appended small block");

        self.blocks
            .last_mut()
            .and_then(|b| b.bump(size, capacity))
            .ok_or(Error::OutOfMemory { size })
    }

    fn allocate_large(&mut self, size: usize) -> Result<NonNull<u8>> {
        let alloc = allocate_zeroed(size)?;

        let record = match self.allocate_small(mem::size_of::<LargeRecord>()) {
            Ok(p) => p.cast::<LargeRecord>(),
            Err(e) => {
                // SAFETY: `alloc` came from `allocate_zeroed(size)` just above.
                unsafe { release(alloc, size) };
                return Err(e);
            }
        };

        // SAFETY: the record region is freshly carved, 16-byte aligned and
        // large enough for a `LargeRecord`.
        unsafe {
            record.as_ptr().write(LargeRecord {
                alloc: Some(alloc),
                size,
                next: self.large,
            });
        }
        self.large = Some(record);

        debug!(size, "arena: large allocation");
        Ok(alloc)
    }

    /// Frees every large allocation and rewinds all small blocks.
    ///
    /// Small-block memory is kept for reuse. Every pointer obtained before the
    /// call is dangling afterwards.
    pub fn reset(&mut self) {
        self.free_large();
        for block in &mut self.blocks {
            block.rewind();
        }
        self.current = 0;
        debug!(blocks = self.blocks.len(), "arena reset");
    }

    /// Releases all memory and returns the bookkeeping as it stood before.
    pub fn destroy(self) -> ArenaStats {
        let stats = self.stats();
        debug!(?stats, "arena destroyed");
        stats
    }

    /// Bookkeeping snapshot, the arena's equivalent of a pool dump.
    pub fn stats(&self) -> ArenaStats {
        let mut large_blocks = 0;
        let mut large_bytes = 0;
        let mut cursor = self.large;
        while let Some(record) = cursor {
            // SAFETY: records on the list stay valid until the next reset.
            let record = unsafe { record.as_ref() };
            if record.alloc.is_some() {
                large_blocks += 1;
                large_bytes += record.size;
            }
            cursor = record.next;
        }

        ArenaStats {
            capacity: self.capacity,
            small_blocks: self.blocks.len(),
            large_blocks,
            large_bytes,
            small_used: self.blocks.iter().map(|b| b.cursor).sum(),
            current: self.current,
        }
    }

    fn free_large(&mut self) {
        let mut cursor = self.large.take();
        while let Some(mut record) = cursor {
            // SAFETY: records on the list stay valid until the blocks holding
            // them are rewound, which only happens after this walk.
            let record = unsafe { record.as_mut() };
            if let Some(alloc) = record.alloc.take() {
                // SAFETY: `alloc` was obtained from `allocate_zeroed(record.size)`.
                unsafe { release(alloc, record.size) };
            }
            cursor = record.next;
        }
    }

    #[cfg(test)]
    fn in_small_block(&self, p: NonNull<u8>) -> bool {
        let addr = p.as_ptr() as usize;
        self.blocks.iter().any(|b| {
            let base = b.base.as_ptr() as usize;
            addr >= base && addr < base + self.capacity
        })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.free_large();
        for block in self.blocks.drain(..) {
            // SAFETY: each block was obtained from `allocate_zeroed(self.capacity)`.
            unsafe { release(block.base, self.capacity) };
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena").field("stats", &self.stats()).finish()
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

fn layout(size: usize) -> Result<Layout> {
    Layout::from_size_align(size.max(1), ALIGNMENT).map_err(|_| Error::OutOfMemory { size })
}

fn allocate_zeroed(size: usize) -> Result<NonNull<u8>> {
    let layout = layout(size)?;
    // SAFETY: `layout` has a non-zero size.
    let p = unsafe { alloc::alloc_zeroed(layout) };
    NonNull::new(p).ok_or_else(|| {
        error!(size, "arena: system allocation failed");
        Error::OutOfMemory { size }
    })
}

/// # Safety
///
/// `p` must come from `allocate_zeroed(size)` and not have been released.
unsafe fn release(p: NonNull<u8>, size: usize) {
    if let Ok(layout) = layout(size) {
        alloc::dealloc(p.as_ptr(), layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bytes<'a>(p: NonNull<u8>, len: usize) -> &'a mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), len) }
    }

    #[test]
    fn allocations_are_aligned_and_zeroed() {
        let mut arena = Arena::new(256).unwrap();
        for size in [1, 3, 17, 64, 200] {
            let p = arena.allocate(size).unwrap();
            assert_eq!(p.as_ptr() as usize % ALIGNMENT, 0);
            assert!(bytes(p, size).iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn full_block_appends_a_new_one() {
        let mut arena = Arena::new(128).unwrap();
        arena.allocate(100).unwrap();
        arena.allocate(100).unwrap();
        assert_eq!(arena.stats().small_blocks, 2);
    }

    #[test]
    fn current_advances_after_repeated_failures() {
        let mut arena = Arena::new(64).unwrap();
        // Each request fills a block, so every later request fails on all
        // earlier blocks.
        for _ in 0..10 {
            arena.allocate(64).unwrap();
        }
        let stats = arena.stats();
        assert_eq!(stats.small_blocks, 10);
        assert!(stats.current > 0);
    }

    #[test]
    fn reset_zeroes_reused_memory() {
        let mut arena = Arena::new(256).unwrap();
        let p = arena.allocate(128).unwrap();
        bytes(p, 128).fill(0xAB);

        arena.reset();
        let q = arena.allocate(128).unwrap();
        assert_eq!(p, q);
        assert!(bytes(q, 128).iter().all(|&b| b == 0));
    }

    #[test]
    fn reset_drops_large_allocations() {
        let mut arena = Arena::new(4096).unwrap();
        arena.allocate(5000).unwrap();
        assert_eq!(arena.stats().large_blocks, 1);

        arena.reset();
        assert_eq!(arena.stats().large_blocks, 0);

        let again = arena.allocate(5000).unwrap();
        assert!(!arena.in_small_block(again));
        assert_eq!(arena.stats().large_blocks, 1);
        assert!(bytes(again, 5000).iter().all(|&b| b == 0));
    }

    #[test]
    fn two_large_allocations_are_tracked_and_released() {
        let mut arena = Arena::new(4096).unwrap();
        let a = arena.allocate(5000).unwrap();
        let b = arena.allocate(5000).unwrap();
        assert_ne!(a, b);

        let stats = arena.destroy();
        assert_eq!(stats.large_blocks, 2);
        assert_eq!(stats.large_bytes, 10_000);
    }

    #[test]
    fn large_record_lives_in_small_block() {
        let mut arena = Arena::new(4096).unwrap();
        let before = arena.stats().small_used;
        arena.allocate(8192).unwrap();
        assert!(arena.stats().small_used >= before + mem::size_of::<LargeRecord>());
    }

    proptest! {
        #[test]
        fn live_allocations_never_overlap(sizes in prop::collection::vec(0usize..600, 1..80)) {
            let mut arena = Arena::new(512).unwrap();
            let mut spans: Vec<(usize, usize)> = Vec::new();

            for (i, size) in sizes.iter().copied().enumerate() {
                let p = arena.allocate(size).unwrap();
                prop_assert!(bytes(p, size).iter().all(|&b| b == 0));
                bytes(p, size).fill(i as u8 | 1);
                spans.push((p.as_ptr() as usize, size));
            }

            for (i, &(a, alen)) in spans.iter().enumerate() {
                for &(b, blen) in &spans[i + 1..] {
                    if alen == 0 || blen == 0 {
                        continue;
                    }
                    prop_assert!(a + alen <= b || b + blen <= a);
                }
            }
        }
    }
}
