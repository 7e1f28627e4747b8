//! The two-level block directory and its allocation coordinator.
//!
//! Layout: a `/16`-indexed array of 65536 row pointers; each row, once
//! allocated, is a `/24`-within-`/16`-indexed array of 256 block pointers.
//! Both levels are lazily allocated on first write. Lookup never takes a
//! lock; allocation serializes on one of 256 striped locks keyed by
//! `/16 mod 256`, with a double-checked fast path so most allocation calls
//! still avoid contention entirely once the structure is warm.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Mutex;

use crate::addr::Addr;
use crate::bitmap::Bitmap;
use crate::block::Block;

const ROW_COUNT: usize = 1 << 16;
const STRIPE_COUNT: usize = 256;
const BLOCKS_PER_ROW: usize = 256;

/// A `/16` row: 256 possibly-absent block pointers.
struct Row {
    blocks: [AtomicPtr<Block>; BLOCKS_PER_ROW],
}

impl Row {
    fn new() -> Box<Row> {
        Box::new(Row {
            blocks: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
        })
    }
}

/// The block directory. Owns every `/16` row and `/24` block it allocates,
/// and frees them all when dropped.
pub struct Directory {
    rows: Box<[AtomicPtr<Row>]>,
    stripes: Vec<Mutex<()>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::try_new().expect("failed to allocate the directory's top-level row array")
    }

    /// Like [`Directory::new`], but reports allocation failure instead of
    /// aborting. Used by [`crate::Context::new`] for the one directory
    /// allocation (the 64k-entry top-level array) large enough to plausibly
    /// fail; individual `/16` rows and `/24` blocks are allocated on demand
    /// with ordinary `Box::new` (see `get_or_alloc`).
    pub fn try_new() -> Option<Self> {
        let mut rows: Vec<AtomicPtr<Row>> = Vec::new();
        rows.try_reserve_exact(ROW_COUNT).ok()?;
        rows.resize_with(ROW_COUNT, || AtomicPtr::new(std::ptr::null_mut()));
        let mut stripes = Vec::with_capacity(STRIPE_COUNT);
        stripes.resize_with(STRIPE_COUNT, || Mutex::new(()));
        Some(Directory {
            rows: rows.into_boxed_slice(),
            stripes,
        })
    }

    /// Looks up the block for `addr`, without allocating. Never blocks.
    #[inline]
    pub fn lookup(&self, addr: Addr) -> Option<&Block> {
        let row_ptr = self.rows[addr.idx16 as usize].load(Ordering::Acquire);
        if row_ptr.is_null() {
            return None;
        }
        // Safety: once published, a Row is never mutated or freed until
        // `Directory` itself is dropped, so this reference is valid for
        // as long as `&self` is.
        let row = unsafe { &*row_ptr };
        let block_ptr = row.blocks[addr.idx24 as usize].load(Ordering::Acquire);
        if block_ptr.is_null() {
            return None;
        }
        // Safety: same argument as above, applied to the block.
        Some(unsafe { &*block_ptr })
    }

    /// Returns the block for `addr`, allocating the row and/or block if
    /// necessary, and ensures the bitmap bit for its /24 prefix is set.
    pub fn get_or_alloc(&self, addr: Addr, bitmap: &Bitmap) -> &Block {
        // Fast path: already allocated.
        if let Some(block) = self.lookup(addr) {
            bitmap.set(addr.prefix24);
            return block;
        }

        // Slow path: serialize on the row's stripe lock.
        let stripe = addr.idx16 as usize % STRIPE_COUNT;
        let _guard = self.stripes[stripe].lock().unwrap();

        let row_slot = &self.rows[addr.idx16 as usize];
        let mut row_ptr = row_slot.load(Ordering::Acquire);
        if row_ptr.is_null() {
            let new_row = Box::into_raw(Row::new());
            row_slot.store(new_row, Ordering::Release);
            row_ptr = new_row;
        }
        // Safety: we either just published `row_ptr`, or it was published
        // (with Release) by an earlier allocator and observed here with
        // Acquire; either way it is valid and never freed before `self` is.
        let row = unsafe { &*row_ptr };

        let block_slot = &row.blocks[addr.idx24 as usize];
        let mut block_ptr = block_slot.load(Ordering::Acquire);
        if block_ptr.is_null() {
            let new_block = Box::into_raw(Box::new(Block::new()));
            block_slot.store(new_block, Ordering::Release);
            block_ptr = new_block;
        }
        bitmap.set(addr.prefix24);

        // Safety: same argument as for `row`.
        unsafe { &*block_ptr }
    }

    /// Total number of allocated /24 blocks across the whole directory.
    pub fn block_count(&self) -> usize {
        let mut count = 0;
        for row_ptr in self.rows.iter() {
            let row_ptr = row_ptr.load(Ordering::Acquire);
            if row_ptr.is_null() {
                continue;
            }
            let row = unsafe { &*row_ptr };
            for block_ptr in row.blocks.iter() {
                if !block_ptr.load(Ordering::Acquire).is_null() {
                    count += 1;
                }
            }
        }
        count
    }

    /// Visits every allocated block in lexicographic `(/16, /24)` order,
    /// calling `f(idx16, idx24, block)` for each. `f` returning `false`
    /// stops the walk early.
    pub fn for_each_block<'a>(&'a self, mut f: impl FnMut(u16, u8, &'a Block) -> bool) {
        'outer: for (idx16, row_ptr) in self.rows.iter().enumerate() {
            let row_ptr = row_ptr.load(Ordering::Acquire);
            if row_ptr.is_null() {
                continue;
            }
            let row = unsafe { &*row_ptr };
            for (idx24, block_ptr) in row.blocks.iter().enumerate() {
                let block_ptr = block_ptr.load(Ordering::Acquire);
                if block_ptr.is_null() {
                    continue;
                }
                let block = unsafe { &*block_ptr };
                if !f(idx16 as u16, idx24 as u8, block) {
                    break 'outer;
                }
            }
        }
    }

    /// Approximate bytes accounted for by allocated rows and blocks, plus
    /// the fixed cost of the directory's own top-level array.
    pub fn memory_usage(&self) -> usize {
        let mut bytes = self.rows.len() * std::mem::size_of::<AtomicPtr<Row>>();
        for row_ptr in self.rows.iter() {
            let row_ptr = row_ptr.load(Ordering::Acquire);
            if row_ptr.is_null() {
                continue;
            }
            bytes += std::mem::size_of::<Row>();
            let row = unsafe { &*row_ptr };
            for block_ptr in row.blocks.iter() {
                if !block_ptr.load(Ordering::Acquire).is_null() {
                    bytes += Block::memory_size();
                }
            }
        }
        bytes
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        for row_ptr in self.rows.iter() {
            let row_ptr = *row_ptr.get_mut();
            if row_ptr.is_null() {
                continue;
            }
            // Safety: `&mut self` proves no other references to the
            // directory (and therefore to its rows/blocks) can be alive.
            let mut row = unsafe { Box::from_raw(row_ptr) };
            for block_ptr in row.blocks.iter_mut() {
                let block_ptr = *block_ptr.get_mut();
                if !block_ptr.is_null() {
                    drop(unsafe { Box::from_raw(block_ptr) });
                }
            }
        }
    }
}

// Safety: all shared mutable state inside Directory (AtomicPtr, the block's
// own atomics and lock) is synchronized; raw pointers are only ever
// dereferenced into shared references to data with interior synchronization.
unsafe impl Send for Directory {}
unsafe impl Sync for Directory {}
