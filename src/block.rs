//! The cache-line-aligned /24 block: 256 atomic score slots plus an
//! active-count and a write lock.

use std::sync::atomic::{AtomicI16, AtomicU32, Ordering};

use crate::lock::{BlockLock, DefaultLock};

/// Number of hosts in a /24 block.
pub const HOSTS_PER_BLOCK: usize = 256;

/// A /24 block: 256 score slots, an active-count, and a write lock.
///
/// Aligned to 64 bytes (a common cache-line size) so that concurrent
/// writers to different blocks never false-share a cache line, and so
/// the lock itself sits apart from the slots a reader scans.
#[repr(align(64))]
pub struct Block {
    lock: DefaultLock,
    active: AtomicU32,
    slots: [AtomicI16; HOSTS_PER_BLOCK],
}

impl Block {
    pub fn new() -> Self {
        Block {
            lock: DefaultLock::default(),
            active: AtomicU32::new(0),
            slots: std::array::from_fn(|_| AtomicI16::new(0)),
        }
    }

    /// Acquire-loads the slot for `host`. Never takes the write lock.
    #[inline]
    pub fn load(&self, host: u8) -> i16 {
        self.slots[host as usize].load(Ordering::Acquire)
    }

    /// Acquire-loads the active count. Never takes the write lock.
    #[inline]
    pub fn active_count(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    /// Runs `f` while holding the block's write lock, passing it the slot
    /// array and active-count cell so `f` can read-modify-write them.
    pub fn with_lock<R>(&self, f: impl FnOnce(&[AtomicI16; HOSTS_PER_BLOCK], &AtomicU32) -> R) -> R {
        self.lock.lock();
        let r = f(&self.slots, &self.active);
        self.lock.unlock();
        r
    }

    pub const fn memory_size() -> usize {
        std::mem::size_of::<Block>()
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}
