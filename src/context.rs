//! The operations core: every read/write/maintenance operation is an
//! inherent method on [`Context`], expressed over the bitmap, directory,
//! and score primitives in the sibling modules.

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::addr::{self, Addr};
use crate::archive;
use crate::bitmap::Bitmap;
use crate::config::StoreConfig;
use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::loader::{self, LoadResult};
use crate::score::{decay_truncate, decrement_delta, sat_add};

thread_local! {
    /// Addresses of the `Context`s this thread is currently inside a
    /// `foreach` call for. Thread-local (not a `Context` field) so that
    /// unrelated threads calling `foreach` concurrently — on the same
    /// `Context` or different ones — never contend with each other; only
    /// a call-stack-nested, same-thread, same-`Context` re-entry is
    /// rejected.
    static ITERATING_CONTEXTS: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

/// Removes its `Context` address from [`ITERATING_CONTEXTS`] on drop, so
/// a panic inside `foreach`'s callback still releases the guard.
struct IteratingGuard(usize);

impl Drop for IteratingGuard {
    fn drop(&mut self) {
        ITERATING_CONTEXTS.with(|set| {
            set.borrow_mut().remove(&self.0);
        });
    }
}

/// A process-resident scoring store: one bitmap, one block directory, and
/// the aggregate counters spec.md's `Context` calls for. Thread-safe for
/// any mixture of concurrent readers and writers; there is no internal
/// thread pool.
pub struct Context {
    bitmap: Bitmap,
    directory: Directory,
    total_scores: AtomicU64,
    config: StoreConfig,
}

/// Summary of one [`Context::decay`] sweep.
///
/// `modified_count` is the value spec.md's `decay` operation returns; the
/// other fields are ambient diagnostics a real deployment would want to
/// log or export, grounded in the same walk and costing nothing extra to
/// compute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecayStats {
    /// Every block the sweep visited, whether or not it needed work.
    pub blocks_visited: u64,
    /// Non-zero slots whose value changed (decayed, or zeroed by the
    /// deadzone, or both — counted once either way).
    pub slots_modified: u64,
    /// Blocks whose bitmap bit was cleared because their active count
    /// reached zero during or before this sweep.
    pub bits_cleared: u64,
    /// Same as `slots_modified`; the operation's documented return value.
    pub modified_count: u64,
}

impl Context {
    /// Creates a new, empty context.
    ///
    /// # Panics
    /// Panics if the bitmap or directory's top-level allocation fails. Use
    /// [`Context::try_new`] to handle that case instead.
    pub fn new() -> Self {
        Self::try_new().expect("failed to allocate a new Context")
    }

    /// Like [`Context::new`], but reports out-of-memory instead of
    /// aborting.
    pub fn try_new() -> Result<Self> {
        Self::try_with_config(StoreConfig::default())
    }

    /// Creates a context with explicit [`StoreConfig`].
    pub fn try_with_config(config: StoreConfig) -> Result<Self> {
        let bitmap = Bitmap::try_new().ok_or_else(|| {
            log::error!("failed to allocate the 2 MiB bitmap for a new Context");
            Error::OutOfMemory
        })?;
        let directory = Directory::try_new().ok_or_else(|| {
            log::error!("failed to allocate the directory's top-level row array for a new Context");
            Error::OutOfMemory
        })?;
        Ok(Context {
            bitmap,
            directory,
            total_scores: AtomicU64::new(0),
            config,
        })
    }

    pub(crate) fn config(&self) -> StoreConfig {
        self.config
    }

    /// Returns the score for `key`, or `0` if the key has no stored score
    /// (including the case where it has never been written).
    pub fn get(&self, key: u32) -> i16 {
        let addr = Addr::decompose(key);
        if !self.bitmap.test(addr.prefix24) {
            return 0;
        }
        match self.directory.lookup(addr) {
            Some(block) => block.load(addr.host),
            None => 0,
        }
    }

    /// Like [`Context::get`], but distinguishes "not found" (`None`) from
    /// a stored score. Since a stored zero is indistinguishable from
    /// absence in this store, `None` is also returned for a present-but-
    /// zero slot; `get_ex` exists for callers who want that signaled
    /// explicitly rather than conflated with a real zero score.
    pub fn get_ex(&self, key: u32) -> Option<i16> {
        let addr = Addr::decompose(key);
        if !self.bitmap.test(addr.prefix24) {
            return None;
        }
        let block = self.directory.lookup(addr)?;
        let score = block.load(addr.host);
        if score == 0 {
            None
        } else {
            Some(score)
        }
    }

    /// Sets `key`'s score to `score`, returning the previous score (`0` if
    /// it had none).
    pub fn set(&self, key: u32, score: i16) -> i16 {
        let addr = Addr::decompose(key);
        let block = self.directory.get_or_alloc(addr, &self.bitmap);
        block.with_lock(|slots, active| {
            let cell = &slots[addr.host as usize];
            let old = cell.load(Ordering::Acquire);
            cell.store(score, Ordering::Release);
            self.adjust_counts(old, score, active);
            old
        })
    }

    /// Adds `delta` to `key`'s score, saturating at `[MIN_SCORE, MAX_SCORE]`,
    /// and returns the new score. `delta == 0` is a pure read (equivalent to
    /// `get`) and never allocates a block.
    pub fn increment(&self, key: u32, delta: i16) -> i16 {
        if delta == 0 {
            return self.get(key);
        }
        let addr = Addr::decompose(key);
        let block = self.directory.get_or_alloc(addr, &self.bitmap);
        block.with_lock(|slots, active| {
            let cell = &slots[addr.host as usize];
            let old = cell.load(Ordering::Acquire);
            let new = sat_add(old, delta);
            cell.store(new, Ordering::Release);
            self.adjust_counts(old, new, active);
            new
        })
    }

    /// `decrement(k, d)` is `increment(k, -d)`, with `d == i16::MIN` mapped
    /// to the maximum decrement rather than overflowing.
    pub fn decrement(&self, key: u32, delta: i16) -> i16 {
        self.increment(key, decrement_delta(delta))
    }

    /// Zeros `key`'s score if it has one. A no-op (not a failure) if the
    /// key was never written or its block was never allocated.
    pub fn delete(&self, key: u32) {
        let addr = Addr::decompose(key);
        let Some(block) = self.directory.lookup(addr) else {
            return;
        };
        block.with_lock(|slots, active| {
            let cell = &slots[addr.host as usize];
            let old = cell.load(Ordering::Acquire);
            if old != 0 {
                cell.store(0, Ordering::Release);
                active.fetch_sub(1, Ordering::AcqRel);
                self.total_scores.fetch_sub(1, Ordering::Relaxed);
            }
        });
    }

    fn adjust_counts(&self, old: i16, new: i16, active: &AtomicU32) {
        match (old == 0, new == 0) {
            (true, false) => {
                active.fetch_add(1, Ordering::AcqRel);
                self.total_scores.fetch_add(1, Ordering::Relaxed);
            }
            (false, true) => {
                active.fetch_sub(1, Ordering::AcqRel);
                self.total_scores.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Parses `ip` and calls [`Context::get`]; `0` on an unparseable
    /// address, indistinguishable from a stored zero (spec.md's documented
    /// ambiguity — validate the string up front if that matters).
    pub fn get_by_string(&self, ip: &str) -> i16 {
        self.get(addr::ip_to_u32(ip))
    }

    /// Parses `ip` and calls [`Context::set`].
    pub fn set_by_string(&self, ip: &str, score: i16) -> i16 {
        self.set(addr::ip_to_u32(ip), score)
    }

    /// Parses `ip` and calls [`Context::increment`].
    pub fn increment_by_string(&self, ip: &str, delta: i16) -> i16 {
        self.increment(addr::ip_to_u32(ip), delta)
    }

    /// Parses `ip` and calls [`Context::decrement`].
    pub fn decrement_by_string(&self, ip: &str, delta: i16) -> i16 {
        self.decrement(addr::ip_to_u32(ip), delta)
    }

    /// Parses `ip` and calls [`Context::delete`].
    pub fn delete_by_string(&self, ip: &str) {
        self.delete(addr::ip_to_u32(ip))
    }

    /// Applies `increment` to every `(ip, delta)` pair in order. Not atomic
    /// across keys — a concurrent reader may observe partial progress.
    /// Returns the number of pairs attempted (always `items.len()`).
    pub fn batch_increment(&self, items: &[(u32, i16)]) -> usize {
        for &(ip, delta) in items {
            self.increment(ip, delta);
        }
        items.len()
    }

    /// Zeros every stored score and clears every bitmap bit. Allocated
    /// blocks and directory rows remain allocated (§3's lifecycle rule:
    /// nothing is freed until the context itself is dropped).
    pub fn clear(&self) {
        self.directory.for_each_block(|idx16, idx24, block| {
            block.with_lock(|slots, active| {
                for slot in slots.iter() {
                    slot.store(0, Ordering::Release);
                }
                active.store(0, Ordering::Release);
            });
            self.bitmap.clear(prefix24_of(idx16, idx24));
            true
        });
        self.total_scores.store(0, Ordering::Relaxed);
    }

    /// Visits every non-zero `(ip, score)` pair in lexicographic
    /// `(/16, /24, host)` order, calling `f` for each. `f` returning
    /// `false` stops the walk early. Returns the number of pairs visited.
    ///
    /// Does not take any block's write lock, so it never blocks writers —
    /// but for the same reason it is not a consistent point-in-time
    /// snapshot under concurrent writes. Unrelated threads may call
    /// `foreach` (on this `Context` or any other) at the same time; only a
    /// call-stack-nested, same-thread re-entry into the same `Context` —
    /// `f` calling back into this `foreach` — is rejected, with
    /// [`Error::InvalidArgument`], to avoid deadlocking on the thread's own
    /// guard.
    pub fn foreach(&self, mut f: impl FnMut(u32, i16) -> bool) -> Result<u64> {
        let key = self as *const Context as usize;
        let inserted = ITERATING_CONTEXTS.with(|set| set.borrow_mut().insert(key));
        if !inserted {
            return Err(Error::InvalidArgument(
                "reentrant Context::foreach call".to_string(),
            ));
        }
        let _guard = IteratingGuard(key);

        let mut visited = 0u64;
        self.directory.for_each_block(|idx16, idx24, block| {
            for host in 0u8..=255u8 {
                let score = block.load(host);
                if score == 0 {
                    continue;
                }
                let key = ((idx16 as u32) << 16) | ((idx24 as u32) << 8) | host as u32;
                visited += 1;
                if !f(key, score) {
                    return false;
                }
            }
            true
        });
        Ok(visited)
    }

    /// Multiplies every non-zero score by `factor` (truncating toward
    /// zero), then zeros any result whose magnitude is at or below
    /// `deadzone`. Rejects `factor` outside `[0.0, 1.0]` with no effect.
    /// Returns a summary whose `modified_count` is the operation's
    /// documented return value.
    pub fn decay(&self, factor: f64, deadzone: i16) -> Result<DecayStats> {
        if !(0.0..=1.0).contains(&factor) {
            return Err(Error::InvalidArgument(format!(
                "decay factor {factor} is outside [0.0, 1.0]"
            )));
        }
        let deadzone = deadzone.unsigned_abs() as i32;
        let mut stats = DecayStats::default();
        self.directory.for_each_block(|idx16, idx24, block| {
            stats.blocks_visited += 1;
            let prefix24 = prefix24_of(idx16, idx24);
            if !self.bitmap.test(prefix24) {
                return true;
            }
            block.with_lock(|slots, active| {
                // Re-check under the lock: an unlocked `active_count()` read
                // here would race a concurrent writer that populates a slot
                // between the read and the bitmap clear below, durably
                // dropping that write from the bitmap's view.
                if active.load(Ordering::Acquire) == 0 {
                    self.bitmap.clear(prefix24);
                    stats.bits_cleared += 1;
                    return;
                }
                for slot in slots.iter() {
                    let old = slot.load(Ordering::Acquire);
                    if old == 0 {
                        continue;
                    }
                    let mut new = decay_truncate(old, factor);
                    if (new.abs() as i32) <= deadzone {
                        new = 0;
                    }
                    if new != old {
                        slot.store(new, Ordering::Release);
                        stats.slots_modified += 1;
                        if new == 0 {
                            active.fetch_sub(1, Ordering::AcqRel);
                            self.total_scores.fetch_sub(1, Ordering::Relaxed);
                        }
                    }
                }
                if active.load(Ordering::Acquire) == 0 {
                    self.bitmap.clear(prefix24);
                    stats.bits_cleared += 1;
                }
            });
            true
        });
        stats.modified_count = stats.slots_modified;
        log::info!(
            "decay(factor={factor}, deadzone={deadzone}) visited {} blocks, modified {} slots, cleared {} bitmap bits",
            stats.blocks_visited,
            stats.slots_modified,
            stats.bits_cleared,
        );
        Ok(stats)
    }

    /// Total number of non-zero scores across the whole store.
    pub fn count(&self) -> u64 {
        self.total_scores.load(Ordering::Relaxed)
    }

    /// Total number of allocated `/24` blocks.
    pub fn block_count(&self) -> usize {
        self.directory.block_count()
    }

    /// Approximate bytes accounted for by the bitmap and every allocated
    /// row and block.
    pub fn memory_usage(&self) -> usize {
        self.bitmap.memory_usage() + self.directory.memory_usage()
    }

    /// Saves every non-zero score to `path` via the atomic
    /// temp-file-then-rename protocol (see the `archive` module).
    pub fn save(&self, path: &Path) -> Result<()> {
        archive::save(self, path)
    }

    /// Replaces this context's contents with the archive at `path`: the
    /// store is cleared first, so a failure partway through leaves it
    /// empty rather than a mix of old and new data.
    pub fn load(&self, path: &Path) -> Result<()> {
        archive::load(self, path)
    }

    /// Bulk-loads the CSV mini-grammar from a file.
    pub fn bulk_load(&self, path: &Path) -> Result<LoadResult> {
        loader::load_file(self, path)
    }

    /// Bulk-loads the CSV mini-grammar from an in-memory buffer.
    pub fn bulk_load_buffer(&self, buf: &[u8]) -> Result<LoadResult> {
        loader::load_buffer(self, buf)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn prefix24_of(idx16: u16, idx24: u8) -> u32 {
    ((idx16 as u32) << 8) | idx24 as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_a_basic() {
        let ctx = Context::new();
        let ip = addr::ip_to_u32("192.168.1.100");
        assert_eq!(ctx.set(ip, 50), 0);
        assert_eq!(ctx.increment(ip, 10), 60);
        assert_eq!(ctx.decrement(ip, 20), 40);
        ctx.delete(ip);
        assert_eq!(ctx.get(ip), 0);
        assert_eq!(ctx.count(), 0);
    }

    #[test]
    fn scenario_b_saturation() {
        let ctx = Context::new();
        let a = addr::ip_to_u32("10.0.0.1");
        let b = addr::ip_to_u32("10.0.0.2");
        ctx.set(a, 32760);
        assert_eq!(ctx.increment(a, 100), 32767);
        ctx.set(b, -32760);
        assert_eq!(ctx.increment(b, -100), -32767);
    }

    #[test]
    fn scenario_c_decay_with_deadzone() {
        let ctx = Context::new();
        let ips: Vec<u32> = ["1.1.1.1", "1.1.1.2", "1.1.1.3", "1.1.1.4"]
            .iter()
            .map(|s| addr::ip_to_u32(s))
            .collect();
        let scores = [100, 50, 10, 5];
        for (ip, s) in ips.iter().zip(scores) {
            ctx.set(*ip, s);
        }
        let stats = ctx.decay(0.5, 10).unwrap();
        assert_eq!(ctx.get(ips[0]), 50);
        assert_eq!(ctx.get(ips[1]), 25);
        assert_eq!(ctx.get(ips[2]), 0);
        assert_eq!(ctx.get(ips[3]), 0);
        assert_eq!(stats.modified_count, 4);
    }

    #[test]
    fn decay_identity_modifies_nothing() {
        let ctx = Context::new();
        ctx.set(addr::ip_to_u32("1.2.3.4"), 77);
        let stats = ctx.decay(1.0, 0).unwrap();
        assert_eq!(stats.modified_count, 0);
        assert_eq!(ctx.get(addr::ip_to_u32("1.2.3.4")), 77);
    }

    #[test]
    fn decay_zero_factor_clears_everything() {
        let ctx = Context::new();
        ctx.set(addr::ip_to_u32("1.2.3.4"), 77);
        ctx.set(addr::ip_to_u32("5.6.7.8"), -5);
        let total = ctx.count();
        let stats = ctx.decay(0.0, 0).unwrap();
        assert_eq!(stats.modified_count, total);
        assert_eq!(ctx.count(), 0);
    }

    #[test]
    fn decay_rejects_out_of_range_factor() {
        let ctx = Context::new();
        assert!(ctx.decay(1.5, 0).is_err());
        assert!(ctx.decay(-0.1, 0).is_err());
    }

    #[test]
    fn increment_zero_delta_is_pure_read() {
        let ctx = Context::new();
        let ip = addr::ip_to_u32("9.9.9.9");
        assert_eq!(ctx.increment(ip, 0), 0);
        assert_eq!(ctx.block_count(), 0);
    }

    #[test]
    fn decrement_min_saturates() {
        let ctx = Context::new();
        let ip = addr::ip_to_u32("1.2.3.4");
        ctx.set(ip, 100);
        assert_eq!(ctx.decrement(ip, i16::MIN), 32767);
    }

    #[test]
    fn get_ex_distinguishes_absent_from_present() {
        let ctx = Context::new();
        let ip = addr::ip_to_u32("1.2.3.4");
        assert_eq!(ctx.get_ex(ip), None);
        ctx.set(ip, 5);
        assert_eq!(ctx.get_ex(ip), Some(5));
        ctx.set(ip, 0);
        assert_eq!(ctx.get_ex(ip), None);
    }

    #[test]
    fn clear_zeros_everything_but_keeps_blocks_allocated() {
        let ctx = Context::new();
        ctx.set(addr::ip_to_u32("1.2.3.4"), 5);
        ctx.set(addr::ip_to_u32("5.6.7.8"), -5);
        let blocks_before = ctx.block_count();
        ctx.clear();
        assert_eq!(ctx.count(), 0);
        assert_eq!(ctx.block_count(), blocks_before);
        assert_eq!(ctx.get(addr::ip_to_u32("1.2.3.4")), 0);
    }

    #[test]
    fn foreach_visits_in_order_and_counts() {
        let ctx = Context::new();
        ctx.set(addr::ip_to_u32("2.0.0.1"), 1);
        ctx.set(addr::ip_to_u32("1.0.0.2"), 2);
        ctx.set(addr::ip_to_u32("1.0.0.1"), 3);
        let mut seen = Vec::new();
        let visited = ctx
            .foreach(|ip, score| {
                seen.push((ip, score));
                true
            })
            .unwrap();
        assert_eq!(visited, 3);
        assert_eq!(
            seen,
            vec![
                (addr::ip_to_u32("1.0.0.1"), 3),
                (addr::ip_to_u32("1.0.0.2"), 2),
                (addr::ip_to_u32("2.0.0.1"), 1),
            ]
        );
    }

    #[test]
    fn foreach_stop_signal_halts_early() {
        let ctx = Context::new();
        ctx.set(addr::ip_to_u32("1.0.0.1"), 1);
        ctx.set(addr::ip_to_u32("1.0.0.2"), 2);
        let visited = ctx.foreach(|_, _| false).unwrap();
        assert_eq!(visited, 1);
    }

    #[test]
    fn bitmap_bit_survives_delete_until_decay() {
        let ctx = Context::new();
        let ip = addr::ip_to_u32("1.2.3.4");
        ctx.set(ip, 100);
        ctx.delete(ip);
        assert_eq!(ctx.get(ip), 0);
        ctx.decay(1.0, 0).unwrap();
        assert_eq!(ctx.get(ip), 0);
    }

    #[test]
    fn batch_increment_applies_every_pair() {
        let ctx = Context::new();
        let a = addr::ip_to_u32("1.1.1.1");
        let b = addr::ip_to_u32("2.2.2.2");
        let n = ctx.batch_increment(&[(a, 10), (b, -10)]);
        assert_eq!(n, 2);
        assert_eq!(ctx.get(a), 10);
        assert_eq!(ctx.get(b), -10);
    }

    #[test]
    fn by_string_variants_roundtrip() {
        let ctx = Context::new();
        ctx.set_by_string("192.168.1.1", 5);
        assert_eq!(ctx.get_by_string("192.168.1.1"), 5);
        assert_eq!(ctx.increment_by_string("192.168.1.1", 5), 10);
        assert_eq!(ctx.decrement_by_string("192.168.1.1", 3), 7);
        ctx.delete_by_string("192.168.1.1");
        assert_eq!(ctx.get_by_string("192.168.1.1"), 0);
    }

    #[test]
    fn by_string_invalid_ip_is_indistinguishable_from_zero() {
        let ctx = Context::new();
        assert_eq!(ctx.get_by_string("not an ip"), 0);
        assert_eq!(ctx.set_by_string("not an ip", 5), 0);
    }
}
