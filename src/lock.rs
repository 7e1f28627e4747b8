//! The block write-lock primitive.
//!
//! spec.md models this as "a capability set {lock, unlock, init, destroy}
//! chosen at build time", so the rest of the core talks to the block's
//! lock purely through the [`BlockLock`] trait and never sees which
//! backend is active. Two backends are available, selected by Cargo
//! feature (see the crate's `[features]` table):
//!
//! - `lock-spin` (default): a hand-rolled test-and-test-and-set spinlock.
//! - `lock-parking-lot`: `parking_lot::Mutex`, which spins briefly before
//!   parking the thread — the "adaptive mutex" spec.md calls for as a
//!   substitute on virtualized hosts where holding a pure spinlock across
//!   a preemption is costly.

/// A mutual-exclusion primitive guarding exactly one /24 block.
pub trait BlockLock: Default {
    /// Acquires the lock, blocking (by spinning or parking) until held.
    fn lock(&self);
    /// Releases a previously acquired lock.
    ///
    /// # Safety
    /// Must only be called by the thread that currently holds the lock.
    fn unlock(&self);
}

#[cfg(feature = "lock-spin")]
pub use spin_lock::SpinLock as DefaultLock;

#[cfg(all(feature = "lock-parking-lot", not(feature = "lock-spin")))]
pub use parking_lot_backend::AdaptiveLock as DefaultLock;

#[cfg(feature = "lock-spin")]
mod spin_lock {
    use super::BlockLock;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A test-and-test-and-set spinlock.
    ///
    /// Checks the flag with a relaxed load before attempting the
    /// compare-exchange, so spinning readers of the flag don't all hammer
    /// the cache line with failed exclusive-access RMWs.
    #[derive(Default)]
    pub struct SpinLock {
        locked: AtomicBool,
    }

    impl BlockLock for SpinLock {
        fn lock(&self) {
            loop {
                if !self.locked.load(Ordering::Relaxed)
                    && self
                        .locked
                        .compare_exchange_weak(
                            false,
                            true,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                {
                    return;
                }
                std::hint::spin_loop();
            }
        }

        fn unlock(&self) {
            self.locked.store(false, Ordering::Release);
        }
    }
}

#[cfg(feature = "lock-parking-lot")]
mod parking_lot_backend {
    use super::BlockLock;
    use parking_lot::Mutex;

    /// Wraps `parking_lot::Mutex<()>` to implement [`BlockLock`].
    ///
    /// `parking_lot`'s mutex already spins a bounded number of times before
    /// parking the thread via the OS, which is exactly the "spin, then
    /// fall back" adaptive behavior spec.md asks for.
    #[derive(Default)]
    pub struct AdaptiveLock {
        inner: Mutex<()>,
    }

    impl BlockLock for AdaptiveLock {
        fn lock(&self) {
            std::mem::forget(self.inner.lock());
        }

        fn unlock(&self) {
            // Safety: paired 1:1 with the `forget`-ed guard created in
            // `lock`, by the same caller discipline every other BlockLock
            // backend relies on (lock/unlock called by the same thread,
            // in order, never re-entrantly).
            unsafe {
                self.inner.force_unlock();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lock_round_trips() {
        let lock = DefaultLock::default();
        lock.lock();
        lock.unlock();
        lock.lock();
        lock.unlock();
    }
}
