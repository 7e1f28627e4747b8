//! Construction-time configuration.
//!
//! Everything here is deliberately *not* about the score range or CIDR
//! granularity (spec.md rules dynamic score-range configuration out as a
//! non-goal) — it's the handful of ambient knobs that don't change the
//! store's observable semantics: which archive format version to write,
//! and the batching size used while streaming an archive to disk.

/// Options controlling archive writes and other ambient behavior.
///
/// The block-write-lock backend (spinlock vs. adaptive mutex) is a
/// compile-time choice made via Cargo features (see [`crate::lock`]), not
/// a runtime option here, since it affects the memory layout of every
/// block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Number of entries buffered in memory before each write() syscall
    /// during archive save. spec.md §4.7 calls for 4096.
    pub archive_batch_entries: usize,
}

impl StoreConfig {
    pub const DEFAULT_ARCHIVE_BATCH_ENTRIES: usize = 4096;
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            archive_batch_entries: Self::DEFAULT_ARCHIVE_BATCH_ENTRIES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_batch_size() {
        assert_eq!(StoreConfig::default().archive_batch_entries, 4096);
    }
}
