//! A concurrent, in-memory risk/threat scoring store keyed by IPv4 address.
//!
//! `ip-score-store` is built for security-analytics pipelines that keep a
//! per-IP score (e.g. a threat or reputation score) updated from event
//! streams and threat-intel feeds, queried on every incoming event, decayed
//! periodically, and persisted across restarts. The expected workload is
//! hundreds of millions of reads per second against a sparse key space with
//! a high fraction of "not present" lookups, so the read path never takes a
//! lock: a dense bitmap pre-filter at /24 granularity turns the common case
//! into a single atomic load plus a handful of pointer chases.
//!
//! # Design constraints
//!
//! - Reads never block. Writes take a lock scoped to a single /24 block
//!   (256 hosts); concurrent writers to different blocks never contend.
//! - Scores are bounded, saturating `i16`s in `[-32767, 32767]`; there is no
//!   separate "present but zero" state — storing zero is equivalent to
//!   deleting for the purposes of the active-slot count.
//! - Only IPv4 is supported. No CIDR aggregation, no distributed sharding,
//!   no per-key TTLs, no transactional multi-key updates. See the crate's
//!   design notes for the full non-goal list.
//! - Persistence is a flat binary archive (see [`archive`]) written via the
//!   temp-file-then-rename pattern so a reader never observes a partial
//!   file.
//!
//! # Example
//!
//! ```
//! use ip_score_store::Context;
//!
//! let ctx = Context::new();
//! ctx.set(0xC0A80101, 50); // 192.168.1.1
//! assert_eq!(ctx.increment(0xC0A80101, 10), 60);
//! assert_eq!(ctx.get(0xC0A80101), 60);
//! ```

mod addr;
mod archive;
mod bitmap;
mod block;
mod config;
mod context;
mod directory;
mod error;
mod loader;
mod lock;
mod score;

pub use addr::{ip_to_u32, u32_to_ip, u32_to_ip_safe, Addr};
pub use archive::ArchiveHeader;
pub use config::StoreConfig;
pub use context::{Context, DecayStats};
pub use error::{Error, ErrorCode, Result};
pub use loader::LoadResult;
pub use score::{MAX_SCORE, MIN_SCORE};

/// Returns this crate's semantic version string.
///
/// Mirrors the `version` entry of the embedder-facing operation surface:
/// a stable, allocation-free way for a caller to log or report which
/// build of the scoring engine it is linked against.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
