//! The binary persistence format and its atomic save/load protocol.
//!
//! On-disk layout (little-endian, fixed width, no padding):
//!
//! ```text
//! offset  width  field
//! 0       4 B    magic: b"SAUR"
//! 4       4 B    version (currently 1)
//! 8       8 B    entry_count
//! 16      6 B * entry_count   entries: u32 ip, i16 score
//! ```
//!
//! spec.md leaves the archive's endianness to the implementer; this
//! crate commits to little-endian on disk regardless of host architecture
//! so an archive written on one machine loads correctly on another.
//! Scores of zero are never written, matching the store's "zero is
//! absent" rule.
//!
//! Saving goes through a sibling temporary file (`<path>.tmp.<pid>`),
//! written then `rename`d over the target so a reader never observes a
//! partially written archive; the temp file is unlinked on any failure.

use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::context::Context;
use crate::error::{Error, Result};

const MAGIC: [u8; 4] = *b"SAUR";
const CURRENT_VERSION: u32 = 1;
const HEADER_LEN: u64 = 16;
const ENTRY_LEN: usize = 6;

/// The parsed fixed-size header of an archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub version: u32,
    pub entry_count: u64,
}

/// Writes every non-zero score in `ctx` to `path`, atomically.
pub fn save(ctx: &Context, path: &Path) -> Result<()> {
    let tmp_path = sibling_tmp_path(path);
    match save_to(ctx, &tmp_path) {
        Ok(entry_count) => match std::fs::rename(&tmp_path, path) {
            Ok(()) => {
                log::info!("saved {entry_count} entries to {}", path.display());
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "failed to rename archive temp file {} to {}: {e}",
                    tmp_path.display(),
                    path.display(),
                );
                let _ = std::fs::remove_file(&tmp_path);
                Err(e.into())
            }
        },
        Err(e) => {
            log::error!("failed to write archive temp file {}: {e}", tmp_path.display());
            let _ = std::fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

fn save_to(ctx: &Context, tmp_path: &Path) -> Result<u64> {
    let file = std::fs::File::create(tmp_path)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(&MAGIC)?;
    writer.write_all(&CURRENT_VERSION.to_le_bytes())?;
    writer.write_all(&0u64.to_le_bytes())?; // entry_count placeholder

    let batch_capacity = ctx.config().archive_batch_entries * ENTRY_LEN;
    let mut batch = Vec::with_capacity(batch_capacity);
    let mut entry_count: u64 = 0;
    let mut write_err: Option<std::io::Error> = None;

    ctx.foreach(|ip, score| {
        batch.extend_from_slice(&ip.to_le_bytes());
        batch.extend_from_slice(&score.to_le_bytes());
        entry_count += 1;
        if batch.len() >= batch_capacity {
            if let Err(e) = writer.write_all(&batch) {
                write_err = Some(e);
                return false;
            }
            batch.clear();
        }
        true
    })
    .map_err(|_| Error::InvalidArgument("archive save called reentrantly".to_string()))?;

    if let Some(e) = write_err {
        return Err(e.into());
    }
    writer.write_all(&batch)?;
    writer.flush()?;

    let mut file = writer.into_inner().map_err(|e| e.into_error())?;
    file.seek(SeekFrom::Start(8))?;
    file.write_all(&entry_count.to_le_bytes())?;
    file.sync_data()?;
    Ok(entry_count)
}

/// Reads the archive at `path`, replacing `ctx`'s entire contents (the
/// store is cleared before any entry is applied).
pub fn load(ctx: &Context, path: &Path) -> Result<()> {
    let file = std::fs::File::open(path).map_err(|e| {
        log::error!("failed to open archive {}: {e}", path.display());
        e
    })?;
    let mut reader = BufReader::new(file);

    let mut header_buf = [0u8; HEADER_LEN as usize];
    reader.read_exact(&mut header_buf)?;
    let header = parse_header(&header_buf).map_err(|e| {
        log::error!("archive {} has an invalid header: {e}", path.display());
        e
    })?;

    ctx.clear();

    let mut entry_buf = [0u8; ENTRY_LEN];
    for _ in 0..header.entry_count {
        if let Err(e) = reader.read_exact(&mut entry_buf) {
            log::error!(
                "archive {} ended early while reading its {} declared entries: {e}",
                path.display(),
                header.entry_count,
            );
            return Err(e.into());
        }
        let ip = u32::from_le_bytes(entry_buf[0..4].try_into().unwrap());
        let score = i16::from_le_bytes(entry_buf[4..6].try_into().unwrap());
        if score != 0 {
            ctx.set(ip, score);
        }
    }
    log::info!("loaded {} entries from {}", header.entry_count, path.display());
    Ok(())
}

/// Reads and validates just the header of the archive at `path`, without
/// touching any `Context`.
pub fn read_header(path: &Path) -> Result<ArchiveHeader> {
    let mut file = std::fs::File::open(path)?;
    let mut header_buf = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut header_buf)?;
    parse_header(&header_buf)
}

fn parse_header(buf: &[u8]) -> Result<ArchiveHeader> {
    if buf[0..4] != MAGIC {
        return Err(Error::InvalidArgument("bad archive magic".to_string()));
    }
    let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    if version == 0 || version > CURRENT_VERSION {
        return Err(Error::InvalidArgument(format!(
            "unsupported archive version {version}"
        )));
    }
    let entry_count = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    if entry_count > u32::MAX as u64 {
        return Err(Error::InvalidArgument(format!(
            "archive entry count {entry_count} exceeds the safety cap"
        )));
    }
    Ok(ArchiveHeader {
        version,
        entry_count,
    })
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();
    name.push(format!(".tmp.{}", std::process::id()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::ip_to_u32;

    #[test]
    fn scenario_e_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.bin");

        let ctx = Context::new();
        ctx.set(ip_to_u32("192.168.10.1"), 100);
        ctx.set(ip_to_u32("192.168.10.2"), -200);
        ctx.set(ip_to_u32("10.20.30.40"), 500);
        save(&ctx, &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"SAUR");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 1);
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 3);
        assert_eq!(bytes.len(), 16 + 3 * 6);

        let ctx2 = Context::new();
        load(&ctx2, &path).unwrap();
        assert_eq!(ctx2.count(), 3);
        assert_eq!(ctx2.get(ip_to_u32("192.168.10.1")), 100);
        assert_eq!(ctx2.get(ip_to_u32("192.168.10.2")), -200);
        assert_eq!(ctx2.get(ip_to_u32("10.20.30.40")), 500);
    }

    #[test]
    fn load_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, b"NOPE\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00").unwrap();
        let ctx = Context::new();
        assert!(load(&ctx, &path).is_err());
    }

    #[test]
    fn load_rejects_version_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v0.bin");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        let ctx = Context::new();
        assert!(load(&ctx, &path).is_err());
    }

    #[test]
    fn load_rejects_future_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v2.bin");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        let ctx = Context::new();
        assert!(load(&ctx, &path).is_err());
    }

    #[test]
    fn load_rejects_oversized_entry_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.bin");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&CURRENT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&((u32::MAX as u64) + 1).to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        let ctx = Context::new();
        assert!(load(&ctx, &path).is_err());
    }

    #[test]
    fn load_short_file_is_io_failure_and_leaves_store_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&CURRENT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&5u64.to_le_bytes()); // claims 5 entries, has 0
        std::fs::write(&path, bytes).unwrap();

        let ctx = Context::new();
        ctx.set(ip_to_u32("1.2.3.4"), 7);
        assert!(load(&ctx, &path).is_err());
        assert_eq!(ctx.count(), 0);
    }

    #[test]
    fn zero_scores_are_never_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zeros.bin");
        let ctx = Context::new();
        let ip = ip_to_u32("1.2.3.4");
        ctx.set(ip, 5);
        ctx.set(ip, 0); // equivalent to delete; active count back to 0
        save(&ctx, &path).unwrap();
        let header = read_header(&path).unwrap();
        assert_eq!(header.entry_count, 0);
    }

    #[test]
    fn save_cleans_up_temp_file_on_failure() {
        // A nonexistent parent directory makes `File::create` fail before
        // any temp file is written.
        let dir = tempfile::tempdir().unwrap();
        let bad_target = dir.path().join("no-such-subdir").join("archive.bin");
        let ctx = Context::new();
        assert!(save(&ctx, &bad_target).is_err());
        let tmp = sibling_tmp_path(&bad_target);
        assert!(!tmp.exists());
    }
}
