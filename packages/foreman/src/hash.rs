//! File fingerprinting.
//!
//! Two fingerprint kinds per file:
//!
//! - A [`MetaStamp`]: a stable hash of `(size, mtime_ns, inode, device,
//!   symlink bit, path)`. Nanoseconds to compute, never authoritative.
//! - A content [`Key`]: Blake3 over the file bytes. Authoritative.
//!
//! Cache validation runs the two-tier check: metadata first, content only
//! when the metadata stamp differs. Touch-only modifications therefore cost
//! one `stat`; real edits additionally cost one content hash.

use std::hash::{Hash, Hasher};
use std::path::Path;

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use rustc_stable_hash::StableSipHasher128;
use serde::{Deserialize, Serialize};
use tap::Pipe as _;
use tokio::io::AsyncReadExt;
use tracing::{instrument, trace};

pub use protocol::Key;

/// Buffer size for streaming content hashes. Large enough that Blake3 can
/// use its SIMD paths on each chunk.
const HASH_BUF_SIZE: usize = 64 * 1024;

/// The fast, fallible metadata fingerprint of a file.
///
/// Equal stamps mean "almost certainly unchanged"; unequal stamps mean
/// nothing until the content hash is consulted.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("{_0:016x}")]
pub struct MetaStamp(pub u64);

impl MetaStamp {
    /// Stat the file and stamp its metadata.
    ///
    /// Symlinks are stamped without following, so replacing a symlink target
    /// path changes the stamp.
    #[instrument]
    pub async fn of_file(path: &Path) -> Result<Self> {
        let meta = tokio::fs::symlink_metadata(path)
            .await
            .with_context(|| format!("stat {path:?}"))?;

        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        #[cfg(unix)]
        let (inode, device) = {
            use std::os::unix::fs::MetadataExt;
            (meta.ino(), meta.dev())
        };
        #[cfg(not(unix))]
        let (inode, device) = (0u64, 0u64);

        let mut hasher = StableSipHasher128::new();
        meta.len().hash(&mut hasher);
        mtime_ns.hash(&mut hasher);
        inode.hash(&mut hasher);
        device.hash(&mut hasher);
        meta.file_type().is_symlink().hash(&mut hasher);
        path.to_string_lossy().hash(&mut hasher);
        let stamp = Self(Hasher::finish(&hasher));
        trace!(?path, %stamp, "stamped metadata");
        Ok(stamp)
    }
}

/// Compute the authoritative content fingerprint of a file.
#[instrument]
pub async fn content_key(path: &Path) -> Result<Key> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {path:?}"))?;
    let mut reader = tokio::io::BufReader::with_capacity(HASH_BUF_SIZE, file);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .with_context(|| format!("read {path:?}"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    hasher.finalize().pipe(Key::from_blake3).pipe(Ok)
}

/// Sampled fingerprint for very large files: header, `windows` equally
/// spaced windows, and tail, each `window_len` bytes, mixed with the file
/// length.
///
/// This is NOT safe for cache correctness: edits between windows go
/// undetected. It exists for advisory uses (progress estimation, duplicate
/// detection heuristics) and must be opted into explicitly per call site.
/// Cache validation never calls it.
#[instrument]
pub async fn sampled_key(path: &Path, windows: u32, window_len: usize) -> Result<Key> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {path:?}"))?;
    let len = file
        .metadata()
        .await
        .with_context(|| format!("stat {path:?}"))?
        .len();

    async fn read_window(
        file: &mut tokio::fs::File,
        offset: u64,
        buffer: &mut [u8],
        hasher: &mut blake3::Hasher,
    ) -> Result<()> {
        use tokio::io::{AsyncSeekExt, SeekFrom};
        file.seek(SeekFrom::Start(offset)).await.context("seek")?;
        let mut filled = 0;
        while filled < buffer.len() {
            let n = file.read(&mut buffer[filled..]).await.context("read window")?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        hasher.update(&offset.to_le_bytes());
        hasher.update(&buffer[..filled]);
        Ok(())
    }

    let mut hasher = blake3::Hasher::new();
    hasher.update(&len.to_le_bytes());
    let mut buffer = vec![0u8; window_len];

    // Header.
    read_window(&mut file, 0, &mut buffer, &mut hasher).await?;
    // Equally spaced interior windows.
    if len > window_len as u64 && windows > 0 {
        let stride = len / u64::from(windows + 1);
        for i in 1..=u64::from(windows) {
            read_window(&mut file, i * stride, &mut buffer, &mut hasher).await?;
        }
    }
    // Tail.
    let tail_start = len.saturating_sub(window_len as u64);
    read_window(&mut file, tail_start, &mut buffer, &mut hasher).await?;

    hasher.finalize().pipe(Key::from_blake3).pipe(Ok)
}

/// Stable (cross-run, cross-host) hash of an arbitrary `Hash` value.
///
/// Used for graph structural hashes and action input hashes, where we need
/// determinism that `DefaultHasher` does not promise.
pub fn stable_hash(value: impl Hash) -> u64 {
    let mut hasher = StableSipHasher128::new();
    value.hash(&mut hasher);
    Hasher::finish(&hasher)
}
