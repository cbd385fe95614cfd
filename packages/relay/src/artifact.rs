//! Content-addressed artifact store.
//!
//! ## File structure
//!
//! A two-level directory fan-out where each blob is named by the hex
//! encoded Blake3 hash of its content: `{root}/{hex[0..2]}/{hex}`. Blobs
//! over the chunk threshold are split into fixed-size chunks (each its own
//! blob) plus a manifest at `{root}/{hex[0..2]}/{hex}.manifest` listing the
//! chunk keys; fetching a chunked blob reassembles and re-verifies it.
//! Chunking is what makes transfers resumable: a client that already holds
//! some chunks only fetches the missing ones.
//!
//! ## Compression
//!
//! Blob content is transparently compressed with zstd. Users write
//! uncompressed bytes and read back the same bytes.
//!
//! ## Idempotency and atomicity
//!
//! Blobs are immutable and deduplicated by construction: a write of an
//! existing key is a no-op, and all writes go to a temp file first, are
//! hash-verified, then renamed into place.

use std::path::PathBuf;

use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::{Debug, Display};
use tokio::fs::{File, create_dir_all, metadata, remove_file, rename};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{instrument, trace, warn};
use uuid::Uuid;

use protocol::Key;
use protocol::wire::{Reader, Writer};

/// Blobs larger than this are stored chunked.
pub const CHUNK_THRESHOLD: usize = 1024 * 1024;
/// Size of each chunk of a chunked blob.
pub const CHUNK_SIZE: usize = 1024 * 1024;

const MANIFEST_MAGIC: &[u8; 4] = b"FMAN";

/// Disk-backed content-addressed store.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[debug("Store(root = {})", self.root.display())]
#[display("{}", root.display())]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Create a new instance rooted at the provided directory. The
    /// directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the blob file for a key: `root/ab/abcd…`.
    fn key_path(&self, key: &Key) -> PathBuf {
        let hex = key.to_hex();
        let prefix = hex.chars().take(2).collect::<String>();
        self.root.join(prefix).join(&hex)
    }

    fn manifest_path(&self, key: &Key) -> PathBuf {
        let mut path = self.key_path(key).into_os_string();
        path.push(".manifest");
        PathBuf::from(path)
    }

    /// Whether the store holds this blob (directly or chunked).
    #[instrument(name = "Store::exists")]
    pub async fn exists(&self, key: &Key) -> Result<bool> {
        for path in [self.key_path(key), self.manifest_path(key)] {
            match metadata(&path).await {
                Ok(_) => return Ok(true),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err).context(format!("stat {path:?}")),
            }
        }
        Ok(false)
    }

    /// Store content under its key.
    ///
    /// Returns `true` if newly written, `false` if it already existed.
    /// Errors when `key` does not match the content's hash.
    #[instrument(name = "Store::upload", skip(content))]
    pub async fn upload(&self, key: &Key, content: &[u8]) -> Result<bool> {
        if key != &blake3::hash(content) {
            bail!("content does not hash to {key}");
        }
        if self.exists(key).await? {
            return Ok(false);
        }
        if content.len() > CHUNK_THRESHOLD {
            return self.upload_chunked(key, content).await;
        }
        self.write_blob(&self.key_path(key), content).await?;
        Ok(true)
    }

    async fn upload_chunked(&self, key: &Key, content: &[u8]) -> Result<bool> {
        let mut chunks = Vec::with_capacity(content.len().div_ceil(CHUNK_SIZE));
        for chunk in content.chunks(CHUNK_SIZE) {
            let chunk_key = Key::from_buffer(chunk);
            if !self.exists(&chunk_key).await? {
                self.write_blob(&self.key_path(&chunk_key), chunk).await?;
            }
            chunks.push(chunk_key);
        }

        let mut w = Writer::new();
        w.put_u64(chunks.len() as u64);
        for chunk in &chunks {
            w.put_key(chunk);
        }
        let mut manifest = Vec::from(*MANIFEST_MAGIC);
        manifest.extend_from_slice(&w.into_bytes());
        self.write_raw(&self.manifest_path(key), &manifest).await?;
        trace!(%key, chunks = chunks.len(), "stored chunked blob");
        Ok(true)
    }

    /// The chunk list of a chunked blob, `None` when stored directly.
    #[instrument(name = "Store::manifest")]
    pub async fn manifest(&self, key: &Key) -> Result<Option<Vec<Key>>> {
        let path = self.manifest_path(key);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context(format!("read {path:?}")),
        };
        if content.len() < 4 || &content[0..4] != MANIFEST_MAGIC {
            bail!("manifest {path:?} has bad magic");
        }
        let mut r = Reader::new(&content[4..]);
        let count = r.u64()? as usize;
        let mut chunks = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            chunks.push(r.key()?);
        }
        Ok(Some(chunks))
    }

    /// Read a blob back, reassembling chunks when necessary.
    #[instrument(name = "Store::fetch")]
    pub async fn fetch(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        if let Some(chunks) = self.manifest(key).await? {
            let mut content = Vec::new();
            for chunk in &chunks {
                let Some(bytes) = self.read_blob(&self.key_path(chunk)).await? else {
                    bail!("chunk {chunk} of {key} is missing");
                };
                content.extend_from_slice(&bytes);
            }
            if key != &blake3::hash(&content) {
                bail!("reassembled blob does not hash to {key}");
            }
            return Ok(Some(content));
        }
        self.read_blob(&self.key_path(key)).await
    }

    async fn read_blob(&self, path: &PathBuf) -> Result<Option<Vec<u8>>> {
        match File::open(path).await {
            Ok(file) => {
                let mut decoder = ZstdDecoder::new(BufReader::new(file));
                let mut content = Vec::new();
                decoder
                    .read_to_end(&mut content)
                    .await
                    .with_context(|| format!("decompress {path:?}"))?;
                Ok(Some(content))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(format!("open {path:?}")),
        }
    }

    /// zstd-compress and atomically write a blob.
    async fn write_blob(&self, path: &PathBuf, content: &[u8]) -> Result<()> {
        let mut encoder = ZstdEncoder::new(std::io::Cursor::new(Vec::new()));
        encoder.write_all(content).await.context("compress blob")?;
        encoder.shutdown().await.context("finish zstd frame")?;
        let compressed = encoder.into_inner().into_inner();
        self.write_raw(path, &compressed).await
    }

    /// Atomically write raw bytes via temp-file-then-rename.
    async fn write_raw(&self, path: &PathBuf, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .await
                .with_context(|| format!("create {parent:?}"))?;
        }
        let mut temp = path.as_os_str().to_owned();
        temp.push(".tmp.");
        temp.push(Uuid::new_v4().to_string());
        let temp = PathBuf::from(temp);

        tokio::fs::write(&temp, content)
            .await
            .with_context(|| format!("write {temp:?}"))?;
        match rename(&temp, path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Err(err) = remove_file(&temp).await {
                    warn!(?temp, %err, "failed to remove temp file");
                }
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    Ok(())
                } else {
                    Err(err).context(format!("rename {temp:?} to {path:?}"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn small_blob_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let content = b"hello artifacts";
        let key = Key::from_buffer(content);

        assert!(store.upload(&key, content).await.unwrap());
        assert!(!store.upload(&key, content).await.unwrap());
        assert_eq!(store.fetch(&key).await.unwrap().unwrap(), content);
        assert!(store.manifest(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let key = Key::from_buffer(b"other content");
        assert!(store.upload(&key, b"content").await.is_err());
    }

    #[tokio::test]
    async fn missing_blob_fetches_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let key = Key::from_buffer(b"never stored");
        assert!(store.fetch(&key).await.unwrap().is_none());
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn large_blob_chunks_and_reassembles() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        // 2.5 MiB of varied bytes: three chunks.
        let content: Vec<u8> = (0..(5 * CHUNK_SIZE / 2)).map(|i| (i % 251) as u8).collect();
        let key = Key::from_buffer(&content);

        assert!(store.upload(&key, &content).await.unwrap());
        let chunks = store.manifest(&key).await.unwrap().unwrap();
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(store.exists(chunk).await.unwrap());
        }
        assert_eq!(store.fetch(&key).await.unwrap().unwrap(), content);
    }

    #[tokio::test]
    async fn identical_chunks_deduplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        // Two chunk-sized repeats plus a tail: the repeated chunk stores
        // once.
        let mut content = vec![7u8; CHUNK_SIZE * 2];
        content.extend_from_slice(b"tail");
        let key = Key::from_buffer(&content);

        store.upload(&key, &content).await.unwrap();
        let chunks = store.manifest(&key).await.unwrap().unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], chunks[1]);
    }
}
