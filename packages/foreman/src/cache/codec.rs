//! Binary on-disk format shared by the target and action caches.
//!
//! Layout: `[magic: 4 bytes][schema_version: 4 bytes LE][entry_count:
//! varint][entries…]` where each entry is `[body_len: varint][body]`.
//! Bodies are self-delimited, so readers skip trailing bytes they do not
//! understand (fields may be appended in future schema versions). A file
//! with mismatched magic or an unsupported schema version is discarded
//! wholesale; the cache then starts empty, which is always safe.

use std::path::Path;

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tracing::{instrument, warn};

use protocol::wire::{Reader, Writer};

pub(crate) const SCHEMA_VERSION: u32 = 1;

/// An entry that can encode itself into a store file body.
pub(crate) trait BinaryEntry: Sized {
    fn encode(&self, w: &mut Writer);
    fn decode(r: &mut Reader<'_>) -> Result<Self>;
}

/// Serialize entries to `path` atomically (temp file, then rename).
#[instrument(skip(entries))]
pub(crate) fn write_file<'a, E>(
    path: &Path,
    magic: &[u8; 4],
    entries: impl ExactSizeIterator<Item = &'a E>,
) -> Result<()>
where
    E: BinaryEntry + 'a,
{
    let mut w = Writer::new();
    w.put_u64(entries.len() as u64);
    for entry in entries {
        let mut body = Writer::new();
        entry.encode(&mut body);
        w.put_bytes(&body.into_bytes());
    }

    let mut content = Vec::with_capacity(8 + w.len());
    content.extend_from_slice(magic);
    content.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
    content.extend_from_slice(&w.into_bytes());

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {parent:?}"))?;
    }
    let temp = path.with_extension("bin.tmp");
    std::fs::write(&temp, &content).with_context(|| format!("write {temp:?}"))?;
    std::fs::rename(&temp, path).with_context(|| format!("rename {temp:?} to {path:?}"))?;
    Ok(())
}

/// Deserialize entries from `path`.
///
/// Missing files, foreign magic, and unsupported versions all yield an
/// empty store; a truncated file mid-entry is an error (the caller discards
/// and rebuilds).
#[instrument]
pub(crate) fn read_file<E>(path: &Path, magic: &[u8; 4]) -> Result<Vec<E>>
where
    E: BinaryEntry,
{
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).context(format!("read {path:?}")),
    };
    if content.len() < 8 || &content[0..4] != magic {
        warn!(?path, "cache file has unknown magic; discarding");
        return Ok(Vec::new());
    }
    let version = u32::from_le_bytes([content[4], content[5], content[6], content[7]]);
    if version > SCHEMA_VERSION {
        warn!(?path, version, "cache file from a newer schema; discarding");
        return Ok(Vec::new());
    }

    let mut r = Reader::new(&content[8..]);
    let count = r.u64()? as usize;
    let mut entries = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
        let body = r.bytes()?;
        let mut body_reader = Reader::new(&body);
        entries.push(E::decode(&mut body_reader)?);
        // Trailing bytes within the body are fields from a future minor
        // revision; skipping them is the forward-compatibility contract.
    }
    if r.remaining() != 0 {
        bail!("cache file {path:?} has {} trailing bytes", r.remaining());
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Clone, PartialEq, Eq, Debug)]
    struct Probe {
        name: String,
        value: u64,
    }

    impl BinaryEntry for Probe {
        fn encode(&self, w: &mut Writer) {
            w.put_str(&self.name);
            w.put_u64(self.value);
        }

        fn decode(r: &mut Reader<'_>) -> Result<Self> {
            Ok(Self {
                name: r.str()?,
                value: r.u64()?,
            })
        }
    }

    const MAGIC: &[u8; 4] = b"TST1";

    #[test]
    fn round_trip_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let entries = vec![
            Probe {
                name: "a".into(),
                value: 1,
            },
            Probe {
                name: "b".into(),
                value: u64::MAX,
            },
        ];
        write_file(&path, MAGIC, entries.iter()).unwrap();
        let loaded: Vec<Probe> = read_file(&path, MAGIC).unwrap();
        assert_eq!(loaded, entries);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Vec<Probe> = read_file(&dir.path().join("absent.bin"), MAGIC).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn foreign_magic_discards() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        std::fs::write(&path, b"XXXX\x01\x00\x00\x00\x00").unwrap();
        let loaded: Vec<Probe> = read_file(&path, MAGIC).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn entries_tolerate_trailing_fields() {
        // Simulate a future writer that appends a field to each body.
        #[derive(Clone)]
        struct FutureProbe {
            name: String,
            value: u64,
            extra: String,
        }
        impl BinaryEntry for FutureProbe {
            fn encode(&self, w: &mut Writer) {
                w.put_str(&self.name);
                w.put_u64(self.value);
                w.put_str(&self.extra);
            }
            fn decode(_: &mut Reader<'_>) -> Result<Self> {
                unreachable!("write-only in this test")
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let future = vec![FutureProbe {
            name: "a".into(),
            value: 7,
            extra: "new-field".into(),
        }];
        write_file(&path, MAGIC, future.iter()).unwrap();

        let loaded: Vec<Probe> = read_file(&path, MAGIC).unwrap();
        assert_eq!(
            loaded,
            vec![Probe {
                name: "a".into(),
                value: 7
            }]
        );
    }
}
