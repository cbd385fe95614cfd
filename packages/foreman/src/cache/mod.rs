//! The build cache: target-level and action-level stores.
//!
//! Both stores buffer updates in memory and flush once, at close, to a
//! magic-prefixed binary file (see [`codec`]). Flushes are atomic
//! (temp-file-then-rename). Eviction runs at flush with a hybrid policy:
//! drop entries past the age limit, then least-recently-accessed entries
//! past the count limit, then least-recently-accessed entries past the
//! size limit.
//!
//! ## Not a security boundary
//!
//! The cache detects change, it does not authenticate content. Between a
//! hit test and the consumer reading the file, the file may change
//! (TOCTOU); that is acceptable for a build system and out of the threat
//! model here.

mod codec;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use color_eyre::{Result, eyre::Context as _};
use dashmap::DashMap;
use derive_more::Display;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use protocol::wire::{Reader, Writer};

use self::codec::BinaryEntry;
use crate::context::Counters;
use crate::error::{EngineError, EngineResult};
use crate::hash::{Key, MetaStamp, content_key};
use crate::target::{Language, Target, TargetId};

const TARGET_MAGIC: &[u8; 4] = b"FMTC";
const ACTION_MAGIC: &[u8; 4] = b"FMAC";

/// Eviction thresholds, all applied at flush.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct CacheLimits {
    pub max_age_days: u64,
    pub max_entries: usize,
    pub max_size_bytes: u64,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            max_entries: 10_000,
            max_size_bytes: 1 << 30,
        }
    }
}

/// A cached build of one target.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CacheEntry {
    pub target_id: TargetId,
    /// Strong fingerprint of the produced output.
    pub build_hash: Key,
    pub source_content_hashes: BTreeMap<PathBuf, Key>,
    pub source_metadata_hashes: BTreeMap<PathBuf, MetaStamp>,
    pub dep_build_hashes: BTreeMap<TargetId, Key>,
    pub created_at: Timestamp,
    pub last_access_at: Timestamp,
    pub estimated_size: u64,
}

impl CacheEntry {
    pub fn new(target_id: TargetId, build_hash: Key) -> Self {
        let now = Timestamp::now();
        Self {
            target_id,
            build_hash,
            source_content_hashes: BTreeMap::new(),
            source_metadata_hashes: BTreeMap::new(),
            dep_build_hashes: BTreeMap::new(),
            created_at: now,
            last_access_at: now,
            estimated_size: 0,
        }
    }
}

impl BinaryEntry for CacheEntry {
    fn encode(&self, w: &mut Writer) {
        w.put_str(self.target_id.as_str());
        w.put_key(&self.build_hash);
        w.put_u64(self.source_content_hashes.len() as u64);
        for (path, key) in &self.source_content_hashes {
            w.put_str(&path.to_string_lossy());
            w.put_key(key);
        }
        w.put_u64(self.source_metadata_hashes.len() as u64);
        for (path, stamp) in &self.source_metadata_hashes {
            w.put_str(&path.to_string_lossy());
            w.put_u64(stamp.0);
        }
        w.put_u64(self.dep_build_hashes.len() as u64);
        for (id, key) in &self.dep_build_hashes {
            w.put_str(id.as_str());
            w.put_key(key);
        }
        w.put_i64(self.created_at.as_millisecond());
        w.put_i64(self.last_access_at.as_millisecond());
        w.put_u64(self.estimated_size);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let target_id = TargetId::new(r.str()?);
        let build_hash = r.key()?;
        let mut source_content_hashes = BTreeMap::new();
        for _ in 0..r.u64()? {
            let path = PathBuf::from(r.str()?);
            source_content_hashes.insert(path, r.key()?);
        }
        let mut source_metadata_hashes = BTreeMap::new();
        for _ in 0..r.u64()? {
            let path = PathBuf::from(r.str()?);
            source_metadata_hashes.insert(path, MetaStamp(r.u64()?));
        }
        let mut dep_build_hashes = BTreeMap::new();
        for _ in 0..r.u64()? {
            let id = TargetId::new(r.str()?);
            dep_build_hashes.insert(id, r.key()?);
        }
        Ok(Self {
            target_id,
            build_hash,
            source_content_hashes,
            source_metadata_hashes,
            dep_build_hashes,
            created_at: Timestamp::from_millisecond(r.i64()?).context("decode created_at")?,
            last_access_at: Timestamp::from_millisecond(r.i64()?)
                .context("decode last_access_at")?,
            estimated_size: r.u64()?,
        })
    }
}

/// What a fine-grained action did, for [`ActionId`] partitioning.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize,
)]
pub enum ActionKind {
    Compile,
    Link,
    Package,
    Custom,
}

impl ActionKind {
    fn code(self) -> u8 {
        match self {
            ActionKind::Compile => 0,
            ActionKind::Link => 1,
            ActionKind::Package => 2,
            ActionKind::Custom => 3,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => ActionKind::Compile,
            1 => ActionKind::Link,
            2 => ActionKind::Package,
            3 => ActionKind::Custom,
            other => color_eyre::eyre::bail!("unknown action kind {other}"),
        })
    }
}

/// Identity of a fine-grained cached operation.
///
/// `input_hash` is a deterministic function of the byte contents of the
/// input paths and the sorted metadata, so two identical operations on
/// identical inputs share an id regardless of host or run.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ActionId {
    pub target_id: TargetId,
    pub kind: ActionKind,
    pub sub_id: String,
    pub input_hash: Key,
}

impl ActionId {
    /// Hash inputs and metadata into an action id.
    #[instrument(skip(metadata))]
    pub async fn compute(
        target_id: TargetId,
        kind: ActionKind,
        sub_id: impl Into<String> + std::fmt::Debug,
        input_paths: &[PathBuf],
        metadata: &BTreeMap<String, String>,
    ) -> EngineResult<Self> {
        let mut fields: Vec<Vec<u8>> = Vec::with_capacity(input_paths.len() + metadata.len() * 2);
        for path in input_paths {
            let key = content_key(path).await.map_err(|err| {
                EngineError::from(err).frame(format!("hashing action input {path:?}"))
            })?;
            fields.push(key.as_bytes().to_vec());
        }
        for (k, v) in metadata {
            fields.push(k.as_bytes().to_vec());
            fields.push(v.as_bytes().to_vec());
        }
        Ok(Self {
            target_id,
            kind,
            sub_id: sub_id.into(),
            input_hash: Key::from_fields(fields),
        })
    }
}

/// A cached fine-grained operation: one compile, one archive, one link.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ActionCacheEntry {
    pub action_id: ActionId,
    pub input_paths: Vec<PathBuf>,
    pub output_paths: Vec<PathBuf>,
    /// Toolchain version, flags, and similar non-path inputs.
    pub metadata: BTreeMap<String, String>,
    pub success: bool,
    pub output_hash: Key,
    pub created_at: Timestamp,
    pub last_access_at: Timestamp,
    pub estimated_size: u64,
}

impl BinaryEntry for ActionCacheEntry {
    fn encode(&self, w: &mut Writer) {
        w.put_str(self.action_id.target_id.as_str());
        w.put_u8(self.action_id.kind.code());
        w.put_str(&self.action_id.sub_id);
        w.put_key(&self.action_id.input_hash);
        w.put_u64(self.input_paths.len() as u64);
        for path in &self.input_paths {
            w.put_str(&path.to_string_lossy());
        }
        w.put_u64(self.output_paths.len() as u64);
        for path in &self.output_paths {
            w.put_str(&path.to_string_lossy());
        }
        w.put_u64(self.metadata.len() as u64);
        for (k, v) in &self.metadata {
            w.put_str(k);
            w.put_str(v);
        }
        w.put_bool(self.success);
        w.put_key(&self.output_hash);
        w.put_i64(self.created_at.as_millisecond());
        w.put_i64(self.last_access_at.as_millisecond());
        w.put_u64(self.estimated_size);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let action_id = ActionId {
            target_id: TargetId::new(r.str()?),
            kind: ActionKind::from_code(r.u8()?)?,
            sub_id: r.str()?,
            input_hash: r.key()?,
        };
        let mut input_paths = Vec::new();
        for _ in 0..r.u64()? {
            input_paths.push(PathBuf::from(r.str()?));
        }
        let mut output_paths = Vec::new();
        for _ in 0..r.u64()? {
            output_paths.push(PathBuf::from(r.str()?));
        }
        let mut metadata = BTreeMap::new();
        for _ in 0..r.u64()? {
            let k = r.str()?;
            let v = r.str()?;
            metadata.insert(k, v);
        }
        Ok(Self {
            action_id,
            input_paths,
            output_paths,
            metadata,
            success: r.bool()?,
            output_hash: r.key()?,
            created_at: Timestamp::from_millisecond(r.i64()?).context("decode created_at")?,
            last_access_at: Timestamp::from_millisecond(r.i64()?)
                .context("decode last_access_at")?,
            estimated_size: r.u64()?,
        })
    }
}

struct StoreState<K, E> {
    entries: BTreeMap<K, E>,
    dirty: bool,
    closed: bool,
}

/// The outcome of a two-tier source check, for accounting.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum TierMatch {
    Metadata,
    Content,
    Changed,
    Missing,
}

/// The target-level cache: `TargetId → CacheEntry`, persisted at
/// `<cache_dir>/cache.bin`.
pub struct TargetCache {
    path: PathBuf,
    limits: CacheLimits,
    counters: Arc<Counters>,
    state: RwLock<StoreState<TargetId, CacheEntry>>,
}

impl TargetCache {
    /// Open the store, loading any previously flushed state. A corrupt
    /// file is discarded with a warning and the store starts empty.
    #[instrument(skip(counters))]
    pub fn open(path: &Path, limits: CacheLimits, counters: Arc<Counters>) -> Result<Self> {
        let entries = match codec::read_file::<CacheEntry>(path, TARGET_MAGIC) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(?path, %err, "discarding corrupt target cache");
                Vec::new()
            }
        };
        let entries: BTreeMap<TargetId, CacheEntry> = entries
            .into_iter()
            .map(|entry| (entry.target_id.clone(), entry))
            .collect();
        debug!(?path, entries = entries.len(), "opened target cache");
        Ok(Self {
            path: path.to_path_buf(),
            limits,
            counters,
            state: RwLock::new(StoreState {
                entries,
                dirty: false,
                closed: false,
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.state.read().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry(&self, id: &TargetId) -> Option<CacheEntry> {
        self.state
            .read()
            .expect("cache lock poisoned")
            .entries
            .get(id)
            .cloned()
    }

    /// The recorded output hash for a target, if cached.
    pub fn build_hash(&self, id: &TargetId) -> Option<Key> {
        self.entry(id).map(|entry| entry.build_hash)
    }

    /// The cache hit test.
    ///
    /// True iff an entry exists, every source passes the two-tier check,
    /// and every declared dependency's current build hash matches the
    /// recorded one. A hit refreshes `last_access_at` (and any metadata
    /// stamps that aliased, so the next check takes the fast path).
    #[instrument(skip(self, target, dep_hashes), fields(target = %target.id))]
    pub async fn is_cached(
        &self,
        target: &Target,
        dep_hashes: &BTreeMap<TargetId, Key>,
    ) -> EngineResult<bool> {
        let Some(entry) = self.entry(&target.id) else {
            self.counters.bump_cache_miss();
            return Ok(false);
        };

        // Dependency hashes must match exactly.
        if entry.dep_build_hashes.len() != target.deps.len() {
            self.counters.bump_cache_miss();
            return Ok(false);
        }
        for dep in &target.deps {
            let current = dep_hashes.get(dep);
            if current.is_none() || current != entry.dep_build_hashes.get(dep) {
                trace!(%dep, "dependency hash mismatch");
                self.counters.bump_cache_miss();
                return Ok(false);
            }
        }

        // Two-tier source check.
        let mut refreshed_stamps: BTreeMap<PathBuf, MetaStamp> = BTreeMap::new();
        for source in &target.sources {
            match self.check_source(&entry, source).await {
                TierMatch::Metadata => {}
                TierMatch::Content => {
                    // Content matched but the stamp aliased (touch-only
                    // modification); refresh it for next time.
                    if let Ok(stamp) = MetaStamp::of_file(source).await {
                        refreshed_stamps.insert(source.clone(), stamp);
                    }
                }
                TierMatch::Changed | TierMatch::Missing => {
                    self.counters.bump_cache_miss();
                    return Ok(false);
                }
            }
        }

        let mut state = self.state.write().expect("cache lock poisoned");
        if let Some(entry) = state.entries.get_mut(&target.id) {
            entry.last_access_at = Timestamp::now();
            entry.source_metadata_hashes.extend(refreshed_stamps);
        }
        state.dirty = true;
        drop(state);
        self.counters.bump_cache_hit();
        Ok(true)
    }

    async fn check_source(&self, entry: &CacheEntry, source: &Path) -> TierMatch {
        let Some(recorded_content) = entry.source_content_hashes.get(source) else {
            return TierMatch::Missing;
        };
        if let Some(recorded_stamp) = entry.source_metadata_hashes.get(source)
            && let Ok(stamp) = MetaStamp::of_file(source).await
            && stamp == *recorded_stamp
        {
            self.counters.bump_metadata_fast_hit();
            return TierMatch::Metadata;
        }
        self.counters.bump_content_hash();
        match content_key(source).await {
            Ok(current) if current == *recorded_content => TierMatch::Content,
            Ok(_) => TierMatch::Changed,
            Err(err) => {
                trace!(?source, %err, "source unreadable during cache check");
                TierMatch::Missing
            }
        }
    }

    /// Record (or replace) an entry. Buffered until flush.
    pub fn record(&self, entry: CacheEntry) {
        let mut state = self.state.write().expect("cache lock poisoned");
        state.entries.insert(entry.target_id.clone(), entry);
        state.dirty = true;
    }

    /// Discard an entry (corruption recovery path).
    pub fn discard(&self, id: &TargetId) {
        let mut state = self.state.write().expect("cache lock poisoned");
        if state.entries.remove(id).is_some() {
            state.dirty = true;
        }
    }

    /// Evict and flush. Idempotent; the executor's shutdown path calls
    /// this exactly once, and `Drop` falls back to it best-effort.
    #[instrument(skip(self))]
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write().expect("cache lock poisoned");
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let dropped = evict(&mut state.entries, &self.limits, |entry| {
            (entry.created_at, entry.last_access_at, entry.estimated_size)
        });
        if dropped > 0 {
            debug!(dropped, "evicted target cache entries");
            state.dirty = true;
        }
        if state.dirty {
            codec::write_file(&self.path, TARGET_MAGIC, state.entries.values())?;
            state.dirty = false;
        }
        Ok(())
    }
}

impl Drop for TargetCache {
    fn drop(&mut self) {
        // Best-effort fallback; `close` is idempotent and the normal path.
        if let Err(err) = self.close() {
            warn!(%err, "target cache flush on drop failed");
        }
    }
}

/// The action-level cache for one language driver, persisted at
/// `<cache_dir>/actions/<lang>/cache.bin`.
pub struct ActionCache {
    path: PathBuf,
    limits: CacheLimits,
    counters: Arc<Counters>,
    state: RwLock<StoreState<ActionId, ActionCacheEntry>>,
}

impl ActionCache {
    #[instrument(skip(counters))]
    pub fn open(path: &Path, limits: CacheLimits, counters: Arc<Counters>) -> Result<Self> {
        let entries = match codec::read_file::<ActionCacheEntry>(path, ACTION_MAGIC) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(?path, %err, "discarding corrupt action cache");
                Vec::new()
            }
        };
        let entries: BTreeMap<ActionId, ActionCacheEntry> = entries
            .into_iter()
            .map(|entry| (entry.action_id.clone(), entry))
            .collect();
        debug!(?path, entries = entries.len(), "opened action cache");
        Ok(Self {
            path: path.to_path_buf(),
            limits,
            counters,
            state: RwLock::new(StoreState {
                entries,
                dirty: false,
                closed: false,
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.state.read().expect("cache lock poisoned").entries.len()
    }

    /// Look up a successful prior run of this action.
    pub fn lookup(&self, id: &ActionId) -> Option<ActionCacheEntry> {
        let mut state = self.state.write().expect("cache lock poisoned");
        let Some(entry) = state.entries.get_mut(id) else {
            return None;
        };
        if !entry.success {
            return None;
        }
        entry.last_access_at = Timestamp::now();
        let entry = entry.clone();
        state.dirty = true;
        drop(state);
        self.counters.bump_action_cache_hit();
        Some(entry)
    }

    pub fn record(&self, entry: ActionCacheEntry) {
        let mut state = self.state.write().expect("cache lock poisoned");
        state.entries.insert(entry.action_id.clone(), entry);
        state.dirty = true;
    }

    #[instrument(skip(self))]
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write().expect("cache lock poisoned");
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let dropped = evict(&mut state.entries, &self.limits, |entry| {
            (entry.created_at, entry.last_access_at, entry.estimated_size)
        });
        if dropped > 0 {
            debug!(dropped, "evicted action cache entries");
            state.dirty = true;
        }
        if state.dirty {
            codec::write_file(&self.path, ACTION_MAGIC, state.entries.values())?;
            state.dirty = false;
        }
        Ok(())
    }
}

impl Drop for ActionCache {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "action cache flush on drop failed");
        }
    }
}

/// Lazily opened per-language action caches under `<cache_dir>/actions/`.
pub struct ActionCaches {
    dir: PathBuf,
    limits: CacheLimits,
    counters: Arc<Counters>,
    open: DashMap<Language, Arc<ActionCache>>,
}

impl ActionCaches {
    pub fn new(dir: &Path, limits: CacheLimits, counters: Arc<Counters>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            limits,
            counters,
            open: DashMap::new(),
        }
    }

    pub fn get(&self, language: Language) -> EngineResult<Arc<ActionCache>> {
        if let Some(cache) = self.open.get(&language) {
            return Ok(cache.clone());
        }
        let path = self
            .dir
            .join(language.as_ref())
            .join("cache.bin");
        let cache = ActionCache::open(&path, self.limits, self.counters.clone())
            .map_err(|err| EngineError::cache(format!("open action cache: {err:#}")))?;
        let cache = Arc::new(cache);
        self.open.insert(language, cache.clone());
        Ok(cache)
    }

    pub fn close_all(&self) -> Result<()> {
        for item in self.open.iter() {
            item.value().close()?;
        }
        Ok(())
    }
}

/// Hybrid eviction: age, then entry count, then total size; the latter two
/// drop least-recently-accessed entries first. Returns how many were
/// dropped.
fn evict<K, E>(
    entries: &mut BTreeMap<K, E>,
    limits: &CacheLimits,
    meta: impl Fn(&E) -> (Timestamp, Timestamp, u64),
) -> usize
where
    K: Ord + Clone,
{
    let before = entries.len();
    let now_ms = Timestamp::now().as_millisecond();
    let max_age_ms = limits.max_age_days as i64 * 24 * 60 * 60 * 1000;

    entries.retain(|_, entry| {
        let (created, _, _) = meta(entry);
        now_ms - created.as_millisecond() <= max_age_ms
    });

    // Oldest access first.
    let mut by_access: Vec<(Timestamp, K, u64)> = entries
        .iter()
        .map(|(key, entry)| {
            let (_, last_access, size) = meta(entry);
            (last_access, key.clone(), size)
        })
        .collect();
    by_access.sort();

    let mut cursor = 0;
    while entries.len() > limits.max_entries && cursor < by_access.len() {
        entries.remove(&by_access[cursor].1);
        cursor += 1;
    }

    let mut total_size: u64 = entries
        .values()
        .map(|entry| meta(entry).2)
        .sum();
    while total_size > limits.max_size_bytes && cursor < by_access.len() {
        let (_, key, size) = &by_access[cursor];
        if entries.remove(key).is_some() {
            total_size = total_size.saturating_sub(*size);
        }
        cursor += 1;
    }

    before - entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetKind;
    use pretty_assertions::assert_eq;

    fn counters() -> Arc<Counters> {
        Arc::new(Counters::default())
    }

    fn entry_for(id: &str, build: &[u8]) -> CacheEntry {
        CacheEntry::new(TargetId::from(id), Key::from_buffer(build))
    }

    #[test]
    fn serialize_deserialize_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let counters = counters();

        let mut entry = entry_for("//lib", b"out");
        entry
            .source_content_hashes
            .insert(PathBuf::from("a.c"), Key::from_buffer(b"a"));
        entry
            .source_metadata_hashes
            .insert(PathBuf::from("a.c"), MetaStamp(42));
        entry
            .dep_build_hashes
            .insert(TargetId::from("//dep"), Key::from_buffer(b"dep"));

        {
            let cache = TargetCache::open(&path, CacheLimits::default(), counters.clone()).unwrap();
            cache.record(entry.clone());
            cache.close().unwrap();
        }

        let cache = TargetCache::open(&path, CacheLimits::default(), counters).unwrap();
        let loaded = cache.entry(&TargetId::from("//lib")).unwrap();
        // Timestamps round to milliseconds in the binary format.
        assert_eq!(loaded.target_id, entry.target_id);
        assert_eq!(loaded.build_hash, entry.build_hash);
        assert_eq!(loaded.source_content_hashes, entry.source_content_hashes);
        assert_eq!(loaded.source_metadata_hashes, entry.source_metadata_hashes);
        assert_eq!(loaded.dep_build_hashes, entry.dep_build_hashes);
    }

    #[tokio::test]
    async fn hit_requires_matching_sources_and_deps() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.c");
        tokio::fs::write(&source, b"int a;").await.unwrap();

        let counters = counters();
        let cache = TargetCache::open(
            &dir.path().join("cache.bin"),
            CacheLimits::default(),
            counters.clone(),
        )
        .unwrap();

        let mut target = Target::new("//lib", TargetKind::Library, Language::C);
        target.sources.push(source.clone());
        target.deps.insert(TargetId::from("//dep"));

        let mut entry = entry_for("//lib", b"out");
        entry
            .source_content_hashes
            .insert(source.clone(), Key::from_buffer(b"int a;"));
        entry.source_metadata_hashes.insert(
            source.clone(),
            MetaStamp::of_file(&source).await.unwrap(),
        );
        entry
            .dep_build_hashes
            .insert(TargetId::from("//dep"), Key::from_buffer(b"dep"));
        cache.record(entry);

        let deps_ok = BTreeMap::from([(TargetId::from("//dep"), Key::from_buffer(b"dep"))]);
        assert!(cache.is_cached(&target, &deps_ok).await.unwrap());

        let deps_changed =
            BTreeMap::from([(TargetId::from("//dep"), Key::from_buffer(b"other"))]);
        assert!(!cache.is_cached(&target, &deps_changed).await.unwrap());

        tokio::fs::write(&source, b"int a = 1;").await.unwrap();
        assert!(!cache.is_cached(&target, &deps_ok).await.unwrap());
    }

    #[tokio::test]
    async fn touch_takes_the_content_path_once_then_fast_path() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.c");
        tokio::fs::write(&source, b"int a;").await.unwrap();

        let counters = counters();
        let cache = TargetCache::open(
            &dir.path().join("cache.bin"),
            CacheLimits::default(),
            counters.clone(),
        )
        .unwrap();

        let mut target = Target::new("//lib", TargetKind::Library, Language::C);
        target.sources.push(source.clone());

        let mut entry = entry_for("//lib", b"out");
        entry
            .source_content_hashes
            .insert(source.clone(), Key::from_buffer(b"int a;"));
        entry.source_metadata_hashes.insert(
            source.clone(),
            MetaStamp::of_file(&source).await.unwrap(),
        );
        cache.record(entry);

        // First check: metadata fast path.
        assert!(cache.is_cached(&target, &BTreeMap::new()).await.unwrap());
        let fast_before = counters.snapshot().metadata_fast_hits;
        let content_before = counters.snapshot().content_hashes;

        // Touch the file: stamp aliases, content matches.
        let future = filetime::FileTime::from_unix_time(4_102_444_800, 0);
        filetime::set_file_mtime(&source, future).unwrap();
        assert!(cache.is_cached(&target, &BTreeMap::new()).await.unwrap());
        assert_eq!(counters.snapshot().content_hashes, content_before + 1);

        // The refreshed stamp restores the fast path.
        assert!(cache.is_cached(&target, &BTreeMap::new()).await.unwrap());
        let snap = counters.snapshot();
        assert_eq!(snap.content_hashes, content_before + 1);
        assert_eq!(snap.metadata_fast_hits, fast_before + 1);
    }

    #[test]
    fn eviction_applies_age_count_and_size() {
        let limits = CacheLimits {
            max_age_days: 30,
            max_entries: 2,
            max_size_bytes: 100,
        };

        let mut entries: BTreeMap<TargetId, CacheEntry> = BTreeMap::new();
        let mut aged = entry_for("//old", b"old");
        aged.created_at = Timestamp::from_millisecond(0).unwrap();
        entries.insert(aged.target_id.clone(), aged);

        for (i, access_ms) in [(1, 1_000), (2, 2_000), (3, 3_000)] {
            let mut entry = entry_for(&format!("//t{i}"), b"x");
            entry.estimated_size = 60;
            entry.last_access_at = Timestamp::from_millisecond(access_ms).unwrap();
            entries.insert(entry.target_id.clone(), entry);
        }

        let dropped = evict(&mut entries, &limits, |entry| {
            (entry.created_at, entry.last_access_at, entry.estimated_size)
        });

        // //old dropped by age; //t1 dropped by count; //t2 dropped by
        // size (2 * 60 > 100), leaving the most recently accessed.
        assert_eq!(dropped, 3);
        assert!(entries.contains_key(&TargetId::from("//t3")));
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TargetCache::open(
            &dir.path().join("cache.bin"),
            CacheLimits::default(),
            counters(),
        )
        .unwrap();
        cache.record(entry_for("//lib", b"out"));
        cache.close().unwrap();
        cache.close().unwrap();
    }

    #[tokio::test]
    async fn action_cache_round_trip_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.c");
        tokio::fs::write(&input, b"int a;").await.unwrap();

        let metadata = BTreeMap::from([("cc".to_string(), "clang-17".to_string())]);
        let id = ActionId::compute(
            TargetId::from("//lib"),
            ActionKind::Compile,
            "a.c",
            &[input.clone()],
            &metadata,
        )
        .await
        .unwrap();

        let path = dir.path().join("actions/c/cache.bin");
        {
            let cache = ActionCache::open(&path, CacheLimits::default(), counters()).unwrap();
            cache.record(ActionCacheEntry {
                action_id: id.clone(),
                input_paths: vec![input.clone()],
                output_paths: vec![PathBuf::from("a.o")],
                metadata: metadata.clone(),
                success: true,
                output_hash: Key::from_buffer(b"obj"),
                created_at: Timestamp::now(),
                last_access_at: Timestamp::now(),
                estimated_size: 128,
            });
            cache.close().unwrap();
        }

        let cache = ActionCache::open(&path, CacheLimits::default(), counters()).unwrap();
        let entry = cache.lookup(&id).unwrap();
        assert_eq!(entry.output_hash, Key::from_buffer(b"obj"));

        // Same inputs, different metadata: different id, no hit.
        let other = ActionId::compute(
            TargetId::from("//lib"),
            ActionKind::Compile,
            "a.c",
            &[input],
            &BTreeMap::from([("cc".to_string(), "clang-18".to_string())]),
        )
        .await
        .unwrap();
        assert_ne!(id.input_hash, other.input_hash);
        assert!(cache.lookup(&other).is_none());
    }
}
