//! Shared services threaded through the build.
//!
//! There is no global mutable state in the engine: everything a build
//! needs (caches, drivers, retry policy, counters, cancellation) lives in
//! one [`Services`] value constructed at startup and passed down through
//! the scheduler and executor. The one exception is OS signal handling,
//! which flips the [`CancelFlag`]'s process-global atomic.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use color_eyre::{Result, eyre::Context as _};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::cache::{ActionCaches, TargetCache};
use crate::checkpoint::CheckpointLog;
use crate::config::Config;
use crate::driver::DriverRegistry;
use crate::hash::Key;
use crate::retry::{CircuitBreaker, RetryPolicy};
use crate::target::{Language, TargetId};

/// Cheap engine-wide counters, exposed by `foreman telemetry`.
#[derive(Debug, Default)]
pub struct Counters {
    content_hashes: AtomicU64,
    metadata_fast_hits: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    action_cache_hits: AtomicU64,
    actions_executed: AtomicU64,
    retries: AtomicU64,
    steals: AtomicU64,
}

/// A point-in-time copy of [`Counters`], serializable for telemetry.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub content_hashes: u64,
    pub metadata_fast_hits: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub action_cache_hits: u64,
    pub actions_executed: u64,
    pub retries: u64,
    pub steals: u64,
}

impl Counters {
    pub fn bump_content_hash(&self) {
        self.content_hashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_metadata_fast_hit(&self) {
        self.metadata_fast_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_action_cache_hit(&self) {
        self.action_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_action_executed(&self) {
        self.actions_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            content_hashes: self.content_hashes.load(Ordering::Relaxed),
            metadata_fast_hits: self.metadata_fast_hits.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            action_cache_hits: self.action_cache_hits.load(Ordering::Relaxed),
            actions_executed: self.actions_executed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
        }
    }
}

impl CounterSnapshot {
    /// Persist for the `telemetry` subcommand.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self).context("serialize telemetry")?;
        std::fs::write(path, content).with_context(|| format!("write {path:?}"))
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read(path) {
            Ok(content) => Ok(Some(
                serde_json::from_slice(&content).context("parse telemetry")?,
            )),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(format!("read {path:?}")),
        }
    }
}

/// Cooperative cancellation, shared by signal handlers, the scheduler, and
/// every worker. Workers check it between actions and between retries.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The raw atomic, for registration with `signal_hook`.
    pub fn as_atomic(&self) -> Arc<AtomicBool> {
        self.0.clone()
    }
}

/// Everything a build needs, constructed once per invocation.
pub struct Services {
    pub config: Config,
    pub target_cache: Arc<TargetCache>,
    pub action_caches: ActionCaches,
    pub drivers: DriverRegistry,
    pub retry: RetryPolicy,
    pub counters: Arc<Counters>,
    pub cancel: CancelFlag,
    /// Build hashes of targets completed in this run (built or cached),
    /// consulted by dependents for their cache checks.
    pub build_hashes: DashMap<TargetId, Key>,
    /// The current run's checkpoint log, if checkpointing is active.
    checkpoint: std::sync::Mutex<Option<Arc<CheckpointLog>>>,
    breakers: DashMap<Language, Arc<CircuitBreaker>>,
}

impl Services {
    #[instrument(skip(config, drivers))]
    pub fn new(config: Config, drivers: DriverRegistry) -> Result<Self> {
        let counters = Arc::new(Counters::default());
        let target_cache = Arc::new(TargetCache::open(
            &config.target_cache_path(),
            config.cache,
            counters.clone(),
        )?);
        let action_caches = ActionCaches::new(&config.actions_dir(), config.cache, counters.clone());
        let retry = config.retry.clone();
        debug!("services constructed");
        Ok(Self {
            config,
            target_cache,
            action_caches,
            drivers,
            retry,
            counters,
            cancel: CancelFlag::new(),
            build_hashes: DashMap::new(),
            checkpoint: std::sync::Mutex::new(None),
            breakers: DashMap::new(),
        })
    }

    /// The circuit breaker for one language driver.
    pub fn breaker_for(&self, language: Language) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(language)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.config.breaker_threshold,
                    Duration::from_secs(self.config.breaker_cooldown_secs),
                ))
            })
            .clone()
    }

    pub fn set_checkpoint(&self, log: Arc<CheckpointLog>) {
        *self.checkpoint.lock().expect("checkpoint lock poisoned") = Some(log);
    }

    pub fn checkpoint(&self) -> Option<Arc<CheckpointLog>> {
        self.checkpoint
            .lock()
            .expect("checkpoint lock poisoned")
            .clone()
    }

    /// Flush caches and persist telemetry. The executor's shutdown path;
    /// explicit rather than destructor-driven.
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> Result<()> {
        self.target_cache.close()?;
        self.action_caches.close_all()?;
        self.counters
            .snapshot()
            .save(&self.config.telemetry_path())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn snapshot_reflects_bumps() {
        let counters = Counters::default();
        counters.bump_cache_hit();
        counters.bump_cache_hit();
        counters.bump_content_hash();
        let snap = counters.snapshot();
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.content_hashes, 1);
        assert_eq!(snap.cache_misses, 0);
    }

    #[test]
    fn telemetry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.json");
        let snap = CounterSnapshot {
            cache_hits: 7,
            ..CounterSnapshot::default()
        };
        snap.save(&path).unwrap();
        assert_eq!(CounterSnapshot::load(&path).unwrap(), Some(snap));
        assert_eq!(
            CounterSnapshot::load(&dir.path().join("absent.json")).unwrap(),
            None
        );
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
