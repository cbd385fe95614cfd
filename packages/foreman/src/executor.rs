//! Executes one graph node: cache check, driver invocation, bookkeeping.
//!
//! The executor owns the order of operations for a single target: consult
//! the target cache, consult the per-source action cache, invoke the
//! language driver under the retry policy and circuit breaker, then record
//! cache entries and the checkpoint record. Distributed mode swaps the
//! driver invocation for a coordinator dispatch; everything else is
//! identical.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use jiff::Timestamp;
use tracing::{debug, instrument, trace, warn};

use crate::cache::{ActionCacheEntry, ActionId, ActionKind, CacheEntry};
use crate::checkpoint::CheckpointRecord;
use crate::context::Services;
use crate::driver::ActionContext;
use crate::error::{EngineError, EngineResult};
use crate::graph::NodeStatus;
use crate::hash::{Key, MetaStamp, content_key};
use crate::retry::retry;
use crate::target::{Target, TargetId};

/// Outcome of building one node, reported to the scheduler.
#[derive(Clone, Debug)]
pub struct BuildResult {
    pub target_id: TargetId,
    pub status: NodeStatus,
    pub error: Option<EngineError>,
    pub duration: Duration,
    /// Driver attempts beyond the first.
    pub retries: u32,
}

impl BuildResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, NodeStatus::Success | NodeStatus::Cached)
    }
}

/// Per-invocation executor, shared by all scheduler workers.
pub struct Executor {
    services: Arc<Services>,
    workspace_root: PathBuf,
}

impl Executor {
    pub fn new(services: Arc<Services>, workspace_root: PathBuf) -> Self {
        Self {
            services,
            workspace_root,
        }
    }

    /// Build one target, never panicking: every failure becomes a
    /// `BuildResult` carrying its error.
    #[instrument(skip(self, target), fields(target = %target.id))]
    pub async fn execute(&self, target: &Target) -> BuildResult {
        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let outcome = self.try_execute(target, &attempts).await;
        let retries = attempts.load(Ordering::SeqCst).saturating_sub(1);
        match outcome {
            Ok(status) => BuildResult {
                target_id: target.id.clone(),
                status,
                error: None,
                duration: started.elapsed(),
                retries,
            },
            Err(error) => BuildResult {
                target_id: target.id.clone(),
                status: NodeStatus::Failed,
                error: Some(error),
                duration: started.elapsed(),
                retries,
            },
        }
    }

    async fn try_execute(
        &self,
        target: &Target,
        attempts: &AtomicU32,
    ) -> EngineResult<NodeStatus> {
        let services = &self.services;

        // Dependency hashes come from this run's completed set; the
        // scheduler guarantees every dependency finished first.
        let mut dep_hashes: BTreeMap<TargetId, Key> = BTreeMap::new();
        for dep in &target.deps {
            let hash = services.build_hashes.get(dep).map(|entry| *entry.value());
            match hash {
                Some(hash) => {
                    dep_hashes.insert(dep.clone(), hash);
                }
                None => {
                    return Err(EngineError::internal(format!(
                        "dependency {dep} of {} has no recorded build hash",
                        target.id
                    )));
                }
            }
        }

        if services.target_cache.is_cached(target, &dep_hashes).await? {
            let build_hash = services
                .target_cache
                .build_hash(&target.id)
                .ok_or_else(|| EngineError::internal("cache hit without an entry"))?;
            services.build_hashes.insert(target.id.clone(), build_hash);
            trace!(target = %target.id, "target cache hit");
            return Ok(NodeStatus::Cached);
        }

        let driver = services.drivers.get(target.language)?;
        if !driver.is_available() {
            return Err(EngineError::config(format!(
                "driver for {} is not available on this host",
                target.language
            ))
            .suggest("install the toolchain or remove the target from the build"));
        }

        // Action-level cache: per-source compile actions. Hits are
        // bookkeeping only at this seam (the driver rebuilds the whole
        // target); they still measure how much finer-grained caching
        // saves once drivers split their work.
        let action_cache = services.action_caches.get(target.language)?;
        let action_metadata: BTreeMap<String, String> = BTreeMap::from([
            ("language".to_string(), target.language.to_string()),
            ("flags".to_string(), target.flags.join("\u{1f}")),
        ]);
        let mut pending_actions: Vec<ActionId> = Vec::new();
        for source in &target.sources {
            let action_id = ActionId::compute(
                target.id.clone(),
                ActionKind::Compile,
                source.to_string_lossy().into_owned(),
                std::slice::from_ref(source),
                &action_metadata,
            )
            .await
            .map_err(|err| err.frame(format!("computing action id for {}", target.id)))?;
            if action_cache.lookup(&action_id).is_none() {
                pending_actions.push(action_id);
            }
        }

        let breaker = services.breaker_for(target.language);
        let ctx = ActionContext {
            target,
            workspace_root: &self.workspace_root,
        };
        let product = retry(
            &services.retry,
            Some(&breaker),
            &services.cancel,
            target.id.as_str(),
            || {
                if attempts.fetch_add(1, Ordering::SeqCst) > 0 {
                    services.counters.bump_retry();
                }
                driver.build(ctx)
            },
        )
        .await?;
        services.counters.bump_action_executed();

        // Record the fine-grained actions that had no cached run.
        let now = Timestamp::now();
        for action_id in pending_actions {
            let source = PathBuf::from(action_id.sub_id.clone());
            action_cache.record(ActionCacheEntry {
                input_paths: vec![source.clone()],
                output_paths: product.outputs.clone(),
                metadata: action_metadata.clone(),
                success: true,
                output_hash: product.output_hash,
                created_at: now,
                last_access_at: now,
                estimated_size: source_size(&source).await,
                action_id,
            });
        }

        // Record the target-level entry.
        let mut entry = CacheEntry::new(target.id.clone(), product.output_hash);
        entry.dep_build_hashes = dep_hashes;
        for source in &target.sources {
            let content = content_key(source).await.map_err(|err| {
                EngineError::from(err).frame(format!("hashing source {source:?}"))
            })?;
            services.counters.bump_content_hash();
            entry.source_content_hashes.insert(source.clone(), content);
            if let Ok(stamp) = MetaStamp::of_file(source).await {
                entry.source_metadata_hashes.insert(source.clone(), stamp);
            }
        }
        let mut estimated = 0u64;
        for output in &product.outputs {
            estimated += source_size(output).await;
        }
        entry.estimated_size = estimated;
        services.target_cache.record(entry);

        if let Some(checkpoint) = services.checkpoint() {
            let record = CheckpointRecord {
                target_id: target.id.clone(),
                build_hash: product.output_hash,
                timestamp: Timestamp::now(),
            };
            if let Err(err) = checkpoint.append(&record) {
                // Checkpointing is advisory; a failed append must not fail
                // the build.
                warn!(target = %target.id, %err, "checkpoint append failed");
            }
        }

        services
            .build_hashes
            .insert(target.id.clone(), product.output_hash);
        debug!(target = %target.id, hash = %product.output_hash, "built target");
        Ok(NodeStatus::Success)
    }
}

async fn source_size(path: &std::path::Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::driver::{DriverRegistry, MockDriver};
    use crate::target::{Language, TargetKind};
    use pretty_assertions::assert_eq;

    async fn services_with_mock(
        cache_dir: &std::path::Path,
    ) -> (Arc<Services>, Arc<MockDriver>) {
        let mock = Arc::new(MockDriver::new(Language::Python));
        let mut drivers = DriverRegistry::new();
        drivers.register(mock.clone());
        let config = Config {
            cache_dir: cache_dir.to_path_buf(),
            ..Config::default()
        };
        let services = Arc::new(Services::new(config, drivers).unwrap());
        (services, mock)
    }

    #[tokio::test]
    async fn build_then_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.py");
        tokio::fs::write(&source, b"print('hi')").await.unwrap();

        let (services, mock) = services_with_mock(&dir.path().join("cache")).await;
        let executor = Executor::new(services.clone(), dir.path().to_path_buf());

        let mut target = Target::new("//lib", TargetKind::Library, Language::Python);
        target.sources.push(source);

        let first = executor.execute(&target).await;
        assert_eq!(first.status, NodeStatus::Success);
        assert!(first.error.is_none());

        // Second run: no source change, so the cache answers.
        services.build_hashes.clear();
        let second = executor.execute(&target).await;
        assert_eq!(second.status, NodeStatus::Cached);
        assert_eq!(mock.invocations().len(), 1);
    }

    #[tokio::test]
    async fn source_edit_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.py");
        tokio::fs::write(&source, b"v1").await.unwrap();

        let (services, mock) = services_with_mock(&dir.path().join("cache")).await;
        let executor = Executor::new(services.clone(), dir.path().to_path_buf());

        let mut target = Target::new("//lib", TargetKind::Library, Language::Python);
        target.sources.push(source.clone());

        let first = executor.execute(&target).await;
        assert_eq!(first.status, NodeStatus::Success);

        tokio::fs::write(&source, b"v2").await.unwrap();
        services.build_hashes.clear();
        let second = executor.execute(&target).await;
        assert_eq!(second.status, NodeStatus::Success);
        assert_eq!(mock.invocations().len(), 2);
    }

    #[tokio::test]
    async fn transient_failures_retry_and_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let (services, mock) = services_with_mock(&dir.path().join("cache")).await;
        mock.fail_transiently("//flaky", 2);
        let executor = Executor::new(services.clone(), dir.path().to_path_buf());

        let target = Target::new("//flaky", TargetKind::Library, Language::Python);
        let result = executor.execute(&target).await;
        assert_eq!(result.status, NodeStatus::Success);
        assert_eq!(result.retries, 2);
        assert_eq!(mock.invocations().len(), 3);
        assert_eq!(services.counters.snapshot().retries, 2);
    }

    #[tokio::test]
    async fn failure_carries_the_error() {
        let dir = tempfile::tempdir().unwrap();
        let (services, mock) = services_with_mock(&dir.path().join("cache")).await;
        mock.fail_target("//bad");
        let executor = Executor::new(services, dir.path().to_path_buf());

        let target = Target::new("//bad", TargetKind::Library, Language::Python);
        let result = executor.execute(&target).await;
        assert_eq!(result.status, NodeStatus::Failed);
        assert_eq!(
            result.error.unwrap().kind,
            crate::error::ErrorKind::BuildFailure
        );
    }

    #[tokio::test]
    async fn missing_dep_hash_is_internal() {
        let dir = tempfile::tempdir().unwrap();
        let (services, _) = services_with_mock(&dir.path().join("cache")).await;
        let executor = Executor::new(services, dir.path().to_path_buf());

        let mut target = Target::new("//app", TargetKind::Executable, Language::Python);
        target.deps.insert(TargetId::from("//lib"));
        let result = executor.execute(&target).await;
        assert_eq!(result.status, NodeStatus::Failed);
        assert_eq!(
            result.error.unwrap().kind,
            crate::error::ErrorKind::Internal
        );
    }
}
