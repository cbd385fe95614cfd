//! Wave-based parallel scheduling.
//!
//! At build start every node's `pending_deps` counter is initialized to
//! its dependency count and every zero-count node is enqueued. A pool of
//! worker tasks drains the ready queue; each completion atomically
//! decrements its dependents' counters and enqueues the ones that reach
//! zero, so independent nodes run together in waves.
//!
//! A failed node fails fast: its transitive dependents are marked `Failed`
//! (cascading failure), surviving in-flight work completes, and nothing
//! new dispatches. Primary and cascaded failures are counted separately;
//! the reported failure total is their sum.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use color_eyre::{Result, eyre::Context as _};
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::CheckpointLog;
use crate::context::Services;
use crate::error::EngineError;
use crate::executor::{BuildResult, Executor};
use crate::graph::{BuildGraph, NodeHandle, NodeStatus};
use crate::hash::Key;
use crate::target::TargetId;

/// Summary of one build invocation.
#[derive(Clone, Debug, Default)]
pub struct BuildReport {
    pub built: usize,
    pub cached: usize,
    /// Nodes whose own build failed.
    pub failed_primary: usize,
    /// Nodes failed because a transitive dependency failed.
    pub failed_cascaded: usize,
    /// Nodes never dispatched because the build halted first.
    pub skipped: usize,
    pub duration: Duration,
    pub errors: Vec<(TargetId, EngineError)>,
    pub checkpoint_path: Option<PathBuf>,
}

impl BuildReport {
    /// Total failed nodes: primary plus cascaded.
    pub fn failed(&self) -> usize {
        self.failed_primary + self.failed_cascaded
    }

    pub fn success(&self) -> bool {
        self.failed() == 0
    }

    /// One-line summary: `X built, Y cached, Z failed`.
    pub fn summary_line(&self) -> String {
        format!(
            "{} built, {} cached, {} failed",
            self.built,
            self.cached,
            self.failed()
        )
    }
}

enum Done {
    Finished(NodeHandle, BuildResult),
    /// Dequeued after the build halted; never executed.
    Skipped(NodeHandle),
}

/// Orchestrates one build over a sealed graph.
pub struct Scheduler {
    graph: Arc<BuildGraph>,
    services: Arc<Services>,
    executor: Arc<Executor>,
}

impl Scheduler {
    pub fn new(graph: Arc<BuildGraph>, services: Arc<Services>, workspace_root: PathBuf) -> Self {
        let executor = Arc::new(Executor::new(services.clone(), workspace_root));
        Self {
            graph,
            services,
            executor,
        }
    }

    /// Run the build to completion.
    ///
    /// `resume` carries build hashes from a validated checkpoint; targets
    /// in it are settled as cached without dispatch.
    #[instrument(skip(self, resume))]
    pub async fn run(&self, resume: Option<BTreeMap<TargetId, Key>>) -> Result<BuildReport> {
        let started = Instant::now();
        let total = self.graph.len();
        if total == 0 {
            info!("nothing to build");
            return Ok(BuildReport::default());
        }

        // Start this run's checkpoint.
        let run_id = uuid::Uuid::new_v4().to_string();
        let checkpoint = CheckpointLog::create(
            &self.services.config.checkpoints_dir(),
            &run_id,
            self.graph.structural_hash(),
        )
        .context("create checkpoint")?;
        let checkpoint_path = checkpoint.path().to_path_buf();
        self.services.set_checkpoint(Arc::new(checkpoint));

        let resume = resume.unwrap_or_default();

        // Initialize counters and statuses.
        for handle in self.graph.handles() {
            let node = self.graph.node(handle);
            node.reset_pending_deps();
            node.set_status(NodeStatus::Pending);
        }

        let (ready_tx, ready_rx) = flume::unbounded::<NodeHandle>();
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel::<Done>();
        let halt = Arc::new(AtomicBool::new(false));

        let jobs = self.services.config.jobs.max(1);
        let mut workers = Vec::with_capacity(jobs);
        for _ in 0..jobs {
            let ready_rx = ready_rx.clone();
            let done_tx = done_tx.clone();
            let graph = self.graph.clone();
            let executor = self.executor.clone();
            let services = self.services.clone();
            let halt = halt.clone();
            workers.push(tokio::spawn(async move {
                while let Ok(handle) = ready_rx.recv_async().await {
                    if halt.load(Ordering::SeqCst) || services.cancel.is_cancelled() {
                        let _ = done_tx.send(Done::Skipped(handle));
                        continue;
                    }
                    let node = graph.node(handle);
                    node.transition(NodeStatus::Pending, NodeStatus::Building);
                    let result = executor.execute(node.target()).await;
                    let _ = done_tx.send(Done::Finished(handle, result));
                }
            }));
        }
        drop(done_tx);

        let mut report = BuildReport {
            checkpoint_path: Some(checkpoint_path),
            ..BuildReport::default()
        };
        let mut outstanding = 0usize;

        // Seed the first wave: every node with no dependencies, plus
        // checkpointed targets settled immediately.
        let mut first_wave = Vec::new();
        for handle in self.graph.handles() {
            let node = self.graph.node(handle);
            if let Some(hash) = resume.get(node.id()) {
                node.set_status(NodeStatus::Cached);
                self.services
                    .build_hashes
                    .insert(node.id().clone(), *hash);
                report.cached += 1;
                continue;
            }
            if node.pending_deps() == 0 {
                first_wave.push(handle);
            }
        }
        // Checkpointed nodes count as completions for their dependents.
        for handle in self.graph.handles() {
            let node = self.graph.node(handle);
            if node.status() == NodeStatus::Cached {
                for dependent in node.dependent_ids() {
                    let dep_handle = self.graph.handle(dependent)?;
                    let dep_node = self.graph.node(dep_handle);
                    if dep_node.status() == NodeStatus::Pending
                        && dep_node.complete_dependency() == 0
                    {
                        first_wave.push(dep_handle);
                    }
                }
            }
        }
        first_wave.sort_by(|a, b| self.graph.node(*a).id().cmp(self.graph.node(*b).id()));
        first_wave.dedup();
        for handle in first_wave {
            if self.graph.node(handle).status() == NodeStatus::Pending {
                ready_tx.send(handle).context("seed ready queue")?;
                outstanding += 1;
            }
        }

        while outstanding > 0 {
            let Some(done) = done_rx.recv().await else {
                return Err(EngineError::internal("scheduler workers exited early").into());
            };
            outstanding -= 1;
            match done {
                // Dequeued post-halt; stays Pending and is counted in the
                // final status sweep.
                Done::Skipped(_) => {}
                Done::Finished(handle, mut result) => {
                    let node = self.graph.node(handle);
                    node.set_status(result.status);
                    node.record_retries(result.retries);
                    match result.status {
                        NodeStatus::Success => report.built += 1,
                        NodeStatus::Cached => report.cached += 1,
                        NodeStatus::Failed => {
                            report.failed_primary += 1;
                            if let Some(error) = result.error.take() {
                                warn!(target = %result.target_id, %error, "target failed");
                                report.errors.push((result.target_id.clone(), error));
                            }
                            let cascaded = self.cascade_failure(handle)?;
                            report.failed_cascaded += cascaded;
                            // Fail fast: in-flight work finishes, nothing
                            // new starts.
                            halt.store(true, Ordering::SeqCst);
                        }
                        NodeStatus::Pending | NodeStatus::Building => {
                            return Err(EngineError::internal(
                                "executor returned a non-terminal status",
                            )
                            .into());
                        }
                    }

                    if result.succeeded() && !halt.load(Ordering::SeqCst) {
                        for dependent in node.dependent_ids() {
                            let dep_handle = self.graph.handle(dependent)?;
                            let dep_node = self.graph.node(dep_handle);
                            if dep_node.status() == NodeStatus::Pending
                                && dep_node.complete_dependency() == 0
                            {
                                ready_tx.send(dep_handle).context("enqueue ready node")?;
                                outstanding += 1;
                            }
                        }
                    } else if result.succeeded() {
                        // Halted: still decrement so accounting invariants
                        // hold, but dispatch nothing.
                        for dependent in node.dependent_ids() {
                            let dep_handle = self.graph.handle(dependent)?;
                            let dep_node = self.graph.node(dep_handle);
                            if dep_node.status() == NodeStatus::Pending {
                                dep_node.complete_dependency();
                            }
                        }
                    }

                    if self.services.cancel.is_cancelled() {
                        halt.store(true, Ordering::SeqCst);
                    }
                }
            }
        }

        drop(ready_tx);
        for worker in workers {
            worker.await.context("join scheduler worker")?;
        }

        // Anything still pending was never executed.
        report.skipped = self
            .graph
            .handles()
            .filter(|&h| self.graph.node(h).status() == NodeStatus::Pending)
            .count();

        report.duration = started.elapsed();
        info!(
            built = report.built,
            cached = report.cached,
            failed = report.failed(),
            skipped = report.skipped,
            "build finished"
        );
        Ok(report)
    }

    /// Mark every transitive dependent of `handle` failed. Returns how
    /// many nodes the cascade newly failed.
    fn cascade_failure(&self, handle: NodeHandle) -> Result<usize> {
        let mut cascaded = 0;
        let mut stack = vec![handle];
        while let Some(current) = stack.pop() {
            for dependent in self.graph.node(current).dependent_ids() {
                let dep_handle = self.graph.handle(dependent)?;
                let dep_node = self.graph.node(dep_handle);
                if !dep_node.status().is_terminal() {
                    dep_node.set_status(NodeStatus::Failed);
                    debug!(target = %dep_node.id(), "failed by cascade");
                    cascaded += 1;
                    stack.push(dep_handle);
                }
            }
        }
        Ok(cascaded)
    }
}
