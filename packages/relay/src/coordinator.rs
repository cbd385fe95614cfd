//! The coordinator: worker registry, pending-action queue, dispatch.
//!
//! One TCP connection per worker, thread-per-connection style on tokio
//! tasks. The coordinator owns the priority queue of pending actions and
//! assigns each to an eligible worker — capabilities must match, then the
//! lowest load factor wins, with the oldest `last_assigned_at` breaking
//! ties for fairness. Results relay back to the submitter over a channel.
//!
//! Nothing is persisted: a coordinator crash loses the in-memory view and
//! in-flight work is re-dispatched when workers re-register. Workers that
//! miss heartbeats past the grace period are marked dead and their
//! in-flight actions requeued.

use std::collections::{BTreeSet, BinaryHeap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use color_eyre::{Result, eyre::Context as _};
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument, trace, warn};

use protocol::wire::{
    ActionRequest, ActionResult, BlobPutAck, BlobResponse, ManifestResponse, Message,
    PeerAnnounce, Registered, WorkerId, read_frame, write_frame,
};

use crate::artifact::Store;

/// Coordinator tuning knobs.
#[derive(Copy, Clone, Debug)]
pub struct CoordinatorConfig {
    /// Expected worker heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// A worker missing heartbeats for this long is dead.
    pub liveness_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            liveness_grace: Duration::from_secs(15),
        }
    }
}

/// Everything the coordinator knows about one worker.
#[derive(Debug)]
pub struct WorkerEntry {
    pub address: String,
    pub capabilities: BTreeSet<String>,
    pub capacity: u32,
    pub last_heartbeat: Instant,
    pub queue_depth: u32,
    pub load_factor: f64,
    /// Actions dispatched and not yet resulted.
    pub assigned: u32,
    pub last_assigned_at: Instant,
    pub alive: bool,
    tx: flume::Sender<Message>,
}

struct QueuedAction {
    request: ActionRequest,
    seq: u64,
}

impl PartialEq for QueuedAction {
    fn eq(&self, other: &Self) -> bool {
        self.request.priority == other.request.priority && self.seq == other.seq
    }
}
impl Eq for QueuedAction {}

impl PartialOrd for QueuedAction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedAction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: highest priority first, oldest submission within a
        // priority.
        self.request
            .priority
            .cmp(&other.request.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct InFlight {
    request: ActionRequest,
    worker: WorkerId,
}

/// The coordinator's shared state. Construct with [`Coordinator::new`],
/// drive with [`Coordinator::serve`], feed with [`Coordinator::submit`].
pub struct Coordinator {
    config: CoordinatorConfig,
    pub store: Arc<Store>,
    workers: DashMap<WorkerId, WorkerEntry>,
    queue: Mutex<BinaryHeap<QueuedAction>>,
    inflight: DashMap<String, InFlight>,
    results_tx: flume::Sender<ActionResult>,
    results_rx: flume::Receiver<ActionResult>,
    seq: AtomicU64,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, store: Arc<Store>) -> Arc<Self> {
        let (results_tx, results_rx) = flume::unbounded();
        Arc::new(Self {
            config,
            store,
            workers: DashMap::new(),
            queue: Mutex::new(BinaryHeap::new()),
            inflight: DashMap::new(),
            results_tx,
            results_rx,
            seq: AtomicU64::new(0),
        })
    }

    /// Receiver for results of submitted actions.
    pub fn results(&self) -> flume::Receiver<ActionResult> {
        self.results_rx.clone()
    }

    /// Number of actions waiting for a worker.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Enqueue one action and dispatch whatever is dispatchable.
    #[instrument(skip(self, request), fields(action = %request.id))]
    pub fn submit(&self, request: ActionRequest) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.queue
            .lock()
            .expect("queue lock poisoned")
            .push(QueuedAction { request, seq });
        self.try_dispatch();
    }

    /// Accept connections and run the liveness sweeper until the listener
    /// fails.
    #[instrument(skip(self, listener))]
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "coordinator listening");

        let sweeper = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweeper.config.liveness_grace / 2);
            loop {
                interval.tick().await;
                sweeper.sweep();
            }
        });

        loop {
            let (stream, peer) = listener.accept().await.context("accept connection")?;
            trace!(?peer, "connection accepted");
            let coordinator = self.clone();
            tokio::spawn(async move {
                if let Err(err) = coordinator.handle_conn(stream).await {
                    debug!(%err, "connection closed with error");
                }
            });
        }
    }

    /// Mark workers with stale heartbeats dead and requeue their work.
    fn sweep(&self) {
        let mut dead: Vec<WorkerId> = Vec::new();
        for mut entry in self.workers.iter_mut() {
            if entry.alive && entry.last_heartbeat.elapsed() > self.config.liveness_grace {
                entry.alive = false;
                dead.push(entry.key().clone());
            }
        }
        for id in dead {
            warn!(worker = %id, "worker missed heartbeats; marking dead");
            self.requeue_inflight_of(&id);
        }
    }

    /// Re-dispatch every in-flight action assigned to a dead worker. This
    /// is the one path where an action can execute twice.
    fn requeue_inflight_of(&self, worker: &WorkerId) {
        let ids: Vec<String> = self
            .inflight
            .iter()
            .filter(|entry| &entry.worker == worker)
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((_, inflight)) = self.inflight.remove(&id) {
                debug!(action = %id, "requeueing after worker death");
                self.submit(inflight.request);
            }
        }
    }

    /// Drain the queue into eligible workers.
    fn try_dispatch(&self) {
        loop {
            let next = {
                let mut queue = self.queue.lock().expect("queue lock poisoned");
                let Some(top) = queue.peek() else { break };
                let Some(worker_id) = self.pick_worker(&top.request) else {
                    break;
                };
                let action = queue.pop().expect("peeked entry exists");
                (action.request, worker_id)
            };
            self.dispatch(next.0, &next.1);
        }
    }

    /// Assignment policy: capability match, then lowest load factor, then
    /// oldest assignment.
    fn pick_worker(&self, request: &ActionRequest) -> Option<WorkerId> {
        let mut best: Option<(f64, Instant, WorkerId)> = None;
        for entry in self.workers.iter() {
            if !entry.alive || entry.assigned >= entry.capacity {
                continue;
            }
            if !request.capabilities_required.is_subset(&entry.capabilities) {
                continue;
            }
            let candidate = (entry.load_factor, entry.last_assigned_at, entry.key().clone());
            let better = match &best {
                None => true,
                Some((load, assigned_at, _)) => {
                    candidate.0 < *load || (candidate.0 == *load && candidate.1 < *assigned_at)
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        best.map(|(_, _, id)| id)
    }

    fn dispatch(&self, request: ActionRequest, worker_id: &WorkerId) {
        let Some(mut entry) = self.workers.get_mut(worker_id) else {
            self.submit(request);
            return;
        };
        if entry.tx.send(Message::ActionRequest(request.clone())).is_err() {
            // Connection gone; worker will be swept, try someone else.
            entry.alive = false;
            drop(entry);
            self.submit(request);
            return;
        }
        entry.assigned += 1;
        entry.last_assigned_at = Instant::now();
        drop(entry);
        trace!(worker = %worker_id, action = %request.id, "dispatched");
        self.inflight.insert(
            request.id.clone(),
            InFlight {
                request,
                worker: worker_id.clone(),
            },
        );
    }

    /// Gossip one worker's announcement to every other live worker.
    fn gossip(&self, announce: PeerAnnounce) {
        for entry in self.workers.iter() {
            if entry.key() == &announce.worker_id || !entry.alive {
                continue;
            }
            let _ = entry.tx.send(Message::PeerAnnounce(announce.clone()));
        }
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let (tx, rx) = flume::unbounded::<Message>();
        let writer_task = tokio::spawn(async move {
            while let Ok(message) = rx.recv_async().await {
                if write_frame(&mut writer, &message).await.is_err() {
                    break;
                }
            }
        });

        let mut registered: Option<WorkerId> = None;
        let result = loop {
            let message = match read_frame(&mut reader).await {
                Ok(Some(message)) => message,
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            };
            match message {
                Message::Registration(registration) => {
                    // The worker's self-assigned id is a placeholder; ours
                    // is authoritative.
                    let id = WorkerId(format!("w-{}", uuid::Uuid::new_v4()));
                    info!(worker = %id, address = %registration.address, "worker registered");
                    self.workers.insert(
                        id.clone(),
                        WorkerEntry {
                            address: registration.address.clone(),
                            capabilities: registration.capabilities,
                            capacity: registration.capacity.max(1),
                            last_heartbeat: Instant::now(),
                            queue_depth: 0,
                            load_factor: 0.0,
                            assigned: 0,
                            last_assigned_at: Instant::now(),
                            alive: true,
                            tx: tx.clone(),
                        },
                    );
                    let _ = tx.send(Message::Registered(Registered {
                        worker_id: id.clone(),
                    }));
                    // Introduce existing peers to the newcomer.
                    for entry in self.workers.iter() {
                        if entry.key() == &id || !entry.alive {
                            continue;
                        }
                        let _ = tx.send(Message::PeerAnnounce(PeerAnnounce {
                            worker_id: entry.key().clone(),
                            address: entry.address.clone(),
                            load_factor: entry.load_factor,
                            queue_depth: entry.queue_depth,
                        }));
                    }
                    self.gossip(PeerAnnounce {
                        worker_id: id.clone(),
                        address: registration.address,
                        load_factor: 0.0,
                        queue_depth: 0,
                    });
                    registered = Some(id);
                    self.try_dispatch();
                }
                Message::HeartBeat(heartbeat) => {
                    let announce = {
                        let Some(mut entry) = self.workers.get_mut(&heartbeat.worker_id) else {
                            continue;
                        };
                        entry.last_heartbeat = Instant::now();
                        entry.load_factor = heartbeat.load_factor;
                        entry.queue_depth = heartbeat.queue_depth;
                        entry.alive = true;
                        PeerAnnounce {
                            worker_id: heartbeat.worker_id.clone(),
                            address: entry.address.clone(),
                            load_factor: heartbeat.load_factor,
                            queue_depth: heartbeat.queue_depth,
                        }
                    };
                    self.gossip(announce);
                    self.try_dispatch();
                }
                Message::WorkRequest(request) => {
                    trace!(worker = %request.worker_id, "work requested");
                    self.try_dispatch();
                }
                Message::ActionResult(result) => {
                    if let Some((_, inflight)) = self.inflight.remove(&result.id) {
                        if let Some(mut entry) = self.workers.get_mut(&inflight.worker) {
                            entry.assigned = entry.assigned.saturating_sub(1);
                        }
                    }
                    debug!(action = %result.id, status = %result.status, "result received");
                    let _ = self.results_tx.send(result);
                    self.try_dispatch();
                }
                Message::BlobRequest(request) => {
                    let content = self.store.fetch(&request.key).await.unwrap_or_else(|err| {
                        warn!(key = %request.key, %err, "blob fetch failed");
                        None
                    });
                    let _ = tx.send(Message::BlobResponse(BlobResponse {
                        key: request.key,
                        content,
                    }));
                }
                Message::BlobPut(put) => {
                    let new = match self.store.upload(&put.key, &put.content).await {
                        Ok(new) => new,
                        Err(err) => {
                            warn!(key = %put.key, %err, "blob upload rejected");
                            false
                        }
                    };
                    let _ = tx.send(Message::BlobPutAck(BlobPutAck { key: put.key, new }));
                }
                Message::ManifestRequest(request) => {
                    let chunks = self
                        .store
                        .manifest(&request.key)
                        .await
                        .unwrap_or_else(|err| {
                            warn!(key = %request.key, %err, "manifest read failed");
                            None
                        });
                    let _ = tx.send(Message::ManifestResponse(ManifestResponse {
                        key: request.key,
                        chunks,
                    }));
                }
                other => {
                    warn!(message = %other, "unexpected message at coordinator");
                }
            }
        };

        if let Some(id) = registered {
            info!(worker = %id, "worker disconnected");
            if let Some(mut entry) = self.workers.get_mut(&id) {
                entry.alive = false;
            }
            self.requeue_inflight_of(&id);
        }
        drop(tx);
        let _ = writer_task.await;
        result
    }
}
