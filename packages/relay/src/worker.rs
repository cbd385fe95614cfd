//! The worker agent: local deque, steal protocol, sandboxed execution.
//!
//! A worker keeps its pending actions in a deque with owner-only LIFO push
//! and pop at one end (best cache locality for its own work) and
//! stranger-side FIFO steal at the other (thieves take the oldest task,
//! whose locality is coldest anyway). When its deque runs dry it asks the
//! coordinator for work; when the coordinator has none it picks steal
//! victims among its peers, sampled with a bias toward high load.
//!
//! Inputs are fetched from the coordinator's artifact store into a
//! throwaway sandbox directory; outputs are uploaded back and referenced
//! by content address in the result.

use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use color_eyre::{Result, eyre::Context as _, eyre::bail};
use dashmap::DashMap;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument, trace, warn};

use foreman::sandbox::{ResourceLimits, SandboxSpec};
use protocol::Key;
use protocol::wire::{
    ActionRequest, ActionResult, ActionStatus, BlobPut, BlobRequest, HeartBeat, Message,
    PeerAnnounce, Registration, ResourceUsage, StealRequest, StealResponse, WorkRequest,
    WorkerId, read_frame, write_frame,
};

/// Synchronous steal requests give up after this long.
const STEAL_TIMEOUT: Duration = Duration::from_millis(100);
/// Upper bound for the steal backoff sleep.
const STEAL_BACKOFF_MAX: Duration = Duration::from_millis(100);

/// Worker tuning knobs.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub coordinator_addr: String,
    /// Where to accept steal connections; port 0 picks one.
    pub listen_addr: String,
    pub capabilities: BTreeSet<String>,
    pub max_concurrent: u32,
    pub queue_capacity: u32,
    pub heartbeat_interval: Duration,
    /// A victim keeps at least this many queued actions for itself.
    pub min_local_reserve: usize,
    /// How many candidate victims to sample per steal round.
    pub steal_sample: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4);
        Self {
            coordinator_addr: "127.0.0.1:9940".to_string(),
            listen_addr: "127.0.0.1:0".to_string(),
            capabilities: BTreeSet::from([std::env::consts::OS.to_string()]),
            max_concurrent: parallelism,
            queue_capacity: parallelism * 4,
            heartbeat_interval: Duration::from_secs(5),
            min_local_reserve: 1,
            steal_sample: 3,
        }
    }
}

/// The work-stealing deque: owner LIFO at the back, thieves FIFO at the
/// front.
#[derive(Debug, Default)]
pub struct Deque {
    inner: Mutex<VecDeque<ActionRequest>>,
    notify: tokio::sync::Notify,
}

impl Deque {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner-side push.
    pub fn push(&self, action: ActionRequest) {
        self.inner
            .lock()
            .expect("deque lock poisoned")
            .push_back(action);
        self.notify.notify_one();
    }

    /// Owner-side pop: most recently pushed first.
    pub fn pop(&self) -> Option<ActionRequest> {
        self.inner.lock().expect("deque lock poisoned").pop_back()
    }

    /// Thief-side steal: the oldest queued action, respecting the
    /// victim's local reserve and the thief's priority floor.
    pub fn steal(&self, reserve: usize, priority_floor: u32) -> Option<ActionRequest> {
        let mut inner = self.inner.lock().expect("deque lock poisoned");
        if inner.len() <= reserve {
            return None;
        }
        if inner.front()?.priority < priority_floor {
            return None;
        }
        inner.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("deque lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until something is pushed, up to `timeout`. Returns whether
    /// the deque is non-empty afterward.
    pub async fn wait_nonempty(&self, timeout: Duration) -> bool {
        if !self.is_empty() {
            return true;
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        !self.is_empty()
    }
}

/// What a worker knows about one peer.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub worker_id: WorkerId,
    pub address: String,
    pub load_factor: f64,
    pub queue_depth: u32,
    pub alive: bool,
    pub last_seen: Instant,
}

/// Registry of peers, updated from coordinator gossip.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<WorkerId, PeerInfo>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn observe(&self, announce: &PeerAnnounce) {
        self.peers.insert(
            announce.worker_id.clone(),
            PeerInfo {
                worker_id: announce.worker_id.clone(),
                address: announce.address.clone(),
                load_factor: announce.load_factor,
                queue_depth: announce.queue_depth,
                alive: true,
                last_seen: Instant::now(),
            },
        );
    }

    /// A peer that failed a network exchange is dead until it gossips
    /// again.
    pub fn mark_dead(&self, id: &WorkerId) {
        if let Some(mut peer) = self.peers.get_mut(id) {
            peer.alive = false;
        }
    }

    /// Sample up to `n` distinct live victims, weighted toward the most
    /// loaded peers (they have the most to give away).
    pub fn sample_victims(&self, n: usize, exclude: &WorkerId) -> Vec<PeerInfo> {
        let mut pool: Vec<PeerInfo> = self
            .peers
            .iter()
            .filter(|peer| peer.alive && &peer.worker_id != exclude && peer.queue_depth > 0)
            .map(|peer| peer.value().clone())
            .collect();
        let mut rng = rand::thread_rng();
        let mut victims = Vec::new();
        while victims.len() < n && !pool.is_empty() {
            let total: f64 = pool.iter().map(|p| p.load_factor.max(0.05)).sum();
            let mut roll = rng.gen_range(0.0..total);
            let mut pick = 0;
            for (i, peer) in pool.iter().enumerate() {
                roll -= peer.load_factor.max(0.05);
                if roll <= 0.0 {
                    pick = i;
                    break;
                }
            }
            victims.push(pool.swap_remove(pick));
        }
        victims
    }
}

/// A thin client for the coordinator's artifact endpoints. Opens one
/// short-lived connection per operation.
#[derive(Clone, Debug)]
pub struct ArtifactClient {
    addr: String,
}

impl ArtifactClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    #[instrument(name = "ArtifactClient::fetch", skip(self))]
    pub async fn fetch(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connect artifact store {}", self.addr))?;
        write_frame(&mut stream, &Message::BlobRequest(BlobRequest { key: *key })).await?;
        match read_frame(&mut stream).await? {
            Some(Message::BlobResponse(response)) if response.key == *key => {
                Ok(response.content)
            }
            other => bail!("unexpected artifact reply: {other:?}"),
        }
    }

    #[instrument(name = "ArtifactClient::upload", skip(self, content))]
    pub async fn upload(&self, key: &Key, content: Vec<u8>) -> Result<bool> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connect artifact store {}", self.addr))?;
        write_frame(
            &mut stream,
            &Message::BlobPut(BlobPut { key: *key, content }),
        )
        .await?;
        match read_frame(&mut stream).await? {
            Some(Message::BlobPutAck(ack)) if ack.key == *key => Ok(ack.new),
            other => bail!("unexpected artifact reply: {other:?}"),
        }
    }
}

/// A worker process: registers with the coordinator, executes actions,
/// steals when idle.
pub struct Worker {
    config: WorkerConfig,
    id: RwLock<WorkerId>,
    pub deque: Arc<Deque>,
    pub peers: Arc<PeerRegistry>,
    active: AtomicU32,
    steals: AtomicU64,
    disconnected: AtomicBool,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            // Placeholder until the coordinator's Registered ack arrives.
            id: RwLock::new(WorkerId(format!("pending-{}", uuid::Uuid::new_v4()))),
            deque: Arc::new(Deque::new()),
            peers: Arc::new(PeerRegistry::new()),
            active: AtomicU32::new(0),
            steals: AtomicU64::new(0),
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id.read().expect("id lock poisoned").clone()
    }

    /// Successful steals so far.
    pub fn steal_count(&self) -> u64 {
        self.steals.load(Ordering::Relaxed)
    }

    /// `0.7 * queue_fill + 0.3 * active_fill`, clamped to `[0, 1]`.
    pub fn load_factor(&self) -> f64 {
        let queue_fill = self.deque.len() as f64 / self.config.queue_capacity.max(1) as f64;
        let active_fill =
            self.active.load(Ordering::Relaxed) as f64 / self.config.max_concurrent.max(1) as f64;
        (0.7 * queue_fill + 0.3 * active_fill).clamp(0.0, 1.0)
    }

    /// Run until the coordinator connection closes and local work drains.
    #[instrument(skip(self), fields(coordinator = %self.config.coordinator_addr))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        // Steal listener first, so we can advertise its real address.
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("bind steal listener {}", self.config.listen_addr))?;
        let steal_addr = listener.local_addr().context("steal listener address")?;
        tokio::spawn(self.clone().steal_listener(listener));

        let stream = TcpStream::connect(&self.config.coordinator_addr)
            .await
            .with_context(|| format!("connect coordinator {}", self.config.coordinator_addr))?;
        let (mut reader, mut writer) = stream.into_split();
        let (tx, rx) = flume::unbounded::<Message>();
        tokio::spawn(async move {
            while let Ok(message) = rx.recv_async().await {
                if write_frame(&mut writer, &message).await.is_err() {
                    break;
                }
            }
        });

        tx.send(Message::Registration(Registration {
            worker_id: self.id(),
            address: steal_addr.to_string(),
            capabilities: self.config.capabilities.clone(),
            capacity: self.config.max_concurrent,
        }))
        .context("send registration")?;

        // Reader: adopt the assigned id, accept work, track peers.
        let read_worker = self.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(Message::Registered(registered))) => {
                        info!(worker = %registered.worker_id, "registered with coordinator");
                        *read_worker.id.write().expect("id lock poisoned") =
                            registered.worker_id;
                    }
                    Ok(Some(Message::ActionRequest(action))) => {
                        trace!(action = %action.id, "accepted work");
                        read_worker.deque.push(action);
                    }
                    Ok(Some(Message::PeerAnnounce(announce))) => {
                        if announce.worker_id != read_worker.id() {
                            read_worker.peers.observe(&announce);
                        }
                    }
                    Ok(Some(other)) => {
                        warn!(message = %other, "unexpected message at worker");
                    }
                    Ok(None) | Err(_) => {
                        read_worker.disconnected.store(true, Ordering::SeqCst);
                        read_worker.deque.notify.notify_waiters();
                        break;
                    }
                }
            }
        });

        // Heartbeats.
        let beat_worker = self.clone();
        let beat_tx = tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(beat_worker.config.heartbeat_interval);
            loop {
                interval.tick().await;
                let beat = Message::HeartBeat(HeartBeat {
                    worker_id: beat_worker.id(),
                    load_factor: beat_worker.load_factor(),
                    queue_depth: beat_worker.deque.len() as u32,
                    active_actions: beat_worker.active.load(Ordering::Relaxed),
                });
                if beat_tx.send(beat).is_err() {
                    break;
                }
            }
        });

        // Main loop: own work, then the coordinator, then peers.
        let artifacts = ArtifactClient::new(self.config.coordinator_addr.clone());
        let mut steal_attempts: u32 = 0;
        loop {
            if let Some(action) = self.deque.pop() {
                steal_attempts = 0;
                self.execute(action, &artifacts, &tx).await;
                continue;
            }
            if self.disconnected.load(Ordering::SeqCst) {
                info!("coordinator connection closed; worker draining out");
                return Ok(());
            }
            let _ = tx.send(Message::WorkRequest(WorkRequest {
                worker_id: self.id(),
                capacity: self.config.max_concurrent,
            }));
            if self.deque.wait_nonempty(Duration::from_millis(50)).await {
                continue;
            }
            if self.try_steal().await {
                steal_attempts = 0;
                continue;
            }
            // Nothing anywhere: back off with jitter, yielding while the
            // attempt count is low.
            steal_attempts = steal_attempts.saturating_add(1);
            if steal_attempts < 3 {
                tokio::task::yield_now().await;
            } else {
                let cap = STEAL_BACKOFF_MAX
                    .min(Duration::from_millis(1 << steal_attempts.min(7)));
                let jitter = rand::thread_rng().gen_range(0..=cap.as_millis() as u64);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
        }
    }

    /// Serve steal requests from peers. Spawned by [`Worker::run`];
    /// public so tests can drive the protocol directly.
    pub async fn steal_listener(self: Arc<Self>, listener: TcpListener) {
        loop {
            let Ok((mut stream, peer)) = listener.accept().await else {
                return;
            };
            trace!(?peer, "steal connection");
            let worker = self.clone();
            tokio::spawn(async move {
                while let Ok(Some(message)) = read_frame(&mut stream).await {
                    let Message::StealRequest(request) = message else {
                        warn!(message = %message, "unexpected message on steal port");
                        continue;
                    };
                    let action = worker
                        .deque
                        .steal(worker.config.min_local_reserve, request.priority_floor);
                    if let Some(action) = &action {
                        debug!(thief = %request.thief, action = %action.id, "giving up work");
                    }
                    let response = Message::StealResponse(StealResponse { action });
                    if write_frame(&mut stream, &response).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    /// One steal round over sampled victims. Returns whether anything was
    /// stolen.
    async fn try_steal(&self) -> bool {
        let victims = self
            .peers
            .sample_victims(self.config.steal_sample, &self.id());
        for victim in victims {
            match self.steal_from(&victim).await {
                Ok(Some(action)) => {
                    debug!(victim = %victim.worker_id, action = %action.id, "stole work");
                    self.steals.fetch_add(1, Ordering::Relaxed);
                    self.deque.push(action);
                    return true;
                }
                Ok(None) => {}
                Err(err) => {
                    trace!(victim = %victim.worker_id, %err, "steal failed; marking peer dead");
                    self.peers.mark_dead(&victim.worker_id);
                }
            }
        }
        false
    }

    async fn steal_from(&self, victim: &PeerInfo) -> Result<Option<ActionRequest>> {
        let exchange = async {
            let mut stream = TcpStream::connect(&victim.address)
                .await
                .with_context(|| format!("connect victim {}", victim.address))?;
            write_frame(
                &mut stream,
                &Message::StealRequest(StealRequest {
                    thief: self.id(),
                    victim: victim.worker_id.clone(),
                    priority_floor: 0,
                }),
            )
            .await?;
            read_frame(&mut stream).await
        };
        match tokio::time::timeout(STEAL_TIMEOUT, exchange).await {
            Ok(Ok(Some(Message::StealResponse(response)))) => Ok(response.action),
            Ok(Ok(other)) => bail!("unexpected steal reply: {other:?}"),
            Ok(Err(err)) => Err(err),
            Err(_) => bail!("steal request timed out"),
        }
    }

    /// Execute one action in a fresh sandbox directory and report the
    /// result.
    #[instrument(skip(self, action, artifacts, tx), fields(action = %action.id))]
    async fn execute(
        &self,
        action: ActionRequest,
        artifacts: &ArtifactClient,
        tx: &flume::Sender<Message>,
    ) {
        self.active.fetch_add(1, Ordering::SeqCst);
        let result = self.perform(&action, artifacts).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        let _ = tx.send(Message::ActionResult(result));
    }

    async fn perform(&self, action: &ActionRequest, artifacts: &ArtifactClient) -> ActionResult {
        let started = Instant::now();
        let mut result = ActionResult {
            id: action.id.clone(),
            status: ActionStatus::Error,
            duration_ms: 0,
            output_ids: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            resource_usage: ResourceUsage::default(),
        };

        let sandbox_dir =
            std::env::temp_dir().join(format!("relay-sandbox-{}", uuid::Uuid::new_v4()));
        if let Err(err) = tokio::fs::create_dir_all(&sandbox_dir).await {
            result.stderr = format!("create sandbox dir: {err}");
            return result;
        }

        match self
            .perform_inner(action, artifacts, &sandbox_dir, &mut result)
            .await
        {
            Ok(()) => {}
            Err(err) => {
                result.status = ActionStatus::Error;
                result.stderr = format!("{err:#}");
            }
        }

        if let Err(err) = tokio::fs::remove_dir_all(&sandbox_dir).await {
            warn!(?sandbox_dir, %err, "sandbox cleanup failed");
        }
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn perform_inner(
        &self,
        action: &ActionRequest,
        artifacts: &ArtifactClient,
        sandbox_dir: &PathBuf,
        result: &mut ActionResult,
    ) -> Result<()> {
        // Materialize inputs.
        let mut input_paths = Vec::new();
        for input in &action.inputs {
            let Some(content) = artifacts.fetch(&input.id).await? else {
                if input.optional {
                    continue;
                }
                bail!("required input {} ({}) is missing", input.path, input.id);
            };
            let path = sandbox_dir.join(&input.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create {parent:?}"))?;
            }
            tokio::fs::write(&path, &content)
                .await
                .with_context(|| format!("materialize {path:?}"))?;
            #[cfg(unix)]
            if input.executable {
                use std::os::unix::fs::PermissionsExt as _;
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                    .await
                    .with_context(|| format!("chmod {path:?}"))?;
            }
            input_paths.push(path);
        }

        let spec = SandboxSpec {
            input_paths,
            temp_paths: vec![sandbox_dir.clone()],
            output_paths: action
                .outputs
                .iter()
                .map(|output| sandbox_dir.join(&output.path))
                .collect(),
            env: action.env.clone(),
            workdir: Some(sandbox_dir.clone()),
            limits: ResourceLimits {
                timeout: Duration::from_millis(action.timeout_ms.max(1)),
                ..ResourceLimits::default()
            },
        };

        match foreman::sandbox::run(&spec, &action.command).await {
            Ok(output) => {
                result.stdout = output.stdout;
                result.stderr = output.stderr;
                result.exit_code = output.exit_code;
                result.resource_usage = ResourceUsage {
                    peak_memory_bytes: output.peak_memory_bytes,
                    cpu_time_ms: output.duration.as_millis() as u64,
                };
                if output.exit_code != 0 {
                    result.status = ActionStatus::Failure;
                    return Ok(());
                }
            }
            Err(err) => {
                // Sandbox-level problems (timeouts, limits) are errors,
                // not build failures.
                result.status = ActionStatus::Error;
                result.stderr = err.to_string();
                return Ok(());
            }
        }

        // Collect and upload outputs.
        for output in &action.outputs {
            let path = sandbox_dir.join(&output.path);
            let content = match tokio::fs::read(&path).await {
                Ok(content) => content,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound && output.optional => {
                    continue;
                }
                Err(err) => {
                    bail!("expected output {} missing: {err}", output.path);
                }
            };
            let key = Key::from_buffer(&content);
            artifacts.upload(&key, content).await?;
            result.output_ids.push((output.path.clone(), key));
        }
        result.status = ActionStatus::Success;
        Ok(())
    }
}
