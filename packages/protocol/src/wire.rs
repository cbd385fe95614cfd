//! Framed binary protocol for distributed builds.
//!
//! Every message on the wire is a frame: `[msg_type: 1 byte][length: 4 bytes
//! big-endian][payload]`. Payloads are a deterministic binary encoding:
//! integers are LEB128 varints (signed integers are zigzag-encoded first),
//! floats are 8 little-endian bytes of their bit pattern, strings and byte
//! buffers are length-prefixed, and maps/sets are encoded in sorted order.
//!
//! Field order within a message is part of the schema: no reordering is
//! permitted between schema versions. Decoders read exactly the fields they
//! know about and tolerate trailing bytes, so fields may be appended in a
//! future version without breaking old readers.

use std::collections::{BTreeMap, BTreeSet};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::Display;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Key;

/// Upper bound on a single frame's payload, to bound allocations on decode.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Identifier for a worker process.
///
/// Workers assign themselves a placeholder id at startup; the coordinator
/// replaces it with its own assigned id in the [`Registered`] ack, and the
/// worker must adopt the assigned id for all subsequent traffic.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A blob referenced by an action, addressed by content.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ArtifactSpec {
    /// Content address of the blob in the artifact store.
    pub id: Key,
    /// Sandbox-relative path where the blob is materialized (inputs) or
    /// collected from (outputs).
    pub path: String,
    /// Missing optional outputs do not fail the action.
    pub optional: bool,
    /// Whether the file is materialized with the executable bit set.
    pub executable: bool,
}

/// Terminal status of a dispatched action.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
pub enum ActionStatus {
    /// The command ran and exited zero.
    Success,
    /// The command ran and exited non-zero (a build failure, not retryable).
    Failure,
    /// The action could not be run to completion (infrastructure error).
    Error,
}

impl ActionStatus {
    fn code(self) -> u8 {
        match self {
            ActionStatus::Success => 0,
            ActionStatus::Failure => 1,
            ActionStatus::Error => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => ActionStatus::Success,
            1 => ActionStatus::Failure,
            2 => ActionStatus::Error,
            other => bail!("unknown action status code {other}"),
        })
    }
}

/// Resource accounting reported with an action result.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct ResourceUsage {
    pub peak_memory_bytes: u64,
    pub cpu_time_ms: u64,
}

/// A single unit of remote work: one command plus its declared inputs and
/// outputs, all content-addressed.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ActionRequest {
    /// Globally unique id for this dispatch, chosen by the submitter.
    pub id: String,
    /// Argv of the command to run inside the sandbox.
    pub command: Vec<String>,
    pub inputs: Vec<ArtifactSpec>,
    pub outputs: Vec<ArtifactSpec>,
    pub env: BTreeMap<String, String>,
    pub timeout_ms: u64,
    /// Higher values dispatch first.
    pub priority: u32,
    /// Capabilities a worker must advertise to be eligible.
    pub capabilities_required: BTreeSet<String>,
}

/// The outcome of executing an [`ActionRequest`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ActionResult {
    pub id: String,
    pub status: ActionStatus,
    pub duration_ms: u64,
    /// Collected outputs: sandbox-relative path and the content address the
    /// worker uploaded it under.
    pub output_ids: Vec<(String, Key)>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub resource_usage: ResourceUsage,
}

/// First message a worker sends on its coordinator connection.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Registration {
    /// Placeholder id; replaced by the coordinator's assignment.
    pub worker_id: WorkerId,
    /// Address where the worker accepts steal connections from peers.
    pub address: String,
    pub capabilities: BTreeSet<String>,
    /// Maximum concurrently executing actions.
    pub capacity: u32,
}

/// Coordinator's ack to a [`Registration`], carrying the assigned id.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Registered {
    pub worker_id: WorkerId,
}

/// Periodic liveness + load report from a worker.
#[derive(Clone, PartialEq, Debug)]
pub struct HeartBeat {
    pub worker_id: WorkerId,
    /// Scalar in `[0, 1]`: `0.7 * queue_fill + 0.3 * active_fill`.
    pub load_factor: f64,
    pub queue_depth: u32,
    pub active_actions: u32,
}

/// A worker with spare capacity asking the coordinator for work.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct WorkRequest {
    pub worker_id: WorkerId,
    /// How many actions the worker is willing to accept.
    pub capacity: u32,
}

/// Gossip about a peer, relayed by the coordinator to all workers.
#[derive(Clone, PartialEq, Debug)]
pub struct PeerAnnounce {
    pub worker_id: WorkerId,
    pub address: String,
    pub load_factor: f64,
    pub queue_depth: u32,
}

/// A thief asking a victim for its oldest queued action.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StealRequest {
    pub thief: WorkerId,
    pub victim: WorkerId,
    /// The victim only gives up actions at or above this priority.
    pub priority_floor: u32,
}

/// The victim's answer: the oldest matching action, if it had one to spare.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StealResponse {
    pub action: Option<ActionRequest>,
}

/// Fetch a blob from the artifact store.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlobRequest {
    pub key: Key,
}

/// Blob fetch reply; `content` is `None` when the blob is absent.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlobResponse {
    pub key: Key,
    pub content: Option<Vec<u8>>,
}

/// Upload a blob to the artifact store.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlobPut {
    pub key: Key,
    pub content: Vec<u8>,
}

/// Upload ack; `new` is false when the blob already existed (dedup).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlobPutAck {
    pub key: Key,
    pub new: bool,
}

/// Ask for the chunk manifest of a large blob, enabling resumable fetches.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ManifestRequest {
    pub key: Key,
}

/// Manifest reply; `chunks` is `None` when the blob is not chunked.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ManifestResponse {
    pub key: Key,
    pub chunks: Option<Vec<Key>>,
}

/// Every message that can appear on the wire.
#[derive(Clone, PartialEq, Debug, Display)]
pub enum Message {
    #[display("Registration")]
    Registration(Registration),
    #[display("HeartBeat")]
    HeartBeat(HeartBeat),
    #[display("WorkRequest")]
    WorkRequest(WorkRequest),
    #[display("ActionRequest")]
    ActionRequest(ActionRequest),
    #[display("ActionResult")]
    ActionResult(ActionResult),
    #[display("PeerAnnounce")]
    PeerAnnounce(PeerAnnounce),
    #[display("StealRequest")]
    StealRequest(StealRequest),
    #[display("StealResponse")]
    StealResponse(StealResponse),
    #[display("Registered")]
    Registered(Registered),
    #[display("BlobRequest")]
    BlobRequest(BlobRequest),
    #[display("BlobResponse")]
    BlobResponse(BlobResponse),
    #[display("BlobPut")]
    BlobPut(BlobPut),
    #[display("BlobPutAck")]
    BlobPutAck(BlobPutAck),
    #[display("ManifestRequest")]
    ManifestRequest(ManifestRequest),
    #[display("ManifestResponse")]
    ManifestResponse(ManifestResponse),
}

impl Message {
    /// The `msg_type` byte for this message.
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Registration(_) => 1,
            Message::HeartBeat(_) => 2,
            Message::WorkRequest(_) => 3,
            Message::ActionRequest(_) => 4,
            Message::ActionResult(_) => 5,
            Message::PeerAnnounce(_) => 6,
            Message::StealRequest(_) => 7,
            Message::StealResponse(_) => 8,
            Message::Registered(_) => 9,
            Message::BlobRequest(_) => 10,
            Message::BlobResponse(_) => 11,
            Message::BlobPut(_) => 12,
            Message::BlobPutAck(_) => 13,
            Message::ManifestRequest(_) => 14,
            Message::ManifestResponse(_) => 15,
        }
    }

    /// Encode the payload (frame header excluded).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Message::Registration(m) => {
                w.put_str(m.worker_id.as_str());
                w.put_str(&m.address);
                w.put_str_set(&m.capabilities);
                w.put_u64(u64::from(m.capacity));
            }
            Message::HeartBeat(m) => {
                w.put_str(m.worker_id.as_str());
                w.put_f64(m.load_factor);
                w.put_u64(u64::from(m.queue_depth));
                w.put_u64(u64::from(m.active_actions));
            }
            Message::WorkRequest(m) => {
                w.put_str(m.worker_id.as_str());
                w.put_u64(u64::from(m.capacity));
            }
            Message::ActionRequest(m) => put_action_request(&mut w, m),
            Message::ActionResult(m) => {
                w.put_str(&m.id);
                w.put_u8(m.status.code());
                w.put_u64(m.duration_ms);
                w.put_u64(m.output_ids.len() as u64);
                for (path, key) in &m.output_ids {
                    w.put_str(path);
                    w.put_key(key);
                }
                w.put_str(&m.stdout);
                w.put_str(&m.stderr);
                w.put_i32(m.exit_code);
                w.put_u64(m.resource_usage.peak_memory_bytes);
                w.put_u64(m.resource_usage.cpu_time_ms);
            }
            Message::PeerAnnounce(m) => {
                w.put_str(m.worker_id.as_str());
                w.put_str(&m.address);
                w.put_f64(m.load_factor);
                w.put_u64(u64::from(m.queue_depth));
            }
            Message::StealRequest(m) => {
                w.put_str(m.thief.as_str());
                w.put_str(m.victim.as_str());
                w.put_u64(u64::from(m.priority_floor));
            }
            Message::StealResponse(m) => match &m.action {
                Some(action) => {
                    w.put_bool(true);
                    put_action_request(&mut w, action);
                }
                None => w.put_bool(false),
            },
            Message::Registered(m) => w.put_str(m.worker_id.as_str()),
            Message::BlobRequest(m) => w.put_key(&m.key),
            Message::BlobResponse(m) => {
                w.put_key(&m.key);
                match &m.content {
                    Some(content) => {
                        w.put_bool(true);
                        w.put_bytes(content);
                    }
                    None => w.put_bool(false),
                }
            }
            Message::BlobPut(m) => {
                w.put_key(&m.key);
                w.put_bytes(&m.content);
            }
            Message::BlobPutAck(m) => {
                w.put_key(&m.key);
                w.put_bool(m.new);
            }
            Message::ManifestRequest(m) => w.put_key(&m.key),
            Message::ManifestResponse(m) => {
                w.put_key(&m.key);
                match &m.chunks {
                    Some(chunks) => {
                        w.put_bool(true);
                        w.put_u64(chunks.len() as u64);
                        for chunk in chunks {
                            w.put_key(chunk);
                        }
                    }
                    None => w.put_bool(false),
                }
            }
        }
        w.into_bytes()
    }

    /// Decode a payload for the given `msg_type` byte.
    pub fn decode_payload(msg_type: u8, payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let message = match msg_type {
            1 => Message::Registration(Registration {
                worker_id: WorkerId(r.str()?),
                address: r.str()?,
                capabilities: r.str_set()?,
                capacity: r.u32()?,
            }),
            2 => Message::HeartBeat(HeartBeat {
                worker_id: WorkerId(r.str()?),
                load_factor: r.f64()?,
                queue_depth: r.u32()?,
                active_actions: r.u32()?,
            }),
            3 => Message::WorkRequest(WorkRequest {
                worker_id: WorkerId(r.str()?),
                capacity: r.u32()?,
            }),
            4 => Message::ActionRequest(take_action_request(&mut r)?),
            5 => {
                let id = r.str()?;
                let status = ActionStatus::from_code(r.u8()?)?;
                let duration_ms = r.u64()?;
                let count = r.u64()? as usize;
                let mut output_ids = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let path = r.str()?;
                    let key = r.key()?;
                    output_ids.push((path, key));
                }
                Message::ActionResult(ActionResult {
                    id,
                    status,
                    duration_ms,
                    output_ids,
                    stdout: r.str()?,
                    stderr: r.str()?,
                    exit_code: r.i32()?,
                    resource_usage: ResourceUsage {
                        peak_memory_bytes: r.u64()?,
                        cpu_time_ms: r.u64()?,
                    },
                })
            }
            6 => Message::PeerAnnounce(PeerAnnounce {
                worker_id: WorkerId(r.str()?),
                address: r.str()?,
                load_factor: r.f64()?,
                queue_depth: r.u32()?,
            }),
            7 => Message::StealRequest(StealRequest {
                thief: WorkerId(r.str()?),
                victim: WorkerId(r.str()?),
                priority_floor: r.u32()?,
            }),
            8 => Message::StealResponse(StealResponse {
                action: if r.bool()? {
                    Some(take_action_request(&mut r)?)
                } else {
                    None
                },
            }),
            9 => Message::Registered(Registered {
                worker_id: WorkerId(r.str()?),
            }),
            10 => Message::BlobRequest(BlobRequest { key: r.key()? }),
            11 => {
                let key = r.key()?;
                let content = if r.bool()? { Some(r.bytes()?) } else { None };
                Message::BlobResponse(BlobResponse { key, content })
            }
            12 => Message::BlobPut(BlobPut {
                key: r.key()?,
                content: r.bytes()?,
            }),
            13 => Message::BlobPutAck(BlobPutAck {
                key: r.key()?,
                new: r.bool()?,
            }),
            14 => Message::ManifestRequest(ManifestRequest { key: r.key()? }),
            15 => {
                let key = r.key()?;
                let chunks = if r.bool()? {
                    let count = r.u64()? as usize;
                    let mut chunks = Vec::with_capacity(count.min(1024));
                    for _ in 0..count {
                        chunks.push(r.key()?);
                    }
                    Some(chunks)
                } else {
                    None
                };
                Message::ManifestResponse(ManifestResponse { key, chunks })
            }
            other => bail!("unknown message type {other}"),
        };
        Ok(message)
    }
}

fn put_action_request(w: &mut Writer, m: &ActionRequest) {
    w.put_str(&m.id);
    w.put_u64(m.command.len() as u64);
    for arg in &m.command {
        w.put_str(arg);
    }
    put_artifact_specs(w, &m.inputs);
    put_artifact_specs(w, &m.outputs);
    w.put_u64(m.env.len() as u64);
    for (k, v) in &m.env {
        w.put_str(k);
        w.put_str(v);
    }
    w.put_u64(m.timeout_ms);
    w.put_u64(u64::from(m.priority));
    w.put_str_set(&m.capabilities_required);
}

fn put_artifact_specs(w: &mut Writer, specs: &[ArtifactSpec]) {
    w.put_u64(specs.len() as u64);
    for spec in specs {
        w.put_key(&spec.id);
        w.put_str(&spec.path);
        w.put_bool(spec.optional);
        w.put_bool(spec.executable);
    }
}

fn take_action_request(r: &mut Reader<'_>) -> Result<ActionRequest> {
    let id = r.str()?;
    let count = r.u64()? as usize;
    let mut command = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        command.push(r.str()?);
    }
    let inputs = take_artifact_specs(r)?;
    let outputs = take_artifact_specs(r)?;
    let count = r.u64()? as usize;
    let mut env = BTreeMap::new();
    for _ in 0..count {
        let k = r.str()?;
        let v = r.str()?;
        env.insert(k, v);
    }
    Ok(ActionRequest {
        id,
        command,
        inputs,
        outputs,
        env,
        timeout_ms: r.u64()?,
        priority: r.u32()?,
        capabilities_required: r.str_set()?,
    })
}

fn take_artifact_specs(r: &mut Reader<'_>) -> Result<Vec<ArtifactSpec>> {
    let count = r.u64()? as usize;
    let mut specs = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        specs.push(ArtifactSpec {
            id: r.key()?,
            path: r.str()?,
            optional: r.bool()?,
            executable: r.bool()?,
        });
    }
    Ok(specs)
}

/// Write one framed message to the stream.
pub async fn write_frame<W>(stream: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = message.encode_payload();
    if payload.len() > MAX_FRAME_LEN as usize {
        bail!("frame payload too large: {} bytes", payload.len());
    }
    let mut header = [0u8; 5];
    header[0] = message.msg_type();
    header[1..5].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    stream.write_all(&header).await.context("write frame header")?;
    stream.write_all(&payload).await.context("write frame payload")?;
    stream.flush().await.context("flush frame")?;
    Ok(())
}

/// Read one framed message from the stream.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("read frame header"),
    }
    let msg_type = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_FRAME_LEN {
        bail!("frame payload too large: {len} bytes");
    }
    let mut payload = vec![0u8; len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .context("read frame payload")?;
    Message::decode_payload(msg_type, &payload).map(Some)
}

/// Append-only buffer with the protocol's primitive encoders.
///
/// Also used by the on-disk cache codec, which shares the same primitive
/// encoding (varints, length-prefixed fields).
#[derive(Clone, Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// LEB128 unsigned varint.
    pub fn put_u64(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Zigzag-encoded signed varint.
    pub fn put_i32(&mut self, value: i32) {
        let zigzag = ((value << 1) ^ (value >> 31)) as u32;
        self.put_u64(u64::from(zigzag));
    }

    /// Zigzag-encoded signed varint, 64-bit.
    pub fn put_i64(&mut self, value: i64) {
        let zigzag = ((value << 1) ^ (value >> 63)) as u64;
        self.put_u64(zigzag);
    }

    /// Bit pattern of the float, 8 little-endian bytes.
    pub fn put_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    /// Raw 32 bytes, no length prefix (keys are fixed-width).
    pub fn put_key(&mut self, key: &Key) {
        self.buf.extend_from_slice(key.as_bytes());
    }

    pub fn put_str_set(&mut self, set: &BTreeSet<String>) {
        self.put_u64(set.len() as u64);
        for item in set {
            self.put_str(item);
        }
    }
}

/// Cursor over a payload with the protocol's primitive decoders.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!(
                "truncated payload: wanted {n} bytes, {} remaining",
                self.remaining()
            );
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u64(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            if shift >= 64 {
                bail!("varint overflows u64");
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn u32(&mut self) -> Result<u32> {
        let value = self.u64()?;
        u32::try_from(value).context("varint overflows u32")
    }

    pub fn i32(&mut self) -> Result<i32> {
        let zigzag = self.u32()?;
        Ok(((zigzag >> 1) as i32) ^ -((zigzag & 1) as i32))
    }

    pub fn i64(&mut self) -> Result<i64> {
        let zigzag = self.u64()?;
        Ok(((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64))
    }

    pub fn f64(&mut self) -> Result<f64> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(f64::from_bits(u64::from_le_bytes(buf)))
    }

    pub fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => bail!("invalid bool byte {other}"),
        }
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u64()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn str(&mut self) -> Result<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes).context("decode utf-8 string")
    }

    pub fn key(&mut self) -> Result<Key> {
        let bytes = self.take(32)?;
        Key::from_bytes(bytes)
    }

    pub fn str_set(&mut self) -> Result<BTreeSet<String>> {
        let count = self.u64()? as usize;
        let mut set = BTreeSet::new();
        for _ in 0..count {
            set.insert(self.str()?);
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn sample_action() -> ActionRequest {
        ActionRequest {
            id: "act-1".into(),
            command: vec!["cc".into(), "-c".into(), "a.c".into()],
            inputs: vec![ArtifactSpec {
                id: Key::from_buffer(b"input"),
                path: "src/a.c".into(),
                optional: false,
                executable: false,
            }],
            outputs: vec![ArtifactSpec {
                id: Key::from_buffer(b"output"),
                path: "out/a.o".into(),
                optional: true,
                executable: false,
            }],
            env: BTreeMap::from([("CC".to_string(), "clang".to_string())]),
            timeout_ms: 60_000,
            priority: 7,
            capabilities_required: BTreeSet::from(["linux".to_string()]),
        }
    }

    fn round_trip(message: Message) -> Message {
        let payload = message.encode_payload();
        Message::decode_payload(message.msg_type(), &payload).unwrap()
    }

    #[test]
    fn action_request_round_trip() {
        let message = Message::ActionRequest(sample_action());
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn action_result_round_trip() {
        let message = Message::ActionResult(ActionResult {
            id: "act-1".into(),
            status: ActionStatus::Failure,
            duration_ms: 1234,
            output_ids: vec![("out/a.o".into(), Key::from_buffer(b"obj"))],
            stdout: "compiling".into(),
            stderr: "error: oops".into(),
            exit_code: -11,
            resource_usage: ResourceUsage {
                peak_memory_bytes: 1 << 20,
                cpu_time_ms: 900,
            },
        });
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn steal_round_trips_both_arms() {
        let empty = Message::StealResponse(StealResponse { action: None });
        assert_eq!(round_trip(empty.clone()), empty);

        let full = Message::StealResponse(StealResponse {
            action: Some(sample_action()),
        });
        assert_eq!(round_trip(full.clone()), full);
    }

    #[test]
    fn unknown_message_type_is_an_error() {
        assert!(Message::decode_payload(200, &[]).is_err());
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let message = Message::Registered(Registered {
            worker_id: WorkerId("w-123".into()),
        });
        let payload = message.encode_payload();
        assert!(Message::decode_payload(9, &payload[..payload.len() - 1]).is_err());
    }

    #[test]
    fn trailing_bytes_are_tolerated() {
        let message = Message::BlobRequest(BlobRequest {
            key: Key::from_buffer(b"blob"),
        });
        let mut payload = message.encode_payload();
        payload.extend_from_slice(b"future-field");
        assert_eq!(Message::decode_payload(10, &payload).unwrap(), message);
    }

    #[tokio::test]
    async fn frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024 * 1024);
        let message = Message::HeartBeat(HeartBeat {
            worker_id: WorkerId("w-1".into()),
            load_factor: 0.35,
            queue_depth: 4,
            active_actions: 2,
        });
        write_frame(&mut a, &message).await.unwrap();
        drop(a);
        let decoded = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    proptest! {
        #[test]
        fn varint_round_trip(value: u64) {
            let mut w = Writer::new();
            w.put_u64(value);
            let bytes = w.into_bytes();
            let mut r = Reader::new(&bytes);
            prop_assert_eq!(r.u64().unwrap(), value);
            prop_assert_eq!(r.remaining(), 0);
        }

        #[test]
        fn zigzag_round_trip(value: i32) {
            let mut w = Writer::new();
            w.put_i32(value);
            let bytes = w.into_bytes();
            let mut r = Reader::new(&bytes);
            prop_assert_eq!(r.i32().unwrap(), value);
        }

        #[test]
        fn zigzag64_round_trip(value: i64) {
            let mut w = Writer::new();
            w.put_i64(value);
            let bytes = w.into_bytes();
            let mut r = Reader::new(&bytes);
            prop_assert_eq!(r.i64().unwrap(), value);
        }

        #[test]
        fn string_round_trip(value in ".*") {
            let mut w = Writer::new();
            w.put_str(&value);
            let bytes = w.into_bytes();
            let mut r = Reader::new(&bytes);
            prop_assert_eq!(r.str().unwrap(), value);
        }
    }
}
