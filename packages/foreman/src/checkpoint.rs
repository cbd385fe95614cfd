//! Checkpointing: durable progress records enabling `foreman resume`.
//!
//! Each run writes an append-only file under `<cache_dir>/checkpoints/`:
//! a header line (graph structural hash, tool version, creation time)
//! followed by one JSON line per completed target. On resume, the latest
//! non-stale checkpoint seeds the completed set; stale checkpoints are
//! ignored entirely.
//!
//! A checkpoint is stale when the graph's structural hash changed, the
//! tool version changed, or the checkpoint is older than the configured
//! TTL (default 7 days).

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use color_eyre::{Result, eyre::Context};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::hash::Key;
use crate::target::TargetId;

const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One completed target.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub target_id: TargetId,
    pub build_hash: Key,
    pub timestamp: Timestamp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CheckpointHeader {
    graph_hash: u64,
    tool_version: String,
    created_at: Timestamp,
}

/// The current run's append-only checkpoint file.
pub struct CheckpointLog {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl CheckpointLog {
    /// Start a new checkpoint for this run.
    #[instrument]
    pub fn create(dir: &Path, run_id: &str, graph_hash: u64) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("create {dir:?}"))?;
        let path = dir.join(run_id);
        let mut file = std::fs::File::create(&path)
            .with_context(|| format!("create checkpoint {path:?}"))?;
        let header = CheckpointHeader {
            graph_hash,
            tool_version: TOOL_VERSION.to_string(),
            created_at: Timestamp::now(),
        };
        let line = serde_json::to_string(&header).context("serialize checkpoint header")?;
        writeln!(file, "{line}").context("write checkpoint header")?;
        file.flush().context("flush checkpoint header")?;
        debug!(?path, graph_hash, "created checkpoint");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one completed target. Flushed immediately so an interrupted
    /// run loses at most the in-flight record.
    pub fn append(&self, record: &CheckpointRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("serialize checkpoint record")?;
        let mut file = self.file.lock().expect("checkpoint lock poisoned");
        writeln!(file, "{line}").context("append checkpoint record")?;
        file.flush().context("flush checkpoint record")
    }

    /// Read the newest non-stale checkpoint in `dir`, returning the
    /// completed targets it recorded.
    #[instrument]
    pub fn load_latest(
        dir: &Path,
        graph_hash: u64,
        ttl: Duration,
    ) -> Result<Option<BTreeMap<TargetId, Key>>> {
        let mut newest: Option<(Timestamp, PathBuf)> = None;
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context(format!("read {dir:?}")),
        };
        for entry in entries {
            let entry = entry.context("read checkpoint dir entry")?;
            let path = entry.path();
            let Some(header) = read_header(&path)? else {
                continue;
            };
            if newest
                .as_ref()
                .is_none_or(|(created, _)| header.created_at > *created)
            {
                newest = Some((header.created_at, path));
            }
        }
        let Some((_, path)) = newest else {
            return Ok(None);
        };
        Self::load_file(&path, graph_hash, ttl)
    }

    fn load_file(
        path: &Path,
        graph_hash: u64,
        ttl: Duration,
    ) -> Result<Option<BTreeMap<TargetId, Key>>> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;
        let mut lines = content.lines();
        let Some(header_line) = lines.next() else {
            return Ok(None);
        };
        let header: CheckpointHeader = match serde_json::from_str(header_line) {
            Ok(header) => header,
            Err(err) => {
                warn!(?path, %err, "ignoring checkpoint with unreadable header");
                return Ok(None);
            }
        };

        if header.graph_hash != graph_hash {
            debug!(?path, "checkpoint stale: graph changed");
            return Ok(None);
        }
        if header.tool_version != TOOL_VERSION {
            debug!(?path, "checkpoint stale: tool version changed");
            return Ok(None);
        }
        let age_ms = Timestamp::now().as_millisecond() - header.created_at.as_millisecond();
        if age_ms < 0 || age_ms as u128 > ttl.as_millis() {
            debug!(?path, "checkpoint stale: past ttl");
            return Ok(None);
        }

        let mut completed = BTreeMap::new();
        for line in lines {
            // A torn final record from an interrupted run is expected;
            // everything before it is still valid.
            match serde_json::from_str::<CheckpointRecord>(line) {
                Ok(record) => {
                    completed.insert(record.target_id, record.build_hash);
                }
                Err(err) => {
                    warn!(?path, %err, "ignoring torn checkpoint record");
                    break;
                }
            }
        }
        debug!(?path, targets = completed.len(), "loaded checkpoint");
        Ok(Some(completed))
    }
}

fn read_header(path: &Path) -> Result<Option<CheckpointHeader>> {
    use std::io::BufRead as _;
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).context(format!("open {path:?}")),
    };
    let mut line = String::new();
    let mut reader = std::io::BufReader::new(file);
    if reader.read_line(&mut line).unwrap_or(0) == 0 {
        return Ok(None);
    }
    Ok(serde_json::from_str(&line).ok())
}
