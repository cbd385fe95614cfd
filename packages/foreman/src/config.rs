//! Engine configuration and the persisted state layout.
//!
//! Configuration loads from an optional TOML file; CLI flags override file
//! values. Everything has a sensible default so `foreman build` works with
//! no configuration at all.

use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::cache::CacheLimits;
use crate::retry::RetryPolicy;
use crate::target::Language;

/// Engine configuration.
///
/// The cache directory layout underneath `cache_dir`:
///
/// ```text
/// <cache_dir>/
///   cache.bin                 # target-level cache
///   actions/<lang>/cache.bin  # per-driver action caches
///   ast-incremental/          # AST symbol index
///   checkpoints/<run-id>      # append-only checkpoint records
///   artifacts/<xx>/<hash>     # content-addressed blob store
///   telemetry.json            # counters from the last build
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache_dir: PathBuf,
    /// Degree of parallelism; defaults to the number of CPU cores.
    pub jobs: usize,
    pub cache: CacheLimits,
    pub retry: RetryPolicy,
    /// Checkpoints older than this are ignored on resume.
    pub checkpoint_ttl_days: u64,
    /// Consecutive driver failures before the circuit breaker opens.
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".foreman"),
            jobs: num_cpus::get(),
            cache: CacheLimits::default(),
            retry: RetryPolicy::default(),
            checkpoint_ttl_days: 7,
            breaker_threshold: 5,
            breaker_cooldown_secs: 30,
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults.
    #[instrument]
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: Config = toml::from_str(&content)
                    .with_context(|| format!("parse config {path:?}"))?;
                debug!(?path, "loaded config");
                Ok(config)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).context(format!("read config {path:?}")),
        }
    }

    pub fn target_cache_path(&self) -> PathBuf {
        self.cache_dir.join("cache.bin")
    }

    pub fn actions_dir(&self) -> PathBuf {
        self.cache_dir.join("actions")
    }

    pub fn action_cache_path(&self, language: Language) -> PathBuf {
        self.actions_dir().join(language.as_ref()).join("cache.bin")
    }

    pub fn ast_dir(&self) -> PathBuf {
        self.cache_dir.join("ast-incremental")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.cache_dir.join("checkpoints")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.cache_dir.join("artifacts")
    }

    pub fn telemetry_path(&self) -> PathBuf {
        self.cache_dir.join("telemetry.json")
    }

    /// Create the on-disk layout (the `init` subcommand).
    pub fn init_layout(&self) -> Result<()> {
        for dir in [
            self.cache_dir.clone(),
            self.actions_dir(),
            self.ast_dir(),
            self.checkpoints_dir(),
            self.artifacts_dir(),
        ] {
            std::fs::create_dir_all(&dir).with_context(|| format!("create {dir:?}"))?;
        }
        Ok(())
    }
}
