//! The engine's error taxonomy.
//!
//! Fallible plumbing in this crate returns `color_eyre::Result` with context
//! frames, as usual. Build-path operations that the scheduler and retry
//! layer need to *classify* instead produce an [`EngineError`], which
//! carries a stable [`ErrorKind`], a code, contextual frames, and actionable
//! suggestions. An `EngineError` converts into an `eyre` report at the
//! boundary and can be recovered by downcast.

use std::fmt;

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Classification of an engine error.
///
/// The kind decides fatality and retryability:
/// - `Config` and `Graph` are fatal at load time (exit code 2).
/// - `FileSystem` is retryable only when flagged transient.
/// - `BuildFailure` and `ResourceLimit` are never retried.
/// - `System` and `Network` are retryable up to policy.
/// - `Cache` triggers discard-and-rebuild, never failure.
/// - `Internal` is an invariant violation and always fatal.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize,
)]
pub enum ErrorKind {
    Config,
    Graph,
    FileSystem,
    Cache,
    BuildFailure,
    System,
    Network,
    ResourceLimit,
    Internal,
}

impl ErrorKind {
    /// Stable machine-readable code for this kind.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Config => "E_CONFIG",
            ErrorKind::Graph => "E_GRAPH",
            ErrorKind::FileSystem => "E_FS",
            ErrorKind::Cache => "E_CACHE",
            ErrorKind::BuildFailure => "E_BUILD",
            ErrorKind::System => "E_SYSTEM",
            ErrorKind::Network => "E_NETWORK",
            ErrorKind::ResourceLimit => "E_RESOURCE",
            ErrorKind::Internal => "E_INTERNAL",
        }
    }

    /// Whether this kind is fatal at workspace load (exit code 2).
    pub fn is_configuration(self) -> bool {
        matches!(self, ErrorKind::Config | ErrorKind::Graph)
    }
}

/// A structured engine error.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    /// Contextual frames, innermost first: `while hashing a.c`, ...
    pub frames: Vec<String>,
    /// Actionable hints rendered to the user.
    pub suggestions: Vec<String>,
    /// Set on `FileSystem` errors that are worth retrying (e.g. EAGAIN).
    pub transient: bool,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            frames: Vec::new(),
            suggestions: Vec::new(),
            transient: false,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn graph(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Graph, message)
    }

    pub fn filesystem(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FileSystem, message)
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cache, message)
    }

    pub fn build_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BuildFailure, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn resource_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceLimit, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Classify an I/O error, marking transient kinds retryable.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let transient = matches!(
            err.kind(),
            Io::Interrupted | Io::WouldBlock | Io::TimedOut | Io::ResourceBusy
        );
        Self {
            transient,
            ..Self::filesystem(err.to_string())
        }
    }

    /// Push a contextual frame (`while <doing what>`).
    pub fn frame(mut self, frame: impl Into<String>) -> Self {
        self.frames.push(frame.into());
        self
    }

    /// Attach an actionable suggestion.
    pub fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// The first line of the message, for summary rendering.
    pub fn first_line(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        for frame in &self.frames {
            write!(f, "\n  while {frame}")?;
        }
        for suggestion in &self.suggestions {
            write!(f, "\n  hint: {suggestion}")?;
        }
        Ok(())
    }
}

impl std::error::Error for EngineError {}

/// Wrap any error as an `Internal` engine error, preserving the message.
impl From<color_eyre::Report> for EngineError {
    fn from(report: color_eyre::Report) -> Self {
        match report.downcast::<EngineError>() {
            Ok(err) => err,
            Err(report) => EngineError::internal(format!("{report:#}")),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn display_includes_code_frames_and_hints() {
        let err = EngineError::filesystem("missing source file src/a.c")
            .frame("hashing sources of //lib:a")
            .suggest("check that the file exists and is readable");
        let rendered = err.to_string();
        assert!(rendered.contains("[E_FS]"));
        assert!(rendered.contains("while hashing sources"));
        assert!(rendered.contains("hint: check that"));
    }

    #[test]
    fn round_trips_through_eyre() {
        let err = EngineError::build_failure("cc exited with status 1");
        let report = color_eyre::Report::new(err.clone());
        let recovered = EngineError::from(report);
        assert_eq!(recovered, err);
    }

    #[test]
    fn io_interrupted_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::Interrupted, "interrupted");
        assert!(EngineError::from_io(&io).transient);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(!EngineError::from_io(&io).transient);
    }
}
