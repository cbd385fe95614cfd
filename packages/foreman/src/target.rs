//! Targets and workspace configuration.
//!
//! Targets arrive pre-parsed: the surface DSL, glob expansion, and label
//! resolution happen in an external loader. The contract at this boundary
//! is that every `deps` entry references an existing target id, sources are
//! concrete paths, and the language is a recognized enum value.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Stable identifier for a build target: a label-like string such as
/// `//tools/compiler:frontend`. Unique within a workspace.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct TargetId(pub String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What the target produces.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize,
)]
pub enum TargetKind {
    Executable,
    Library,
    Test,
    Custom,
}

/// Languages the engine recognizes. Each maps to a registered driver.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Rust,
    C,
    Cpp,
    Go,
    Python,
    JavaScript,
    TypeScript,
    Java,
}

impl Language {
    /// Guess the language from a file extension, for driver selection
    /// during workspace analysis.
    pub fn from_extension(ext: &str) -> Option<Self> {
        Some(match ext {
            "rs" => Language::Rust,
            "c" | "h" => Language::C,
            "cc" | "cpp" | "cxx" | "hpp" | "hh" => Language::Cpp,
            "go" => Language::Go,
            "py" => Language::Python,
            "js" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "tsx" => Language::TypeScript,
            "java" => Language::Java,
            _ => return None,
        })
    }
}

/// A declarative build target. Immutable after parsing.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub kind: TargetKind,
    pub language: Language,
    /// Ordered source paths, globs already expanded by the loader.
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    /// Resolved dependency ids.
    #[serde(default)]
    pub deps: BTreeSet<TargetId>,
    /// Ordered toolchain flags.
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

impl Target {
    pub fn new(id: impl Into<TargetId>, kind: TargetKind, language: Language) -> Self {
        Self {
            id: id.into(),
            kind,
            language,
            sources: Vec::new(),
            deps: BTreeSet::new(),
            flags: Vec::new(),
            env: BTreeMap::new(),
            output_path: None,
        }
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The parsed workspace: root directory plus every target in it.
///
/// Owned exclusively by the invocation; graph nodes borrow targets from it
/// by value at construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
    pub targets: Vec<Target>,
}

impl WorkspaceConfig {
    /// Check the loader contract: every dep must reference a known target.
    ///
    /// Duplicate ids are rejected later, at graph insertion, where the
    /// offending insertion order is known.
    pub fn validate(&self) -> EngineResult<()> {
        let known: BTreeSet<&TargetId> = self.targets.iter().map(|t| &t.id).collect();
        for target in &self.targets {
            for dep in &target.deps {
                if !known.contains(dep) {
                    return Err(EngineError::graph(format!(
                        "target {} depends on unknown target {dep}",
                        target.id
                    ))
                    .suggest(format!(
                        "declare {dep} in the workspace or remove it from {}'s deps",
                        target.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn lib(id: &str) -> Target {
        Target::new(id, TargetKind::Library, Language::C)
    }

    #[test]
    fn unknown_dep_is_a_graph_error() {
        let mut target = lib("//a");
        target.deps.insert(TargetId::from("//missing"));
        let workspace = WorkspaceConfig {
            root: PathBuf::from("/ws"),
            targets: vec![target],
        };
        let err = workspace.validate().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Graph);
        assert!(err.message.contains("//missing"));
    }

    #[test]
    fn language_parses_from_lowercase() {
        use std::str::FromStr;
        assert_eq!(Language::from_str("rust").unwrap(), Language::Rust);
        assert!(Language::from_str("cobol").is_err());
    }
}
