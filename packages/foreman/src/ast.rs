//! Per-file symbol index for symbol-level incremental builds.
//!
//! Language drivers parse sources into a [`FileAst`]: the file's symbols,
//! each with a content hash over its own text, plus the file's includes.
//! The [`SymbolIndex`] holds the latest parsed state of every file and
//! answers the reverse question the analyzer needs: given a symbol name,
//! which files define it, and which files reference it.
//!
//! The index persists as JSON under `<cache_dir>/ast-incremental/`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::hash::Key;

/// The kind of a parsed symbol.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum SymbolKind {
    Function,
    Struct,
    Trait,
    Constant,
    Module,
    Other,
}

/// One symbol in a parsed file.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AstSymbol {
    pub name: String,
    pub kind: SymbolKind,
    /// Byte span of the symbol's text within the file.
    pub span: (u32, u32),
    pub signature: String,
    /// Hash of the symbol's own text; the unit of change detection.
    pub content_hash: Key,
    /// Names of symbols this symbol's body references.
    pub referenced_symbols: BTreeSet<String>,
}

/// The parsed index of a single file.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct FileAst {
    pub file_path: PathBuf,
    /// Strong content hash of the file at `parsed_at`.
    pub file_hash: Key,
    pub symbols: Vec<AstSymbol>,
    /// Files textually included/imported by this file.
    pub includes: BTreeSet<PathBuf>,
    pub parsed_at: Timestamp,
}

impl FileAst {
    pub fn symbol(&self, name: &str) -> Option<&AstSymbol> {
        self.symbols.iter().find(|s| s.name == name)
    }
}

/// Index of every parsed file plus derived cross-file symbol tables.
#[derive(Clone, Debug, Default)]
pub struct SymbolIndex {
    files: BTreeMap<PathBuf, FileAst>,
    /// symbol name → files defining it.
    defining_files: BTreeMap<String, BTreeSet<PathBuf>>,
    /// symbol name → files whose symbols reference it.
    referencing_files: BTreeMap<String, BTreeSet<PathBuf>>,
}

/// On-disk shape: just the per-file ASTs; reverse tables are derived.
#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    files: BTreeMap<PathBuf, FileAst>,
}

impl SymbolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&FileAst> {
        self.files.get(path)
    }

    pub fn files(&self) -> impl Iterator<Item = (&PathBuf, &FileAst)> {
        self.files.iter()
    }

    pub fn total_symbols(&self) -> usize {
        self.files.values().map(|f| f.symbols.len()).sum()
    }

    /// Insert or replace a file's AST, updating the reverse tables.
    pub fn insert(&mut self, ast: FileAst) {
        self.remove(&ast.file_path.clone());
        for symbol in &ast.symbols {
            self.defining_files
                .entry(symbol.name.clone())
                .or_default()
                .insert(ast.file_path.clone());
            for referenced in &symbol.referenced_symbols {
                self.referencing_files
                    .entry(referenced.clone())
                    .or_default()
                    .insert(ast.file_path.clone());
            }
        }
        self.files.insert(ast.file_path.clone(), ast);
    }

    /// Drop a file from the index (deleted on disk).
    pub fn remove(&mut self, path: &Path) {
        let Some(previous) = self.files.remove(path) else {
            return;
        };
        for symbol in &previous.symbols {
            if let Some(set) = self.defining_files.get_mut(&symbol.name) {
                set.remove(path);
                if set.is_empty() {
                    self.defining_files.remove(&symbol.name);
                }
            }
            for referenced in &symbol.referenced_symbols {
                if let Some(set) = self.referencing_files.get_mut(referenced) {
                    set.remove(path);
                    if set.is_empty() {
                        self.referencing_files.remove(referenced);
                    }
                }
            }
        }
    }

    /// Files that define a symbol with this name.
    pub fn defining_files(&self, name: &str) -> BTreeSet<PathBuf> {
        self.defining_files.get(name).cloned().unwrap_or_default()
    }

    /// Files whose symbols reference this name.
    pub fn referencing_files(&self, name: &str) -> BTreeSet<PathBuf> {
        self.referencing_files.get(name).cloned().unwrap_or_default()
    }

    /// The files a given symbol depends on: for each name it references,
    /// every file defining that name (excluding its own file).
    pub fn symbol_dependency_files(&self, file: &Path, symbol: &AstSymbol) -> BTreeSet<PathBuf> {
        let mut deps = BTreeSet::new();
        for referenced in &symbol.referenced_symbols {
            for defining in self.defining_files(referenced) {
                if defining != file {
                    deps.insert(defining);
                }
            }
        }
        deps
    }

    /// Load the index from `<dir>/index.json`. A missing or corrupt file
    /// yields an empty index (the analyzer then classifies everything as
    /// new, which is safe).
    #[instrument]
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("index.json");
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new());
            }
            Err(err) => return Err(err).context(format!("read {path:?}")),
        };
        let persisted: PersistedIndex = match serde_json::from_slice(&content) {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!(?path, %err, "discarding corrupt ast index");
                return Ok(Self::new());
            }
        };
        let mut index = Self::new();
        for (_, ast) in persisted.files {
            index.insert(ast);
        }
        debug!(files = index.len(), "loaded ast index");
        Ok(index)
    }

    /// Persist the index to `<dir>/index.json` atomically.
    #[instrument(skip(self))]
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("create {dir:?}"))?;
        let path = dir.join("index.json");
        let temp = dir.join(".index.json.tmp");
        let persisted = PersistedIndex {
            files: self.files.clone(),
        };
        let content = serde_json::to_vec(&persisted).context("serialize ast index")?;
        std::fs::write(&temp, content).with_context(|| format!("write {temp:?}"))?;
        std::fs::rename(&temp, &path).with_context(|| format!("rename {temp:?}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) fn symbol(name: &str, body: &str, refs: &[&str]) -> AstSymbol {
        AstSymbol {
            name: name.to_string(),
            kind: SymbolKind::Function,
            span: (0, body.len() as u32),
            signature: format!("fn {name}()"),
            content_hash: Key::from_buffer(body.as_bytes()),
            referenced_symbols: refs.iter().map(|r| r.to_string()).collect(),
        }
    }

    pub(crate) fn file(path: &str, symbols: Vec<AstSymbol>) -> FileAst {
        let combined: Vec<u8> = symbols
            .iter()
            .flat_map(|s| s.content_hash.as_bytes().to_vec())
            .collect();
        FileAst {
            file_path: PathBuf::from(path),
            file_hash: Key::from_buffer(&combined),
            symbols,
            includes: BTreeSet::new(),
            parsed_at: Timestamp::now(),
        }
    }

    #[test]
    fn reverse_tables_track_insert_and_remove() {
        let mut index = SymbolIndex::new();
        index.insert(file("lib.c", vec![symbol("helper", "a", &[])]));
        index.insert(file("main.c", vec![symbol("main", "b", &["helper"])]));

        assert_eq!(
            index.defining_files("helper"),
            BTreeSet::from([PathBuf::from("lib.c")])
        );
        assert_eq!(
            index.referencing_files("helper"),
            BTreeSet::from([PathBuf::from("main.c")])
        );

        index.remove(Path::new("main.c"));
        assert!(index.referencing_files("helper").is_empty());
    }

    #[test]
    fn symbol_dependencies_resolve_to_defining_files() {
        let mut index = SymbolIndex::new();
        index.insert(file("lib.c", vec![symbol("helper", "a", &[])]));
        let main = symbol("main", "b", &["helper", "unknown"]);
        index.insert(file("main.c", vec![main.clone()]));

        let deps = index.symbol_dependency_files(Path::new("main.c"), &main);
        assert_eq!(deps, BTreeSet::from([PathBuf::from("lib.c")]));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = SymbolIndex::new();
        index.insert(file("lib.c", vec![symbol("helper", "a", &[])]));
        index.save(dir.path()).unwrap();

        let loaded = SymbolIndex::load(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(
            loaded.get(Path::new("lib.c")).unwrap().symbols[0].name,
            "helper"
        );
    }

    #[test]
    fn corrupt_index_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.json"), b"not json").unwrap();
        let loaded = SymbolIndex::load(dir.path()).unwrap();
        assert!(loaded.is_empty());
    }
}
