//! Incremental analysis: decide what must rebuild, and how finely.
//!
//! Given the set of candidate changed paths since the last build, the
//! analyzer classifies files (phase A), diffs symbols within modified files
//! (phase B), and propagates across files through includes and symbol
//! references (phase C). The output over-approximates when in doubt: a
//! necessary rebuild is never classified as cached.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::ast::{FileAst, SymbolIndex};
use crate::driver::DriverRegistry;
use crate::error::EngineResult;
use crate::ignore::IgnoreFilter;
use crate::target::Language;

/// Why a file was marked for rebuild.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, Serialize, Deserialize)]
pub enum RebuildReason {
    /// Not present in the AST cache.
    NewFile,
    /// One or more of the file's own symbols changed.
    SymbolsModified,
    /// A file it includes is rebuilding.
    IncludeChanged,
    /// A symbol it references is defined in a changed file.
    SymbolDependency,
}

/// The analyzer's verdict for one invocation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub files_to_rebuild: BTreeSet<PathBuf>,
    /// Files deleted since the last build; their outputs need removal.
    pub removed_files: BTreeSet<PathBuf>,
    /// Per file, the specific symbols that must recompile.
    pub symbols_to_recompile: BTreeMap<PathBuf, BTreeSet<String>>,
    pub reasons: BTreeMap<PathBuf, RebuildReason>,
    /// Fraction of all indexed symbols that changed, for observability.
    pub granularity: f64,
}

impl AnalysisResult {
    pub fn is_noop(&self) -> bool {
        self.files_to_rebuild.is_empty() && self.removed_files.is_empty()
    }
}

/// Parses a file into its AST, or reports it absent.
///
/// Implemented by language drivers; tests use a map-backed fake.
pub trait Parser {
    fn parse(&self, path: &Path) -> EngineResult<Option<FileAst>>;
}

/// Run the three analysis phases over `candidates`, updating `index` to the
/// current on-disk state as a side effect.
#[instrument(skip(index, parser, candidates))]
pub fn analyze(
    index: &mut SymbolIndex,
    candidates: impl IntoIterator<Item = PathBuf>,
    parser: &dyn Parser,
) -> EngineResult<AnalysisResult> {
    let mut result = AnalysisResult::default();
    let mut changed_symbols: BTreeMap<PathBuf, BTreeSet<String>> = BTreeMap::new();

    // Phase A: classify each candidate file.
    for path in candidates {
        let cached = index.get(&path).cloned();
        let current = parser.parse(&path)?;
        match (cached, current) {
            (None, Some(current)) => {
                trace!(?path, "new file");
                result.files_to_rebuild.insert(path.clone());
                result.reasons.insert(path.clone(), RebuildReason::NewFile);
                changed_symbols.insert(
                    path.clone(),
                    current.symbols.iter().map(|s| s.name.clone()).collect(),
                );
                index.insert(current);
            }
            (Some(_), None) => {
                trace!(?path, "deleted file");
                result.removed_files.insert(path.clone());
                index.remove(&path);
            }
            (Some(cached), Some(current)) => {
                if cached.file_hash == current.file_hash {
                    continue;
                }
                // Phase B: symbol-level diff for modified files.
                let diff = diff_symbols(&cached, &current);
                trace!(?path, changed = diff.len(), "symbols modified");
                result.files_to_rebuild.insert(path.clone());
                result
                    .reasons
                    .insert(path.clone(), RebuildReason::SymbolsModified);
                result
                    .symbols_to_recompile
                    .entry(path.clone())
                    .or_default()
                    .extend(diff.iter().cloned());
                changed_symbols.insert(path.clone(), diff);
                index.insert(current);
            }
            (None, None) => {}
        }
    }

    // Phase C: cross-file propagation through includes and symbol deps.
    let changed_files: BTreeSet<PathBuf> = result
        .files_to_rebuild
        .iter()
        .chain(result.removed_files.iter())
        .cloned()
        .collect();
    let unmarked: Vec<PathBuf> = index
        .files()
        .map(|(path, _)| path.clone())
        .filter(|path| !changed_files.contains(path))
        .collect();
    for path in unmarked {
        let Some(ast) = index.get(&path).cloned() else {
            continue;
        };
        if ast.includes.iter().any(|inc| changed_files.contains(inc)) {
            result.files_to_rebuild.insert(path.clone());
            result
                .reasons
                .insert(path.clone(), RebuildReason::IncludeChanged);
            continue;
        }
        for symbol in &ast.symbols {
            let deps = index.symbol_dependency_files(&path, symbol);
            let hit = deps.iter().any(|dep| {
                changed_files.contains(dep)
                    && changed_symbols
                        .get(dep)
                        .is_none_or(|names| {
                            !names.is_disjoint(&symbol.referenced_symbols)
                        })
            });
            if hit {
                result.files_to_rebuild.insert(path.clone());
                result
                    .reasons
                    .entry(path.clone())
                    .or_insert(RebuildReason::SymbolDependency);
                result
                    .symbols_to_recompile
                    .entry(path.clone())
                    .or_default()
                    .insert(symbol.name.clone());
            }
        }
    }

    let total_symbols = index.total_symbols();
    let changed_count: usize = changed_symbols.values().map(BTreeSet::len).sum();
    result.granularity = if total_symbols == 0 {
        0.0
    } else {
        changed_count as f64 / total_symbols as f64
    };
    debug!(
        rebuild = result.files_to_rebuild.len(),
        removed = result.removed_files.len(),
        granularity = result.granularity,
        "analysis complete"
    );
    Ok(result)
}

/// Analyze the whole workspace: candidates are the ignore-filtered file
/// walk plus everything previously indexed (so deletions are noticed),
/// parsed by the driver matching each file's extension. Files no driver
/// can parse fall back to file-level caching and are skipped here.
#[instrument(skip(index, filter, drivers))]
pub async fn analyze_workspace(
    index: &mut SymbolIndex,
    workspace_root: &Path,
    filter: &IgnoreFilter,
    drivers: &DriverRegistry,
) -> color_eyre::Result<AnalysisResult> {
    let on_disk: BTreeSet<PathBuf> = filter
        .walk_files(workspace_root)?
        .into_iter()
        .collect();
    let mut candidates: BTreeSet<PathBuf> = on_disk.clone();
    candidates.extend(index.files().map(|(path, _)| path.clone()));

    let mut parsed: BTreeMap<PathBuf, Option<FileAst>> = BTreeMap::new();
    for path in &candidates {
        if !on_disk.contains(path) {
            // Previously indexed, now gone.
            parsed.insert(path.clone(), None);
            continue;
        }
        let language = path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(Language::from_extension);
        let Some(language) = language else { continue };
        let Ok(driver) = drivers.get(language) else {
            continue;
        };
        if let Some(ast) = driver.analyze(path).await? {
            parsed.insert(path.clone(), Some(ast));
        }
    }

    struct PreParsed(BTreeMap<PathBuf, Option<FileAst>>);
    impl Parser for PreParsed {
        fn parse(&self, path: &Path) -> EngineResult<Option<FileAst>> {
            Ok(self.0.get(path).cloned().flatten())
        }
    }

    let files: Vec<PathBuf> = parsed.keys().cloned().collect();
    analyze(index, files, &PreParsed(parsed)).map_err(Into::into)
}

/// Names of symbols that differ between two parses of the same file:
/// changed content hash, added, or removed.
fn diff_symbols(cached: &FileAst, current: &FileAst) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    let cached_by_name: BTreeMap<&str, &crate::ast::AstSymbol> = cached
        .symbols
        .iter()
        .map(|s| (s.name.as_str(), s))
        .collect();
    for symbol in &current.symbols {
        match cached_by_name.get(symbol.name.as_str()) {
            Some(previous) if previous.content_hash == symbol.content_hash => {}
            _ => {
                changed.insert(symbol.name.clone());
            }
        }
    }
    let current_names: BTreeSet<&str> =
        current.symbols.iter().map(|s| s.name.as_str()).collect();
    for symbol in &cached.symbols {
        if !current_names.contains(symbol.name.as_str()) {
            changed.insert(symbol.name.clone());
        }
    }
    changed
}
