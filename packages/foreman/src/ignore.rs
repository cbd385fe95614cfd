//! Ignore filter for workspace walking.
//!
//! Built-in patterns cover per-ecosystem dependency and build directories
//! (`node_modules`, `target`, `__pycache__`, ...). Users supply additional
//! patterns in a `.builderignore` file at the workspace root, with
//! git-ignore-compatible semantics: `#` comments, trailing-slash directory
//! patterns, leading-`!` negations, `*`/`?`/`**` globs, and last-match-wins
//! precedence. Built-in patterns are evaluated first, so user patterns
//! override them — including negations that re-include a built-in-ignored
//! path.

use std::path::{Component, Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use globset::{GlobBuilder, GlobMatcher};
use tracing::{instrument, trace};
use walkdir::WalkDir;

/// Dependency/build directories ignored out of the box.
const BUILTIN_PATTERNS: &[&str] = &[
    ".git/",
    ".gradle/",
    ".hg/",
    ".mypy_cache/",
    ".next/",
    ".pytest_cache/",
    ".svn/",
    ".tox/",
    ".venv/",
    "__pycache__/",
    "bower_components/",
    "node_modules/",
    "target/",
    "venv/",
];

#[derive(Clone, Debug)]
struct Rule {
    matcher: GlobMatcher,
    raw: String,
    negated: bool,
    dir_only: bool,
}

impl Rule {
    fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let raw = line.to_string();

        let (negated, line) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let (dir_only, line) = match line.strip_suffix('/') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        // A leading slash anchors to the workspace root; anything else
        // matches at any depth.
        let pattern = match line.strip_prefix('/') {
            Some(rest) => rest.to_string(),
            None => format!("**/{line}"),
        };

        let matcher = GlobBuilder::new(&pattern)
            .literal_separator(true)
            .build()
            .with_context(|| format!("parse ignore pattern {raw:?}"))?
            .compile_matcher();

        Ok(Some(Self {
            matcher,
            raw,
            negated,
            dir_only,
        }))
    }

    /// Whether the rule applies to `path`. Directory rules also apply to
    /// everything beneath a matching directory.
    fn applies(&self, path: &Path, is_dir: bool) -> bool {
        if self.matcher.is_match(path) && (!self.dir_only || is_dir) {
            return true;
        }
        // Check ancestors: a match on `a/node_modules` covers
        // `a/node_modules/x/y.js`.
        let mut ancestor = PathBuf::new();
        let components: Vec<Component<'_>> = path.components().collect();
        for component in &components[..components.len().saturating_sub(1)] {
            ancestor.push(component);
            if self.matcher.is_match(&ancestor) {
                return true;
            }
        }
        false
    }
}

/// An ordered rule list: builtins first, then user patterns.
#[derive(Clone, Debug)]
pub struct IgnoreFilter {
    rules: Vec<Rule>,
}

impl IgnoreFilter {
    /// Only the built-in ecosystem patterns.
    pub fn builtin() -> Self {
        let rules = BUILTIN_PATTERNS
            .iter()
            .filter_map(|pattern| {
                Rule::parse(pattern).expect("built-in ignore patterns are valid")
            })
            .collect();
        Self { rules }
    }

    /// Builtins plus the workspace's `.builderignore`, if present.
    #[instrument]
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let mut filter = Self::builtin();
        let path = workspace_root.join(".builderignore");
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                filter.add_user_patterns(content.lines())?;
                trace!(?path, rules = filter.rules.len(), "loaded ignore file");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).context(format!("read {path:?}")),
        }
        Ok(filter)
    }

    /// Append user patterns after the builtins (so they win on conflicts).
    pub fn add_user_patterns<'a>(
        &mut self,
        lines: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        for line in lines {
            if let Some(rule) = Rule::parse(line)? {
                self.rules.push(rule);
            }
        }
        Ok(())
    }

    /// Whether `path` (workspace-relative) is ignored.
    ///
    /// Last matching rule wins; a negated last match re-includes the path.
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        let mut decision = false;
        for rule in &self.rules {
            if rule.applies(path, is_dir) {
                decision = !rule.negated;
            }
        }
        decision
    }

    /// Walk the workspace, yielding non-ignored files.
    #[instrument(skip(self))]
    pub fn walk_files(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let walker = WalkDir::new(root).sort_by_file_name().into_iter();
        let mut it = walker.filter_entry(|entry| {
            let Ok(rel) = entry.path().strip_prefix(root) else {
                return true;
            };
            if rel.as_os_str().is_empty() {
                return true;
            }
            !self.is_ignored(rel, entry.file_type().is_dir())
        });
        while let Some(entry) = it.next() {
            let entry = entry.context("walk workspace")?;
            if entry.file_type().is_file() {
                files.push(entry.path().to_path_buf());
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case("node_modules/react/index.js", true; "node_modules contents")]
    #[test_case("a/b/node_modules/x.js", true; "nested node_modules")]
    #[test_case("target/debug/app", true; "cargo target dir")]
    #[test_case("src/__pycache__/mod.pyc", true; "pycache")]
    #[test_case("src/main.py", false; "ordinary source")]
    #[test_case("targets.txt", false; "prefix does not match dir pattern")]
    #[test]
    fn builtin_patterns(path: &str, ignored: bool) {
        use pretty_assertions::assert_eq;
        let filter = IgnoreFilter::builtin();
        assert_eq!(filter.is_ignored(Path::new(path), false), ignored);
    }

    #[test]
    fn user_patterns_extend_builtins() {
        let mut filter = IgnoreFilter::builtin();
        filter
            .add_user_patterns(["# logs", "*.log", "build/"])
            .unwrap();
        assert!(filter.is_ignored(Path::new("x/y/z.log"), false));
        assert!(filter.is_ignored(Path::new("build/out.o"), false));
        assert!(!filter.is_ignored(Path::new("src/build.rs"), false));
    }

    #[test]
    fn negation_reincludes_builtin_ignored_path() {
        let mut filter = IgnoreFilter::builtin();
        filter
            .add_user_patterns(["!node_modules/", "!node_modules/**"])
            .unwrap();
        assert!(!filter.is_ignored(Path::new("node_modules/react/index.js"), false));
    }

    #[test]
    fn last_match_wins_within_a_file() {
        let mut filter = IgnoreFilter::builtin();
        filter
            .add_user_patterns(["*.gen.c", "!important.gen.c"])
            .unwrap();
        assert!(filter.is_ignored(Path::new("src/a.gen.c"), false));
        assert!(!filter.is_ignored(Path::new("src/important.gen.c"), false));
    }

    #[test]
    fn anchored_pattern_only_matches_at_root() {
        let mut filter = IgnoreFilter::builtin();
        filter.add_user_patterns(["/out"]).unwrap();
        assert!(filter.is_ignored(Path::new("out"), true));
        assert!(!filter.is_ignored(Path::new("src/out"), true));
    }

    #[test]
    fn question_mark_glob() {
        let mut filter = IgnoreFilter::builtin();
        filter.add_user_patterns(["tmp?.txt"]).unwrap();
        assert!(filter.is_ignored(Path::new("tmp1.txt"), false));
        assert!(!filter.is_ignored(Path::new("tmp12.txt"), false));
    }

    #[tokio::test]
    async fn walk_skips_ignored_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::write(root.join("src/main.c"), b"int main;").unwrap();
        std::fs::write(root.join("node_modules/pkg/index.js"), b"x").unwrap();

        let filter = IgnoreFilter::builtin();
        let files = filter.walk_files(root).unwrap();
        assert_eq!(files, vec![root.join("src/main.c")]);
    }
}
