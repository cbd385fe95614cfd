//! Language drivers.
//!
//! A driver is the capability set the engine needs from a toolchain:
//! build one target, optionally parse a source file into symbols, and
//! report availability. Drivers register into a [`DriverRegistry`] keyed
//! by [`Language`]. The real per-language toolchain logic (rustc flags,
//! npm invocations, ...) lives outside the engine; [`CommandDriver`] is
//! the process-spawning seam it plugs into, and [`MockDriver`] is the
//! deterministic in-memory stand-in used by tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use futures::future::BoxFuture;
use tracing::{instrument, trace};

use crate::ast::FileAst;
use crate::error::{EngineError, EngineResult};
use crate::hash::{Key, content_key};
use crate::sandbox::{SandboxSpec, run};
use crate::target::{Language, Target, TargetId};

/// Everything a driver may consult while building one target.
#[derive(Copy, Clone, Debug)]
pub struct ActionContext<'a> {
    pub target: &'a Target,
    pub workspace_root: &'a Path,
}

/// The result of a successful driver invocation.
#[derive(Clone, Debug)]
pub struct BuildProduct {
    /// Strong fingerprint of the produced output.
    pub output_hash: Key,
    /// Files the build produced, if any.
    pub outputs: Vec<PathBuf>,
}

/// The capability set of one language toolchain.
pub trait Driver: Send + Sync {
    fn language(&self) -> Language;

    /// Whether the underlying toolchain is usable on this host.
    fn is_available(&self) -> bool;

    /// Build one target. Toolchain failures (non-zero exit) must surface
    /// as `BuildFailure`; infrastructure problems as their own kinds.
    fn build<'a>(&'a self, ctx: ActionContext<'a>)
    -> BoxFuture<'a, EngineResult<BuildProduct>>;

    /// Parse one source into its symbol-level AST. `None` when the driver
    /// has no symbol support for this file or the file is gone.
    fn analyze<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, EngineResult<Option<FileAst>>>;
}

/// Registry of drivers, keyed by language. Built once at startup.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<Language, std::sync::Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: std::sync::Arc<dyn Driver>) {
        self.drivers.insert(driver.language(), driver);
    }

    pub fn get(&self, language: Language) -> EngineResult<std::sync::Arc<dyn Driver>> {
        self.drivers.get(&language).cloned().ok_or_else(|| {
            EngineError::config(format!("no driver registered for {language}"))
                .suggest(format!("register a {language} driver before building"))
        })
    }

    pub fn languages(&self) -> impl Iterator<Item = Language> + '_ {
        self.drivers.keys().copied()
    }
}

/// A driver that shells out to a single toolchain program.
///
/// The command line is `<program> <target.flags…> <target.sources…>`, run
/// inside a sandbox with only the target's declared environment.
pub struct CommandDriver {
    language: Language,
    program: String,
}

impl CommandDriver {
    pub fn new(language: Language, program: impl Into<String>) -> Self {
        Self {
            language,
            program: program.into(),
        }
    }
}

impl Driver for CommandDriver {
    fn language(&self) -> Language {
        self.language
    }

    fn is_available(&self) -> bool {
        // A bare program name must resolve on PATH; absolute paths must
        // exist outright.
        let program = Path::new(&self.program);
        if program.is_absolute() {
            return program.exists();
        }
        std::env::var_os("PATH")
            .map(|paths| {
                std::env::split_paths(&paths).any(|dir| dir.join(&self.program).exists())
            })
            .unwrap_or(false)
    }

    fn build<'a>(
        &'a self,
        ctx: ActionContext<'a>,
    ) -> BoxFuture<'a, EngineResult<BuildProduct>> {
        Box::pin(async move {
            let target = ctx.target;
            let mut command = vec![self.program.clone()];
            command.extend(target.flags.iter().cloned());
            command.extend(
                target
                    .sources
                    .iter()
                    .map(|s| s.to_string_lossy().into_owned()),
            );

            let spec = SandboxSpec {
                input_paths: target.sources.clone(),
                output_paths: target.output_path.iter().cloned().collect(),
                env: target.env.clone(),
                workdir: Some(ctx.workspace_root.to_path_buf()),
                ..SandboxSpec::default()
            };

            let output = run(&spec, &command)
                .await
                .map_err(|err| err.frame(format!("building {}", target.id)))?;
            if output.exit_code != 0 {
                return Err(EngineError::build_failure(format!(
                    "{} exited with status {}:\n{}",
                    self.program, output.exit_code, output.stderr
                ))
                .frame(format!("building {}", target.id)));
            }

            // The output hash is the produced file when one is declared,
            // otherwise the command's stdout.
            let (output_hash, outputs) = match &target.output_path {
                Some(path) => {
                    let key = content_key(path).await.map_err(|err| {
                        EngineError::from(err)
                            .frame(format!("hashing output of {}", target.id))
                    })?;
                    (key, vec![path.clone()])
                }
                None => (Key::from_buffer(output.stdout.as_bytes()), Vec::new()),
            };
            trace!(target = %target.id, %output_hash, "command driver built target");
            Ok(BuildProduct {
                output_hash,
                outputs,
            })
        })
    }

    fn analyze<'a>(&'a self, _path: &'a Path) -> BoxFuture<'a, EngineResult<Option<FileAst>>> {
        // Symbol-level parsing is toolchain-specific; the plain command
        // driver only supports file-level invalidation.
        Box::pin(async { Ok(None) })
    }
}

/// Deterministic in-memory driver for tests and dry runs.
///
/// The produced hash is a function of the target id, flags, and the byte
/// contents of every source, so it changes exactly when a rebuild would
/// produce different output.
pub struct MockDriver {
    language: Language,
    fail_targets: Mutex<std::collections::BTreeSet<TargetId>>,
    transient_failures: Mutex<BTreeMap<TargetId, u32>>,
    invocations: Mutex<Vec<TargetId>>,
}

impl MockDriver {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            fail_targets: Mutex::new(std::collections::BTreeSet::new()),
            transient_failures: Mutex::new(BTreeMap::new()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Make builds of this target fail with a `BuildFailure`.
    pub fn fail_target(&self, id: impl Into<TargetId>) {
        self.fail_targets
            .lock()
            .expect("mock lock poisoned")
            .insert(id.into());
    }

    /// Make the next `times` builds of this target fail with a retryable
    /// `System` error.
    pub fn fail_transiently(&self, id: impl Into<TargetId>, times: u32) {
        self.transient_failures
            .lock()
            .expect("mock lock poisoned")
            .insert(id.into(), times);
    }

    /// Every target this driver has been asked to build, in order.
    pub fn invocations(&self) -> Vec<TargetId> {
        self.invocations.lock().expect("mock lock poisoned").clone()
    }
}

impl Driver for MockDriver {
    fn language(&self) -> Language {
        self.language
    }

    fn is_available(&self) -> bool {
        true
    }

    #[instrument(skip(self, ctx), fields(target = %ctx.target.id))]
    fn build<'a>(
        &'a self,
        ctx: ActionContext<'a>,
    ) -> BoxFuture<'a, EngineResult<BuildProduct>> {
        Box::pin(async move {
            let target = ctx.target;
            self.invocations
                .lock()
                .expect("mock lock poisoned")
                .push(target.id.clone());

            {
                let mut transient = self
                    .transient_failures
                    .lock()
                    .expect("mock lock poisoned");
                if let Some(remaining) = transient.get_mut(&target.id)
                    && *remaining > 0
                {
                    *remaining -= 1;
                    return Err(EngineError::system(format!(
                        "mock transient failure for {}",
                        target.id
                    )));
                }
            }

            if self
                .fail_targets
                .lock()
                .expect("mock lock poisoned")
                .contains(&target.id)
            {
                return Err(EngineError::build_failure(format!(
                    "mock driver failing {} as instructed",
                    target.id
                )));
            }

            let mut fields: Vec<Vec<u8>> = vec![target.id.as_str().as_bytes().to_vec()];
            for flag in &target.flags {
                fields.push(flag.as_bytes().to_vec());
            }
            for source in &target.sources {
                let key = content_key(source).await.map_err(|err| {
                    EngineError::from(err).frame(format!("hashing source {source:?}"))
                })?;
                fields.push(key.as_bytes().to_vec());
            }
            Ok(BuildProduct {
                output_hash: Key::from_fields(fields),
                outputs: Vec::new(),
            })
        })
    }

    fn analyze<'a>(&'a self, _path: &'a Path) -> BoxFuture<'a, EngineResult<Option<FileAst>>> {
        Box::pin(async { Ok(None) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetKind;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn mock_hash_tracks_source_content() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.c");
        tokio::fs::write(&source, b"v1").await.unwrap();

        let mut target = Target::new("//lib", TargetKind::Library, Language::C);
        target.sources.push(source.clone());
        let driver = MockDriver::new(Language::C);
        let ctx = ActionContext {
            target: &target,
            workspace_root: dir.path(),
        };

        let first = driver.build(ctx).await.unwrap().output_hash;
        let second = driver.build(ctx).await.unwrap().output_hash;
        assert_eq!(first, second);

        tokio::fs::write(&source, b"v2").await.unwrap();
        let third = driver.build(ctx).await.unwrap().output_hash;
        assert_ne!(first, third);
        assert_eq!(driver.invocations().len(), 3);
    }

    #[tokio::test]
    async fn mock_fails_on_request() {
        let target = Target::new("//bad", TargetKind::Library, Language::C);
        let driver = MockDriver::new(Language::C);
        driver.fail_target("//bad");
        let err = driver
            .build(ActionContext {
                target: &target,
                workspace_root: Path::new("."),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::BuildFailure);
    }

    #[test]
    fn registry_rejects_unknown_language() {
        let registry = DriverRegistry::new();
        let err = match registry.get(Language::Go) {
            Err(err) => err,
            Ok(_) => panic!("expected registry.get to fail for an unknown language"),
        };
        assert_eq!(err.kind, crate::error::ErrorKind::Config);
    }

    #[tokio::test]
    async fn command_driver_surfaces_nonzero_exit_as_build_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut target = Target::new("//sh", TargetKind::Custom, Language::Python);
        target.flags = vec!["-c".to_string(), "exit 9".to_string()];
        let driver = CommandDriver::new(Language::Python, "/bin/sh");
        let err = driver
            .build(ActionContext {
                target: &target,
                workspace_root: dir.path(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::BuildFailure);
    }
}
