pub mod build;
pub mod clean;
pub mod graph;
pub mod init;
pub mod query;
pub mod telemetry;

use std::collections::BTreeSet;
use std::path::Path;

use color_eyre::{Result, eyre::Context as _};

use foreman::driver::{CommandDriver, DriverRegistry};
use foreman::error::EngineError;
use foreman::target::{Language, Target, TargetId, WorkspaceConfig};

/// The pre-parsed workspace produced by the configuration frontend.
///
/// The surface DSL parser is a separate tool; its contract with the engine
/// is this JSON file: resolved targets, expanded globs, recognized
/// languages.
const WORKSPACE_FILE: &str = "workspace.json";

pub fn load_workspace() -> Result<WorkspaceConfig> {
    let path = Path::new(WORKSPACE_FILE);
    let content = std::fs::read(path).map_err(|err| {
        EngineError::config(format!("cannot read {WORKSPACE_FILE}: {err}"))
            .suggest("run the workspace parser first, or cd to the workspace root")
    })?;
    let workspace: WorkspaceConfig = serde_json::from_slice(&content)
        .map_err(|err| EngineError::config(format!("malformed {WORKSPACE_FILE}: {err}")))?;
    workspace.validate()?;
    Ok(workspace)
}

/// Restrict the workspace to the requested targets plus their transitive
/// dependencies. No request selects everything.
pub fn select_targets(workspace: &WorkspaceConfig, requested: &[String]) -> Result<Vec<Target>> {
    if requested.is_empty() {
        return Ok(workspace.targets.clone());
    }
    let by_id: std::collections::BTreeMap<&TargetId, &Target> =
        workspace.targets.iter().map(|t| (&t.id, t)).collect();
    let mut selected: BTreeSet<TargetId> = BTreeSet::new();
    let mut stack: Vec<TargetId> = Vec::new();
    for label in requested {
        let id = TargetId::new(label.clone());
        if !by_id.contains_key(&id) {
            return Err(EngineError::graph(format!("unknown target {id}"))
                .suggest("run `foreman query <label>` to check spelling")
                .into());
        }
        stack.push(id);
    }
    while let Some(id) = stack.pop() {
        if !selected.insert(id.clone()) {
            continue;
        }
        if let Some(target) = by_id.get(&id) {
            stack.extend(target.deps.iter().cloned());
        }
    }
    Ok(workspace
        .targets
        .iter()
        .filter(|t| selected.contains(&t.id))
        .cloned()
        .collect())
}

/// Register the stock process-spawning drivers.
pub fn default_drivers() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    for (language, program) in [
        (Language::Rust, "rustc"),
        (Language::C, "cc"),
        (Language::Cpp, "c++"),
        (Language::Go, "go"),
        (Language::Python, "python3"),
        (Language::JavaScript, "node"),
        (Language::TypeScript, "tsc"),
        (Language::Java, "javac"),
    ] {
        registry.register(std::sync::Arc::new(CommandDriver::new(language, program)));
    }
    registry
}

/// Register the cancellation flag with SIGINT/SIGTERM.
pub fn register_signals(cancel: &foreman::context::CancelFlag) -> Result<()> {
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, cancel.as_atomic())
            .with_context(|| format!("register signal handler {signal}"))?;
    }
    Ok(())
}
