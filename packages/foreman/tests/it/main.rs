use std::path::Path;
use std::sync::Arc;

use foreman::config::Config;
use foreman::context::Services;
use foreman::driver::{DriverRegistry, MockDriver};
use foreman::graph::{BuildGraph, Validation};
use foreman::scheduler::Scheduler;
use foreman::target::{Language, Target, TargetId, TargetKind};

pub mod boundary;
pub mod scenarios;

/// One engine invocation against a persistent cache directory: fresh
/// `Services` (so caches reload from disk exactly as separate CLI runs
/// would), one mock driver, one scheduler.
pub struct Invocation {
    pub services: Arc<Services>,
    pub scheduler: Scheduler,
    pub mock: Arc<MockDriver>,
    pub graph: Arc<BuildGraph>,
}

pub fn invocation(workspace_root: &Path, cache_dir: &Path, targets: Vec<Target>) -> Invocation {
    let mock = Arc::new(MockDriver::new(Language::Python));
    let mut drivers = DriverRegistry::new();
    drivers.register(mock.clone());
    let config = Config {
        cache_dir: cache_dir.to_path_buf(),
        jobs: 4,
        ..Config::default()
    };
    let services = Arc::new(Services::new(config, drivers).expect("construct services"));
    let graph = Arc::new(
        BuildGraph::from_targets(targets, Validation::Deferred).expect("valid test graph"),
    );
    let scheduler = Scheduler::new(graph.clone(), services.clone(), workspace_root.to_path_buf());
    Invocation {
        services,
        scheduler,
        mock,
        graph,
    }
}

pub fn target(id: &str, deps: &[&str], sources: &[&Path]) -> Target {
    let mut target = Target::new(id, TargetKind::Library, Language::Python);
    target.deps = deps.iter().map(|d| TargetId::from(*d)).collect();
    target.sources = sources.iter().map(|s| s.to_path_buf()).collect();
    target
}
