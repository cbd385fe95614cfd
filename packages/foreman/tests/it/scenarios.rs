//! End-to-end build scenarios over a persistent cache directory.

use std::path::Path;

use pretty_assertions::assert_eq;

use foreman::error::ErrorKind;
use foreman::graph::{BuildGraph, NodeStatus, Validation};
use foreman::target::TargetId;

use crate::{invocation, target};

async fn write(path: &Path, content: &[u8]) {
    tokio::fs::write(path, content).await.expect("write fixture");
}

/// Scenario: clean build of a two-target workspace, then an incremental
/// no-op, then a source edit that invalidates both targets.
#[test_log::test(tokio::test)]
async fn clean_build_then_noop_then_edit() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let cache = root.join("cache");
    let a_py = root.join("a.py");
    let main_py = root.join("main.py");
    write(&a_py, b"def helper(): pass").await;
    write(&main_py, b"import a").await;

    let targets = || {
        vec![
            target("//lib", &[], &[&a_py]),
            target("//app", &["//lib"], &[&main_py]),
        ]
    };

    // First invocation: everything builds, in dependency order.
    let first = invocation(root, &cache, targets());
    let report = first.scheduler.run(None).await.unwrap();
    assert_eq!(report.built, 2);
    assert_eq!(report.cached, 0);
    assert!(report.success());
    assert_eq!(
        first.mock.invocations(),
        vec![TargetId::from("//lib"), TargetId::from("//app")]
    );
    assert_eq!(first.services.target_cache.len(), 2);
    first.services.shutdown().unwrap();

    // Second invocation, nothing changed: both cached, no driver calls.
    let second = invocation(root, &cache, targets());
    let report = second.scheduler.run(None).await.unwrap();
    assert_eq!(report.cached, 2);
    assert_eq!(report.built, 0);
    assert!(second.mock.invocations().is_empty());
    second.services.shutdown().unwrap();

    // Third invocation after editing a.py: lib rebuilds, and app rebuilds
    // because lib's build hash changed.
    write(&a_py, b"def helper(): return 1").await;
    let third = invocation(root, &cache, targets());
    let report = third.scheduler.run(None).await.unwrap();
    assert_eq!(report.built, 2);
    assert_eq!(report.cached, 0);
    assert_eq!(
        third.mock.invocations(),
        vec![TargetId::from("//lib"), TargetId::from("//app")]
    );
    third.services.shutdown().unwrap();
}

/// Scenario: a touch (mtime changes, content does not) takes the two-tier
/// slow path exactly once and still hits.
#[test_log::test(tokio::test)]
async fn touch_only_modification_stays_cached() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let cache = root.join("cache");
    let a_py = root.join("a.py");
    write(&a_py, b"x = 1").await;

    let targets = || vec![target("//lib", &[], &[&a_py])];

    let first = invocation(root, &cache, targets());
    first.scheduler.run(None).await.unwrap();
    first.services.shutdown().unwrap();

    // Touch the file.
    let future = filetime::FileTime::from_unix_time(4_102_444_800, 0);
    filetime::set_file_mtime(&a_py, future).unwrap();

    let second = invocation(root, &cache, targets());
    let before = second.services.counters.snapshot();
    let report = second.scheduler.run(None).await.unwrap();
    let after = second.services.counters.snapshot();

    assert_eq!(report.cached, 1);
    assert!(second.mock.invocations().is_empty());
    // Metadata stamp aliased, so exactly one content hash was computed.
    assert_eq!(after.content_hashes - before.content_hashes, 1);
    second.services.shutdown().unwrap();
}

/// Scenario: dependency cycles are refused with a readable trace.
#[test]
fn cycle_is_a_graph_error_with_trace() {
    let x = target("//x", &["//y"], &[]);
    let y = target("//y", &["//x"], &[]);
    let err = BuildGraph::from_targets(vec![x, y], Validation::Deferred).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Graph);
    // Human-readable trace naming the cycle.
    assert!(err.message.contains("//x"), "{}", err.message);
    assert!(err.message.contains("//y"), "{}", err.message);
    assert!(err.message.contains("→"), "{}", err.message);
}

/// Scenario: a primary failure fails fast and cascades to every
/// transitive dependent.
#[test_log::test(tokio::test)]
async fn primary_failure_cascades() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let cache = root.join("cache");

    let rig = invocation(
        root,
        &cache,
        vec![
            target("//a", &[], &[]),
            target("//b", &["//a"], &[]),
            target("//c", &["//b"], &[]),
            target("//d", &["//a"], &[]),
        ],
    );
    rig.mock.fail_target("//a");
    let report = rig.scheduler.run(None).await.unwrap();

    assert_eq!(report.failed_primary, 1);
    assert_eq!(report.failed_cascaded, 3);
    assert_eq!(report.failed(), 4);
    assert_eq!(report.summary_line(), "0 built, 0 cached, 4 failed");
    for id in ["//a", "//b", "//c", "//d"] {
        assert_eq!(
            rig.graph.node_by_id(&TargetId::from(id)).unwrap().status(),
            NodeStatus::Failed,
            "{id}"
        );
    }
    rig.services.shutdown().unwrap();
}

/// Scenario: an interrupted run's checkpoint lets `resume` skip completed
/// targets.
#[test_log::test(tokio::test)]
async fn checkpoint_resume_skips_completed() {
    use foreman::checkpoint::CheckpointLog;
    use std::time::Duration;

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let cache = root.join("cache");

    let targets = || vec![target("//lib", &[], &[]), target("//app", &["//lib"], &[])];

    // A full run leaves a checkpoint naming both targets.
    let first = invocation(root, &cache, targets());
    let report = first.scheduler.run(None).await.unwrap();
    assert_eq!(report.built, 2);
    first.services.shutdown().unwrap();

    // Simulate a fresh `foreman resume`: load the checkpoint and hand it
    // to the scheduler. Both targets settle without dispatch.
    let second = invocation(root, &cache, targets());
    let completed = CheckpointLog::load_latest(
        &second.services.config.checkpoints_dir(),
        second.graph.structural_hash(),
        Duration::from_secs(7 * 24 * 60 * 60),
    )
    .unwrap()
    .expect("checkpoint from the first run");
    assert_eq!(completed.len(), 2);

    let report = second.scheduler.run(Some(completed)).await.unwrap();
    assert_eq!(report.cached, 2);
    assert!(second.mock.invocations().is_empty());
    second.services.shutdown().unwrap();
}
