//! Boundary-shape builds: empty, single node, diamond, long chain.

use pretty_assertions::assert_eq;

use foreman::graph::NodeStatus;
use foreman::target::TargetId;

use crate::{invocation, target};

#[tokio::test]
async fn empty_workspace_builds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let rig = invocation(dir.path(), &dir.path().join("cache"), vec![]);
    let report = rig.scheduler.run(None).await.unwrap();
    assert_eq!(report.summary_line(), "0 built, 0 cached, 0 failed");
    rig.services.shutdown().unwrap();
}

#[tokio::test]
async fn single_node_builds_then_caches() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let cache = root.join("cache");
    let source = root.join("only.py");
    tokio::fs::write(&source, b"pass").await.unwrap();

    let first = invocation(root, &cache, vec![target("//only", &[], &[&source])]);
    assert_eq!(first.scheduler.run(None).await.unwrap().built, 1);
    first.services.shutdown().unwrap();

    let second = invocation(root, &cache, vec![target("//only", &[], &[&source])]);
    assert_eq!(second.scheduler.run(None).await.unwrap().cached, 1);
    second.services.shutdown().unwrap();
}

#[tokio::test]
async fn diamond_builds_the_join_once_after_both_arms() {
    let dir = tempfile::tempdir().unwrap();
    let rig = invocation(
        dir.path(),
        &dir.path().join("cache"),
        vec![
            target("//a", &[], &[]),
            target("//b", &["//a"], &[]),
            target("//c", &["//a"], &[]),
            target("//d", &["//b", "//c"], &[]),
        ],
    );
    let report = rig.scheduler.run(None).await.unwrap();
    assert_eq!(report.built, 4);

    let invocations = rig.mock.invocations();
    assert_eq!(invocations.len(), 4, "no node builds twice");
    let position = |id: &str| {
        invocations
            .iter()
            .position(|t| t == &TargetId::from(id))
            .unwrap()
    };
    assert!(position("//a") < position("//b"));
    assert!(position("//a") < position("//c"));
    assert!(position("//d") > position("//b"));
    assert!(position("//d") > position("//c"));
    rig.services.shutdown().unwrap();
}

#[tokio::test]
async fn long_chain_completes_with_all_terminal_states() {
    let dir = tempfile::tempdir().unwrap();
    let mut targets = vec![target("//n0", &[], &[])];
    for i in 1..1000 {
        let dep = format!("//n{}", i - 1);
        targets.push(target(&format!("//n{i}"), &[dep.as_str()], &[]));
    }
    let rig = invocation(dir.path(), &dir.path().join("cache"), targets);
    let report = rig.scheduler.run(None).await.unwrap();
    assert_eq!(report.built, 1000);

    let leaf = rig.graph.handle(&TargetId::from("//n999")).unwrap();
    assert_eq!(rig.graph.depth(leaf).unwrap(), 999);
    for handle in rig.graph.handles() {
        assert_eq!(rig.graph.node(handle).status(), NodeStatus::Success);
        assert_eq!(rig.graph.node(handle).pending_deps(), 0);
    }
    rig.services.shutdown().unwrap();
}
