//! End-to-end distributed execution over localhost.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::net::{TcpListener, TcpStream};

use protocol::Key;
use protocol::wire::{
    ActionRequest, ActionStatus, ArtifactSpec, Message, StealRequest, WorkerId, read_frame,
    write_frame,
};
use relay::artifact::Store;
use relay::coordinator::{Coordinator, CoordinatorConfig};
use relay::worker::{Worker, WorkerConfig};

async fn start_coordinator() -> (Arc<Coordinator>, SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::new(dir.path()));
    let coordinator = Coordinator::new(CoordinatorConfig::default(), store);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(coordinator.clone().serve(listener));
    (coordinator, addr, dir)
}

fn start_worker(coordinator_addr: SocketAddr) -> Arc<Worker> {
    let worker = Worker::new(WorkerConfig {
        coordinator_addr: coordinator_addr.to_string(),
        heartbeat_interval: Duration::from_millis(200),
        ..WorkerConfig::default()
    });
    tokio::spawn(worker.clone().run());
    worker
}

async fn wait_for_workers(coordinator: &Coordinator, count: usize) {
    for _ in 0..100 {
        if coordinator.worker_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("workers never registered");
}

fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

fn action(id: &str, script: &str) -> ActionRequest {
    ActionRequest {
        id: id.to_string(),
        command: sh(script),
        inputs: Vec::new(),
        outputs: Vec::new(),
        env: BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
        timeout_ms: 30_000,
        priority: 1,
        capabilities_required: BTreeSet::new(),
    }
}

#[test_log::test(tokio::test)]
async fn action_round_trip_with_artifacts() {
    let (coordinator, addr, _dir) = start_coordinator().await;
    let _worker = start_worker(addr);
    wait_for_workers(&coordinator, 1).await;

    // Seed the input blob.
    let input = b"hello input";
    let input_key = Key::from_buffer(input);
    coordinator.store.upload(&input_key, input).await.unwrap();

    let mut request = action("act-upper", "tr a-z A-Z < in.txt > out.txt");
    request.inputs.push(ArtifactSpec {
        id: input_key,
        path: "in.txt".to_string(),
        optional: false,
        executable: false,
    });
    request.outputs.push(ArtifactSpec {
        // Output ids are assigned by the worker after the fact.
        id: Key::from_buffer(b""),
        path: "out.txt".to_string(),
        optional: false,
        executable: false,
    });

    let results = coordinator.results();
    coordinator.submit(request);

    let result = tokio::time::timeout(Duration::from_secs(30), results.recv_async())
        .await
        .expect("result within deadline")
        .unwrap();
    assert_eq!(result.id, "act-upper");
    assert_eq!(result.status, ActionStatus::Success);
    assert_eq!(result.exit_code, 0);

    let (path, key) = &result.output_ids[0];
    assert_eq!(path, "out.txt");
    let output = coordinator.store.fetch(key).await.unwrap().unwrap();
    assert_eq!(output, b"HELLO INPUT");
}

#[test_log::test(tokio::test)]
async fn failing_action_reports_failure_not_error() {
    let (coordinator, addr, _dir) = start_coordinator().await;
    let _worker = start_worker(addr);
    wait_for_workers(&coordinator, 1).await;

    let results = coordinator.results();
    coordinator.submit(action("act-fail", "echo broken >&2; exit 7"));

    let result = tokio::time::timeout(Duration::from_secs(30), results.recv_async())
        .await
        .expect("result within deadline")
        .unwrap();
    assert_eq!(result.status, ActionStatus::Failure);
    assert_eq!(result.exit_code, 7);
    assert!(result.stderr.contains("broken"));
}

#[test_log::test(tokio::test)]
async fn queued_work_waits_for_a_capable_worker() {
    let (coordinator, addr, _dir) = start_coordinator().await;

    let mut request = action("act-gpu", "true");
    request.capabilities_required = BTreeSet::from(["gpu".to_string()]);
    coordinator.submit(request);
    assert_eq!(coordinator.queue_len(), 1);

    // A default worker (no gpu capability) must not receive it.
    let _plain = start_worker(addr);
    wait_for_workers(&coordinator, 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(coordinator.queue_len(), 1);

    // A capable worker picks it up.
    let capable = Worker::new(WorkerConfig {
        coordinator_addr: addr.to_string(),
        heartbeat_interval: Duration::from_millis(200),
        capabilities: BTreeSet::from(["gpu".to_string(), std::env::consts::OS.to_string()]),
        ..WorkerConfig::default()
    });
    tokio::spawn(capable.run());

    let results = coordinator.results();
    let result = tokio::time::timeout(Duration::from_secs(30), results.recv_async())
        .await
        .expect("result within deadline")
        .unwrap();
    assert_eq!(result.id, "act-gpu");
    assert_eq!(result.status, ActionStatus::Success);
}

#[test_log::test(tokio::test)]
async fn steal_protocol_hands_over_oldest_action() {
    // A worker with queued work, spoken to directly over the steal port.
    let victim = Worker::new(WorkerConfig {
        min_local_reserve: 1,
        ..WorkerConfig::default()
    });
    victim.deque.push(action("oldest", "true"));
    victim.deque.push(action("newer", "true"));
    victim.deque.push(action("newest", "true"));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(victim.clone().steal_listener(listener));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_frame(
        &mut stream,
        &Message::StealRequest(StealRequest {
            thief: WorkerId("thief".to_string()),
            victim: victim.id(),
            priority_floor: 0,
        }),
    )
    .await
    .unwrap();

    let reply = read_frame(&mut stream).await.unwrap().unwrap();
    let Message::StealResponse(response) = reply else {
        panic!("unexpected reply: {reply}");
    };
    assert_eq!(response.action.unwrap().id, "oldest");
    assert_eq!(victim.deque.len(), 2);

    // Drain to the reserve: the last request comes back empty.
    write_frame(
        &mut stream,
        &Message::StealRequest(StealRequest {
            thief: WorkerId("thief".to_string()),
            victim: victim.id(),
            priority_floor: 0,
        }),
    )
    .await
    .unwrap();
    let Message::StealResponse(response) = read_frame(&mut stream).await.unwrap().unwrap()
    else {
        panic!("unexpected reply");
    };
    assert_eq!(response.action.unwrap().id, "newer");
    assert!(victim.deque.steal(1, 0).is_none());
}
