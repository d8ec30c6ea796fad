//! End-to-end tests against real localhost clusters.

use bytes::Bytes;
use paxos_engine::{start_node, Client, ClientOptions, ClusterInfo, NodeConfig, NodeHandle, NodeOptions};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Duration;

fn endpoints(base_port: u16, count: u16) -> Vec<SocketAddr> {
    (0..count)
        .map(|i| SocketAddr::from(([127, 0, 0, 1], base_port + i)))
        .collect()
}

fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn fast_options() -> NodeOptions {
    NodeOptions {
        handshake_timeout: Some(Duration::from_secs(1)),
        health_check_period: Some(Duration::from_millis(400)),
        round_timeout: Some(Duration::from_secs(5)),
    }
}

/// Identity handler that counts how often this node ran a workload.
fn counting_echo(counter: Arc<AtomicUsize>) -> impl FnMut(Bytes) -> Bytes + Send + 'static {
    move |workload| {
        counter.fetch_add(1, Ordering::SeqCst);
        workload
    }
}

/// Starts one node per member endpoint; returns the handles and each node's
/// handler invocation counter, in member order.
async fn start_cluster(members: &[SocketAddr]) -> (Vec<NodeHandle>, Vec<Arc<AtomicUsize>>) {
    let logger = test_logger();
    let mut nodes = Vec::new();
    let mut counters = Vec::new();

    for endpoint in members {
        let counter = Arc::new(AtomicUsize::new(0));
        let config = NodeConfig {
            handler: counting_echo(Arc::clone(&counter)),
            info_logger: logger.clone(),
            cluster: ClusterInfo {
                local_endpoint: *endpoint,
                members: members.to_vec(),
            },
            options: fast_options(),
        };
        nodes.push(start_node(config).await.expect("node failed to start"));
        counters.push(counter);
    }

    // Nodes started first saw the later ones as dead; a couple of health
    // check periods is enough for every view to converge on one leader.
    tokio::time::sleep(Duration::from_secs(2)).await;

    (nodes, counters)
}

#[tokio::test]
async fn a_three_node_cluster_replicates_every_workload() {
    let members = endpoints(21100, 3);
    let (_nodes, counters) = start_cluster(&members).await;

    let client = Client::new(members, test_logger(), ClientOptions::default()).unwrap();
    for i in 0..100u32 {
        let payload = Bytes::from(i.to_string());
        let response = client.send(payload.clone()).await.expect("submission failed");
        assert_eq!(response, payload);
    }

    // Every node ran every workload exactly once.
    for counter in &counters {
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }
    assert!(client.known_leader().is_some());
}

#[tokio::test]
async fn a_single_node_cluster_leads_itself() {
    let members = endpoints(21110, 1);
    let (_nodes, counters) = start_cluster(&members).await;

    let client = Client::new(members.clone(), test_logger(), ClientOptions::default()).unwrap();
    for _ in 0..3 {
        let response = client.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(response, Bytes::from_static(b"ping"));
    }

    assert_eq!(counters[0].load(Ordering::SeqCst), 3);
    assert_eq!(client.known_leader(), Some(members[0]));
}

#[tokio::test]
async fn submissions_to_a_follower_are_refused() {
    let members = endpoints(21120, 3);
    let (_nodes, counters) = start_cluster(&members).await;

    // One successful round to learn who leads.
    let client = Client::new(members.clone(), test_logger(), ClientOptions::default()).unwrap();
    client.send(Bytes::from_static(b"warmup")).await.unwrap();
    let leader = client.known_leader().expect("leader should be known");

    let follower = *members.iter().find(|m| **m != leader).unwrap();
    let follower_client = Client::new(
        vec![follower],
        test_logger(),
        ClientOptions {
            attempt_limit: Some(2),
            retry_delay: Some(Duration::from_millis(50)),
            ..ClientOptions::default()
        },
    )
    .unwrap();

    match follower_client.send(Bytes::from_static(b"misdirected")).await {
        Err(paxos_engine::SubmitError::IncorrectProposal) => {}
        other => panic!("expected IncorrectProposal, got {:?}", other),
    }

    // The refused workload never ran anywhere.
    let total: usize = counters.iter().map(|c| c.load(Ordering::SeqCst)).sum();
    assert_eq!(total, 3);
}

#[tokio::test]
async fn the_quorum_survives_a_follower_crash() {
    let members = endpoints(21130, 3);
    let (nodes, counters) = start_cluster(&members).await;

    let client = Client::new(members.clone(), test_logger(), ClientOptions::default()).unwrap();
    for i in 0..10u32 {
        let payload = Bytes::from(format!("before-{}", i));
        assert_eq!(client.send(payload.clone()).await.unwrap(), payload);
    }

    // Kill one follower outright.
    let leader = client.known_leader().expect("leader should be known");
    let victim_index = members.iter().position(|m| *m != leader).unwrap();
    let mut nodes = nodes;
    nodes.remove(victim_index).shutdown();

    // The leader notices the dropped connection immediately; give the
    // health check a moment to agree.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    for i in 0..10u32 {
        let payload = Bytes::from(format!("after-{}", i));
        assert_eq!(client.send(payload.clone()).await.unwrap(), payload);
    }

    for (index, counter) in counters.iter().enumerate() {
        let expected = if index == victim_index { 10 } else { 20 };
        assert_eq!(counter.load(Ordering::SeqCst), expected);
    }
}
