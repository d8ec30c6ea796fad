use bytes::Bytes;
use paxos_engine::{start_node, Client, ClientOptions, ClusterInfo, NodeConfig, NodeOptions};
use slog::Drain;
use std::net::SocketAddr;
use tokio::time::Duration;

/// Spins up a three-node quorum in one process, replicates a few workloads
/// through it with the identity handler, and shuts down.
#[tokio::main]
async fn main() {
    let drain = slog_term::FullFormat::new(slog_term::TermDecorator::new().build())
        .build()
        .fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    // `start_node` scopes this logger with each node's id and endpoint, so
    // the root carries no context of its own.
    let logger = slog::Logger::root(drain, slog::o!());

    let members: Vec<SocketAddr> = vec![
        "127.0.0.1:9101".parse().unwrap(),
        "127.0.0.1:9102".parse().unwrap(),
        "127.0.0.1:9103".parse().unwrap(),
    ];

    let mut nodes = Vec::new();
    for endpoint in &members {
        let config = NodeConfig {
            handler: |workload: Bytes| workload,
            info_logger: logger.clone(),
            cluster: ClusterInfo {
                local_endpoint: *endpoint,
                members: members.clone(),
            },
            options: NodeOptions::default(),
        };
        nodes.push(start_node(config).await.expect("node failed to start"));
    }

    // Let the health checks settle the quorum on one leader.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let client = Client::new(members, logger.clone(), ClientOptions::default()).expect("client options");
    for i in 0..5u32 {
        let payload = Bytes::from(format!("workload-{}", i));
        let response = client.send(payload.clone()).await.expect("submission failed");
        assert_eq!(response, payload);
        slog::info!(logger, "Replicated '{}'", String::from_utf8_lossy(&response));
    }

    for node in nodes {
        node.shutdown();
    }
}
