//! Wires one node together and runs its startup sequence.

use crate::actor::{ActorClient, NodeActor};
use crate::api::{NodeConfig, NodeOptionsValidated, WorkloadHandler};
use crate::protocol::Protocol;
use crate::quorum::{NodeId, Quorum};
use crate::server;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;

const EVENT_QUEUE_DEPTH: usize = 64;

/// Boots one quorum member: binds its endpoint, starts the protocol event
/// loop, handshakes every configured peer and elects a leader. Returns once
/// the quorum view has settled, so a returned handle belongs to a node that
/// is ready for client traffic (possibly with unreachable peers already
/// marked dead).
pub async fn start_node<H>(config: NodeConfig<H>) -> Result<NodeHandle, StartNodeError>
where
    H: WorkloadHandler,
{
    let options = NodeOptionsValidated::try_from(config.options).map_err(StartNodeError::InvalidOptions)?;
    let peer_endpoints = config.cluster.peer_endpoints()?;
    let local_endpoint = config.cluster.local_endpoint;

    let node_id = NodeId::generate();
    let logger = config.info_logger.new(slog::o!(
        "NodeId" => node_id.to_string(),
        "Endpoint" => local_endpoint.to_string(),
    ));

    // Bind before dialing anyone, so peers booting in parallel can already
    // reach us while our own handshakes are in flight.
    let listener = TcpListener::bind(local_endpoint)
        .await
        .map_err(StartNodeError::Bind)?;
    slog::info!(logger, "Listening on {}", local_endpoint);

    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let actor_client = ActorClient::new(event_tx);

    let quorum = Quorum::new(node_id, local_endpoint, peer_endpoints);
    let protocol = Protocol::new(
        logger.clone(),
        options.clone(),
        quorum,
        config.handler,
        actor_client.clone(),
    );
    let actor = NodeActor::new(logger.clone(), event_rx, protocol);

    // The handle holds the sender; dropping it stops the listener.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let tasks = vec![
        tokio::task::spawn(actor.run_event_loop()),
        tokio::task::spawn(server::run_acceptor(
            listener,
            actor_client.clone(),
            shutdown_rx,
            logger.clone(),
        )),
        tokio::task::spawn(run_health_timer(options.health_check_period, actor_client.clone())),
    ];

    let handle = NodeHandle {
        node_id,
        endpoint: local_endpoint,
        _shutdown: shutdown_tx,
        tasks,
    };

    // Startup completes only once every peer is identified or marked dead
    // and a leader has been chosen over the settled view.
    let (notify_tx, notify_rx) = oneshot::channel();
    if !actor_client.bootstrap(notify_tx).await {
        return Err(StartNodeError::StartupAborted);
    }
    match notify_rx.await {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(mismatch)) => Err(StartNodeError::HandshakeMismatch {
            dialed: mismatch.dialed,
            reported: mismatch.reported,
        }),
        Err(_) => Err(StartNodeError::StartupAborted),
    }
}

async fn run_health_timer(period: Duration, actor_client: ActorClient) {
    // The first tick waits a full period; bootstrap covers the time before.
    let start = tokio::time::Instant::now() + period;
    let mut ticks = tokio::time::interval_at(start, period);
    loop {
        ticks.tick().await;
        if !actor_client.health_check_tick().await {
            return;
        }
    }
}

/// NodeHandle keeps one started node alive. Dropping it (or calling
/// [`NodeHandle::shutdown`]) fail-stops the node: all of its tasks end
/// immediately and peers observe it exactly like a crash.
pub struct NodeHandle {
    node_id: NodeId,
    endpoint: SocketAddr,
    _shutdown: oneshot::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Stops the node immediately.
    pub fn shutdown(self) {
        // Dropping does all the work.
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartNodeError {
    #[error("quorum member '{0}' is configured twice")]
    DuplicateMember(SocketAddr),
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
    #[error("failed to bind the local endpoint")]
    Bind(#[source] io::Error),
    #[error("peer dialed at {dialed} identified itself as {reported}; the quorum configuration is wrong")]
    HandshakeMismatch {
        dialed: SocketAddr,
        reported: SocketAddr,
    },
    #[error("the node exited during startup")]
    StartupAborted,
}
