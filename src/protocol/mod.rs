//! The protocol engine: quorum handshake, leader election, and the
//! prepare/accept replication rounds, all driven from the node's single
//! event loop.

mod command;
mod election;
mod handshake;
mod health;
mod replication;

pub(crate) use command::Command;
pub(crate) use command::CommandDecodeError;
pub(crate) use command::ErrorCode;
pub(crate) use handshake::EndpointMismatch;
pub(crate) use handshake::HandshakeError;
pub(crate) use handshake::HandshakeSuccess;

use crate::actor::{ActorClient, Event};
use crate::api::{NodeOptionsValidated, WorkloadHandler};
use crate::net::{spawn_connection, BoxedStream, ConnectionHandle, ConnectionId, WireError};
use crate::quorum::{NodeState, Quorum};
use bytes::Bytes;
use replication::Round;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use tokio::sync::oneshot;

/// ProposalId orders rounds. Each node's counter only ever moves forward:
/// the leader increments it per client request, a follower raises it to any
/// higher value seen in a `prepare`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub(crate) struct ProposalId(u64);

impl ProposalId {
    pub(crate) fn new(id: u64) -> Self {
        ProposalId(id)
    }

    pub(crate) fn next(self) -> Self {
        ProposalId(self.0 + 1)
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct TrackedConnection {
    handle: ConnectionHandle,
    /// Set for cached outbound peer connections; inbound connections stay
    /// anonymous (a client, or a peer we have not dialed ourselves).
    peer_endpoint: Option<SocketAddr>,
}

/// Protocol holds all mutable node state. It is owned by the `NodeActor`
/// and never touched from any other task; handlers run to completion and
/// communicate with the world only through connection write queues and
/// spawned tasks that report back as events.
pub(crate) struct Protocol<H: WorkloadHandler> {
    logger: slog::Logger,
    options: NodeOptionsValidated,
    quorum: Quorum,
    handler: H,
    actor_client: ActorClient,

    proposal_counter: ProposalId,
    rounds: HashMap<ProposalId, Round>,
    /// Client requests parked while an earlier round is still in flight.
    /// Draining strictly in order keeps proposal ids aligned with request
    /// arrival order.
    round_backlog: VecDeque<(ConnectionId, Bytes)>,

    connections: HashMap<ConnectionId, TrackedConnection>,
    next_connection_id: u64,

    pending_handshakes: HashSet<SocketAddr>,
    bootstrap_notify: Option<oneshot::Sender<Result<(), EndpointMismatch>>>,
}

impl<H: WorkloadHandler> Protocol<H> {
    pub(crate) fn new(
        logger: slog::Logger,
        options: NodeOptionsValidated,
        quorum: Quorum,
        handler: H,
        actor_client: ActorClient,
    ) -> Self {
        Protocol {
            logger,
            options,
            quorum,
            handler,
            actor_client,
            proposal_counter: ProposalId::new(0),
            rounds: HashMap::new(),
            round_backlog: VecDeque::new(),
            connections: HashMap::new(),
            next_connection_id: 0,
            pending_handshakes: HashSet::new(),
            bootstrap_notify: None,
        }
    }

    pub(crate) fn handle_event(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Bootstrap(notify) => self.begin_bootstrap(notify),
            Event::InboundConnection(stream, remote_addr) => {
                let handle = self.register_connection(stream, None);
                slog::debug!(self.logger, "Accepted {} from {}", handle.id(), remote_addr);
            }
            Event::CommandReceived(conn_id, command) => return self.dispatch_command(conn_id, command),
            Event::ConnectionClosed(conn_id, cause) => self.handle_connection_closed(conn_id, cause),
            Event::HandshakeFinished(endpoint, result) => {
                return self.handle_handshake_finished(endpoint, result)
            }
            Event::RoundDeadline(proposal_id) => self.handle_round_deadline(proposal_id),
            Event::HealthCheckTick => self.handle_health_check(),
        }

        ControlFlow::Continue(())
    }

    /// Routes one inbound command to the engine that owns its type.
    fn dispatch_command(&mut self, conn_id: ConnectionId, command: Command) -> ControlFlow<()> {
        match command {
            Command::HandshakeStart => self.handle_handshake_start(conn_id),
            Command::Request { workload } => self.handle_client_request(conn_id, workload),
            Command::Prepare { proposal_id } => self.handle_prepare(conn_id, proposal_id),
            Command::Promise { proposal_id } => self.handle_prepare_reply(conn_id, proposal_id, true),
            Command::Fail { proposal_id } => self.handle_prepare_reply(conn_id, proposal_id, false),
            Command::Accept { proposal_id, workload } => self.handle_accept(conn_id, proposal_id, workload),
            Command::Accepted { proposal_id, workload } => self.handle_accepted(conn_id, proposal_id, workload),
            other @ (Command::HandshakeResponse { .. } | Command::Error { .. }) => {
                // Only dial tasks and clients ever read these.
                slog::warn!(
                    self.logger,
                    "Ignoring unexpected '{}' on {}",
                    other.kind(),
                    conn_id
                );
            }
        }

        ControlFlow::Continue(())
    }

    fn register_connection(&mut self, stream: BoxedStream, peer_endpoint: Option<SocketAddr>) -> ConnectionHandle {
        self.next_connection_id += 1;
        let id = ConnectionId::new(self.next_connection_id);
        let handle = spawn_connection(id, stream, self.actor_client.clone(), self.logger.clone());
        self.connections.insert(
            id,
            TrackedConnection {
                handle: handle.clone(),
                peer_endpoint,
            },
        );
        handle
    }

    fn write_to(&self, conn_id: ConnectionId, command: Command) {
        match self.connections.get(&conn_id) {
            Some(tracked) => {
                tracked.handle.write_command(command);
            }
            None => {
                slog::debug!(
                    self.logger,
                    "Dropping '{}' for departed {}",
                    command.kind(),
                    conn_id
                );
            }
        }
    }

    fn connection_endpoint(&self, conn_id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(&conn_id)?.peer_endpoint
    }

    fn handle_connection_closed(&mut self, conn_id: ConnectionId, cause: Option<WireError>) {
        let Some(tracked) = self.connections.remove(&conn_id) else {
            return;
        };

        match &cause {
            Some(e) => slog::warn!(self.logger, "{} failed: {}", conn_id, e),
            None => slog::debug!(self.logger, "{} closed", conn_id),
        }

        if let Some(endpoint) = tracked.peer_endpoint {
            if let Some(peer) = self.quorum.lookup_mut(endpoint) {
                if peer.connection().map(ConnectionHandle::id) == Some(conn_id) {
                    slog::warn!(self.logger, "Marking peer {} dead: connection lost", endpoint);
                    peer.set_state(NodeState::Dead);
                    peer.clear_connection();
                }
            }

            // Rounds still waiting on that peer can never finish.
            self.abort_rounds_waiting_on(endpoint);
        }

        // Parked requests from a departed client have no one to answer to.
        self.round_backlog.retain(|(client, _)| *client != conn_id);
    }
}

#[cfg(test)]
pub(crate) mod testing;
