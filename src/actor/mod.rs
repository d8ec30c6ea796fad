use crate::api::WorkloadHandler;
use crate::net::{BoxedStream, ConnectionId, WireError};
use crate::protocol::{Command, EndpointMismatch, HandshakeError, HandshakeSuccess, ProposalId, Protocol};
use std::net::SocketAddr;
use std::ops::ControlFlow;
use tokio::sync::{mpsc, oneshot};

/// Everything that can happen to a node funnels through this one event type.
/// The matching handler runs on the single protocol task, so protocol state
/// needs no locking anywhere.
pub(crate) enum Event {
    /// Kick off the startup handshake + election. The sender resolves once
    /// every configured peer is either identified or marked dead; a fatal
    /// misconfiguration resolves it with the mismatch instead.
    Bootstrap(oneshot::Sender<Result<(), EndpointMismatch>>),

    /// The listener accepted a connection (a peer or a client; we cannot
    /// tell yet and do not need to).
    InboundConnection(BoxedStream, SocketAddr),

    /// A registered connection's reader produced one framed command.
    CommandReceived(ConnectionId, Command),

    /// A registered connection is gone. `None` means a clean close.
    ConnectionClosed(ConnectionId, Option<WireError>),

    /// An outbound handshake attempt resolved, one way or the other.
    HandshakeFinished(SocketAddr, Result<HandshakeSuccess, HandshakeError>),

    /// The round-level deadline for one in-flight proposal expired.
    RoundDeadline(ProposalId),

    /// Periodic prod to re-handshake dead peers and re-check leadership.
    HealthCheckTick,
}

impl Event {
    fn name(&self) -> &'static str {
        match self {
            Event::Bootstrap(_) => "bootstrap",
            Event::InboundConnection(_, _) => "inbound_connection",
            Event::CommandReceived(_, _) => "command_received",
            Event::ConnectionClosed(_, _) => "connection_closed",
            Event::HandshakeFinished(_, _) => "handshake_finished",
            Event::RoundDeadline(_) => "round_deadline",
            Event::HealthCheckTick => "health_check_tick",
        }
    }
}

/// ActorClient is how everything outside the protocol task (reader tasks,
/// the listener, timers, the factory) talks to it. Every method returns
/// whether the event was delivered; callers treat `false` as "the node is
/// shutting down" and unwind quietly.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(sender: mpsc::Sender<Event>) -> Self {
        ActorClient { sender }
    }

    pub(crate) async fn bootstrap(&self, notify: oneshot::Sender<Result<(), EndpointMismatch>>) -> bool {
        self.send(Event::Bootstrap(notify)).await
    }

    pub(crate) async fn inbound_connection(&self, stream: BoxedStream, remote_addr: SocketAddr) -> bool {
        self.send(Event::InboundConnection(stream, remote_addr)).await
    }

    pub(crate) async fn command_received(&self, conn_id: ConnectionId, command: Command) -> bool {
        self.send(Event::CommandReceived(conn_id, command)).await
    }

    pub(crate) async fn connection_closed(&self, conn_id: ConnectionId, cause: Option<WireError>) -> bool {
        self.send(Event::ConnectionClosed(conn_id, cause)).await
    }

    pub(crate) async fn handshake_finished(
        &self,
        endpoint: SocketAddr,
        result: Result<HandshakeSuccess, HandshakeError>,
    ) -> bool {
        self.send(Event::HandshakeFinished(endpoint, result)).await
    }

    pub(crate) async fn round_deadline(&self, proposal_id: ProposalId) -> bool {
        self.send(Event::RoundDeadline(proposal_id)).await
    }

    pub(crate) async fn health_check_tick(&self) -> bool {
        self.send(Event::HealthCheckTick).await
    }

    async fn send(&self, event: Event) -> bool {
        self.sender.send(event).await.is_ok()
    }
}

/// NodeActor owns the protocol engine and drains the event queue into it.
pub(crate) struct NodeActor<H: WorkloadHandler> {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    protocol: Protocol<H>,
}

impl<H: WorkloadHandler> NodeActor<H> {
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, protocol: Protocol<H>) -> Self {
        NodeActor {
            logger,
            receiver,
            protocol,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            slog::trace!(self.logger, "Handling '{}' event", event.name());

            // Handlers must not await; anything slow is spawned and comes
            // back as another event.
            if let ControlFlow::Break(()) = self.protocol.handle_event(event) {
                break;
            }
        }

        slog::info!(self.logger, "Protocol event loop has exited");
    }
}
