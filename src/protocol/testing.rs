//! Shared scaffolding for protocol unit tests: a real engine wired to an
//! inspectable event queue and in-memory streams instead of sockets.

use crate::actor::{ActorClient, Event};
use crate::api::{NodeOptions, NodeOptionsValidated, WorkloadHandler};
use crate::net::FramedConnection;
use crate::protocol::{EndpointMismatch, HandshakeSuccess, Protocol};
use crate::quorum::{NodeId, NodeState, Quorum};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};

pub(crate) fn endpoint(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Identity handler that counts invocations.
pub(crate) struct CountingEcho {
    calls: Arc<AtomicUsize>,
}

impl WorkloadHandler for CountingEcho {
    fn process(&mut self, workload: Bytes) -> Bytes {
        self.calls.fetch_add(1, Ordering::SeqCst);
        workload
    }
}

/// A protocol engine whose event loop is played by the test itself:
/// connection reader tasks push events into the queue, and `step` feeds
/// them to the engine one at a time.
pub(crate) struct TestNode {
    pub(crate) protocol: Protocol<CountingEcho>,
    events: mpsc::Receiver<Event>,
    calls: Arc<AtomicUsize>,
}

impl TestNode {
    pub(crate) fn new(local_port: u16, peer_ports: &[u16]) -> Self {
        let (sender, events) = mpsc::channel(64);
        let actor_client = ActorClient::new(sender);
        let quorum = Quorum::new(
            NodeId::generate(),
            endpoint(local_port),
            peer_ports.iter().copied().map(endpoint).collect(),
        );
        let options = NodeOptionsValidated::try_from(NodeOptions::default()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = CountingEcho {
            calls: Arc::clone(&calls),
        };
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let protocol = Protocol::new(logger, options, quorum, handler, actor_client);

        TestNode {
            protocol,
            events,
            calls,
        }
    }

    pub(crate) fn handler_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Runs the handshake-completion path against an in-memory stream,
    /// leaving the peer identified, alive, and connected. Returns the far
    /// end for the test to play the peer with.
    pub(crate) fn connect_peer(
        &mut self,
        port: u16,
        id: NodeId,
        state: NodeState,
    ) -> FramedConnection<DuplexStream> {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let success = HandshakeSuccess {
            stream: Box::new(near),
            host_id: id,
            host_endpoint: endpoint(port),
            host_state: state,
        };
        let flow = self
            .protocol
            .handle_event(Event::HandshakeFinished(endpoint(port), Ok(success)));
        assert!(flow.is_continue());

        FramedConnection::new(far)
    }

    /// Registers an anonymous inbound connection, as the listener would.
    pub(crate) fn connect_client(&mut self) -> FramedConnection<DuplexStream> {
        let (near, far) = tokio::io::duplex(64 * 1024);
        self.protocol
            .handle_event(Event::InboundConnection(Box::new(near), endpoint(59999)));

        FramedConnection::new(far)
    }

    /// Pretends a bootstrap is waiting on handshakes to `ports`.
    pub(crate) fn arm_bootstrap(&mut self, ports: &[u16]) -> oneshot::Receiver<Result<(), EndpointMismatch>> {
        let (tx, rx) = oneshot::channel();
        self.protocol.bootstrap_notify = Some(tx);
        for port in ports {
            self.protocol.pending_handshakes.insert(endpoint(*port));
        }
        rx
    }

    /// Feeds the next queued event (produced by a connection reader task)
    /// into the engine.
    pub(crate) async fn step(&mut self) {
        let event = self.events.recv().await.expect("event queue closed");
        assert!(self.protocol.handle_event(event).is_continue());
    }
}
