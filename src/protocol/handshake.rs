//! Pairwise identity exchange. Dialing a peer, sending `HandshakeStart` and
//! reading the response happens on a spawned task; the outcome comes back to
//! the event loop as a `HandshakeFinished` event and is applied here.

use crate::api::WorkloadHandler;
use crate::net::{BoxedStream, ConnectionId, FramedConnection, WireError};
use crate::protocol::{Command, Protocol};
use crate::quorum::{NodeId, NodeState};
use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use tokio::sync::oneshot;
use tokio::time::Duration;

/// A completed identity exchange: who answered, where it claims to listen,
/// the role it claims, and the live connection the exchange ran on.
pub(crate) struct HandshakeSuccess {
    pub(crate) stream: BoxedStream,
    pub(crate) host_id: NodeId,
    pub(crate) host_endpoint: SocketAddr,
    pub(crate) host_state: NodeState,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum HandshakeError {
    #[error("peer unreachable: {0}")]
    Unreachable(io::Error),
    #[error("no handshake response within the deadline")]
    TimedOut,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("peer answered the handshake with '{0}'")]
    UnexpectedReply(&'static str),
}

/// A peer identified itself with an endpoint other than the one we dialed.
/// During startup this is fatal: the quorum configuration disagrees with
/// reality.
#[derive(Debug)]
pub(crate) struct EndpointMismatch {
    pub(crate) dialed: SocketAddr,
    pub(crate) reported: SocketAddr,
}

/// Runs one complete outbound handshake under `deadline`.
async fn dial(endpoint: SocketAddr, deadline: Duration) -> Result<HandshakeSuccess, HandshakeError> {
    let exchange = async {
        let mut conn = FramedConnection::connect(endpoint)
            .await
            .map_err(HandshakeError::Unreachable)?;
        conn.send(&Command::HandshakeStart).await?;

        match conn.recv().await? {
            Command::HandshakeResponse {
                host_id,
                host_endpoint,
                host_state,
            } => Ok(HandshakeSuccess {
                stream: Box::new(conn.into_inner()),
                host_id,
                host_endpoint,
                host_state,
            }),
            other => Err(HandshakeError::UnexpectedReply(other.kind())),
        }
    };

    match tokio::time::timeout(deadline, exchange).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::TimedOut),
    }
}

impl<H: WorkloadHandler> Protocol<H> {
    /// Startup entry point: handshake every configured peer, then elect.
    /// `notify` resolves once the quorum view has settled.
    pub(super) fn begin_bootstrap(&mut self, notify: oneshot::Sender<Result<(), EndpointMismatch>>) {
        if self.quorum.peer_count() == 0 {
            // Degenerate single-node quorum: there is no one to ask.
            slog::info!(self.logger, "Quorum has no peers; assuming leadership");
            self.quorum.adjust_local_state(NodeState::Leader);
            let _ = notify.send(Ok(()));
            return;
        }

        self.bootstrap_notify = Some(notify);
        let endpoints: Vec<SocketAddr> = self.quorum.peers().map(|p| p.endpoint()).collect();
        for endpoint in endpoints {
            self.spawn_handshake(endpoint);
        }
    }

    /// Starts one outbound handshake attempt, unless one is already running
    /// against the same peer.
    pub(super) fn spawn_handshake(&mut self, endpoint: SocketAddr) {
        if !self.pending_handshakes.insert(endpoint) {
            return;
        }

        slog::debug!(self.logger, "Opening handshake with {}", endpoint);
        let actor_client = self.actor_client.clone();
        let deadline = self.options.handshake_timeout;
        tokio::task::spawn(async move {
            let result = dial(endpoint, deadline).await;
            actor_client.handshake_finished(endpoint, result).await;
        });
    }

    /// Responder side: identify ourselves on the connection the request
    /// arrived on.
    pub(super) fn handle_handshake_start(&mut self, conn_id: ConnectionId) {
        let response = Command::HandshakeResponse {
            host_id: self.quorum.local_id(),
            host_endpoint: self.quorum.local_endpoint(),
            host_state: self.quorum.local_state(),
        };
        self.write_to(conn_id, response);
    }

    pub(super) fn handle_handshake_finished(
        &mut self,
        endpoint: SocketAddr,
        result: Result<HandshakeSuccess, HandshakeError>,
    ) -> ControlFlow<()> {
        self.pending_handshakes.remove(&endpoint);

        match result {
            Ok(success) => {
                if success.host_endpoint != endpoint {
                    return self.handle_endpoint_mismatch(endpoint, success.host_endpoint);
                }
                self.apply_handshake_response(endpoint, success);
            }
            Err(e) => {
                slog::warn!(self.logger, "Handshake with {} failed: {}; marking dead", endpoint, e);
                if let Some(peer) = self.quorum.lookup_mut(endpoint) {
                    peer.set_state(NodeState::Dead);
                    peer.clear_connection();
                }
            }
        }

        self.maybe_finish_bootstrap();
        ControlFlow::Continue(())
    }

    fn apply_handshake_response(&mut self, endpoint: SocketAddr, success: HandshakeSuccess) {
        let HandshakeSuccess {
            stream,
            host_id,
            host_state,
            ..
        } = success;

        let cache_connection = match self.quorum.lookup_mut(endpoint) {
            Some(peer) => {
                peer.set_identity(host_id);
                peer.set_state(host_state);
                peer.connection().is_none()
            }
            None => {
                slog::warn!(self.logger, "Handshake finished for unconfigured endpoint {}", endpoint);
                return;
            }
        };

        // Keep an existing cached connection; the fresh stream simply drops
        // (and closes) if the record already has one.
        if cache_connection {
            let handle = self.register_connection(stream, Some(endpoint));
            if let Some(peer) = self.quorum.lookup_mut(endpoint) {
                peer.set_connection(handle);
            }
        }

        slog::info!(
            self.logger,
            "Peer {} identified as {} in state '{}'",
            endpoint,
            host_id,
            host_state
        );
    }

    fn handle_endpoint_mismatch(&mut self, dialed: SocketAddr, reported: SocketAddr) -> ControlFlow<()> {
        if let Some(notify) = self.bootstrap_notify.take() {
            slog::crit!(
                self.logger,
                "Peer dialed at {} claims endpoint {}; aborting startup",
                dialed,
                reported
            );
            let _ = notify.send(Err(EndpointMismatch { dialed, reported }));
            return ControlFlow::Break(());
        }

        // Past startup the quorum is immutable, so a mismatch means the
        // remote process was reconfigured under us. Refuse to talk to it.
        slog::crit!(
            self.logger,
            "Peer dialed at {} now claims endpoint {}; marking dead",
            dialed,
            reported
        );
        if let Some(peer) = self.quorum.lookup_mut(dialed) {
            peer.set_state(NodeState::Dead);
            peer.clear_connection();
        }
        ControlFlow::Continue(())
    }

    fn maybe_finish_bootstrap(&mut self) {
        if self.bootstrap_notify.is_none() || !self.pending_handshakes.is_empty() {
            return;
        }

        // Every peer is now identified or dead; pick a leader and open for
        // business.
        self.run_election();
        if let Some(notify) = self.bootstrap_notify.take() {
            let _ = notify.send(Ok(()));
        }
    }
}
