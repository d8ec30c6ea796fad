//! Periodic quorum maintenance: recover dead peers and keep leadership
//! consistent with the live set.

use crate::api::WorkloadHandler;
use crate::protocol::Protocol;
use std::net::SocketAddr;

impl<H: WorkloadHandler> Protocol<H> {
    /// One health-check tick. Every peer that is dead, or alive but without
    /// a usable connection, gets a fresh handshake; then leadership is
    /// re-evaluated so a lost leader is replaced and transient dual-leader
    /// views converge.
    pub(super) fn handle_health_check(&mut self) {
        let needs_handshake: Vec<SocketAddr> = self
            .quorum
            .peers()
            .filter(|peer| !peer.is_alive() || peer.connection().is_none())
            .map(|peer| peer.endpoint())
            .collect();

        for endpoint in needs_handshake {
            slog::debug!(self.logger, "Health check: re-handshaking {}", endpoint);
            self.spawn_handshake(endpoint);
        }

        self.run_election();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Event;
    use crate::protocol::testing::{endpoint, TestNode};
    use crate::quorum::{NodeId, NodeState};

    #[tokio::test]
    async fn dead_peers_are_rehandshaked_on_tick() {
        let mut node = TestNode::new(5000, &[5001]);
        node.protocol
            .quorum
            .lookup_mut(endpoint(5001))
            .unwrap()
            .set_state(NodeState::Dead);

        node.protocol.handle_event(Event::HealthCheckTick);

        assert!(node.protocol.pending_handshakes.contains(&endpoint(5001)));
    }

    #[tokio::test]
    async fn a_lost_leader_is_replaced_on_tick() {
        let mut node = TestNode::new(5000, &[5001]);

        // The peer holds the smallest identity and leads.
        {
            let peer = node.protocol.quorum.lookup_mut(endpoint(5001)).unwrap();
            peer.set_identity(NodeId::nil());
            peer.set_state(NodeState::Leader);
        }
        node.protocol.run_election();
        assert_eq!(node.protocol.quorum.local_state(), NodeState::Follower);

        // It dies; the next tick promotes us.
        node.protocol
            .quorum
            .lookup_mut(endpoint(5001))
            .unwrap()
            .set_state(NodeState::Dead);
        node.protocol.handle_event(Event::HealthCheckTick);

        assert!(node.protocol.quorum.we_are_the_leader());
    }
}
