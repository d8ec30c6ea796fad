//! Deterministic leader selection. Every node runs the same rule over its
//! own view of the live set; because identities are fixed and the live set
//! converges through health checks, all views settle on the same node.

use crate::api::WorkloadHandler;
use crate::protocol::Protocol;
use crate::quorum::{NodeState, Quorum};
use std::net::SocketAddr;

/// Winner of one election pass over the local view.
#[derive(Debug, Eq, PartialEq)]
pub(super) enum Elected {
    Us,
    Peer(SocketAddr),
}

/// Picks the live node with the smallest identity. We are always a live
/// candidate; peers qualify once they are not dead and their identity is
/// known (an unidentified peer cannot be compared, and the next handshake
/// will identify it).
pub(super) fn choose_leader(quorum: &Quorum) -> Elected {
    let mut winner = Elected::Us;
    let mut winner_id = quorum.local_id();

    for peer in quorum.peers() {
        if !peer.is_alive() {
            continue;
        }
        let Some(id) = peer.identity() else {
            continue;
        };
        if id < winner_id {
            winner_id = id;
            winner = Elected::Peer(peer.endpoint());
        }
    }

    winner
}

impl<H: WorkloadHandler> Protocol<H> {
    /// Re-evaluates leadership over the current view and adjusts our own
    /// role. Ties are impossible: identities are unique.
    pub(super) fn run_election(&mut self) {
        let new_state = match choose_leader(&self.quorum) {
            Elected::Us => NodeState::Leader,
            Elected::Peer(_) => NodeState::Follower,
        };

        let old_state = self.quorum.local_state();
        if old_state != new_state {
            slog::info!(
                self.logger,
                "Election over live set: transitioning '{}' -> '{}'",
                old_state,
                new_state
            );
        }
        self.quorum.adjust_local_state(new_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::{endpoint, TestNode};
    use crate::quorum::NodeId;

    #[tokio::test]
    async fn smallest_live_identity_wins() {
        let mut node = TestNode::new(5000, &[5001, 5002]);

        // The nil identity sorts below every generated one, so 5002 must win.
        {
            let peer = node.protocol.quorum.lookup_mut(endpoint(5001)).unwrap();
            peer.set_identity(NodeId::generate());
            peer.set_state(NodeState::Follower);
        }
        {
            let peer = node.protocol.quorum.lookup_mut(endpoint(5002)).unwrap();
            peer.set_identity(NodeId::nil());
            peer.set_state(NodeState::Follower);
        }

        assert_eq!(choose_leader(&node.protocol.quorum), Elected::Peer(endpoint(5002)));
    }

    #[tokio::test]
    async fn dead_and_unidentified_peers_are_not_candidates() {
        let mut node = TestNode::new(5000, &[5001, 5002]);

        // 5001 is dead (despite the winning identity), 5002 was never
        // identified.
        {
            let peer = node.protocol.quorum.lookup_mut(endpoint(5001)).unwrap();
            peer.set_identity(NodeId::nil());
            peer.set_state(NodeState::Dead);
        }

        assert_eq!(choose_leader(&node.protocol.quorum), Elected::Us);
    }

    #[tokio::test]
    async fn election_adjusts_our_role_both_ways() {
        let mut node = TestNode::new(5000, &[5001]);

        // Alone in the live set: we lead.
        node.protocol.run_election();
        assert!(node.protocol.quorum.we_are_the_leader());

        // A live peer with a smaller identity demotes us.
        {
            let peer = node.protocol.quorum.lookup_mut(endpoint(5001)).unwrap();
            peer.set_identity(NodeId::nil());
            peer.set_state(NodeState::Follower);
        }
        node.protocol.run_election();
        assert_eq!(node.protocol.quorum.local_state(), NodeState::Follower);
    }
}
