use crate::net::ConnectionHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// NodeId is the stable identity of a quorum member. It is generated once at
/// process startup and learned by everyone else through the handshake.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub(crate) fn generate() -> Self {
        NodeId(Uuid::new_v4())
    }

    /// Sorts before every generated identity.
    #[cfg(test)]
    pub(crate) fn nil() -> Self {
        NodeId(Uuid::nil())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The liveness/role state of a quorum member, as locally observed. A peer's
/// state is written only by the handshake and health-check paths; replication
/// reads it to decide which peers to contact.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) enum NodeState {
    Unknown,
    Leader,
    Follower,
    Dead,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Unknown => "unknown",
            NodeState::Leader => "leader",
            NodeState::Follower => "follower",
            NodeState::Dead => "dead",
        };
        write!(f, "{}", name)
    }
}

/// PeerRecord is everything we track about one configured peer: where it
/// listens, who it turned out to be, whether it is alive, and the cached
/// outbound connection we reach it on.
pub(crate) struct PeerRecord {
    endpoint: SocketAddr,
    identity: Option<NodeId>,
    state: NodeState,
    connection: Option<ConnectionHandle>,
}

impl PeerRecord {
    fn new(endpoint: SocketAddr) -> Self {
        PeerRecord {
            endpoint,
            identity: None,
            state: NodeState::Unknown,
            connection: None,
        }
    }

    pub(crate) fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub(crate) fn identity(&self) -> Option<NodeId> {
        self.identity
    }

    pub(crate) fn state(&self) -> NodeState {
        self.state
    }

    /// A peer counts as alive unless we have positively marked it dead.
    pub(crate) fn is_alive(&self) -> bool {
        self.state != NodeState::Dead
    }

    pub(crate) fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    pub(crate) fn set_identity(&mut self, identity: NodeId) {
        self.identity = Some(identity);
    }

    pub(crate) fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    pub(crate) fn set_connection(&mut self, connection: ConnectionHandle) {
        self.connection = Some(connection);
    }

    pub(crate) fn clear_connection(&mut self) {
        self.connection = None;
    }
}

/// Quorum is the fixed membership this node was configured with: one local
/// record plus one peer record per remote endpoint. Membership never changes
/// after construction.
pub(crate) struct Quorum {
    local_id: NodeId,
    local_endpoint: SocketAddr,
    local_state: NodeState,
    peers: Vec<PeerRecord>,
}

impl Quorum {
    pub(crate) fn new(local_id: NodeId, local_endpoint: SocketAddr, peer_endpoints: Vec<SocketAddr>) -> Self {
        let peers = peer_endpoints.into_iter().map(PeerRecord::new).collect();
        Quorum {
            local_id,
            local_endpoint,
            local_state: NodeState::Unknown,
            peers,
        }
    }

    pub(crate) fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub(crate) fn local_endpoint(&self) -> SocketAddr {
        self.local_endpoint
    }

    pub(crate) fn local_state(&self) -> NodeState {
        self.local_state
    }

    pub(crate) fn adjust_local_state(&mut self, state: NodeState) {
        self.local_state = state;
    }

    pub(crate) fn we_are_the_leader(&self) -> bool {
        self.local_state == NodeState::Leader
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Iteration is in configuration order.
    pub(crate) fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.iter()
    }

    pub(crate) fn lookup(&self, endpoint: SocketAddr) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.endpoint == endpoint)
    }

    pub(crate) fn lookup_mut(&mut self, endpoint: SocketAddr) -> Option<&mut PeerRecord> {
        self.peers.iter_mut().find(|p| p.endpoint == endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn peers_iterate_in_configuration_order() {
        let quorum = Quorum::new(NodeId::generate(), ep(1000), vec![ep(1003), ep(1001), ep(1002)]);

        let endpoints: Vec<SocketAddr> = quorum.peers().map(|p| p.endpoint()).collect();
        assert_eq!(endpoints, vec![ep(1003), ep(1001), ep(1002)]);
    }

    #[test]
    fn new_peer_records_start_unknown_and_unidentified() {
        let quorum = Quorum::new(NodeId::generate(), ep(1000), vec![ep(1001)]);

        let peer = quorum.lookup(ep(1001)).unwrap();
        assert_eq!(peer.state(), NodeState::Unknown);
        assert!(peer.identity().is_none());
        assert!(peer.connection().is_none());
        assert!(peer.is_alive());
    }

    #[test]
    fn lookup_misses_unconfigured_endpoints() {
        let quorum = Quorum::new(NodeId::generate(), ep(1000), vec![ep(1001)]);

        assert!(quorum.lookup(ep(1002)).is_none());
        // The local endpoint is not a peer.
        assert!(quorum.lookup(ep(1000)).is_none());
    }

    #[test]
    fn leadership_follows_local_state() {
        let mut quorum = Quorum::new(NodeId::generate(), ep(1000), vec![ep(1001)]);
        assert!(!quorum.we_are_the_leader());

        quorum.adjust_local_state(NodeState::Leader);
        assert!(quorum.we_are_the_leader());

        quorum.adjust_local_state(NodeState::Follower);
        assert!(!quorum.we_are_the_leader());
    }

    #[test]
    fn dead_peers_are_not_alive() {
        let mut quorum = Quorum::new(NodeId::generate(), ep(1000), vec![ep(1001)]);

        quorum.lookup_mut(ep(1001)).unwrap().set_state(NodeState::Dead);
        assert!(!quorum.lookup(ep(1001)).unwrap().is_alive());
    }
}
