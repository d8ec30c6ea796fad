//! The on-wire command record. Every frame exchanged inside the quorum (and
//! with clients) is exactly one serialized `Command`.

use crate::protocol::ProposalId;
use crate::quorum::{NodeId, NodeState};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// One framed protocol message. The encoding is bincode behind a 4-byte
/// big-endian length prefix; the variant set is closed and shared by servers
/// and clients, so a node is wire-compatible with restarted peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum Command {
    /// Opens the identity exchange on a freshly dialed connection.
    HandshakeStart,
    /// Answer to `HandshakeStart`: who the responder is, where it believes it
    /// listens, and what role it currently claims.
    HandshakeResponse {
        host_id: NodeId,
        host_endpoint: SocketAddr,
        host_state: NodeState,
    },
    /// Leader asks a peer to promise proposal `proposal_id`.
    Prepare { proposal_id: ProposalId },
    /// Peer promises: it has seen nothing newer than `proposal_id`.
    Promise { proposal_id: ProposalId },
    /// Peer refuses `proposal_id` as stale.
    Fail { proposal_id: ProposalId },
    /// Leader distributes the workload of a fully promised proposal. Carries
    /// the proposal id so a peer can refuse an accept it never promised.
    Accept { proposal_id: ProposalId, workload: Bytes },
    /// A peer (or the leader itself) ran the workload handler; `workload`
    /// holds the handler's result.
    Accepted { proposal_id: ProposalId, workload: Bytes },
    /// A client submission.
    Request { workload: Bytes },
    /// Terminal failure reply for one client submission.
    Error { code: ErrorCode },
}

impl Command {
    /// Short name for logging.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Command::HandshakeStart => "handshake_start",
            Command::HandshakeResponse { .. } => "handshake_response",
            Command::Prepare { .. } => "prepare",
            Command::Promise { .. } => "promise",
            Command::Fail { .. } => "fail",
            Command::Accept { .. } => "accept",
            Command::Accepted { .. } => "accepted",
            Command::Request { .. } => "request",
            Command::Error { .. } => "error",
        }
    }

    pub(crate) fn encode(&self) -> Bytes {
        // Serialization of a closed enum over plain fields cannot fail.
        let buf = bincode::serialize(self).expect("command serialization is infallible");
        Bytes::from(buf)
    }

    pub(crate) fn decode(frame: &[u8]) -> Result<Command, CommandDecodeError> {
        Ok(bincode::deserialize(frame)?)
    }
}

/// The protocol-level failures a client can be told about.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) enum ErrorCode {
    /// The contacted node is not the leader, or lost a proposal race against
    /// a competing leader. Retrying after the next health check usually
    /// resolves this.
    IncorrectProposal,
    /// Quorum members returned different results for the same workload. The
    /// embedding application's handler is not deterministic.
    InconsistentResponse,
    /// A promised peer vanished mid-round and the round was abandoned.
    PeerUnreachable,
}

#[derive(Debug, thiserror::Error)]
#[error("malformed command frame: {0}")]
pub(crate) struct CommandDecodeError(#[from] bincode::Error);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_survive_a_codec_round_trip() {
        let original = Command::Accept {
            proposal_id: ProposalId::new(42),
            workload: Bytes::from_static(b"apply me"),
        };

        let decoded = Command::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn handshake_response_carries_identity_endpoint_and_state() {
        let original = Command::HandshakeResponse {
            host_id: NodeId::generate(),
            host_endpoint: "10.0.0.7:4000".parse().unwrap(),
            host_state: NodeState::Follower,
        };

        let decoded = Command::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn garbage_frames_are_rejected() {
        assert!(Command::decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
