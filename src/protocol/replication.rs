//! The prepare/accept replication engine. The leader half drives rounds on
//! behalf of clients; the follower half reacts to `prepare` and `accept`
//! commands from whoever currently leads.

use crate::api::WorkloadHandler;
use crate::net::ConnectionId;
use crate::protocol::{Command, ErrorCode, Protocol, ProposalId};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Debug, Eq, PartialEq)]
enum Phase {
    Preparing,
    Accepting,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Ack {
    Pending,
    Promised,
    Rejected,
}

/// Round is the leader-side state of one client request, from the first
/// `prepare` until the client reply. It lives in `Protocol::rounds` keyed by
/// proposal id and is dropped the moment the reply (or error) is written.
pub(super) struct Round {
    phase: Phase,
    /// Per contacted endpoint: did it promise? The leader's own endpoint
    /// joins this map when the accept phase starts.
    acks: HashMap<SocketAddr, Ack>,
    /// Handler results, keyed by the endpoint that produced them. Only
    /// promised endpoints may contribute.
    responses: HashMap<SocketAddr, Bytes>,
    /// The response that arrived last; echoed to the client on completion.
    last_response: Option<Bytes>,
    client_conn: ConnectionId,
    payload: Bytes,
}

impl Round {
    fn new(client_conn: ConnectionId, payload: Bytes) -> Self {
        Round {
            phase: Phase::Preparing,
            acks: HashMap::new(),
            responses: HashMap::new(),
            last_response: None,
            client_conn,
            payload,
        }
    }

    fn everyone_promised(&self) -> bool {
        self.acks.values().all(|ack| *ack == Ack::Promised)
    }

    fn promised_count(&self) -> usize {
        self.acks.values().filter(|ack| **ack == Ack::Promised).count()
    }

    /// Whether this round still needs anything from `endpoint`.
    fn awaits(&self, endpoint: SocketAddr) -> bool {
        match self.acks.get(&endpoint) {
            Some(Ack::Pending) => true,
            Some(Ack::Promised) => !self.responses.contains_key(&endpoint),
            _ => false,
        }
    }
}

impl<H: WorkloadHandler> Protocol<H> {
    /// Leader entry point: one client submission becomes one round. Requests
    /// arriving while a round is in flight park in the backlog, which keeps
    /// proposal ids aligned with arrival order.
    pub(super) fn handle_client_request(&mut self, client_conn: ConnectionId, workload: Bytes) {
        if !self.quorum.we_are_the_leader() {
            slog::debug!(
                self.logger,
                "Refusing request on {}: we are not the leader",
                client_conn
            );
            self.write_to(
                client_conn,
                Command::Error {
                    code: ErrorCode::IncorrectProposal,
                },
            );
            return;
        }

        if !self.rounds.is_empty() {
            self.round_backlog.push_back((client_conn, workload));
            return;
        }

        self.start_round(client_conn, workload);
    }

    fn start_round(&mut self, client_conn: ConnectionId, payload: Bytes) {
        self.proposal_counter = self.proposal_counter.next();
        let proposal_id = self.proposal_counter;

        let mut round = Round::new(client_conn, payload);
        for peer in self.quorum.peers() {
            if !peer.is_alive() {
                slog::debug!(
                    self.logger,
                    "Round {} skips dead peer {}",
                    proposal_id,
                    peer.endpoint()
                );
                continue;
            }
            let Some(conn) = peer.connection() else {
                // Alive on paper but the handshake has not caught up yet;
                // the round proceeds without it, like a dead peer.
                slog::warn!(
                    self.logger,
                    "Round {} skips unconnected peer {}",
                    proposal_id,
                    peer.endpoint()
                );
                continue;
            };

            round.acks.insert(peer.endpoint(), Ack::Pending);
            conn.write_command(Command::Prepare { proposal_id });
        }

        slog::debug!(
            self.logger,
            "Round {} preparing across {} peer(s)",
            proposal_id,
            round.acks.len()
        );
        let contacted_anyone = !round.acks.is_empty();
        self.rounds.insert(proposal_id, round);

        if contacted_anyone {
            // A promised peer dying unnoticed must not hang the client
            // forever; the deadline sweeps whatever is still in flight.
            let actor_client = self.actor_client.clone();
            let deadline = self.options.round_timeout;
            tokio::task::spawn(async move {
                tokio::time::sleep(deadline).await;
                actor_client.round_deadline(proposal_id).await;
            });
        } else {
            // No live peers: the round is ours alone.
            self.enter_accept_phase(proposal_id);
        }
    }

    /// Follower side of phase one. A prepare is promised iff it is newer
    /// than anything this node has seen; the counter only ratchets up.
    pub(super) fn handle_prepare(&mut self, conn_id: ConnectionId, proposal_id: ProposalId) {
        let reply = if proposal_id > self.proposal_counter {
            self.proposal_counter = proposal_id;
            Command::Promise { proposal_id }
        } else {
            slog::debug!(
                self.logger,
                "Refusing prepare {} (counter at {})",
                proposal_id,
                self.proposal_counter
            );
            Command::Fail { proposal_id }
        };
        self.write_to(conn_id, reply);
    }

    /// Follower side of phase two. Accepts are honored only for the exact
    /// proposal this node last promised; anything else means the sender lost
    /// a proposal race after we had moved on.
    pub(super) fn handle_accept(&mut self, conn_id: ConnectionId, proposal_id: ProposalId, workload: Bytes) {
        if proposal_id != self.proposal_counter {
            slog::warn!(
                self.logger,
                "Refusing accept {} (counter at {})",
                proposal_id,
                self.proposal_counter
            );
            self.write_to(conn_id, Command::Fail { proposal_id });
            return;
        }

        let result = self.handler.process(workload);
        self.write_to(
            conn_id,
            Command::Accepted {
                proposal_id,
                workload: result,
            },
        );
    }

    /// Leader handling of a peer's `promise` or `fail`.
    pub(super) fn handle_prepare_reply(&mut self, conn_id: ConnectionId, proposal_id: ProposalId, promised: bool) {
        let Some(endpoint) = self.connection_endpoint(conn_id) else {
            slog::warn!(self.logger, "Prepare reply on unidentified {}", conn_id);
            return;
        };

        let all_promised = {
            let Some(round) = self.rounds.get_mut(&proposal_id) else {
                slog::debug!(self.logger, "Late prepare reply for round {}", proposal_id);
                return;
            };
            if round.phase != Phase::Preparing {
                slog::warn!(
                    self.logger,
                    "Prepare reply from {} after round {} left the prepare phase",
                    endpoint,
                    proposal_id
                );
                return;
            }
            let Some(slot) = round.acks.get_mut(&endpoint) else {
                slog::warn!(self.logger, "Unsolicited prepare reply from {}", endpoint);
                return;
            };
            if *slot != Ack::Pending {
                slog::warn!(self.logger, "Duplicate prepare reply from {}", endpoint);
                return;
            }
            *slot = if promised { Ack::Promised } else { Ack::Rejected };
            round.everyone_promised()
        };

        if !promised {
            // Promises must be unanimous across the contacted set; one
            // refusal sinks the round.
            slog::warn!(self.logger, "Round {} refused by {}", proposal_id, endpoint);
            self.abort_round(proposal_id, ErrorCode::IncorrectProposal);
            return;
        }

        if all_promised {
            self.enter_accept_phase(proposal_id);
        }
    }

    fn enter_accept_phase(&mut self, proposal_id: ProposalId) {
        let (payload, promised_peers) = {
            let Some(round) = self.rounds.get_mut(&proposal_id) else {
                return;
            };
            round.phase = Phase::Accepting;
            let promised: Vec<SocketAddr> = round
                .acks
                .iter()
                .filter(|(_, ack)| **ack == Ack::Promised)
                .map(|(endpoint, _)| *endpoint)
                .collect();
            (round.payload.clone(), promised)
        };

        slog::debug!(
            self.logger,
            "Round {} fully promised; distributing workload",
            proposal_id
        );
        for endpoint in promised_peers {
            let Some(conn) = self.quorum.lookup(endpoint).and_then(|p| p.connection()) else {
                // Lost between promise and accept; the close event for that
                // connection aborts this round.
                continue;
            };
            conn.write_command(Command::Accept {
                proposal_id,
                workload: payload.clone(),
            });
        }

        // The leader is part of the quorum too: run the workload locally and
        // feed the result in as if a peer had answered.
        let local_result = self.handler.process(payload);
        let local_endpoint = self.quorum.local_endpoint();
        if let Some(round) = self.rounds.get_mut(&proposal_id) {
            round.acks.insert(local_endpoint, Ack::Promised);
        }
        self.record_response(proposal_id, local_endpoint, local_result);
    }

    /// Leader handling of a peer's `accepted`.
    pub(super) fn handle_accepted(&mut self, conn_id: ConnectionId, proposal_id: ProposalId, workload: Bytes) {
        let Some(endpoint) = self.connection_endpoint(conn_id) else {
            slog::warn!(self.logger, "Accepted reply on unidentified {}", conn_id);
            return;
        };
        self.record_response(proposal_id, endpoint, workload);
    }

    fn record_response(&mut self, proposal_id: ProposalId, endpoint: SocketAddr, response: Bytes) {
        let complete = {
            let Some(round) = self.rounds.get_mut(&proposal_id) else {
                slog::debug!(self.logger, "Late response for round {}", proposal_id);
                return;
            };
            if round.phase != Phase::Accepting {
                slog::warn!(
                    self.logger,
                    "Response from {} before round {} reached the accept phase",
                    endpoint,
                    proposal_id
                );
                return;
            }
            if round.acks.get(&endpoint) != Some(&Ack::Promised) {
                slog::warn!(self.logger, "Response from unpromised endpoint {}", endpoint);
                return;
            }
            if round.responses.contains_key(&endpoint) {
                slog::warn!(self.logger, "Duplicate response from {}", endpoint);
                return;
            }

            round.responses.insert(endpoint, response.clone());
            round.last_response = Some(response);
            round.responses.len() == round.promised_count()
        };

        if complete {
            self.finish_round(proposal_id);
        }
    }

    fn finish_round(&mut self, proposal_id: ProposalId) {
        let Some(round) = self.rounds.remove(&proposal_id) else {
            return;
        };

        // The handler contract is determinism, so every member must have
        // produced identical bytes.
        let mut responses = round.responses.values();
        let consistent = match responses.next() {
            Some(first) => responses.all(|r| r == first),
            None => true,
        };

        if !consistent {
            slog::error!(
                self.logger,
                "Round {} produced divergent responses across the quorum",
                proposal_id
            );
            self.write_to(
                round.client_conn,
                Command::Error {
                    code: ErrorCode::InconsistentResponse,
                },
            );
        } else if let Some(workload) = round.last_response {
            slog::debug!(self.logger, "Round {} complete", proposal_id);
            self.write_to(round.client_conn, Command::Accepted { proposal_id, workload });
        }

        self.start_next_round();
    }

    fn abort_round(&mut self, proposal_id: ProposalId, code: ErrorCode) {
        let Some(round) = self.rounds.remove(&proposal_id) else {
            return;
        };
        self.write_to(round.client_conn, Command::Error { code });
        self.start_next_round();
    }

    /// Called when a peer connection dies: any round that still needs that
    /// peer can never finish and is surfaced to its client as unreachable.
    pub(super) fn abort_rounds_waiting_on(&mut self, endpoint: SocketAddr) {
        let stalled: Vec<ProposalId> = self
            .rounds
            .iter()
            .filter(|(_, round)| round.awaits(endpoint))
            .map(|(id, _)| *id)
            .collect();

        for proposal_id in stalled {
            slog::warn!(
                self.logger,
                "Aborting round {}: peer {} is gone",
                proposal_id,
                endpoint
            );
            self.abort_round(proposal_id, ErrorCode::PeerUnreachable);
        }
    }

    pub(super) fn handle_round_deadline(&mut self, proposal_id: ProposalId) {
        if self.rounds.contains_key(&proposal_id) {
            slog::warn!(
                self.logger,
                "Round {} hit its deadline waiting for the quorum",
                proposal_id
            );
            self.abort_round(proposal_id, ErrorCode::PeerUnreachable);
        }
    }

    fn start_next_round(&mut self) {
        if !self.rounds.is_empty() {
            return;
        }

        while let Some((client_conn, payload)) = self.round_backlog.pop_front() {
            if !self.connections.contains_key(&client_conn) {
                // Client left while parked.
                continue;
            }
            if !self.quorum.we_are_the_leader() {
                self.write_to(
                    client_conn,
                    Command::Error {
                        code: ErrorCode::IncorrectProposal,
                    },
                );
                continue;
            }
            self.start_round(client_conn, payload);
            return;
        }
    }
}
