//! This mod is responsible for describing a node before it starts: where it
//! listens, who else is in the quorum, and the protocol timings.

use crate::api::factory::StartNodeError;
use crate::api::handler::WorkloadHandler;
use std::net::SocketAddr;
use tokio::time::Duration;

pub struct NodeConfig<H>
where
    H: WorkloadHandler,
{
    pub handler: H,
    pub info_logger: slog::Logger,
    pub cluster: ClusterInfo,
    pub options: NodeOptions,
}

pub struct ClusterInfo {
    /// The endpoint this node binds, and the one it advertises to peers
    /// during the handshake.
    pub local_endpoint: SocketAddr,
    /// Every quorum member. Listing `local_endpoint` here is allowed (it is
    /// the natural way to share one member list across all nodes) and is
    /// filtered out.
    pub members: Vec<SocketAddr>,
}

impl ClusterInfo {
    /// The configured members minus ourselves, in configuration order.
    pub(crate) fn peer_endpoints(&self) -> Result<Vec<SocketAddr>, StartNodeError> {
        let mut local_seen = false;
        let mut peers = Vec::with_capacity(self.members.len());

        for member in &self.members {
            if *member == self.local_endpoint {
                if local_seen {
                    return Err(StartNodeError::DuplicateMember(*member));
                }
                local_seen = true;
                continue;
            }
            if peers.contains(member) {
                return Err(StartNodeError::DuplicateMember(*member));
            }
            peers.push(*member);
        }

        Ok(peers)
    }
}

#[derive(Clone, Default)]
pub struct NodeOptions {
    /// How long a dialed peer gets to answer the handshake before it is
    /// marked dead. Default: 3s.
    pub handshake_timeout: Option<Duration>,
    /// How often dead peers are re-handshaked and leadership re-checked.
    /// Default: 2s.
    pub health_check_period: Option<Duration>,
    /// How long one replication round may stay in flight before it is
    /// abandoned and the client told. Default: 10s.
    pub round_timeout: Option<Duration>,
}

#[derive(Clone)]
pub(crate) struct NodeOptionsValidated {
    pub(crate) handshake_timeout: Duration,
    pub(crate) health_check_period: Duration,
    pub(crate) round_timeout: Duration,
}

impl NodeOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.handshake_timeout.is_zero() || self.health_check_period.is_zero() || self.round_timeout.is_zero() {
            return Err("timeouts and periods must be non-zero");
        }
        if self.round_timeout <= self.handshake_timeout {
            return Err("round timeout must exceed the handshake timeout");
        }

        Ok(())
    }
}

impl TryFrom<NodeOptions> for NodeOptionsValidated {
    type Error = &'static str;

    fn try_from(options: NodeOptions) -> Result<Self, Self::Error> {
        let values = NodeOptionsValidated {
            handshake_timeout: options.handshake_timeout.unwrap_or(Duration::from_secs(3)),
            health_check_period: options.health_check_period.unwrap_or(Duration::from_secs(2)),
            round_timeout: options.round_timeout.unwrap_or(Duration::from_secs(10)),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn default_options_validate() {
        assert!(NodeOptionsValidated::try_from(NodeOptions::default()).is_ok());
    }

    #[test]
    fn zero_durations_are_rejected() {
        let options = NodeOptions {
            handshake_timeout: Some(Duration::ZERO),
            ..NodeOptions::default()
        };
        assert!(NodeOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn round_timeout_must_exceed_handshake_timeout() {
        let options = NodeOptions {
            handshake_timeout: Some(Duration::from_secs(5)),
            round_timeout: Some(Duration::from_secs(5)),
            ..NodeOptions::default()
        };
        assert!(NodeOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn the_member_list_may_include_the_local_endpoint() {
        let cluster = ClusterInfo {
            local_endpoint: ep(4000),
            members: vec![ep(4000), ep(4001), ep(4002)],
        };

        assert_eq!(cluster.peer_endpoints().unwrap(), vec![ep(4001), ep(4002)]);
    }

    #[test]
    fn duplicate_members_are_rejected() {
        let cluster = ClusterInfo {
            local_endpoint: ep(4000),
            members: vec![ep(4001), ep(4001)],
        };

        assert!(matches!(
            cluster.peer_endpoints(),
            Err(StartNodeError::DuplicateMember(_))
        ));
    }
}
