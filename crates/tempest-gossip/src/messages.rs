//! Wire-level gossip message bodies: digests and the SYN/ACK/ACK2
//! exchange, plus the ECHO and SHUTDOWN notifications.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use tempest_common::prelude::*;

use crate::state::EndpointState;

/// Compact `(address, generation, max_version)` summary of what the
/// sender knows about one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDigest {
    pub endpoint: SocketAddr,
    pub generation: i32,
    pub max_version: i64,
}

impl GossipDigest {
    pub fn new(endpoint: SocketAddr, generation: i32, max_version: i64) -> Self {
        Self {
            endpoint,
            generation,
            max_version,
        }
    }
}

impl fmt::Display for GossipDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.endpoint, self.generation, self.max_version)
    }
}

/// Messages exchanged during a gossip round.
///
/// `Syn` opens a round with the sender's digest list; `Ack` answers with
/// the states the opener was missing plus the residual digests the
/// responder still wants; `Ack2` closes the round with those states.
/// An empty `Syn` digest list is a shadow-round request: "send me
/// everything you know".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Syn {
        cluster: String,
        partitioner: String,
        digests: Vec<GossipDigest>,
    },
    Ack {
        digests: Vec<GossipDigest>,
        states: Vec<(SocketAddr, EndpointState)>,
    },
    Ack2 {
        states: Vec<(SocketAddr, EndpointState)>,
    },
    /// Request/response pair confirming a direct link before a peer is
    /// marked alive.
    Echo,
    EchoResponse,
    /// One-way notice of graceful departure.
    Shutdown,
}

impl GossipMessage {
    pub fn verb(&self) -> &'static str {
        match self {
            GossipMessage::Syn { .. } => "GOSSIP_SYN",
            GossipMessage::Ack { .. } => "GOSSIP_ACK",
            GossipMessage::Ack2 { .. } => "GOSSIP_ACK2",
            GossipMessage::Echo => "ECHO",
            GossipMessage::EchoResponse => "ECHO_RSP",
            GossipMessage::Shutdown => "SHUTDOWN",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Order digests most-stale-first: the biggest gap between the
/// advertised max version and what we know locally sorts first, so the
/// nodes most behind are served first if a round is cut short.
pub fn sort_by_staleness<F>(digests: &mut [GossipDigest], local_max_version: F)
where
    F: Fn(SocketAddr) -> i64,
{
    digests.sort_by_key(|d| {
        let diff = (d.max_version - local_max_version(d.endpoint)).abs();
        std::cmp::Reverse(diff)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ApplicationState, EndpointState, HeartBeatState, VersionedValue};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_syn_encode_decode() {
        let msg = GossipMessage::Syn {
            cluster: "tempest".to_string(),
            partitioner: "Murmur3Partitioner".to_string(),
            digests: vec![
                GossipDigest::new(addr(7000), 100, 5),
                GossipDigest::new(addr(7001), 101, 3),
            ],
        };

        let bytes = msg.encode().unwrap();
        match GossipMessage::decode(&bytes).unwrap() {
            GossipMessage::Syn { cluster, digests, .. } => {
                assert_eq!(cluster, "tempest");
                assert_eq!(digests.len(), 2);
                assert_eq!(digests[1].generation, 101);
            }
            other => panic!("decoded wrong variant: {}", other.verb()),
        }
    }

    #[test]
    fn test_ack_carries_states_without_local_fields() {
        let gen = VersionGenerator::new();
        let mut state = EndpointState::new(HeartBeatState::new(7));
        state
            .heart_beat_state_mut()
            .update_heart_beat(&gen);
        let mut marked = state.clone();
        marked.set_alive(true);

        let msg = GossipMessage::Ack {
            digests: vec![],
            states: vec![(addr(7000), marked)],
        };
        let decoded = GossipMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            GossipMessage::Ack { states, .. } => {
                // is_alive is a local observation, never wire state
                assert!(!states[0].1.is_alive());
                assert_eq!(states[0].1.generation(), 7);
            }
            other => panic!("decoded wrong variant: {}", other.verb()),
        }
    }

    #[test]
    fn test_ordinal_coded_app_states_round_trip() {
        let mut state = EndpointState::new(HeartBeatState::new(1));
        state.add_application_state(
            ApplicationState::Status,
            VersionedValue::with_version(3, "NORMAL,42"),
        );
        state.add_application_state(ApplicationState::Dc, VersionedValue::with_version(4, "dc1"));

        let msg = GossipMessage::Ack2 {
            states: vec![(addr(7000), state)],
        };
        let decoded = GossipMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            GossipMessage::Ack2 { states } => {
                let s = &states[0].1;
                assert_eq!(s.application_state(ApplicationState::Dc).unwrap().value, "dc1");
                assert_eq!(s.max_version(), 4);
            }
            other => panic!("decoded wrong variant: {}", other.verb()),
        }
    }

    #[test]
    fn test_sort_by_staleness() {
        let mut digests = vec![
            GossipDigest::new(addr(1), 1, 10),
            GossipDigest::new(addr(2), 1, 100),
            GossipDigest::new(addr(3), 1, 40),
        ];
        // we know everything at version 10
        sort_by_staleness(&mut digests, |_| 10);
        assert_eq!(digests[0].endpoint, addr(2));
        assert_eq!(digests[1].endpoint, addr(3));
        assert_eq!(digests[2].endpoint, addr(1));
    }
}
