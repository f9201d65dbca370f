//! # Tempest Gossip
//!
//! Cluster membership and liveness for Tempest providing:
//! - Anti-entropy gossip with a three-way digest exchange (SYN/ACK/ACK2)
//! - Versioned per-endpoint state with restart-proof generations
//! - Phi-accrual failure detection
//! - Quarantine of removed addresses and fat-client eviction
//! - Administrative removal, replacement, and assassination of nodes

pub mod failure_detector;
pub mod gossiper;
pub mod handlers;
pub mod messages;
pub mod state;
pub mod status;
pub mod transport;

// Re-exports from state
pub use state::{ApplicationState, EndpointState, HeartBeatState, VersionedValue};

// Re-exports from status
pub use status::NodeStatus;

// Re-exports from messages
pub use messages::{sort_by_staleness, GossipDigest, GossipMessage};

// Re-exports from failure_detector
pub use failure_detector::{FailureDetectionEventListener, FailureDetector, PHI_FACTOR};

// Re-exports from gossiper
pub use gossiper::{EndpointStateChangeSubscriber, Gossiper};

// Re-exports from handlers
pub use handlers::{dispatch, Ack2Handler, AckHandler, EchoHandler, ShutdownHandler, SynHandler, VerbHandler};

// Re-exports from transport
pub use transport::{
    GossipTransport, InMemoryTransport, LocalityProbe, MemoryPeerStore, NullPeerStore, PeerStore,
    RingTopology, SingleDc, StaticTopology, ECHO_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
