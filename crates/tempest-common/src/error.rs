//! Error types for Tempest

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using Tempest's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Tempest
#[derive(Error, Debug)]
pub enum Error {
    // Gossip protocol errors
    #[error("Gossip error: {0}")]
    Gossip(#[from] GossipError),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by the gossip subsystem
#[derive(Error, Debug)]
pub enum GossipError {
    #[error("Cluster name mismatch: ours is {ours}, message carried {theirs}")]
    ClusterMismatch { ours: String, theirs: String },

    #[error("Partitioner mismatch: ours is {ours}, message carried {theirs}")]
    PartitionerMismatch { ours: String, theirs: String },

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(SocketAddr),

    #[error("Cannot apply administrative operation to the local node {0}")]
    LocalEndpoint(SocketAddr),

    #[error("Malformed status value: {0}")]
    MalformedStatus(String),

    #[error("Shadow round timed out after {0:?}")]
    ShadowRoundTimeout(Duration),

    #[error("Shadow round requires at least one seed")]
    NoSeeds,

    #[error("Gossiper not started")]
    NotStarted,
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn unknown_endpoint(addr: SocketAddr) -> Self {
        Error::Gossip(GossipError::UnknownEndpoint(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let err = Error::unknown_endpoint(addr);
        assert_eq!(err.to_string(), "Gossip error: Unknown endpoint: 127.0.0.1:7000");

        let err = Error::Gossip(GossipError::ClusterMismatch {
            ours: "tempest".to_string(),
            theirs: "other".to_string(),
        });
        assert!(err.to_string().contains("ours is tempest"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_from_gossip() {
        let err: Error = GossipError::NotStarted.into();
        assert!(matches!(err, Error::Gossip(GossipError::NotStarted)));
    }
}
