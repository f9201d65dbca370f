//! Core types for Tempest

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Stable node identity carried in gossip state, distinct from the
/// network address a node currently answers on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostId(pub String);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HostId {
    fn from(s: &str) -> Self {
        HostId(s.to_string())
    }
}

/// Process-wide monotonic version source.
///
/// Heartbeat versions and application-state versions are drawn from the
/// same sequence, so `max_version` comparisons across the two are
/// well-defined.
#[derive(Debug)]
pub struct VersionGenerator(AtomicI64);

impl VersionGenerator {
    pub fn new() -> Self {
        VersionGenerator(AtomicI64::new(0))
    }

    /// Hand out the next version. The first call returns 1.
    pub fn next_version(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Highest version handed out so far.
    pub fn current(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for VersionGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_generator_monotonic() {
        let gen = VersionGenerator::new();
        assert_eq!(gen.current(), 0);

        let a = gen.next_version();
        let b = gen.next_version();
        let c = gen.next_version();
        assert!(a < b && b < c);
        assert_eq!(gen.current(), c);
    }

    #[test]
    fn test_host_id_display() {
        let id = HostId::from("8c904f50-53b0-4974-b4f9-6a3c7fd5b2a1");
        assert_eq!(id.to_string(), "8c904f50-53b0-4974-b4f9-6a3c7fd5b2a1");
    }
}
