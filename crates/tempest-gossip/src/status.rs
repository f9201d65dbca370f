//! Node STATUS as a tagged variant with the comma-delimited wire
//! encoding (`"NORMAL,<token>"`, `"removed,<host-id>,<expire>"`, ...).
//!
//! The comma is reserved: token strings and host ids must never contain
//! one. Internal code works with the variants; only the wire sees the
//! delimited form.

use std::fmt;
use std::str::FromStr;
use tempest_common::prelude::*;

use crate::state::{ApplicationState, VersionedValue};

const STATUS_BOOTSTRAPPING: &str = "BOOT";
const STATUS_NORMAL: &str = "NORMAL";
const STATUS_LEAVING: &str = "LEAVING";
const STATUS_LEFT: &str = "LEFT";
const STATUS_MOVING: &str = "MOVING";
const STATUS_REMOVING: &str = "removing";
const STATUS_REMOVED: &str = "removed";
const STATUS_HIBERNATE: &str = "hibernate";
const STATUS_SHUTDOWN: &str = "shutdown";

pub const DELIMITER: char = ',';

/// Ring-membership status gossiped under `ApplicationState::Status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Bootstrapping { token: String },
    Normal { token: String },
    Leaving { token: String },
    Left { token: String, expire_time_ms: i64 },
    Moving { token: String },
    Removing { host_id: HostId },
    Removed { host_id: HostId, expire_time_ms: i64 },
    Hibernate { ready: bool },
    Shutdown { graceful: bool },
}

impl NodeStatus {
    /// Terminal dead states: peers carrying these are classified dead
    /// regardless of heartbeat activity. Shutdown is deliberately not
    /// here; it is handled by forcing a conviction instead.
    pub fn is_dead_state(&self) -> bool {
        matches!(
            self,
            NodeStatus::Left { .. }
                | NodeStatus::Removing { .. }
                | NodeStatus::Removed { .. }
                | NodeStatus::Hibernate { .. }
        )
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, NodeStatus::Shutdown { .. })
    }

    /// Wrap in a versioned value drawing the next shared version.
    pub fn to_versioned_value(&self, gen: &VersionGenerator) -> VersionedValue {
        VersionedValue::new(gen, self.to_string())
    }

    /// The application-state key this value lives under.
    pub fn key() -> ApplicationState {
        ApplicationState::Status
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Bootstrapping { token } => {
                debug_assert!(!token.contains(DELIMITER));
                write!(f, "{STATUS_BOOTSTRAPPING}{DELIMITER}{token}")
            }
            NodeStatus::Normal { token } => {
                debug_assert!(!token.contains(DELIMITER));
                write!(f, "{STATUS_NORMAL}{DELIMITER}{token}")
            }
            NodeStatus::Leaving { token } => {
                debug_assert!(!token.contains(DELIMITER));
                write!(f, "{STATUS_LEAVING}{DELIMITER}{token}")
            }
            NodeStatus::Left { token, expire_time_ms } => {
                debug_assert!(!token.contains(DELIMITER));
                write!(f, "{STATUS_LEFT}{DELIMITER}{token}{DELIMITER}{expire_time_ms}")
            }
            NodeStatus::Moving { token } => {
                debug_assert!(!token.contains(DELIMITER));
                write!(f, "{STATUS_MOVING}{DELIMITER}{token}")
            }
            NodeStatus::Removing { host_id } => {
                write!(f, "{STATUS_REMOVING}{DELIMITER}{host_id}")
            }
            NodeStatus::Removed { host_id, expire_time_ms } => {
                write!(f, "{STATUS_REMOVED}{DELIMITER}{host_id}{DELIMITER}{expire_time_ms}")
            }
            NodeStatus::Hibernate { ready } => {
                write!(f, "{STATUS_HIBERNATE}{DELIMITER}{ready}")
            }
            NodeStatus::Shutdown { graceful } => {
                write!(f, "{STATUS_SHUTDOWN}{DELIMITER}{graceful}")
            }
        }
    }
}

impl FromStr for NodeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::Gossip(GossipError::MalformedStatus(s.to_string()));
        let mut parts = s.split(DELIMITER);
        let tag = parts.next().ok_or_else(malformed)?;
        let fields: Vec<&str> = parts.collect();

        let one = |fields: &[&str]| -> Result<String> {
            match fields {
                [a] => Ok(a.to_string()),
                _ => Err(malformed()),
            }
        };

        match tag {
            STATUS_BOOTSTRAPPING => Ok(NodeStatus::Bootstrapping { token: one(&fields)? }),
            STATUS_NORMAL => Ok(NodeStatus::Normal { token: one(&fields)? }),
            STATUS_LEAVING => Ok(NodeStatus::Leaving { token: one(&fields)? }),
            STATUS_MOVING => Ok(NodeStatus::Moving { token: one(&fields)? }),
            STATUS_LEFT => match fields.as_slice() {
                [token, expire] => Ok(NodeStatus::Left {
                    token: token.to_string(),
                    expire_time_ms: expire.parse().map_err(|_| malformed())?,
                }),
                _ => Err(malformed()),
            },
            STATUS_REMOVING => Ok(NodeStatus::Removing {
                host_id: HostId(one(&fields)?),
            }),
            STATUS_REMOVED => match fields.as_slice() {
                [host_id, expire] => Ok(NodeStatus::Removed {
                    host_id: HostId(host_id.to_string()),
                    expire_time_ms: expire.parse().map_err(|_| malformed())?,
                }),
                _ => Err(malformed()),
            },
            STATUS_HIBERNATE => Ok(NodeStatus::Hibernate {
                ready: one(&fields)?.parse().map_err(|_| malformed())?,
            }),
            STATUS_SHUTDOWN => Ok(NodeStatus::Shutdown {
                graceful: one(&fields)?.parse().map_err(|_| malformed())?,
            }),
            _ => Err(malformed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trips() {
        let cases = vec![
            NodeStatus::Bootstrapping { token: "123".into() },
            NodeStatus::Normal { token: "-9223372036854775808".into() },
            NodeStatus::Leaving { token: "42".into() },
            NodeStatus::Left { token: "42".into(), expire_time_ms: 1_700_000_000_000 },
            NodeStatus::Moving { token: "7".into() },
            NodeStatus::Removing { host_id: HostId::from("host-a") },
            NodeStatus::Removed { host_id: HostId::from("host-a"), expire_time_ms: 99 },
            NodeStatus::Hibernate { ready: true },
            NodeStatus::Shutdown { graceful: true },
        ];
        for status in cases {
            let wire = status.to_string();
            let parsed: NodeStatus = wire.parse().unwrap();
            assert_eq!(parsed, status, "round trip failed for {wire}");
        }
    }

    #[test]
    fn test_exact_wire_forms() {
        assert_eq!(
            NodeStatus::Normal { token: "123".into() }.to_string(),
            "NORMAL,123"
        );
        assert_eq!(
            NodeStatus::Removed {
                host_id: HostId::from("h1"),
                expire_time_ms: 5
            }
            .to_string(),
            "removed,h1,5"
        );
        assert_eq!(
            NodeStatus::Shutdown { graceful: true }.to_string(),
            "shutdown,true"
        );
    }

    #[test]
    fn test_malformed_rejected() {
        assert!("NORMAL".parse::<NodeStatus>().is_err());
        assert!("LEFT,123".parse::<NodeStatus>().is_err());
        assert!("LEFT,123,notanumber".parse::<NodeStatus>().is_err());
        assert!("BOGUS,1".parse::<NodeStatus>().is_err());
        assert!("hibernate,maybe".parse::<NodeStatus>().is_err());
    }

    #[test]
    fn test_dead_state_set() {
        assert!(NodeStatus::Left { token: "1".into(), expire_time_ms: 0 }.is_dead_state());
        assert!(NodeStatus::Removing { host_id: HostId::from("h") }.is_dead_state());
        assert!(NodeStatus::Removed { host_id: HostId::from("h"), expire_time_ms: 0 }.is_dead_state());
        assert!(NodeStatus::Hibernate { ready: false }.is_dead_state());

        assert!(!NodeStatus::Normal { token: "1".into() }.is_dead_state());
        assert!(!NodeStatus::Bootstrapping { token: "1".into() }.is_dead_state());
        assert!(!NodeStatus::Shutdown { graceful: true }.is_dead_state());
        assert!(NodeStatus::Shutdown { graceful: true }.is_shutdown());
    }
}
