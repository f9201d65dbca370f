//! Per-endpoint gossip state: heartbeats, versioned values, and the
//! aggregate record kept for every known peer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tempest_common::prelude::*;

use crate::status::NodeStatus;

/// Generation/version pair gossiped for every node.
///
/// The generation changes only when a node process restarts (or is
/// forced by an administrative operation); the version advances on
/// every local heartbeat tick. Once a `(generation, version)` pair has
/// been adopted for a peer, lower pairs are never re-adopted short of a
/// generation increase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartBeatState {
    generation: i32,
    version: i64,
}

impl HeartBeatState {
    pub fn new(generation: i32) -> Self {
        Self { generation, version: 0 }
    }

    pub fn generation(&self) -> i32 {
        self.generation
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Local heartbeat tick: take the next version from the shared
    /// sequence.
    pub fn update_heart_beat(&mut self, gen: &VersionGenerator) {
        self.version = gen.next_version();
    }

    /// Administratively bump the generation so the record supersedes
    /// everything gossiped under the old one.
    pub fn force_newer_generation(&mut self) {
        self.generation += 1;
    }

    /// Pin the version at the maximum so no further update within this
    /// generation can be adopted over it (graceful shutdown).
    pub fn force_highest_possible_version(&mut self) {
        self.version = i64::MAX;
    }
}

/// An opaque string payload tagged with a version from the shared
/// monotonic sequence. Immutable once created; for a given application
/// state key, the higher version wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub version: i64,
    pub value: String,
}

impl VersionedValue {
    pub fn new(gen: &VersionGenerator, value: impl Into<String>) -> Self {
        Self {
            version: gen.next_version(),
            value: value.into(),
        }
    }

    /// Build a value carrying an explicit version. Used when replaying
    /// preloaded states and in tests; normal paths go through `new`.
    pub fn with_version(version: i64, value: impl Into<String>) -> Self {
        Self {
            version,
            value: value.into(),
        }
    }
}

/// The enumerated application-state key space. Wire-coded as an
/// ordinal, so variant order is part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationState {
    Status,
    Tokens,
    Load,
    Schema,
    HostId,
    Dc,
    Rack,
    NetVersion,
    RpcAddress,
    Severity,
    RemovalCoordinator,
    InternalIp,
}

/// Everything a node knows about one peer: its heartbeat, its
/// application states, and local-only liveness bookkeeping.
///
/// Owned exclusively by the gossiper's peer table. The two `serde(skip)`
/// fields are local observations and never travel on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointState {
    heartbeat: HeartBeatState,
    app_states: HashMap<ApplicationState, VersionedValue>,
    #[serde(skip, default = "Instant::now")]
    update_timestamp: Instant,
    #[serde(skip)]
    is_alive: bool,
}

impl EndpointState {
    pub fn new(heartbeat: HeartBeatState) -> Self {
        Self {
            heartbeat,
            app_states: HashMap::new(),
            update_timestamp: Instant::now(),
            is_alive: false,
        }
    }

    pub fn heart_beat_state(&self) -> HeartBeatState {
        self.heartbeat
    }

    pub fn generation(&self) -> i32 {
        self.heartbeat.generation()
    }

    pub(crate) fn heart_beat_state_mut(&mut self) -> &mut HeartBeatState {
        &mut self.heartbeat
    }

    pub(crate) fn set_heart_beat_state(&mut self, hb: HeartBeatState) {
        self.heartbeat = hb;
    }

    pub fn application_state(&self, key: ApplicationState) -> Option<&VersionedValue> {
        self.app_states.get(&key)
    }

    pub fn application_states(&self) -> impl Iterator<Item = (ApplicationState, &VersionedValue)> {
        self.app_states.iter().map(|(k, v)| (*k, v))
    }

    pub(crate) fn add_application_state(&mut self, key: ApplicationState, value: VersionedValue) {
        self.app_states.insert(key, value);
    }

    /// Maximum of the heartbeat version and every application-state
    /// version; this is what digests advertise.
    pub fn max_version(&self) -> i64 {
        let app_max = self.app_states.values().map(|v| v.version).max().unwrap_or(0);
        self.heartbeat.version().max(app_max)
    }

    /// Clone of this state restricted to entries with a version above
    /// `threshold`. `None` when nothing is newer. Used to build the
    /// deltas sent in ACK/ACK2.
    pub fn state_newer_than(&self, threshold: i64) -> Option<EndpointState> {
        if self.max_version() <= threshold {
            return None;
        }
        let mut out = EndpointState::new(self.heartbeat);
        for (k, v) in &self.app_states {
            if v.version > threshold {
                out.app_states.insert(*k, v.clone());
            }
        }
        Some(out)
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive
    }

    pub(crate) fn set_alive(&mut self, alive: bool) {
        self.is_alive = alive;
    }

    pub fn update_timestamp(&self) -> Instant {
        self.update_timestamp
    }

    /// Refresh the local update timestamp. Called only on meaningful
    /// change: new generation, new max version, or an alive transition.
    pub(crate) fn touch(&mut self) {
        self.update_timestamp = Instant::now();
    }

    /// Parsed STATUS value, if present and well-formed.
    pub fn status(&self) -> Option<NodeStatus> {
        self.app_states
            .get(&ApplicationState::Status)
            .and_then(|v| v.value.parse().ok())
    }

    /// True when STATUS classifies this peer as one of the terminal
    /// dead states (left, removing, removed, hibernate).
    pub fn is_dead_state(&self) -> bool {
        self.status().map(|s| s.is_dead_state()).unwrap_or(false)
    }

    /// Expire time carried in a terminal STATUS, if any.
    pub fn expire_time_ms(&self) -> Option<i64> {
        match self.status() {
            Some(NodeStatus::Left { expire_time_ms, .. }) => Some(expire_time_ms),
            Some(NodeStatus::Removed { expire_time_ms, .. }) => Some(expire_time_ms),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_versions_come_from_shared_sequence() {
        let gen = VersionGenerator::new();
        let mut hb = HeartBeatState::new(1);
        assert_eq!(hb.version(), 0);

        hb.update_heart_beat(&gen);
        let v1 = hb.version();
        let value = VersionedValue::new(&gen, "LOAD");
        hb.update_heart_beat(&gen);

        assert!(v1 < value.version);
        assert!(value.version < hb.version());
    }

    #[test]
    fn test_force_newer_generation() {
        let mut hb = HeartBeatState::new(10);
        hb.force_newer_generation();
        assert_eq!(hb.generation(), 11);
    }

    #[test]
    fn test_max_version_covers_app_states() {
        let gen = VersionGenerator::new();
        let mut state = EndpointState::new(HeartBeatState::new(1));
        assert_eq!(state.max_version(), 0);

        state.heart_beat_state_mut().update_heart_beat(&gen);
        assert_eq!(state.max_version(), 1);

        state.add_application_state(
            ApplicationState::Load,
            VersionedValue::with_version(7, "0.25"),
        );
        assert_eq!(state.max_version(), 7);
    }

    #[test]
    fn test_state_newer_than_filters_by_version() {
        let gen = VersionGenerator::new();
        let mut state = EndpointState::new(HeartBeatState::new(1));
        state.heart_beat_state_mut().update_heart_beat(&gen); // version 1
        state.add_application_state(ApplicationState::Load, VersionedValue::new(&gen, "0.5")); // 2
        state.add_application_state(ApplicationState::Rack, VersionedValue::new(&gen, "r1")); // 3

        let delta = state.state_newer_than(2).unwrap();
        assert!(delta.application_state(ApplicationState::Load).is_none());
        assert_eq!(
            delta.application_state(ApplicationState::Rack).unwrap().value,
            "r1"
        );

        assert!(state.state_newer_than(3).is_none());
    }

    #[test]
    fn test_dead_state_classification() {
        let mut state = EndpointState::new(HeartBeatState::new(1));
        assert!(!state.is_dead_state());

        state.add_application_state(
            ApplicationState::Status,
            VersionedValue::with_version(1, "NORMAL,12345"),
        );
        assert!(!state.is_dead_state());

        state.add_application_state(
            ApplicationState::Status,
            VersionedValue::with_version(2, "LEFT,12345,1700000000000"),
        );
        assert!(state.is_dead_state());
        assert_eq!(state.expire_time_ms(), Some(1_700_000_000_000));
    }
}
