//! Configuration types for Tempest

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Gossip engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Cluster name; SYNs carrying a different name are dropped
    pub cluster_name: String,

    /// Partitioner name; SYNs carrying a different partitioner are dropped
    pub partitioner: String,

    /// Seed addresses contacted for bootstrap and round fallback
    pub seeds: Vec<SocketAddr>,

    /// Interval between gossip rounds
    #[serde(default = "default_gossip_interval", with = "humantime_serde")]
    pub gossip_interval: Duration,

    /// Interval between failure-detector status sweeps
    #[serde(default = "default_gossip_interval", with = "humantime_serde")]
    pub status_check_interval: Duration,

    /// Upper bound on cluster-wide message propagation; bounds the
    /// ECHO wait when confirming a peer alive
    #[serde(default = "default_ring_delay", with = "humantime_serde")]
    pub ring_delay: Duration,

    /// Window during which gossip about a removed address is ignored
    #[serde(default = "default_quarantine_delay", with = "humantime_serde")]
    pub quarantine_delay: Duration,

    /// Silence after which a token-less gossip participant is evicted
    #[serde(default = "default_fat_client_timeout", with = "humantime_serde")]
    pub fat_client_timeout: Duration,

    /// Maximum total wait for a shadow round before failing bootstrap
    #[serde(default = "default_shadow_round_wait", with = "humantime_serde")]
    pub shadow_round_wait: Duration,

    /// A remote generation more than this far above local knowledge is
    /// treated as corrupt and ignored
    #[serde(default = "default_max_generation_difference")]
    pub max_generation_difference: i32,
}

fn default_gossip_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_ring_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_quarantine_delay() -> Duration {
    // twice the ring delay, so stale re-gossip in flight when a node is
    // removed has died out before the address becomes acceptable again
    Duration::from_secs(60)
}

fn default_fat_client_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_shadow_round_wait() -> Duration {
    Duration::from_secs(300)
}

fn default_max_generation_difference() -> i32 {
    // one year of seconds-resolution generations
    86_400 * 365
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            cluster_name: "Tempest Cluster".to_string(),
            partitioner: "Murmur3Partitioner".to_string(),
            seeds: Vec::new(),
            gossip_interval: default_gossip_interval(),
            status_check_interval: default_gossip_interval(),
            ring_delay: default_ring_delay(),
            quarantine_delay: default_quarantine_delay(),
            fat_client_timeout: default_fat_client_timeout(),
            shadow_round_wait: default_shadow_round_wait(),
            max_generation_difference: default_max_generation_difference(),
        }
    }
}

impl GossipConfig {
    /// Validate the configuration. Fatal problems are collected and
    /// returned together rather than failing on the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.cluster_name.is_empty() {
            errors.push("cluster_name must not be empty".to_string());
        }
        if self.partitioner.is_empty() {
            errors.push("partitioner must not be empty".to_string());
        }
        if self.gossip_interval.is_zero() {
            errors.push("gossip_interval must be positive".to_string());
        }
        if self.status_check_interval.is_zero() {
            errors.push("status_check_interval must be positive".to_string());
        }
        if self.quarantine_delay < self.gossip_interval {
            errors.push(format!(
                "quarantine_delay {:?} is shorter than one gossip round {:?}",
                self.quarantine_delay, self.gossip_interval
            ));
        }
        if self.max_generation_difference <= 0 {
            errors.push("max_generation_difference must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Accrual failure detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetectorConfig {
    /// Bounded sample window per peer
    #[serde(default = "default_sample_window")]
    pub sample_window: usize,

    /// Interval seeded for a peer's first arrival, biasing away from
    /// convicting a freshly seen peer
    #[serde(default = "default_initial_interval", with = "humantime_serde")]
    pub initial_interval: Duration,

    /// Inter-arrival intervals above this are discarded as samples
    #[serde(default = "default_max_interval", with = "humantime_serde")]
    pub max_interval: Duration,

    /// A gap this large between interpret calls is treated as a local
    /// scheduling pause; convictions are suppressed for its duration
    #[serde(default = "default_max_local_pause", with = "humantime_serde")]
    pub max_local_pause: Duration,

    /// Suspicion level above which listeners are convicted
    #[serde(default = "default_phi_convict_threshold")]
    pub phi_convict_threshold: f64,
}

fn default_sample_window() -> usize {
    1000
}

fn default_initial_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_max_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_max_local_pause() -> Duration {
    Duration::from_secs(5)
}

fn default_phi_convict_threshold() -> f64 {
    8.0
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            sample_window: default_sample_window(),
            initial_interval: default_initial_interval(),
            max_interval: default_max_interval(),
            max_local_pause: default_max_local_pause(),
            phi_convict_threshold: default_phi_convict_threshold(),
        }
    }
}

impl FailureDetectorConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.sample_window == 0 {
            errors.push("sample_window must be positive".to_string());
        }
        if self.initial_interval.is_zero() {
            errors.push("initial_interval must be positive".to_string());
        }
        if self.phi_convict_threshold <= 0.0 {
            errors.push("phi_convict_threshold must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gossip_config_defaults_valid() {
        let config = GossipConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gossip_interval, Duration::from_secs(1));
        assert_eq!(config.quarantine_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_gossip_config_collects_errors() {
        let config = GossipConfig {
            cluster_name: String::new(),
            gossip_interval: Duration::ZERO,
            ..Default::default()
        };

        let errors = config.validate().unwrap_err();
        assert!(errors.len() >= 2);
        assert!(errors.iter().any(|e| e.contains("cluster_name")));
    }

    #[test]
    fn test_fd_config_defaults_valid() {
        let config = FailureDetectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sample_window, 1000);
        assert!((config.phi_convict_threshold - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fd_config_rejects_zero_window() {
        let config = FailureDetectorConfig {
            sample_window: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
