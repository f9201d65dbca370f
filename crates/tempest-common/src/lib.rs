//! # Tempest Common
//!
//! Common types, errors, and configuration shared across all Tempest crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::*;
pub use error::{Error, GossipError, Result};
pub use types::*;

/// Re-export commonly used external types
pub mod prelude {
    pub use super::config::*;
    pub use super::error::{Error, GossipError, Result};
    pub use super::types::*;
    pub use async_trait::async_trait;
    pub use tracing::{debug, error, info, instrument, trace, warn};
}
