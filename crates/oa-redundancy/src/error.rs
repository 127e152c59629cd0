//! ---
//! oa_section: "07-resilience-fault-tolerance"
//! oa_subsection: "module"
//! oa_type: "source"
//! oa_scope: "code"
//! oa_description: "Dual-controller discovery, role tracking and failover."
//! oa_version: "v0.0.0-prealpha"
//! oa_owner: "tbd"
//! ---
use oa_session::SessionError;
use thiserror::Error;

use crate::coordinator::DiscoveryStatus;

/// Result alias used throughout the redundancy core.
pub type Result<T> = std::result::Result<T, RedundancyError>;

/// Failures surfaced by discovery, promotion and the coordinator accessors.
#[derive(Debug, Error)]
pub enum RedundancyError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("insufficient rights on {address}: {reason}")]
    Permission { address: String, reason: String },
    #[error("controller at {address} is unreachable: {source}")]
    Unreachable {
        address: String,
        #[source]
        source: SessionError,
    },
    #[error("controller in bay {bay} did not leave the transition state")]
    StuckTransition { bay: u8 },
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("coordinator is not ready (status: {0})")]
    NotInitialized(DiscoveryStatus),
    #[error("coordinator is busy, retry later")]
    Busy,
    #[error("coordinator is shutting down")]
    ShuttingDown,
}

impl RedundancyError {
    pub(crate) fn unreachable(address: &str, source: SessionError) -> Self {
        RedundancyError::Unreachable {
            address: address.to_owned(),
            source,
        }
    }
}
