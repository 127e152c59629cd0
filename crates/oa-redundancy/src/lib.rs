//! ---
//! oa_section: "07-resilience-fault-tolerance"
//! oa_subsection: "module"
//! oa_type: "source"
//! oa_scope: "code"
//! oa_description: "Dual-controller discovery, role tracking and failover."
//! oa_version: "v0.0.0-prealpha"
//! oa_owner: "tbd"
//! ---
//! Redundancy core for the two Onboard Administrators of an enclosure.
//!
//! [`RedundancyCoordinator`] discovers which controller is Active, publishes
//! its session as the authoritative one, and runs one monitor thread per
//! controller that follows role changes and reconnects after loss.

mod controller;
mod coordinator;
mod error;
mod metrics;
mod monitor;
mod shutdown;

pub use controller::{parse_firmware_version, usable_address, ControllerSnapshot};
pub use coordinator::{
    DiscoveryStatus, FailoverEvent, FailoverReason, RedundancyCoordinator, RedundancySettings,
};
pub use error::{RedundancyError, Result};
pub use metrics::RedundancyMetrics;
pub use shutdown::{ShutdownReport, ShutdownToken};
