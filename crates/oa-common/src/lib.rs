//! ---
//! oa_section: "01-core-functionality"
//! oa_subsection: "module"
//! oa_type: "source"
//! oa_scope: "code"
//! oa_description: "Configuration loading, tracing setup and the metrics registry shared by the OA crates."
//! oa_version: "v0.0.0-prealpha"
//! oa_owner: "tbd"
//! ---
//! Shared primitives for the OA-SOAP workspace: configuration loading,
//! tracing initialisation and the Prometheus registry handed to every crate
//! that publishes metrics.

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{
    AppConfig, EnclosureConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, MonitorConfig,
    SimulatedBayConfig, SimulationConfig, TimeoutConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use metrics::{new_registry, render, SharedRegistry};
