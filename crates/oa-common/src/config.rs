//! ---
//! oa_section: "01-core-functionality"
//! oa_subsection: "module"
//! oa_type: "source"
//! oa_scope: "code"
//! oa_description: "Daemon configuration: enclosure credentials, timeouts, monitor cadence and simulation."
//! oa_version: "v0.0.0-prealpha"
//! oa_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

const KNOWN_ROLES: [&str; 4] = ["absent", "standby", "transition", "active"];

fn default_hpi_call_timeout() -> Duration {
    Duration::from_secs(40)
}

fn default_event_call_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_absent_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_stabilize_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_switchover_wait() -> Duration {
    Duration::from_secs(10)
}

fn default_switchover_retries() -> u32 {
    10
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_true() -> bool {
    true
}

fn default_firmware() -> String {
    "3.60".to_owned()
}

fn default_blade_bays() -> u8 {
    16
}

fn default_interconnect_bays() -> u8 {
    8
}

/// Primary configuration object for the OA-SOAP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub enclosure: EnclosureConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "OA_SOAP_CONFIG";

    /// Load configuration from disk, respecting the `OA_SOAP_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.enclosure.validate()?;
        self.timeouts.validate()?;
        self.monitor.validate()?;
        self.simulation.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Addresses and credentials of the enclosure's two controllers.
#[derive(Clone, Serialize, Deserialize)]
pub struct EnclosureConfig {
    /// Address tried first during discovery.
    #[serde(default)]
    pub active_oa: String,
    /// Address tried when the first one does not resolve.
    #[serde(default)]
    pub standby_oa: String,
    pub user_name: String,
    pub password: String,
}

impl EnclosureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.user_name.trim().is_empty() {
            return Err(anyhow!("enclosure.user_name must not be empty"));
        }
        if self.password.is_empty() {
            return Err(anyhow!("enclosure.password must not be empty"));
        }
        if self.active_oa.trim().is_empty() && self.standby_oa.trim().is_empty() {
            return Err(anyhow!(
                "at least one of enclosure.active_oa and enclosure.standby_oa must be set"
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for EnclosureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnclosureConfig")
            .field("active_oa", &self.active_oa)
            .field("standby_oa", &self.standby_oa)
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-call timeouts handed to the session provider.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Data-plane calls.
    #[serde(default = "default_hpi_call_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub hpi_call: Duration,
    /// Event-plane calls, which block while waiting for events.
    #[serde(default = "default_event_call_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub event_call: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            hpi_call: default_hpi_call_timeout(),
            event_call: default_event_call_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<()> {
        non_zero("timeouts.hpi_call", self.hpi_call)?;
        non_zero("timeouts.event_call", self.event_call)
    }
}

/// Cadence of the per-controller monitor threads.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default = "default_absent_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub absent_poll_interval: Duration,
    #[serde(default = "default_reconnect_backoff")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reconnect_backoff: Duration,
    /// How long a controller may stay in transition before it counts as stuck.
    #[serde(default = "default_stabilize_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub stabilize_timeout: Duration,
    #[serde(default = "default_switchover_wait")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub switchover_wait: Duration,
    #[serde(default = "default_switchover_retries")]
    pub switchover_retries: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            absent_poll_interval: default_absent_poll_interval(),
            reconnect_backoff: default_reconnect_backoff(),
            stabilize_timeout: default_stabilize_timeout(),
            switchover_wait: default_switchover_wait(),
            switchover_retries: default_switchover_retries(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        non_zero("monitor.poll_interval", self.poll_interval)?;
        non_zero("monitor.absent_poll_interval", self.absent_poll_interval)?;
        non_zero("monitor.reconnect_backoff", self.reconnect_backoff)?;
        non_zero("monitor.stabilize_timeout", self.stabilize_timeout)?;
        non_zero("monitor.switchover_wait", self.switchover_wait)
    }
}

fn non_zero(field: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(anyhow!("{} must be greater than zero", field));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Write the rolling JSON file next to stdout.
    #[serde(default = "default_true")]
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Print the text exposition on shutdown.
    #[serde(default)]
    pub dump_on_exit: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dump_on_exit: false,
        }
    }
}

/// One bay of the in-memory enclosure used in simulation mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedBayConfig {
    #[serde(default)]
    pub address: String,
    pub role: String,
    #[serde(default = "default_true")]
    pub redundancy: bool,
    #[serde(default = "default_firmware")]
    pub firmware_version: String,
    #[serde(default = "default_true")]
    pub reachable: bool,
}

impl SimulatedBayConfig {
    fn new(address: &str, role: &str) -> Self {
        Self {
            address: address.to_owned(),
            role: role.to_owned(),
            redundancy: true,
            firmware_version: default_firmware(),
            reachable: true,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "SimulationConfig::default_bay1")]
    pub bay1: SimulatedBayConfig,
    #[serde(default = "SimulationConfig::default_bay2")]
    pub bay2: SimulatedBayConfig,
    #[serde(default = "default_blade_bays")]
    pub blade_bays: u8,
    #[serde(default = "default_interconnect_bays")]
    pub interconnect_bays: u8,
    /// Swap the Active and Standby bays once this long after discovery.
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub switchover_after: Option<Duration>,
}

impl SimulationConfig {
    fn default_bay1() -> SimulatedBayConfig {
        SimulatedBayConfig::new("192.168.1.10", "active")
    }

    fn default_bay2() -> SimulatedBayConfig {
        SimulatedBayConfig::new("192.168.1.11", "standby")
    }

    pub fn validate(&self) -> Result<()> {
        for (name, bay) in [("bay1", &self.bay1), ("bay2", &self.bay2)] {
            let role = bay.role.to_lowercase();
            if !KNOWN_ROLES.contains(&role.as_str()) {
                return Err(anyhow!(
                    "simulation.{}.role '{}' is not one of {}",
                    name,
                    bay.role,
                    KNOWN_ROLES.join(", ")
                ));
            }
            if role != "absent" && bay.address.trim().is_empty() {
                return Err(anyhow!(
                    "simulation.{} is {} but has no address",
                    name,
                    role
                ));
            }
        }
        Ok(())
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            bay1: Self::default_bay1(),
            bay2: Self::default_bay2(),
            blade_bays: default_blade_bays(),
            interconnect_bays: default_interconnect_bays(),
            switchover_after: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [enclosure]
        active_oa = "10.0.0.1"
        user_name = "admin"
        password = "secret"
    "#;

    #[test]
    fn minimal_config_takes_defaults() {
        let config: AppConfig = MINIMAL.parse().expect("valid config");
        assert_eq!(config.timeouts.hpi_call, Duration::from_secs(40));
        assert_eq!(config.timeouts.event_call, Duration::from_secs(90));
        assert_eq!(config.monitor.absent_poll_interval, Duration::from_secs(30));
        assert_eq!(config.monitor.reconnect_backoff, Duration::from_secs(2));
        assert_eq!(config.monitor.switchover_retries, 10);
        assert_eq!(config.simulation.bay2.role, "standby");
    }

    #[test]
    fn password_is_redacted_in_debug_output() {
        let config: AppConfig = MINIMAL.parse().unwrap();
        let rendered = format!("{:?}", config.enclosure);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("\"10.0.0.1\""));
    }

    #[test]
    fn unknown_simulated_role_is_rejected() {
        let content = format!("{MINIMAL}\n[simulation.bay1]\naddress = \"10.0.0.1\"\nrole = \"primary\"\n");
        let err = content.parse::<AppConfig>().unwrap_err();
        assert!(err.to_string().contains("primary"));
    }
}
