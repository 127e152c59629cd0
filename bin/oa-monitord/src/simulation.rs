//! ---
//! oa_section: "01-core-functionality"
//! oa_subsection: "binary"
//! oa_type: "source"
//! oa_scope: "code"
//! oa_description: "Simulated enclosure wiring for the monitor daemon."
//! oa_version: "v0.0.0-prealpha"
//! oa_owner: "tbd"
//! ---
use std::str::FromStr;

use anyhow::{anyhow, Result};
use oa_common::{AppConfig, SimulatedBayConfig};
use oa_session::{OaRole, SimulatedBay, SimulatedEnclosure, UserInfo};

/// Build the in-memory enclosure described by the `[simulation]` section,
/// with the configured account granted full rights on both bays.
pub fn build_enclosure(config: &AppConfig) -> Result<SimulatedEnclosure> {
    let simulation = &config.simulation;
    let bay1 = bay_from_config("bay1", &simulation.bay1)?;
    let bay2 = bay_from_config("bay2", &simulation.bay2)?;
    let account = UserInfo::administrator(
        &config.enclosure.user_name,
        simulation.blade_bays,
        simulation.interconnect_bays,
    );
    Ok(SimulatedEnclosure::new(bay1, bay2).with_user(&config.enclosure.password, account))
}

fn bay_from_config(name: &str, bay: &SimulatedBayConfig) -> Result<SimulatedBay> {
    let role = OaRole::from_str(&bay.role)
        .map_err(|err| anyhow!("simulation.{name}.role: {err}"))?;
    let mut simulated = SimulatedBay::new(bay.address.clone(), role)
        .with_firmware(bay.firmware_version.clone())
        .with_redundancy(bay.redundancy);
    simulated.reachable = bay.reachable;
    Ok(simulated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(extra: &str) -> AppConfig {
        format!(
            r#"
            [enclosure]
            active_oa = "192.168.1.10"
            standby_oa = "192.168.1.11"
            user_name = "admin"
            password = "secret"
            {extra}
            "#
        )
        .parse()
        .unwrap()
    }

    #[test]
    fn default_simulation_has_an_active_and_a_standby_bay() {
        let enclosure = build_enclosure(&config("")).unwrap();
        let bay1 = enclosure.bay(1).unwrap();
        let bay2 = enclosure.bay(2).unwrap();
        assert_eq!(bay1.role, OaRole::Active);
        assert_eq!(bay1.address, "192.168.1.10");
        assert_eq!(bay2.role, OaRole::Standby);
        assert!(bay2.redundancy);
    }

    #[test]
    fn bay_settings_are_carried_over() {
        let enclosure = build_enclosure(&config(
            r#"
            [simulation.bay2]
            address = "192.168.1.11"
            role = "Standby"
            firmware_version = "2.10"
            reachable = false
            "#,
        ))
        .unwrap();
        let bay2 = enclosure.bay(2).unwrap();
        assert_eq!(bay2.firmware_version, "2.10");
        assert!(!bay2.reachable);
    }
}
