//! ---
//! oa_section: "07-resilience-fault-tolerance"
//! oa_subsection: "module"
//! oa_type: "source"
//! oa_scope: "code"
//! oa_description: "Dual-controller discovery, role tracking and failover."
//! oa_version: "v0.0.0-prealpha"
//! oa_owner: "tbd"
//! ---
use anyhow::Result;
use oa_common::SharedRegistry;
use oa_session::OaRole;
use prometheus::{IntCounterVec, IntGaugeVec, Opts};

/// Metrics published by the redundancy core.
#[derive(Clone)]
pub struct RedundancyMetrics {
    registry: SharedRegistry,
    failovers_total: IntCounterVec,
    reconnect_attempts_total: IntCounterVec,
    stuck_transitions_total: IntCounterVec,
    controller_role: IntGaugeVec,
}

impl RedundancyMetrics {
    /// Register the redundancy metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let failovers_total = IntCounterVec::new(
            Opts::new(
                "oa_redundancy_failovers_total",
                "Promotions that moved the authoritative session to another controller",
            ),
            &["bay"],
        )?;
        registry.register(Box::new(failovers_total.clone()))?;

        let reconnect_attempts_total = IntCounterVec::new(
            Opts::new(
                "oa_redundancy_reconnect_attempts_total",
                "Session reconnect attempts made by the controller monitors",
            ),
            &["bay", "outcome"],
        )?;
        registry.register(Box::new(reconnect_attempts_total.clone()))?;

        let stuck_transitions_total = IntCounterVec::new(
            Opts::new(
                "oa_redundancy_stuck_transitions_total",
                "Controllers still in transition after the stabilisation wait",
            ),
            &["bay"],
        )?;
        registry.register(Box::new(stuck_transitions_total.clone()))?;

        let controller_role = IntGaugeVec::new(
            Opts::new(
                "oa_redundancy_controller_role",
                "Known role per bay (0 absent, 1 standby, 2 transition, 3 active)",
            ),
            &["bay"],
        )?;
        registry.register(Box::new(controller_role.clone()))?;

        Ok(Self {
            registry,
            failovers_total,
            reconnect_attempts_total,
            stuck_transitions_total,
            controller_role,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_failover(&self, bay: u8) {
        self.failovers_total
            .with_label_values(&[bay_label(bay)])
            .inc();
    }

    pub fn record_reconnect(&self, bay: u8, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.reconnect_attempts_total
            .with_label_values(&[bay_label(bay), outcome])
            .inc();
    }

    pub fn record_stuck_transition(&self, bay: u8) {
        self.stuck_transitions_total
            .with_label_values(&[bay_label(bay)])
            .inc();
    }

    pub fn set_role(&self, bay: u8, role: OaRole) {
        self.controller_role
            .with_label_values(&[bay_label(bay)])
            .set(role.as_gauge());
    }
}

fn bay_label(bay: u8) -> &'static str {
    match bay {
        1 => "1",
        2 => "2",
        _ => "unknown",
    }
}

impl std::fmt::Debug for RedundancyMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedundancyMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oa_common::{new_registry, render};

    #[test]
    fn counters_show_up_in_exposition() {
        let metrics = RedundancyMetrics::new(new_registry()).unwrap();
        metrics.record_failover(2);
        metrics.record_reconnect(1, false);
        metrics.set_role(2, OaRole::Active);
        let text = render(&metrics.registry()).unwrap();
        assert!(text.contains("oa_redundancy_failovers_total{bay=\"2\"} 1"));
        assert!(text.contains("outcome=\"failure\""));
        assert!(text.contains("oa_redundancy_controller_role{bay=\"2\"} 3"));
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = new_registry();
        RedundancyMetrics::new(registry.clone()).unwrap();
        assert!(RedundancyMetrics::new(registry).is_err());
    }
}
