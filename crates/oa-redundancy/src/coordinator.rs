//! ---
//! oa_section: "07-resilience-fault-tolerance"
//! oa_subsection: "module"
//! oa_type: "source"
//! oa_scope: "code"
//! oa_description: "Dual-controller discovery, role tracking and failover."
//! oa_version: "v0.0.0-prealpha"
//! oa_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use oa_common::config::{MonitorConfig, TimeoutConfig};
use oa_common::AppConfig;
use oa_session::{Acl, Credentials, OaRole, Session, SessionError, SessionProvider};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::controller::{
    parse_firmware_version, usable_address, ControllerRecord, ControllerSnapshot, SessionSet,
};
use crate::error::{RedundancyError, Result};
use crate::metrics::RedundancyMetrics;
use crate::monitor::{self, MonitorSignal};
use crate::shutdown::{ShutdownReport, ShutdownToken};

/// Longest wait for a lock during teardown before it is reported as held.
const TEARDOWN_LOCK_WAIT: Duration = Duration::from_millis(500);

/// Timeouts, cadences and credentials used by discovery and the monitors.
#[derive(Debug, Clone)]
pub struct RedundancySettings {
    pub credentials: Credentials,
    pub hpi_call_timeout: Duration,
    pub event_call_timeout: Duration,
    pub poll_interval: Duration,
    pub absent_poll_interval: Duration,
    pub reconnect_backoff: Duration,
    pub stabilize_timeout: Duration,
    pub switchover_wait: Duration,
    pub switchover_retries: u32,
}

impl RedundancySettings {
    /// Settings with the stock timeouts and cadences.
    pub fn new(credentials: Credentials) -> Self {
        Self::from_sections(credentials, &TimeoutConfig::default(), &MonitorConfig::default())
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let credentials = Credentials::new(
            config.enclosure.user_name.clone(),
            config.enclosure.password.clone(),
        );
        Self::from_sections(credentials, &config.timeouts, &config.monitor)
    }

    fn from_sections(
        credentials: Credentials,
        timeouts: &TimeoutConfig,
        monitor: &MonitorConfig,
    ) -> Self {
        Self {
            credentials,
            hpi_call_timeout: timeouts.hpi_call,
            event_call_timeout: timeouts.event_call,
            poll_interval: monitor.poll_interval,
            absent_poll_interval: monitor.absent_poll_interval,
            reconnect_backoff: monitor.reconnect_backoff,
            stabilize_timeout: monitor.stabilize_timeout,
            switchover_wait: monitor.switchover_wait,
            switchover_retries: monitor.switchover_retries,
        }
    }
}

/// Progress of discovery as seen by callers of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryStatus {
    PreDiscovery,
    NotInitialized,
    DiscoveryFailed,
    DiscoveryComplete,
}

impl DiscoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryStatus::PreDiscovery => "pre-discovery",
            DiscoveryStatus::NotInitialized => "not-initialized",
            DiscoveryStatus::DiscoveryFailed => "discovery-failed",
            DiscoveryStatus::DiscoveryComplete => "discovery-complete",
        }
    }
}

impl fmt::Display for DiscoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of the authoritative session moving to a controller.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverEvent {
    pub bay: u8,
    pub address: String,
    /// Bay that held the authoritative session before, if any.
    pub previous_bay: Option<u8>,
    pub triggered_at: DateTime<Utc>,
    pub reason: FailoverReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverReason {
    Discovery,
    Promotion,
    Recovery,
}

#[derive(Debug)]
struct CoordinatorInner {
    status: DiscoveryStatus,
    authoritative_bay: Option<u8>,
    history: Vec<FailoverEvent>,
    promotions: u64,
}

/// What discovery learned about one bay through a controller's session.
#[derive(Debug)]
struct BayReport {
    bay: u8,
    role: OaRole,
    you_are_here: bool,
    firmware_version: f64,
    ip_address: String,
}

/// State shared by the coordinator handle and both monitor threads.
///
/// Lock order: `inner` (the coordinator lock), then a record's `state`, then
/// `authoritative`. `discovery` serialises callers of `discover` and is never
/// taken while holding any of the others.
///
/// `epoch` only moves while `inner` and the promoted record's `state` are
/// held, together with the write to `authoritative`.
pub(crate) struct Shared {
    settings: RedundancySettings,
    provider: Arc<dyn SessionProvider>,
    controllers: [ControllerRecord; 2],
    inner: Mutex<CoordinatorInner>,
    authoritative: RwLock<Option<Session>>,
    epoch: AtomicU64,
    switching: AtomicBool,
    discovery: Mutex<()>,
    shutdown: ShutdownToken,
    signals: OnceCell<[Sender<MonitorSignal>; 2]>,
    metrics: Option<RedundancyMetrics>,
    report: Mutex<Option<ShutdownReport>>,
}

impl Shared {
    pub(crate) fn settings(&self) -> &RedundancySettings {
        &self.settings
    }

    pub(crate) fn token(&self) -> &ShutdownToken {
        &self.shutdown
    }

    pub(crate) fn metrics(&self) -> Option<&RedundancyMetrics> {
        self.metrics.as_ref()
    }

    pub(crate) fn record(&self, bay: u8) -> Result<&ControllerRecord> {
        match bay {
            1 | 2 => Ok(&self.controllers[usize::from(bay - 1)]),
            _ => Err(RedundancyError::Config(format!(
                "bay {bay} does not exist; expected 1 or 2"
            ))),
        }
    }

    /// Record of a bay already known to be 1 or 2.
    pub(crate) fn slot(&self, bay: u8) -> &ControllerRecord {
        &self.controllers[(usize::from(bay) + 1) % 2]
    }

    fn partner(&self, bay: u8) -> &ControllerRecord {
        &self.controllers[usize::from(bay % 2)]
    }

    pub(crate) fn checkpoint(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(RedundancyError::ShuttingDown);
        }
        Ok(())
    }

    pub(crate) fn observe_role(&self, bay: u8, role: OaRole) {
        if let Some(metrics) = &self.metrics {
            metrics.set_role(bay, role);
        }
    }

    fn status(&self) -> DiscoveryStatus {
        self.inner.lock().status
    }

    pub(crate) fn authoritative(&self) -> Option<Session> {
        self.authoritative.read().clone()
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Point `authoritative` at `session`. Caller holds `inner` and the
    /// owning record's `state`.
    fn install_authoritative(&self, session: &Session) {
        *self.authoritative.write() = Some(session.clone());
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn active_firmware_version(&self) -> f64 {
        self.controllers
            .iter()
            .map(|record| {
                let state = record.state.lock();
                (state.role, state.firmware_version)
            })
            .find(|(role, _)| *role == OaRole::Active)
            .map(|(_, firmware)| firmware)
            .unwrap_or(0.0)
    }

    /// Active record that holds a data session.
    fn active_session(&self) -> Option<(u8, Session)> {
        self.controllers.iter().find_map(|record| {
            let state = record.state.lock();
            if state.role != OaRole::Active {
                return None;
            }
            state
                .data_session
                .clone()
                .map(|session| (record.bay(), session))
        })
    }

    fn reset_records(&self) {
        for record in &self.controllers {
            record.state.lock().reset();
            self.observe_role(record.bay(), OaRole::Absent);
        }
    }

    fn signal(&self, bay: u8, signal: MonitorSignal) -> bool {
        self.signals
            .get()
            .map(|senders| senders[usize::from(bay - 1)].send(signal).is_ok())
            .unwrap_or(false)
    }

    fn open_pair(&self, address: &str) -> Result<(Session, Session)> {
        let settings = &self.settings;
        let data = self
            .provider
            .open(address, &settings.credentials, settings.hpi_call_timeout)
            .map_err(|source| RedundancyError::unreachable(address, source))?;
        match self
            .provider
            .open(address, &settings.credentials, settings.event_call_timeout)
        {
            Ok(event) => Ok((data, event)),
            Err(source) => {
                data.close();
                Err(RedundancyError::unreachable(address, source))
            }
        }
    }

    /// Open the auxiliary event session and subscribe for events on `event`.
    pub(crate) fn subscribe(&self, address: &str, event: &Session) -> Result<(Session, u32)> {
        let settings = &self.settings;
        let aux = self
            .provider
            .open(address, &settings.credentials, settings.event_call_timeout)
            .map_err(|source| RedundancyError::unreachable(address, source))?;
        match event.subscribe_for_events() {
            Ok(pid) => Ok((aux, pid)),
            Err(source) => {
                aux.close();
                Err(RedundancyError::unreachable(address, source))
            }
        }
    }

    /// Data, event and auxiliary event sessions plus an event subscription.
    pub(crate) fn open_session_set(&self, address: &str) -> Result<SessionSet> {
        let (data, event) = self.open_pair(address)?;
        match self.subscribe(address, &event) {
            Ok((aux, pid)) => Ok(SessionSet {
                data,
                event,
                aux_event: aux,
                event_pid: pid,
            }),
            Err(err) => {
                data.close();
                event.close();
                Err(err)
            }
        }
    }

    fn check_permissions(&self, address: &str, data: &Session) -> Result<()> {
        let user_name = &self.settings.credentials.user_name;
        let info = data.get_user_info(user_name).map_err(|source| match source {
            SessionError::Fault { message, .. } => RedundancyError::Permission {
                address: address.to_owned(),
                reason: format!("user lookup for {user_name} rejected: {message}"),
            },
            other => RedundancyError::unreachable(address, other),
        })?;

        let denied = |reason: String| RedundancyError::Permission {
            address: address.to_owned(),
            reason,
        };
        if !info.enabled {
            return Err(denied(format!("user {user_name} is disabled")));
        }
        if info.acl != Acl::Administrator {
            return Err(denied(format!("user {user_name} is not an administrator")));
        }
        let permissions = &info.permissions;
        if !permissions.oa_access {
            return Err(denied("no access to the onboard administrator bays".to_owned()));
        }
        if let Some(bay) = permissions.blade_bays.iter().find(|bay| !bay.access) {
            return Err(denied(format!("no access to server blade bay {}", bay.bay)));
        }
        if let Some(bay) = permissions.interconnect_bays.iter().find(|bay| !bay.access) {
            return Err(denied(format!("no access to interconnect bay {}", bay.bay)));
        }
        Ok(())
    }

    /// Role of `bay` as discovery sees it, `None` when the bay is skipped.
    fn discovery_role(&self, address: &str, data: &Session, bay: u8) -> Result<Option<OaRole>> {
        let query = || {
            data.get_oa_status(bay)
                .map_err(|source| RedundancyError::unreachable(address, source))
        };
        let mut status = query()?;
        if status.role == OaRole::Transition {
            debug!(bay, address, "controller in transition; waiting for it to settle");
            if self.shutdown.wait_timeout(self.settings.stabilize_timeout) {
                return Err(RedundancyError::ShuttingDown);
            }
            status = query()?;
            if status.role == OaRole::Transition {
                if let Some(metrics) = &self.metrics {
                    metrics.record_stuck_transition(bay);
                }
                return Err(RedundancyError::StuckTransition { bay });
            }
        }
        match status.role {
            OaRole::Absent => Ok(None),
            OaRole::Standby if !status.redundancy => {
                // Firmware reports this both for a lone standby and for a
                // partner that is still booting; both are skipped.
                debug!(bay, address, "standby controller without redundancy treated as absent");
                Ok(None)
            }
            role => Ok(Some(role)),
        }
    }

    fn survey(&self, address: &str, data: &Session) -> Result<Vec<BayReport>> {
        let mut reports = Vec::with_capacity(2);
        for bay in 1..=2u8 {
            self.checkpoint()?;
            let Some(role) = self.discovery_role(address, data, bay)? else {
                continue;
            };
            let info = data
                .get_oa_info(bay)
                .map_err(|source| RedundancyError::unreachable(address, source))?;
            let network = data
                .get_oa_network_info(bay)
                .map_err(|source| RedundancyError::unreachable(address, source))?;
            reports.push(BayReport {
                bay,
                role,
                you_are_here: info.you_are_here,
                firmware_version: parse_firmware_version(&info.firmware_version),
                ip_address: network.ip_address,
            });
        }
        Ok(reports)
    }

    /// Resolve both records through the controller at `address`.
    ///
    /// Only runs while no monitor exists, so the records' sessions are owned
    /// by the caller.
    fn resolve_bay(&self, address: &str) -> Result<()> {
        if address.trim().is_empty() {
            return Err(RedundancyError::Config("controller address is empty".to_owned()));
        }
        let (data, event) = self.open_pair(address)?;
        let reports = match self
            .check_permissions(address, &data)
            .and_then(|()| self.survey(address, &data))
        {
            Ok(reports) => reports,
            Err(err) => {
                data.close();
                event.close();
                return Err(err);
            }
        };
        let Some(here) = reports.iter().find(|report| report.you_are_here) else {
            data.close();
            event.close();
            return Err(RedundancyError::Discovery(format!(
                "controller at {address} did not identify its own bay"
            )));
        };
        let other = reports.iter().find(|report| report.bay != here.bay);
        let this_record = &self.controllers[usize::from(here.bay - 1)];
        let other_record = self.partner(here.bay);

        {
            let mut state = this_record.state.lock();
            state.reset();
            state.role = here.role;
            state.address = address.to_owned();
            state.firmware_version = here.firmware_version;
            state.data_session = Some(data);
            state.event_session = Some(event);
        }
        {
            let mut state = other_record.state.lock();
            state.reset();
            if let Some(other) = other {
                state.role = other.role;
                state.firmware_version = other.firmware_version;
                if usable_address(&other.ip_address) {
                    state.address = other.ip_address.clone();
                }
            }
        }
        self.observe_role(here.bay, here.role);
        self.observe_role(other_record.bay(), other.map_or(OaRole::Absent, |o| o.role));
        info!(
            bay = here.bay,
            address,
            role = %here.role,
            firmware = here.firmware_version,
            partner_role = %other.map_or(OaRole::Absent, |o| o.role),
            "controller resolved"
        );

        let partner = other.filter(|other| {
            matches!(
                (here.role, other.role),
                (OaRole::Active, OaRole::Standby) | (OaRole::Standby, OaRole::Active)
            )
        });
        let Some(partner) = partner else {
            return Ok(());
        };
        let opened = if usable_address(&partner.ip_address) {
            self.open_pair(&partner.ip_address)
        } else {
            Err(RedundancyError::unreachable(
                &partner.ip_address,
                SessionError::Transport {
                    address: partner.ip_address.clone(),
                    reason: "controller reported an unusable address".to_owned(),
                },
            ))
        };
        match opened {
            Ok((data, event)) => {
                let mut state = other_record.state.lock();
                state.data_session = Some(data);
                state.event_session = Some(event);
            }
            Err(err) if partner.role == OaRole::Active => {
                error!(bay = partner.bay, address = %partner.ip_address, error = %err, "active controller unreachable");
                this_record.state.lock().reset();
                other_record.state.lock().reset();
                return Err(err);
            }
            Err(err) => {
                warn!(bay = partner.bay, address = %partner.ip_address, error = %err, "standby controller unreachable; its monitor will reconnect");
            }
        }
        Ok(())
    }

    fn resolve_all(&self, preferred: &str, secondary: &str) -> Result<(u8, Session)> {
        if preferred.trim().is_empty() && secondary.trim().is_empty() {
            return Err(RedundancyError::Config(
                "no controller address configured".to_owned(),
            ));
        }
        let mut causes = Vec::new();
        for address in [preferred, secondary] {
            self.checkpoint()?;
            match self.resolve_bay(address) {
                Ok(()) => {
                    if let Some(found) = self.active_session() {
                        return Ok(found);
                    }
                    warn!(address, "controller resolved but no active controller was identified");
                    causes.push(format!("{address}: no active controller identified"));
                    self.reset_records();
                }
                Err(RedundancyError::ShuttingDown) => return Err(RedundancyError::ShuttingDown),
                Err(err) => {
                    warn!(address, error = %err, "controller resolution failed");
                    let label = if address.trim().is_empty() { "<empty>" } else { address };
                    causes.push(format!("{label}: {err}"));
                }
            }
        }
        Err(RedundancyError::Discovery(causes.join("; ")))
    }

    fn query_role(&self, bay: u8, session: &Session) -> Result<OaRole> {
        session
            .get_oa_status(bay)
            .map(|status| status.role)
            .map_err(|source| RedundancyError::unreachable(session.address(), source))
    }

    /// Query the role of `bay` through `session` and commit it.
    ///
    /// The query runs without any lock held. The commit only applies while
    /// `session` is still the record's data session and no failover has
    /// moved the authoritative session since the query started.
    pub(crate) fn check_and_promote(
        &self,
        bay: u8,
        session: &Session,
        reason: FailoverReason,
    ) -> Result<OaRole> {
        let record = self.record(bay)?;
        self.checkpoint()?;
        let seen = self.epoch();
        let mut role = self.query_role(bay, session)?;
        if role == OaRole::Transition {
            debug!(bay, "controller in transition; waiting for it to settle");
            if self.shutdown.wait_timeout(self.settings.stabilize_timeout) {
                return Err(RedundancyError::ShuttingDown);
            }
            role = self.query_role(bay, session)?;
            if role == OaRole::Transition {
                if let Some(metrics) = &self.metrics {
                    metrics.record_stuck_transition(bay);
                }
                return Err(RedundancyError::StuckTransition { bay });
            }
        }
        self.checkpoint()?;

        if role == OaRole::Active {
            self.promote(record, session, reason, seen);
            return Ok(role);
        }
        let mut state = record.state.lock();
        if !state.owns(session) {
            debug!(bay, %role, "dropping stale role observation");
            return Ok(role);
        }
        let holds_authoritative = self.authoritative.read().as_ref() == Some(session);
        if holds_authoritative && self.epoch() != seen {
            debug!(bay, %role, "dropping role observation older than the last failover");
            return Ok(role);
        }
        if state.role != role {
            info!(bay, from = %state.role, to = %role, "controller role changed");
            state.role = role;
            drop(state);
            self.observe_role(bay, role);
            if holds_authoritative {
                // The partner's monitor takes over the authoritative session.
                let partner_bay = self.partner(bay).bay();
                info!(bay, partner_bay, "authoritative controller left the active role");
                self.signal(partner_bay, MonitorSignal::Events);
            }
        }
        Ok(role)
    }

    /// Make `session` authoritative for `record`. `seen` is the epoch read
    /// before the role query that observed the controller as Active.
    fn promote(
        &self,
        record: &ControllerRecord,
        session: &Session,
        reason: FailoverReason,
        seen: u64,
    ) {
        let bay = record.bay();
        let mut inner = self.inner.lock();
        let swapped = {
            let mut state = record.state.lock();
            if !state.owns(session) {
                debug!(bay, "dropping stale promotion");
                return;
            }
            let already_authoritative = self.authoritative.read().as_ref() == Some(session);
            if !already_authoritative && self.epoch() != seen {
                debug!(bay, "dropping promotion observed before the last failover");
                return;
            }
            if state.role == OaRole::Active && already_authoritative {
                return;
            }
            state.role = OaRole::Active;
            if !already_authoritative {
                self.switching.store(true, Ordering::Release);
                self.install_authoritative(session);
            }
            !already_authoritative
        };

        let partner_bay = self.partner(bay).bay();
        let demoted = {
            let mut partner = self.partner(bay).state.lock();
            let demote = partner.role == OaRole::Active;
            if demote {
                partner.role = OaRole::Standby;
            }
            demote
        };
        self.observe_role(bay, OaRole::Active);
        if demoted {
            info!(bay = partner_bay, "partner controller demoted to standby");
            self.observe_role(partner_bay, OaRole::Standby);
        }
        if !swapped {
            return;
        }

        let previous_bay = inner.authoritative_bay.replace(bay);
        inner.promotions += 1;
        let event = FailoverEvent {
            bay,
            address: session.address().to_owned(),
            previous_bay,
            triggered_at: Utc::now(),
            reason,
        };
        info!(bay, address = %event.address, ?previous_bay, ?reason, "controller promoted; authoritative session switched");
        if let Some(metrics) = &self.metrics {
            metrics.record_failover(bay);
        }
        inner.history.push(event);
        self.switching.store(false, Ordering::Release);
    }

    /// Refresh role, address and firmware of a disconnected record through
    /// the authoritative session.
    pub(crate) fn refresh_from_authoritative(&self, bay: u8) -> Result<()> {
        let record = self.record(bay)?;
        let Some(session) = self.authoritative() else {
            return Err(RedundancyError::NotInitialized(self.status()));
        };
        let unreachable = |source| RedundancyError::unreachable(session.address(), source);
        let mut status = session.get_oa_status(bay).map_err(unreachable)?;
        if status.role == OaRole::Standby && !status.redundancy {
            debug!(bay, "standby controller without redundancy treated as absent");
            status.role = OaRole::Absent;
        }
        let (address, firmware) = if status.role == OaRole::Absent {
            (String::new(), 0.0)
        } else {
            let network = session.get_oa_network_info(bay).map_err(unreachable)?;
            let info = session.get_oa_info(bay).map_err(unreachable)?;
            (network.ip_address, parse_firmware_version(&info.firmware_version))
        };

        let mut state = record.state.lock();
        if state.is_connected() {
            return Ok(());
        }
        if state.role != status.role || state.address != address {
            debug!(bay, role = %status.role, address = %address, "controller details refreshed");
        }
        state.role = status.role;
        state.address = if usable_address(&address) { address } else { String::new() };
        state.firmware_version = firmware;
        drop(state);
        self.observe_role(bay, status.role);
        Ok(())
    }

    fn shutdown(&self) -> ShutdownReport {
        let mut cached = self.report.lock();
        if let Some(report) = cached.as_ref() {
            return report.clone();
        }
        self.shutdown.cancel();
        info!("redundancy coordinator shutting down");

        // An in-flight discover finishes before the monitor set is final.
        drop(self.discovery.lock());
        if let Some(senders) = self.signals.get() {
            for sender in senders {
                let _ = sender.send(MonitorSignal::Shutdown);
            }
        }

        let mut report = ShutdownReport::default();
        for record in &self.controllers {
            let Some(mut slot) = record.monitor.try_lock_for(TEARDOWN_LOCK_WAIT) else {
                error!(bay = record.bay(), "monitor handle lock unavailable; thread not joined");
                continue;
            };
            let handle = slot.take();
            drop(slot);
            let Some(handle) = handle else {
                continue;
            };
            match handle.join() {
                Ok(()) => report.joined.push(record.bay()),
                Err(_) => {
                    error!(bay = record.bay(), "monitor thread panicked");
                    report.panicked.push(record.bay());
                }
            }
        }

        for record in &self.controllers {
            match record.state.try_lock_for(TEARDOWN_LOCK_WAIT) {
                Some(mut state) => report.sessions_closed += state.close_sessions(),
                None => error!(bay = record.bay(), "controller lock unavailable; sessions left open"),
            }
        }
        match self.inner.try_lock_for(TEARDOWN_LOCK_WAIT) {
            Some(mut inner) => {
                inner.authoritative_bay = None;
                match self.authoritative.try_write_for(TEARDOWN_LOCK_WAIT) {
                    Some(mut authoritative) => *authoritative = None,
                    None => error!("authoritative session lock unavailable"),
                }
            }
            None => error!("coordinator lock unavailable; authoritative session left set"),
        }

        let mut defects = Vec::new();
        if self.inner.try_lock().is_none() {
            defects.push("coordinator lock".to_owned());
        }
        if self.discovery.try_lock().is_none() {
            defects.push("discovery lock".to_owned());
        }
        if self.authoritative.try_write().is_none() {
            defects.push("authoritative session lock".to_owned());
        }
        for record in &self.controllers {
            if record.state.try_lock().is_none() {
                defects.push(format!("controller bay {} lock", record.bay()));
            }
            if record.monitor.try_lock().is_none() {
                defects.push(format!("monitor handle bay {} lock", record.bay()));
            }
        }
        for defect in &defects {
            error!(lock = %defect, "lock still held after shutdown");
        }
        report.lock_defects = defects;

        info!(
            joined = ?report.joined,
            sessions_closed = report.sessions_closed,
            clean = report.is_clean(),
            "redundancy coordinator stopped"
        );
        *cached = Some(report.clone());
        report
    }
}

/// Owner of the two controller records and the authoritative session.
///
/// Dropping the coordinator runs [`RedundancyCoordinator::shutdown`].
pub struct RedundancyCoordinator {
    shared: Arc<Shared>,
}

impl RedundancyCoordinator {
    pub fn new(provider: Arc<dyn SessionProvider>, settings: RedundancySettings) -> Self {
        Self::build(provider, settings, None)
    }

    pub fn with_metrics(
        provider: Arc<dyn SessionProvider>,
        settings: RedundancySettings,
        metrics: RedundancyMetrics,
    ) -> Self {
        Self::build(provider, settings, Some(metrics))
    }

    fn build(
        provider: Arc<dyn SessionProvider>,
        settings: RedundancySettings,
        metrics: Option<RedundancyMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                provider,
                controllers: [ControllerRecord::new(1), ControllerRecord::new(2)],
                inner: Mutex::new(CoordinatorInner {
                    status: DiscoveryStatus::PreDiscovery,
                    authoritative_bay: None,
                    history: Vec::new(),
                    promotions: 0,
                }),
                authoritative: RwLock::new(None),
                epoch: AtomicU64::new(0),
                switching: AtomicBool::new(false),
                discovery: Mutex::new(()),
                shutdown: ShutdownToken::new(),
                signals: OnceCell::new(),
                metrics,
                report: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &RedundancySettings {
        &self.shared.settings
    }

    /// Find the Active controller, starting with `preferred`.
    ///
    /// Depending on [`DiscoveryStatus`] this runs a full resolution, a
    /// recovery check of the existing sessions, or nothing at all. The first
    /// successful run starts one monitor thread per bay.
    pub fn discover(&self, preferred: &str, secondary: &str) -> Result<()> {
        let _serial = self.shared.discovery.lock();
        self.shared.checkpoint()?;
        match self.shared.status() {
            DiscoveryStatus::DiscoveryComplete => Ok(()),
            DiscoveryStatus::DiscoveryFailed => self.recover(),
            DiscoveryStatus::PreDiscovery | DiscoveryStatus::NotInitialized => {
                self.initial_discovery(preferred, secondary)
            }
        }
    }

    fn initial_discovery(&self, preferred: &str, secondary: &str) -> Result<()> {
        let shared = &self.shared;
        let (bay, session) = match shared.resolve_all(preferred, secondary) {
            Ok(found) => found,
            Err(err) => {
                if !matches!(err, RedundancyError::ShuttingDown) {
                    shared.inner.lock().status = DiscoveryStatus::NotInitialized;
                    error!(preferred, secondary, error = %err, "discovery failed");
                }
                return Err(err);
            }
        };

        {
            let mut inner = shared.inner.lock();
            let record = &shared.controllers[usize::from(bay - 1)];
            let _state = record.state.lock();
            shared.install_authoritative(&session);
            inner.authoritative_bay = Some(bay);
            inner.status = DiscoveryStatus::DiscoveryComplete;
            inner.history.push(FailoverEvent {
                bay,
                address: session.address().to_owned(),
                previous_bay: None,
                triggered_at: Utc::now(),
                reason: FailoverReason::Discovery,
            });
        }
        info!(bay, address = session.address(), "discovery complete");
        self.spawn_monitors()
    }

    fn recover(&self) -> Result<()> {
        let shared = &self.shared;
        info!("running discovery recovery check");
        let mut confirmed = None;
        for record in &shared.controllers {
            let Some(session) = record.data_session() else {
                continue;
            };
            match shared.check_and_promote(record.bay(), &session, FailoverReason::Recovery) {
                Ok(OaRole::Active) => confirmed = Some((record.bay(), session)),
                Ok(role) => debug!(bay = record.bay(), %role, "recovery role check"),
                Err(RedundancyError::ShuttingDown) => return Err(RedundancyError::ShuttingDown),
                Err(err) => warn!(bay = record.bay(), error = %err, "recovery role check failed"),
            }
        }

        let authoritative = shared.authoritative();
        let recovered =
            confirmed.filter(|(_, session)| authoritative.as_ref() == Some(session));
        let mut inner = shared.inner.lock();
        match recovered {
            Some((bay, _)) => {
                inner.status = DiscoveryStatus::DiscoveryComplete;
                info!(bay, "discovery recovered");
                Ok(())
            }
            None => {
                warn!("no active controller with an open session; discovery still failed");
                Err(RedundancyError::Discovery(
                    "no active controller with an open session".to_owned(),
                ))
            }
        }
    }

    fn spawn_monitors(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.signals.get().is_some() || shared.shutdown.is_cancelled() {
            return Ok(());
        }
        let (tx1, rx1) = mpsc::channel();
        let (tx2, rx2) = mpsc::channel();
        if shared.signals.set([tx1, tx2]).is_err() {
            return Ok(());
        }
        for (record, signals) in shared.controllers.iter().zip([rx1, rx2]) {
            let handle = monitor::spawn(Arc::clone(shared), record.bay(), signals).map_err(|err| {
                RedundancyError::Discovery(format!(
                    "failed to start monitor for bay {}: {err}",
                    record.bay()
                ))
            })?;
            *record.monitor.lock() = Some(handle);
        }
        Ok(())
    }

    /// Move `DiscoveryComplete` to `DiscoveryFailed`, so the next
    /// [`discover`](Self::discover) runs a recovery check.
    pub fn mark_discovery_failed(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.status == DiscoveryStatus::DiscoveryComplete {
            inner.status = DiscoveryStatus::DiscoveryFailed;
            warn!("discovery marked as failed");
        }
    }

    /// Check the role of `bay` through `session` and promote it when Active.
    pub fn check_and_promote(&self, bay: u8, session: &Session) -> Result<OaRole> {
        self.shared
            .check_and_promote(bay, session, FailoverReason::Promotion)
    }

    /// Session to use for management calls. May be stale across a failover.
    pub fn authoritative(&self) -> Option<Session> {
        self.shared.authoritative()
    }

    /// Authoritative session for an outbound call, failing fast when the
    /// coordinator is not ready, or is busy discovering or switching
    /// controllers.
    pub fn session_for_call(&self) -> Result<Session> {
        let shared = &self.shared;
        shared.checkpoint()?;
        if shared.discovery.is_locked() || shared.switching.load(Ordering::Acquire) {
            return Err(RedundancyError::Busy);
        }
        let status = shared.status();
        if status != DiscoveryStatus::DiscoveryComplete {
            return Err(RedundancyError::NotInitialized(status));
        }
        shared
            .authoritative()
            .ok_or(RedundancyError::NotInitialized(status))
    }

    pub fn status(&self) -> DiscoveryStatus {
        self.shared.status()
    }

    pub fn controller(&self, bay: u8) -> Option<ControllerSnapshot> {
        self.shared.record(bay).ok().map(ControllerRecord::snapshot)
    }

    pub fn controllers(&self) -> Vec<ControllerSnapshot> {
        self.shared
            .controllers
            .iter()
            .map(ControllerRecord::snapshot)
            .collect()
    }

    pub fn active_bay(&self) -> Option<u8> {
        self.controllers()
            .into_iter()
            .find(|snapshot| snapshot.role == OaRole::Active)
            .map(|snapshot| snapshot.bay)
    }

    /// Firmware of the Active controller, `0.0` when none is known.
    pub fn active_firmware_version(&self) -> f64 {
        self.shared.active_firmware_version()
    }

    pub fn failover_history(&self) -> Vec<FailoverEvent> {
        self.shared.inner.lock().history.clone()
    }

    /// Promotions that moved the authoritative session, discovery excluded.
    pub fn promotion_count(&self) -> u64 {
        self.shared.inner.lock().promotions
    }

    /// Events are pending for `bay`; its monitor checks the role right away.
    pub fn notify_events(&self, bay: u8) -> Result<()> {
        self.shared.record(bay)?;
        if !self.shared.signal(bay, MonitorSignal::Events) {
            debug!(bay, "event notification without a running monitor");
        }
        Ok(())
    }

    /// A controller was inserted into `bay`.
    pub fn controller_inserted(&self, bay: u8) -> Result<()> {
        self.shared.checkpoint()?;
        self.shared.refresh_from_authoritative(bay)?;
        info!(bay, "controller inserted");
        self.shared.signal(bay, MonitorSignal::Inserted);
        Ok(())
    }

    /// The controller in `bay` was extracted; its sessions are dropped.
    pub fn controller_extracted(&self, bay: u8) -> Result<()> {
        let record = self.shared.record(bay)?;
        info!(bay, "controller extracted");
        if self.shared.signal(bay, MonitorSignal::Extracted) {
            return Ok(());
        }
        let _serial = self.shared.discovery.lock();
        record.state.lock().reset();
        self.shared.observe_role(bay, OaRole::Absent);
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Stop both monitors, close every session and verify that no lock is
    /// left held. Later calls return the first report.
    pub fn shutdown(&self) -> ShutdownReport {
        self.shared.shutdown()
    }
}

impl Drop for RedundancyCoordinator {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl fmt::Debug for RedundancyCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedundancyCoordinator")
            .field("status", &self.status())
            .field("authoritative", &self.authoritative())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oa_session::{SimulatedBay, SimulatedEnclosure, UserInfo};

    fn enclosure() -> SimulatedEnclosure {
        SimulatedEnclosure::new(
            SimulatedBay::new("10.0.0.1", OaRole::Active),
            SimulatedBay::new("10.0.0.2", OaRole::Standby),
        )
        .with_user("secret", UserInfo::administrator("admin", 16, 8))
    }

    fn settings() -> RedundancySettings {
        RedundancySettings {
            poll_interval: Duration::from_millis(20),
            absent_poll_interval: Duration::from_millis(20),
            reconnect_backoff: Duration::from_millis(10),
            stabilize_timeout: Duration::from_millis(20),
            switchover_wait: Duration::from_millis(10),
            switchover_retries: 2,
            ..RedundancySettings::new(Credentials::new("admin", "secret"))
        }
    }

    #[test]
    fn session_for_call_is_busy_only_while_discovering_or_switching() {
        let coordinator = RedundancyCoordinator::new(Arc::new(enclosure()), settings());
        coordinator.discover("10.0.0.1", "10.0.0.2").unwrap();
        assert!(coordinator.session_for_call().is_ok());

        let serial = coordinator.shared.discovery.lock();
        assert!(matches!(
            coordinator.session_for_call(),
            Err(RedundancyError::Busy)
        ));
        drop(serial);

        coordinator.shared.switching.store(true, Ordering::Release);
        assert!(matches!(
            coordinator.session_for_call(),
            Err(RedundancyError::Busy)
        ));
        coordinator.shared.switching.store(false, Ordering::Release);

        // A reader holding the coordinator lock only delays the call.
        let shared = Arc::clone(&coordinator.shared);
        let (held_tx, held_rx) = mpsc::channel();
        let reader = std::thread::spawn(move || {
            let inner = shared.inner.lock();
            held_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            drop(inner);
        });
        held_rx.recv().unwrap();
        let session = coordinator.session_for_call().unwrap();
        assert_eq!(Some(session), coordinator.authoritative());
        reader.join().unwrap();
        assert!(coordinator.shutdown().is_clean());
    }

    #[test]
    fn promotion_observed_before_a_failover_is_dropped() {
        let enclosure = enclosure();
        let coordinator = RedundancyCoordinator::new(Arc::new(enclosure.clone()), settings());
        coordinator.discover("10.0.0.1", "10.0.0.2").unwrap();
        let shared = Arc::clone(&coordinator.shared);
        let old = shared.slot(1).data_session().unwrap();
        let before_failover = shared.epoch();

        enclosure.switch_over();
        let new = shared.slot(2).data_session().unwrap();
        assert_eq!(coordinator.check_and_promote(2, &new).unwrap(), OaRole::Active);
        assert_eq!(coordinator.authoritative(), Some(new.clone()));

        // Bay 1 answered Active before bay 2 took over.
        shared.promote(shared.slot(1), &old, FailoverReason::Promotion, before_failover);

        assert_eq!(coordinator.authoritative(), Some(new));
        assert_eq!(coordinator.active_bay(), Some(2));
        assert_eq!(coordinator.controller(1).unwrap().role, OaRole::Standby);
        let history = coordinator.failover_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].bay, 2);
        assert_eq!(coordinator.promotion_count(), 1);
        assert!(coordinator.shutdown().is_clean());
    }

    #[test]
    fn lock_defects_are_reported_not_masked() {
        let coordinator = RedundancyCoordinator::new(Arc::new(enclosure()), settings());
        let shared = Arc::clone(&coordinator.shared);
        let held = shared.controllers[1].state.lock();
        let report = shared.shutdown();
        drop(held);
        assert_eq!(report.lock_defects, vec!["controller bay 2 lock".to_owned()]);
        assert!(!report.is_clean());
        assert_eq!(coordinator.shutdown(), report);
    }

    #[test]
    fn invalid_bay_is_a_config_error() {
        let coordinator = RedundancyCoordinator::new(Arc::new(enclosure()), settings());
        assert!(matches!(
            coordinator.notify_events(3),
            Err(RedundancyError::Config(_))
        ));
        assert!(coordinator.controller(0).is_none());
    }

    #[test]
    fn settings_follow_configuration_sections() {
        let config: AppConfig = r#"
            [enclosure]
            active_oa = "10.0.0.1"
            user_name = "admin"
            password = "secret"

            [monitor]
            poll_interval = 3
            switchover_retries = 7
        "#
        .parse()
        .unwrap();
        let settings = RedundancySettings::from_config(&config);
        assert_eq!(settings.poll_interval, Duration::from_secs(3));
        assert_eq!(settings.switchover_retries, 7);
        assert_eq!(settings.hpi_call_timeout, Duration::from_secs(40));
        assert_eq!(settings.credentials.user_name, "admin");
    }
}
