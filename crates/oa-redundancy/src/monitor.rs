//! ---
//! oa_section: "07-resilience-fault-tolerance"
//! oa_subsection: "module"
//! oa_type: "source"
//! oa_scope: "code"
//! oa_description: "Dual-controller discovery, role tracking and failover."
//! oa_version: "v0.0.0-prealpha"
//! oa_owner: "tbd"
//! ---
//! Per-controller monitor thread.
//!
//! Each monitor owns the sessions of its record: it opens them, polls the
//! controller's role through them, and drops them when the controller is lost
//! or extracted. Every wait is a timed receive on the monitor's signal
//! channel so that shutdown and external events cut it short.
use std::io;
use std::ops::ControlFlow;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use oa_session::{OaRole, Session};
use tracing::{debug, error, info, warn};

use crate::controller::{usable_address, ControllerRecord};
use crate::coordinator::{FailoverReason, Shared};
use crate::error::{RedundancyError, Result};

/// Firmware from which a standby keeps its sessions through a switchover.
const SWITCHOVER_GRACE_FIRMWARE: f64 = 2.21;

/// Wake-up reasons delivered to a monitor thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MonitorSignal {
    Events,
    Inserted,
    Extracted,
    Shutdown,
}

enum Grace {
    Recovered,
    Lost,
    Interrupted,
}

pub(crate) fn spawn(
    shared: Arc<Shared>,
    bay: u8,
    signals: Receiver<MonitorSignal>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("oa-monitor-bay{bay}"))
        .spawn(move || {
            Monitor {
                shared,
                bay,
                signals,
            }
            .run()
        })
}

struct Monitor {
    shared: Arc<Shared>,
    bay: u8,
    signals: Receiver<MonitorSignal>,
}

impl Monitor {
    fn record(&self) -> &ControllerRecord {
        self.shared.slot(self.bay)
    }

    fn run(self) {
        info!(bay = self.bay, "controller monitor started");
        while !self.shared.token().is_cancelled() {
            let session = self.record().data_session();
            let flow = match session {
                Some(session) => self.poll(&session),
                None => self.reconnect(),
            };
            if flow.is_break() {
                break;
            }
        }
        info!(bay = self.bay, "controller monitor stopped");
    }

    fn poll(&self, session: &Session) -> ControlFlow<()> {
        let bay = self.bay;
        if let Err(err) = self.ensure_subscription(session) {
            warn!(bay, error = %err, "event subscription failed; reconnecting");
            self.drop_sessions(session);
            return ControlFlow::Continue(());
        }
        match self
            .shared
            .check_and_promote(bay, session, FailoverReason::Promotion)
        {
            Ok(OaRole::Absent) => {
                info!(bay, "controller reports its bay as absent; dropping sessions");
                self.drop_sessions(session);
                return ControlFlow::Continue(());
            }
            Ok(role) => debug!(bay, %role, "role check"),
            Err(RedundancyError::ShuttingDown) => return ControlFlow::Break(()),
            Err(err @ RedundancyError::StuckTransition { .. }) => {
                error!(bay, error = %err, "controller stuck in transition");
            }
            Err(err) => match self.switchover_grace(session) {
                Grace::Recovered => {}
                Grace::Interrupted => return ControlFlow::Continue(()),
                Grace::Lost => {
                    warn!(bay, error = %err, "controller lost; reconnecting");
                    self.drop_sessions(session);
                    return ControlFlow::Continue(());
                }
            },
        }
        self.sleep(self.shared.settings().poll_interval)
    }

    /// Sessions handed over by discovery have no event subscription yet.
    fn ensure_subscription(&self, session: &Session) -> Result<()> {
        let (address, event) = {
            let state = self.record().state.lock();
            if state.event_pid.is_some() || !state.owns(session) {
                return Ok(());
            }
            (state.address.clone(), state.event_session.clone())
        };
        let Some(event) = event else {
            return Ok(());
        };
        let (aux, pid) = self.shared.subscribe(&address, &event)?;
        let mut state = self.record().state.lock();
        if state.owns(session) {
            state.aux_event_session = Some(aux);
            state.event_pid = Some(pid);
            debug!(bay = self.bay, event_pid = pid, "subscribed for events");
        } else {
            aux.close();
        }
        Ok(())
    }

    /// Keep a standby's sessions while the partner switches over.
    fn switchover_grace(&self, session: &Session) -> Grace {
        if self.record().state.lock().role != OaRole::Standby {
            return Grace::Lost;
        }
        let firmware = self.shared.active_firmware_version();
        if firmware < SWITCHOVER_GRACE_FIRMWARE {
            return Grace::Lost;
        }
        let settings = self.shared.settings();
        for attempt in 1..=settings.switchover_retries {
            info!(bay = self.bay, attempt, firmware, "waiting for switchover to settle");
            if self.sleep(settings.switchover_wait).is_break() {
                return Grace::Interrupted;
            }
            if !self.record().state.lock().owns(session) {
                return Grace::Interrupted;
            }
            match self
                .shared
                .check_and_promote(self.bay, session, FailoverReason::Promotion)
            {
                Ok(_) => return Grace::Recovered,
                Err(RedundancyError::ShuttingDown) => return Grace::Interrupted,
                Err(err) => debug!(bay = self.bay, attempt, error = %err, "still switching over"),
            }
        }
        Grace::Lost
    }

    fn reconnect(&self) -> ControlFlow<()> {
        let bay = self.bay;
        let settings = self.shared.settings();
        let (role, address) = {
            let state = self.record().state.lock();
            (state.role, state.address.clone())
        };
        if role == OaRole::Absent || !usable_address(&address) {
            if let Err(err) = self.shared.refresh_from_authoritative(bay) {
                debug!(bay, error = %err, "could not refresh controller details");
            }
            let ready = {
                let state = self.record().state.lock();
                state.role != OaRole::Absent && usable_address(&state.address)
            };
            if !ready {
                return self.sleep(settings.absent_poll_interval);
            }
            return ControlFlow::Continue(());
        }

        match self.shared.open_session_set(&address) {
            Ok(sessions) => {
                if self.shared.token().is_cancelled() {
                    sessions.close();
                    return ControlFlow::Break(());
                }
                let pid = sessions.event_pid;
                self.record().state.lock().install(sessions);
                if let Some(metrics) = self.shared.metrics() {
                    metrics.record_reconnect(bay, true);
                }
                info!(bay, address = %address, event_pid = pid, "controller sessions opened");
                ControlFlow::Continue(())
            }
            Err(err) => {
                if let Some(metrics) = self.shared.metrics() {
                    metrics.record_reconnect(bay, false);
                }
                warn!(bay, address = %address, error = %err, "reconnect failed");
                self.sleep(settings.reconnect_backoff)
            }
        }
    }

    /// Close the record's sessions if `session` is still its data session.
    fn drop_sessions(&self, session: &Session) {
        let mut state = self.record().state.lock();
        if state.owns(session) {
            state.close_sessions();
        }
    }

    fn extracted(&self) {
        self.record().state.lock().reset();
        self.shared.observe_role(self.bay, OaRole::Absent);
        info!(bay = self.bay, "controller extracted; sessions dropped");
    }

    /// Wait up to `timeout`, returning early on any signal.
    fn sleep(&self, timeout: Duration) -> ControlFlow<()> {
        if self.shared.token().is_cancelled() {
            return ControlFlow::Break(());
        }
        match self.signals.recv_timeout(timeout) {
            Ok(MonitorSignal::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                return ControlFlow::Break(());
            }
            Ok(MonitorSignal::Extracted) => self.extracted(),
            Ok(signal) => debug!(bay = self.bay, ?signal, "monitor woken"),
            Err(RecvTimeoutError::Timeout) => {}
        }
        if self.shared.token().is_cancelled() {
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }
}
