//! ---
//! oa_section: "07-resilience-fault-tolerance"
//! oa_subsection: "module"
//! oa_type: "source"
//! oa_scope: "code"
//! oa_description: "Dual-controller discovery, role tracking and failover."
//! oa_version: "v0.0.0-prealpha"
//! oa_owner: "tbd"
//! ---
use std::thread::JoinHandle;

use oa_session::{OaRole, Session};
use parking_lot::Mutex;
use serde::Serialize;

/// Parse an `x.yy` firmware string. Unparsable input yields `0.0`.
pub fn parse_firmware_version(raw: &str) -> f64 {
    raw.split_whitespace()
        .next()
        .and_then(|token| token.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}

/// Whether an address reported by a controller can be dialled.
pub fn usable_address(address: &str) -> bool {
    let address = address.trim();
    !address.is_empty() && address != "0.0.0.0"
}

/// Sessions opened by a monitor when it (re)connects to its controller.
#[derive(Debug)]
pub(crate) struct SessionSet {
    pub data: Session,
    pub event: Session,
    pub aux_event: Session,
    pub event_pid: u32,
}

impl SessionSet {
    pub fn close(self) {
        self.data.close();
        self.event.close();
        self.aux_event.close();
    }
}

/// Mutable state of one controller, always accessed under the record lock.
#[derive(Debug, Default)]
pub(crate) struct ControllerState {
    pub role: OaRole,
    pub address: String,
    pub firmware_version: f64,
    pub data_session: Option<Session>,
    pub event_session: Option<Session>,
    pub aux_event_session: Option<Session>,
    pub event_pid: Option<u32>,
}

impl ControllerState {
    pub fn is_connected(&self) -> bool {
        self.data_session.is_some()
    }

    /// True when `session` is still this controller's data session.
    pub fn owns(&self, session: &Session) -> bool {
        self.data_session.as_ref() == Some(session)
    }

    /// Close and clear every session. Returns how many handles were closed.
    pub fn close_sessions(&mut self) -> usize {
        let mut closed = 0;
        for session in [
            self.data_session.take(),
            self.event_session.take(),
            self.aux_event_session.take(),
        ]
        .into_iter()
        .flatten()
        {
            session.close();
            closed += 1;
        }
        self.event_pid = None;
        closed
    }

    /// Forget everything about the controller.
    pub fn reset(&mut self) -> usize {
        let closed = self.close_sessions();
        self.role = OaRole::Absent;
        self.address.clear();
        self.firmware_version = 0.0;
        closed
    }

    pub fn install(&mut self, sessions: SessionSet) {
        self.close_sessions();
        self.data_session = Some(sessions.data);
        self.event_session = Some(sessions.event);
        self.aux_event_session = Some(sessions.aux_event);
        self.event_pid = Some(sessions.event_pid);
    }

    fn snapshot(&self, bay: u8) -> ControllerSnapshot {
        ControllerSnapshot {
            bay,
            role: self.role,
            address: self.address.clone(),
            firmware_version: self.firmware_version,
            connected: self.data_session.is_some(),
            event_session: self.event_session.is_some(),
            aux_event_session: self.aux_event_session.is_some(),
            event_pid: self.event_pid,
        }
    }
}

/// One of the two controller slots owned by the coordinator.
#[derive(Debug)]
pub(crate) struct ControllerRecord {
    bay: u8,
    pub state: Mutex<ControllerState>,
    pub monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ControllerRecord {
    pub fn new(bay: u8) -> Self {
        Self {
            bay,
            state: Mutex::new(ControllerState::default()),
            monitor: Mutex::new(None),
        }
    }

    pub fn bay(&self) -> u8 {
        self.bay
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        self.state.lock().snapshot(self.bay)
    }

    pub fn data_session(&self) -> Option<Session> {
        self.state.lock().data_session.clone()
    }
}

/// Point-in-time view of a controller record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerSnapshot {
    pub bay: u8,
    pub role: OaRole,
    pub address: String,
    pub firmware_version: f64,
    /// A data session is open.
    pub connected: bool,
    pub event_session: bool,
    pub aux_event_session: bool,
    pub event_pid: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firmware_parsing_tolerates_noise() {
        assert_eq!(parse_firmware_version("3.60"), 3.60);
        assert_eq!(parse_firmware_version(" 2.21 Jun 12 2009"), 2.21);
        assert_eq!(parse_firmware_version("unknown"), 0.0);
        assert_eq!(parse_firmware_version(""), 0.0);
    }

    #[test]
    fn quirky_addresses_are_unusable() {
        assert!(!usable_address(""));
        assert!(!usable_address("0.0.0.0"));
        assert!(!usable_address("  "));
        assert!(usable_address("10.0.0.1"));
    }

    #[test]
    fn fresh_record_is_absent_and_disconnected() {
        let record = ControllerRecord::new(2);
        let snapshot = record.snapshot();
        assert_eq!(snapshot.bay, 2);
        assert_eq!(snapshot.role, OaRole::Absent);
        assert!(!snapshot.connected);
        assert!(snapshot.address.is_empty());
    }
}
