//! ---
//! oa_section: "02-session-boundary"
//! oa_subsection: "module"
//! oa_type: "source"
//! oa_scope: "code"
//! oa_description: "Session provider boundary for Onboard Administrator calls."
//! oa_version: "v0.0.0-prealpha"
//! oa_owner: "tbd"
//! ---
//! In-memory enclosure with two Onboard Administrator bays. Backs the test
//! suites and the daemon's simulation mode.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::session::{Credentials, Session, SessionProvider, SoapSession};
use crate::types::{OaInfo, OaNetworkInfo, OaRole, OaStatus, UserInfo};
use crate::{Result, SessionError};

const BAY_COUNT: usize = 2;
const FAULT_INVALID_BAY: i32 = 19;
const FAULT_INVALID_USER: i32 = 40;
const FAULT_AUTH: i32 = 401;

fn default_true() -> bool {
    true
}

fn default_firmware() -> String {
    "3.60".to_owned()
}

/// Static description of one simulated bay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedBay {
    /// Address the bay answers on.
    pub address: String,
    /// Role the bay reports.
    #[serde(default)]
    pub role: OaRole,
    /// Redundancy flag reported alongside the role.
    #[serde(default = "default_true")]
    pub redundancy: bool,
    /// Firmware string reported by the bay.
    #[serde(default = "default_firmware")]
    pub firmware_version: String,
    /// Whether the bay answers at all.
    #[serde(default = "default_true")]
    pub reachable: bool,
    /// Address published through the network info call, when it differs
    /// from the address the bay answers on.
    #[serde(default)]
    pub reported_address: Option<String>,
}

impl SimulatedBay {
    /// Reachable bay with redundancy enabled and default firmware.
    pub fn new(address: impl Into<String>, role: OaRole) -> Self {
        Self {
            address: address.into(),
            role,
            redundancy: role != OaRole::Absent,
            firmware_version: default_firmware(),
            reachable: true,
            reported_address: None,
        }
    }

    /// Empty bay.
    pub fn absent() -> Self {
        Self::new(String::new(), OaRole::Absent)
    }

    /// Override the firmware string.
    pub fn with_firmware(mut self, firmware: impl Into<String>) -> Self {
        self.firmware_version = firmware.into();
        self
    }

    /// Override the redundancy flag.
    pub fn with_redundancy(mut self, redundancy: bool) -> Self {
        self.redundancy = redundancy;
        self
    }
}

#[derive(Debug)]
struct EnclosureState {
    bays: [SimulatedBay; BAY_COUNT],
    scripted_roles: [VecDeque<OaRole>; BAY_COUNT],
    users: [HashMap<String, (String, UserInfo)>; BAY_COUNT],
    refused: HashSet<String>,
    opens: Vec<(String, Duration)>,
    open_sessions: usize,
    next_session_id: u64,
    next_event_pid: u32,
}

impl EnclosureState {
    fn bay_index(&self, address: &str) -> Option<usize> {
        if address.is_empty() {
            return None;
        }
        self.bays
            .iter()
            .position(|bay| bay.address == address && bay.role != OaRole::Absent)
    }
}

fn slot(bay: u8) -> Option<usize> {
    match bay {
        1 => Some(0),
        2 => Some(1),
        _ => None,
    }
}

/// Two-bay enclosure living entirely in memory.
#[derive(Debug, Clone)]
pub struct SimulatedEnclosure {
    state: Arc<Mutex<EnclosureState>>,
}

impl SimulatedEnclosure {
    /// Build an enclosure from the two bay descriptions.
    pub fn new(bay1: SimulatedBay, bay2: SimulatedBay) -> Self {
        Self {
            state: Arc::new(Mutex::new(EnclosureState {
                bays: [bay1, bay2],
                scripted_roles: [VecDeque::new(), VecDeque::new()],
                users: [HashMap::new(), HashMap::new()],
                refused: HashSet::new(),
                opens: Vec::new(),
                open_sessions: 0,
                next_session_id: 1,
                next_event_pid: 1,
            })),
        }
    }

    /// Register an account, builder style.
    pub fn with_user(self, password: &str, info: UserInfo) -> Self {
        self.add_user(password, info);
        self
    }

    /// Register or replace an account on both bays.
    pub fn add_user(&self, password: &str, info: UserInfo) {
        let mut state = self.state.lock();
        for users in state.users.iter_mut() {
            users.insert(info.user_name.clone(), (password.to_owned(), info.clone()));
        }
    }

    /// Register or replace an account as seen by one bay only, e.g. while
    /// its user table has not been synchronised yet.
    pub fn add_bay_user(&self, bay: u8, password: &str, info: UserInfo) {
        if let Some(index) = slot(bay) {
            self.state.lock().users[index]
                .insert(info.user_name.clone(), (password.to_owned(), info));
        }
    }

    /// Snapshot of a bay description.
    pub fn bay(&self, bay: u8) -> Option<SimulatedBay> {
        let index = slot(bay)?;
        Some(self.state.lock().bays[index].clone())
    }

    /// Change the role a bay reports.
    pub fn set_role(&self, bay: u8, role: OaRole) {
        self.with_bay(bay, |entry| entry.role = role);
    }

    /// Change the redundancy flag a bay reports.
    pub fn set_redundancy(&self, bay: u8, redundancy: bool) {
        self.with_bay(bay, |entry| entry.redundancy = redundancy);
    }

    /// Make a bay stop (or resume) answering.
    pub fn set_reachable(&self, bay: u8, reachable: bool) {
        self.with_bay(bay, |entry| entry.reachable = reachable);
    }

    /// Change the address a bay answers on.
    pub fn set_address(&self, bay: u8, address: &str) {
        self.with_bay(bay, |entry| entry.address = address.to_owned());
    }

    /// Queue roles returned by the next status queries for `bay`, ahead of
    /// its configured role.
    pub fn script_roles(&self, bay: u8, roles: impl IntoIterator<Item = OaRole>) {
        if let Some(index) = slot(bay) {
            self.state.lock().scripted_roles[index].extend(roles);
        }
    }

    /// Refuse (or accept again) session opens against `address`.
    pub fn refuse_opens(&self, address: &str, refuse: bool) {
        let mut state = self.state.lock();
        if refuse {
            state.refused.insert(address.to_owned());
        } else {
            state.refused.remove(address);
        }
    }

    /// Swap the Active and Standby roles between the two bays.
    pub fn switch_over(&self) {
        let mut state = self.state.lock();
        for bay in state.bays.iter_mut() {
            bay.role = match bay.role {
                OaRole::Active => OaRole::Standby,
                OaRole::Standby => OaRole::Active,
                other => other,
            };
        }
    }

    /// Number of open attempts made against `address`.
    pub fn open_count(&self, address: &str) -> usize {
        self.state
            .lock()
            .opens
            .iter()
            .filter(|(opened, _)| opened == address)
            .count()
    }

    /// Timeouts requested by every open attempt against `address`.
    pub fn opened_timeouts(&self, address: &str) -> Vec<Duration> {
        self.state
            .lock()
            .opens
            .iter()
            .filter(|(opened, _)| opened == address)
            .map(|(_, timeout)| *timeout)
            .collect()
    }

    /// Number of sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.state.lock().open_sessions
    }

    fn with_bay(&self, bay: u8, update: impl FnOnce(&mut SimulatedBay)) {
        if let Some(index) = slot(bay) {
            update(&mut self.state.lock().bays[index]);
        }
    }
}

impl SessionProvider for SimulatedEnclosure {
    fn open(
        &self,
        address: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Session> {
        let mut state = self.state.lock();
        state.opens.push((address.to_owned(), timeout));

        let unreachable = |reason: &str| SessionError::Transport {
            address: address.to_owned(),
            reason: reason.to_owned(),
        };
        if state.refused.contains(address) {
            return Err(unreachable("connection refused"));
        }
        let Some(index) = state.bay_index(address) else {
            return Err(unreachable("no route to host"));
        };
        if !state.bays[index].reachable {
            return Err(unreachable("connection timed out"));
        }
        match state.users[index].get(&credentials.user_name) {
            Some((password, _)) if *password == credentials.password => {}
            _ => {
                return Err(SessionError::Fault {
                    address: address.to_owned(),
                    code: FAULT_AUTH,
                    message: "invalid user name or password".to_owned(),
                })
            }
        }

        let id = state.next_session_id;
        state.next_session_id += 1;
        state.open_sessions += 1;
        debug!(session = id, address, bay = index + 1, ?timeout, "simulated session opened");

        Ok(Session::new(SimulatedSession {
            id,
            address: address.to_owned(),
            index,
            timeout,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

struct SimulatedSession {
    id: u64,
    address: String,
    index: usize,
    timeout: Duration,
    state: Arc<Mutex<EnclosureState>>,
    closed: AtomicBool,
}

impl SimulatedSession {
    fn enter(&self) -> Result<MutexGuard<'_, EnclosureState>> {
        if self.is_closed() {
            return Err(SessionError::Closed { id: self.id });
        }
        let state = self.state.lock();
        let bay = &state.bays[self.index];
        if !bay.reachable || bay.role == OaRole::Absent {
            return Err(SessionError::Transport {
                address: self.address.clone(),
                reason: "connection reset by peer".to_owned(),
            });
        }
        Ok(state)
    }

    fn target(&self, bay: u8) -> Result<usize> {
        slot(bay).ok_or_else(|| SessionError::Fault {
            address: self.address.clone(),
            code: FAULT_INVALID_BAY,
            message: format!("invalid bay number {bay}"),
        })
    }
}

impl SoapSession for SimulatedSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn get_user_info(&self, user_name: &str) -> Result<UserInfo> {
        let state = self.enter()?;
        state.users[self.index]
            .get(user_name)
            .map(|(_, info)| info.clone())
            .ok_or_else(|| SessionError::Fault {
                address: self.address.clone(),
                code: FAULT_INVALID_USER,
                message: format!("unknown user {user_name}"),
            })
    }

    fn get_oa_status(&self, bay: u8) -> Result<OaStatus> {
        let index = self.target(bay)?;
        let mut state = self.enter()?;
        let scripted = state.scripted_roles[index].pop_front();
        let entry = &state.bays[index];
        let role = match entry.role {
            OaRole::Absent => OaRole::Absent,
            configured => scripted.unwrap_or(configured),
        };
        Ok(OaStatus {
            bay,
            role,
            redundancy: entry.role != OaRole::Absent && entry.redundancy,
        })
    }

    fn get_oa_info(&self, bay: u8) -> Result<OaInfo> {
        let index = self.target(bay)?;
        let state = self.enter()?;
        Ok(OaInfo {
            bay,
            you_are_here: index == self.index,
            firmware_version: state.bays[index].firmware_version.clone(),
        })
    }

    fn get_oa_network_info(&self, bay: u8) -> Result<OaNetworkInfo> {
        let index = self.target(bay)?;
        let state = self.enter()?;
        let entry = &state.bays[index];
        let ip_address = if entry.role == OaRole::Absent {
            String::new()
        } else {
            entry
                .reported_address
                .clone()
                .unwrap_or_else(|| entry.address.clone())
        };
        Ok(OaNetworkInfo { bay, ip_address })
    }

    fn subscribe_for_events(&self) -> Result<u32> {
        let mut state = self.enter()?;
        let pid = state.next_event_pid;
        state.next_event_pid += 1;
        Ok(pid)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.state.lock();
            state.open_sessions = state.open_sessions.saturating_sub(1);
            debug!(session = self.id, address = %self.address, "simulated session closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
