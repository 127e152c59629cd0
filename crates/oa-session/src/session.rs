//! ---
//! oa_section: "02-session-boundary"
//! oa_subsection: "module"
//! oa_type: "source"
//! oa_scope: "code"
//! oa_description: "Session provider boundary for Onboard Administrator calls."
//! oa_version: "v0.0.0-prealpha"
//! oa_owner: "tbd"
//! ---
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{OaInfo, OaNetworkInfo, OaStatus, UserInfo};
use crate::Result;

/// Account used to authenticate against an Onboard Administrator.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Enclosure account name.
    pub user_name: String,
    /// Enclosure account password.
    pub password: String,
}

impl Credentials {
    /// Build a credential pair.
    pub fn new(user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authenticated request/response channel to one Onboard Administrator.
///
/// Every call blocks the calling thread for at most the timeout the session
/// was opened with.
pub trait SoapSession: Send + Sync {
    /// Provider assigned identifier, used in logs.
    fn id(&self) -> u64;
    /// Address the session was opened against.
    fn address(&self) -> &str;
    /// Per-call timeout the session was opened with.
    fn timeout(&self) -> Duration;
    /// Fetch the rights of an enclosure account.
    fn get_user_info(&self, user_name: &str) -> Result<UserInfo>;
    /// Fetch the role of the controller in `bay`.
    fn get_oa_status(&self, bay: u8) -> Result<OaStatus>;
    /// Fetch identity and firmware of the controller in `bay`.
    fn get_oa_info(&self, bay: u8) -> Result<OaInfo>;
    /// Fetch the management address of the controller in `bay`.
    fn get_oa_network_info(&self, bay: u8) -> Result<OaNetworkInfo>;
    /// Open an event subscription and return its id.
    fn subscribe_for_events(&self) -> Result<u32>;
    /// Release the session. Calling it more than once is a no-op.
    fn close(&self);
    /// Whether [`SoapSession::close`] has been called.
    fn is_closed(&self) -> bool;
}

/// Factory for authenticated sessions.
pub trait SessionProvider: Send + Sync {
    /// Open a session against `address` whose calls time out after `timeout`.
    fn open(&self, address: &str, credentials: &Credentials, timeout: Duration)
        -> Result<Session>;
}

/// Shared handle to an open session.
///
/// Two handles are equal only when they refer to the same underlying session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<dyn SoapSession>,
}

impl Session {
    /// Wrap a provider specific session.
    pub fn new<S>(session: S) -> Self
    where
        S: SoapSession + 'static,
    {
        Self {
            inner: Arc::new(session),
        }
    }

    fn data_ptr(&self) -> *const () {
        Arc::as_ptr(&self.inner) as *const ()
    }
}

impl Deref for Session {
    type Target = dyn SoapSession;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.data_ptr() == other.data_ptr()
    }
}

impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id())
            .field("address", &self.inner.address())
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}
