//! ---
//! oa_section: "02-session-boundary"
//! oa_subsection: "module"
//! oa_type: "source"
//! oa_scope: "code"
//! oa_description: "Session provider boundary for Onboard Administrator calls."
//! oa_version: "v0.0.0-prealpha"
//! oa_owner: "tbd"
//! ---
//! Boundary between the redundancy core and whatever transport actually talks
//! to an Onboard Administrator. The core only ever sees [`Session`] handles
//! produced by a [`SessionProvider`].
#![warn(missing_docs)]

pub mod session;
pub mod simulated;
pub mod types;

/// Shared result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Failure classes surfaced by a session provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The endpoint could not be reached or the connection dropped.
    #[error("transport failure talking to {address}: {reason}")]
    Transport {
        /// Address the call was directed at.
        address: String,
        /// Transport level description.
        reason: String,
    },
    /// The endpoint answered with a well-formed error response.
    #[error("fault response from {address}: {code} {message}")]
    Fault {
        /// Address the call was directed at.
        address: String,
        /// Vendor fault code.
        code: i32,
        /// Vendor fault text.
        message: String,
    },
    /// The handle was closed before the call was issued.
    #[error("session {id} is closed")]
    Closed {
        /// Identifier of the closed session.
        id: u64,
    },
}

impl SessionError {
    /// Whether the failure happened below the protocol layer.
    pub fn is_transport(&self) -> bool {
        matches!(self, SessionError::Transport { .. } | SessionError::Closed { .. })
    }
}

pub use session::{Credentials, Session, SessionProvider, SoapSession};
pub use simulated::{SimulatedBay, SimulatedEnclosure};
pub use types::{
    Acl, BayAccess, BayPermissions, OaInfo, OaNetworkInfo, OaRole, OaStatus, UserInfo,
};
