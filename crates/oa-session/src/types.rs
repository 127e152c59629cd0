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

use serde::{Deserialize, Serialize};

/// Role an Onboard Administrator reports for a bay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OaRole {
    /// Not installed or not reachable.
    #[default]
    Absent,
    /// Hot spare.
    Standby,
    /// Switching over between standby and active.
    Transition,
    /// Authoritative controller.
    Active,
}

impl OaRole {
    /// Stable lowercase label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            OaRole::Absent => "absent",
            OaRole::Standby => "standby",
            OaRole::Transition => "transition",
            OaRole::Active => "active",
        }
    }

    /// Numeric encoding for gauges.
    pub fn as_gauge(&self) -> i64 {
        match self {
            OaRole::Absent => 0,
            OaRole::Standby => 1,
            OaRole::Transition => 2,
            OaRole::Active => 3,
        }
    }
}

impl fmt::Display for OaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OaRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "absent" => Ok(OaRole::Absent),
            "standby" => Ok(OaRole::Standby),
            "transition" => Ok(OaRole::Transition),
            "active" => Ok(OaRole::Active),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Response to a bay status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OaStatus {
    /// Bay the status belongs to.
    pub bay: u8,
    /// Reported role.
    pub role: OaRole,
    /// Whether the redundancy partner link is established.
    pub redundancy: bool,
}

/// Response to a bay information query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OaInfo {
    /// Bay the information belongs to.
    pub bay: u8,
    /// True when the answering controller sits in this bay.
    pub you_are_here: bool,
    /// Firmware version string in `x.yy` form.
    pub firmware_version: String,
}

/// Response to a bay network query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OaNetworkInfo {
    /// Bay the network information belongs to.
    pub bay: u8,
    /// Management IP address.
    pub ip_address: String,
}

/// Access control level of an enclosure user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Acl {
    /// Full administrative rights.
    Administrator,
    /// Operator rights.
    Operator,
    /// Read-only access.
    #[default]
    User,
}

/// Access flag for a single bay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BayAccess {
    /// Bay number.
    pub bay: u8,
    /// Whether the user may manage the bay.
    pub access: bool,
}

/// Bay level permissions of an enclosure user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BayPermissions {
    /// Access to the Onboard Administrator bays.
    pub oa_access: bool,
    /// Per server blade bay access.
    #[serde(default)]
    pub blade_bays: Vec<BayAccess>,
    /// Per interconnect bay access.
    #[serde(default)]
    pub interconnect_bays: Vec<BayAccess>,
}

/// Response to a user information query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Account name.
    pub user_name: String,
    /// Whether the account is enabled.
    pub enabled: bool,
    /// Access control level.
    pub acl: Acl,
    /// Bay permissions.
    pub permissions: BayPermissions,
}

impl UserInfo {
    /// Fully privileged account covering the given bay counts.
    pub fn administrator(user_name: &str, blade_bays: u8, interconnect_bays: u8) -> Self {
        Self {
            user_name: user_name.to_owned(),
            enabled: true,
            acl: Acl::Administrator,
            permissions: BayPermissions {
                oa_access: true,
                blade_bays: (1..=blade_bays)
                    .map(|bay| BayAccess { bay, access: true })
                    .collect(),
                interconnect_bays: (1..=interconnect_bays)
                    .map(|bay| BayAccess { bay, access: true })
                    .collect(),
            },
        }
    }
}
