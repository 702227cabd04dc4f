//! # Policy Model
//!
//! A [`Policy`] binds one [`Profile`] (a bundle of features for a single
//! device type) to a tenant-scoped priority and a compliance mode. Which
//! devices it targets is recorded separately as scope assignments (see
//! [`crate::scope`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use fleet_core::{CanonicalBytes, DeviceType, FleetError, PolicyId, ProfileId, TenantId, Timestamp};
use fleet_state::OwnershipType;

/// How a device that does not satisfy the policy is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceMode {
    Enforce,
    Warn,
    Monitor,
}

impl Default for ComplianceMode {
    fn default() -> Self {
        Self::Enforce
    }
}

impl ComplianceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enforce => "ENFORCE",
            Self::Warn => "WARN",
            Self::Monitor => "MONITOR",
        }
    }
}

impl std::fmt::Display for ComplianceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ComplianceMode {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ENFORCE" => Ok(Self::Enforce),
            "WARN" => Ok(Self::Warn),
            "MONITOR" => Ok(Self::Monitor),
            _ => Err(FleetError::validation(format!("unknown compliance mode: {s:?}"))),
        }
    }
}

/// One configurable feature of a profile (`CAMERA`, `WIFI`, `PASSCODE_POLICY`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFeature {
    /// Feature code understood by the device-type plugin.
    pub code: String,
    /// Feature payload. Integers only; floats are rejected.
    #[serde(default)]
    pub content: Value,
}

/// A bundle of features bound to exactly one device type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    pub name: String,
    pub device_type: DeviceType,
    #[serde(default)]
    pub features: Vec<ProfileFeature>,
}

/// A stored policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub tenant: TenantId,
    pub name: String,
    pub profile: Profile,
    /// Tenant-unique ordering key. Lower value wins.
    pub priority: u32,
    pub compliance: ComplianceMode,
    /// When set, the policy only governs devices of this ownership.
    pub ownership_type: Option<OwnershipType>,
    /// Only active policies participate in resolution.
    pub active: bool,
    /// Set whenever the policy changes after creation.
    pub updated: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Policy {
    /// The device type this policy targets (its profile's type).
    pub fn device_type(&self) -> &DeviceType {
        &self.profile.device_type
    }

    /// Whether the ownership filter admits a device of `ownership`.
    pub fn admits_ownership(&self, ownership: OwnershipType) -> bool {
        self.ownership_type.map_or(true, |required| required == ownership)
    }
}

/// Profile as supplied on create/update. The id is assigned if absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileInput {
    #[serde(default)]
    pub id: Option<ProfileId>,
    #[serde(default)]
    pub name: String,
    pub device_type: DeviceType,
    #[serde(default)]
    pub features: Vec<ProfileFeature>,
}

/// Input for creating or updating a policy.
///
/// Policies are created inactive unless `active` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDraft {
    pub name: String,
    pub profile: Option<ProfileInput>,
    #[serde(default)]
    pub compliance: ComplianceMode,
    #[serde(default)]
    pub ownership_type: Option<OwnershipType>,
    #[serde(default)]
    pub active: bool,
}

impl PolicyDraft {
    /// Validate the draft and build its profile.
    ///
    /// Rejects a blank name, a missing profile, a blank feature code and
    /// feature content that cannot be canonicalized.
    pub fn validate(&self) -> Result<Profile, PolicyError> {
        if self.name.trim().is_empty() {
            return Err(PolicyError::EmptyName);
        }
        let input = self.profile.as_ref().ok_or(PolicyError::MissingProfile)?;
        for feature in &input.features {
            if feature.code.trim().is_empty() {
                return Err(PolicyError::InvalidFeature(
                    "feature code must not be empty".to_string(),
                ));
            }
            CanonicalBytes::new(&feature.content).map_err(|e| {
                PolicyError::InvalidFeature(format!("feature {}: {e}", feature.code))
            })?;
        }
        Ok(Profile {
            id: input.id.unwrap_or_default(),
            name: if input.name.trim().is_empty() {
                self.name.clone()
            } else {
                input.name.clone()
            },
            device_type: input.device_type.clone(),
            features: input.features.clone(),
        })
    }
}

/// Errors raised by policy validation and priority ordering.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("policy name must not be empty")]
    EmptyName,

    #[error("policy must reference a profile with a device type")]
    MissingProfile,

    #[error("invalid profile feature: {0}")]
    InvalidFeature(String),

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("priority must be at least 1, got {0}")]
    InvalidPriority(u32),

    /// The same policy appears twice in one reordering request.
    #[error("policy {0} listed more than once")]
    DuplicatePolicy(PolicyId),

    /// Two policies in one reordering request share a priority.
    #[error("priority {0} assigned to more than one policy")]
    DuplicatePriority(u32),

    /// A requested priority is held by a policy outside the request.
    #[error("priority {priority} is already held by {holder}")]
    PriorityCollision { priority: u32, holder: PolicyId },
}

impl From<PolicyError> for FleetError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::DuplicatePriority(_) | PolicyError::PriorityCollision { .. } => {
                FleetError::Conflict(err.to_string())
            }
            _ => FleetError::Validation(err.to_string()),
        }
    }
}
