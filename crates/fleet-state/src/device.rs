//! # Enrollment Lifecycle State Machine
//!
//! Models the enrollment lifecycle of a managed device within a tenant.
//!
//! ## States
//!
//! ```text
//! (unenrolled) ──▶ ACTIVE ◀──▶ INACTIVE
//!                    │  ▲         │
//!                    ▼  │         ▼
//!                  BLOCKED ◀──────┘
//!                    │
//!   ACTIVE / INACTIVE / BLOCKED ──▶ REMOVED (terminal)
//! ```
//!
//! The initial state is chosen by the device-type plugin's claimable check:
//! claimable devices start INACTIVE until claimed, everything else starts
//! ACTIVE. REMOVED is terminal for the enrollment row; a removed device
//! comes back only through a fresh enrollment (see [`crate::plan`]).
//!
//! Transitions are validated at runtime by `Device::require_transition` and
//! return `Result`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fleet_core::{DeviceId, DeviceIdentifier, EnrollmentId, FleetError, TenantId, Timestamp};

// ─── Status ──────────────────────────────────────────────────────────

/// Enrollment status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentStatus {
    /// Enrolled and managed.
    Active,
    /// Enrolled but not managed (claimable, or demoted by a re-enrollment).
    Inactive,
    /// Disenrolled. Terminal for this enrollment row.
    Removed,
    /// Administratively blocked.
    Blocked,
}

impl EnrollmentStatus {
    /// All statuses, in declaration order.
    pub const ALL: [EnrollmentStatus; 4] = [
        Self::Active,
        Self::Inactive,
        Self::Removed,
        Self::Blocked,
    ];

    /// Status assigned to a newly created enrollment.
    pub fn initial(claimable: bool) -> Self {
        if claimable {
            Self::Inactive
        } else {
            Self::Active
        }
    }

    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed)
    }

    /// Whether a transition from `self` to `to` is permitted.
    pub fn can_transition_to(&self, to: EnrollmentStatus) -> bool {
        use EnrollmentStatus::*;
        matches!(
            (self, to),
            (Active, Inactive)
                | (Active, Blocked)
                | (Active, Removed)
                | (Inactive, Active)
                | (Inactive, Blocked)
                | (Inactive, Removed)
                | (Blocked, Active)
                | (Blocked, Removed)
        )
    }

    /// Canonical upper-case name, as stored and rendered.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
            Self::Removed => "REMOVED",
            Self::Blocked => "BLOCKED",
        }
    }
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnrollmentStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| FleetError::validation(format!("unknown enrollment status: {s:?}")))
    }
}

/// Who owns the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OwnershipType {
    /// Bring your own device.
    Byod,
    /// Corporate owned, personally enabled.
    Cope,
}

impl OwnershipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Byod => "BYOD",
            Self::Cope => "COPE",
        }
    }
}

impl std::fmt::Display for OwnershipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OwnershipType {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BYOD" => Ok(Self::Byod),
            "COPE" => Ok(Self::Cope),
            _ => Err(FleetError::validation(format!("unknown ownership type: {s:?}"))),
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────

/// Errors raised by enrollment lifecycle transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentError {
    /// The attempted transition is not valid from the current status.
    #[error("invalid enrollment transition for {device}: {from} -> {to}")]
    InvalidTransition {
        /// Device identifier.
        device: String,
        /// Current status.
        from: EnrollmentStatus,
        /// Attempted status.
        to: EnrollmentStatus,
    },

    /// The enrollment is REMOVED and cannot transition further.
    #[error("device {device} is disenrolled")]
    AlreadyRemoved {
        /// Device identifier.
        device: String,
    },

    /// The owner name is blank.
    #[error("enrollment owner must not be empty")]
    MissingOwner,
}

impl From<EnrollmentError> for FleetError {
    fn from(err: EnrollmentError) -> Self {
        match err {
            EnrollmentError::MissingOwner => FleetError::Validation(err.to_string()),
            EnrollmentError::InvalidTransition { .. } | EnrollmentError::AlreadyRemoved { .. } => {
                FleetError::Conflict(err.to_string())
            }
        }
    }
}

// ─── Enrollment ──────────────────────────────────────────────────────

/// One enrollment of a device: the binding of the device to an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentInfo {
    /// Enrollment row identifier.
    pub id: EnrollmentId,
    /// Username of the owner.
    pub owner: String,
    /// Ownership model.
    pub ownership: OwnershipType,
    /// Current status.
    pub status: EnrollmentStatus,
    /// When this enrollment was first created.
    pub date_of_enrollment: Timestamp,
    /// When this enrollment last changed.
    pub date_of_last_update: Timestamp,
}

impl EnrollmentInfo {
    /// A fresh enrollment row.
    pub fn new(
        owner: impl Into<String>,
        ownership: OwnershipType,
        status: EnrollmentStatus,
        at: Timestamp,
    ) -> Result<Self, EnrollmentError> {
        let owner = owner.into();
        if owner.trim().is_empty() {
            return Err(EnrollmentError::MissingOwner);
        }
        Ok(Self {
            id: EnrollmentId::new(),
            owner,
            ownership,
            status,
            date_of_enrollment: at,
            date_of_last_update: at,
        })
    }

    /// Logical equality for re-submission detection: same owner, same
    /// ownership. Status and dates are not compared.
    pub fn same_enrollment(&self, owner: &str, ownership: OwnershipType) -> bool {
        self.owner == owner && self.ownership == ownership
    }
}

// ─── Device ──────────────────────────────────────────────────────────

/// A managed device and its current enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Surrogate key, stable across re-enrollments.
    pub id: DeviceId,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Platform identity.
    pub identifier: DeviceIdentifier,
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Device properties reported at enrollment or by the plugin.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// The current enrollment.
    pub enrollment: EnrollmentInfo,
}

impl Device {
    /// Current enrollment status.
    pub fn status(&self) -> EnrollmentStatus {
        self.enrollment.status
    }

    /// Username of the current owner.
    pub fn owner(&self) -> &str {
        &self.enrollment.owner
    }

    /// Whether the device has a non-removed enrollment.
    pub fn is_enrolled(&self) -> bool {
        !self.enrollment.status.is_terminal()
    }

    /// Whether the device is ACTIVE.
    pub fn is_active(&self) -> bool {
        self.enrollment.status == EnrollmentStatus::Active
    }

    /// Move the current enrollment to `to`, stamping the update time.
    pub fn transition(&mut self, to: EnrollmentStatus, at: Timestamp) -> Result<(), EnrollmentError> {
        self.require_transition(to)?;
        self.enrollment.status = to;
        self.enrollment.date_of_last_update = at;
        Ok(())
    }

    /// Disenroll (any non-terminal status → REMOVED).
    pub fn disenroll(&mut self, at: Timestamp) -> Result<(), EnrollmentError> {
        self.transition(EnrollmentStatus::Removed, at)
    }

    /// Block (ACTIVE | INACTIVE → BLOCKED).
    pub fn block(&mut self, at: Timestamp) -> Result<(), EnrollmentError> {
        self.transition(EnrollmentStatus::Blocked, at)
    }

    /// Unblock (BLOCKED → ACTIVE).
    pub fn unblock(&mut self, at: Timestamp) -> Result<(), EnrollmentError> {
        if self.enrollment.status != EnrollmentStatus::Blocked {
            return Err(self.invalid(EnrollmentStatus::Active));
        }
        self.transition(EnrollmentStatus::Active, at)
    }

    fn require_transition(&self, to: EnrollmentStatus) -> Result<(), EnrollmentError> {
        let from = self.enrollment.status;
        if from.is_terminal() {
            return Err(EnrollmentError::AlreadyRemoved {
                device: self.identifier.to_string(),
            });
        }
        if !from.can_transition_to(to) {
            return Err(self.invalid(to));
        }
        Ok(())
    }

    fn invalid(&self, to: EnrollmentStatus) -> EnrollmentError {
        EnrollmentError::InvalidTransition {
            device: self.identifier.to_string(),
            from: self.enrollment.status,
            to,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
