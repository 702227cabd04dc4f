//! # Enroll Decision
//!
//! Enrolling a device that already has a row is not an insert. Depending on
//! what is stored, the request is a re-submission, an owner change, or a
//! return after disenrollment. [`plan_enrollment`] makes that decision
//! without touching storage; the caller then performs the single store
//! transaction that matches the returned [`EnrollmentPlan`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use fleet_core::{DeviceId, DeviceIdentifier, TenantId, Timestamp};

use crate::device::{Device, EnrollmentError, EnrollmentInfo, EnrollmentStatus, OwnershipType};

/// A request to enroll (or re-enroll) a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentRequest {
    /// Platform identity of the device.
    pub identifier: DeviceIdentifier,
    /// Display name. Defaults to the platform identifier when blank.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Username of the enrolling owner.
    pub owner: String,
    pub ownership: OwnershipType,
}

impl EnrollmentRequest {
    fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            self.identifier.id.clone()
        } else {
            self.name.clone()
        }
    }
}

/// What an enroll request turns into, given the stored device (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentPlan {
    /// No row exists: insert device and enrollment together.
    Create(Device),
    /// Same owner and ownership: refresh mutable fields in place. The
    /// enrollment row, its status and its enrollment date are preserved.
    Resubmit(Device),
    /// A different owner: `previous` is demoted to INACTIVE and the device
    /// moves to a new enrollment row.
    Reassign {
        device: Device,
        previous: EnrollmentInfo,
    },
    /// The stored enrollment is REMOVED: a fresh enrollment row is created
    /// and the removed row stays as history.
    Renew {
        device: Device,
        previous: EnrollmentInfo,
    },
}

impl EnrollmentPlan {
    /// The device as it will be stored.
    pub fn device(&self) -> &Device {
        match self {
            Self::Create(device) | Self::Resubmit(device) => device,
            Self::Reassign { device, .. } | Self::Renew { device, .. } => device,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Resubmit(_) => "resubmit",
            Self::Reassign { .. } => "reassign",
            Self::Renew { .. } => "renew",
        }
    }
}

/// Decide how an enroll request is applied.
///
/// `claimable` is the device-type plugin's answer (false when no plugin is
/// registered) and only affects newly created enrollment rows.
pub fn plan_enrollment(
    tenant: &TenantId,
    existing: Option<&Device>,
    request: &EnrollmentRequest,
    claimable: bool,
    at: Timestamp,
) -> Result<EnrollmentPlan, EnrollmentError> {
    let initial = EnrollmentStatus::initial(claimable);
    let Some(stored) = existing else {
        let enrollment = EnrollmentInfo::new(&request.owner, request.ownership, initial, at)?;
        return Ok(EnrollmentPlan::Create(Device {
            id: DeviceId::new(),
            tenant: tenant.clone(),
            identifier: request.identifier.clone(),
            name: request.display_name(),
            description: request.description.clone(),
            properties: request.properties.clone(),
            enrollment,
        }));
    };

    let mut device = stored.clone();
    refresh_attributes(&mut device, request);

    if stored.enrollment.status.is_terminal() {
        let previous = stored.enrollment.clone();
        device.enrollment = EnrollmentInfo::new(&request.owner, request.ownership, initial, at)?;
        return Ok(EnrollmentPlan::Renew { device, previous });
    }

    if stored
        .enrollment
        .same_enrollment(&request.owner, request.ownership)
    {
        device.enrollment.date_of_last_update = at;
        return Ok(EnrollmentPlan::Resubmit(device));
    }

    let mut previous = stored.enrollment.clone();
    previous.status = EnrollmentStatus::Inactive;
    previous.date_of_last_update = at;
    device.enrollment = EnrollmentInfo::new(&request.owner, request.ownership, initial, at)?;
    Ok(EnrollmentPlan::Reassign { device, previous })
}

/// Apply a modification request to the current enrollment in place.
///
/// Unlike [`plan_enrollment`], owner and ownership are rewritten on the
/// existing enrollment row; no new row is created.
pub fn apply_modification(
    device: &mut Device,
    request: &EnrollmentRequest,
    at: Timestamp,
) -> Result<(), EnrollmentError> {
    if request.owner.trim().is_empty() {
        return Err(EnrollmentError::MissingOwner);
    }
    if device.enrollment.status.is_terminal() {
        return Err(EnrollmentError::AlreadyRemoved {
            device: device.identifier.to_string(),
        });
    }
    refresh_attributes(device, request);
    device.enrollment.owner = request.owner.clone();
    device.enrollment.ownership = request.ownership;
    device.enrollment.date_of_last_update = at;
    Ok(())
}

fn refresh_attributes(device: &mut Device, request: &EnrollmentRequest) {
    device.name = request.display_name();
    device.description = request.description.clone();
    device.properties = request.properties.clone();
}
