//! Device list filters.
//!
//! Every device query (`ListByStatus`, `ListByUser`, `ListByType`,
//! `ListByName`) is a [`DeviceFilter`] with one field set. Fields combine
//! with AND.

use serde::{Deserialize, Serialize};

use fleet_core::DeviceType;

use crate::device::{Device, EnrollmentStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFilter {
    #[serde(default, rename = "type")]
    pub device_type: Option<DeviceType>,
    #[serde(default)]
    pub status: Option<EnrollmentStatus>,
    /// Exact owner username.
    #[serde(default)]
    pub owner: Option<String>,
    /// Case-insensitive substring of the device name.
    #[serde(default)]
    pub name: Option<String>,
}

impl DeviceFilter {
    pub fn by_status(status: EnrollmentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn by_owner(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            ..Self::default()
        }
    }

    pub fn by_type(device_type: DeviceType) -> Self {
        Self {
            device_type: Some(device_type),
            ..Self::default()
        }
    }

    pub fn by_name(fragment: impl Into<String>) -> Self {
        Self {
            name: Some(fragment.into()),
            ..Self::default()
        }
    }

    /// Whether `device` passes every set field.
    pub fn matches(&self, device: &Device) -> bool {
        if let Some(t) = &self.device_type {
            if &device.identifier.device_type != t {
                return false;
            }
        }
        if let Some(status) = self.status {
            if device.enrollment.status != status {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if &device.enrollment.owner != owner {
                return false;
            }
        }
        if let Some(fragment) = &self.name {
            let needle = fragment.to_lowercase();
            if !device.name.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{EnrollmentInfo, OwnershipType};
    use fleet_core::{DeviceId, DeviceIdentifier, TenantId, Timestamp};

    fn device(kind: &str, owner: &str, name: &str) -> Device {
        Device {
            id: DeviceId::new(),
            tenant: TenantId::new("acme").unwrap(),
            identifier: DeviceIdentifier::new("x", DeviceType::new(kind).unwrap()).unwrap(),
            name: name.to_string(),
            description: None,
            properties: Default::default(),
            enrollment: EnrollmentInfo::new(
                owner,
                OwnershipType::Byod,
                EnrollmentStatus::Active,
                Timestamp::now(),
            )
            .unwrap(),
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(DeviceFilter::default().matches(&device("ios", "a", "n")));
    }

    #[test]
    fn test_fields_combine_with_and() {
        let d = device("android", "alice", "Alice's Pixel");
        let mut f = DeviceFilter::by_owner("alice");
        f.device_type = Some(DeviceType::new("android").unwrap());
        assert!(f.matches(&d));
        f.status = Some(EnrollmentStatus::Removed);
        assert!(!f.matches(&d));
    }

    #[test]
    fn test_name_is_case_insensitive_substring() {
        let d = device("android", "alice", "Alice's Pixel");
        assert!(DeviceFilter::by_name("pixel").matches(&d));
        assert!(!DeviceFilter::by_name("galaxy").matches(&d));
    }
}
