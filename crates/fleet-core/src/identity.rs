//! # Identity Newtypes
//!
//! Newtype wrappers for every identifier in the engine. Surrogate keys
//! (`DeviceId`, `PolicyId`, ...) wrap a `Uuid`; externally supplied names
//! (`TenantId`, `DeviceType`) are validated strings.
//!
//! ## Tenant Isolation
//!
//! `TenantId` is the isolation boundary. It is accepted only in a
//! restricted alphabet (ASCII lowercase alphanumerics, `-`, `_`) so it can
//! be embedded in log fields and SQL parameters without escaping concerns.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FleetError;

const MAX_NAME_LEN: usize = 64;

macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Access the inner UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = FleetError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.strip_prefix(concat!($prefix, ":")).unwrap_or(s);
                Uuid::parse_str(raw).map(Self).map_err(|e| {
                    FleetError::Validation(format!(
                        concat!("invalid ", $prefix, " id {:?}: {}"),
                        s, e
                    ))
                })
            }
        }
    };
}

uuid_newtype!(
    /// Surrogate key of an enrolled device, stable across re-enrollments.
    DeviceId,
    "device"
);
uuid_newtype!(
    /// Unique identifier of a policy.
    PolicyId,
    "policy"
);
uuid_newtype!(
    /// Unique identifier of a feature profile.
    ProfileId,
    "profile"
);
uuid_newtype!(
    /// Unique identifier of one enrollment row.
    EnrollmentId,
    "enrollment"
);
uuid_newtype!(
    /// Lease token handed to a recomputation worker with a ledger claim.
    LeaseId,
    "lease"
);

/// Validate a name in the restricted identifier alphabet.
fn validate_name(value: &str, what: &str) -> Result<(), FleetError> {
    if value.is_empty() {
        return Err(FleetError::Validation(format!("{what} must not be empty")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(FleetError::Validation(format!(
            "{what} exceeds {MAX_NAME_LEN} characters: {value:?}"
        )));
    }
    let valid = value
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
    if !valid {
        return Err(FleetError::Validation(format!(
            "{what} must be lowercase alphanumeric with '-' or '_': {value:?}"
        )));
    }
    Ok(())
}

/// An isolated customer/organization boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Validate and wrap a tenant identifier.
    pub fn new(value: impl Into<String>) -> Result<Self, FleetError> {
        let value = value.into();
        validate_name(&value, "tenant id")?;
        Ok(Self(value))
    }

    /// The tenant identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantId {
    type Error = FleetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A device platform (`android`, `ios`, `windows`, ...).
///
/// Device types key the plugin registry and the change ledger, so they are
/// normalized to lowercase at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceType(String);

impl DeviceType {
    /// Normalize and validate a device type name.
    pub fn new(value: impl Into<String>) -> Result<Self, FleetError> {
        let value = value.into().trim().to_ascii_lowercase();
        validate_name(&value, "device type")?;
        Ok(Self(value))
    }

    /// The device type as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceType {
    type Error = FleetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceType> for String {
    fn from(value: DeviceType) -> Self {
        value.0
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The externally visible identity of a device: the platform-assigned
/// identifier plus its type. Unique within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIdentifier {
    /// Platform-assigned identifier (IMEI, UDID, serial, ...).
    pub id: String,
    /// Device type.
    #[serde(rename = "type")]
    pub device_type: DeviceType,
}

impl DeviceIdentifier {
    /// Build a device identifier, rejecting blank platform ids.
    pub fn new(id: impl Into<String>, device_type: DeviceType) -> Result<Self, FleetError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(FleetError::Validation(
                "device identifier must not be empty".to_string(),
            ));
        }
        Ok(Self { id, device_type })
    }
}

impl std::fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.device_type, self.id)
    }
}
