//! # Policy Snapshot Codec
//!
//! The effective-policy cache stores an immutable copy of the winning
//! policy as it was at resolution time. The copy is a versioned envelope
//! canonicalized with JCS:
//!
//! ```json
//! {"policy":{...},"version":1}
//! ```
//!
//! Canonical encoding means the same policy always encodes to the same
//! bytes, so an unchanged resolution can be detected by byte comparison.
//! Decoding ignores unknown fields and rejects envelopes whose version is
//! newer than [`SNAPSHOT_VERSION`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fleet_core::{sha256_digest, CanonicalBytes, CanonicalizationError, FleetError, PolicyId};
use fleet_state::OwnershipType;

use crate::model::{ComplianceMode, Policy, Profile};
use crate::scope::ScopeKind;

/// Current envelope version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// The policy fields frozen into an effective-policy record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub policy_id: PolicyId,
    pub name: String,
    pub priority: u32,
    pub compliance: ComplianceMode,
    #[serde(default)]
    pub ownership_type: Option<OwnershipType>,
    pub profile: Profile,
    /// The scope through which the policy reached the device.
    pub scope: ScopeKind,
}

impl PolicySnapshot {
    /// Freeze `policy` as reached through `scope`.
    pub fn of(policy: &Policy, scope: ScopeKind) -> Self {
        Self {
            policy_id: policy.id,
            name: policy.name.clone(),
            priority: policy.priority,
            compliance: policy.compliance,
            ownership_type: policy.ownership_type,
            profile: policy.profile.clone(),
            scope,
        }
    }

    /// Encode as canonical envelope bytes.
    pub fn encode(&self) -> Result<CanonicalBytes, SnapshotError> {
        Ok(CanonicalBytes::new(&Envelope {
            version: SNAPSHOT_VERSION,
            policy: self,
        })?)
    }

    /// Encode and fingerprint in one step. Returns the raw bytes and the
    /// hex SHA-256 digest.
    pub fn encode_with_digest(&self) -> Result<(Vec<u8>, String), SnapshotError> {
        let canonical = self.encode()?;
        let digest = sha256_digest(&canonical).to_hex();
        Ok((canonical.into_bytes(), digest))
    }

    /// Decode envelope bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let envelope: Envelope<PolicySnapshot> =
            serde_json::from_slice(bytes).map_err(|e| SnapshotError::Malformed(e.to_string()))?;
        if envelope.version == 0 || envelope.version > SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope.policy)
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    policy: T,
}

/// Errors raised while encoding or decoding snapshots.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot canonicalization failed: {0}")]
    Canonicalization(#[from] CanonicalizationError),

    #[error("malformed snapshot: {0}")]
    Malformed(String),

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

impl From<SnapshotError> for FleetError {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::Canonicalization(inner) => inner.into(),
            other => FleetError::Persistence(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProfileFeature;
    use fleet_core::{DeviceType, ProfileId};

    fn snapshot() -> PolicySnapshot {
        PolicySnapshot {
            policy_id: PolicyId::new(),
            name: "baseline".to_string(),
            priority: 2,
            compliance: ComplianceMode::Warn,
            ownership_type: Some(OwnershipType::Cope),
            profile: Profile {
                id: ProfileId::new(),
                name: "baseline".to_string(),
                device_type: DeviceType::new("ios").unwrap(),
                features: vec![ProfileFeature {
                    code: "PASSCODE".to_string(),
                    content: serde_json::json!({"min_length": 6, "alnum": true}),
                }],
            },
            scope: ScopeKind::Role,
        }
    }

    #[test]
    fn test_encode_is_versioned_envelope() {
        let bytes = snapshot().encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(bytes.as_bytes()).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["policy"]["compliance"], "WARN");
        assert_eq!(value["policy"]["scope"], "role");
    }

    #[test]
    fn test_encoding_is_stable() {
        let s = snapshot();
        let (a, digest_a) = s.encode_with_digest().unwrap();
        let (b, digest_b) = s.clone().encode_with_digest().unwrap();
        assert_eq!(a, b);
        assert_eq!(digest_a, digest_b);
        assert_eq!(PolicySnapshot::decode(&a).unwrap(), s);
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let s = snapshot();
        let mut value: serde_json::Value =
            serde_json::from_slice(s.encode().unwrap().as_bytes()).unwrap();
        value["policy"]["future_field"] = serde_json::json!("ignored");
        value["annotations"] = serde_json::json!({});
        let bytes = serde_json::to_vec(&value).unwrap();
        assert_eq!(PolicySnapshot::decode(&bytes).unwrap(), s);
    }

    #[test]
    fn test_decode_rejects_future_version() {
        let s = snapshot();
        let mut value: serde_json::Value =
            serde_json::from_slice(s.encode().unwrap().as_bytes()).unwrap();
        value["version"] = serde_json::json!(2);
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            PolicySnapshot::decode(&bytes),
            Err(SnapshotError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            PolicySnapshot::decode(b"not json"),
            Err(SnapshotError::Malformed(_))
        ));
    }
}
