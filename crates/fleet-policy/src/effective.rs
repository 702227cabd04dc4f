//! Effective-policy records: the cached resolution result per device.

use serde::{Deserialize, Serialize};

use fleet_core::{DeviceId, FleetError, PolicyId, Timestamp};

use crate::snapshot::{PolicySnapshot, SnapshotError};

/// The resolved policy of one device. At most one per device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivePolicyRecord {
    pub device_id: DeviceId,
    pub policy_id: PolicyId,
    /// Canonical snapshot envelope bytes.
    pub snapshot: Vec<u8>,
    /// Hex SHA-256 of `snapshot`.
    pub snapshot_digest: String,
    pub created_time: Timestamp,
    pub updated_time: Timestamp,
    /// Whether the device confirmed receipt of this snapshot.
    pub applied: bool,
    pub applied_time: Option<Timestamp>,
    /// Bumped on every write. Used for optimistic concurrency.
    pub revision: u64,
}

impl EffectivePolicyRecord {
    /// Decode the stored snapshot.
    pub fn decode_snapshot(&self) -> Result<PolicySnapshot, SnapshotError> {
        PolicySnapshot::decode(&self.snapshot)
    }
}

/// A record write prepared from a fresh resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePolicyWrite {
    pub device_id: DeviceId,
    pub policy_id: PolicyId,
    pub snapshot: Vec<u8>,
    pub snapshot_digest: String,
}

impl EffectivePolicyWrite {
    /// Encode `snapshot` for `device_id`.
    pub fn new(device_id: DeviceId, snapshot: &PolicySnapshot) -> Result<Self, SnapshotError> {
        let (bytes, digest) = snapshot.encode_with_digest()?;
        Ok(Self {
            device_id,
            policy_id: snapshot.policy_id,
            snapshot: bytes,
            snapshot_digest: digest,
        })
    }

    /// Whether writing this over `existing` would change nothing.
    pub fn is_unchanged(&self, existing: &EffectivePolicyRecord) -> bool {
        existing.policy_id == self.policy_id && existing.snapshot == self.snapshot
    }

    /// The record produced by inserting this write.
    pub fn into_new_record(self, at: Timestamp) -> EffectivePolicyRecord {
        EffectivePolicyRecord {
            device_id: self.device_id,
            policy_id: self.policy_id,
            snapshot: self.snapshot,
            snapshot_digest: self.snapshot_digest,
            created_time: at,
            updated_time: at,
            applied: false,
            applied_time: None,
            revision: 1,
        }
    }

    /// Apply this write over `existing`, resetting the applied flag.
    pub fn apply_to(self, existing: &mut EffectivePolicyRecord, at: Timestamp) {
        existing.policy_id = self.policy_id;
        existing.snapshot = self.snapshot;
        existing.snapshot_digest = self.snapshot_digest;
        existing.updated_time = at;
        existing.applied = false;
        existing.applied_time = None;
        existing.revision += 1;
    }
}

/// The revision a writer read before resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedRevision {
    /// The writer saw no record.
    Absent,
    /// The writer saw the record at this revision.
    At(u64),
    /// No check.
    Any,
}

impl ExpectedRevision {
    /// The expectation matching what a reader saw.
    pub fn of(record: Option<&EffectivePolicyRecord>) -> Self {
        record.map_or(Self::Absent, |r| Self::At(r.revision))
    }

    /// Check the expectation against the stored state.
    pub fn check(
        &self,
        device_id: DeviceId,
        stored: Option<&EffectivePolicyRecord>,
    ) -> Result<(), FleetError> {
        let ok = match (self, stored) {
            (Self::Any, _) => true,
            (Self::Absent, None) => true,
            (Self::At(expected), Some(record)) => record.revision == *expected,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(FleetError::conflict(format!(
                "effective policy of {device_id} changed concurrently (expected {self:?}, found {:?})",
                stored.map(|r| r.revision)
            )))
        }
    }
}

/// What a put did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutOutcome {
    Inserted,
    Updated,
    /// The stored snapshot was byte-identical; nothing was written.
    Unchanged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ComplianceMode, Profile};
    use crate::scope::ScopeKind;
    use fleet_core::{DeviceType, ProfileId};

    fn snapshot(priority: u32) -> PolicySnapshot {
        PolicySnapshot {
            policy_id: PolicyId::new(),
            name: "p".to_string(),
            priority,
            compliance: ComplianceMode::Enforce,
            ownership_type: None,
            profile: Profile {
                id: ProfileId::new(),
                name: "p".to_string(),
                device_type: DeviceType::new("android").unwrap(),
                features: vec![],
            },
            scope: ScopeKind::DeviceType,
        }
    }

    #[test]
    fn test_insert_then_update_bumps_revision_and_resets_applied() {
        let device = DeviceId::new();
        let t0 = Timestamp::parse("2026-01-01T00:00:00Z").unwrap();
        let t1 = Timestamp::parse("2026-01-02T00:00:00Z").unwrap();
        let mut record = EffectivePolicyWrite::new(device, &snapshot(1))
            .unwrap()
            .into_new_record(t0);
        assert_eq!(record.revision, 1);
        record.applied = true;
        record.applied_time = Some(t0);

        let next = EffectivePolicyWrite::new(device, &snapshot(2)).unwrap();
        assert!(!next.is_unchanged(&record));
        next.apply_to(&mut record, t1);
        assert_eq!(record.revision, 2);
        assert!(!record.applied);
        assert_eq!(record.applied_time, None);
        assert_eq!(record.created_time, t0);
        assert_eq!(record.updated_time, t1);
    }

    #[test]
    fn test_identical_snapshot_is_unchanged() {
        let device = DeviceId::new();
        let s = snapshot(1);
        let record = EffectivePolicyWrite::new(device, &s)
            .unwrap()
            .into_new_record(Timestamp::now());
        assert!(EffectivePolicyWrite::new(device, &s).unwrap().is_unchanged(&record));
        assert_eq!(record.decode_snapshot().unwrap(), s);
    }

    #[test]
    fn test_expected_revision_checks() {
        let device = DeviceId::new();
        let record = EffectivePolicyWrite::new(device, &snapshot(1))
            .unwrap()
            .into_new_record(Timestamp::now());
        assert!(ExpectedRevision::Absent.check(device, None).is_ok());
        assert!(ExpectedRevision::Absent.check(device, Some(&record)).is_err());
        assert!(ExpectedRevision::At(1).check(device, Some(&record)).is_ok());
        let err = ExpectedRevision::At(0).check(device, Some(&record)).unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
        assert!(ExpectedRevision::At(1).check(device, None).is_err());
        assert!(ExpectedRevision::Any.check(device, None).is_ok());
        assert_eq!(ExpectedRevision::of(Some(&record)), ExpectedRevision::At(1));
    }
}
