//! # Change Ledger Records
//!
//! A ledger entry marks `(policy, device type)` in a tenant as dirty: every
//! device of that type must be re-resolved. Entries are claimed under a
//! lease so that concurrent recomputation workers never process the same
//! entry twice, and an expired lease makes the entry claimable again.
//!
//! ## Generations
//!
//! Re-marking an entry that is already dirty collapses into the existing
//! entry but bumps its `generation`. Completing a claim removes the entry
//! only if the generation is still the one that was claimed; otherwise the
//! entry stays dirty (lease released) so the newer edit is picked up by the
//! next pass.

use serde::{Deserialize, Serialize};

use fleet_core::{DeviceType, LeaseId, PolicyId, TenantId, Timestamp};

/// Key of a ledger entry within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    pub policy_id: PolicyId,
    pub device_type: DeviceType,
}

/// A lease held by a recomputation worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub worker: String,
    pub expires_at: Timestamp,
}

/// A dirty ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub tenant: TenantId,
    pub key: LedgerKey,
    pub generation: u64,
    pub marked_at: Timestamp,
    pub lease: Option<Lease>,
}

impl LedgerEntry {
    /// A freshly marked entry.
    pub fn new(tenant: TenantId, key: LedgerKey, at: Timestamp) -> Self {
        Self {
            tenant,
            key,
            generation: 1,
            marked_at: at,
            lease: None,
        }
    }

    /// Record another change against an existing entry.
    pub fn remark(&mut self, at: Timestamp) {
        self.generation += 1;
        self.marked_at = at;
    }

    /// Whether the entry can be claimed at `now`.
    pub fn is_claimable(&self, now: Timestamp) -> bool {
        self.lease.as_ref().map_or(true, |lease| lease.expires_at <= now)
    }

    /// Whether `lease` is the lease currently held on this entry.
    pub fn is_held_by(&self, lease: LeaseId) -> bool {
        self.lease.as_ref().is_some_and(|l| l.id == lease)
    }
}

/// An entry handed to one worker by a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedEntry {
    pub tenant: TenantId,
    pub key: LedgerKey,
    /// Generation at claim time.
    pub generation: u64,
    pub lease: LeaseId,
}

/// Parameters of a claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub worker: String,
    pub lease: LeaseId,
    pub expires_at: Timestamp,
    pub now: Timestamp,
    pub limit: usize,
}

/// What completing a claimed entry did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompleteOutcome {
    /// The entry was removed.
    Cleared,
    /// The entry was re-marked after the claim and stays dirty.
    StillDirty,
    /// The lease was lost (expired and re-claimed, or entry gone).
    LeaseLost,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> LedgerEntry {
        LedgerEntry::new(
            TenantId::new("acme").unwrap(),
            LedgerKey {
                policy_id: PolicyId::new(),
                device_type: DeviceType::new("android").unwrap(),
            },
            Timestamp::parse("2026-01-01T00:00:00Z").unwrap(),
        )
    }

    #[test]
    fn test_remark_bumps_generation() {
        let mut e = entry();
        e.remark(Timestamp::now());
        e.remark(Timestamp::now());
        assert_eq!(e.generation, 3);
    }

    #[test]
    fn test_lease_expiry_makes_claimable() {
        let mut e = entry();
        let now = Timestamp::parse("2026-01-01T00:10:00Z").unwrap();
        assert!(e.is_claimable(now));
        let lease = LeaseId::new();
        e.lease = Some(Lease {
            id: lease,
            worker: "w1".to_string(),
            expires_at: Timestamp::parse("2026-01-01T00:11:00Z").unwrap(),
        });
        assert!(!e.is_claimable(now));
        assert!(e.is_claimable(Timestamp::parse("2026-01-01T00:11:00Z").unwrap()));
        assert!(e.is_held_by(lease));
        assert!(!e.is_held_by(LeaseId::new()));
    }
}
