//! # Effective Policy Selection
//!
//! Picks the single policy governing a device out of every policy reached
//! through its scopes.
//!
//! ## Ordering
//!
//! 1. Lower `priority` value wins.
//! 2. On equal priority, the more specific scope wins
//!    (Device > User > Role > DeviceType). A policy reached through several
//!    scopes counts at its most specific one.
//! 3. Policy id breaks any remaining tie, so the result never depends on
//!    candidate order.
//!
//! Inactive policies, policies for another device type and policies whose
//! ownership filter excludes the device are dropped before ordering.

use std::collections::BTreeMap;

use fleet_core::{DeviceType, PolicyId};
use fleet_state::OwnershipType;

use crate::model::Policy;
use crate::scope::ScopeKind;

/// A policy reached through one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub policy: Policy,
    pub scope: ScopeKind,
}

/// The device attributes selection depends on.
#[derive(Debug, Clone, Copy)]
pub struct Subject<'a> {
    pub device_type: &'a DeviceType,
    pub ownership: OwnershipType,
}

impl Candidate {
    fn eligible(&self, subject: &Subject<'_>) -> bool {
        self.policy.active
            && self.policy.device_type() == subject.device_type
            && self.policy.admits_ownership(subject.ownership)
    }

    fn order_key(&self) -> (u32, u8, PolicyId) {
        (self.policy.priority, self.scope.rank(), self.policy.id)
    }
}

/// Select the effective policy, or `None` if no candidate is eligible.
pub fn select_effective(
    subject: &Subject<'_>,
    candidates: impl IntoIterator<Item = Candidate>,
) -> Option<Candidate> {
    let mut best_scope: BTreeMap<PolicyId, Candidate> = BTreeMap::new();
    for candidate in candidates.into_iter().filter(|c| c.eligible(subject)) {
        match best_scope.get(&candidate.policy.id) {
            Some(existing) if existing.scope.rank() <= candidate.scope.rank() => {}
            _ => {
                best_scope.insert(candidate.policy.id, candidate);
            }
        }
    }
    best_scope.into_values().min_by_key(Candidate::order_key)
}
