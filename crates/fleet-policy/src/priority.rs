//! Tenant-unique priority allocation and bulk reordering checks.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use fleet_core::PolicyId;

use crate::model::PolicyError;

/// One entry of a bulk reordering request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityChange {
    pub policy_id: PolicyId,
    pub priority: u32,
}

/// Priority for a newly created policy: one past the current maximum, or 1
/// for a tenant's first policy.
pub fn next_priority(existing: impl IntoIterator<Item = u32>) -> u32 {
    existing.into_iter().max().map_or(1, |max| max.saturating_add(1))
}

/// Check a reordering request against the tenant's current priorities.
///
/// `current` holds every policy of the tenant. The request must name each
/// policy at most once, use distinct priorities ≥ 1, and not take a
/// priority held by a policy it does not move. Unknown policy ids are the
/// caller's concern.
pub fn check_reorder(
    changes: &[PriorityChange],
    current: &BTreeMap<PolicyId, u32>,
) -> Result<(), PolicyError> {
    let mut moved = BTreeSet::new();
    let mut claimed = BTreeSet::new();
    for change in changes {
        if change.priority == 0 {
            return Err(PolicyError::InvalidPriority(0));
        }
        if !moved.insert(change.policy_id) {
            return Err(PolicyError::DuplicatePolicy(change.policy_id));
        }
        if !claimed.insert(change.priority) {
            return Err(PolicyError::DuplicatePriority(change.priority));
        }
    }
    for (id, priority) in current {
        if !moved.contains(id) && claimed.contains(priority) {
            return Err(PolicyError::PriorityCollision {
                priority: *priority,
                holder: *id,
            });
        }
    }
    Ok(())
}
