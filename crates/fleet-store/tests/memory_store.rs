//! Transactional behaviour of the in-memory store.
//!
//! Every multi-row write is driven into an injected fault part-way through
//! and then checked for full rollback.

use fleet_core::{DeviceId, DeviceIdentifier, DeviceType, FleetError, LeaseId, PolicyId, TenantId, Timestamp};
use fleet_policy::{
    ClaimRequest, CompleteOutcome, ComplianceMode, EffectivePolicyWrite, ExpectedRevision,
    LedgerKey, Policy, PolicyScope, PolicySnapshot, PriorityChange, Profile, PutOutcome,
    ScopeKind,
};
use fleet_state::{Device, EnrollmentInfo, EnrollmentStatus, OwnershipType};
use fleet_store::{CandidateQuery, FaultPoint, FleetStore, MemoryStore};

fn tenant() -> TenantId {
    TenantId::new("acme").unwrap()
}

fn android() -> DeviceType {
    DeviceType::new("android").unwrap()
}

fn at(secs: i64) -> Timestamp {
    Timestamp::from_epoch_secs(1_800_000_000 + secs).unwrap()
}

fn device(id: &str) -> Device {
    Device {
        id: DeviceId::new(),
        tenant: tenant(),
        identifier: DeviceIdentifier::new(id, android()).unwrap(),
        name: id.to_string(),
        description: None,
        properties: Default::default(),
        enrollment: EnrollmentInfo::new("alice", OwnershipType::Byod, EnrollmentStatus::Active, at(0))
            .unwrap(),
    }
}

fn policy(name: &str) -> Policy {
    Policy {
        id: PolicyId::new(),
        tenant: tenant(),
        name: name.to_string(),
        profile: Profile {
            id: Default::default(),
            name: name.to_string(),
            device_type: android(),
            features: vec![],
        },
        priority: 0,
        compliance: ComplianceMode::Enforce,
        ownership_type: None,
        active: true,
        updated: false,
        created_at: at(0),
        updated_at: at(0),
    }
}

fn claim_request(limit: usize, now: Timestamp) -> ClaimRequest {
    ClaimRequest {
        worker: "worker-1".to_string(),
        lease: LeaseId::new(),
        expires_at: now.plus(std::time::Duration::from_secs(60)),
        now,
        limit,
    }
}

fn reassigned(device: &Device, owner: &str, secs: i64) -> (Device, EnrollmentInfo) {
    let mut previous = device.enrollment.clone();
    previous.status = EnrollmentStatus::Inactive;
    previous.date_of_last_update = at(secs);
    let mut moved = device.clone();
    moved.enrollment =
        EnrollmentInfo::new(owner, OwnershipType::Cope, EnrollmentStatus::Active, at(secs)).unwrap();
    (moved, previous)
}

// ── Devices ──────────────────────────────────────────────────────────

#[tokio::test]
async fn save_device_rolls_back_on_fault() {
    let store = MemoryStore::new();
    let t = tenant();
    let d = device("imei-1");
    store.create_device(&t, &d).await.unwrap();

    let mut changed = d.clone();
    changed.name = "renamed".to_string();
    changed.enrollment.status = EnrollmentStatus::Inactive;
    changed.enrollment.date_of_last_update = at(10);
    // The device row is written, the enrollment row is not.
    store.inject_fault(FaultPoint::AfterWrites(1));
    let err = store.save_device(&t, &changed).await.unwrap_err();
    assert!(matches!(err, FleetError::Persistence(_)));

    let stored = store.get_device_by_id(&t, d.id).await.unwrap().unwrap();
    assert_eq!(stored.name, "imei-1");
    assert_eq!(stored.enrollment, d.enrollment);
    let history = store.enrollment_history(&t, d.id).await.unwrap();
    assert_eq!(history, vec![d.enrollment.clone()]);
}

#[tokio::test]
async fn switch_enrollment_rolls_back_on_fault() {
    let store = MemoryStore::new();
    let t = tenant();
    let d = device("imei-1");
    store.create_device(&t, &d).await.unwrap();
    let (moved, previous) = reassigned(&d, "bob", 10);

    // 0: nothing written. 1: previous row rewritten. 2: new row inserted too.
    for n in [0, 1, 2] {
        store.inject_fault(FaultPoint::AfterWrites(n));
        let err = store.switch_enrollment(&t, &moved, &previous).await.unwrap_err();
        assert!(matches!(err, FleetError::Persistence(_)), "fault at write {n}");

        let stored = store.get_device_by_id(&t, d.id).await.unwrap().unwrap();
        assert_eq!(stored.enrollment, d.enrollment, "fault at write {n}");
        let history = store.enrollment_history(&t, d.id).await.unwrap();
        assert_eq!(history, vec![d.enrollment.clone()], "fault at write {n}");
    }

    store.switch_enrollment(&t, &moved, &previous).await.unwrap();
    let history = store.enrollment_history(&t, d.id).await.unwrap();
    assert_eq!(history, vec![previous, moved.enrollment]);
}

#[tokio::test]
async fn reassignments_from_the_same_read_conflict() {
    let store = MemoryStore::new();
    let t = tenant();
    let d = device("imei-1");
    store.create_device(&t, &d).await.unwrap();

    // Both writers planned against the same snapshot of `d`.
    let (to_bob, previous_bob) = reassigned(&d, "bob", 10);
    let (to_carol, previous_carol) = reassigned(&d, "carol", 11);
    store.switch_enrollment(&t, &to_bob, &previous_bob).await.unwrap();
    let err = store
        .switch_enrollment(&t, &to_carol, &previous_carol)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Conflict(_)));

    let history = store.enrollment_history(&t, d.id).await.unwrap();
    assert_eq!(history.len(), 2);
    let active: Vec<&EnrollmentInfo> = history
        .iter()
        .filter(|e| e.status == EnrollmentStatus::Active)
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].owner, "bob");
    let stored = store.get_device_by_id(&t, d.id).await.unwrap().unwrap();
    assert_eq!(stored.enrollment.id, to_bob.enrollment.id);

    // A save still carrying the superseded enrollment is stale too.
    let mut stale = d.clone();
    stale.name = "renamed".to_string();
    let err = store.save_device(&t, &stale).await.unwrap_err();
    assert!(matches!(err, FleetError::Conflict(_)));
}

#[tokio::test]
async fn stale_save_cannot_revive_a_disenrolled_device() {
    let store = MemoryStore::new();
    let t = tenant();
    let d = device("imei-1");
    store.create_device(&t, &d).await.unwrap();

    let mut removed = d.clone();
    removed.enrollment.status = EnrollmentStatus::Removed;
    removed.enrollment.date_of_last_update = at(10);
    store.save_device(&t, &removed).await.unwrap();

    // Read before the disenroll, written after it.
    let mut stale = d.clone();
    stale.enrollment.status = EnrollmentStatus::Inactive;
    stale.enrollment.date_of_last_update = at(11);
    let err = store.save_device(&t, &stale).await.unwrap_err();
    assert!(matches!(err, FleetError::Conflict(_)));

    let stored = store.get_device_by_id(&t, d.id).await.unwrap().unwrap();
    assert_eq!(stored.enrollment.status, EnrollmentStatus::Removed);
    let history = store.enrollment_history(&t, d.id).await.unwrap();
    assert_eq!(history[0].status, EnrollmentStatus::Removed);

    // Saving the terminal state again is not a conflict.
    store.save_device(&t, &removed).await.unwrap();
}

// ── Policies ─────────────────────────────────────────────────────────

#[tokio::test]
async fn priorities_are_assigned_in_creation_order() {
    let store = MemoryStore::new();
    let t = tenant();
    let a = store.create_policy(&t, policy("a")).await.unwrap();
    let b = store.create_policy(&t, policy("b")).await.unwrap();
    let c = store.create_policy(&t, policy("c")).await.unwrap();
    assert_eq!((a.priority, b.priority, c.priority), (1, 2, 3));

    store.delete_policy(&t, b.id, at(1)).await.unwrap();
    let d = store.create_policy(&t, policy("d")).await.unwrap();
    assert_eq!(d.priority, 4);
}

#[tokio::test]
async fn delete_cascade_rolls_back_on_fault() {
    let store = MemoryStore::new();
    let t = tenant();
    let d1 = device("imei-1");
    store.create_device(&t, &d1).await.unwrap();
    let p = store.create_policy(&t, policy("baseline")).await.unwrap();
    let scopes = vec![
        PolicyScope::Device(d1.id),
        PolicyScope::User("alice".into()),
        PolicyScope::DeviceType(android()),
    ];
    assert_eq!(store.assign_scopes(&t, p.id, &scopes, at(1)).await.unwrap(), 3);

    // Fail after two of the three scope rows are gone.
    store.inject_fault(FaultPoint::AfterWrites(2));
    let err = store.delete_policy(&t, p.id, at(2)).await.unwrap_err();
    assert!(matches!(err, FleetError::Persistence(_)));
    assert!(store.get_policy(&t, p.id).await.unwrap().is_some());
    assert_eq!(store.policy_scopes(&t, p.id).await.unwrap().len(), 3);

    store.delete_policy(&t, p.id, at(3)).await.unwrap();
    assert!(store.get_policy(&t, p.id).await.unwrap().is_none());
    let remaining = store
        .policies_with_scope(&t, &PolicyScope::Device(d1.id))
        .await
        .unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn reorder_rolls_back_on_fault() {
    let store = MemoryStore::new();
    let t = tenant();
    let a = store.create_policy(&t, policy("a")).await.unwrap();
    let b = store.create_policy(&t, policy("b")).await.unwrap();
    let swap = [
        PriorityChange { policy_id: a.id, priority: 2 },
        PriorityChange { policy_id: b.id, priority: 1 },
    ];

    store.inject_fault(FaultPoint::AfterWrites(1));
    assert!(store.update_priorities(&t, &swap, at(1)).await.is_err());
    assert_eq!(store.get_policy(&t, a.id).await.unwrap().unwrap().priority, 1);
    assert_eq!(store.get_policy(&t, b.id).await.unwrap().unwrap().priority, 2);

    let touched = store.update_priorities(&t, &swap, at(2)).await.unwrap();
    assert_eq!(touched.len(), 2);
    assert!(touched.iter().all(|p| p.updated));
    let order: Vec<PolicyId> = store
        .list_policies(&t)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(order, vec![b.id, a.id]);
}

#[tokio::test]
async fn reorder_collision_is_conflict() {
    let store = MemoryStore::new();
    let t = tenant();
    let a = store.create_policy(&t, policy("a")).await.unwrap();
    store.create_policy(&t, policy("b")).await.unwrap();
    let err = store
        .update_priorities(&t, &[PriorityChange { policy_id: a.id, priority: 2 }], at(1))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Conflict(_)));
}

#[tokio::test]
async fn reassigning_existing_scopes_is_a_no_op() {
    let store = MemoryStore::new();
    let t = tenant();
    let p = store.create_policy(&t, policy("baseline")).await.unwrap();
    store.clear_ledger(&t).await.unwrap();

    let scopes = [PolicyScope::Role("admins".into()), PolicyScope::Role("admins".into())];
    assert_eq!(store.assign_scopes(&t, p.id, &scopes, at(1)).await.unwrap(), 1);
    assert_eq!(store.list_ledger(&t).await.unwrap().len(), 1);
    store.clear_ledger(&t).await.unwrap();

    assert_eq!(store.assign_scopes(&t, p.id, &scopes, at(2)).await.unwrap(), 0);
    assert!(store.list_ledger(&t).await.unwrap().is_empty());
}

#[tokio::test]
async fn assigning_unknown_device_is_not_found() {
    let store = MemoryStore::new();
    let t = tenant();
    let p = store.create_policy(&t, policy("baseline")).await.unwrap();
    let err = store
        .assign_scopes(&t, p.id, &[PolicyScope::Device(DeviceId::new())], at(1))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::NotFound { kind: "device", .. }));
}

#[tokio::test]
async fn candidates_report_every_reaching_scope() {
    let store = MemoryStore::new();
    let t = tenant();
    let d1 = device("imei-1");
    store.create_device(&t, &d1).await.unwrap();
    let p = store.create_policy(&t, policy("baseline")).await.unwrap();
    let scopes = [
        PolicyScope::Device(d1.id),
        PolicyScope::Role("ops".into()),
        PolicyScope::DeviceType(android()),
    ];
    store.assign_scopes(&t, p.id, &scopes, at(1)).await.unwrap();

    let roles = vec!["ops".to_string()];
    let query = CandidateQuery {
        device_id: d1.id,
        device_type: &d1.identifier.device_type,
        user: "alice",
        roles: &roles,
    };
    let mut kinds: Vec<ScopeKind> = store
        .candidates(&t, &query)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.scope)
        .collect();
    kinds.sort_by_key(ScopeKind::rank);
    assert_eq!(kinds, vec![ScopeKind::Device, ScopeKind::Role, ScopeKind::DeviceType]);
}

// ── Effective cache ──────────────────────────────────────────────────

#[tokio::test]
async fn put_effective_checks_revision_and_skips_identical_bytes() {
    let store = MemoryStore::new();
    let t = tenant();
    let d1 = device("imei-1");
    store.create_device(&t, &d1).await.unwrap();
    let p = store.create_policy(&t, policy("baseline")).await.unwrap();
    let write = EffectivePolicyWrite::new(d1.id, &PolicySnapshot::of(&p, ScopeKind::Device)).unwrap();

    let (outcome, first) = store
        .put_effective(&t, write.clone(), ExpectedRevision::Absent, at(1))
        .await
        .unwrap();
    assert_eq!(outcome, PutOutcome::Inserted);
    assert_eq!(first.revision, 1);

    let err = store
        .put_effective(&t, write.clone(), ExpectedRevision::Absent, at(2))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Conflict(_)));

    store.mark_applied(&t, d1.id, at(3)).await.unwrap();
    let (outcome, same) = store
        .put_effective(&t, write, ExpectedRevision::At(1), at(4))
        .await
        .unwrap();
    assert_eq!(outcome, PutOutcome::Unchanged);
    assert!(same.applied);
    assert_eq!(same.updated_time, at(1));

    let renamed = Policy { name: "renamed".into(), ..p };
    let write = EffectivePolicyWrite::new(d1.id, &PolicySnapshot::of(&renamed, ScopeKind::Device)).unwrap();
    let (outcome, updated) = store
        .put_effective(&t, write, ExpectedRevision::At(1), at(5))
        .await
        .unwrap();
    assert_eq!(outcome, PutOutcome::Updated);
    assert_eq!(updated.revision, 2);
    assert!(!updated.applied);
    assert_eq!(updated.created_time, at(1));
}

#[tokio::test]
async fn mark_applied_is_idempotent() {
    let store = MemoryStore::new();
    let t = tenant();
    let d1 = device("imei-1");
    store.create_device(&t, &d1).await.unwrap();
    let p = store.create_policy(&t, policy("baseline")).await.unwrap();
    let write = EffectivePolicyWrite::new(d1.id, &PolicySnapshot::of(&p, ScopeKind::DeviceType)).unwrap();
    store.put_effective(&t, write, ExpectedRevision::Any, at(1)).await.unwrap();

    let first = store.mark_applied(&t, d1.id, at(2)).await.unwrap();
    let second = store.mark_applied(&t, d1.id, at(3)).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(second.applied_time, Some(at(2)));
    assert_eq!(second.revision, 1);

    let err = store.mark_applied(&t, DeviceId::new(), at(4)).await.unwrap_err();
    assert!(matches!(err, FleetError::NotFound { .. }));
}

// ── Ledger ───────────────────────────────────────────────────────────

#[tokio::test]
async fn claimed_entries_are_not_handed_out_twice() {
    let store = MemoryStore::new();
    let t = tenant();
    let key = LedgerKey { policy_id: PolicyId::new(), device_type: android() };
    store.mark_dirty(&t, &[key.clone()], at(0)).await.unwrap();

    let first = store.claim_dirty(&t, &claim_request(10, at(1))).await.unwrap();
    assert_eq!(first.len(), 1);
    let second = store.claim_dirty(&t, &claim_request(10, at(2))).await.unwrap();
    assert!(second.is_empty());

    // After the lease expires the entry is claimable again and the stale
    // lease can no longer complete it.
    let third = store.claim_dirty(&t, &claim_request(10, at(120))).await.unwrap();
    assert_eq!(third.len(), 1);
    assert_eq!(
        store.complete_claim(&t, &first[0]).await.unwrap(),
        CompleteOutcome::LeaseLost
    );
    assert_eq!(
        store.complete_claim(&t, &third[0]).await.unwrap(),
        CompleteOutcome::Cleared
    );
    assert!(store.list_ledger(&t).await.unwrap().is_empty());
}

#[tokio::test]
async fn remark_during_claim_keeps_entry_dirty() {
    let store = MemoryStore::new();
    let t = tenant();
    let key = LedgerKey { policy_id: PolicyId::new(), device_type: android() };
    store.mark_dirty(&t, &[key.clone()], at(0)).await.unwrap();
    let claimed = store.claim_dirty(&t, &claim_request(10, at(1))).await.unwrap();

    store.mark_dirty(&t, &[key.clone()], at(2)).await.unwrap();
    assert_eq!(
        store.complete_claim(&t, &claimed[0]).await.unwrap(),
        CompleteOutcome::StillDirty
    );
    let entries = store.list_ledger(&t).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].generation, 2);
    assert!(entries[0].lease.is_none());
}

#[tokio::test]
async fn release_returns_entry_unprocessed() {
    let store = MemoryStore::new();
    let t = tenant();
    let key = LedgerKey { policy_id: PolicyId::new(), device_type: android() };
    store.mark_dirty(&t, &[key], at(0)).await.unwrap();
    let claimed = store.claim_dirty(&t, &claim_request(1, at(1))).await.unwrap();
    assert!(store.release_claim(&t, &claimed[0]).await.unwrap());
    assert!(!store.release_claim(&t, &claimed[0]).await.unwrap());
    assert_eq!(store.claim_dirty(&t, &claim_request(1, at(2))).await.unwrap().len(), 1);
}

#[tokio::test]
async fn policy_writes_mark_the_ledger() {
    let store = MemoryStore::new();
    let t = tenant();
    let p = store.create_policy(&t, policy("baseline")).await.unwrap();
    store.set_policy_active(&t, p.id, false, at(1)).await.unwrap();
    let entries = store.list_ledger(&t).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key.policy_id, p.id);
    assert_eq!(entries[0].generation, 2);

    // A failed write leaves the ledger untouched.
    store.inject_fault(FaultPoint::AfterWrites(1));
    assert!(store.set_policy_active(&t, p.id, true, at(2)).await.is_err());
    assert_eq!(store.list_ledger(&t).await.unwrap()[0].generation, 2);
    assert!(!store.get_policy(&t, p.id).await.unwrap().unwrap().active);
}

// ── Tenants ──────────────────────────────────────────────────────────

#[tokio::test]
async fn tenants_do_not_see_each_other() {
    let store = MemoryStore::new();
    let (a, b) = (TenantId::new("alpha").unwrap(), TenantId::new("beta").unwrap());
    let p = store.create_policy(&a, policy("baseline")).await.unwrap();
    assert!(store.get_policy(&b, p.id).await.unwrap().is_none());
    assert_eq!(store.count_policies(&b).await.unwrap(), 0);
    assert!(store.list_ledger(&b).await.unwrap().is_empty());

    // Priorities are allocated per tenant.
    let q = store.create_policy(&b, policy("baseline")).await.unwrap();
    assert_eq!(q.priority, 1);
    assert_eq!(q.tenant, b);
}
