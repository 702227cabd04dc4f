//! End-to-end behaviour of the engine over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use fleet_core::{DeviceIdentifier, DeviceType, FleetError, PolicyId, ProfileId, TenantId};
use fleet_engine::{
    DeviceOutcome, DeviceTypePlugin, DirectoryError, EnrollAction, Engine, EngineConfig, PluginDevice,
    PluginError, StaticDirectory, UserDirectory,
};
use fleet_policy::{PolicyDraft, PolicyScope, PriorityChange, ProfileInput, ScopeKind};
use fleet_state::{EnrollmentRequest, EnrollmentStatus, OwnershipType};
use fleet_store::MemoryStore;

fn tenant() -> TenantId {
    TenantId::new("acme").unwrap()
}

fn android() -> DeviceType {
    DeviceType::new("android").unwrap()
}

fn identifier(id: &str) -> DeviceIdentifier {
    DeviceIdentifier::new(id, android()).unwrap()
}

fn request(id: &str, owner: &str) -> EnrollmentRequest {
    EnrollmentRequest {
        identifier: identifier(id),
        name: String::new(),
        description: None,
        properties: Default::default(),
        owner: owner.to_string(),
        ownership: OwnershipType::Byod,
    }
}

fn draft(name: &str) -> PolicyDraft {
    PolicyDraft {
        name: name.to_string(),
        profile: Some(ProfileInput {
            id: None,
            name: String::new(),
            device_type: android(),
            features: vec![],
        }),
        compliance: Default::default(),
        ownership_type: None,
        active: true,
    }
}

fn engine_with(directory: Arc<dyn UserDirectory>) -> Engine {
    Engine::new(Arc::new(MemoryStore::new()), directory, EngineConfig::default())
}

fn engine() -> Engine {
    engine_with(Arc::new(StaticDirectory::new()))
}

fn driver(engine: &Engine) -> fleet_engine::RecomputationDriver {
    fleet_engine::RecomputationDriver::new(
        engine.store().clone(),
        engine.resolver().clone(),
        engine.cache().clone(),
        engine.ledger().clone(),
        3,
    )
}

/// Create an active policy scoped to one user.
async fn user_policy(engine: &Engine, name: &str, user: &str) -> PolicyId {
    let policy = engine.create_policy(&tenant(), &draft(name)).await.unwrap();
    engine
        .assign_scope(&tenant(), policy.id, &[PolicyScope::User(user.to_string())])
        .await
        .unwrap();
    policy.id
}

/// Create an active policy scoped to the android device type.
async fn type_policy(engine: &Engine, name: &str) -> PolicyId {
    let policy = engine.create_policy(&tenant(), &draft(name)).await.unwrap();
    engine
        .assign_scope(&tenant(), policy.id, &[PolicyScope::DeviceType(android())])
        .await
        .unwrap();
    policy.id
}

struct FailingDirectory;

#[async_trait]
impl UserDirectory for FailingDirectory {
    async fn roles_of(&self, _: &TenantId, _: &str) -> Result<Vec<String>, DirectoryError> {
        Err(DirectoryError::Unavailable("ldap timeout".to_string()))
    }

    async fn users_in_role(&self, _: &TenantId, _: &str) -> Result<Vec<String>, DirectoryError> {
        Err(DirectoryError::Unavailable("ldap timeout".to_string()))
    }
}

#[derive(Default)]
struct RecordingPlugin {
    claimable: bool,
    fail_notifications: bool,
    events: Mutex<Vec<String>>,
}

#[async_trait]
impl DeviceTypePlugin for RecordingPlugin {
    async fn enroll_device(&self, device: &fleet_state::Device) -> Result<(), PluginError> {
        self.events.lock().push(format!("enroll:{}", device.identifier.id));
        if self.fail_notifications {
            return Err(PluginError::Unavailable {
                device_type: "android".to_string(),
                reason: "down".to_string(),
            });
        }
        Ok(())
    }

    async fn disenroll_device(&self, device: &fleet_state::Device) -> Result<(), PluginError> {
        self.events.lock().push(format!("disenroll:{}", device.identifier.id));
        if self.fail_notifications {
            return Err(PluginError::Unavailable {
                device_type: "android".to_string(),
                reason: "down".to_string(),
            });
        }
        Ok(())
    }

    async fn is_claimable(&self, _: &DeviceIdentifier) -> Result<bool, PluginError> {
        Ok(self.claimable)
    }

    async fn get_device(&self, _: &DeviceIdentifier) -> Result<Option<PluginDevice>, PluginError> {
        let mut properties = std::collections::BTreeMap::new();
        properties.insert("firmware".to_string(), "14".to_string());
        Ok(Some(PluginDevice { properties }))
    }
}

// ── Resolution ───────────────────────────────────────────────────────

#[tokio::test]
async fn device_without_scope_resolves_not_found() {
    let engine = engine();
    let t = tenant();
    engine.create_policy(&t, &draft("unassigned")).await.unwrap();
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();

    let err = engine.resolve(&t, &identifier("d1")).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(engine.get_effective_policy(&t, &identifier("d1")).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn lower_priority_wins_over_broader_scope() {
    let engine = engine();
    let t = tenant();
    let d1 = engine.enroll(&t, &request("d1", "alice")).await.unwrap().device;
    engine.enroll(&t, &request("d2", "bob")).await.unwrap();

    let p2 = engine.create_policy(&t, &draft("device-p2")).await.unwrap();
    let p1 = engine.create_policy(&t, &draft("type-p1")).await.unwrap();
    engine
        .update_policy_priorities(
            &t,
            &[
                PriorityChange { policy_id: p1.id, priority: 5 },
                PriorityChange { policy_id: p2.id, priority: 1 },
            ],
        )
        .await
        .unwrap();
    engine
        .assign_scope(&t, p1.id, &[PolicyScope::DeviceType(android())])
        .await
        .unwrap();
    engine
        .assign_scope(&t, p2.id, &[PolicyScope::Device(d1.id)])
        .await
        .unwrap();

    let on_d1 = engine.resolve(&t, &identifier("d1")).await.unwrap();
    assert_eq!(on_d1.policy.id, p2.id);
    assert_eq!(on_d1.scope, ScopeKind::Device);
    let on_d2 = engine.resolve(&t, &identifier("d2")).await.unwrap();
    assert_eq!(on_d2.policy.id, p1.id);
    assert_eq!(on_d2.scope, ScopeKind::DeviceType);
}

#[tokio::test]
async fn role_scope_reaches_devices_of_role_members() {
    let directory = Arc::new(StaticDirectory::new());
    directory.set_roles(&tenant(), "alice", ["field-ops"]);
    let engine = engine_with(directory);
    let t = tenant();
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();
    engine.enroll(&t, &request("d2", "bob")).await.unwrap();
    let policy = engine.create_policy(&t, &draft("ops")).await.unwrap();
    engine
        .assign_scope(&t, policy.id, &[PolicyScope::Role("field-ops".to_string())])
        .await
        .unwrap();

    let resolved = engine.resolve(&t, &identifier("d1")).await.unwrap();
    assert_eq!(resolved.policy.id, policy.id);
    assert_eq!(resolved.scope, ScopeKind::Role);
    assert!(engine.resolve(&t, &identifier("d2")).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn inactive_and_ownership_filtered_policies_are_skipped() {
    let engine = engine();
    let t = tenant();
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();

    let mut cope_only = draft("cope-only");
    cope_only.ownership_type = Some(OwnershipType::Cope);
    let cope = engine.create_policy(&t, &cope_only).await.unwrap();
    let mut dormant = draft("dormant");
    dormant.active = false;
    let inactive = engine.create_policy(&t, &dormant).await.unwrap();
    for id in [cope.id, inactive.id] {
        engine
            .assign_scope(&t, id, &[PolicyScope::DeviceType(android())])
            .await
            .unwrap();
    }
    assert!(engine.resolve(&t, &identifier("d1")).await.unwrap_err().is_not_found());

    engine.activate_policy(&t, inactive.id).await.unwrap();
    assert_eq!(engine.resolve(&t, &identifier("d1")).await.unwrap().policy.id, inactive.id);
}

#[tokio::test]
async fn deleted_policy_is_no_longer_selected() {
    let engine = engine();
    let t = tenant();
    let d1 = engine.enroll(&t, &request("d1", "alice")).await.unwrap().device;
    let fallback = type_policy(&engine, "fallback").await;
    let pinned = engine.create_policy(&t, &draft("pinned")).await.unwrap();
    engine
        .update_policy_priorities(
            &t,
            &[
                PriorityChange { policy_id: pinned.id, priority: 10 },
                PriorityChange { policy_id: fallback, priority: 20 },
            ],
        )
        .await
        .unwrap();
    engine
        .assign_scope(&t, pinned.id, &[PolicyScope::Device(d1.id)])
        .await
        .unwrap();
    engine.run_recomputation_pass(&t).await.unwrap();
    let cached = engine.get_effective_policy(&t, &identifier("d1")).await.unwrap();
    assert_eq!(cached.policy_id, pinned.id);

    engine.delete_policy(&t, pinned.id).await.unwrap();
    assert!(engine.policies().scopes(&t, pinned.id).await.is_err());
    assert_eq!(engine.resolve(&t, &identifier("d1")).await.unwrap().policy.id, fallback);

    let report = engine.run_recomputation_pass(&t).await.unwrap();
    assert_eq!(report.written, 1);
    let cached = engine.get_effective_policy(&t, &identifier("d1")).await.unwrap();
    assert_eq!(cached.policy_id, fallback);
    assert!(!cached.applied);
}

#[tokio::test]
async fn degraded_resolution_is_served_but_never_cached() {
    let engine = engine_with(Arc::new(FailingDirectory));
    let t = tenant();
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();
    let policy = type_policy(&engine, "baseline").await;

    assert_eq!(engine.resolve(&t, &identifier("d1")).await.unwrap().policy.id, policy);

    let report = engine.run_recomputation_pass(&t).await.unwrap();
    assert_eq!(report.degraded, 1);
    assert_eq!(report.written, 0);
    assert_eq!(report.released, report.claimed);
    let device = engine.enrollment().find(&t, &identifier("d1")).await.unwrap().unwrap();
    assert!(!engine.cache().exists(&t, device.id).await.unwrap());
    assert!(!engine.ledger().pending(&t).await.unwrap().is_empty());
}

// ── Enrollment ───────────────────────────────────────────────────────

#[tokio::test]
async fn devices_are_listed_by_role_membership() {
    let directory = Arc::new(StaticDirectory::new());
    directory.set_roles(&tenant(), "alice", ["field-ops"]);
    directory.set_roles(&tenant(), "carol", ["field-ops", "admins"]);
    let engine = engine_with(directory);
    let t = tenant();
    engine.enroll(&t, &request("d3", "carol")).await.unwrap();
    engine.enroll(&t, &request("d2", "bob")).await.unwrap();
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();

    let ids: Vec<String> = engine
        .list_devices_by_role(&t, "field-ops")
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.identifier.id)
        .collect();
    assert_eq!(ids, vec!["d1".to_string(), "d3".to_string()]);
    assert!(engine.list_devices_by_role(&t, "nobody").await.unwrap().is_empty());
}

#[tokio::test]
async fn listing_by_role_with_the_directory_down_is_a_dependency_error() {
    let engine = engine_with(Arc::new(FailingDirectory));
    let t = tenant();
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();
    let err = engine.list_devices_by_role(&t, "field-ops").await.unwrap_err();
    assert!(matches!(err, FleetError::Dependency(_)));
}

#[tokio::test]
async fn resubmitting_the_same_enrollment_is_idempotent() {
    let engine = engine();
    let t = tenant();
    type_policy(&engine, "baseline").await;

    let first = engine.enroll(&t, &request("d1", "alice")).await.unwrap();
    assert_eq!(first.action, EnrollAction::Created);
    let record = engine.get_effective_policy(&t, &identifier("d1")).await.unwrap();

    let again = engine.enroll(&t, &request("d1", "alice")).await.unwrap();
    assert_eq!(again.action, EnrollAction::Resubmitted);
    assert_eq!(again.device.id, first.device.id);
    assert_eq!(
        again.device.enrollment.date_of_enrollment,
        first.device.enrollment.date_of_enrollment
    );
    assert_eq!(engine.enrollment().history(&t, &identifier("d1")).await.unwrap().len(), 1);
    assert_eq!(engine.policies().applied_policy_ids(&t).await.unwrap().len(), 1);
    let after = engine.get_effective_policy(&t, &identifier("d1")).await.unwrap();
    assert_eq!(after.revision, record.revision);
}

#[tokio::test]
async fn new_owner_demotes_the_previous_enrollment() {
    let engine = engine();
    let t = tenant();
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();
    let moved = engine.enroll(&t, &request("d1", "bob")).await.unwrap();
    assert_eq!(moved.action, EnrollAction::Reassigned);
    assert_eq!(moved.device.owner(), "bob");

    let history = engine.enrollment().history(&t, &identifier("d1")).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].owner, "alice");
    assert_eq!(history[0].status, EnrollmentStatus::Inactive);
    assert_eq!(history[1].status, EnrollmentStatus::Active);
}

#[tokio::test]
async fn disenrolled_device_keeps_its_effective_record() {
    let engine = engine();
    let t = tenant();
    let policy = type_policy(&engine, "baseline").await;
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();
    let before = engine.get_effective_policy(&t, &identifier("d1")).await.unwrap();

    let removed = engine.disenroll(&t, &identifier("d1")).await.unwrap();
    assert_eq!(removed.status(), EnrollmentStatus::Removed);
    assert_eq!(engine.resolve(&t, &identifier("d1")).await.unwrap().policy.id, policy);

    engine.policies().record_change(&t, policy).await.unwrap();
    let report = engine.run_recomputation_pass(&t).await.unwrap();
    assert_eq!(report.skipped_removed, 1);
    let after = engine.get_effective_policy(&t, &identifier("d1")).await.unwrap();
    assert_eq!(after, before);

    let renewed = engine.enroll(&t, &request("d1", "alice")).await.unwrap();
    assert_eq!(renewed.action, EnrollAction::Renewed);
    assert_eq!(renewed.device.status(), EnrollmentStatus::Active);
}

#[tokio::test]
async fn status_changes_follow_the_lifecycle() {
    let engine = engine();
    let t = tenant();
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();

    let blocked = engine.set_status(&t, &identifier("d1"), EnrollmentStatus::Blocked).await.unwrap();
    assert_eq!(blocked.status(), EnrollmentStatus::Blocked);
    let active = engine.set_status(&t, &identifier("d1"), EnrollmentStatus::Active).await.unwrap();
    assert_eq!(active.status(), EnrollmentStatus::Active);
    let removed = engine.set_status(&t, &identifier("d1"), EnrollmentStatus::Removed).await.unwrap();
    assert_eq!(removed.status(), EnrollmentStatus::Removed);

    let err = engine
        .set_status(&t, &identifier("d1"), EnrollmentStatus::Active)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Conflict(_)));
}

#[tokio::test]
async fn plugins_decide_initial_status_and_hear_about_changes() {
    let engine = engine();
    let t = tenant();
    let plugin = Arc::new(RecordingPlugin {
        claimable: true,
        ..Default::default()
    });
    engine.plugins().register(android(), plugin.clone());

    let enrolled = engine.enroll(&t, &request("d1", "alice")).await.unwrap();
    assert_eq!(enrolled.device.status(), EnrollmentStatus::Inactive);
    let fetched = engine.get_device(&t, &identifier("d1")).await.unwrap();
    assert_eq!(fetched.properties.get("firmware").map(String::as_str), Some("14"));

    engine.disenroll(&t, &identifier("d1")).await.unwrap();
    assert_eq!(*plugin.events.lock(), vec!["enroll:d1".to_string(), "disenroll:d1".to_string()]);
}

#[tokio::test]
async fn failing_plugin_notification_does_not_undo_the_commit() {
    let engine = engine();
    let t = tenant();
    engine.plugins().register(
        android(),
        Arc::new(RecordingPlugin {
            fail_notifications: true,
            ..Default::default()
        }),
    );
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();
    let removed = engine.disenroll(&t, &identifier("d1")).await.unwrap();
    assert_eq!(removed.status(), EnrollmentStatus::Removed);
    assert!(!engine.enrollment().is_enrolled(&t, &identifier("d1")).await.unwrap());
}

// ── Policies ─────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_colliding_reorders_fail_exactly_once() {
    let engine = engine();
    let t = tenant();
    let a = engine.create_policy(&t, &draft("a")).await.unwrap();
    let b = engine.create_policy(&t, &draft("b")).await.unwrap();

    let first = [PriorityChange { policy_id: a.id, priority: 10 }];
    let second = [PriorityChange { policy_id: b.id, priority: 10 }];
    let (left, right) = tokio::join!(
        engine.update_policy_priorities(&t, &first),
        engine.update_policy_priorities(&t, &second),
    );
    let conflicts = [&left, &right]
        .iter()
        .filter(|r| matches!(r, Err(FleetError::Conflict(_))))
        .count();
    assert_eq!(conflicts, 1);
    assert_eq!(left.is_ok() as usize + right.is_ok() as usize, 1);
}

#[tokio::test]
async fn shared_profiles_are_listed_once() {
    let engine = engine();
    let t = tenant();
    let shared = ProfileId::new();
    let mut first = draft("first");
    let mut second = draft("second");
    for d in [&mut first, &mut second] {
        if let Some(profile) = d.profile.as_mut() {
            profile.id = Some(shared);
            profile.name = "kiosk".to_string();
        }
    }
    engine.create_policy(&t, &first).await.unwrap();
    engine.create_policy(&t, &second).await.unwrap();
    let own = engine.create_policy(&t, &draft("third")).await.unwrap();

    let profiles = engine.list_profiles(&t).await.unwrap();
    let ids: Vec<ProfileId> = profiles.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![shared, own.profile.id]);

    let kiosk = engine.get_profile(&t, shared).await.unwrap();
    assert_eq!(kiosk.name, "kiosk");
    assert_eq!(kiosk.device_type, android());
    assert!(engine.get_profile(&t, ProfileId::new()).await.unwrap_err().is_not_found());
    assert!(engine
        .get_profile(&TenantId::new("globex").unwrap(), shared)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn empty_policy_name_is_rejected_before_any_write() {
    let engine = engine();
    let t = tenant();
    let err = engine.create_policy(&t, &draft("  ")).await.unwrap_err();
    assert!(matches!(err, FleetError::Validation(_)));
    assert!(engine.list_policies(&t).await.unwrap().is_empty());
    assert!(engine.ledger().pending(&t).await.unwrap().is_empty());
}

// ── Recomputation ────────────────────────────────────────────────────

#[tokio::test]
async fn repeated_passes_produce_identical_records() {
    let engine = engine();
    let t = tenant();
    for id in ["d1", "d2", "d3"] {
        engine.enroll(&t, &request(id, "alice")).await.unwrap();
    }
    let policy = type_policy(&engine, "baseline").await;

    let first = engine.run_recomputation_pass(&t).await.unwrap();
    assert_eq!(first.written, 3);
    assert_eq!(first.cleared, first.claimed);
    let snapshot_of = |engine: Engine| async move {
        let mut out = Vec::new();
        for id in ["d1", "d2", "d3"] {
            out.push(engine.get_effective_policy(&tenant(), &identifier(id)).await.unwrap());
        }
        out
    };
    let before = snapshot_of(engine.clone()).await;

    engine.policies().record_change(&t, policy).await.unwrap();
    let second = engine.run_recomputation_pass(&t).await.unwrap();
    assert_eq!(second.unchanged, 3);
    assert_eq!(second.written, 0);
    let after = snapshot_of(engine.clone()).await;
    assert_eq!(before, after);
}

#[tokio::test]
async fn ungoverned_device_loses_its_record() {
    let engine = engine();
    let t = tenant();
    let policy = type_policy(&engine, "baseline").await;
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();
    assert!(engine.get_effective_policy(&t, &identifier("d1")).await.is_ok());

    engine.deactivate_policy(&t, policy).await.unwrap();
    let report = engine.run_recomputation_pass(&t).await.unwrap();
    assert_eq!(report.removed, 1);
    assert!(engine.get_effective_policy(&t, &identifier("d1")).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn mark_applied_is_idempotent_and_reset_by_new_snapshots() {
    let engine = engine();
    let t = tenant();
    let policy = type_policy(&engine, "baseline").await;
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();

    let first = engine.mark_applied(&t, &identifier("d1")).await.unwrap();
    let second = engine.mark_applied(&t, &identifier("d1")).await.unwrap();
    assert!(first.applied);
    assert_eq!(first.applied_time, second.applied_time);

    let mut renamed = draft("baseline v2");
    renamed.active = true;
    engine.update_policy(&t, policy, &renamed).await.unwrap();
    engine.run_recomputation_pass(&t).await.unwrap();
    let record = engine.get_effective_policy(&t, &identifier("d1")).await.unwrap();
    assert!(!record.applied);
    assert_eq!(record.decode_snapshot().unwrap().name, "baseline v2");
}

#[tokio::test]
async fn shutdown_before_a_pass_releases_every_claim() {
    let engine = engine();
    let t = tenant();
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();
    type_policy(&engine, "baseline").await;

    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let report = driver(&engine).run_pass(&t, &rx).await.unwrap();
    assert!(report.interrupted);
    assert_eq!(report.released, report.claimed);
    assert_eq!(engine.ledger().pending(&t).await.unwrap().len(), report.claimed);
}

#[tokio::test]
async fn engine_shutdown_interrupts_later_on_demand_passes() {
    let engine = engine();
    let t = tenant();
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();
    type_policy(&engine, "baseline").await;

    // Nothing is subscribed to the shutdown signal at this point.
    engine.shutdown();
    let report = engine.run_recomputation_pass(&t).await.unwrap();
    assert!(report.interrupted);
    assert!(report.claimed > 0);
    assert_eq!(report.released, report.claimed);
    assert_eq!(report.written, 0);
    assert_eq!(engine.ledger().pending(&t).await.unwrap().len(), report.claimed);
}

#[tokio::test]
async fn stale_device_read_never_overwrites_a_newer_owner() {
    let engine = engine();
    let t = tenant();
    user_policy(&engine, "alice-policy", "alice").await;
    let bob_policy = user_policy(&engine, "bob-policy", "bob").await;
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();
    let stale = engine.store().get_device(&t, &identifier("d1")).await.unwrap().unwrap();

    engine.enroll(&t, &request("d1", "bob")).await.unwrap();
    let current = engine.get_effective_policy(&t, &identifier("d1")).await.unwrap();
    assert_eq!(current.policy_id, bob_policy);

    // A refresh that started from alice's row resolves bob's device.
    let outcome = driver(&engine).refresh(&t, &stale).await.unwrap();
    assert_eq!(outcome, DeviceOutcome::Unchanged);
    let after = engine.get_effective_policy(&t, &identifier("d1")).await.unwrap();
    assert_eq!(after, current);
}

#[tokio::test]
async fn refresh_skips_a_device_disenrolled_meanwhile() {
    let engine = engine();
    let t = tenant();
    let baseline = type_policy(&engine, "baseline").await;
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();
    let stale = engine.store().get_device(&t, &identifier("d1")).await.unwrap().unwrap();
    let before = engine.get_effective_policy(&t, &identifier("d1")).await.unwrap();

    engine.disenroll(&t, &identifier("d1")).await.unwrap();
    // Resolving the device now would drop its record.
    engine.deactivate_policy(&t, baseline).await.unwrap();

    let outcome = driver(&engine).refresh(&t, &stale).await.unwrap();
    assert_eq!(outcome, DeviceOutcome::Skipped);
    let after = engine.get_effective_policy(&t, &identifier("d1")).await.unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn tenants_are_isolated() {
    let engine = engine();
    let acme = tenant();
    let other = TenantId::new("globex").unwrap();
    type_policy(&engine, "baseline").await;
    engine.enroll(&other, &request("d1", "alice")).await.unwrap();

    assert!(engine.resolve(&other, &identifier("d1")).await.unwrap_err().is_not_found());
    assert!(engine.get_device(&acme, &identifier("d1")).await.unwrap_err().is_not_found());
    assert_eq!(engine.run_recomputation_pass(&other).await.unwrap().claimed, 0);
}

// ── Scheduler ────────────────────────────────────────────────────────

#[tokio::test]
async fn scheduler_rejects_bad_requests() {
    let engine = engine();
    let t = tenant();
    let scheduler = engine.scheduler();
    assert!(matches!(scheduler.start(&t, Duration::ZERO), Err(FleetError::Validation(_))));
    assert!(scheduler.update(&t, Duration::from_secs(1)).unwrap_err().is_not_found());
    assert!(!scheduler.stop(&t));

    scheduler.start(&t, Duration::from_secs(60)).unwrap();
    assert!(matches!(
        scheduler.start(&t, Duration::from_secs(60)),
        Err(FleetError::Conflict(_))
    ));
    scheduler.update(&t, Duration::from_secs(30)).unwrap();
    assert_eq!(scheduler.interval(&t), Some(Duration::from_secs(30)));
    assert!(scheduler.stop(&t));
    assert!(!scheduler.is_running(&t));
}

#[tokio::test]
async fn scheduled_passes_drain_the_ledger() {
    let engine = engine();
    let t = tenant();
    engine.enroll(&t, &request("d1", "alice")).await.unwrap();
    type_policy(&engine, "baseline").await;
    assert!(!engine.ledger().pending(&t).await.unwrap().is_empty());

    engine.scheduler().start(&t, Duration::from_millis(10)).unwrap();
    let mut drained = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if engine.ledger().pending(&t).await.unwrap().is_empty() {
            drained = true;
            break;
        }
    }
    engine.shutdown();
    assert!(drained);
    assert!(engine.get_effective_policy(&t, &identifier("d1")).await.is_ok());
}
