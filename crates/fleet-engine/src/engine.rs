//! # Engine Facade
//!
//! Wires the services over one store, one user directory and one plugin
//! registry, and exposes the operations the HTTP layer and embedding
//! applications call.
//!
//! Enrollment changes that can move a device onto a different policy
//! (a new device, a new owner, a new ownership type) refresh that device's
//! effective record right after the commit. The refresh is best-effort:
//! the enrollment stands, and the next recomputation pass that covers the
//! device type picks up anything missed.

use std::sync::Arc;

use tokio::sync::watch;

use fleet_core::{DeviceIdentifier, FleetError, PolicyId, ProfileId, TenantId};
use fleet_policy::{
    EffectivePolicyRecord, Policy, PolicyDraft, PolicyScope, PriorityChange, Profile,
};
use fleet_state::{Device, DeviceFilter, EnrollmentRequest, EnrollmentStatus};
use fleet_store::FleetStore;

use crate::cache::EffectivePolicyCache;
use crate::config::EngineConfig;
use crate::directory::UserDirectory;
use crate::enrollment::{Enrolled, EnrollmentService};
use crate::ledger::ChangePropagationLedger;
use crate::plugin::PluginRegistry;
use crate::policies::PolicyAdministrator;
use crate::recompute::{PassReport, RecomputationDriver};
use crate::resolver::{PolicyResolver, ResolvedPolicy};
use crate::scheduler::RecomputationScheduler;

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn FleetStore>,
    config: EngineConfig,
    plugins: Arc<PluginRegistry>,
    enrollment: EnrollmentService,
    policies: PolicyAdministrator,
    resolver: PolicyResolver,
    cache: EffectivePolicyCache,
    ledger: ChangePropagationLedger,
    driver: RecomputationDriver,
    scheduler: Arc<RecomputationScheduler>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn FleetStore>,
        directory: Arc<dyn UserDirectory>,
        config: EngineConfig,
    ) -> Self {
        let plugins = Arc::new(PluginRegistry::new());
        let enrollment = EnrollmentService::new(store.clone(), plugins.clone(), directory.clone());
        let policies = PolicyAdministrator::new(store.clone());
        let resolver = PolicyResolver::new(store.clone(), directory);
        let cache = EffectivePolicyCache::new(store.clone());
        let ledger = ChangePropagationLedger::new(store.clone(), &config);
        let driver = RecomputationDriver::new(
            store.clone(),
            resolver.clone(),
            cache.clone(),
            ledger.clone(),
            config.conflict_retries,
        );
        let scheduler = Arc::new(RecomputationScheduler::new(driver.clone()));
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            config,
            plugins,
            enrollment,
            policies,
            resolver,
            cache,
            ledger,
            driver,
            scheduler,
            shutdown: Arc::new(shutdown),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn store(&self) -> &Arc<dyn FleetStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn enrollment(&self) -> &EnrollmentService {
        &self.enrollment
    }

    pub fn policies(&self) -> &PolicyAdministrator {
        &self.policies
    }

    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    pub fn cache(&self) -> &EffectivePolicyCache {
        &self.cache
    }

    pub fn ledger(&self) -> &ChangePropagationLedger {
        &self.ledger
    }

    pub fn scheduler(&self) -> &RecomputationScheduler {
        &self.scheduler
    }

    // ── Enrollment ───────────────────────────────────────────────────

    pub async fn enroll(
        &self,
        tenant: &TenantId,
        request: &EnrollmentRequest,
    ) -> Result<Enrolled, FleetError> {
        let enrolled = self.enrollment.enroll(tenant, request).await?;
        self.refresh_quietly(tenant, &enrolled.device).await;
        Ok(enrolled)
    }

    pub async fn modify_enrollment(
        &self,
        tenant: &TenantId,
        request: &EnrollmentRequest,
    ) -> Result<Device, FleetError> {
        let device = self.enrollment.modify(tenant, request).await?;
        self.refresh_quietly(tenant, &device).await;
        Ok(device)
    }

    /// Disenroll a device. Its effective record is kept.
    pub async fn disenroll(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> Result<Device, FleetError> {
        self.enrollment.disenroll(tenant, identifier).await
    }

    pub async fn set_status(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
        status: EnrollmentStatus,
    ) -> Result<Device, FleetError> {
        self.enrollment.set_status(tenant, identifier, status).await
    }

    pub async fn get_device(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> Result<Device, FleetError> {
        self.enrollment.get(tenant, identifier).await
    }

    pub async fn list_devices(
        &self,
        tenant: &TenantId,
        filter: &DeviceFilter,
    ) -> Result<Vec<Device>, FleetError> {
        self.enrollment.list(tenant, filter).await
    }

    pub async fn list_devices_by_role(
        &self,
        tenant: &TenantId,
        role: &str,
    ) -> Result<Vec<Device>, FleetError> {
        self.enrollment.list_by_role(tenant, role).await
    }

    // ── Policies ─────────────────────────────────────────────────────

    pub async fn create_policy(
        &self,
        tenant: &TenantId,
        draft: &PolicyDraft,
    ) -> Result<Policy, FleetError> {
        self.policies.create(tenant, draft).await
    }

    pub async fn update_policy(
        &self,
        tenant: &TenantId,
        id: PolicyId,
        draft: &PolicyDraft,
    ) -> Result<Policy, FleetError> {
        self.policies.update(tenant, id, draft).await
    }

    pub async fn delete_policy(&self, tenant: &TenantId, id: PolicyId) -> Result<(), FleetError> {
        self.policies.delete(tenant, id).await
    }

    pub async fn activate_policy(&self, tenant: &TenantId, id: PolicyId) -> Result<Policy, FleetError> {
        self.policies.activate(tenant, id).await
    }

    pub async fn deactivate_policy(
        &self,
        tenant: &TenantId,
        id: PolicyId,
    ) -> Result<Policy, FleetError> {
        self.policies.deactivate(tenant, id).await
    }

    pub async fn update_policy_priorities(
        &self,
        tenant: &TenantId,
        changes: &[PriorityChange],
    ) -> Result<Vec<Policy>, FleetError> {
        self.policies.update_priorities(tenant, changes).await
    }

    pub async fn assign_scope(
        &self,
        tenant: &TenantId,
        id: PolicyId,
        scopes: &[PolicyScope],
    ) -> Result<usize, FleetError> {
        self.policies.assign(tenant, id, scopes).await
    }

    pub async fn get_policy(&self, tenant: &TenantId, id: PolicyId) -> Result<Policy, FleetError> {
        self.policies.get(tenant, id).await
    }

    pub async fn list_policies(&self, tenant: &TenantId) -> Result<Vec<Policy>, FleetError> {
        self.policies.list(tenant).await
    }

    pub async fn list_profiles(&self, tenant: &TenantId) -> Result<Vec<Profile>, FleetError> {
        self.policies.profiles(tenant).await
    }

    pub async fn get_profile(&self, tenant: &TenantId, id: ProfileId) -> Result<Profile, FleetError> {
        self.policies.profile(tenant, id).await
    }

    // ── Resolution and the effective cache ───────────────────────────

    /// Resolve a device on demand, without touching the cache.
    ///
    /// Enrollment status is not consulted: a REMOVED device still resolves
    /// to whatever its scopes select.
    pub async fn resolve(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> Result<ResolvedPolicy, FleetError> {
        let device = self.require_device(tenant, identifier).await?;
        self.resolver
            .resolve(tenant, &device)
            .await?
            .resolved
            .ok_or_else(|| FleetError::not_found("policy for device", identifier))
    }

    pub async fn get_effective_policy(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> Result<EffectivePolicyRecord, FleetError> {
        let device = self.require_device(tenant, identifier).await?;
        self.cache.get(tenant, device.id).await
    }

    pub async fn mark_applied(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> Result<EffectivePolicyRecord, FleetError> {
        let device = self.require_device(tenant, identifier).await?;
        let record = self.cache.mark_applied(tenant, device.id).await?;
        tracing::info!(tenant = %tenant, device = %identifier, policy_id = %record.policy_id,
            "effective policy applied");
        Ok(record)
    }

    // ── Recomputation ────────────────────────────────────────────────

    /// Run one recomputation pass now.
    pub async fn run_recomputation_pass(&self, tenant: &TenantId) -> Result<PassReport, FleetError> {
        let shutdown = self.shutdown.subscribe();
        self.driver.run_pass(tenant, &shutdown).await
    }

    /// Schedule periodic passes at the configured default interval.
    pub fn schedule(&self, tenant: &TenantId) -> Result<(), FleetError> {
        self.scheduler.start(tenant, self.config.recompute_interval)
    }

    /// Stop scheduled passes and interrupt on-demand ones.
    pub fn shutdown(&self) {
        // Stored even with no live receiver, so later passes see it.
        self.shutdown.send_replace(true);
        self.scheduler.shutdown_all();
        tracing::info!("fleet engine shut down");
    }

    async fn refresh_quietly(&self, tenant: &TenantId, device: &Device) {
        if device.status() == EnrollmentStatus::Removed {
            return;
        }
        if let Err(e) = self.driver.refresh(tenant, device).await {
            tracing::warn!(tenant = %tenant, device = %device.identifier, error = %e,
                "effective policy refresh failed, deferring to the next pass");
        }
    }

    /// The stored device, without plugin enrichment.
    async fn require_device(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> Result<Device, FleetError> {
        self.enrollment
            .find(tenant, identifier)
            .await?
            .ok_or_else(|| FleetError::not_found("device", identifier))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("plugins", &self.plugins)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
