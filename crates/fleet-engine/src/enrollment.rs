//! # Enrollment Service
//!
//! Drives the enrollment lifecycle against the store. Each operation reads
//! what it needs, decides in pure code (`fleet_state`), and commits with a
//! single store call. Plugin calls happen before the read (claimable check)
//! or after the commit (notifications), never inside a transaction.
//!
//! Plugin notifications are best-effort: a failing plugin is logged and the
//! committed state stands.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use fleet_core::{DeviceIdentifier, FleetError, TenantId, Timestamp};
use fleet_state::{
    apply_modification, plan_enrollment, Device, DeviceFilter, EnrollmentInfo, EnrollmentPlan,
    EnrollmentRequest, EnrollmentStatus,
};
use fleet_store::FleetStore;

use crate::directory::UserDirectory;
use crate::plugin::PluginRegistry;

/// How an enroll request was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollAction {
    Created,
    Resubmitted,
    Reassigned,
    Renewed,
}

/// Result of an enroll request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrolled {
    pub action: EnrollAction,
    pub device: Device,
}

#[derive(Clone)]
pub struct EnrollmentService {
    store: Arc<dyn FleetStore>,
    plugins: Arc<PluginRegistry>,
    directory: Arc<dyn UserDirectory>,
}

impl EnrollmentService {
    pub fn new(
        store: Arc<dyn FleetStore>,
        plugins: Arc<PluginRegistry>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            store,
            plugins,
            directory,
        }
    }

    /// Enroll a device, or re-enroll one that already has a row.
    pub async fn enroll(
        &self,
        tenant: &TenantId,
        request: &EnrollmentRequest,
    ) -> Result<Enrolled, FleetError> {
        let claimable = self.is_claimable(&request.identifier).await;
        let existing = self.store.get_device(tenant, &request.identifier).await?;
        let plan = plan_enrollment(
            tenant,
            existing.as_ref(),
            request,
            claimable,
            Timestamp::now(),
        )?;
        let label = plan.label();

        let (action, device) = match plan {
            EnrollmentPlan::Create(device) => {
                self.store.create_device(tenant, &device).await?;
                (EnrollAction::Created, device)
            }
            EnrollmentPlan::Resubmit(device) => {
                self.store.save_device(tenant, &device).await?;
                (EnrollAction::Resubmitted, device)
            }
            EnrollmentPlan::Reassign { device, previous } => {
                self.store.switch_enrollment(tenant, &device, &previous).await?;
                (EnrollAction::Reassigned, device)
            }
            EnrollmentPlan::Renew { device, previous } => {
                self.store.switch_enrollment(tenant, &device, &previous).await?;
                (EnrollAction::Renewed, device)
            }
        };
        tracing::info!(
            tenant = %tenant,
            device = %device.identifier,
            owner = %device.enrollment.owner,
            status = %device.enrollment.status,
            plan = label,
            "device enrolled"
        );

        if let Some(plugin) = self.plugins.get(&device.identifier.device_type) {
            if let Err(e) = plugin.enroll_device(&device).await {
                tracing::warn!(tenant = %tenant, device = %device.identifier, error = %e,
                    "plugin enroll notification failed");
            }
        }
        Ok(Enrolled { action, device })
    }

    /// Update attributes and the current enrollment row in place.
    pub async fn modify(
        &self,
        tenant: &TenantId,
        request: &EnrollmentRequest,
    ) -> Result<Device, FleetError> {
        let mut device = self.require(tenant, &request.identifier).await?;
        apply_modification(&mut device, request, Timestamp::now())?;
        self.store.save_device(tenant, &device).await?;
        tracing::info!(tenant = %tenant, device = %device.identifier, "enrollment modified");
        Ok(device)
    }

    /// Move the device to REMOVED, then notify its plugin.
    pub async fn disenroll(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> Result<Device, FleetError> {
        let mut device = self.require(tenant, identifier).await?;
        device.disenroll(Timestamp::now())?;
        self.store.save_device(tenant, &device).await?;
        tracing::info!(tenant = %tenant, device = %identifier, "device disenrolled");

        if let Some(plugin) = self.plugins.get(&identifier.device_type) {
            if let Err(e) = plugin.disenroll_device(&device).await {
                tracing::warn!(tenant = %tenant, device = %identifier, error = %e,
                    "plugin disenroll notification failed");
            }
        }
        Ok(device)
    }

    /// Administrative status change (block, unblock, deactivate, ...).
    /// Moving to REMOVED is a disenrollment.
    pub async fn set_status(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
        status: EnrollmentStatus,
    ) -> Result<Device, FleetError> {
        if status == EnrollmentStatus::Removed {
            return self.disenroll(tenant, identifier).await;
        }
        let mut device = self.require(tenant, identifier).await?;
        let from = device.status();
        let now = Timestamp::now();
        match (from, status) {
            (_, EnrollmentStatus::Blocked) => device.block(now)?,
            (EnrollmentStatus::Blocked, EnrollmentStatus::Active) => device.unblock(now)?,
            _ => device.transition(status, now)?,
        }
        self.store.save_device(tenant, &device).await?;
        tracing::info!(tenant = %tenant, device = %identifier, from = %from, to = %status,
            "enrollment status changed");
        Ok(device)
    }

    /// The stored device, enriched with plugin-side properties when a
    /// plugin is registered and answers.
    pub async fn get(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> Result<Device, FleetError> {
        let mut device = self.require(tenant, identifier).await?;
        if let Some(plugin) = self.plugins.get(&identifier.device_type) {
            match plugin.get_device(identifier).await {
                Ok(Some(details)) => device.properties.extend(details.properties),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(tenant = %tenant, device = %identifier, error = %e,
                        "plugin lookup failed, returning stored device");
                }
            }
        }
        Ok(device)
    }

    pub async fn find(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> Result<Option<Device>, FleetError> {
        self.store.get_device(tenant, identifier).await
    }

    pub async fn list(
        &self,
        tenant: &TenantId,
        filter: &DeviceFilter,
    ) -> Result<Vec<Device>, FleetError> {
        self.store.list_devices(tenant, filter).await
    }

    /// Devices owned by any member of `role`, ordered by device type then
    /// identifier. Fails with `Dependency` when the directory is down.
    pub async fn list_by_role(&self, tenant: &TenantId, role: &str) -> Result<Vec<Device>, FleetError> {
        let members = self.directory.users_in_role(tenant, role).await?;
        let mut devices = Vec::new();
        for member in members {
            devices.extend(
                self.store
                    .list_devices(tenant, &DeviceFilter::by_owner(member))
                    .await?,
            );
        }
        devices.sort_by(|a, b| {
            (&a.identifier.device_type, &a.identifier.id)
                .cmp(&(&b.identifier.device_type, &b.identifier.id))
        });
        Ok(devices)
    }

    pub async fn count(&self, tenant: &TenantId, filter: &DeviceFilter) -> Result<u64, FleetError> {
        self.store.count_devices(tenant, filter).await
    }

    /// Whether the device exists and is not REMOVED.
    pub async fn is_enrolled(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> Result<bool, FleetError> {
        Ok(self
            .store
            .get_device(tenant, identifier)
            .await?
            .is_some_and(|d| d.is_enrolled()))
    }

    pub async fn is_active(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> Result<bool, FleetError> {
        Ok(self
            .store
            .get_device(tenant, identifier)
            .await?
            .is_some_and(|d| d.is_active()))
    }

    /// Every enrollment the device has had, oldest first.
    pub async fn history(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> Result<Vec<EnrollmentInfo>, FleetError> {
        let device = self.require(tenant, identifier).await?;
        self.store.enrollment_history(tenant, device.id).await
    }

    async fn require(
        &self,
        tenant: &TenantId,
        identifier: &DeviceIdentifier,
    ) -> Result<Device, FleetError> {
        self.store
            .get_device(tenant, identifier)
            .await?
            .ok_or_else(|| FleetError::not_found("device", identifier))
    }

    async fn is_claimable(&self, identifier: &DeviceIdentifier) -> bool {
        let Some(plugin) = self.plugins.get(&identifier.device_type) else {
            return false;
        };
        match plugin.is_claimable(identifier).await {
            Ok(claimable) => claimable,
            Err(e) => {
                tracing::warn!(device = %identifier, error = %e,
                    "claimable check failed, enrolling as active");
                false
            }
        }
    }
}
