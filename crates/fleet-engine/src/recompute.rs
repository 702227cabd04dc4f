//! # Recomputation Driver
//!
//! One pass over a tenant's change ledger:
//!
//! 1. Claim a batch of dirty `(policy, device type)` entries under a lease.
//! 2. Group them by device type. Each type is recomputed once per pass no
//!    matter how many of its policies changed.
//! 3. Re-resolve every non-REMOVED device of the type and write the result
//!    through the effective-policy cache. A device that no longer resolves
//!    loses its cached record.
//! 4. Complete the type's claims if every device succeeded, otherwise
//!    release them so the next pass retries.
//!
//! Every attempt reads the cached revision first and the device second, so
//! a resolution is always computed from a device row at least as new as the
//! revision it overwrites. A cache write that loses a revision race is
//! re-resolved from a fresh read up to `conflict_retries` times. Degraded resolutions (directory
//! down) are never written. The shutdown signal is checked between
//! devices; claims not finished by then are released.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use fleet_core::{DeviceType, FleetError, TenantId};
use fleet_policy::{ClaimedEntry, CompleteOutcome, ExpectedRevision, PutOutcome};
use fleet_state::{Device, DeviceFilter, EnrollmentStatus};
use fleet_store::FleetStore;

use crate::cache::EffectivePolicyCache;
use crate::ledger::ChangePropagationLedger;
use crate::resolver::PolicyResolver;

/// What refreshing one device did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceOutcome {
    /// A new or changed snapshot was written.
    Written,
    /// The cached snapshot was already byte-identical.
    Unchanged,
    /// No policy governs the device any more; its record was dropped.
    Removed,
    /// No policy governs the device and nothing was cached.
    Ungoverned,
    /// The directory failed; nothing was written.
    Degraded,
    /// The device was disenrolled or deleted meanwhile; nothing was written.
    Skipped,
}

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub claimed: usize,
    pub cleared: usize,
    pub still_dirty: usize,
    pub released: usize,
    pub lease_lost: usize,
    pub device_types: usize,
    pub written: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub ungoverned: usize,
    pub skipped_removed: usize,
    pub degraded: usize,
    pub conflict_retries: u32,
    pub failed: usize,
    pub interrupted: bool,
}

impl PassReport {
    fn record(&mut self, outcome: DeviceOutcome) {
        match outcome {
            DeviceOutcome::Written => self.written += 1,
            DeviceOutcome::Unchanged => self.unchanged += 1,
            DeviceOutcome::Removed => self.removed += 1,
            DeviceOutcome::Ungoverned => self.ungoverned += 1,
            DeviceOutcome::Degraded => self.degraded += 1,
            DeviceOutcome::Skipped => self.skipped_removed += 1,
        }
    }
}

#[derive(Clone)]
pub struct RecomputationDriver {
    store: Arc<dyn FleetStore>,
    resolver: PolicyResolver,
    cache: EffectivePolicyCache,
    ledger: ChangePropagationLedger,
    conflict_retries: u32,
}

impl RecomputationDriver {
    pub fn new(
        store: Arc<dyn FleetStore>,
        resolver: PolicyResolver,
        cache: EffectivePolicyCache,
        ledger: ChangePropagationLedger,
        conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            resolver,
            cache,
            ledger,
            conflict_retries,
        }
    }

    /// Run one pass for `tenant`.
    pub async fn run_pass(
        &self,
        tenant: &TenantId,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<PassReport, FleetError> {
        let mut report = PassReport::default();
        let claims = self.ledger.drain_dirty(tenant).await?;
        report.claimed = claims.len();
        if claims.is_empty() {
            return Ok(report);
        }

        let mut by_type: BTreeMap<DeviceType, Vec<ClaimedEntry>> = BTreeMap::new();
        for claim in claims {
            by_type
                .entry(claim.key.device_type.clone())
                .or_default()
                .push(claim);
        }
        report.device_types = by_type.len();

        for (device_type, group) in by_type {
            let complete = if report.interrupted || *shutdown.borrow() {
                report.interrupted = true;
                false
            } else {
                match self.recompute_type(tenant, &device_type, shutdown, &mut report).await {
                    Ok(complete) => complete,
                    Err(e) => {
                        tracing::warn!(tenant = %tenant, device_type = %device_type, error = %e,
                            "device type recomputation failed");
                        report.failed += 1;
                        false
                    }
                }
            };
            self.settle(tenant, &group, complete, &mut report).await?;
        }

        tracing::info!(
            tenant = %tenant,
            claimed = report.claimed,
            cleared = report.cleared,
            released = report.released,
            written = report.written,
            unchanged = report.unchanged,
            removed = report.removed,
            degraded = report.degraded,
            interrupted = report.interrupted,
            "recomputation pass finished"
        );
        Ok(report)
    }

    /// Recompute every device of one type. Returns whether all of them
    /// finished cleanly.
    async fn recompute_type(
        &self,
        tenant: &TenantId,
        device_type: &DeviceType,
        shutdown: &watch::Receiver<bool>,
        report: &mut PassReport,
    ) -> Result<bool, FleetError> {
        let devices = self
            .store
            .list_devices(tenant, &DeviceFilter::by_type(device_type.clone()))
            .await?;
        let mut complete = true;
        for device in devices {
            if *shutdown.borrow() {
                report.interrupted = true;
                return Ok(false);
            }
            if device.status() == EnrollmentStatus::Removed {
                report.skipped_removed += 1;
                continue;
            }
            match self.refresh_counted(tenant, &device).await {
                Ok((outcome, retries)) => {
                    report.conflict_retries += retries;
                    report.record(outcome);
                    if outcome == DeviceOutcome::Degraded {
                        complete = false;
                    }
                }
                Err(e) => {
                    tracing::warn!(tenant = %tenant, device = %device.identifier, error = %e,
                        "device recomputation failed");
                    report.failed += 1;
                    complete = false;
                }
            }
        }
        Ok(complete)
    }

    async fn settle(
        &self,
        tenant: &TenantId,
        group: &[ClaimedEntry],
        complete: bool,
        report: &mut PassReport,
    ) -> Result<(), FleetError> {
        for claim in group {
            if complete {
                match self.ledger.complete(tenant, claim).await? {
                    CompleteOutcome::Cleared => report.cleared += 1,
                    CompleteOutcome::StillDirty => report.still_dirty += 1,
                    CompleteOutcome::LeaseLost => report.lease_lost += 1,
                }
            } else if self.ledger.release(tenant, claim).await? {
                report.released += 1;
            } else {
                report.lease_lost += 1;
            }
        }
        Ok(())
    }

    /// Re-resolve one device and bring its cached record up to date.
    ///
    /// `device` only names the device; its attributes are re-read from the
    /// store on every attempt.
    pub async fn refresh(&self, tenant: &TenantId, device: &Device) -> Result<DeviceOutcome, FleetError> {
        self.refresh_counted(tenant, device)
            .await
            .map(|(outcome, _)| outcome)
    }

    async fn refresh_counted(
        &self,
        tenant: &TenantId,
        device: &Device,
    ) -> Result<(DeviceOutcome, u32), FleetError> {
        let mut retries = 0;
        loop {
            let cached = self.cache.find(tenant, device.id).await?;
            let expected = ExpectedRevision::of(cached.as_ref());
            let current = match self.store.get_device_by_id(tenant, device.id).await? {
                Some(current) if current.status() != EnrollmentStatus::Removed => current,
                _ => {
                    tracing::debug!(tenant = %tenant, device = %device.identifier,
                        "device disenrolled before refresh, skipping");
                    return Ok((DeviceOutcome::Skipped, retries));
                }
            };
            let resolution = self.resolver.resolve(tenant, &current).await?;
            if resolution.degraded {
                return Ok((DeviceOutcome::Degraded, retries));
            }
            let attempt = match resolution.resolved {
                Some(resolved) => self
                    .cache
                    .put(tenant, device.id, &resolved.snapshot(), expected)
                    .await
                    .map(|(outcome, _)| match outcome {
                        PutOutcome::Unchanged => DeviceOutcome::Unchanged,
                        PutOutcome::Inserted | PutOutcome::Updated => DeviceOutcome::Written,
                    }),
                None if cached.is_some() => self
                    .cache
                    .remove(tenant, device.id, expected)
                    .await
                    .map(|_| DeviceOutcome::Removed),
                None => Ok(DeviceOutcome::Ungoverned),
            };
            match attempt {
                Err(FleetError::Conflict(reason)) if retries < self.conflict_retries => {
                    retries += 1;
                    tracing::debug!(tenant = %tenant, device = %device.identifier, retries, reason = %reason,
                        "effective policy write lost a race, re-resolving");
                }
                other => return other.map(|outcome| (outcome, retries)),
            }
        }
    }
}
