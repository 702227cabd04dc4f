//! # Recomputation Scheduler
//!
//! One background task per tenant that runs a recomputation pass on a
//! fixed interval. Each task owns a shutdown channel; stopping a tenant
//! flips it, and the running pass sees the flag between device writes and
//! releases whatever it has not finished.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use fleet_core::{FleetError, TenantId};

use crate::recompute::RecomputationDriver;

struct TenantTask {
    interval: Duration,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TenantTask {
    /// Signal the task. It exits at its next shutdown check; the handle is
    /// detached.
    fn stop(self) {
        let _ = self.shutdown.send(true);
    }
}

pub struct RecomputationScheduler {
    driver: RecomputationDriver,
    tasks: Mutex<HashMap<TenantId, TenantTask>>,
}

impl RecomputationScheduler {
    pub fn new(driver: RecomputationDriver) -> Self {
        Self {
            driver,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start periodic passes for `tenant`.
    ///
    /// Fails with `Validation` for a zero interval and `Conflict` if the
    /// tenant already has a task.
    pub fn start(&self, tenant: &TenantId, interval: Duration) -> Result<(), FleetError> {
        if interval.is_zero() {
            return Err(FleetError::validation("recomputation interval must be positive"));
        }
        let mut tasks = self.tasks.lock();
        if tasks.get(tenant).is_some_and(|t| !t.handle.is_finished()) {
            return Err(FleetError::conflict(format!(
                "recomputation already scheduled for tenant {tenant}"
            )));
        }
        tasks.insert(tenant.clone(), self.spawn(tenant.clone(), interval));
        tracing::info!(tenant = %tenant, interval_secs = interval.as_secs(), "recomputation scheduled");
        Ok(())
    }

    /// Stop the tenant's task. Returns whether one was running.
    pub fn stop(&self, tenant: &TenantId) -> bool {
        let task = self.tasks.lock().remove(tenant);
        match task {
            Some(task) => {
                task.stop();
                tracing::info!(tenant = %tenant, "recomputation unscheduled");
                true
            }
            None => false,
        }
    }

    /// Replace the interval of a running task.
    pub fn update(&self, tenant: &TenantId, interval: Duration) -> Result<(), FleetError> {
        if interval.is_zero() {
            return Err(FleetError::validation("recomputation interval must be positive"));
        }
        let mut tasks = self.tasks.lock();
        let previous = tasks
            .remove(tenant)
            .ok_or_else(|| FleetError::not_found("recomputation schedule", tenant))?;
        previous.stop();
        tasks.insert(tenant.clone(), self.spawn(tenant.clone(), interval));
        tracing::info!(tenant = %tenant, interval_secs = interval.as_secs(), "recomputation rescheduled");
        Ok(())
    }

    pub fn is_running(&self, tenant: &TenantId) -> bool {
        self.tasks
            .lock()
            .get(tenant)
            .is_some_and(|t| !t.handle.is_finished())
    }

    pub fn interval(&self, tenant: &TenantId) -> Option<Duration> {
        self.tasks.lock().get(tenant).map(|t| t.interval)
    }

    /// Tenants with a scheduled task, sorted.
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.tasks.lock().keys().cloned().collect();
        tenants.sort();
        tenants
    }

    /// Signal every task to stop.
    pub fn shutdown_all(&self) {
        let drained: Vec<(TenantId, TenantTask)> = self.tasks.lock().drain().collect();
        for (tenant, task) in drained {
            task.stop();
            tracing::debug!(tenant = %tenant, "recomputation task stopped");
        }
    }

    fn spawn(&self, tenant: TenantId, interval: Duration) -> TenantTask {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let driver = self.driver.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = driver.run_pass(&tenant, &shutdown_rx).await {
                            tracing::warn!(tenant = %tenant, error = %e, "scheduled recomputation pass failed");
                        }
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(tenant = %tenant, "recomputation task exited");
        });
        TenantTask {
            interval,
            shutdown,
            handle,
        }
    }
}

impl Drop for RecomputationScheduler {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

impl std::fmt::Debug for RecomputationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecomputationScheduler")
            .field("tenants", &self.tenants())
            .finish()
    }
}
