//! # Device-Type Plugins
//!
//! Each device platform (`android`, `ios`, ...) may register a
//! [`DeviceTypePlugin`] that speaks to the devices of that type. The engine
//! calls it after its own transaction has committed, never inside one.
//!
//! Plugins are optional. A device type without a plugin enrolls as ACTIVE,
//! skips notifications and is returned without enrichment.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use fleet_core::{DeviceIdentifier, DeviceType, FleetError};
use fleet_state::Device;

/// Platform-side view of a device, merged into the stored device on read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginDevice {
    pub properties: BTreeMap<String, String>,
}

/// Adapter for one device platform.
#[async_trait]
pub trait DeviceTypePlugin: Send + Sync {
    /// Notify the platform that a device was enrolled.
    async fn enroll_device(&self, device: &Device) -> Result<(), PluginError>;

    /// Notify the platform that a device was disenrolled.
    async fn disenroll_device(&self, device: &Device) -> Result<(), PluginError>;

    /// Whether the device must be claimed before it becomes active.
    async fn is_claimable(&self, identifier: &DeviceIdentifier) -> Result<bool, PluginError>;

    /// Platform-side details of a device, if the platform knows it.
    async fn get_device(
        &self,
        identifier: &DeviceIdentifier,
    ) -> Result<Option<PluginDevice>, PluginError>;
}

/// Errors reported by a plugin.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("plugin for {device_type} is unavailable: {reason}")]
    Unavailable { device_type: String, reason: String },

    #[error("plugin rejected {device}: {reason}")]
    Rejected { device: String, reason: String },
}

impl From<PluginError> for FleetError {
    fn from(err: PluginError) -> Self {
        FleetError::Dependency(err.to_string())
    }
}

/// Thread-safe registry of plugins keyed by device type.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<DeviceType, Arc<dyn DeviceTypePlugin>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `plugin` for `device_type`, returning the plugin it replaced.
    pub fn register(
        &self,
        device_type: DeviceType,
        plugin: Arc<dyn DeviceTypePlugin>,
    ) -> Option<Arc<dyn DeviceTypePlugin>> {
        tracing::info!(device_type = %device_type, "device-type plugin registered");
        self.plugins.write().insert(device_type, plugin)
    }

    pub fn unregister(&self, device_type: &DeviceType) -> Option<Arc<dyn DeviceTypePlugin>> {
        let removed = self.plugins.write().remove(device_type);
        if removed.is_some() {
            tracing::info!(device_type = %device_type, "device-type plugin unregistered");
        }
        removed
    }

    /// The plugin for `device_type`. The lock is released before the
    /// caller invokes it.
    pub fn get(&self, device_type: &DeviceType) -> Option<Arc<dyn DeviceTypePlugin>> {
        self.plugins.read().get(device_type).cloned()
    }

    /// Registered device types, sorted.
    pub fn device_types(&self) -> Vec<DeviceType> {
        let mut types: Vec<DeviceType> = self.plugins.read().keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("device_types", &self.device_types())
            .finish()
    }
}
