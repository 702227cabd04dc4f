//! # Application State
//!
//! Shared state for the Axum application, passed to all route handlers via
//! the `State` extractor. All domain state lives behind the [`Engine`];
//! the API layer holds nothing of its own beyond configuration.

use std::sync::Arc;

use fleet_core::TenantId;
use fleet_engine::{Engine, EngineConfig, StaticDirectory};
use fleet_store::MemoryStore;

/// Errors loading [`AppConfig`] from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Tenants whose recomputation is scheduled at startup.
    pub recompute_tenants: Vec<TenantId>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            recompute_tenants: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// - `PORT` (default: 8080)
    /// - `FLEET_RECOMPUTE_TENANTS`: comma-separated tenant ids (default: none)
    ///
    /// `DATABASE_URL` is read by [`fleet_store::init_pool`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup("PORT") {
            config.port = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "PORT",
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup("FLEET_RECOMPUTE_TENANTS") {
            config.recompute_tenants = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    TenantId::new(s).map_err(|_| ConfigError::Invalid {
                        var: "FLEET_RECOMPUTE_TENANTS",
                        value: s.to_string(),
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        Ok(config)
    }
}

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub engine: Engine,
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// State over an in-memory store with an empty user directory.
    pub fn new() -> Self {
        let engine = Engine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(StaticDirectory::new()),
            EngineConfig::default(),
        );
        Self::with_engine(AppConfig::default(), engine)
    }

    pub fn with_engine(config: AppConfig, engine: Engine) -> Self {
        Self {
            engine,
            config: Arc::new(config),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
