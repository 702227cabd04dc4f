//! Engine configuration.
//!
//! Defaults suit a single-node deployment. Override via environment
//! variables or explicit construction for tests.

use std::time::Duration;

/// Tuning knobs of the recomputation machinery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Name recorded on ledger leases taken by this process.
    pub worker_id: String,
    /// How long a claimed ledger entry stays leased before another worker
    /// may take it over.
    pub lease_ttl: Duration,
    /// Maximum ledger entries claimed per pass.
    pub claim_batch: usize,
    /// How many times a device write that lost a revision race is
    /// re-resolved before the entry is released.
    pub conflict_retries: u32,
    /// Interval used by the scheduler when none is given.
    pub recompute_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: "fleet-engine".to_string(),
            lease_ttl: Duration::from_secs(300),
            claim_batch: 64,
            conflict_retries: 3,
            recompute_interval: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Variables:
    /// - `FLEET_WORKER_ID` (default: `fleet-engine`)
    /// - `FLEET_LEASE_TTL_SECS` (default: 300, must be > 0)
    /// - `FLEET_CLAIM_BATCH` (default: 64, must be > 0)
    /// - `FLEET_CONFLICT_RETRIES` (default: 3)
    /// - `FLEET_RECOMPUTE_INTERVAL_SECS` (default: 60, must be > 0)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup. Unset variables keep their
    /// defaults; set but malformed ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let worker_id = lookup("FLEET_WORKER_ID")
            .filter(|w| !w.trim().is_empty())
            .unwrap_or(defaults.worker_id);
        let lease_ttl = match lookup("FLEET_LEASE_TTL_SECS") {
            Some(raw) => Duration::from_secs(positive("FLEET_LEASE_TTL_SECS", &raw)?),
            None => defaults.lease_ttl,
        };
        let claim_batch = match lookup("FLEET_CLAIM_BATCH") {
            Some(raw) => usize::try_from(positive("FLEET_CLAIM_BATCH", &raw)?)
                .map_err(|_| ConfigError::invalid("FLEET_CLAIM_BATCH", &raw))?,
            None => defaults.claim_batch,
        };
        let conflict_retries = match lookup("FLEET_CONFLICT_RETRIES") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("FLEET_CONFLICT_RETRIES", &raw))?,
            None => defaults.conflict_retries,
        };
        let recompute_interval = match lookup("FLEET_RECOMPUTE_INTERVAL_SECS") {
            Some(raw) => Duration::from_secs(positive("FLEET_RECOMPUTE_INTERVAL_SECS", &raw)?),
            None => defaults.recompute_interval,
        };
        Ok(Self {
            worker_id,
            lease_ttl,
            claim_batch,
            conflict_retries,
            recompute_interval,
        })
    }
}

fn positive(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::invalid(var, raw)),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str) -> Self {
        Self::Invalid {
            var,
            value: value.to_string(),
        }
    }
}
