//! # fleet-engine — Enrollment, Policy and Recomputation Services
//!
//! The services over a [`fleet_store::FleetStore`]:
//!
//! - **Enrollment** (`enrollment.rs`): enroll, modify, disenroll and
//!   administrative status changes, with device-type plugin hooks.
//! - **Policies** (`policies.rs`): policy CRUD, priority reordering and
//!   scope assignment.
//! - **Resolver** (`resolver.rs`): the single effective policy of a device.
//! - **Cache** (`cache.rs`): revision-checked effective-policy records.
//! - **Ledger** (`ledger.rs`): leased claims on dirty `(policy, type)` pairs.
//! - **Recompute** (`recompute.rs`): one pass from ledger claims to cache
//!   writes.
//! - **Scheduler** (`scheduler.rs`): periodic passes per tenant.
//! - **Engine** (`engine.rs`): the facade wiring all of the above.
//!
//! Collaborators outside the store sit behind traits: [`DeviceTypePlugin`]
//! (looked up per device type in a [`PluginRegistry`]) and
//! [`UserDirectory`] (role membership). Both degrade gracefully; neither is
//! ever called while a store transaction is open.

pub mod cache;
pub mod config;
pub mod directory;
pub mod engine;
pub mod enrollment;
pub mod ledger;
pub mod plugin;
pub mod policies;
pub mod recompute;
pub mod resolver;
pub mod scheduler;

pub use cache::EffectivePolicyCache;
pub use config::{ConfigError, EngineConfig};
pub use directory::{DirectoryError, StaticDirectory, UserDirectory};
pub use engine::Engine;
pub use enrollment::{EnrollAction, Enrolled, EnrollmentService};
pub use ledger::ChangePropagationLedger;
pub use plugin::{DeviceTypePlugin, PluginDevice, PluginError, PluginRegistry};
pub use policies::PolicyAdministrator;
pub use recompute::{DeviceOutcome, PassReport, RecomputationDriver};
pub use resolver::{PolicyResolver, Resolution, ResolvedPolicy};
pub use scheduler::RecomputationScheduler;
