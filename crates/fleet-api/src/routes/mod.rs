//! # API Route Modules
//!
//! - `devices` — enrollment lifecycle, on-demand resolution and the
//!   effective-policy cache of a device.
//! - `policies` — policy CRUD, priorities and scope assignment.
//! - `recomputation` — on-demand passes, pending ledger entries and the
//!   per-tenant schedule.

pub mod devices;
pub mod policies;
pub mod recomputation;
