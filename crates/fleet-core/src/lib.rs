//! # fleet-core — Foundational Types for the Fleet Policy Engine
//!
//! Every other crate in the workspace depends on `fleet-core`; it depends on
//! nothing internal.
//!
//! ## Key Design Principles
//!
//! 1. **Newtype wrappers for identifiers.** `TenantId`, `DeviceId`,
//!    `PolicyId`, `DeviceType` and friends are distinct types with validated
//!    constructors. A device id cannot be passed where a policy id is expected.
//!
//! 2. **Explicit tenant.** There is no ambient tenant context. Every store
//!    and service call takes a `&TenantId`.
//!
//! 3. **`CanonicalBytes` for snapshots.** Policy snapshots and their
//!    fingerprints flow through `CanonicalBytes::new()` so that resolving the
//!    same inputs twice yields byte-identical records.
//!
//! 4. **One error taxonomy.** [`FleetError`] distinguishes invalid requests,
//!    retryable persistence failures, missing records, races, and degraded
//!    collaborators.
//!
//! ## Crate Policy
//!
//! - No dependencies on other `fleet-*` crates.
//! - No `unsafe` code.
//! - No `panic!()` or `.unwrap()` outside tests.

pub mod canonical;
pub mod digest;
pub mod error;
pub mod identity;
pub mod temporal;

pub use canonical::CanonicalBytes;
pub use digest::{sha256_digest, ContentDigest};
pub use error::{CanonicalizationError, ErrorKind, FleetError};
pub use identity::{
    DeviceId, DeviceIdentifier, DeviceType, EnrollmentId, LeaseId, PolicyId, ProfileId, TenantId,
};
pub use temporal::Timestamp;
