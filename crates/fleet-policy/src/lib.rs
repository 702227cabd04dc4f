//! # fleet-policy — Policy Model and Selection
//!
//! Pure policy logic with no I/O:
//!
//! - **Model** (`model.rs`): `Policy`, `Profile`, `ComplianceMode`, draft
//!   validation, and the crate's `PolicyError`.
//! - **Scope** (`scope.rs`): `PolicyScope` assignments and their
//!   specificity order.
//! - **Priority** (`priority.rs`): priority allocation for new policies and
//!   the bulk reordering check.
//! - **Select** (`select.rs`): the effective-policy selection rule.
//! - **Snapshot** (`snapshot.rs`): the versioned canonical snapshot codec.
//! - **Effective** (`effective.rs`): cached records, revisions, put outcomes.
//! - **Ledger** (`ledger.rs`): change-ledger entries, leases and claims.

pub mod effective;
pub mod ledger;
pub mod model;
pub mod priority;
pub mod scope;
pub mod select;
pub mod snapshot;

pub use effective::{EffectivePolicyRecord, EffectivePolicyWrite, ExpectedRevision, PutOutcome};
pub use ledger::{ClaimRequest, ClaimedEntry, CompleteOutcome, Lease, LedgerEntry, LedgerKey};
pub use model::{
    ComplianceMode, Policy, PolicyDraft, PolicyError, Profile, ProfileFeature, ProfileInput,
};
pub use priority::{check_reorder, next_priority, PriorityChange};
pub use scope::{normalize_batch, PolicyScope, PolicyScopes, ScopeKind};
pub use select::{select_effective, Candidate, Subject};
pub use snapshot::{PolicySnapshot, SnapshotError, SNAPSHOT_VERSION};
