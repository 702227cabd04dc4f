//! # fleet-state — Enrollment Lifecycle
//!
//! - **Device** (`device.rs`): `EnrollmentStatus` transitions
//!   (`ACTIVE ⇄ INACTIVE`, `BLOCKED`, terminal `REMOVED`), the
//!   `EnrollmentInfo` row, and the `Device` record.
//!
//! - **Plan** (`plan.rs`): the enroll decision. Given the stored device (if
//!   any) and a request, decide between create, re-submission, owner
//!   reassignment and renewal after removal.
//!
//! - **Filter** (`filter.rs`): the predicate behind every device list query.
//!
//! This crate performs no I/O. Persistence and plugin calls live in
//! `fleet-store` and `fleet-engine`.

pub mod device;
pub mod filter;
pub mod plan;

pub use device::{Device, EnrollmentError, EnrollmentInfo, EnrollmentStatus, OwnershipType};
pub use filter::DeviceFilter;
pub use plan::{apply_modification, plan_enrollment, EnrollmentPlan, EnrollmentRequest};
