//! Core domain types for the jobforge background-job engine.
//!
//! This crate contains:
//! - Resource identifiers
//! - The `Job` entity, its priority and lifecycle state machine
//! - The `JobResult` entity
//! - The error taxonomy shared by the other crates

pub mod error;
pub mod id;
pub mod job;
pub mod result;

pub use error::{Error, Result};
pub use id::ResourceId;
pub use job::{FailureDisposition, Job, JobOptions, JobStatus, Payload, Priority};
pub use result::JobResult;
