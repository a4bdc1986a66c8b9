//! Store traits and PostgreSQL implementations.

pub mod job;
pub mod result;

pub use job::{JobStore, PgJobStore};
pub use result::{JobResultStore, PgJobResultStore};
