//! Job scheduling and execution for jobforge.
//!
//! Holds ready jobs in an in-memory priority queue, promotes scheduled jobs
//! from the store on a fixed interval, and dispatches work to a pool of
//! workers that run registered handlers.

pub mod engine;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use engine::Engine;
pub use queue::PriorityQueue;
pub use registry::{HandlerRegistry, HandlerResult, JobContext, JobHandler};
pub use scheduler::Scheduler;
pub use worker::Worker;
