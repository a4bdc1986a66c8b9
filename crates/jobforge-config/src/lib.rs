//! KDL configuration parsing for jobforge.
//!
//! This crate handles parsing of the engine configuration (`jobforge.kdl`):
//! worker count, scheduler cadence, retry defaults and the database URL.

pub mod engine;
pub mod error;

pub use engine::{EngineConfig, load_engine_config, parse_engine_config};
pub use error::{ConfigError, ConfigResult};
