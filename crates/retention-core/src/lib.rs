//! # Retention Core
//!
//! Shared vocabulary, error taxonomy and configuration for the data
//! retention engine.

pub mod config;
pub mod error;
pub mod types;

pub use config::{EngineConfig, RetentionConfig, SchedulerConfig};
pub use error::{Result, RetentionError};
pub use types::{Action, JobStatus, RunStatus, Target};
