//! Error taxonomy for the retention engine.

use thiserror::Error;

/// Result alias used across the retention crates.
pub type Result<T> = std::result::Result<T, RetentionError>;

#[derive(Debug, Error)]
pub enum RetentionError {
    /// Unknown field, illegal operator for the field type, or an uncoercible value.
    #[error("Invalid rule on field '{field}': {reason}")]
    InvalidRule { field: String, reason: String },

    #[error("Action '{action}' is not permitted for target '{target}'")]
    InvalidActionForTarget { target: String, action: String },

    /// A second invocation of a job that already holds its execution lock.
    #[error("Job {0} is already running")]
    JobAlreadyRunning(String),

    /// One record failed inside a batch; captured in the run details, never fatal.
    #[error("Record {record_id} failed: {reason}")]
    PerRecordExecution { record_id: String, reason: String },

    /// Resolver or compiler failure before any record was processed.
    #[error("Systemic execution failure: {0}")]
    SystemicExecution(String),

    /// Structural problem with a job definition other than its rules.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("No resolver registered for target '{0}'")]
    UnknownTarget(String),

    /// Destructive real-mode run without the typed confirmation phrase.
    #[error("Confirmation required: type '{0}' to proceed")]
    ConfirmationRequired(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RetentionError {
    pub fn invalid_rule(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn per_record(record_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PerRecordExecution {
            record_id: record_id.into(),
            reason: reason.into(),
        }
    }
}
