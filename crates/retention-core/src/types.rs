//! Shared vocabulary: targets, lifecycle actions and job/run states.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RetentionError;

/// Record type a job operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Students,
    Guardians,
    SystemLogs,
    FinancialRecords,
    AssessmentMedia,
}

impl Target {
    pub const ALL: [Target; 5] = [
        Target::Students,
        Target::Guardians,
        Target::SystemLogs,
        Target::FinancialRecords,
        Target::AssessmentMedia,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Students => "students",
            Target::Guardians => "guardians",
            Target::SystemLogs => "system_logs",
            Target::FinancialRecords => "financial_records",
            Target::AssessmentMedia => "assessment_media",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = RetentionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Target::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized || t.as_str().replace('_', "") == normalized)
            .ok_or_else(|| RetentionError::UnknownTarget(s.to_string()))
    }
}

/// Lifecycle transition, in increasing order of irreversibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Archive,
    Anonymize,
    Delete,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::Archive, Action::Anonymize, Action::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Archive => "archive",
            Action::Anonymize => "anonymize",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = RetentionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == normalized)
            .ok_or_else(|| RetentionError::Config(format!("Unknown action '{s}'")))
    }
}

/// Whether the scheduler picks a job up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Active,
    Paused,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = RetentionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(JobStatus::Active),
            "paused" => Ok(JobStatus::Paused),
            other => Err(RetentionError::Database(format!("Unknown job status '{other}'"))),
        }
    }
}

/// Outcome of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = RetentionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(RetentionError::Database(format!("Unknown run status '{other}'"))),
        }
    }
}
