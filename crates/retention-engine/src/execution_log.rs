//! Execution log: one immutable audit row per run attempt.

use chrono::{DateTime, Utc};
use retention_core::{Action, RetentionError, RunStatus, Target};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::actions::ExecutionOutcome;

/// A persisted audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: i64,
    /// Cleared when the job is deleted; the row itself stays.
    pub job_id: Option<String>,
    pub job_name: String,
    pub target: Target,
    pub action: Action,
    pub records_affected: u64,
    pub records_failed: u64,
    pub is_dry_run: bool,
    pub initiated_by: String,
    pub status: RunStatus,
    pub details: String,
    /// Full identity set of affected (or would-be affected) records.
    pub record_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit row before it is appended.
#[derive(Debug, Clone)]
pub struct NewExecutionLog {
    pub job_id: Option<String>,
    pub job_name: String,
    pub target: Target,
    pub action: Action,
    pub records_affected: u64,
    pub records_failed: u64,
    pub is_dry_run: bool,
    pub initiated_by: String,
    pub status: RunStatus,
    pub details: String,
    pub record_ids: Vec<String>,
}

/// Aggregates over the whole log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogStats {
    pub total_runs: u64,
    pub failed_runs: u64,
    pub dry_runs: u64,
    /// Totals below only count successful real runs.
    pub records_archived: u64,
    pub records_anonymized: u64,
    pub records_deleted: u64,
}

impl LogStats {
    pub fn records_for(&self, action: Action) -> u64 {
        match action {
            Action::Archive => self.records_archived,
            Action::Anonymize => self.records_anonymized,
            Action::Delete => self.records_deleted,
        }
    }
}

fn mode(dry_run: bool) -> &'static str {
    if dry_run { "dry run" } else { "real run" }
}

/// Human-readable summary of a completed execution.
pub fn outcome_details(
    action: Action,
    target: Target,
    dry_run: bool,
    outcome: &ExecutionOutcome,
    id_limit: usize,
) -> String {
    let verb = if dry_run { "would affect" } else { "affected" };
    let mut out = format!(
        "{action} on {target} ({}): {verb} {} record(s), skipped {}, failed {}",
        mode(dry_run),
        outcome.count(),
        outcome.skipped,
        outcome.failed()
    );

    if !outcome.affected.is_empty() {
        let shown: Vec<&str> = outcome.affected.iter().take(id_limit).map(String::as_str).collect();
        let _ = write!(out, "\nids: {}", shown.join(", "));
        if outcome.affected.len() > shown.len() {
            let _ = write!(out, " (+{} more)", outcome.affected.len() - shown.len());
        }
    }
    for failure in &outcome.failures {
        let _ = write!(out, "\nerror {}: {}", failure.record_id, failure.reason);
    }
    if let Some(e) = &outcome.stream_error {
        let _ = write!(out, "\nstream stopped: {e}");
    }
    out
}

/// Summary of a run that failed before any record was processed.
pub fn error_details(action: Action, target: Target, dry_run: bool, error: &RetentionError) -> String {
    format!("{action} on {target} ({}): aborted: {error}", mode(dry_run))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::RecordFailure;

    #[test]
    fn test_details_truncate_ids_and_list_every_failure() {
        let outcome = ExecutionOutcome {
            affected: (1..=5).map(|i| format!("r{i}")).collect(),
            skipped: 2,
            failures: vec![RecordFailure {
                record_id: "r9".into(),
                reason: "row locked".into(),
            }],
            stream_error: None,
        };
        let details = outcome_details(Action::Archive, Target::Students, false, &outcome, 3);
        assert!(details.starts_with("archive on students (real run): affected 5 record(s), skipped 2, failed 1"));
        assert!(details.contains("ids: r1, r2, r3 (+2 more)"));
        assert!(details.contains("error r9: row locked"));
    }

    #[test]
    fn test_error_details_name_the_cause() {
        let err = RetentionError::invalid_rule("ssn", "unknown field");
        let details = error_details(Action::Delete, Target::Guardians, true, &err);
        assert!(details.contains("dry run"));
        assert!(details.contains("ssn"));
    }
}
