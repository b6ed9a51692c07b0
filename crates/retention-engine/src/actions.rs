//! Action executors: Archive, Anonymize and Delete.
//!
//! Every executor runs the same loop over a candidate stream. In simulate mode
//! the loop records which ids it would touch and never calls a mutation hook,
//! so a dry run and the real run that follows agree on the affected set.

use chrono::{DateTime, Utc};
use retention_core::{Action, Result, RetentionError, RunStatus, Target};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::predicate::Predicate;
use crate::schema::{Marker, RecordHandle};
use crate::targets::{CandidateStream, TargetResolver, Targets};

/// A record that could not be transitioned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordFailure {
    pub record_id: String,
    pub reason: String,
}

/// What one execution did, or would do in simulate mode.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionOutcome {
    /// Records transitioned (or that would be), in candidate order.
    pub affected: Vec<String>,
    /// Candidates already carrying the action's marker.
    pub skipped: u64,
    pub failures: Vec<RecordFailure>,
    /// Candidate stream broke after some records were processed.
    pub stream_error: Option<String>,
}

impl ExecutionOutcome {
    pub fn count(&self) -> u64 {
        self.affected.len() as u64
    }

    pub fn failed(&self) -> u64 {
        self.failures.len() as u64
    }

    /// Failed only when nothing succeeded and something went wrong.
    pub fn status(&self) -> RunStatus {
        let had_errors = !self.failures.is_empty() || self.stream_error.is_some();
        if self.affected.is_empty() && had_errors {
            RunStatus::Failed
        } else {
            RunStatus::Success
        }
    }
}

/// One lifecycle transition, applied record by record.
pub trait ActionExecutor: Send + Sync {
    fn action(&self) -> Action;

    /// Marker set by this action. Records carrying it are skipped.
    fn marker(&self) -> Marker;

    /// Mutate one record through the resolver's hook.
    fn apply(&self, resolver: &dyn TargetResolver, record: &RecordHandle, now: DateTime<Utc>) -> Result<()>;

    /// Narrow the job's predicate to records this action can still change.
    fn narrow(&self, predicate: Predicate) -> Predicate {
        predicate.require_unset(Marker::Deleted).require_unset(self.marker())
    }

    fn already_applied(&self, record: &RecordHandle) -> bool {
        record.marker(self.marker()).is_some()
    }

    fn execute(
        &self,
        resolver: &dyn TargetResolver,
        candidates: CandidateStream<'_>,
        simulate: bool,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome> {
        let mut outcome = ExecutionOutcome::default();
        let mut processed = 0usize;

        for item in candidates {
            let record = match item {
                Ok(record) => record,
                Err(e) if processed == 0 => {
                    return Err(RetentionError::SystemicExecution(e.to_string()));
                }
                Err(e) => {
                    warn!("⚠️ {} on {}: candidate stream failed after {processed} records: {e}", self.action(), resolver.target());
                    outcome.stream_error = Some(e.to_string());
                    break;
                }
            };
            processed += 1;

            if self.already_applied(&record) {
                outcome.skipped += 1;
                continue;
            }
            if simulate {
                outcome.affected.push(record.id);
                continue;
            }

            match self.apply(resolver, &record, now) {
                Ok(()) => outcome.affected.push(record.id),
                Err(e) => {
                    let reason = match e {
                        RetentionError::PerRecordExecution { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    warn!("⚠️ {} {}/{} failed: {reason}", self.action(), resolver.target(), record.id);
                    outcome.failures.push(RecordFailure {
                        record_id: record.id,
                        reason,
                    });
                }
            }
        }
        Ok(outcome)
    }
}

/// Sets `archived_at` and the entity's archived status.
pub struct ArchiveExecutor;

impl ActionExecutor for ArchiveExecutor {
    fn action(&self) -> Action {
        Action::Archive
    }

    fn marker(&self) -> Marker {
        Marker::Archived
    }

    fn apply(&self, resolver: &dyn TargetResolver, record: &RecordHandle, now: DateTime<Utc>) -> Result<()> {
        resolver.archive(&record.id, now)
    }
}

/// Replaces personal fields with derived placeholders and sets `anonymized_at`.
pub struct AnonymizeExecutor;

impl ActionExecutor for AnonymizeExecutor {
    fn action(&self) -> Action {
        Action::Anonymize
    }

    fn marker(&self) -> Marker {
        Marker::Anonymized
    }

    fn apply(&self, resolver: &dyn TargetResolver, record: &RecordHandle, now: DateTime<Utc>) -> Result<()> {
        let target = resolver.target();
        let scramble = |column: &str| placeholder(target, &record.id, column);
        resolver.anonymize(&record.id, &scramble, now)
    }
}

/// Soft delete: sets `deleted_at`, the row stays.
pub struct DeleteExecutor;

impl ActionExecutor for DeleteExecutor {
    fn action(&self) -> Action {
        Action::Delete
    }

    fn marker(&self) -> Marker {
        Marker::Deleted
    }

    fn apply(&self, resolver: &dyn TargetResolver, record: &RecordHandle, now: DateTime<Utc>) -> Result<()> {
        resolver.soft_delete(&record.id, now)
    }
}

/// Stable placeholder for an anonymized column. Derived only from the
/// record's identity, never from the value it replaces.
pub fn placeholder(target: Target, record_id: &str, column: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("retention:anonymize:{target}:{record_id}:{column}"));
    let digest = format!("{:x}", hasher.finalize());
    format!("anon-{}", &digest[..12])
}

fn executor_for(action: Action) -> Arc<dyn ActionExecutor> {
    match action {
        Action::Archive => Arc::new(ArchiveExecutor),
        Action::Anonymize => Arc::new(AnonymizeExecutor),
        Action::Delete => Arc::new(DeleteExecutor),
    }
}

/// `(target, action)` -> executor, for every pair some target permits.
#[derive(Clone, Default)]
pub struct ExecutorTable {
    entries: HashMap<(Target, Action), Arc<dyn ActionExecutor>>,
}

impl ExecutorTable {
    pub fn from_targets(targets: &Targets) -> Self {
        let mut entries = HashMap::new();
        for resolver in targets.iter() {
            for action in resolver.permitted_actions() {
                entries.insert((resolver.target(), *action), executor_for(*action));
            }
        }
        Self { entries }
    }

    pub fn get(&self, target: Target, action: Action) -> Result<Arc<dyn ActionExecutor>> {
        self.entries
            .get(&(target, action))
            .cloned()
            .ok_or_else(|| RetentionError::InvalidActionForTarget {
                target: target.to_string(),
                action: action.to_string(),
            })
    }

    pub fn supports(&self, target: Target, action: Action) -> bool {
        self.entries.contains_key(&(target, action))
    }

    /// Supported pairs in a stable order.
    pub fn pairs(&self) -> Vec<(Target, Action)> {
        let mut pairs: Vec<_> = self.entries.keys().copied().collect();
        pairs.sort();
        pairs
    }
}
