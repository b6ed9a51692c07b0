//! # Retention Engine
//!
//! Scheduled, audited lifecycle transitions over school records.
//!
//! ## Architecture
//! ```text
//! JobRegistry (SQLite)          Scheduler (tokio interval) / operator
//!   └── Job {target, action, rules}          │ run(job, dry_run_override?)
//!                                            ▼
//! JobRunner ── lock ── compile rules ── resolve candidates ── execute ── log
//!                 │            │                │                 │        │
//!            job_locks  PredicateCompiler  TargetResolver   ActionExecutor │
//!                                          (paged SQLite)   Archive        │
//!                                                           Anonymize      ▼
//!                                                           Delete    ExecutionLog
//!                                                                    (append-only)
//! ```
//!
//! Dry runs walk the exact same candidate stream as real runs and skip only
//! the mutation hooks, so the reported identity set is the one a real run
//! would touch.

pub mod actions;
pub mod cron;
pub mod execution_log;
pub mod jobs;
pub mod persistence;
pub mod predicate;
pub mod records;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod schema;
pub mod targets;

pub use actions::{ActionExecutor, ExecutionOutcome, ExecutorTable, RecordFailure};
pub use execution_log::{ExecutionLog, LogStats};
pub use jobs::{Job, JobUpdate, NewJob, Operator, Rule};
pub use persistence::RetentionDb;
pub use predicate::{Predicate, compile, compile_at};
pub use records::SqliteRecords;
pub use registry::JobRegistry;
pub use runner::{JobRunner, RunPhase, RunReport, RunRequest};
pub use scheduler::spawn_scheduler;
pub use schema::{AttributeSchema, RecordHandle, SemanticType, Value};
pub use targets::{CandidateStream, TargetResolver, Targets};

use chrono::{DateTime, Utc};
use retention_core::{Result, RetentionConfig, SchedulerConfig};
use std::sync::Arc;

/// Entry point wiring the registry, runner and execution log together.
pub struct RetentionEngine {
    db: Arc<RetentionDb>,
    registry: Arc<JobRegistry>,
    runner: JobRunner,
    scheduler: SchedulerConfig,
}

impl RetentionEngine {
    pub fn new(db: Arc<RetentionDb>, targets: Targets, config: &RetentionConfig) -> Self {
        let executors = ExecutorTable::from_targets(&targets);
        let registry = Arc::new(JobRegistry::new(db.clone(), targets, executors));
        let runner = JobRunner::new(db.clone(), registry.clone(), config.engine.clone());
        Self {
            db,
            registry,
            runner,
            scheduler: config.scheduler.clone(),
        }
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    pub fn scheduler_config(&self) -> &SchedulerConfig {
        &self.scheduler
    }

    /// Run one job now.
    pub fn run(&self, job_id: &str, request: &RunRequest) -> Result<RunReport> {
        self.runner.run(job_id, request)
    }

    pub fn run_at(&self, job_id: &str, request: &RunRequest, now: DateTime<Utc>) -> Result<RunReport> {
        self.runner.run_at(job_id, request, now)
    }

    pub fn recent_logs(&self, job_id: Option<&str>, limit: usize) -> Result<Vec<ExecutionLog>> {
        self.db.recent_logs(job_id, limit)
    }

    pub fn get_log(&self, id: i64) -> Result<Option<ExecutionLog>> {
        self.db.get_log(id)
    }

    pub fn stats(&self) -> Result<LogStats> {
        self.db.log_stats()
    }
}
