//! Job runner: one invocation from lock to audit row.
//!
//! ```text
//! Queued -> Resolving -> Executing -> Logged -> Done
//!               |             |
//!               +-------------+-----> Logged -> Errored
//! ```
//!
//! Every invocation that gets past the lock writes exactly one execution log
//! row, whatever happens after that.

use chrono::{DateTime, Duration, Utc};
use retention_core::{Action, EngineConfig, Result, RetentionError, RunStatus};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::actions::{ActionExecutor, ExecutionOutcome};
use crate::execution_log::{ExecutionLog, NewExecutionLog, error_details, outcome_details};
use crate::jobs::{Job, verify_delete_confirmation};
use crate::persistence::RetentionDb;
use crate::predicate::{Predicate, compile_at};
use crate::registry::JobRegistry;
use crate::schema::RecordHandle;
use crate::targets::{CandidateStream, TargetResolver};

/// Identity recorded for unattended runs.
pub const SCHEDULER: &str = "Scheduler";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Queued,
    Resolving,
    Executing,
    Logged,
    Done,
    Errored,
}

/// Per-invocation options.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Takes precedence over the job's stored default for this run only.
    pub dry_run_override: Option<bool>,
    pub initiated_by: String,
    /// `DELETE <job name>`, needed to force a Delete job into real mode.
    pub confirmation: Option<String>,
}

impl RunRequest {
    pub fn scheduled() -> Self {
        Self {
            dry_run_override: None,
            initiated_by: SCHEDULER.to_string(),
            confirmation: None,
        }
    }

    pub fn manual(user: &str) -> Self {
        Self {
            dry_run_override: None,
            initiated_by: user.to_string(),
            confirmation: None,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run_override = Some(dry_run);
        self
    }

    pub fn confirm(mut self, phrase: &str) -> Self {
        self.confirmation = Some(phrase.to_string());
        self
    }
}

/// Result of one logged invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub job_id: String,
    pub phase: RunPhase,
    pub dry_run: bool,
    /// Absent when the run aborted before executing.
    pub outcome: Option<ExecutionOutcome>,
    pub log: ExecutionLog,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        self.log.status
    }

    pub fn records_affected(&self) -> u64 {
        self.log.records_affected
    }

    pub fn record_ids(&self) -> &[String] {
        &self.log.record_ids
    }
}

/// Advisory execution lock, released on drop. A live run keeps it fresh
/// through [`JobLock::touch`]; only an abandoned lock goes stale.
struct JobLock<'a> {
    db: &'a RetentionDb,
    job_id: String,
    holder: String,
}

impl<'a> JobLock<'a> {
    fn acquire(db: &'a RetentionDb, job_id: &str, stale_after: Duration) -> Result<Self> {
        let holder = uuid::Uuid::new_v4().to_string();
        if !db.try_lock_job(job_id, &holder, Utc::now(), stale_after)? {
            return Err(RetentionError::JobAlreadyRunning(job_id.to_string()));
        }
        Ok(Self {
            db,
            job_id: job_id.to_string(),
            holder,
        })
    }

    /// Refresh the heartbeat. False once another run has taken the lock over.
    fn touch(&self) -> Result<bool> {
        self.db.touch_lock(&self.job_id, &self.holder, Utc::now())
    }
}

impl Drop for JobLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.db.unlock_job(&self.job_id, &self.holder) {
            error!("Failed to release lock on job {}: {e}", self.job_id);
        }
    }
}

/// Candidate stream that beats the job lock as records are pulled.
struct Heartbeat<'s, 'l> {
    inner: CandidateStream<'s>,
    lock: &'l JobLock<'l>,
    every: std::time::Duration,
    last: Instant,
    lost: bool,
}

impl Iterator for Heartbeat<'_, '_> {
    type Item = Result<RecordHandle>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.lost {
            return None;
        }
        if self.last.elapsed() >= self.every {
            self.last = Instant::now();
            let lost = match self.lock.touch() {
                Ok(true) => None,
                Ok(false) => Some(RetentionError::SystemicExecution(format!(
                    "execution lock on job {} was taken over",
                    self.lock.job_id
                ))),
                Err(e) => Some(e),
            };
            if let Some(e) = lost {
                warn!("🔒 Stopping job {}: {e}", self.lock.job_id);
                self.lost = true;
                return Some(Err(e));
            }
            debug!("Job {}: lock heartbeat", self.lock.job_id);
        }
        self.inner.next()
    }
}

type Resolved = (Arc<dyn TargetResolver>, Arc<dyn ActionExecutor>, Predicate);

/// Orchestrates single job invocations.
pub struct JobRunner {
    db: Arc<RetentionDb>,
    registry: Arc<JobRegistry>,
    config: EngineConfig,
}

impl JobRunner {
    pub fn new(db: Arc<RetentionDb>, registry: Arc<JobRegistry>, config: EngineConfig) -> Self {
        Self { db, registry, config }
    }

    pub fn run(&self, job_id: &str, request: &RunRequest) -> Result<RunReport> {
        self.run_at(job_id, request, Utc::now())
    }

    /// Run a job with relative rule dates resolved against `now`.
    ///
    /// Errors returned here mean no run began and nothing was logged:
    /// unknown job, missing confirmation, lock contention, or a failed
    /// audit write.
    pub fn run_at(&self, job_id: &str, request: &RunRequest, now: DateTime<Utc>) -> Result<RunReport> {
        let job = self.registry.get(job_id)?;
        let dry_run = request.dry_run_override.unwrap_or(job.is_dry_run_default);

        if job.action == Action::Delete && request.dry_run_override == Some(false) {
            verify_delete_confirmation(&job.name, request.confirmation.as_deref())?;
        }

        let stale_after = i64::try_from(self.config.lock_stale_after_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        let lock = JobLock::acquire(&self.db, &job.id, stale_after)?;
        let heartbeat = stale_after
            .to_std()
            .map(|d| d / 4)
            .unwrap_or(std::time::Duration::MAX);

        info!(
            "▶️ Running job '{}' ({} {}, {}) for {}",
            job.name,
            job.action,
            job.target,
            if dry_run { "dry run" } else { "REAL" },
            request.initiated_by
        );

        debug!("Job {}: {:?}", job.id, RunPhase::Resolving);
        let (phase, outcome, details) = match self.resolve(&job, now) {
            Err(e) => {
                warn!("❌ Job '{}' could not resolve: {e}", job.name);
                (RunPhase::Errored, None, error_details(job.action, job.target, dry_run, &e))
            }
            Ok((resolver, executor, predicate)) => {
                debug!("Job {}: {:?} with predicate {predicate}", job.id, RunPhase::Executing);
                let run = Self::execute(resolver.as_ref(), executor.as_ref(), &predicate, &lock, heartbeat, dry_run, now);
                match run {
                    Ok(outcome) => {
                        let details = outcome_details(
                            job.action,
                            job.target,
                            dry_run,
                            &outcome,
                            self.config.details_id_limit,
                        );
                        (RunPhase::Done, Some(outcome), details)
                    }
                    Err(e) => {
                        warn!("❌ Job '{}' aborted: {e}", job.name);
                        (RunPhase::Errored, None, error_details(job.action, job.target, dry_run, &e))
                    }
                }
            }
        };

        let status = match (&phase, &outcome) {
            (RunPhase::Done, Some(o)) => o.status(),
            _ => RunStatus::Failed,
        };
        let entry = NewExecutionLog {
            job_id: Some(job.id.clone()),
            job_name: job.name.clone(),
            target: job.target,
            action: job.action,
            records_affected: outcome.as_ref().map_or(0, |o| o.count()),
            records_failed: outcome.as_ref().map_or(0, |o| o.failed()),
            is_dry_run: dry_run,
            initiated_by: request.initiated_by.clone(),
            status,
            details,
            record_ids: outcome.as_ref().map(|o| o.affected.clone()).unwrap_or_default(),
        };
        let log = self.db.append_log(&entry).map_err(|e| {
            error!("Audit write failed for job {}: {e}", job.id);
            e
        })?;
        debug!("Job {}: {:?} as entry #{}", job.id, RunPhase::Logged, log.id);

        if let Err(e) = self.registry.record_run(&job.id, now, status) {
            warn!("Failed to stamp last run on job {}: {e}", job.id);
        }

        match status {
            RunStatus::Success => info!(
                "✅ Job '{}' {}: {} record(s)",
                job.name,
                if dry_run { "simulated" } else { "finished" },
                log.records_affected
            ),
            RunStatus::Failed => info!("❌ Job '{}' failed (log #{})", job.name, log.id),
        }

        Ok(RunReport {
            job_id: job.id,
            phase,
            dry_run,
            outcome,
            log,
        })
    }

    /// Compile the job against its target's current schema and pick the executor.
    fn resolve(&self, job: &Job, now: DateTime<Utc>) -> Result<Resolved> {
        let resolver = self.registry.targets().get(job.target)?;
        let executor = self.registry.executors().get(job.target, job.action)?;
        let predicate = compile_at(&job.rules, resolver.schema(), now)?;
        let predicate = executor.narrow(predicate);
        Ok((resolver, executor, predicate))
    }

    fn execute(
        resolver: &dyn TargetResolver,
        executor: &dyn ActionExecutor,
        predicate: &Predicate,
        lock: &JobLock<'_>,
        heartbeat: std::time::Duration,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome> {
        let candidates = resolver
            .list_candidates(predicate)
            .map_err(|e| RetentionError::SystemicExecution(e.to_string()))?;
        let candidates = Box::new(Heartbeat {
            inner: candidates,
            lock,
            every: heartbeat,
            last: Instant::now(),
            lost: false,
        });
        executor.execute(resolver, candidates, dry_run, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ExecutorTable;
    use crate::jobs::{NewJob, Operator, Rule};
    use crate::records::SqliteRecords;
    use crate::schema::AttributeSchema;
    use crate::targets::Targets;
    use retention_core::Target;
    use rusqlite::types::Value as SqlValue;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        db: Arc<RetentionDb>,
        records: SqliteRecords,
        registry: Arc<JobRegistry>,
        runner: JobRunner,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(RetentionDb::open(&PathBuf::from(":memory:")).unwrap());
        let records = SqliteRecords::open(&PathBuf::from(":memory:"), 2).unwrap();
        let targets = records.targets();
        let executors = ExecutorTable::from_targets(&targets);
        let registry = Arc::new(JobRegistry::new(db.clone(), targets, executors));
        let runner = JobRunner::new(db.clone(), registry.clone(), EngineConfig::default());
        for (id, level) in [("l1", "debug"), ("l2", "info"), ("l3", "debug")] {
            records
                .insert(Target::SystemLogs, id, &[("level", SqlValue::Text(level.into()))])
                .unwrap();
        }
        Fixture {
            db,
            records,
            registry,
            runner,
        }
    }

    fn debug_purge(f: &Fixture) -> Job {
        f.registry
            .create(
                NewJob::new("Purge debug logs", Target::SystemLogs, Action::Delete)
                    .with_rule(Rule::new("level", Operator::Eq, "debug")),
            )
            .unwrap()
    }

    #[test]
    fn test_default_dry_run_then_confirmed_real_run() {
        let f = fixture();
        let job = debug_purge(&f);

        let dry = f.runner.run(&job.id, &RunRequest::manual("ops")).unwrap();
        assert!(dry.dry_run);
        assert_eq!(dry.phase, RunPhase::Done);
        assert_eq!(dry.record_ids(), ["l1", "l3"]);
        assert_eq!(f.records.list(Target::SystemLogs, false).unwrap().len(), 3);

        let real = f
            .runner
            .run(&job.id, &RunRequest::manual("ops").dry_run(false).confirm("DELETE Purge debug logs"))
            .unwrap();
        assert!(!real.dry_run);
        assert_eq!(real.record_ids(), dry.record_ids());
        assert_eq!(f.records.list(Target::SystemLogs, false).unwrap().len(), 1);

        let stamped = f.registry.get(&job.id).unwrap();
        assert_eq!(stamped.last_run_status, Some(RunStatus::Success));
        assert!(stamped.last_run_at.is_some());
        assert!(stamped.is_dry_run_default);
    }

    #[test]
    fn test_forced_delete_without_confirmation_is_not_logged() {
        let f = fixture();
        let job = debug_purge(&f);
        let err = f
            .runner
            .run(&job.id, &RunRequest::manual("ops").dry_run(false))
            .unwrap_err();
        assert!(matches!(err, RetentionError::ConfirmationRequired(_)));
        assert!(f.db.recent_logs(Some(&job.id), 10).unwrap().is_empty());
        assert_eq!(f.records.list(Target::SystemLogs, false).unwrap().len(), 3);
    }

    #[test]
    fn test_concurrent_invocation_rejected_without_log() {
        let f = fixture();
        let job = debug_purge(&f);
        assert!(f.db.try_lock_job(&job.id, "other-run", Utc::now(), Duration::hours(1)).unwrap());

        let err = f.runner.run(&job.id, &RunRequest::scheduled()).unwrap_err();
        assert!(matches!(err, RetentionError::JobAlreadyRunning(id) if id == job.id));
        assert!(f.db.recent_logs(Some(&job.id), 10).unwrap().is_empty());

        f.db.unlock_job(&job.id, "other-run").unwrap();
        assert!(f.runner.run(&job.id, &RunRequest::scheduled()).is_ok());
    }

    #[test]
    fn test_lock_released_after_run() {
        let f = fixture();
        let job = debug_purge(&f);
        f.runner.run(&job.id, &RunRequest::scheduled()).unwrap();
        f.runner.run(&job.id, &RunRequest::scheduled()).unwrap();
        assert_eq!(f.db.recent_logs(Some(&job.id), 10).unwrap().len(), 2);
    }

    /// Archives every record, slowly.
    struct SlowArchive {
        schema: AttributeSchema,
        per_record: std::time::Duration,
        archived: AtomicUsize,
    }

    impl TargetResolver for SlowArchive {
        fn target(&self) -> Target {
            Target::SystemLogs
        }
        fn schema(&self) -> &AttributeSchema {
            &self.schema
        }
        fn permitted_actions(&self) -> &[Action] {
            &[Action::Archive]
        }
        fn list_candidates<'a>(&'a self, _predicate: &'a Predicate) -> Result<CandidateStream<'a>> {
            Ok(Box::new((1..=4).map(|i| Ok(RecordHandle::new(format!("r{i}"))))))
        }
        fn fetch(&self, _id: &str, _include_deleted: bool) -> Result<Option<RecordHandle>> {
            Ok(None)
        }
        fn archive(&self, _id: &str, _at: DateTime<Utc>) -> Result<()> {
            std::thread::sleep(self.per_record);
            self.archived.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_run_longer_than_stale_window_keeps_its_lock() {
        let db = Arc::new(RetentionDb::open(&PathBuf::from(":memory:")).unwrap());
        let slow = Arc::new(SlowArchive {
            schema: AttributeSchema::new(Target::SystemLogs, vec![]),
            per_record: std::time::Duration::from_millis(400),
            archived: AtomicUsize::new(0),
        });
        let targets = Targets::new().with(slow.clone());
        let executors = ExecutorTable::from_targets(&targets);
        let registry = Arc::new(JobRegistry::new(db.clone(), targets, executors));
        let config = EngineConfig {
            lock_stale_after_secs: 1,
            ..EngineConfig::default()
        };
        let runner = JobRunner::new(db.clone(), registry.clone(), config);
        let job = registry
            .create(NewJob::new("Archive slowly", Target::SystemLogs, Action::Archive).with_dry_run_default(false))
            .unwrap();

        // four records at 400ms each outlast the one second stale window
        let (first, second) = std::thread::scope(|s| {
            let first = s.spawn(|| runner.run(&job.id, &RunRequest::manual("first")));
            std::thread::sleep(std::time::Duration::from_millis(1100));
            let second = runner.run(&job.id, &RunRequest::manual("second"));
            (first.join().unwrap(), second)
        });

        assert!(matches!(second, Err(RetentionError::JobAlreadyRunning(id)) if id == job.id));
        let first = first.unwrap();
        assert_eq!(first.record_ids(), ["r1", "r2", "r3", "r4"]);
        assert_eq!(slow.archived.load(Ordering::SeqCst), 4);
        assert_eq!(db.recent_logs(Some(&job.id), 10).unwrap().len(), 1);
    }

    #[test]
    fn test_schema_drift_logs_failed_run() {
        let f = fixture();
        // Bypass the registry to store a rule the schema no longer accepts
        let job = Job::from_new(
            NewJob::new("Drifted", Target::SystemLogs, Action::Archive)
                .with_rule(Rule::new("hostname", Operator::Eq, "db-1")),
        );
        f.db.insert_job(&job).unwrap();

        let report = f.runner.run(&job.id, &RunRequest::scheduled()).unwrap();
        assert_eq!(report.phase, RunPhase::Errored);
        assert_eq!(report.status(), RunStatus::Failed);
        assert_eq!(report.records_affected(), 0);
        assert!(report.log.details.contains("hostname"));
        assert_eq!(report.log.initiated_by, SCHEDULER);

        let logs = f.db.recent_logs(Some(&job.id), 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(
            f.registry.get(&job.id).unwrap().last_run_status,
            Some(RunStatus::Failed)
        );
    }

    #[test]
    fn test_unknown_job() {
        let f = fixture();
        let err = f.runner.run("missing", &RunRequest::scheduled()).unwrap_err();
        assert!(matches!(err, RetentionError::JobNotFound(_)));
    }
}
