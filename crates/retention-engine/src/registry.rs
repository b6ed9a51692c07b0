//! Job registry: validated CRUD over retention job definitions.

use chrono::{DateTime, Utc};
use retention_core::{Action, JobStatus, Result, RetentionError, RunStatus, Target};
use std::sync::Arc;
use tracing::info;

use crate::actions::ExecutorTable;
use crate::cron::CronSchedule;
use crate::jobs::{Job, JobUpdate, NewJob, Rule, verify_delete_confirmation};
use crate::persistence::RetentionDb;
use crate::predicate::compile;
use crate::targets::Targets;

/// Durable store of job definitions. Nothing invalid is ever persisted.
pub struct JobRegistry {
    db: Arc<RetentionDb>,
    targets: Targets,
    executors: ExecutorTable,
}

impl JobRegistry {
    pub fn new(db: Arc<RetentionDb>, targets: Targets, executors: ExecutorTable) -> Self {
        Self {
            db,
            targets,
            executors,
        }
    }

    pub fn targets(&self) -> &Targets {
        &self.targets
    }

    pub fn executors(&self) -> &ExecutorTable {
        &self.executors
    }

    /// Structural checks shared by create and update.
    pub fn validate(&self, name: &str, target: Target, action: Action, rules: &[Rule], schedule: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(RetentionError::InvalidJob("name must not be empty".into()));
        }
        if schedule.trim().is_empty() {
            return Err(RetentionError::InvalidJob("schedule must not be empty".into()));
        }
        CronSchedule::parse(schedule)?;
        let resolver = self.targets.get(target)?;
        self.executors.get(target, action)?;
        compile(rules, resolver.schema())?;
        Ok(())
    }

    pub fn create(&self, new: NewJob) -> Result<Job> {
        self.validate(&new.name, new.target, new.action, &new.rules, &new.schedule)?;
        if new.action == Action::Delete && !new.is_dry_run_default {
            verify_delete_confirmation(&new.name, new.confirmation.as_deref())?;
        }

        let job = Job::from_new(new);
        self.db.insert_job(&job)?;
        info!(
            "📋 Job created: {} ({} {} with {} rule(s), dry run by default: {})",
            job.name,
            job.action,
            job.target,
            job.rules.len(),
            job.is_dry_run_default
        );
        Ok(job)
    }

    pub fn update(&self, id: &str, update: JobUpdate) -> Result<Job> {
        let mut job = self.get(id)?;
        update.apply(&mut job, Utc::now());
        self.validate(&job.name, job.target, job.action, &job.rules, &job.schedule)?;
        if job.is_real_mode_delete() && update.touches_destructive_settings() {
            verify_delete_confirmation(&job.name, update.confirmation.as_deref())?;
        }

        self.db.update_job(&job)?;
        info!("📋 Job updated: {} ({})", job.name, job.id);
        Ok(job)
    }

    pub fn pause(&self, id: &str) -> Result<Job> {
        self.update(id, JobUpdate::status(JobStatus::Paused))
    }

    pub fn resume(&self, id: &str) -> Result<Job> {
        self.update(id, JobUpdate::status(JobStatus::Active))
    }

    /// Remove a job definition. Its execution logs are kept.
    pub fn delete(&self, id: &str) -> Result<()> {
        if !self.db.delete_job(id)? {
            return Err(RetentionError::JobNotFound(id.to_string()));
        }
        info!("🗑️ Job deleted: {id}");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Job> {
        self.db
            .get_job(id)?
            .ok_or_else(|| RetentionError::JobNotFound(id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<Job>> {
        self.db.list_jobs()
    }

    pub fn active_jobs(&self) -> Result<Vec<Job>> {
        Ok(self
            .db
            .list_jobs()?
            .into_iter()
            .filter(|j| j.status == JobStatus::Active)
            .collect())
    }

    pub fn record_run(&self, id: &str, at: DateTime<Utc>, status: RunStatus) -> Result<()> {
        self.db.record_run(id, at, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::Operator;
    use crate::records::SqliteRecords;
    use std::path::PathBuf;

    fn registry() -> JobRegistry {
        let db = Arc::new(RetentionDb::open(&PathBuf::from(":memory:")).unwrap());
        let targets = SqliteRecords::open(&PathBuf::from(":memory:"), 100).unwrap().targets();
        let executors = ExecutorTable::from_targets(&targets);
        JobRegistry::new(db, targets, executors)
    }

    #[test]
    fn test_create_and_list() {
        let registry = registry();
        let job = registry
            .create(
                NewJob::new("Archive graduates", Target::Students, Action::Archive)
                    .with_rule(Rule::new("enrollmentStatus", Operator::Eq, "graduated")),
            )
            .unwrap();
        assert_eq!(registry.get(&job.id).unwrap().rules.len(), 1);
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_rule_is_not_persisted() {
        let registry = registry();
        let err = registry
            .create(
                NewJob::new("Bad", Target::Students, Action::Archive)
                    .with_rule(Rule::new("socialSecurityNumber", Operator::Eq, "x")),
            )
            .unwrap_err();
        assert!(matches!(err, RetentionError::InvalidRule { .. }));
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_disallowed_action_rejected() {
        let registry = registry();
        let err = registry
            .create(NewJob::new("Purge ledgers", Target::FinancialRecords, Action::Delete))
            .unwrap_err();
        assert!(matches!(err, RetentionError::InvalidActionForTarget { .. }));
    }

    #[test]
    fn test_real_mode_delete_needs_confirmation() {
        let registry = registry();
        let new = NewJob::new("Purge logs", Target::SystemLogs, Action::Delete).with_dry_run_default(false);
        let err = registry.create(new.clone()).unwrap_err();
        assert!(matches!(err, RetentionError::ConfirmationRequired(_)));

        let job = registry.create(new.with_confirmation("DELETE Purge logs")).unwrap();
        assert!(!job.is_dry_run_default);

        // Rule changes on a real-mode delete job need the phrase again
        let update = JobUpdate {
            rules: Some(vec![Rule::new("level", Operator::Eq, "debug")]),
            ..JobUpdate::default()
        };
        assert!(registry.update(&job.id, update.clone()).is_err());
        let confirmed = JobUpdate {
            confirmation: Some("DELETE Purge logs".into()),
            ..update
        };
        assert_eq!(registry.update(&job.id, confirmed).unwrap().rules.len(), 1);

        // Schedule-only edits do not
        let schedule_only = JobUpdate {
            schedule: Some("0 4 * * *".into()),
            ..JobUpdate::default()
        };
        assert!(registry.update(&job.id, schedule_only).is_ok());
    }

    #[test]
    fn test_update_revalidates_rules() {
        let registry = registry();
        let job = registry
            .create(NewJob::new("Stale guardians", Target::Guardians, Action::Anonymize))
            .unwrap();
        let update = JobUpdate {
            rules: Some(vec![Rule::new("status", Operator::Gt, "active")]),
            ..JobUpdate::default()
        };
        assert!(registry.update(&job.id, update).is_err());
        assert!(registry.get(&job.id).unwrap().rules.is_empty());
    }

    #[test]
    fn test_pause_resume_and_delete() {
        let registry = registry();
        let job = registry
            .create(NewJob::new("Old media", Target::AssessmentMedia, Action::Archive))
            .unwrap();
        registry.pause(&job.id).unwrap();
        assert!(registry.active_jobs().unwrap().is_empty());
        registry.resume(&job.id).unwrap();
        assert_eq!(registry.active_jobs().unwrap().len(), 1);

        registry.delete(&job.id).unwrap();
        assert!(matches!(registry.get(&job.id), Err(RetentionError::JobNotFound(_))));
        assert!(matches!(registry.delete(&job.id), Err(RetentionError::JobNotFound(_))));
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = registry();
        let err = registry
            .create(NewJob::new("  ", Target::Students, Action::Archive))
            .unwrap_err();
        assert!(matches!(err, RetentionError::InvalidJob(_)));
    }

    #[test]
    fn test_unparseable_schedule_rejected() {
        let registry = registry();
        for schedule in ["every night", "0 2 * *", "0 25 * * *"] {
            let err = registry
                .create(NewJob::new("Nightly", Target::Students, Action::Archive).with_schedule(schedule))
                .unwrap_err();
            assert!(matches!(err, RetentionError::InvalidJob(ref m) if m.contains("cron")), "{schedule}: {err}");
        }
        assert!(registry.list().unwrap().is_empty());

        let job = registry
            .create(NewJob::new("Nightly", Target::Students, Action::Archive).with_schedule("0 1-5/4294967295 * * *"))
            .unwrap();
        let update = JobUpdate {
            schedule: Some("every night".into()),
            ..JobUpdate::default()
        };
        assert!(matches!(registry.update(&job.id, update), Err(RetentionError::InvalidJob(_))));
        assert_eq!(registry.get(&job.id).unwrap().schedule, "0 1-5/4294967295 * * *");
    }
}
