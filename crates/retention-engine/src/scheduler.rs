//! Scheduler: the external timer that triggers due jobs.
//! Uses tokio::interval; each tick runs on the blocking pool because job runs
//! do synchronous storage I/O.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use retention_core::{JobStatus, Result, RetentionError};

use crate::RetentionEngine;
use crate::cron::CronSchedule;
use crate::jobs::Job;
use crate::runner::{RunReport, RunRequest};

/// Whether an active job's next fire time after its last run has passed.
pub fn is_due(job: &Job, now: DateTime<Utc>) -> Result<bool> {
    if job.status != JobStatus::Active {
        return Ok(false);
    }
    let schedule = CronSchedule::parse(&job.schedule)?;
    let base = job.last_run_at.unwrap_or(job.created_at);
    Ok(schedule.next_after(base).is_some_and(|next| next <= now))
}

/// Due jobs, skipping (with a warning) any whose schedule does not parse.
pub fn due_jobs(jobs: &[Job], now: DateTime<Utc>) -> Vec<&Job> {
    jobs.iter()
        .filter(|job| match is_due(job, now) {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!("⚠️ Skipping job '{}' ({}): {e}", job.name, job.id);
                false
            }
        })
        .collect()
}

impl RetentionEngine {
    /// Run every due active job once with the job's stored dry-run default.
    pub fn run_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<RunReport>> {
        let jobs = self.jobs().active_jobs()?;
        let request = RunRequest {
            initiated_by: self.scheduler_config().initiated_by.clone(),
            ..RunRequest::scheduled()
        };

        let mut reports = Vec::new();
        for job in due_jobs(&jobs, now) {
            tracing::info!("🔔 Job due: '{}'", job.name);
            // each run is stamped with its own start, never earlier than the tick
            let started = Utc::now().max(now);
            match self.run_at(&job.id, &request, started) {
                Ok(report) => reports.push(report),
                Err(RetentionError::JobAlreadyRunning(id)) => {
                    tracing::info!("⏭️ Job {id} is still running, skipping this tick");
                }
                Err(e) => tracing::warn!("⚠️ Scheduled run of '{}' failed: {e}", job.name),
            }
        }
        Ok(reports)
    }
}

/// Spawn the scheduler loop. Runs until the surrounding task is dropped.
pub async fn spawn_scheduler(engine: Arc<RetentionEngine>, check_interval_secs: u64) {
    tracing::info!("⏰ Retention scheduler started (check every {}s)", check_interval_secs);

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(check_interval_secs.max(1)));

    loop {
        interval.tick().await;

        let eng = engine.clone();
        match tokio::task::spawn_blocking(move || eng.run_scheduled(Utc::now())).await {
            Ok(Ok(reports)) => {
                if !reports.is_empty() {
                    tracing::info!("⏰ Scheduler tick ran {} job(s)", reports.len());
                }
            }
            Ok(Err(e)) => tracing::warn!("⚠️ Scheduler tick failed: {e}"),
            Err(e) => tracing::error!("Scheduler tick panicked: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::NewJob;
    use chrono::{Duration, TimeZone};
    use retention_core::{Action, Target};

    fn job(schedule: &str, created_at: DateTime<Utc>) -> Job {
        let mut job = Job::from_new(NewJob::new("j", Target::Students, Action::Archive).with_schedule(schedule));
        job.created_at = created_at;
        job
    }

    #[test]
    fn test_due_after_first_fire_since_creation() {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let j = job("0 2 * * *", created);
        assert!(!is_due(&j, created + Duration::hours(13)).unwrap());
        assert!(is_due(&j, created + Duration::hours(14)).unwrap());
    }

    #[test]
    fn test_last_run_resets_due_time() {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut j = job("0 2 * * *", created);
        j.last_run_at = Some(Utc.with_ymd_and_hms(2026, 3, 2, 2, 0, 0).unwrap());
        assert!(!is_due(&j, Utc.with_ymd_and_hms(2026, 3, 2, 23, 0, 0).unwrap()).unwrap());
        assert!(is_due(&j, Utc.with_ymd_and_hms(2026, 3, 3, 2, 0, 0).unwrap()).unwrap());
    }

    #[test]
    fn test_paused_and_broken_jobs_are_not_due() {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let later = created + Duration::days(3);
        let mut paused = job("* * * * *", created);
        paused.status = JobStatus::Paused;
        let broken = job("every night", created);
        let fine = job("* * * * *", created);

        let jobs = vec![paused, broken, fine];
        let due = due_jobs(&jobs, later);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].schedule, "* * * * *");
        assert!(is_due(&jobs[1], later).is_err());
    }
}
