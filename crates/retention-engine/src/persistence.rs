//! SQLite-backed persistence for retention jobs, execution logs and job locks.

use chrono::{DateTime, Duration, Utc};
use retention_core::{Result, RetentionError, RunStatus};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::execution_log::{ExecutionLog, LogStats, NewExecutionLog};
use crate::jobs::{Job, Rule};

/// Open a connection with the pragmas every retention database uses.
pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(db_err("DB open"))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )
    .map_err(db_err("DB pragma"))?;
    Ok(conn)
}

pub(crate) fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> RetentionError {
    move |e| RetentionError::Database(format!("{context}: {e}"))
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_col<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = RetentionError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_err(idx, e))
}

fn time_col(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn opt_time_col(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => time_col(row, idx).map(Some),
        None => Ok(None),
    }
}

const JOB_SELECT: &str = "SELECT id, name, target, action, rules, schedule, is_dry_run_default, status, created_at, updated_at, last_run_at, last_run_status FROM retention_jobs";

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let rules_json: String = row.get(4)?;
    let rules: Vec<Rule> = serde_json::from_str(&rules_json).map_err(|e| conversion_err(4, e))?;
    let last_run_status = match row.get::<_, Option<String>>(11)? {
        Some(s) => Some(RunStatus::from_str(&s).map_err(|e| conversion_err(11, e))?),
        None => None,
    };
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        target: parse_col(row, 2)?,
        action: parse_col(row, 3)?,
        rules,
        schedule: row.get(5)?,
        is_dry_run_default: row.get(6)?,
        status: parse_col(row, 7)?,
        created_at: time_col(row, 8)?,
        updated_at: time_col(row, 9)?,
        last_run_at: opt_time_col(row, 10)?,
        last_run_status,
    })
}

const LOG_SELECT: &str = "SELECT id, job_id, job_name, target, action, records_affected, records_failed, is_dry_run, initiated_by, status, details, record_ids, created_at FROM execution_logs";

fn row_to_log(row: &rusqlite::Row) -> rusqlite::Result<ExecutionLog> {
    let ids_json: String = row.get(11)?;
    Ok(ExecutionLog {
        id: row.get(0)?,
        job_id: row.get(1)?,
        job_name: row.get(2)?,
        target: parse_col(row, 3)?,
        action: parse_col(row, 4)?,
        records_affected: row.get::<_, i64>(5)? as u64,
        records_failed: row.get::<_, i64>(6)? as u64,
        is_dry_run: row.get(7)?,
        initiated_by: row.get(8)?,
        status: parse_col(row, 9)?,
        details: row.get(10)?,
        record_ids: serde_json::from_str(&ids_json).map_err(|e| conversion_err(11, e))?,
        created_at: time_col(row, 12)?,
    })
}

/// Engine database: job definitions, the execution log and job locks.
pub struct RetentionDb {
    conn: Mutex<Connection>,
}

impl RetentionDb {
    /// Open or create the engine database.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(open_connection(path)?),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RetentionError::Database(format!("Lock: {e}")))
    }

    /// Run migrations to create tables and audit guards.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS retention_jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                target TEXT NOT NULL,
                action TEXT NOT NULL,           -- 'archive', 'anonymize', 'delete'
                rules TEXT NOT NULL DEFAULT '[]', -- JSON array of {field, operator, value}
                schedule TEXT NOT NULL,
                is_dry_run_default INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_run_at TEXT,
                last_run_status TEXT
            );

            -- One row per run attempt; job_id is cleared when the job goes away
            CREATE TABLE IF NOT EXISTS execution_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT,
                job_name TEXT NOT NULL,
                target TEXT NOT NULL,
                action TEXT NOT NULL,
                records_affected INTEGER NOT NULL DEFAULT 0,
                records_failed INTEGER NOT NULL DEFAULT 0,
                is_dry_run INTEGER NOT NULL,
                initiated_by TEXT NOT NULL,
                status TEXT NOT NULL,           -- 'success', 'failed'
                details TEXT NOT NULL DEFAULT '',
                record_ids TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_execution_logs_job ON execution_logs(job_id, id);

            CREATE TRIGGER IF NOT EXISTS execution_logs_no_delete
            BEFORE DELETE ON execution_logs
            BEGIN
                SELECT RAISE(ABORT, 'execution_logs is append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS execution_logs_no_update
            BEFORE UPDATE OF id, job_name, target, action, records_affected, records_failed,
                             is_dry_run, initiated_by, status, details, record_ids, created_at
            ON execution_logs
            BEGIN
                SELECT RAISE(ABORT, 'execution_logs is append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS execution_logs_job_id_detach_only
            BEFORE UPDATE OF job_id ON execution_logs
            WHEN NEW.job_id IS NOT NULL
            BEGIN
                SELECT RAISE(ABORT, 'execution_logs.job_id may only be cleared');
            END;

            -- Advisory per-job execution lock; a live holder keeps heartbeat_at fresh
            CREATE TABLE IF NOT EXISTS job_locks (
                job_id TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                heartbeat_at TEXT NOT NULL
            );
            ",
        )
        .map_err(db_err("Migration"))?;
        Ok(())
    }

    // ─── Jobs ─────────────────────────────────────────────────

    pub fn insert_job(&self, job: &Job) -> Result<()> {
        let rules = serde_json::to_string(&job.rules)
            .map_err(|e| RetentionError::Database(format!("Serialize rules: {e}")))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO retention_jobs (id, name, target, action, rules, schedule, is_dry_run_default, status, created_at, updated_at, last_run_at, last_run_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.id,
                job.name,
                job.target.as_str(),
                job.action.as_str(),
                rules,
                job.schedule,
                job.is_dry_run_default,
                job.status.as_str(),
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
                job.last_run_at.map(|t| t.to_rfc3339()),
                job.last_run_status.map(|s| s.as_str()),
            ],
        )
        .map_err(db_err("Insert job"))?;
        Ok(())
    }

    /// Persist a job's editable fields.
    pub fn update_job(&self, job: &Job) -> Result<()> {
        let rules = serde_json::to_string(&job.rules)
            .map_err(|e| RetentionError::Database(format!("Serialize rules: {e}")))?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE retention_jobs SET name = ?2, rules = ?3, schedule = ?4, is_dry_run_default = ?5, status = ?6, updated_at = ?7
                 WHERE id = ?1",
                params![
                    job.id,
                    job.name,
                    rules,
                    job.schedule,
                    job.is_dry_run_default,
                    job.status.as_str(),
                    job.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err("Update job"))?;
        if changed == 0 {
            return Err(RetentionError::JobNotFound(job.id.clone()));
        }
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.lock()?;
        conn.query_row(&format!("{JOB_SELECT} WHERE id = ?1"), params![id], row_to_job)
            .optional()
            .map_err(db_err("Get job"))
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("{JOB_SELECT} ORDER BY created_at, id"))
            .map_err(db_err("Prepare"))?;
        let jobs = stmt
            .query_map([], row_to_job)
            .map_err(db_err("Query"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read job"))?;
        Ok(jobs)
    }

    /// Delete a job. Its logs stay, detached from it, in the same transaction.
    pub fn delete_job(&self, id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Begin"))?;
        tx.execute("UPDATE execution_logs SET job_id = NULL WHERE job_id = ?1", params![id])
            .map_err(db_err("Detach logs"))?;
        tx.execute("DELETE FROM job_locks WHERE job_id = ?1", params![id])
            .map_err(db_err("Drop lock"))?;
        let removed = tx
            .execute("DELETE FROM retention_jobs WHERE id = ?1", params![id])
            .map_err(db_err("Delete job"))?;
        tx.commit().map_err(db_err("Commit"))?;
        Ok(removed > 0)
    }

    /// Stamp the outcome of the latest run.
    pub fn record_run(&self, id: &str, at: DateTime<Utc>, status: RunStatus) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE retention_jobs SET last_run_at = ?2, last_run_status = ?3 WHERE id = ?1",
            params![id, at.to_rfc3339(), status.as_str()],
        )
        .map_err(db_err("Record run"))?;
        Ok(())
    }

    // ─── Execution log ────────────────────────────────────────

    pub fn append_log(&self, entry: &NewExecutionLog) -> Result<ExecutionLog> {
        let created_at = Utc::now();
        let ids = serde_json::to_string(&entry.record_ids)
            .map_err(|e| RetentionError::Database(format!("Serialize record ids: {e}")))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO execution_logs (job_id, job_name, target, action, records_affected, records_failed, is_dry_run, initiated_by, status, details, record_ids, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.job_id,
                entry.job_name,
                entry.target.as_str(),
                entry.action.as_str(),
                entry.records_affected as i64,
                entry.records_failed as i64,
                entry.is_dry_run,
                entry.initiated_by,
                entry.status.as_str(),
                entry.details,
                ids,
                created_at.to_rfc3339(),
            ],
        )
        .map_err(db_err("Append log"))?;

        Ok(ExecutionLog {
            id: conn.last_insert_rowid(),
            job_id: entry.job_id.clone(),
            job_name: entry.job_name.clone(),
            target: entry.target,
            action: entry.action,
            records_affected: entry.records_affected,
            records_failed: entry.records_failed,
            is_dry_run: entry.is_dry_run,
            initiated_by: entry.initiated_by.clone(),
            status: entry.status,
            details: entry.details.clone(),
            record_ids: entry.record_ids.clone(),
            created_at,
        })
    }

    /// Newest first, optionally for one job.
    pub fn recent_logs(&self, job_id: Option<&str>, limit: usize) -> Result<Vec<ExecutionLog>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "{LOG_SELECT} WHERE (?1 IS NULL OR job_id = ?1) ORDER BY id DESC LIMIT ?2"
            ))
            .map_err(db_err("Prepare"))?;
        let logs = stmt
            .query_map(params![job_id, limit as i64], row_to_log)
            .map_err(db_err("Query"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read log"))?;
        Ok(logs)
    }

    pub fn get_log(&self, id: i64) -> Result<Option<ExecutionLog>> {
        let conn = self.lock()?;
        conn.query_row(&format!("{LOG_SELECT} WHERE id = ?1"), params![id], row_to_log)
            .optional()
            .map_err(db_err("Get log"))
    }

    pub fn log_stats(&self) -> Result<LogStats> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(is_dry_run), 0),
                    COALESCE(SUM(CASE WHEN action = 'archive' AND is_dry_run = 0 AND status = 'success' THEN records_affected ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN action = 'anonymize' AND is_dry_run = 0 AND status = 'success' THEN records_affected ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN action = 'delete' AND is_dry_run = 0 AND status = 'success' THEN records_affected ELSE 0 END), 0)
             FROM execution_logs",
            [],
            |row| {
                Ok(LogStats {
                    total_runs: row.get::<_, i64>(0)? as u64,
                    failed_runs: row.get::<_, i64>(1)? as u64,
                    dry_runs: row.get::<_, i64>(2)? as u64,
                    records_archived: row.get::<_, i64>(3)? as u64,
                    records_anonymized: row.get::<_, i64>(4)? as u64,
                    records_deleted: row.get::<_, i64>(5)? as u64,
                })
            },
        )
        .map_err(db_err("Log stats"))
    }

    // ─── Job locks ────────────────────────────────────────────

    /// Take the execution lock for a job. Returns false while another live
    /// holder has it; a lock whose last heartbeat is older than `stale_after`
    /// is taken over.
    pub fn try_lock_job(
        &self,
        job_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin lock"))?;

        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT holder, heartbeat_at FROM job_locks WHERE job_id = ?1",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err("Read lock"))?;

        if let Some((current, heartbeat_at)) = existing {
            let age = DateTime::parse_from_rfc3339(&heartbeat_at)
                .map(|t| now.signed_duration_since(t.with_timezone(&Utc)))
                .ok();
            match age {
                Some(age) if age < stale_after => return Ok(false),
                _ => warn!("🔓 Taking over stale lock on job {job_id} from {current} (last heartbeat {heartbeat_at})"),
            }
        }

        tx.execute(
            "INSERT INTO job_locks (job_id, holder, acquired_at, heartbeat_at) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(job_id) DO UPDATE SET holder = excluded.holder,
                 acquired_at = excluded.acquired_at, heartbeat_at = excluded.heartbeat_at",
            params![job_id, holder, now.to_rfc3339()],
        )
        .map_err(db_err("Write lock"))?;
        tx.commit().map_err(db_err("Commit lock"))?;
        Ok(true)
    }

    /// Refresh the heartbeat of a held lock. Returns false when `holder` no
    /// longer owns it.
    pub fn touch_lock(&self, job_id: &str, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE job_locks SET heartbeat_at = ?3 WHERE job_id = ?1 AND holder = ?2",
                params![job_id, holder, now.to_rfc3339()],
            )
            .map_err(db_err("Touch lock"))?;
        Ok(changed > 0)
    }

    /// Release a lock, but only if `holder` still owns it.
    pub fn unlock_job(&self, job_id: &str, holder: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM job_locks WHERE job_id = ?1 AND holder = ?2",
            params![job_id, holder],
        )
        .map_err(db_err("Release lock"))?;
        Ok(())
    }
}
