//! # Retention: data retention policy engine CLI
//!
//! Manages retention jobs, runs them (dry or real), inspects the audit log and
//! hosts the scheduler loop.
//!
//! Usage:
//!   retention jobs create --name "Archive graduates" --target students \
//!       --action archive --rule "enrollmentStatus = graduated"
//!   retention run <job-id>                    # dry run unless the job says otherwise
//!   retention run <job-id> --execute          # real run, once
//!   retention logs --job <job-id>
//!   retention schedule                        # foreground scheduler

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use retention_core::{Action, RetentionConfig, Target};
use retention_engine::jobs::DEFAULT_SCHEDULE;
use retention_engine::{
    ExecutionLog, Job, JobUpdate, NewJob, RetentionDb, RetentionEngine, Rule, RunRequest, SqliteRecords,
    spawn_scheduler,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "retention",
    version,
    about = "🗄️ Retention: scheduled archive, anonymize and soft-delete jobs with dry runs and an audit trail"
)]
struct Cli {
    /// Config file (default: ~/.retention/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage job definitions
    #[command(subcommand)]
    Jobs(JobsCommand),

    /// Run a job now
    Run {
        id: String,
        /// Simulate regardless of the job's default
        #[arg(long, conflicts_with = "execute")]
        dry_run: bool,
        /// Mutate records regardless of the job's default
        #[arg(long)]
        execute: bool,
        /// Confirmation phrase for real-mode Delete jobs: "DELETE <job name>"
        #[arg(long)]
        confirm: Option<String>,
        /// Identity recorded in the execution log
        #[arg(long = "as", default_value = "cli")]
        initiated_by: String,
    },

    /// Show recent execution logs
    Logs {
        /// Only logs of this job
        #[arg(long)]
        job: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Print one log entry in full
        #[arg(long)]
        id: Option<i64>,
    },

    /// Aggregate statistics over the execution log
    Stats,

    /// Inspect or restore target records
    #[command(subcommand)]
    Records(RecordsCommand),

    /// Run the scheduler in the foreground
    Schedule,
}

#[derive(Subcommand)]
enum JobsCommand {
    List,
    Show {
        id: String,
    },
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        target: Target,
        #[arg(long)]
        action: Action,
        /// Rule as "<field> <op> <value>", repeatable
        #[arg(long = "rule")]
        rules: Vec<Rule>,
        #[arg(long, default_value = DEFAULT_SCHEDULE)]
        schedule: String,
        /// Store the job in real mode instead of dry-run mode
        #[arg(long)]
        execute_by_default: bool,
        #[arg(long)]
        confirm: Option<String>,
    },
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        schedule: Option<String>,
        /// Rule to add, repeatable
        #[arg(long = "rule")]
        rules: Vec<Rule>,
        /// Replace all existing rules with the given ones (none clears them)
        #[arg(long)]
        replace_rules: bool,
        #[arg(long)]
        dry_run_default: Option<bool>,
        #[arg(long)]
        confirm: Option<String>,
    },
    Pause {
        id: String,
    },
    Resume {
        id: String,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum RecordsCommand {
    Show {
        target: Target,
        id: String,
        /// Also find soft-deleted records
        #[arg(long)]
        include_deleted: bool,
    },
    /// Undo a soft delete
    Restore {
        target: Target,
        id: String,
    },
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    Ok(())
}

fn print_job(job: &Job) {
    let last = match (job.last_run_at, job.last_run_status) {
        (Some(at), Some(status)) => format!("{} ({status})", at.format("%Y-%m-%d %H:%M")),
        _ => "never".to_string(),
    };
    println!(
        "{}  {:<28} {:<8} {:<10} {:<18} {:<7} {:<14} last: {}",
        job.id,
        job.name,
        job.status,
        job.action,
        job.target,
        if job.is_dry_run_default { "dry" } else { "REAL" },
        job.schedule,
        last
    );
}

fn print_log(log: &ExecutionLog) {
    println!(
        "#{:<5} {}  {:<24} {:<10} {:<18} {:<4} {:>6} affected {:>4} failed  {:<7} by {}",
        log.id,
        log.created_at.format("%Y-%m-%d %H:%M:%S"),
        log.job_name,
        log.action,
        log.target,
        if log.is_dry_run { "dry" } else { "real" },
        log.records_affected,
        log.records_failed,
        log.status,
        log.initiated_by
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "retention=debug,retention_engine=debug,retention_core=debug"
    } else {
        "retention=info,retention_engine=info,retention_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => RetentionConfig::load_from(path)?,
        None => RetentionConfig::load()?,
    };

    let db_path = config.db_path();
    let records_path = config.records_db_path();
    ensure_parent(&db_path)?;
    ensure_parent(&records_path)?;

    let records = SqliteRecords::open(&records_path, config.engine.page_size)?;
    let db = Arc::new(RetentionDb::open(&db_path)?);
    let engine = Arc::new(RetentionEngine::new(db, records.targets(), &config));

    match cli.command {
        Command::Jobs(cmd) => jobs_command(&engine, cmd)?,

        Command::Run {
            id,
            dry_run,
            execute,
            confirm,
            initiated_by,
        } => {
            let mut request = RunRequest::manual(&initiated_by);
            if execute {
                request = request.dry_run(false);
            } else if dry_run {
                request = request.dry_run(true);
            }
            if let Some(phrase) = confirm {
                request = request.confirm(&phrase);
            }

            let report = engine.run(&id, &request)?;
            let icon = if report.status() == retention_core::RunStatus::Success { "✅" } else { "❌" };
            println!(
                "{icon} {} run of '{}' {:?}: {} record(s), {} failed (log #{})",
                if report.dry_run { "Dry" } else { "Real" },
                report.log.job_name,
                report.phase,
                report.records_affected(),
                report.log.records_failed,
                report.log.id
            );
            println!("{}", report.log.details);
        }

        Command::Logs { job, limit, id } => match id {
            Some(id) => {
                let log = engine
                    .get_log(id)?
                    .with_context(|| format!("no execution log #{id}"))?;
                println!("{}", serde_json::to_string_pretty(&log)?);
            }
            None => {
                let logs = engine.recent_logs(job.as_deref(), limit)?;
                if logs.is_empty() {
                    println!("No execution logs yet.");
                }
                for log in &logs {
                    print_log(log);
                }
            }
        },

        Command::Stats => {
            let stats = engine.stats()?;
            println!("📊 Retention statistics");
            println!("   Runs:        {} ({} dry, {} failed)", stats.total_runs, stats.dry_runs, stats.failed_runs);
            println!("   Archived:    {}", stats.records_archived);
            println!("   Anonymized:  {}", stats.records_anonymized);
            println!("   Deleted:     {}", stats.records_deleted);
        }

        Command::Records(RecordsCommand::Show {
            target,
            id,
            include_deleted,
        }) => {
            let record = records
                .fetch(target, &id, include_deleted)?
                .with_context(|| format!("no {target} record '{id}'"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        Command::Records(RecordsCommand::Restore { target, id }) => {
            if records.restore_deleted(target, &id)? {
                println!("♻️ Restored {target} record '{id}'");
            } else {
                println!("⚠️ {target} record '{id}' is not deleted");
            }
        }

        Command::Schedule => {
            println!("⏰ Retention scheduler v{}", env!("CARGO_PKG_VERSION"));
            let interval = config.scheduler.check_interval_secs;
            tokio::select! {
                _ = spawn_scheduler(engine.clone(), interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("🛑 Scheduler stopped");
                }
            }
        }
    }

    Ok(())
}

fn jobs_command(engine: &RetentionEngine, cmd: JobsCommand) -> Result<()> {
    let registry = engine.jobs();
    match cmd {
        JobsCommand::List => {
            let jobs = registry.list()?;
            if jobs.is_empty() {
                println!("No retention jobs.");
            }
            for job in &jobs {
                print_job(job);
            }
        }

        JobsCommand::Show { id } => {
            let job = registry.get(&id)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }

        JobsCommand::Create {
            name,
            target,
            action,
            rules,
            schedule,
            execute_by_default,
            confirm,
        } => {
            let new = NewJob {
                name,
                target,
                action,
                rules,
                schedule,
                is_dry_run_default: !execute_by_default,
                confirmation: confirm,
            };
            let job = registry.create(new)?;
            println!("📋 Created job {}", job.id);
            print_job(&job);
        }

        JobsCommand::Update {
            id,
            name,
            schedule,
            rules,
            replace_rules,
            dry_run_default,
            confirm,
        } => {
            let rules = if replace_rules {
                Some(rules)
            } else if rules.is_empty() {
                None
            } else {
                let mut merged = registry.get(&id)?.rules;
                merged.extend(rules);
                Some(merged)
            };
            let update = JobUpdate {
                name,
                rules,
                schedule,
                is_dry_run_default: dry_run_default,
                status: None,
                confirmation: confirm,
            };
            let job = registry.update(&id, update)?;
            print_job(&job);
        }

        JobsCommand::Pause { id } => {
            let job = registry.pause(&id)?;
            println!("⏸️ Paused '{}'", job.name);
        }

        JobsCommand::Resume { id } => {
            let job = registry.resume(&id)?;
            println!("▶️ Resumed '{}'", job.name);
        }

        JobsCommand::Delete { id } => {
            registry.delete(&id)?;
            println!("🗑️ Deleted job {id}; its execution logs are kept");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_create_with_rules() {
        let cli = Cli::parse_from([
            "retention",
            "jobs",
            "create",
            "--name",
            "Archive graduates",
            "--target",
            "students",
            "--action",
            "archive",
            "--rule",
            "enrollmentStatus = graduated",
            "--rule",
            "graduationYear <= 2023",
        ]);
        match cli.command {
            Command::Jobs(JobsCommand::Create { target, rules, schedule, .. }) => {
                assert_eq!(target, Target::Students);
                assert_eq!(rules.len(), 2);
                assert_eq!(schedule, DEFAULT_SCHEDULE);
            }
            _ => panic!("expected jobs create"),
        }
    }

    #[test]
    fn test_run_flags_conflict() {
        assert!(Cli::try_parse_from(["retention", "run", "abc", "--dry-run", "--execute"]).is_err());
    }
}
