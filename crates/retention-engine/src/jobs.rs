//! Job definitions: the core data model for retention work.

use chrono::{DateTime, Utc};
use retention_core::{Action, JobStatus, Result, RetentionError, RunStatus, Target};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default schedule for new jobs: daily at 02:00 UTC.
pub const DEFAULT_SCHEDULE: &str = "0 2 * * *";

/// A retention job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Record type the job operates on.
    pub target: Target,
    /// Lifecycle transition applied to matching records.
    pub action: Action,
    /// Eligibility rules, combined with AND. Empty matches every record.
    pub rules: Vec<Rule>,
    /// Cron expression, checked on save and interpreted by the scheduler.
    pub schedule: String,
    /// Runs simulate unless an invocation explicitly overrides this.
    pub is_dry_run_default: bool,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
}

impl Job {
    /// Build a fresh, active job from a creation request.
    pub fn from_new(new: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name.trim().to_string(),
            target: new.target,
            action: new.action,
            rules: new.rules,
            schedule: new.schedule,
            is_dry_run_default: new.is_dry_run_default,
            status: JobStatus::Active,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            last_run_status: None,
        }
    }

    /// A Delete job that mutates when run without an override.
    pub fn is_real_mode_delete(&self) -> bool {
        self.action == Action::Delete && !self.is_dry_run_default
    }

    pub fn confirmation_phrase(&self) -> String {
        delete_confirmation_phrase(&self.name)
    }
}

/// Phrase an operator must type before a Delete job may run for real.
pub fn delete_confirmation_phrase(job_name: &str) -> String {
    format!("DELETE {}", job_name.trim())
}

/// Check a typed confirmation against the expected phrase.
pub fn verify_delete_confirmation(job_name: &str, provided: Option<&str>) -> Result<()> {
    let phrase = delete_confirmation_phrase(job_name);
    match provided {
        Some(p) if p.trim() == phrase => Ok(()),
        _ => Err(RetentionError::ConfirmationRequired(phrase)),
    }
}

/// Comparison operator of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Ge => ">=",
            Operator::Le => "<=",
        }
    }

    pub fn is_ordering(&self) -> bool {
        matches!(self, Operator::Gt | Operator::Lt | Operator::Ge | Operator::Le)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Operator {
    type Err = RetentionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "=" | "==" => Ok(Operator::Eq),
            "!=" | "<>" => Ok(Operator::Ne),
            ">" => Ok(Operator::Gt),
            "<" => Ok(Operator::Lt),
            ">=" => Ok(Operator::Ge),
            "<=" => Ok(Operator::Le),
            other => Err(RetentionError::invalid_rule("", format!("unknown operator '{other}'"))),
        }
    }
}

/// One eligibility condition. `value` is raw and only gets a type when the
/// rule is compiled against a target schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub field: String,
    pub operator: Operator,
    pub value: serde_json::Value,
}

impl Rule {
    pub fn new(field: &str, operator: Operator, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value: value.into(),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.operator, self.value)
    }
}

/// Parse `"<field> <op> <value>"`, e.g. `graduationYear <= 2023` or
/// `enrollmentStatus = graduated`. The value is read as JSON when it parses
/// (numbers, `null`, quoted strings) and as a bare string otherwise.
impl FromStr for Rule {
    type Err = RetentionError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let op_start = s
            .find(['=', '!', '<', '>'])
            .ok_or_else(|| RetentionError::invalid_rule(s, "missing operator"))?;
        let field = s[..op_start].trim();
        if field.is_empty() {
            return Err(RetentionError::invalid_rule(s, "missing field name"));
        }

        let rest = &s[op_start..];
        let op_len = rest
            .chars()
            .take_while(|c| matches!(c, '=' | '!' | '<' | '>'))
            .count();
        let operator: Operator = rest[..op_len]
            .parse()
            .map_err(|_| RetentionError::invalid_rule(field, format!("unknown operator '{}'", &rest[..op_len])))?;

        let raw = rest[op_len..].trim();
        if raw.is_empty() {
            return Err(RetentionError::invalid_rule(field, "missing value"));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));

        Ok(Rule {
            field: field.to_string(),
            operator,
            value,
        })
    }
}

/// Request to create a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub target: Target,
    pub action: Action,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default = "default_true")]
    pub is_dry_run_default: bool,
    /// Typed confirmation, required for real-mode Delete jobs.
    #[serde(default)]
    pub confirmation: Option<String>,
}

fn default_schedule() -> String {
    DEFAULT_SCHEDULE.to_string()
}

fn default_true() -> bool {
    true
}

impl NewJob {
    pub fn new(name: &str, target: Target, action: Action) -> Self {
        Self {
            name: name.to_string(),
            target,
            action,
            rules: Vec::new(),
            schedule: default_schedule(),
            is_dry_run_default: true,
            confirmation: None,
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_schedule(mut self, schedule: &str) -> Self {
        self.schedule = schedule.to_string();
        self
    }

    pub fn with_dry_run_default(mut self, dry_run: bool) -> Self {
        self.is_dry_run_default = dry_run;
        self
    }

    pub fn with_confirmation(mut self, phrase: &str) -> Self {
        self.confirmation = Some(phrase.to_string());
        self
    }
}

/// Partial update of a job. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub rules: Option<Vec<Rule>>,
    pub schedule: Option<String>,
    pub is_dry_run_default: Option<bool>,
    pub status: Option<JobStatus>,
    pub confirmation: Option<String>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Whether the update changes what a real-mode Delete job would remove.
    pub fn touches_destructive_settings(&self) -> bool {
        self.rules.is_some() || self.is_dry_run_default.is_some()
    }

    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        if let Some(name) = &self.name {
            job.name = name.trim().to_string();
        }
        if let Some(rules) = &self.rules {
            job.rules = rules.clone();
        }
        if let Some(schedule) = &self.schedule {
            job.schedule = schedule.clone();
        }
        if let Some(dry_run) = self.is_dry_run_default {
            job.is_dry_run_default = dry_run;
        }
        if let Some(status) = self.status {
            job.status = status;
        }
        job.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_defaults_to_dry_run() {
        let job = Job::from_new(NewJob::new("Archive graduates", Target::Students, Action::Archive));
        assert!(job.is_dry_run_default);
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.schedule, DEFAULT_SCHEDULE);
        assert!(job.last_run_at.is_none());
    }

    #[test]
    fn test_parse_rules() {
        let rule: Rule = "graduationYear <= 2023".parse().unwrap();
        assert_eq!(rule, Rule::new("graduationYear", Operator::Le, 2023));

        let rule: Rule = "enrollmentStatus = graduated".parse().unwrap();
        assert_eq!(rule.value, serde_json::json!("graduated"));

        let rule: Rule = "archivedAt=null".parse().unwrap();
        assert_eq!(rule.operator, Operator::Eq);
        assert!(rule.value.is_null());

        let rule: Rule = r#"source != "auth service""#.parse().unwrap();
        assert_eq!(rule.value, serde_json::json!("auth service"));
    }

    #[test]
    fn test_parse_rule_errors() {
        assert!("graduationYear 2023".parse::<Rule>().is_err());
        assert!("<= 2023".parse::<Rule>().is_err());
        assert!("graduationYear =< 2023".parse::<Rule>().is_err());
        assert!("graduationYear >=".parse::<Rule>().is_err());
    }

    #[test]
    fn test_rule_json_uses_operator_symbols() {
        let json = serde_json::to_value(Rule::new("amount", Operator::Ge, 10)).unwrap();
        assert_eq!(json["operator"], ">=");
    }

    #[test]
    fn test_delete_confirmation() {
        assert!(verify_delete_confirmation("Purge logs", Some("DELETE Purge logs")).is_ok());
        let err = verify_delete_confirmation("Purge logs", Some("delete")).unwrap_err();
        assert!(matches!(err, RetentionError::ConfirmationRequired(p) if p == "DELETE Purge logs"));
        assert!(verify_delete_confirmation("Purge logs", None).is_err());
    }

    #[test]
    fn test_update_applies_only_set_fields() {
        let mut job = Job::from_new(NewJob::new("j", Target::Guardians, Action::Anonymize));
        let update = JobUpdate {
            schedule: Some("0 3 * * 0".into()),
            ..JobUpdate::default()
        };
        assert!(!update.touches_destructive_settings());
        update.apply(&mut job, Utc::now());
        assert_eq!(job.schedule, "0 3 * * 0");
        assert_eq!(job.name, "j");
        assert!(job.is_dry_run_default);
    }
}
