//! SQLite-backed records for the five retention targets.
//!
//! Each table keeps its personal columns private: only the fields listed in
//! its [`TableDef`] are readable by rules. Candidates are streamed with keyset
//! pagination on `id`, so a listing is both bounded in memory and stable
//! across repeated calls.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use retention_core::{Action, Result, RetentionError, Target};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::persistence::{db_err, open_connection};
use crate::predicate::Predicate;
use crate::schema::{AttributeSchema, FieldDef, Marker, RecordHandle, SemanticType, Value};
use crate::targets::{CandidateStream, TargetResolver, Targets};

/// Rule-addressable field and the column backing it.
#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub field: &'static str,
    pub column: &'static str,
    pub ty: SemanticType,
}

const fn col(field: &'static str, column: &'static str, ty: SemanticType) -> ColumnDef {
    ColumnDef { field, column, ty }
}

/// Static description of one target table.
#[derive(Debug)]
pub struct TableDef {
    pub target: Target,
    pub table: &'static str,
    pub fields: &'static [ColumnDef],
    /// Columns overwritten by Anonymize.
    pub pii: &'static [&'static str],
    /// Writable but never exposed to rules.
    pub private: &'static [&'static str],
    /// Status column set to "archived" by Archive.
    pub archived_status: Option<&'static str>,
    pub permitted: &'static [Action],
}

impl TableDef {
    fn knows_column(&self, column: &str) -> bool {
        column == "created_at"
            || [Marker::Archived, Marker::Anonymized, Marker::Deleted]
                .iter()
                .any(|m| m.column() == column)
            || self.fields.iter().any(|f| f.column == column)
            || self.pii.contains(&column)
            || self.private.contains(&column)
    }
}

const CREATED: ColumnDef = col("createdAt", "created_at", SemanticType::Date);
const ARCHIVED: ColumnDef = col("archivedAt", "archived_at", SemanticType::Date);
const ANONYMIZED: ColumnDef = col("anonymizedAt", "anonymized_at", SemanticType::Date);

static STUDENTS: TableDef = TableDef {
    target: Target::Students,
    table: "students",
    fields: &[
        col(
            "enrollmentStatus",
            "enrollment_status",
            SemanticType::Enum(&["enrolled", "graduated", "withdrawn", "archived"]),
        ),
        col("graduationYear", "graduation_year", SemanticType::Number),
        col("lastActivityAt", "last_activity_at", SemanticType::Date),
        col("openCaseCount", "open_case_count", SemanticType::Number),
        CREATED,
        ARCHIVED,
        ANONYMIZED,
    ],
    pii: &["first_name", "last_name", "email"],
    private: &[],
    archived_status: Some("enrollment_status"),
    permitted: &[Action::Archive, Action::Anonymize, Action::Delete],
};

static GUARDIANS: TableDef = TableDef {
    target: Target::Guardians,
    table: "guardians",
    fields: &[
        col("status", "status", SemanticType::Enum(&["active", "inactive", "archived"])),
        col("lastContactAt", "last_contact_at", SemanticType::Date),
        CREATED,
        ARCHIVED,
        ANONYMIZED,
    ],
    pii: &["first_name", "last_name", "email", "phone"],
    private: &[],
    archived_status: Some("status"),
    permitted: &[Action::Archive, Action::Anonymize, Action::Delete],
};

static SYSTEM_LOGS: TableDef = TableDef {
    target: Target::SystemLogs,
    table: "system_logs",
    fields: &[
        col("level", "level", SemanticType::Enum(&["debug", "info", "warn", "error"])),
        col("source", "source", SemanticType::Text),
        CREATED,
        ARCHIVED,
    ],
    pii: &[],
    private: &["message"],
    archived_status: None,
    permitted: &[Action::Archive, Action::Delete],
};

static FINANCIAL_RECORDS: TableDef = TableDef {
    target: Target::FinancialRecords,
    table: "financial_records",
    fields: &[
        col("recordType", "record_type", SemanticType::Enum(&["invoice", "payment", "refund"])),
        col("amount", "amount", SemanticType::Number),
        col("fiscalYear", "fiscal_year", SemanticType::Number),
        col("status", "status", SemanticType::Enum(&["open", "settled", "archived"])),
        CREATED,
        ARCHIVED,
        ANONYMIZED,
    ],
    pii: &["payer_name", "account_number"],
    private: &[],
    archived_status: Some("status"),
    // Financial history must stay queryable, so Delete is not offered.
    permitted: &[Action::Archive, Action::Anonymize],
};

static ASSESSMENT_MEDIA: TableDef = TableDef {
    target: Target::AssessmentMedia,
    table: "assessment_media",
    fields: &[
        col(
            "mediaType",
            "media_type",
            SemanticType::Enum(&["audio", "video", "image", "document"]),
        ),
        col("sizeBytes", "size_bytes", SemanticType::Number),
        col("status", "status", SemanticType::Enum(&["active", "archived"])),
        col("capturedAt", "captured_at", SemanticType::Date),
        CREATED,
        ARCHIVED,
    ],
    pii: &[],
    private: &["storage_uri"],
    archived_status: Some("status"),
    permitted: &[Action::Archive, Action::Delete],
};

pub fn table_def(target: Target) -> &'static TableDef {
    match target {
        Target::Students => &STUDENTS,
        Target::Guardians => &GUARDIANS,
        Target::SystemLogs => &SYSTEM_LOGS,
        Target::FinancialRecords => &FINANCIAL_RECORDS,
        Target::AssessmentMedia => &ASSESSMENT_MEDIA,
    }
}

/// Records database holding every target table.
pub struct SqliteRecords {
    conn: Arc<Mutex<Connection>>,
    page_size: usize,
}

impl SqliteRecords {
    /// Open or create the records database.
    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        let conn = open_connection(path)?;
        let records = Self {
            conn: Arc::new(Mutex::new(conn)),
            page_size: page_size.max(1),
        };
        records.migrate()?;
        Ok(records)
    }

    fn migrate(&self) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS students (
                id TEXT PRIMARY KEY,
                first_name TEXT,
                last_name TEXT,
                email TEXT,
                enrollment_status TEXT NOT NULL DEFAULT 'enrolled',
                graduation_year INTEGER,
                last_activity_at TEXT,
                open_case_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                archived_at TEXT,
                anonymized_at TEXT,
                deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS guardians (
                id TEXT PRIMARY KEY,
                first_name TEXT,
                last_name TEXT,
                email TEXT,
                phone TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                last_contact_at TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                archived_at TEXT,
                anonymized_at TEXT,
                deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS system_logs (
                id TEXT PRIMARY KEY,
                level TEXT NOT NULL DEFAULT 'info',
                source TEXT,
                message TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                archived_at TEXT,
                anonymized_at TEXT,
                deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS financial_records (
                id TEXT PRIMARY KEY,
                record_type TEXT NOT NULL DEFAULT 'invoice',
                amount REAL,
                fiscal_year INTEGER,
                status TEXT NOT NULL DEFAULT 'open',
                payer_name TEXT,
                account_number TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                archived_at TEXT,
                anonymized_at TEXT,
                deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS assessment_media (
                id TEXT PRIMARY KEY,
                media_type TEXT NOT NULL DEFAULT 'document',
                size_bytes INTEGER,
                status TEXT NOT NULL DEFAULT 'active',
                captured_at TEXT,
                storage_uri TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                archived_at TEXT,
                anonymized_at TEXT,
                deleted_at TEXT
            );
            ",
        )
        .map_err(db_err("Records migration"))?;
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Resolver for one target over this database.
    pub fn resolver(&self, target: Target) -> SqliteTarget {
        SqliteTarget::new(table_def(target), self.conn.clone(), self.page_size)
    }

    /// Registry with a resolver for every target table.
    pub fn targets(&self) -> Targets {
        let mut targets = Targets::new();
        for target in Target::ALL {
            targets.register(Arc::new(self.resolver(target)));
        }
        targets
    }

    /// Insert a record. Column names are checked against the table definition.
    pub fn insert(&self, target: Target, id: &str, columns: &[(&str, SqlValue)]) -> Result<()> {
        let def = table_def(target);
        if let Some((bad, _)) = columns.iter().find(|(c, _)| !def.knows_column(c)) {
            return Err(RetentionError::Database(format!(
                "Unknown column '{bad}' for {}",
                def.table
            )));
        }

        let names: Vec<&str> = std::iter::once("id").chain(columns.iter().map(|(c, _)| *c)).collect();
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            def.table,
            names.join(", "),
            placeholders.join(", ")
        );
        let values: Vec<SqlValue> = std::iter::once(SqlValue::Text(id.to_string()))
            .chain(columns.iter().map(|(_, v)| v.clone()))
            .collect();

        let conn = lock(&self.conn)?;
        conn.execute(&sql, rusqlite::params_from_iter(values))
            .map_err(db_err("Insert record"))?;
        Ok(())
    }

    pub fn fetch(&self, target: Target, id: &str, include_deleted: bool) -> Result<Option<RecordHandle>> {
        self.resolver(target).fetch(id, include_deleted)
    }

    /// Every record of a target in id order.
    pub fn list(&self, target: Target, include_deleted: bool) -> Result<Vec<RecordHandle>> {
        let resolver = self.resolver(target);
        let mut all = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = resolver.page(after.as_deref(), &[], include_deleted)?;
            let short = page.len() < self.page_size;
            after = page.last().map(|r| r.id.clone());
            all.extend(page);
            if short || after.is_none() {
                return Ok(all);
            }
        }
    }

    /// Undo a soft delete. Returns false when the record was not deleted.
    pub fn restore_deleted(&self, target: Target, id: &str) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET deleted_at = NULL WHERE id = ?1 AND deleted_at IS NOT NULL",
            table_def(target).table
        );
        let conn = lock(&self.conn)?;
        let changed = conn.execute(&sql, params![id]).map_err(db_err("Restore record"))?;
        Ok(changed > 0)
    }

    /// Clear the anonymized marker. Scrambled columns keep their placeholders.
    pub fn clear_anonymized(&self, target: Target, id: &str) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET anonymized_at = NULL WHERE id = ?1 AND anonymized_at IS NOT NULL",
            table_def(target).table
        );
        let conn = lock(&self.conn)?;
        let changed = conn.execute(&sql, params![id]).map_err(db_err("Clear anonymized"))?;
        Ok(changed > 0)
    }

    /// Raw text of any known column, including private ones.
    pub fn read_column(&self, target: Target, id: &str, column: &str) -> Result<Option<String>> {
        let def = table_def(target);
        if !def.knows_column(column) {
            return Err(RetentionError::Database(format!(
                "Unknown column '{column}' for {}",
                def.table
            )));
        }
        let sql = format!("SELECT {column} FROM {} WHERE id = ?1", def.table);
        let conn = lock(&self.conn)?;
        let value: Option<Option<String>> = conn
            .query_row(&sql, params![id], |row| row.get(0))
            .optional()
            .map_err(db_err("Read column"))?;
        Ok(value.flatten())
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| RetentionError::Database(format!("Lock: {e}")))
}

/// Resolver for one target table.
pub struct SqliteTarget {
    def: &'static TableDef,
    schema: AttributeSchema,
    conn: Arc<Mutex<Connection>>,
    page_size: usize,
    select: String,
}

impl SqliteTarget {
    fn new(def: &'static TableDef, conn: Arc<Mutex<Connection>>, page_size: usize) -> Self {
        let schema = AttributeSchema::new(
            def.target,
            def.fields.iter().map(|f| FieldDef { name: f.field, ty: f.ty }).collect(),
        );
        let columns: Vec<&str> = def.fields.iter().map(|f| f.column).collect();
        let select = format!(
            "SELECT id, {}, archived_at, anonymized_at, deleted_at FROM {}",
            columns.join(", "),
            def.table
        );
        Self {
            def,
            schema,
            conn,
            page_size,
            select,
        }
    }

    /// One page of rows after `after` in id order, with the given markers unset.
    fn page(&self, after: Option<&str>, unset: &[Marker], include_deleted: bool) -> Result<Vec<RecordHandle>> {
        let mut sql = format!("{} WHERE (?1 IS NULL OR id > ?1)", self.select);
        if !include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        for marker in unset {
            sql.push_str(&format!(" AND {} IS NULL", marker.column()));
        }
        sql.push_str(" ORDER BY id LIMIT ?2");

        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&sql).map_err(db_err("Prepare page"))?;
        let rows = stmt
            .query_map(params![after, self.page_size as i64], |row| self.row_to_handle(row))
            .map_err(db_err("Query page"))?;
        let mut page = Vec::with_capacity(self.page_size);
        for row in rows {
            page.push(row.map_err(db_err("Read row"))?);
        }
        debug!("{}: fetched page of {} after {:?}", self.def.table, page.len(), after);
        Ok(page)
    }

    fn row_to_handle(&self, row: &rusqlite::Row) -> rusqlite::Result<RecordHandle> {
        let mut handle = RecordHandle::new(row.get::<_, String>(0)?);
        for (i, field) in self.def.fields.iter().enumerate() {
            let raw: SqlValue = row.get(i + 1)?;
            handle.attributes.insert(field.field.to_string(), to_value(raw, field.ty));
        }
        let base = self.def.fields.len() + 1;
        handle.archived_at = marker_time(row.get(base)?);
        handle.anonymized_at = marker_time(row.get(base + 1)?);
        handle.deleted_at = marker_time(row.get(base + 2)?);
        Ok(handle)
    }

    fn ensure_permitted(&self, id: &str, action: Action) -> Result<()> {
        if self.def.permitted.contains(&action) {
            Ok(())
        } else {
            Err(self.unsupported(id, action))
        }
    }

    /// Run a single-row UPDATE; zero rows changed means the record moved on.
    fn update_one(&self, id: &str, sql: &str, values: Vec<SqlValue>) -> Result<()> {
        let conn = lock(&self.conn)?;
        let changed = conn
            .execute(sql, rusqlite::params_from_iter(values))
            .map_err(|e| RetentionError::per_record(id, e.to_string()))?;
        if changed == 0 {
            return Err(RetentionError::per_record(id, "record is missing or was deleted"));
        }
        Ok(())
    }
}

impl TargetResolver for SqliteTarget {
    fn target(&self) -> Target {
        self.def.target
    }

    fn schema(&self) -> &AttributeSchema {
        &self.schema
    }

    fn permitted_actions(&self) -> &[Action] {
        self.def.permitted
    }

    fn list_candidates<'a>(&'a self, predicate: &'a Predicate) -> Result<CandidateStream<'a>> {
        // First page is read eagerly so storage failures surface before any record.
        let first = self.page(None, predicate.unset_markers(), false)?;
        Ok(Box::new(PagedCandidates {
            target: self,
            predicate,
            after: first.last().map(|r| r.id.clone()),
            done: first.len() < self.page_size,
            page: first.into_iter(),
        }))
    }

    fn fetch(&self, id: &str, include_deleted: bool) -> Result<Option<RecordHandle>> {
        let mut sql = format!("{} WHERE id = ?1", self.select);
        if !include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        let conn = lock(&self.conn)?;
        conn.query_row(&sql, params![id], |row| self.row_to_handle(row))
            .optional()
            .map_err(db_err("Fetch record"))
    }

    fn archive(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.ensure_permitted(id, Action::Archive)?;
        let status = self
            .def
            .archived_status
            .map(|c| format!(", {c} = 'archived'"))
            .unwrap_or_default();
        let sql = format!(
            "UPDATE {} SET archived_at = ?1{status} WHERE id = ?2 AND deleted_at IS NULL",
            self.def.table
        );
        self.update_one(id, &sql, vec![SqlValue::Text(at.to_rfc3339()), SqlValue::Text(id.to_string())])
    }

    fn anonymize(&self, id: &str, scramble: &dyn Fn(&str) -> String, at: DateTime<Utc>) -> Result<()> {
        self.ensure_permitted(id, Action::Anonymize)?;
        let mut sets = Vec::with_capacity(self.def.pii.len() + 1);
        let mut values = Vec::with_capacity(self.def.pii.len() + 2);
        for (i, column) in self.def.pii.iter().enumerate() {
            sets.push(format!("{column} = ?{}", i + 1));
            values.push(SqlValue::Text(scramble(*column)));
        }
        let n = self.def.pii.len();
        sets.push(format!("anonymized_at = ?{}", n + 1));
        values.push(SqlValue::Text(at.to_rfc3339()));
        values.push(SqlValue::Text(id.to_string()));

        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{} AND deleted_at IS NULL",
            self.def.table,
            sets.join(", "),
            n + 2
        );
        self.update_one(id, &sql, values)
    }

    fn soft_delete(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.ensure_permitted(id, Action::Delete)?;
        let sql = format!(
            "UPDATE {} SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            self.def.table
        );
        self.update_one(id, &sql, vec![SqlValue::Text(at.to_rfc3339()), SqlValue::Text(id.to_string())])
    }
}

/// Lazily pages through a table, applying the field clauses in memory.
struct PagedCandidates<'a> {
    target: &'a SqliteTarget,
    predicate: &'a Predicate,
    after: Option<String>,
    page: std::vec::IntoIter<RecordHandle>,
    done: bool,
}

impl Iterator for PagedCandidates<'_> {
    type Item = Result<RecordHandle>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            for record in self.page.by_ref() {
                if self.predicate.matches(&record) {
                    return Some(Ok(record));
                }
            }
            if self.done {
                return None;
            }
            match self
                .target
                .page(self.after.as_deref(), self.predicate.unset_markers(), false)
            {
                Ok(rows) => {
                    self.done = rows.len() < self.target.page_size;
                    match rows.last() {
                        Some(last) => self.after = Some(last.id.clone()),
                        None => return None,
                    }
                    self.page = rows.into_iter();
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

fn to_value(raw: SqlValue, ty: SemanticType) -> Value {
    match (raw, ty) {
        (SqlValue::Null, _) | (SqlValue::Blob(_), _) => Value::Null,
        (SqlValue::Integer(i), SemanticType::Number) => Value::Number(i as f64),
        (SqlValue::Real(f), SemanticType::Number) => Value::Number(f),
        (SqlValue::Text(s), SemanticType::Number) => s.trim().parse::<f64>().map(Value::Number).unwrap_or(Value::Text(s)),
        (SqlValue::Text(s), SemanticType::Date) => match parse_timestamp(&s) {
            Some(d) => Value::Date(d),
            None => Value::Text(s),
        },
        (SqlValue::Text(s), SemanticType::Enum(_)) => Value::Text(s.to_lowercase()),
        (SqlValue::Text(s), _) => Value::Text(s),
        (SqlValue::Integer(i), _) => Value::Text(i.to_string()),
        (SqlValue::Real(f), _) => Value::Text(f.to_string()),
    }
}

fn marker_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().and_then(parse_timestamp)
}

/// RFC 3339, SQLite `datetime()` output, or a bare date.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Operator, Rule};
    use crate::predicate::compile;
    use std::path::PathBuf;

    fn temp_records(page_size: usize) -> SqliteRecords {
        SqliteRecords::open(&PathBuf::from(":memory:"), page_size).unwrap()
    }

    fn text(s: &str) -> SqlValue {
        SqlValue::Text(s.to_string())
    }

    fn seed_students(records: &SqliteRecords) {
        for (id, status, year) in [
            ("s1", "graduated", 2021),
            ("s2", "enrolled", 2027),
            ("s3", "graduated", 2022),
            ("s4", "withdrawn", 2020),
            ("s5", "graduated", 2024),
        ] {
            records
                .insert(
                    Target::Students,
                    id,
                    &[
                        ("first_name", text("Ada")),
                        ("last_name", text(id)),
                        ("enrollment_status", text(status)),
                        ("graduation_year", SqlValue::Integer(year)),
                    ],
                )
                .unwrap();
        }
    }

    fn ids(stream: CandidateStream<'_>) -> Vec<String> {
        stream.map(|r| r.unwrap().id).collect()
    }

    #[test]
    fn test_schema_hides_personal_fields() {
        let records = temp_records(10);
        let resolver = records.resolver(Target::Students);
        assert!(resolver.schema().field("graduationYear").is_some());
        assert!(resolver.schema().field("firstName").is_none());
        assert!(resolver.schema().field("first_name").is_none());
    }

    #[test]
    fn test_candidates_stream_across_pages() {
        let records = temp_records(2);
        seed_students(&records);
        let resolver = records.resolver(Target::Students);
        let rules = vec![Rule::new("enrollmentStatus", Operator::Eq, "graduated")];
        let predicate = compile(&rules, resolver.schema()).unwrap();

        let first = ids(resolver.list_candidates(&predicate).unwrap());
        let second = ids(resolver.list_candidates(&predicate).unwrap());
        assert_eq!(first, vec!["s1", "s3", "s5"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_archive_sets_marker_and_status() {
        let records = temp_records(10);
        seed_students(&records);
        let resolver = records.resolver(Target::Students);
        resolver.archive("s1", Utc::now()).unwrap();

        let handle = records.fetch(Target::Students, "s1", false).unwrap().unwrap();
        assert!(handle.archived_at.is_some());
        assert_eq!(handle.attribute("enrollmentStatus"), &Value::Text("archived".into()));
        assert!(matches!(handle.attribute("archivedAt"), Value::Date(_)));

        let unarchived = Predicate::always().require_unset(Marker::Archived);
        assert_eq!(ids(resolver.list_candidates(&unarchived).unwrap()).len(), 4);
    }

    #[test]
    fn test_soft_delete_and_restore() {
        let records = temp_records(10);
        seed_students(&records);
        records.resolver(Target::Students).soft_delete("s2", Utc::now()).unwrap();

        assert!(records.fetch(Target::Students, "s2", false).unwrap().is_none());
        let deleted = records.fetch(Target::Students, "s2", true).unwrap().unwrap();
        assert!(deleted.deleted_at.is_some());
        assert_eq!(records.list(Target::Students, false).unwrap().len(), 4);
        assert_eq!(records.list(Target::Students, true).unwrap().len(), 5);

        assert!(records.restore_deleted(Target::Students, "s2").unwrap());
        assert!(!records.restore_deleted(Target::Students, "s2").unwrap());
        assert!(records.fetch(Target::Students, "s2", false).unwrap().is_some());
    }

    #[test]
    fn test_anonymize_overwrites_personal_columns() {
        let records = temp_records(10);
        seed_students(&records);
        let resolver = records.resolver(Target::Students);
        resolver
            .anonymize("s1", &|column| format!("anon-{column}"), Utc::now())
            .unwrap();

        assert_eq!(
            records.read_column(Target::Students, "s1", "first_name").unwrap().as_deref(),
            Some("anon-first_name")
        );
        assert!(records.clear_anonymized(Target::Students, "s1").unwrap());
        assert_eq!(
            records.read_column(Target::Students, "s1", "last_name").unwrap().as_deref(),
            Some("anon-last_name")
        );
    }

    #[test]
    fn test_hooks_on_missing_record_fail_per_record() {
        let records = temp_records(10);
        let err = records
            .resolver(Target::Guardians)
            .archive("ghost", Utc::now())
            .unwrap_err();
        assert!(matches!(err, RetentionError::PerRecordExecution { .. }));
    }

    #[test]
    fn test_financial_records_refuse_delete() {
        let records = temp_records(10);
        records
            .insert(Target::FinancialRecords, "f1", &[("amount", SqlValue::Real(12.5))])
            .unwrap();
        let resolver = records.resolver(Target::FinancialRecords);
        assert!(!resolver.permitted_actions().contains(&Action::Delete));
        assert!(resolver.soft_delete("f1", Utc::now()).is_err());
        assert!(records.fetch(Target::FinancialRecords, "f1", false).unwrap().is_some());
    }

    #[test]
    fn test_insert_rejects_unknown_columns() {
        let records = temp_records(10);
        let err = records
            .insert(Target::SystemLogs, "l1", &[("password", text("x"))])
            .unwrap_err();
        assert!(matches!(err, RetentionError::Database(_)));
    }

    #[test]
    fn test_default_created_at_is_a_date() {
        let records = temp_records(10);
        records.insert(Target::SystemLogs, "l1", &[("source", text("auth"))]).unwrap();
        let handle = records.fetch(Target::SystemLogs, "l1", false).unwrap().unwrap();
        assert!(matches!(handle.attribute("createdAt"), Value::Date(_)));
    }
}
