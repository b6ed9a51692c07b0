//! Predicate compiler: declarative rules -> typed, side-effect free test.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use retention_core::{Result, RetentionError};
use std::cmp::Ordering;
use std::fmt;

use crate::jobs::{Operator, Rule};
use crate::schema::{AttributeSchema, FieldDef, Marker, RecordHandle, SemanticType, Value};

/// One compiled rule with its value coerced to the field's type.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Clause {
    pub fn matches(&self, record: &RecordHandle) -> bool {
        let actual = record.attribute(&self.field);
        match self.operator {
            Operator::Eq => actual == &self.value,
            Operator::Ne => actual != &self.value,
            op => match actual.compare(&self.value) {
                Some(ord) => match op {
                    Operator::Gt => ord == Ordering::Greater,
                    Operator::Lt => ord == Ordering::Less,
                    Operator::Ge => ord != Ordering::Less,
                    Operator::Le => ord != Ordering::Greater,
                    Operator::Eq | Operator::Ne => false,
                },
                // null or mismatched kinds never satisfy an ordering
                None => false,
            },
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.operator, self.value)
    }
}

/// Conjunction of clauses plus lifecycle markers that must be unset.
///
/// Marker constraints are kept apart from field clauses so record stores can
/// push them into their queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    clauses: Vec<Clause>,
    unset_markers: Vec<Marker>,
}

impl Predicate {
    /// Matches every record.
    pub fn always() -> Self {
        Self::default()
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn unset_markers(&self) -> &[Marker] {
        &self.unset_markers
    }

    pub fn require_unset(mut self, marker: Marker) -> Self {
        if !self.unset_markers.contains(&marker) {
            self.unset_markers.push(marker);
        }
        self
    }

    pub fn matches(&self, record: &RecordHandle) -> bool {
        self.unset_markers.iter().all(|m| record.marker(*m).is_none())
            && self.clauses.iter().all(|c| c.matches(record))
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clauses.is_empty() && self.unset_markers.is_empty() {
            return f.write_str("TRUE");
        }
        let mut parts: Vec<String> = self.clauses.iter().map(|c| c.to_string()).collect();
        parts.extend(self.unset_markers.iter().map(|m| format!("{} IS NULL", m.column())));
        f.write_str(&parts.join(" AND "))
    }
}

/// Compile rules against a schema, resolving relative dates against now.
pub fn compile(rules: &[Rule], schema: &AttributeSchema) -> Result<Predicate> {
    compile_at(rules, schema, Utc::now())
}

/// Compile rules against a schema, resolving relative dates against `now`.
pub fn compile_at(rules: &[Rule], schema: &AttributeSchema, now: DateTime<Utc>) -> Result<Predicate> {
    let mut clauses = Vec::with_capacity(rules.len());
    for rule in rules {
        let def = schema.field(&rule.field).ok_or_else(|| {
            RetentionError::invalid_rule(
                &rule.field,
                format!(
                    "unknown field for {} (available: {})",
                    schema.target(),
                    schema.field_names().join(", ")
                ),
            )
        })?;

        if rule.operator.is_ordering() && !def.ty.is_orderable() {
            return Err(RetentionError::invalid_rule(
                &rule.field,
                format!("operator '{}' is not valid for {} fields", rule.operator, def.ty.name()),
            ));
        }

        let value = coerce(def, rule.operator, &rule.value, now)?;
        clauses.push(Clause {
            field: rule.field.clone(),
            operator: rule.operator,
            value,
        });
    }
    Ok(Predicate {
        clauses,
        unset_markers: Vec::new(),
    })
}

/// Coerce a raw rule value to the field's semantic type.
pub fn coerce(def: &FieldDef, operator: Operator, raw: &serde_json::Value, now: DateTime<Utc>) -> Result<Value> {
    let mismatch = |expected: &str| {
        RetentionError::invalid_rule(def.name, format!("expected {expected}, got {raw}"))
    };

    if raw.is_null() {
        if operator.is_ordering() {
            return Err(RetentionError::invalid_rule(
                def.name,
                format!("null cannot be compared with '{operator}'"),
            ));
        }
        return Ok(Value::Null);
    }

    match def.ty {
        SemanticType::Date => {
            let s = raw.as_str().ok_or_else(|| mismatch("a date string"))?;
            parse_date(s, now)
                .map(Value::Date)
                .ok_or_else(|| mismatch("YYYY-MM-DD, RFC 3339 or now[+-]<n>(h|d|w|y)"))
        }
        SemanticType::Number => match raw {
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number).ok_or_else(|| mismatch("a number")),
            serde_json::Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(Value::Number)
                .ok_or_else(|| mismatch("a number")),
            _ => Err(mismatch("a number")),
        },
        SemanticType::Enum(variants) => {
            let s = raw.as_str().ok_or_else(|| mismatch("a string"))?;
            let lowered = s.trim().to_lowercase();
            variants
                .iter()
                .find(|v| **v == lowered)
                .map(|v| Value::Text((*v).to_string()))
                .ok_or_else(|| mismatch(&format!("one of [{}]", variants.join(", "))))
        }
        SemanticType::Text => match raw {
            serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
            serde_json::Value::Number(n) => Ok(Value::Text(n.to_string())),
            _ => Err(mismatch("text")),
        },
    }
}

/// Parse an absolute or relative date.
pub fn parse_date(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix("now") {
        return parse_relative(rest.trim(), now);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

fn parse_relative(offset: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if offset.is_empty() {
        return Some(now);
    }
    let (negative, body) = match offset.as_bytes()[0] {
        b'-' => (true, &offset[1..]),
        b'+' => (false, &offset[1..]),
        _ => return None,
    };
    let body = body.trim();
    let unit = body.chars().last()?;
    let amount: i64 = body[..body.len() - unit.len_utf8()].trim().parse().ok()?;
    let delta = match unit {
        'h' => Duration::try_hours(amount)?,
        'd' => Duration::try_days(amount)?,
        'w' => Duration::try_weeks(amount)?,
        'y' => Duration::try_days(amount.checked_mul(365)?)?,
        _ => return None,
    };
    if negative {
        now.checked_sub_signed(delta)
    } else {
        now.checked_add_signed(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDef;
    use retention_core::Target;

    fn student_schema() -> AttributeSchema {
        AttributeSchema::new(
            Target::Students,
            vec![
                FieldDef {
                    name: "enrollmentStatus",
                    ty: SemanticType::Enum(&["enrolled", "graduated", "withdrawn", "archived"]),
                },
                FieldDef { name: "graduationYear", ty: SemanticType::Number },
                FieldDef { name: "lastActivityAt", ty: SemanticType::Date },
                FieldDef { name: "archivedAt", ty: SemanticType::Date },
            ],
        )
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-06-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_empty_rules_match_everything() {
        let predicate = compile(&[], &student_schema()).unwrap();
        assert!(predicate.matches(&RecordHandle::new("a")));
        assert_eq!(predicate.to_string(), "TRUE");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let rules = vec![Rule::new("ssn", Operator::Eq, "x")];
        let err = compile(&rules, &student_schema()).unwrap_err();
        assert!(matches!(err, RetentionError::InvalidRule { field, .. } if field == "ssn"));
    }

    #[test]
    fn test_ordering_on_enum_rejected() {
        let rules = vec![Rule::new("enrollmentStatus", Operator::Gt, "enrolled")];
        assert!(compile(&rules, &student_schema()).is_err());
    }

    #[test]
    fn test_uncoercible_values_rejected() {
        for rule in [
            Rule::new("graduationYear", Operator::Le, "soon"),
            Rule::new("enrollmentStatus", Operator::Eq, "expelled"),
            Rule::new("lastActivityAt", Operator::Lt, "last tuesday"),
            Rule::new("lastActivityAt", Operator::Lt, serde_json::Value::Null),
        ] {
            assert!(compile(&[rule], &student_schema()).is_err());
        }
    }

    #[test]
    fn test_conjunction() {
        let rules = vec![
            Rule::new("archivedAt", Operator::Eq, serde_json::Value::Null),
            Rule::new("graduationYear", Operator::Le, 2023),
        ];
        let predicate = compile(&rules, &student_schema()).unwrap();

        let old_unarchived = RecordHandle::new("1").with_attribute("graduationYear", Value::Number(2021.0));
        let old_archived = RecordHandle::new("2")
            .with_attribute("graduationYear", Value::Number(2021.0))
            .with_attribute("archivedAt", Value::Date(now()));
        let recent = RecordHandle::new("3").with_attribute("graduationYear", Value::Number(2025.0));
        let no_year = RecordHandle::new("4");

        assert!(predicate.matches(&old_unarchived));
        assert!(!predicate.matches(&old_archived));
        assert!(!predicate.matches(&recent));
        assert!(!predicate.matches(&no_year));
    }

    #[test]
    fn test_enum_values_normalized() {
        let rules = vec![Rule::new("enrollmentStatus", Operator::Eq, "Graduated")];
        let predicate = compile(&rules, &student_schema()).unwrap();
        let record = RecordHandle::new("1").with_attribute("enrollmentStatus", Value::Text("graduated".into()));
        assert!(predicate.matches(&record));
    }

    #[test]
    fn test_relative_dates() {
        let n = now();
        assert_eq!(parse_date("now", n), Some(n));
        assert_eq!(parse_date("now-2d", n), Some(n - Duration::days(2)));
        assert_eq!(parse_date("now+3h", n), Some(n + Duration::hours(3)));
        assert_eq!(parse_date("now-1y", n), Some(n - Duration::days(365)));
        assert_eq!(parse_date("now-2x", n), None);
        assert_eq!(
            parse_date("2024-01-31", n),
            Some(DateTime::parse_from_rfc3339("2024-01-31T00:00:00Z").unwrap().with_timezone(&Utc))
        );
    }

    #[test]
    fn test_date_threshold_against_compile_instant() {
        let rules = vec![Rule::new("lastActivityAt", Operator::Lt, "now-365d")];
        let predicate = compile_at(&rules, &student_schema(), now()).unwrap();
        let stale = RecordHandle::new("1").with_attribute("lastActivityAt", Value::Date(now() - Duration::days(400)));
        let fresh = RecordHandle::new("2").with_attribute("lastActivityAt", Value::Date(now() - Duration::days(30)));
        assert!(predicate.matches(&stale));
        assert!(!predicate.matches(&fresh));
    }

    #[test]
    fn test_required_unset_marker() {
        let predicate = Predicate::always().require_unset(Marker::Archived);
        let mut record = RecordHandle::new("1");
        assert!(predicate.matches(&record));
        record.archived_at = Some(now());
        assert!(!predicate.matches(&record));
    }
}
