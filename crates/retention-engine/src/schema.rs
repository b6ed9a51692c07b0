//! Attribute schemas and record snapshots.
//!
//! Every target publishes the fields retention rules may reference, each with
//! a semantic type. The predicate compiler checks rules against this schema,
//! so a rule can never reach a record with an unknown field or a mismatched
//! comparison.

use chrono::{DateTime, Utc};
use retention_core::Target;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Semantic type of a rule-addressable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticType {
    Date,
    Number,
    /// Closed set of lowercase variants.
    Enum(&'static [&'static str]),
    Text,
}

impl SemanticType {
    /// Whether `>`, `<`, `>=`, `<=` are meaningful for this type.
    pub fn is_orderable(&self) -> bool {
        matches!(self, SemanticType::Date | SemanticType::Number)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SemanticType::Date => "date",
            SemanticType::Number => "number",
            SemanticType::Enum(_) => "enum",
            SemanticType::Text => "text",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub ty: SemanticType,
}

/// Field name -> semantic type for one target.
#[derive(Debug, Clone)]
pub struct AttributeSchema {
    target: Target,
    fields: Vec<FieldDef>,
}

impl AttributeSchema {
    pub fn new(target: Target, fields: Vec<FieldDef>) -> Self {
        Self { target, fields }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }
}

/// Lifecycle markers carried by every target record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    Archived,
    Anonymized,
    Deleted,
}

impl Marker {
    pub fn column(&self) -> &'static str {
        match self {
            Marker::Archived => "archived_at",
            Marker::Anonymized => "anonymized_at",
            Marker::Deleted => "deleted_at",
        }
    }
}

/// A typed attribute value, either read from a record or coerced from a rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Date(DateTime<Utc>),
    Number(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Ordering between two values of the same orderable kind.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Date(d) => write!(f, "{}", d.to_rfc3339()),
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "\"{s}\""),
        }
    }
}

pub type Attributes = BTreeMap<String, Value>;

/// Snapshot of one candidate record: its identity, exposed attributes and
/// lifecycle markers.
#[derive(Debug, Clone, Serialize)]
pub struct RecordHandle {
    pub id: String,
    pub attributes: Attributes,
    pub archived_at: Option<DateTime<Utc>>,
    pub anonymized_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

static NULL: Value = Value::Null;

impl RecordHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Attributes::new(),
            archived_at: None,
            anonymized_at: None,
            deleted_at: None,
        }
    }

    pub fn with_attribute(mut self, name: &str, value: Value) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    /// Attribute value, `Null` when absent.
    pub fn attribute(&self, name: &str) -> &Value {
        self.attributes.get(name).unwrap_or(&NULL)
    }

    pub fn marker(&self, marker: Marker) -> Option<DateTime<Utc>> {
        match marker {
            Marker::Archived => self.archived_at,
            Marker::Anonymized => self.anonymized_at,
            Marker::Deleted => self.deleted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orderable_types() {
        assert!(SemanticType::Date.is_orderable());
        assert!(SemanticType::Number.is_orderable());
        assert!(!SemanticType::Text.is_orderable());
        assert!(!SemanticType::Enum(&["a"]).is_orderable());
    }

    #[test]
    fn test_missing_attribute_reads_as_null() {
        let record = RecordHandle::new("r1").with_attribute("graduationYear", Value::Number(2022.0));
        assert_eq!(record.attribute("graduationYear"), &Value::Number(2022.0));
        assert!(record.attribute("unknown").is_null());
    }

    #[test]
    fn test_compare_mixed_kinds_is_none() {
        assert_eq!(Value::Number(1.0).compare(&Value::Number(2.0)), Some(Ordering::Less));
        assert_eq!(Value::Number(1.0).compare(&Value::Text("1".into())), None);
        assert_eq!(Value::Null.compare(&Value::Number(1.0)), None);
    }
}
