//! Target resolvers: per record type schema, candidate listing and
//! mutation hooks.

use chrono::{DateTime, Utc};
use retention_core::{Action, Result, RetentionError, Target};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::predicate::Predicate;
use crate::schema::{AttributeSchema, RecordHandle};

/// Lazily produced candidates. Items are yielded in a stable order so two
/// listings over unchanged data agree exactly.
pub type CandidateStream<'a> = Box<dyn Iterator<Item = Result<RecordHandle>> + 'a>;

/// Record type collaborator consumed by the engine.
pub trait TargetResolver: Send + Sync {
    fn target(&self) -> Target;

    /// Rule-addressable fields. Personal data is never exposed here.
    fn schema(&self) -> &AttributeSchema;

    fn permitted_actions(&self) -> &[Action];

    /// Stream records matching `predicate`, excluding soft-deleted ones.
    fn list_candidates<'a>(&'a self, predicate: &'a Predicate) -> Result<CandidateStream<'a>>;

    fn fetch(&self, id: &str, include_deleted: bool) -> Result<Option<RecordHandle>>;

    /// Set `archived_at` and the entity's archived status.
    fn archive(&self, id: &str, _at: DateTime<Utc>) -> Result<()> {
        Err(self.unsupported(id, Action::Archive))
    }

    /// Overwrite personal fields with `scramble(column)` and set `anonymized_at`.
    fn anonymize(&self, id: &str, _scramble: &dyn Fn(&str) -> String, _at: DateTime<Utc>) -> Result<()> {
        Err(self.unsupported(id, Action::Anonymize))
    }

    /// Set `deleted_at`. The row stays in storage.
    fn soft_delete(&self, id: &str, _at: DateTime<Utc>) -> Result<()> {
        Err(self.unsupported(id, Action::Delete))
    }

    fn unsupported(&self, id: &str, action: Action) -> RetentionError {
        RetentionError::per_record(id, format!("{} does not support {}", self.target(), action))
    }
}

/// Registered resolvers keyed by target.
#[derive(Clone, Default)]
pub struct Targets {
    resolvers: BTreeMap<Target, Arc<dyn TargetResolver>>,
}

impl Targets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resolver: Arc<dyn TargetResolver>) {
        self.resolvers.insert(resolver.target(), resolver);
    }

    pub fn with(mut self, resolver: Arc<dyn TargetResolver>) -> Self {
        self.register(resolver);
        self
    }

    pub fn get(&self, target: Target) -> Result<Arc<dyn TargetResolver>> {
        self.resolvers
            .get(&target)
            .cloned()
            .ok_or_else(|| RetentionError::UnknownTarget(target.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TargetResolver>> {
        self.resolvers.values()
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, SemanticType};

    struct ReadOnly {
        schema: AttributeSchema,
    }

    impl TargetResolver for ReadOnly {
        fn target(&self) -> Target {
            Target::SystemLogs
        }
        fn schema(&self) -> &AttributeSchema {
            &self.schema
        }
        fn permitted_actions(&self) -> &[Action] {
            &[]
        }
        fn list_candidates<'a>(&'a self, _predicate: &'a Predicate) -> Result<CandidateStream<'a>> {
            Ok(Box::new(std::iter::empty()))
        }
        fn fetch(&self, _id: &str, _include_deleted: bool) -> Result<Option<RecordHandle>> {
            Ok(None)
        }
    }

    fn read_only() -> Arc<dyn TargetResolver> {
        Arc::new(ReadOnly {
            schema: AttributeSchema::new(
                Target::SystemLogs,
                vec![FieldDef { name: "source", ty: SemanticType::Text }],
            ),
        })
    }

    #[test]
    fn test_registry_lookup() {
        let targets = Targets::new().with(read_only());
        assert_eq!(targets.len(), 1);
        assert!(targets.get(Target::SystemLogs).is_ok());
        let err = targets.get(Target::Students).err().unwrap();
        assert!(matches!(err, RetentionError::UnknownTarget(t) if t == "students"));
    }

    #[test]
    fn test_default_hooks_fail_per_record() {
        let resolver = read_only();
        let err = resolver.archive("r1", Utc::now()).unwrap_err();
        assert!(matches!(err, RetentionError::PerRecordExecution { record_id, .. } if record_id == "r1"));
    }
}
