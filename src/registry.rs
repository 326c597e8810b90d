// 📚 Registry - service layer
// What route handlers and the CLI call. Composes the pieces in a fixed order:
//
//   register:  payload checks → reference validation → allocate + insert
//   transition: engine (payload checks → state read → guard → CAS)
//   update:    version check → merge → reference validation → guarded write
//
// Errors come back as RegistryError; callers map them with status_code().

use crate::allocator::{AllocationStore, Allocator, CodeFormat};
use crate::config::RegistryConfig;
use crate::db::{self, Event, ImportSummary};
use crate::engine::{TransitionOutcome, TransitionRecord, TransitionRequest, WorkflowEngine};
use crate::entities::{Attributes, EntityKind, EntityRef, NewRegistration, Registration};
use crate::error::RegistryError;
use crate::references::ReferenceValidator;
use crate::sequence::SequenceStatus;
use crate::store::SqliteStore;
use crate::workflow::WorkflowEvent;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;

pub struct Registry {
    store: SqliteStore,
    allocator: Allocator,
    engine: WorkflowEngine,
    validator: Arc<ReferenceValidator>,
    config: RegistryConfig,
}

impl Registry {
    pub fn open(config: RegistryConfig) -> Result<Self, RegistryError> {
        let store = SqliteStore::open(&config.database)?;
        tracing::debug!(path = %config.database.path.display(), "registry opened");
        Ok(Self::with_store(store, config))
    }

    pub fn with_store(store: SqliteStore, config: RegistryConfig) -> Self {
        Registry {
            store,
            allocator: Allocator::from_config(&config.allocator),
            engine: WorkflowEngine::new(),
            validator: ReferenceValidator::shared(),
            config,
        }
    }

    pub fn with_allocator(mut self, allocator: Allocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_validator(mut self, validator: Arc<ReferenceValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn code_format(&self, kind: EntityKind) -> CodeFormat {
        self.config.code_format(kind)
    }

    // ========================================================================
    // CREATION
    // ========================================================================

    /// Validate references, then allocate a code and insert the record in
    /// its initial workflow state.
    pub fn register(
        &mut self,
        kind: EntityKind,
        draft: NewRegistration,
        actor: &str,
    ) -> Result<Registration, RegistryError> {
        let actor = require(actor, "actor_id")?;
        let draft = NewRegistration {
            display_name: require(&draft.display_name, "display_name")?.to_string(),
            attributes: draft.attributes,
        };

        self.validator
            .validate(self.store.connection(), &kind.references(), &draft.attributes)?;

        let format = self.config.code_format(kind);
        self.allocator.allocate(&mut self.store, kind, &format, &draft, actor)
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn get(&mut self, kind: EntityKind, reference: &EntityRef) -> Result<Registration, RegistryError> {
        self.store.get(kind, reference)
    }

    /// Accepted workflow transitions, oldest first
    pub fn history(&mut self, kind: EntityKind, reference: &EntityRef) -> Result<Vec<TransitionRecord>, RegistryError> {
        self.engine.history(&mut self.store, kind, reference)
    }

    /// Events the record's current state accepts under its kind's profile
    pub fn available_events(&mut self, kind: EntityKind, reference: &EntityRef) -> Result<Vec<WorkflowEvent>, RegistryError> {
        let record = self.store.get(kind, reference)?;
        Ok(kind.profile().available_events(record.state()))
    }

    /// General audit events (creation, updates, deletion), newest first
    pub fn events(&mut self, kind: EntityKind, reference: &EntityRef) -> Result<Vec<Event>, RegistryError> {
        let record = self.store.get(kind, reference)?;
        self.store.events(kind, record.id)
    }

    // ========================================================================
    // WORKFLOW
    // ========================================================================

    pub fn transition(
        &mut self,
        kind: EntityKind,
        reference: &EntityRef,
        request: &TransitionRequest,
    ) -> Result<TransitionOutcome, RegistryError> {
        self.engine.apply(&mut self.store, kind, reference, request)
    }

    pub fn approve(&mut self, kind: EntityKind, reference: &EntityRef, actor: &str) -> Result<TransitionOutcome, RegistryError> {
        self.engine.approve(&mut self.store, kind, reference, actor)
    }

    pub fn reject(
        &mut self,
        kind: EntityKind,
        reference: &EntityRef,
        actor: &str,
        reason: &str,
    ) -> Result<TransitionOutcome, RegistryError> {
        self.engine.reject(&mut self.store, kind, reference, actor, reason)
    }

    pub fn mark_printed(&mut self, kind: EntityKind, reference: &EntityRef, actor: &str) -> Result<TransitionOutcome, RegistryError> {
        self.engine.mark_printed(&mut self.store, kind, reference, actor)
    }

    pub fn mark_scanned(&mut self, kind: EntityKind, reference: &EntityRef, actor: &str) -> Result<TransitionOutcome, RegistryError> {
        self.engine.mark_scanned(&mut self.store, kind, reference, actor)
    }

    pub fn complete(&mut self, kind: EntityKind, reference: &EntityRef, actor: &str) -> Result<TransitionOutcome, RegistryError> {
        self.engine.complete(&mut self.store, kind, reference, actor)
    }

    // ========================================================================
    // UPDATES
    // ========================================================================

    /// Merge `changes` into the stored attributes. A null value removes the
    /// key. References are re-validated on the merged map.
    pub fn update_attributes(
        &mut self,
        kind: EntityKind,
        reference: &EntityRef,
        expected_version: i64,
        changes: Attributes,
        actor: &str,
    ) -> Result<Registration, RegistryError> {
        let actor = require(actor, "actor_id")?;
        let current = self.store.get(kind, reference)?;

        if current.version != expected_version {
            return Err(RegistryError::StaleVersion {
                kind,
                reference: reference.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let mut merged = current.attributes;
        for (key, value) in changes {
            if value.is_null() {
                merged.remove(&key);
            } else {
                merged.insert(key, value);
            }
        }

        self.validator
            .validate(self.store.connection(), &kind.references(), &merged)?;

        self.store
            .update_attributes(kind, current.id, expected_version, &merged, actor)
    }

    pub fn soft_delete(
        &mut self,
        kind: EntityKind,
        reference: &EntityRef,
        expected_version: i64,
        actor: &str,
    ) -> Result<Registration, RegistryError> {
        let actor = require(actor, "actor_id")?;
        let current = self.store.get(kind, reference)?;
        self.store.soft_delete(kind, current.id, expected_version, actor)
    }

    // ========================================================================
    // ADMINISTRATION
    // ========================================================================

    /// Move the id sequence past the table's rows; returns the next id
    pub fn resync_sequence(&mut self, kind: EntityKind) -> Result<i64, RegistryError> {
        let next = self.store.resync_id_sequence(kind)?;
        tracing::info!(kind = %kind, table = kind.table(), next_id = next, "id sequence resynced");
        Ok(next)
    }

    pub fn sequence_status(&self, kind: EntityKind) -> Result<SequenceStatus, RegistryError> {
        self.store.sequence_status(kind, &self.config.code_format(kind))
    }

    /// Bulk-load a legacy CSV export. Ids are kept, so the id sequence is
    /// left behind; the next allocation repairs it.
    pub fn import_csv(&mut self, kind: EntityKind, csv_path: &Path, actor: &str) -> anyhow::Result<ImportSummary> {
        let records = db::load_legacy_csv(csv_path)
            .with_context(|| format!("Failed to load {}", csv_path.display()))?;
        db::import_legacy(self.store.connection(), kind, &records, actor)
    }
}

fn require<'a>(value: &'a str, field: &'static str) -> Result<&'a str, RegistryError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RegistryError::MissingRequiredField { field });
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::RetryPolicy;
    use crate::config::AllocationStrategy;
    use crate::db::{seed_reference, soft_delete_reference, ReferenceTable};
    use crate::workflow::WorkflowState;
    use serde_json::{json, Value};

    fn registry() -> Registry {
        let store = SqliteStore::open_in_memory().unwrap();
        seed_reference(store.connection(), ReferenceTable::DivisionalSecretariat, "DS-01", "Colombo").unwrap();
        seed_reference(store.connection(), ReferenceTable::Nikaya, "NK-01", "Siyam").unwrap();
        seed_reference(store.connection(), ReferenceTable::StatusCode, "ST01", "Active").unwrap();

        Registry::with_store(store, RegistryConfig::default())
            .with_allocator(Allocator::new(RetryPolicy::immediate(10), AllocationStrategy::Scan))
    }

    fn arama(division: &str) -> NewRegistration {
        NewRegistration::new("Sri Sudharmarama").with_attribute("division_code", division)
    }

    #[test]
    fn test_first_registration_gets_first_code() {
        let mut registry = registry();
        let reg = registry.register(EntityKind::Arama, arama("DS-01"), "clerk").unwrap();

        assert_eq!(reg.code, "ARN0000001");
        assert_eq!(reg.state(), WorkflowState::Pending);
    }

    #[test]
    fn test_dangling_division_blocks_insert() {
        let mut registry = registry();

        let err = registry.register(EntityKind::Arama, arama("XX-999"), "clerk").unwrap_err();
        match err {
            RegistryError::DanglingReference { ref field, ref value } => {
                assert_eq!(field, "division_code");
                assert_eq!(value, "XX-999");
            }
            ref other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(err.status_code(), 400);

        assert_eq!(registry.store().count(EntityKind::Arama).unwrap(), 0);
        let status = registry.sequence_status(EntityKind::Arama).unwrap();
        assert_eq!(status.next_id, 1);
        assert_eq!(db::count_events(registry.store().connection(), "registration_created").unwrap(), 0);
    }

    #[test]
    fn test_blank_display_name_is_missing_field() {
        let mut registry = registry();

        let err = registry
            .register(EntityKind::Arama, NewRegistration::new("  "), "clerk")
            .unwrap_err();
        assert!(matches!(err, RegistryError::MissingRequiredField { field: "display_name" }));
    }

    #[test]
    fn test_soft_deleted_parent_blocks_child() {
        let mut registry = registry();
        let monk = registry
            .register(
                EntityKind::Bhikku,
                NewRegistration::new("Ven. Ananda").with_attribute("status_code", "ST01"),
                "clerk",
            )
            .unwrap();
        assert_eq!(monk.code, "BH000001");

        let temple = || {
            NewRegistration::new("Gangaramaya")
                .with_attribute("division_code", "DS-01")
                .with_attribute("nikaya_code", "NK-01")
                .with_attribute("viharadhipathi", "BH000001")
        };
        registry.register(EntityKind::Vihara, temple(), "clerk").unwrap();

        registry
            .soft_delete(EntityKind::Bhikku, &EntityRef::Id(monk.id), monk.version, "admin")
            .unwrap();

        let err = registry.register(EntityKind::Vihara, temple(), "clerk").unwrap_err();
        assert!(matches!(err, RegistryError::DanglingReference { ref field, .. } if field == "viharadhipathi"));
        assert_eq!(registry.store().count(EntityKind::Vihara).unwrap(), 1);
    }

    #[test]
    fn test_excluded_list_field_does_not_block_registration() {
        let mut registry = registry();

        let monk = NewRegistration::new("Ven. Sumana")
            .with_attribute("status_code", "ST01")
            .with_attribute("senior_teachers", "BH000077,BH000078");
        registry.register(EntityKind::Bhikku, monk, "clerk").unwrap();
    }

    #[test]
    fn test_update_attributes_merges_and_revalidates() {
        let mut registry = registry();
        let reg = registry.register(EntityKind::Arama, arama("DS-01"), "clerk").unwrap();
        let reference = EntityRef::Code(reg.code.clone());

        let mut changes = Attributes::new();
        changes.insert("bed_count".to_string(), json!(8));
        let updated = registry
            .update_attributes(EntityKind::Arama, &reference, reg.version, changes, "editor")
            .unwrap();
        assert_eq!(updated.attributes["bed_count"], json!(8));
        assert_eq!(updated.attribute_str("division_code"), Some("DS-01"));
        assert_eq!(updated.version, reg.version + 1);

        let mut removal = Attributes::new();
        removal.insert("bed_count".to_string(), Value::Null);
        let removed = registry
            .update_attributes(EntityKind::Arama, &reference, updated.version, removal, "editor")
            .unwrap();
        assert!(!removed.attributes.contains_key("bed_count"));

        let mut bad = Attributes::new();
        bad.insert("division_code".to_string(), json!("XX-999"));
        let err = registry
            .update_attributes(EntityKind::Arama, &reference, removed.version, bad, "editor")
            .unwrap_err();
        assert!(matches!(err, RegistryError::DanglingReference { .. }));

        let err = registry
            .update_attributes(EntityKind::Arama, &reference, reg.version, Attributes::new(), "editor")
            .unwrap_err();
        assert!(matches!(err, RegistryError::StaleVersion { .. }));
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn test_division_deleted_after_registration_blocks_updates() {
        let mut registry = registry();
        let reg = registry.register(EntityKind::Arama, arama("DS-01"), "clerk").unwrap();
        soft_delete_reference(registry.store().connection(), ReferenceTable::DivisionalSecretariat, "DS-01").unwrap();

        let mut changes = Attributes::new();
        changes.insert("bed_count".to_string(), json!(3));
        let err = registry
            .update_attributes(EntityKind::Arama, &EntityRef::Id(reg.id), reg.version, changes, "editor")
            .unwrap_err();
        assert!(matches!(err, RegistryError::DanglingReference { .. }));
    }

    #[test]
    fn test_workflow_through_the_service() {
        let mut registry = registry();
        let kind = EntityKind::Arama;
        let reg = registry.register(kind, arama("DS-01"), "clerk").unwrap();
        let reference = EntityRef::Id(reg.id);

        let printed = registry.mark_printed(kind, &reference, "printer").unwrap();
        assert_eq!(printed.message, format!("arama {} marked as printed", reg.code));
        registry.mark_scanned(kind, &reference, "scanner").unwrap();
        let rejected = registry.reject(kind, &reference, "registrar", "unsigned form").unwrap();
        assert_eq!(rejected.entity.state(), WorkflowState::Rejected);

        let err = registry.approve(kind, &reference, "registrar").unwrap_err();
        assert_eq!(
            err.user_message(),
            "cannot approve: current status is REJECTED (expected PEND-APPROVAL)"
        );

        assert_eq!(registry.history(kind, &reference).unwrap().len(), 3);
        let events = registry.events(kind, &reference).unwrap();
        assert_eq!(events.last().map(|e| e.event_type.as_str()), Some("registration_created"));
    }

    #[test]
    fn test_available_events_track_the_record() {
        let mut registry = registry();
        let kind = EntityKind::Arama;
        let reg = registry.register(kind, arama("DS-01"), "clerk").unwrap();
        let reference = EntityRef::Code(reg.code.clone());

        assert_eq!(registry.available_events(kind, &reference).unwrap(), vec![WorkflowEvent::MarkPrinted]);

        registry.mark_printed(kind, &reference, "printer").unwrap();
        registry.mark_scanned(kind, &reference, "scanner").unwrap();
        assert_eq!(
            registry.available_events(kind, &reference).unwrap(),
            vec![WorkflowEvent::Approve, WorkflowEvent::Reject]
        );

        registry.reject(kind, &reference, "registrar", "unsigned form").unwrap();
        assert!(registry.available_events(kind, &reference).unwrap().is_empty());

        let missing = registry.available_events(kind, &EntityRef::Id(999)).unwrap_err();
        assert!(matches!(missing, RegistryError::NotFound { .. }));
    }

    #[test]
    fn test_import_then_register_repairs_sequence() {
        let mut registry = registry();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        {
            use std::io::Write;
            writeln!(file, "id,code,display_name,workflow_state,attributes").unwrap();
            writeln!(file, "1,ARN0000001,Old Arama,APPROVED,").unwrap();
            writeln!(file, "2,ARN0000002,Older Arama,,").unwrap();
        }

        let summary = registry.import_csv(EntityKind::Arama, file.path(), "importer").unwrap();
        assert_eq!(summary, ImportSummary { inserted: 2, duplicates: 0 });
        assert!(registry.sequence_status(EntityKind::Arama).unwrap().desynced);

        let reg = registry.register(EntityKind::Arama, arama("DS-01"), "clerk").unwrap();
        assert_eq!(reg.id, 3);
        assert_eq!(reg.code, "ARN0000003");
        assert!(!registry.sequence_status(EntityKind::Arama).unwrap().desynced);
    }

    #[test]
    fn test_resync_sequence_is_idempotent() {
        let mut registry = registry();
        registry.register(EntityKind::Arama, arama("DS-01"), "clerk").unwrap();

        assert_eq!(registry.resync_sequence(EntityKind::Arama).unwrap(), 2);
        assert_eq!(registry.resync_sequence(EntityKind::Arama).unwrap(), 2);
    }

    #[test]
    fn test_configured_prefix_is_used() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut config = RegistryConfig::default();
        config.codes.insert(
            "certificate".to_string(),
            crate::config::CodeFormatConfig { prefix: "CERT".to_string(), width: 4 },
        );
        let mut registry = Registry::with_store(store, config);

        let reg = registry
            .register(EntityKind::Certificate, NewRegistration::new("Upasampada"), "clerk")
            .unwrap();
        assert_eq!(reg.code, "CERT0001");
    }
}
