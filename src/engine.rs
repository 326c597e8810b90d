// ⚙️ Workflow Engine
// Applies one workflow event to one stored record.
//
// 1. payload checks (actor, rejection reason), before anything is read
// 2. resolve the record and read its current state
// 3. pure transition check (workflow::transition)
// 4. compare-and-set in the store: state, audit columns, transition record
//    and version bump commit together or not at all
//
// A concurrent writer that got there first makes step 4 miss; the engine
// reports that as an illegal transition against the state it now observes.

use crate::entities::{EntityKind, EntityRef, Registration};
use crate::error::RegistryError;
use crate::workflow::{self, WorkflowEvent, WorkflowState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// TRANSITION RECORD
// ============================================================================

/// One accepted workflow change. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: i64,
    pub entity_kind: EntityKind,
    pub entity_id: i64,
    pub event: WorkflowEvent,
    pub from_state: WorkflowState,
    pub to_state: WorkflowState,
    pub actor_id: String,
    pub occurred_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub rejection_reason: Option<String>,
}

/// What the store is asked to write for one transition
#[derive(Debug, Clone)]
pub struct StateChange {
    pub event: WorkflowEvent,
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub actor: String,
    pub at: DateTime<Utc>,
    pub notes: Option<String>,
    pub rejection_reason: Option<String>,
}

#[derive(Debug)]
pub enum CasOutcome {
    Applied(TransitionRecord),
    /// The row exists but no longer holds the expected state
    StateMismatch(WorkflowState),
    /// The row vanished or was soft-deleted
    Missing,
}

// ============================================================================
// STORE CONTRACT
// ============================================================================

pub trait WorkflowStore {
    /// Surrogate id of a live (not soft-deleted) record
    fn resolve_id(&mut self, kind: EntityKind, reference: &EntityRef) -> Result<i64, RegistryError>;

    /// Current state. A legacy row with no stored state is materialized as
    /// PENDING; that is not a transition and leaves no record.
    fn read_state(&mut self, kind: EntityKind, id: i64) -> Result<WorkflowState, RegistryError>;

    /// Write `change` only if the row still holds `change.from`
    fn compare_and_set(&mut self, kind: EntityKind, id: i64, change: &StateChange) -> Result<CasOutcome, RegistryError>;

    fn load(&mut self, kind: EntityKind, id: i64) -> Result<Registration, RegistryError>;

    /// Oldest first
    fn transitions(&mut self, kind: EntityKind, id: i64) -> Result<Vec<TransitionRecord>, RegistryError>;
}

// ============================================================================
// REQUEST / OUTCOME
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub event: WorkflowEvent,
    pub actor: String,
    pub notes: Option<String>,
    pub rejection_reason: Option<String>,
}

impl TransitionRequest {
    pub fn new(event: WorkflowEvent, actor: impl Into<String>) -> Self {
        TransitionRequest {
            event,
            actor: actor.into(),
            notes: None,
            rejection_reason: None,
        }
    }

    pub fn approve(actor: impl Into<String>) -> Self {
        Self::new(WorkflowEvent::Approve, actor)
    }

    pub fn reject(actor: impl Into<String>, reason: impl Into<String>) -> Self {
        TransitionRequest {
            rejection_reason: Some(reason.into()),
            ..Self::new(WorkflowEvent::Reject, actor)
        }
    }

    pub fn mark_printed(actor: impl Into<String>) -> Self {
        Self::new(WorkflowEvent::MarkPrinted, actor)
    }

    pub fn mark_scanned(actor: impl Into<String>) -> Self {
        Self::new(WorkflowEvent::MarkScanned, actor)
    }

    pub fn complete(actor: impl Into<String>) -> Self {
        Self::new(WorkflowEvent::Complete, actor)
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub entity: Registration,
    pub transition: TransitionRecord,
    pub message: String,
}

// ============================================================================
// ENGINE
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowEngine;

impl WorkflowEngine {
    pub fn new() -> Self {
        WorkflowEngine
    }

    pub fn apply<S: WorkflowStore + ?Sized>(
        &self,
        store: &mut S,
        kind: EntityKind,
        reference: &EntityRef,
        request: &TransitionRequest,
    ) -> Result<TransitionOutcome, RegistryError> {
        let actor = request.actor.trim();
        if actor.is_empty() {
            return Err(RegistryError::MissingRequiredField { field: "actor_id" });
        }

        let rejection_reason = non_blank(request.rejection_reason.as_deref());
        if request.event == WorkflowEvent::Reject && rejection_reason.is_none() {
            return Err(RegistryError::MissingRequiredField { field: "rejection_reason" });
        }

        let id = store.resolve_id(kind, reference)?;
        let current = store.read_state(kind, id)?;
        let next = workflow::transition(kind.profile(), current, request.event)?;

        let change = StateChange {
            event: request.event,
            from: current,
            to: next,
            actor: actor.to_string(),
            at: Utc::now(),
            notes: non_blank(request.notes.as_deref()),
            rejection_reason: if request.event == WorkflowEvent::Reject {
                rejection_reason
            } else {
                None
            },
        };

        let record = match store.compare_and_set(kind, id, &change)? {
            CasOutcome::Applied(record) => record,
            CasOutcome::StateMismatch(observed) => {
                tracing::warn!(
                    kind = %kind,
                    id,
                    event = %request.event.as_str(),
                    expected = %current,
                    observed = %observed,
                    "lost transition race"
                );
                return Err(RegistryError::IllegalTransition {
                    event: request.event,
                    expected: Some(current),
                    actual: observed,
                });
            }
            CasOutcome::Missing => {
                return Err(RegistryError::NotFound {
                    kind,
                    reference: reference.to_string(),
                })
            }
        };

        let entity = store.load(kind, id)?;
        let message = format!("{} {} {}", kind, entity.code, request.event.past_tense());

        tracing::info!(
            kind = %kind,
            code = %entity.code,
            event = %request.event.as_str(),
            from = %record.from_state,
            to = %record.to_state,
            actor = %record.actor_id,
            "transition applied"
        );

        Ok(TransitionOutcome {
            entity,
            transition: record,
            message,
        })
    }

    pub fn approve<S: WorkflowStore + ?Sized>(
        &self,
        store: &mut S,
        kind: EntityKind,
        reference: &EntityRef,
        actor: &str,
    ) -> Result<TransitionOutcome, RegistryError> {
        self.apply(store, kind, reference, &TransitionRequest::approve(actor))
    }

    pub fn reject<S: WorkflowStore + ?Sized>(
        &self,
        store: &mut S,
        kind: EntityKind,
        reference: &EntityRef,
        actor: &str,
        reason: &str,
    ) -> Result<TransitionOutcome, RegistryError> {
        self.apply(store, kind, reference, &TransitionRequest::reject(actor, reason))
    }

    pub fn mark_printed<S: WorkflowStore + ?Sized>(
        &self,
        store: &mut S,
        kind: EntityKind,
        reference: &EntityRef,
        actor: &str,
    ) -> Result<TransitionOutcome, RegistryError> {
        self.apply(store, kind, reference, &TransitionRequest::mark_printed(actor))
    }

    pub fn mark_scanned<S: WorkflowStore + ?Sized>(
        &self,
        store: &mut S,
        kind: EntityKind,
        reference: &EntityRef,
        actor: &str,
    ) -> Result<TransitionOutcome, RegistryError> {
        self.apply(store, kind, reference, &TransitionRequest::mark_scanned(actor))
    }

    pub fn complete<S: WorkflowStore + ?Sized>(
        &self,
        store: &mut S,
        kind: EntityKind,
        reference: &EntityRef,
        actor: &str,
    ) -> Result<TransitionOutcome, RegistryError> {
        self.apply(store, kind, reference, &TransitionRequest::complete(actor))
    }

    pub fn history<S: WorkflowStore + ?Sized>(
        &self,
        store: &mut S,
        kind: EntityKind,
        reference: &EntityRef,
    ) -> Result<Vec<TransitionRecord>, RegistryError> {
        let id = store.resolve_id(kind, reference)?;
        store.transitions(kind, id)
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocator;
    use crate::db::{import_legacy, LegacyRecord};
    use crate::entities::NewRegistration;
    use crate::store::SqliteStore;

    fn create(store: &mut SqliteStore, kind: EntityKind, name: &str) -> Registration {
        Allocator::default()
            .allocate(store, kind, &kind.default_format(), &NewRegistration::new(name), "clerk")
            .unwrap()
    }

    /// Commits a competing transition between the engine's read and its write
    struct Interloper<'a> {
        inner: &'a mut SqliteStore,
        event: Option<TransitionRequest>,
    }

    impl WorkflowStore for Interloper<'_> {
        fn resolve_id(&mut self, kind: EntityKind, reference: &EntityRef) -> Result<i64, RegistryError> {
            self.inner.resolve_id(kind, reference)
        }

        fn read_state(&mut self, kind: EntityKind, id: i64) -> Result<WorkflowState, RegistryError> {
            let state = self.inner.read_state(kind, id)?;
            if let Some(request) = self.event.take() {
                WorkflowEngine.apply(&mut *self.inner, kind, &EntityRef::Id(id), &request)?;
            }
            Ok(state)
        }

        fn compare_and_set(&mut self, kind: EntityKind, id: i64, change: &StateChange) -> Result<CasOutcome, RegistryError> {
            self.inner.compare_and_set(kind, id, change)
        }

        fn load(&mut self, kind: EntityKind, id: i64) -> Result<Registration, RegistryError> {
            self.inner.load(kind, id)
        }

        fn transitions(&mut self, kind: EntityKind, id: i64) -> Result<Vec<TransitionRecord>, RegistryError> {
            self.inner.transitions(kind, id)
        }
    }

    #[test]
    fn test_mark_printed_before_approval_is_illegal() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let card = create(&mut store, EntityKind::BhikkuIdCard, "Card");

        let err = WorkflowEngine
            .mark_printed(&mut store, EntityKind::BhikkuIdCard, &EntityRef::Id(card.id), "printer")
            .unwrap_err();

        match err {
            RegistryError::IllegalTransition { expected, actual, .. } => {
                assert_eq!(expected, Some(WorkflowState::Approved));
                assert_eq!(actual, WorkflowState::Pending);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let after = store.load(EntityKind::BhikkuIdCard, card.id).unwrap();
        assert_eq!(after.version, card.version);
        assert!(store.transitions(EntityKind::BhikkuIdCard, card.id).unwrap().is_empty());
    }

    #[test]
    fn test_reject_requires_reason_before_reading_state() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let card = create(&mut store, EntityKind::BhikkuIdCard, "Card");
        let reference = EntityRef::Id(card.id);
        WorkflowEngine
            .approve(&mut store, EntityKind::BhikkuIdCard, &reference, "registrar")
            .unwrap();

        for reason in ["", "   "] {
            let err = WorkflowEngine
                .reject(&mut store, EntityKind::BhikkuIdCard, &reference, "registrar", reason)
                .unwrap_err();
            assert!(matches!(err, RegistryError::MissingRequiredField { field: "rejection_reason" }));
        }

        // payload is checked even for a record that does not exist
        let err = WorkflowEngine
            .reject(&mut store, EntityKind::BhikkuIdCard, &EntityRef::Id(999), "registrar", "")
            .unwrap_err();
        assert!(matches!(err, RegistryError::MissingRequiredField { .. }));

        let after = store.load(EntityKind::BhikkuIdCard, card.id).unwrap();
        assert_eq!(after.state(), WorkflowState::Approved);
    }

    #[test]
    fn test_blank_actor_is_rejected() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let card = create(&mut store, EntityKind::BhikkuIdCard, "Card");

        let err = WorkflowEngine
            .approve(&mut store, EntityKind::BhikkuIdCard, &EntityRef::Id(card.id), " ")
            .unwrap_err();
        assert!(matches!(err, RegistryError::MissingRequiredField { field: "actor_id" }));
    }

    #[test]
    fn test_reject_twice_fails_second_time() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let card = create(&mut store, EntityKind::Certificate, "Certificate");
        let reference = EntityRef::Id(card.id);

        let first = WorkflowEngine
            .reject(&mut store, EntityKind::Certificate, &reference, "registrar", "blurred photo")
            .unwrap();
        assert_eq!(first.entity.state(), WorkflowState::Rejected);
        assert_eq!(first.entity.rejection_reason.as_deref(), Some("blurred photo"));
        assert_eq!(first.transition.rejection_reason.as_deref(), Some("blurred photo"));

        let err = WorkflowEngine
            .reject(&mut store, EntityKind::Certificate, &reference, "registrar", "again")
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::IllegalTransition {
                actual: WorkflowState::Rejected,
                expected: Some(WorkflowState::Pending),
                ..
            }
        ));

        assert_eq!(store.transitions(EntityKind::Certificate, card.id).unwrap().len(), 1);
    }

    #[test]
    fn test_full_approval_first_lifecycle() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let card = create(&mut store, EntityKind::BhikkuIdCard, "Card");
        let reference = EntityRef::Code(card.code.clone());
        let kind = EntityKind::BhikkuIdCard;

        let approved = WorkflowEngine.approve(&mut store, kind, &reference, "registrar").unwrap();
        assert_eq!(approved.message, format!("bhikku_id_card {} approved", card.code));

        WorkflowEngine.mark_printed(&mut store, kind, &reference, "printer").unwrap();
        WorkflowEngine.mark_scanned(&mut store, kind, &reference, "scanner").unwrap();
        let done = WorkflowEngine
            .apply(&mut store, kind, &reference, &TransitionRequest::complete("registrar").with_notes("filed"))
            .unwrap();

        let entity = done.entity;
        assert_eq!(entity.state(), WorkflowState::Completed);
        assert_eq!(entity.version, card.version + 4);
        assert_eq!(entity.approved.by.as_deref(), Some("registrar"));
        assert_eq!(entity.printed.by.as_deref(), Some("printer"));
        assert_eq!(entity.scanned.by.as_deref(), Some("scanner"));
        assert!(entity.completed.is_set());
        assert!(!entity.rejected.is_set());

        let history = WorkflowEngine.history(&mut store, kind, &reference).unwrap();
        let states: Vec<_> = history.iter().map(|t| t.to_state).collect();
        assert_eq!(
            states,
            vec![
                WorkflowState::Approved,
                WorkflowState::Printed,
                WorkflowState::Scanned,
                WorkflowState::Completed
            ]
        );
        assert_eq!(history[3].notes.as_deref(), Some("filed"));
        assert_eq!(history[0].from_state, WorkflowState::Pending);

        let err = WorkflowEngine.approve(&mut store, kind, &reference, "registrar").unwrap_err();
        assert!(matches!(err, RegistryError::IllegalTransition { actual: WorkflowState::Completed, .. }));
    }

    #[test]
    fn test_print_first_lifecycle() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let kind = EntityKind::Arama;
        let arama = create(&mut store, kind, "Sri Sudharmarama");
        let reference = EntityRef::Id(arama.id);

        let err = WorkflowEngine.approve(&mut store, kind, &reference, "registrar").unwrap_err();
        assert!(matches!(
            err,
            RegistryError::IllegalTransition { expected: Some(WorkflowState::PendApproval), .. }
        ));

        WorkflowEngine.mark_printed(&mut store, kind, &reference, "printer").unwrap();
        let scanned = WorkflowEngine.mark_scanned(&mut store, kind, &reference, "scanner").unwrap();
        assert_eq!(scanned.entity.state(), WorkflowState::PendApproval);

        let approved = WorkflowEngine.approve(&mut store, kind, &reference, "registrar").unwrap();
        assert_eq!(approved.entity.state(), WorkflowState::Approved);

        let err = WorkflowEngine.complete(&mut store, kind, &reference, "registrar").unwrap_err();
        assert!(matches!(err, RegistryError::IllegalTransition { expected: None, .. }));
    }

    #[test]
    fn test_legacy_row_is_materialized_without_a_transition() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let legacy = LegacyRecord {
            id: 7,
            code: "CRT0000007".to_string(),
            display_name: "Old certificate".to_string(),
            workflow_state: String::new(),
            attributes: String::new(),
        };
        import_legacy(store.connection(), EntityKind::Certificate, &[legacy], "importer").unwrap();

        let before = store.load(EntityKind::Certificate, 7).unwrap();
        assert_eq!(before.workflow_state, None);

        assert_eq!(store.read_state(EntityKind::Certificate, 7).unwrap(), WorkflowState::Pending);
        let materialized = store.load(EntityKind::Certificate, 7).unwrap();
        assert_eq!(materialized.workflow_state, Some(WorkflowState::Pending));
        assert_eq!(materialized.version, before.version);
        assert!(store.transitions(EntityKind::Certificate, 7).unwrap().is_empty());

        WorkflowEngine
            .approve(&mut store, EntityKind::Certificate, &EntityRef::Code("CRT0000007".into()), "registrar")
            .unwrap();
        assert_eq!(store.transitions(EntityKind::Certificate, 7).unwrap().len(), 1);
    }

    #[test]
    fn test_lost_race_reports_observed_state() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let kind = EntityKind::Certificate;
        let cert = create(&mut store, kind, "Certificate");

        let mut racing = Interloper {
            inner: &mut store,
            event: Some(TransitionRequest::approve("registrar-a")),
        };
        let err = WorkflowEngine
            .reject(&mut racing, kind, &EntityRef::Id(cert.id), "registrar-b", "duplicate")
            .unwrap_err();

        match err {
            RegistryError::IllegalTransition { expected, actual, .. } => {
                assert_eq!(expected, Some(WorkflowState::Pending));
                assert_eq!(actual, WorkflowState::Approved);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let history = store.transitions(kind, cert.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].actor_id, "registrar-a");
    }

    #[test]
    fn test_transition_records_are_append_only() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let cert = create(&mut store, EntityKind::Certificate, "Certificate");
        WorkflowEngine
            .approve(&mut store, EntityKind::Certificate, &EntityRef::Id(cert.id), "registrar")
            .unwrap();

        let conn = store.connection();
        assert!(conn.execute("UPDATE workflow_transitions SET actor_id = 'someone else'", []).is_err());
        assert!(conn.execute("DELETE FROM workflow_transitions", []).is_err());
    }

    #[test]
    fn test_unknown_and_deleted_records_are_not_found() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let kind = EntityKind::Certificate;

        let err = WorkflowEngine
            .approve(&mut store, kind, &EntityRef::Code("CRT9999999".into()), "registrar")
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));

        let cert = create(&mut store, kind, "Certificate");
        store.soft_delete(kind, cert.id, cert.version, "admin").unwrap();

        let err = WorkflowEngine
            .approve(&mut store, kind, &EntityRef::Id(cert.id), "registrar")
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }
}
