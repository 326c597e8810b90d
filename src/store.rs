// 🗄️ SQLite Store
// One connection, implementing both the allocator's and the workflow engine's
// storage contracts. Every write runs in an IMMEDIATE transaction so the
// write lock is taken up front and a busy database surfaces as contention
// instead of a mid-transaction upgrade failure.

use crate::allocator::{AllocationStore, CodeFormat, InsertOutcome};
use crate::config::DatabaseConfig;
use crate::db::{self, parse_timestamp, Event};
use crate::engine::{CasOutcome, StateChange, TransitionRecord, WorkflowStore};
use crate::entities::{Attributes, EntityKind, EntityRef, NewRegistration, Registration, StageStamp};
use crate::error::RegistryError;
use crate::sequence::{self, SequenceStatus};
use crate::workflow::{WorkflowEvent, WorkflowState};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{ffi, params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use serde_json::json;
use std::time::Duration;

const REGISTRATION_COLUMNS: &str = "id, code, display_name, attributes, workflow_state,
    approved_by, approved_at, rejected_by, rejected_at, rejection_reason,
    printed_by, printed_at, scanned_by, scanned_at, completed_by, completed_at,
    created_at, created_by, updated_at, updated_by, is_deleted, version";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and make sure the schema exists
    pub fn open(config: &DatabaseConfig) -> Result<Self, RegistryError> {
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, RegistryError> {
        db::setup_database(&conn)?;
        Ok(SqliteStore { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Live (not soft-deleted) records of one kind
    pub fn count(&self, kind: EntityKind) -> Result<i64, RegistryError> {
        Ok(db::count_registrations(&self.conn, kind)?)
    }

    pub fn sequence_status(&self, kind: EntityKind, format: &CodeFormat) -> Result<SequenceStatus, RegistryError> {
        Ok(sequence::inspect(&self.conn, kind.table(), format)?)
    }

    /// Live record by id or code
    pub fn get(&mut self, kind: EntityKind, reference: &EntityRef) -> Result<Registration, RegistryError> {
        let id = self.resolve_id(kind, reference)?;
        self.load(kind, id)
    }

    /// General audit log for one record, newest first
    pub fn events(&self, kind: EntityKind, id: i64) -> Result<Vec<Event>, RegistryError> {
        Ok(db::get_events_for_entity(&self.conn, kind.as_str(), &id.to_string())?)
    }

    /// Replace the attribute map, guarded by the record's version
    pub fn update_attributes(
        &mut self,
        kind: EntityKind,
        id: i64,
        expected_version: i64,
        attributes: &Attributes,
        actor: &str,
    ) -> Result<Registration, RegistryError> {
        let encoded = serde_json::to_string(attributes)
            .map_err(|e| RegistryError::Store(format!("attributes are not serializable: {}", e)))?;
        let now = Utc::now().to_rfc3339();

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            &format!(
                "UPDATE {} SET attributes = ?1, updated_at = ?2, updated_by = ?3, version = version + 1
                 WHERE id = ?4 AND is_deleted = 0 AND version = ?5",
                kind.table()
            ),
            params![encoded, now, actor, id, expected_version],
        )?;

        if updated == 0 {
            let actual = live_version(&tx, kind, id)?;
            tx.rollback()?;
            return Err(version_conflict(kind, id, expected_version, actual));
        }

        let mut keys: Vec<&String> = attributes.keys().collect();
        keys.sort();
        let event = Event::new(
            "attributes_updated",
            kind.as_str(),
            &id.to_string(),
            json!({ "version": expected_version + 1, "keys": keys }),
            actor,
        );
        db::insert_event(&tx, &event)?;
        tx.commit()?;

        tracing::info!(kind = %kind, id, version = expected_version + 1, "attributes updated");
        self.load(kind, id)
    }

    /// Flag the record deleted. Its code stays taken.
    pub fn soft_delete(
        &mut self,
        kind: EntityKind,
        id: i64,
        expected_version: i64,
        actor: &str,
    ) -> Result<Registration, RegistryError> {
        let now = Utc::now().to_rfc3339();

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            &format!(
                "UPDATE {} SET is_deleted = 1, updated_at = ?1, updated_by = ?2, version = version + 1
                 WHERE id = ?3 AND is_deleted = 0 AND version = ?4",
                kind.table()
            ),
            params![now, actor, id, expected_version],
        )?;

        if updated == 0 {
            let actual = live_version(&tx, kind, id)?;
            tx.rollback()?;
            return Err(version_conflict(kind, id, expected_version, actual));
        }

        let event = Event::new("registration_deleted", kind.as_str(), &id.to_string(), json!({}), actor);
        db::insert_event(&tx, &event)?;
        tx.commit()?;

        tracing::info!(kind = %kind, id, actor, "registration soft-deleted");
        self.load(kind, id)
    }

    fn insert_in_tx(
        conn: &Connection,
        kind: EntityKind,
        code: &str,
        draft: &NewRegistration,
        actor: &str,
    ) -> rusqlite::Result<i64> {
        let id = sequence::take_next_id(conn, kind.table())?;
        let attributes =
            serde_json::to_string(&draft.attributes).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        conn.execute(
            &format!(
                "INSERT INTO {} (id, code, display_name, attributes, workflow_state, created_at, created_by, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
                kind.table()
            ),
            params![
                id,
                code,
                draft.display_name,
                attributes,
                WorkflowState::initial().as_str(),
                Utc::now().to_rfc3339(),
                actor,
            ],
        )?;

        let event = Event::new(
            "registration_created",
            kind.as_str(),
            &id.to_string(),
            json!({ "code": code, "display_name": draft.display_name }),
            actor,
        );
        db::insert_event(conn, &event)?;

        Ok(id)
    }
}

// ============================================================================
// ALLOCATOR CONTRACT
// ============================================================================

impl AllocationStore for SqliteStore {
    fn scan_max(&mut self, kind: EntityKind, format: &CodeFormat) -> Result<u64, RegistryError> {
        Ok(sequence::scan_max(&self.conn, kind.table(), format)?)
    }

    fn reserve_counter(&mut self, kind: EntityKind, format: &CodeFormat) -> Result<u64, RegistryError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let reserved = sequence::reserve_counter(&tx, kind.table(), format)?;
        tx.commit()?;
        Ok(reserved)
    }

    fn raise_counter(&mut self, kind: EntityKind, format: &CodeFormat, floor: u64) -> Result<(), RegistryError> {
        Ok(sequence::raise_counter(&self.conn, kind.table(), format, floor)?)
    }

    fn insert_registration(
        &mut self,
        kind: EntityKind,
        code: &str,
        draft: &NewRegistration,
        actor: &str,
    ) -> Result<InsertOutcome, RegistryError> {
        let tx = match self.conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(e) if is_contention(&e) => return Ok(InsertOutcome::Contention),
            Err(e) => return Err(e.into()),
        };

        let id = match Self::insert_in_tx(&tx, kind, code, draft, actor) {
            Ok(id) => id,
            Err(e) => {
                tx.rollback()?;
                return match classify_insert_error(&e) {
                    Some(outcome) => {
                        tracing::debug!(kind = %kind, code, error = %e, "insert refused");
                        Ok(outcome)
                    }
                    None => Err(e.into()),
                };
            }
        };

        match tx.commit() {
            Ok(()) => {}
            Err(e) if is_contention(&e) => return Ok(InsertOutcome::Contention),
            Err(e) => return Err(e.into()),
        }

        Ok(InsertOutcome::Inserted(self.load(kind, id)?))
    }

    fn resync_id_sequence(&mut self, kind: EntityKind) -> Result<i64, RegistryError> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let next = sequence::resync_id_sequence(&tx, kind.table())?;
        tx.commit()?;
        Ok(next)
    }
}

// ============================================================================
// WORKFLOW CONTRACT
// ============================================================================

impl WorkflowStore for SqliteStore {
    fn resolve_id(&mut self, kind: EntityKind, reference: &EntityRef) -> Result<i64, RegistryError> {
        let found = match reference {
            EntityRef::Id(id) => self
                .conn
                .query_row(
                    &format!("SELECT id FROM {} WHERE id = ?1 AND is_deleted = 0", kind.table()),
                    [id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?,
            EntityRef::Code(code) => self
                .conn
                .query_row(
                    &format!("SELECT id FROM {} WHERE code = ?1 AND is_deleted = 0", kind.table()),
                    [code.trim()],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?,
        };

        found.ok_or_else(|| RegistryError::NotFound {
            kind,
            reference: reference.to_string(),
        })
    }

    fn read_state(&mut self, kind: EntityKind, id: i64) -> Result<WorkflowState, RegistryError> {
        let sql = format!("SELECT workflow_state FROM {} WHERE id = ?1 AND is_deleted = 0", kind.table());

        let stored: Option<Option<String>> = self.conn.query_row(&sql, [id], |row| row.get(0)).optional()?;
        let raw = match stored {
            None => return Err(not_found(kind, id)),
            Some(Some(raw)) => raw,
            Some(None) => {
                let materialized = self.conn.execute(
                    &format!(
                        "UPDATE {} SET workflow_state = ?1 WHERE id = ?2 AND workflow_state IS NULL",
                        kind.table()
                    ),
                    params![WorkflowState::initial().as_str(), id],
                )?;
                if materialized > 0 {
                    tracing::info!(kind = %kind, id, "legacy record given initial workflow state");
                }

                let reread: Option<Option<String>> = self.conn.query_row(&sql, [id], |row| row.get(0)).optional()?;
                match reread {
                    Some(Some(raw)) => raw,
                    _ => return Err(not_found(kind, id)),
                }
            }
        };

        raw.parse::<WorkflowState>()
            .map_err(|e| RegistryError::Store(format!("{} #{}: {}", kind, id, e)))
    }

    fn compare_and_set(&mut self, kind: EntityKind, id: i64, change: &StateChange) -> Result<CasOutcome, RegistryError> {
        let table = kind.table();
        let stem = change.event.audit_column();
        let at = change.at.to_rfc3339();

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            &format!(
                "UPDATE {table}
                 SET workflow_state = ?1, {stem}_by = ?2, {stem}_at = ?3,
                     rejection_reason = COALESCE(?4, rejection_reason),
                     updated_at = ?3, updated_by = ?2, version = version + 1
                 WHERE id = ?5 AND is_deleted = 0 AND workflow_state = ?6"
            ),
            params![
                change.to.as_str(),
                change.actor,
                at,
                change.rejection_reason,
                id,
                change.from.as_str()
            ],
        )?;

        if updated == 0 {
            let observed: Option<Option<String>> = tx
                .query_row(
                    &format!("SELECT workflow_state FROM {table} WHERE id = ?1 AND is_deleted = 0"),
                    [id],
                    |row| row.get(0),
                )
                .optional()?;
            tx.rollback()?;

            return match observed {
                None => Ok(CasOutcome::Missing),
                Some(raw) => {
                    let state = match raw {
                        Some(raw) => raw
                            .parse::<WorkflowState>()
                            .map_err(|e| RegistryError::Store(format!("{} #{}: {}", kind, id, e)))?,
                        None => WorkflowState::initial(),
                    };
                    Ok(CasOutcome::StateMismatch(state))
                }
            };
        }

        tx.execute(
            "INSERT INTO workflow_transitions (
                entity_type, entity_id, event, from_state, to_state, actor_id, occurred_at, notes, rejection_reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                kind.as_str(),
                id,
                change.event.as_str(),
                change.from.as_str(),
                change.to.as_str(),
                change.actor,
                at,
                change.notes,
                change.rejection_reason,
            ],
        )?;
        let record_id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(CasOutcome::Applied(TransitionRecord {
            id: record_id,
            entity_kind: kind,
            entity_id: id,
            event: change.event,
            from_state: change.from,
            to_state: change.to,
            actor_id: change.actor.clone(),
            occurred_at: change.at,
            notes: change.notes.clone(),
            rejection_reason: change.rejection_reason.clone(),
        }))
    }

    fn load(&mut self, kind: EntityKind, id: i64) -> Result<Registration, RegistryError> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM {} WHERE id = ?1", REGISTRATION_COLUMNS, kind.table()),
                [id],
                |row| registration_from_row(kind, row),
            )
            .optional()?
            .ok_or_else(|| not_found(kind, id))
    }

    fn transitions(&mut self, kind: EntityKind, id: i64) -> Result<Vec<TransitionRecord>, RegistryError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, event, from_state, to_state, actor_id, occurred_at, notes, rejection_reason
             FROM workflow_transitions
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY id",
        )?;

        let records = stmt
            .query_map(params![kind.as_str(), id], |row| {
                let event: String = row.get(1)?;
                let from: String = row.get(2)?;
                let to: String = row.get(3)?;
                let occurred_at: String = row.get(5)?;

                Ok(TransitionRecord {
                    id: row.get(0)?,
                    entity_kind: kind,
                    entity_id: id,
                    event: WorkflowEvent::parse(&event)
                        .ok_or_else(|| conversion_error(1, format!("unknown workflow event '{}'", event)))?,
                    from_state: parse_state(2, &from)?,
                    to_state: parse_state(3, &to)?,
                    actor_id: row.get(4)?,
                    occurred_at: parse_timestamp(5, &occurred_at)?,
                    notes: row.get(6)?,
                    rejection_reason: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

/// Map an insert failure onto the outcomes the allocator can recover from
fn classify_insert_error(err: &rusqlite::Error) -> Option<InsertOutcome> {
    if is_contention(err) {
        return Some(InsertOutcome::Contention);
    }

    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
            Some(InsertOutcome::KeyDesync)
        }
        rusqlite::Error::SqliteFailure(e, Some(message))
            if e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE && message.ends_with(".code") =>
        {
            Some(InsertOutcome::DuplicateCode)
        }
        _ => None,
    }
}

fn not_found(kind: EntityKind, id: i64) -> RegistryError {
    RegistryError::NotFound {
        kind,
        reference: EntityRef::Id(id).to_string(),
    }
}

fn live_version(conn: &Connection, kind: EntityKind, id: i64) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        &format!("SELECT version FROM {} WHERE id = ?1 AND is_deleted = 0", kind.table()),
        [id],
        |row| row.get(0),
    )
    .optional()
}

fn version_conflict(kind: EntityKind, id: i64, expected: i64, actual: Option<i64>) -> RegistryError {
    match actual {
        Some(actual) => RegistryError::StaleVersion {
            kind,
            reference: EntityRef::Id(id).to_string(),
            expected,
            actual,
        },
        None => not_found(kind, id),
    }
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

fn parse_state(column: usize, raw: &str) -> rusqlite::Result<WorkflowState> {
    raw.parse::<WorkflowState>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn parse_optional_timestamp(row: &Row, column: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| parse_timestamp(column, &s)).transpose()
}

fn stage_stamp(row: &Row, by: usize, at: usize) -> rusqlite::Result<StageStamp> {
    Ok(StageStamp {
        by: row.get(by)?,
        at: parse_optional_timestamp(row, at)?,
    })
}

fn registration_from_row(kind: EntityKind, row: &Row) -> rusqlite::Result<Registration> {
    let attributes_json: String = row.get(3)?;
    let state: Option<String> = row.get(4)?;
    let created_at: String = row.get(16)?;

    Ok(Registration {
        id: row.get(0)?,
        kind,
        code: row.get(1)?,
        display_name: row.get(2)?,
        attributes: serde_json::from_str(&attributes_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        workflow_state: state.map(|s| parse_state(4, &s)).transpose()?,
        approved: stage_stamp(row, 5, 6)?,
        rejected: stage_stamp(row, 7, 8)?,
        rejection_reason: row.get(9)?,
        printed: stage_stamp(row, 10, 11)?,
        scanned: stage_stamp(row, 12, 13)?,
        completed: stage_stamp(row, 14, 15)?,
        created_at: parse_timestamp(16, &created_at)?,
        created_by: row.get(17)?,
        updated_at: parse_optional_timestamp(row, 18)?,
        updated_by: row.get(19)?,
        is_deleted: row.get(20)?,
        version: row.get(21)?,
    })
}
