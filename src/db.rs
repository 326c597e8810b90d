use crate::entities::EntityKind;
use crate::workflow::WorkflowState;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Event for the general audit trail (creation, updates, deletes, imports).
/// Workflow changes are recorded separately in `workflow_transitions`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Lookup tables owned elsewhere; only what reference checks probe lives here
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceTable {
    DivisionalSecretariat,
    Nikaya,
    StatusCode,
}

impl ReferenceTable {
    pub const ALL: [ReferenceTable; 3] = [
        ReferenceTable::DivisionalSecretariat,
        ReferenceTable::Nikaya,
        ReferenceTable::StatusCode,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            ReferenceTable::DivisionalSecretariat => "divisional_secretariats",
            ReferenceTable::Nikaya => "nikayas",
            ReferenceTable::StatusCode => "status_codes",
        }
    }

    pub fn code_column(&self) -> &'static str {
        match self {
            ReferenceTable::DivisionalSecretariat => "ds_code",
            ReferenceTable::Nikaya => "nk_code",
            ReferenceTable::StatusCode => "st_code",
        }
    }
}

pub fn setup_database(conn: &Connection) -> rusqlite::Result<()> {
    // Enable WAL mode for concurrent readers during writes
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Registerable entity tables (one per kind, identical shape)
    // ==========================================================================
    for kind in EntityKind::ALL {
        create_entity_table(conn, kind.table())?;
    }

    // ==========================================================================
    // Id sequences (sequence objects; explicit-id imports do not advance them)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS id_sequences (
            table_name TEXT PRIMARY KEY,
            next_value INTEGER NOT NULL
        )",
        [],
    )?;

    for kind in EntityKind::ALL {
        conn.execute(
            "INSERT OR IGNORE INTO id_sequences (table_name, next_value) VALUES (?1, 1)",
            [kind.table()],
        )?;
    }

    // ==========================================================================
    // Code counters (used by the "counter" allocation strategy)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS code_counters (
            table_name TEXT NOT NULL,
            prefix TEXT NOT NULL,
            last_value INTEGER NOT NULL,
            PRIMARY KEY (table_name, prefix)
        )",
        [],
    )?;

    // ==========================================================================
    // Workflow transitions (append-only)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS workflow_transitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id INTEGER NOT NULL,
            event TEXT NOT NULL,
            from_state TEXT NOT NULL,
            to_state TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            notes TEXT,
            rejection_reason TEXT
        )",
        [],
    )?;

    conn.execute_batch(
        "CREATE TRIGGER IF NOT EXISTS workflow_transitions_no_update
         BEFORE UPDATE ON workflow_transitions
         BEGIN
            SELECT RAISE(ABORT, 'workflow transitions are append-only');
         END;

         CREATE TRIGGER IF NOT EXISTS workflow_transitions_no_delete
         BEFORE DELETE ON workflow_transitions
         BEGIN
            SELECT RAISE(ABORT, 'workflow transitions are append-only');
         END;",
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Reference tables
    // ==========================================================================
    for table in ReferenceTable::ALL {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    {} TEXT UNIQUE NOT NULL,
                    name TEXT NOT NULL,
                    is_deleted INTEGER NOT NULL DEFAULT 0
                )",
                table.table(),
                table.code_column()
            ),
            [],
        )?;
    }

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transitions_entity ON workflow_transitions(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

fn create_entity_table(conn: &Connection, table: &str) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                attributes TEXT NOT NULL DEFAULT '{{}}',
                workflow_state TEXT,
                approved_by TEXT,
                approved_at TEXT,
                rejected_by TEXT,
                rejected_at TEXT,
                rejection_reason TEXT,
                printed_by TEXT,
                printed_at TEXT,
                scanned_by TEXT,
                scanned_at TEXT,
                completed_by TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                created_by TEXT NOT NULL,
                updated_at TEXT,
                updated_by TEXT,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1
            )"
        ),
        [],
    )?;

    conn.execute_batch(&format!(
        "CREATE TRIGGER IF NOT EXISTS {table}_code_immutable
         BEFORE UPDATE OF code ON {table}
         WHEN OLD.code IS NOT NEW.code
         BEGIN
            SELECT RAISE(ABORT, 'registration code is immutable');
         END;

         CREATE INDEX IF NOT EXISTS idx_{table}_state ON {table}(workflow_state);"
    ))?;

    Ok(())
}

// ============================================================================
// REFERENCE SEEDING
// ============================================================================

pub fn seed_reference(conn: &Connection, table: ReferenceTable, code: &str, name: &str) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {} ({}, name) VALUES (?1, ?2)
             ON CONFLICT ({}) DO UPDATE SET name = excluded.name, is_deleted = 0",
            table.table(),
            table.code_column(),
            table.code_column()
        ),
        params![code, name],
    )?;
    Ok(())
}

pub fn soft_delete_reference(conn: &Connection, table: ReferenceTable, code: &str) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "UPDATE {} SET is_deleted = 1 WHERE {} = ?1",
            table.table(),
            table.code_column()
        ),
        [code],
    )
}

// ============================================================================
// LEGACY IMPORT
// ============================================================================

/// One row of a legacy CSV export. Ids and codes are kept as-is, which is
/// why an import leaves the id sequence behind the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyRecord {
    pub id: i64,
    pub code: String,
    pub display_name: String,

    /// Blank for records that predate the approval workflow
    #[serde(default)]
    pub workflow_state: String,

    /// JSON object, may be blank
    #[serde(default)]
    pub attributes: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub inserted: usize,
    pub duplicates: usize,
}

pub fn load_legacy_csv(csv_path: &Path) -> Result<Vec<LegacyRecord>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;

    let mut records = Vec::new();
    for result in rdr.deserialize() {
        let record: LegacyRecord = result.context("Failed to deserialize legacy record")?;
        records.push(record);
    }

    Ok(records)
}

pub fn import_legacy(
    conn: &Connection,
    kind: EntityKind,
    records: &[LegacyRecord],
    actor: &str,
) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    let now = Utc::now().to_rfc3339();

    for record in records {
        let state = match record.workflow_state.trim() {
            "" => None,
            raw => Some(
                raw.parse::<WorkflowState>()
                    .with_context(|| format!("Bad workflow_state for {}", record.code))?,
            ),
        };

        let attributes = match record.attributes.trim() {
            "" => serde_json::json!({}),
            raw => {
                let value: serde_json::Value = serde_json::from_str(raw)
                    .with_context(|| format!("Bad attributes JSON for {}", record.code))?;
                if !value.is_object() {
                    return Err(anyhow!("Attributes for {} must be a JSON object", record.code));
                }
                value
            }
        };

        let result = conn.execute(
            &format!(
                "INSERT INTO {} (id, code, display_name, attributes, workflow_state, created_at, created_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                kind.table()
            ),
            params![
                record.id,
                record.code,
                record.display_name,
                attributes.to_string(),
                state.map(|s| s.as_str()),
                now,
                actor,
            ],
        );

        match result {
            Ok(_) => {
                summary.inserted += 1;

                let event = Event::new(
                    "legacy_imported",
                    kind.as_str(),
                    &record.id.to_string(),
                    serde_json::json!({ "code": record.code }),
                    actor,
                );
                insert_event(conn, &event)?;
            }
            Err(rusqlite::Error::SqliteFailure(err, _)) if is_duplicate_row(&err) => {
                summary.duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    tracing::info!(
        kind = %kind,
        inserted = summary.inserted,
        duplicates = summary.duplicates,
        "legacy import finished"
    );

    Ok(summary)
}

// ============================================================================
// EVENTS
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            event.data.to_string(),
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> rusqlite::Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(1, &timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

pub fn count_events(conn: &Connection, event_type: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM events WHERE event_type = ?1",
        [event_type],
        |row| row.get(0),
    )
}

pub fn count_registrations(conn: &Connection, kind: EntityKind) -> rusqlite::Result<i64> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE is_deleted = 0", kind.table()),
        [],
        |row| row.get(0),
    )
}

/// RFC 3339 column → DateTime<Utc>, as a row-mapping error on bad input
pub(crate) fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e)))
}

/// Same id or same code already present. Other constraint failures
/// (NOT NULL, CHECK, triggers) are real errors.
fn is_duplicate_row(err: &rusqlite::ffi::Error) -> bool {
    err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
}
