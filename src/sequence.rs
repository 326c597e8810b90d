// 📈 Sequence Inspector
// Reads (and, for the id sequence and code counters, advances) the
// high-water marks the allocator works from.
//
// Two independent marks per entity table:
// - code high-water: MAX over parsed code suffixes (or a dedicated counter row)
// - id sequence:     next surrogate id, kept in `id_sequences` like a
//                    database sequence object
//
// Table names come from EntityKind, never from user input.

use crate::allocator::CodeFormat;
use rusqlite::{params, Connection, OptionalExtension, Result};
use serde::Serialize;

/// Snapshot of both high-water marks for one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceStatus {
    pub table: String,
    pub prefix: String,
    pub code_max: u64,
    pub counter: Option<u64>,
    pub next_id: i64,
    pub max_id: i64,
    pub desynced: bool,
}

pub fn inspect(conn: &Connection, table: &str, format: &CodeFormat) -> Result<SequenceStatus> {
    let next_id = next_id_value(conn, table)?.unwrap_or(1);
    let max_id = max_row_id(conn, table)?;

    Ok(SequenceStatus {
        table: table.to_string(),
        prefix: format.prefix.clone(),
        code_max: scan_max(conn, table, format)?,
        counter: counter_value(conn, table, &format.prefix)?,
        next_id,
        max_id,
        desynced: next_id <= max_id,
    })
}

// ============================================================================
// CODE HIGH-WATER MARK
// ============================================================================

/// Highest numeric suffix among codes starting with the format's prefix.
/// Soft-deleted rows count: a code is never handed out twice.
pub fn scan_max(conn: &Connection, table: &str, format: &CodeFormat) -> Result<u64> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT code FROM {} WHERE substr(code, 1, ?1) = ?2",
        table
    ))?;

    let codes = stmt.query_map(
        params![format.prefix.chars().count() as i64, format.prefix],
        |row| row.get::<_, String>(0),
    )?;

    let mut max = 0;
    for code in codes {
        max = max.max(format.parse_suffix(&code?));
    }

    tracing::debug!(table, prefix = %format.prefix, max, "scanned code high-water mark");
    Ok(max)
}

/// Current value of the dedicated counter, if one was ever created
pub fn counter_value(conn: &Connection, table: &str, prefix: &str) -> Result<Option<u64>> {
    conn.query_row(
        "SELECT last_value FROM code_counters WHERE table_name = ?1 AND prefix = ?2",
        params![table, prefix],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|value| value.map(|v| v.max(0) as u64))
}

/// Increment and return the counter, seeding it from the scan on first use.
/// Must run inside a write transaction.
pub fn reserve_counter(conn: &Connection, table: &str, format: &CodeFormat) -> Result<u64> {
    if counter_value(conn, table, &format.prefix)?.is_none() {
        let seed = scan_max(conn, table, format)?;
        conn.execute(
            "INSERT OR IGNORE INTO code_counters (table_name, prefix, last_value) VALUES (?1, ?2, ?3)",
            params![table, format.prefix, seed as i64],
        )?;
    }

    let reserved: i64 = conn.query_row(
        "UPDATE code_counters SET last_value = last_value + 1
         WHERE table_name = ?1 AND prefix = ?2
         RETURNING last_value",
        params![table, format.prefix],
        |row| row.get(0),
    )?;

    Ok(reserved.max(0) as u64)
}

/// Never lowers the counter
pub fn raise_counter(conn: &Connection, table: &str, format: &CodeFormat, floor: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO code_counters (table_name, prefix, last_value) VALUES (?1, ?2, ?3)
         ON CONFLICT (table_name, prefix) DO UPDATE SET last_value = MAX(last_value, excluded.last_value)",
        params![table, format.prefix, floor as i64],
    )?;
    Ok(())
}

// ============================================================================
// ID SEQUENCE
// ============================================================================

pub fn max_row_id(conn: &Connection, table: &str) -> Result<i64> {
    conn.query_row(&format!("SELECT COALESCE(MAX(id), 0) FROM {}", table), [], |row| {
        row.get(0)
    })
}

pub fn next_id_value(conn: &Connection, table: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT next_value FROM id_sequences WHERE table_name = ?1",
        [table],
        |row| row.get(0),
    )
    .optional()
}

/// Take the next surrogate id. Must run inside the insert's transaction so
/// a rolled-back insert gives the id back.
pub fn take_next_id(conn: &Connection, table: &str) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO id_sequences (table_name, next_value) VALUES (?1, 1)",
        [table],
    )?;

    conn.query_row(
        "UPDATE id_sequences SET next_value = next_value + 1
         WHERE table_name = ?1
         RETURNING next_value - 1",
        [table],
        |row| row.get(0),
    )
}

/// True when the next id would collide with an existing row
pub fn is_desynced(conn: &Connection, table: &str) -> Result<bool> {
    let next = next_id_value(conn, table)?.unwrap_or(1);
    Ok(next <= max_row_id(conn, table)?)
}

/// Move the sequence to max(id) + 1. Never moves it backwards.
pub fn resync_id_sequence(conn: &Connection, table: &str) -> Result<i64> {
    let target = max_row_id(conn, table)? + 1;
    conn.query_row(
        "INSERT INTO id_sequences (table_name, next_value) VALUES (?1, ?2)
         ON CONFLICT (table_name) DO UPDATE SET next_value = MAX(next_value, excluded.next_value)
         RETURNING next_value",
        params![table, target],
        |row| row.get(0),
    )
}
