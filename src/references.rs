// 🔗 Reference Validator
// Confirms natural-key references (division code, parent temple code,
// officiating monk's registration number, ...) exist and are not
// soft-deleted before a record is allocated or updated.
//
// One descriptor table per entity kind (EntityKind::references) drives a
// single generic check instead of ad hoc lookups per entity.

use crate::entities::Attributes;
use crate::error::RegistryError;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

// ============================================================================
// DESCRIPTORS
// ============================================================================

/// (schema, table, column) owning a natural key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReferenceTarget {
    pub schema: String,
    pub table: String,
    pub column: String,
}

impl ReferenceTarget {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        ReferenceTarget::in_schema("main", table, column)
    }

    pub fn in_schema(schema: impl Into<String>, table: impl Into<String>, column: impl Into<String>) -> Self {
        ReferenceTarget {
            schema: schema.into(),
            table: table.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for ReferenceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.schema, self.table, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceRule {
    /// The value is one natural key
    Single(ReferenceTarget),

    /// Not checked here. Used for delimited lists the calling service
    /// validates itself; the reason documents why.
    Excluded { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDescriptor {
    pub field: String,
    pub rule: ReferenceRule,
}

impl ReferenceDescriptor {
    pub fn single(field: impl Into<String>, target: ReferenceTarget) -> Self {
        ReferenceDescriptor {
            field: field.into(),
            rule: ReferenceRule::Single(target),
        }
    }

    pub fn excluded(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ReferenceDescriptor {
            field: field.into(),
            rule: ReferenceRule::Excluded { reason: reason.into() },
        }
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

/// Holds the probe SQL for every target it has resolved. Share one instance
/// per process (see `shared`) so each target is introspected once.
#[derive(Debug, Default)]
pub struct ReferenceValidator {
    probes: RwLock<HashMap<ReferenceTarget, String>>,
}

static SHARED: OnceLock<Arc<ReferenceValidator>> = OnceLock::new();

impl ReferenceValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance
    pub fn shared() -> Arc<ReferenceValidator> {
        SHARED.get_or_init(|| Arc::new(ReferenceValidator::new())).clone()
    }

    /// Check every described field present in `attributes`.
    ///
    /// Null and blank values are skipped. Attributes with no descriptor are
    /// not references and are ignored. Fields described as `Excluded` are
    /// skipped on purpose; nothing else is.
    pub fn validate(
        &self,
        conn: &Connection,
        descriptors: &[ReferenceDescriptor],
        attributes: &Attributes,
    ) -> Result<(), RegistryError> {
        for descriptor in descriptors {
            let Some(raw) = attributes.get(&descriptor.field) else {
                continue;
            };

            let target = match &descriptor.rule {
                ReferenceRule::Single(target) => target,
                ReferenceRule::Excluded { reason } => {
                    tracing::debug!(field = %descriptor.field, reason = %reason, "reference check excluded");
                    continue;
                }
            };

            match reference_value(&descriptor.field, raw)? {
                Some(value) => self.check(conn, &descriptor.field, target, &value)?,
                None => continue,
            }
        }

        Ok(())
    }

    /// One existence probe
    pub fn check(
        &self,
        conn: &Connection,
        field: &str,
        target: &ReferenceTarget,
        value: &str,
    ) -> Result<(), RegistryError> {
        let sql = self.probe_sql(conn, target)?;

        let found = conn
            .query_row(&sql, [value], |_| Ok(()))
            .optional()
            .map_err(|e| RegistryError::Store(format!("reference probe on {} failed: {}", target, e)))?;

        tracing::debug!(field, target = %target, value, found = found.is_some(), "reference probe");

        match found {
            Some(()) => Ok(()),
            None => Err(RegistryError::DanglingReference {
                field: field.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// List-aware check for fields the descriptor table excludes, e.g. a
    /// comma-separated list of registration numbers. Blank items are ignored.
    pub fn validate_delimited(
        &self,
        conn: &Connection,
        field: &str,
        target: &ReferenceTarget,
        raw: &str,
        delimiter: char,
    ) -> Result<(), RegistryError> {
        for item in raw.split(delimiter).map(str::trim).filter(|s| !s.is_empty()) {
            self.check(conn, field, target, item)?;
        }
        Ok(())
    }

    pub fn cached_targets(&self) -> usize {
        self.probes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Resolve a target once: identifiers must be plain, the table must
    /// exist and carry both the key column and `is_deleted`.
    fn probe_sql(&self, conn: &Connection, target: &ReferenceTarget) -> Result<String, RegistryError> {
        if let Some(sql) = self.probes.read().unwrap_or_else(|e| e.into_inner()).get(target) {
            return Ok(sql.clone());
        }

        let invalid = |reason: &str| RegistryError::InvalidReferenceTarget {
            target: target.to_string(),
            reason: reason.to_string(),
        };

        for ident in [&target.schema, &target.table, &target.column] {
            if !is_plain_identifier(ident) {
                return Err(invalid("identifiers must be letters, digits or '_'"));
            }
        }

        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1, ?2)")?;
        let columns: Vec<String> = stmt
            .query_map([&target.table, &target.schema], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        if columns.is_empty() {
            return Err(invalid("table does not exist"));
        }
        if !columns.iter().any(|c| c == &target.column) {
            return Err(invalid("column does not exist"));
        }
        if !columns.iter().any(|c| c == "is_deleted") {
            return Err(invalid("table has no is_deleted column"));
        }

        let sql = format!(
            "SELECT 1 FROM \"{}\".\"{}\" WHERE \"{}\" = ?1 AND is_deleted = 0 LIMIT 1",
            target.schema, target.table, target.column
        );

        self.probes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(target.clone(), sql.clone());

        Ok(sql)
    }
}

fn is_plain_identifier(ident: &str) -> bool {
    let mut chars = ident.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Attribute value → key to probe. None means "nothing to check".
fn reference_value(field: &str, raw: &Value) -> Result<Option<String>, RegistryError> {
    match raw {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s.trim().to_string())),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(RegistryError::DanglingReference {
            field: field.to_string(),
            value: other.to_string(),
        }),
    }
}
