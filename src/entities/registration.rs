// 📇 Registration - the persisted shape shared by every Registerable Entity
//
// Identity: `id` (store-owned surrogate) and `code` (allocated, human-readable).
// Both are immutable once assigned. Everything else is a value that changes
// under the workflow or an attribute update, each change bumping `version`.

use crate::entities::kind::EntityKind;
use crate::workflow::WorkflowState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Entity-specific fields, natural-key references included.
/// Same "aggregates as maps" approach as the event log's `data`.
pub type Attributes = HashMap<String, serde_json::Value>;

// ============================================================================
// NEW REGISTRATION (input to the allocator)
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRegistration {
    pub display_name: String,

    #[serde(default)]
    pub attributes: Attributes,
}

impl NewRegistration {
    pub fn new(display_name: impl Into<String>) -> Self {
        NewRegistration {
            display_name: display_name.into(),
            attributes: Attributes::new(),
        }
    }

    /// Builder: add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// ENTITY REFERENCE (lookup by surrogate id or by code)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    Id(i64),
    Code(String),
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Id(id) => write!(f, "#{}", id),
            EntityRef::Code(code) => f.write_str(code),
        }
    }
}

impl From<i64> for EntityRef {
    fn from(id: i64) -> Self {
        EntityRef::Id(id)
    }
}

impl From<&str> for EntityRef {
    fn from(code: &str) -> Self {
        EntityRef::Code(code.to_string())
    }
}

/// All-digit input is a surrogate id, anything else is a code
impl FromStr for EntityRef {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s.parse::<i64>() {
            Ok(id) => EntityRef::Id(id),
            Err(_) => EntityRef::Code(s.to_string()),
        })
    }
}

// ============================================================================
// REGISTRATION (persisted record)
// ============================================================================

/// Who moved the record into a stage, and when
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStamp {
    pub by: Option<String>,
    pub at: Option<DateTime<Utc>>,
}

impl StageStamp {
    pub fn is_set(&self) -> bool {
        self.by.is_some() && self.at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    // ========================================================================
    // IDENTITY (never changes)
    // ========================================================================
    pub id: i64,
    pub kind: EntityKind,
    pub code: String,

    // ========================================================================
    // VALUES
    // ========================================================================
    pub display_name: String,
    pub attributes: Attributes,

    /// None only for legacy rows imported before the workflow existed
    pub workflow_state: Option<WorkflowState>,

    // ========================================================================
    // WORKFLOW AUDIT
    // ========================================================================
    pub approved: StageStamp,
    pub rejected: StageStamp,
    pub rejection_reason: Option<String>,
    pub printed: StageStamp,
    pub scanned: StageStamp,
    pub completed: StageStamp,

    // ========================================================================
    // RECORD AUDIT
    // ========================================================================
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
    pub is_deleted: bool,

    /// Optimistic-concurrency guard, +1 on every successful mutation
    pub version: i64,
}

impl Registration {
    /// Legacy rows with no stored state behave as PENDING
    pub fn state(&self) -> WorkflowState {
        self.workflow_state.unwrap_or_else(WorkflowState::initial)
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}
