//! Error taxonomy for allocation, workflow and reference checks.
//!
//! Every variant is a validation-style error the caller maps to a status
//! code with [`RegistryError::status_code`]. Driver failures are flattened
//! into [`RegistryError::Store`] so a raw `rusqlite::Error` never reaches
//! the caller.

use crate::entities::EntityKind;
use crate::workflow::{TransitionDenied, WorkflowEvent, WorkflowState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Retries exhausted without a unique code. No partial record is left.
    #[error("could not allocate a {kind} code with prefix '{prefix}' after {attempts} attempts")]
    AllocationExhausted {
        kind: EntityKind,
        prefix: String,
        attempts: u32,
    },

    /// The record is not in the single state the transition starts from.
    #[error("cannot {event}: current status is {actual}{}", expected_clause(.expected))]
    IllegalTransition {
        event: WorkflowEvent,
        expected: Option<WorkflowState>,
        actual: WorkflowState,
    },

    /// Checked before any state is read.
    #[error("{field} is required")]
    MissingRequiredField { field: &'static str },

    /// A natural-key reference does not exist or is soft-deleted.
    #[error("{field} refers to '{value}', which does not exist or has been deleted")]
    DanglingReference { field: String, value: String },

    /// The id sequence was resynced once and is still behind.
    #[error("id sequence for {table} is behind its rows even after a resync")]
    SequenceDesync { table: String },

    #[error("{kind} {reference} not found")]
    NotFound { kind: EntityKind, reference: String },

    /// Optimistic version guard failed on an update.
    #[error("{kind} {reference} was modified concurrently (expected version {expected}, found {actual})")]
    StaleVersion {
        kind: EntityKind,
        reference: String,
        expected: i64,
        actual: i64,
    },

    /// A reference descriptor points at a table/column that cannot be probed.
    #[error("invalid reference target {target}: {reason}")]
    InvalidReferenceTarget { target: String, reason: String },

    #[error("storage failure: {0}")]
    Store(String),
}

fn expected_clause(expected: &Option<WorkflowState>) -> String {
    match expected {
        Some(state) => format!(" (expected {})", state),
        None => " (not available for this record type)".to_string(),
    }
}

impl From<rusqlite::Error> for RegistryError {
    fn from(err: rusqlite::Error) -> Self {
        tracing::error!(error = %err, "database error");
        RegistryError::Store(err.to_string())
    }
}

impl From<TransitionDenied> for RegistryError {
    fn from(denied: TransitionDenied) -> Self {
        RegistryError::IllegalTransition {
            event: denied.event,
            expected: denied.expected,
            actual: denied.actual,
        }
    }
}

impl RegistryError {
    /// HTTP-style status the web layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            RegistryError::IllegalTransition { .. }
            | RegistryError::MissingRequiredField { .. }
            | RegistryError::DanglingReference { .. } => 400,
            RegistryError::NotFound { .. } => 404,
            RegistryError::StaleVersion { .. } => 409,
            RegistryError::AllocationExhausted { .. } => 503,
            RegistryError::SequenceDesync { .. }
            | RegistryError::InvalidReferenceTarget { .. }
            | RegistryError::Store(_) => 500,
        }
    }

    /// Message safe to show an end user.
    ///
    /// Allocation collisions stay internal; illegal transitions keep their
    /// detail so a UI can say "cannot approve: current status is X".
    pub fn user_message(&self) -> String {
        match self {
            RegistryError::AllocationExhausted { .. } => {
                "The registration number could not be assigned right now. Please retry.".to_string()
            }
            RegistryError::SequenceDesync { .. }
            | RegistryError::InvalidReferenceTarget { .. }
            | RegistryError::Store(_) => "An internal error occurred. Please retry later.".to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::AllocationExhausted { .. } | RegistryError::StaleVersion { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illegal_transition_names_both_states() {
        let err = RegistryError::IllegalTransition {
            event: WorkflowEvent::MarkPrinted,
            expected: Some(WorkflowState::Approved),
            actual: WorkflowState::Pending,
        };

        assert_eq!(
            err.user_message(),
            "cannot mark as printed: current status is PENDING (expected APPROVED)"
        );
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_allocation_message_is_generic() {
        let err = RegistryError::AllocationExhausted {
            kind: EntityKind::Arama,
            prefix: "ARN".to_string(),
            attempts: 10,
        };

        assert!(err.to_string().contains("ARN"));
        assert!(!err.user_message().contains("ARN"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_driver_errors_are_flattened() {
        let err: RegistryError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, RegistryError::Store(_)));
        assert_eq!(err.status_code(), 500);
    }
}
