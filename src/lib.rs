// Sangha Registry - Core Library
// Registration-number allocation, approval workflow and reference checks
// shared by every registerable record type. Used by the CLI and by tests.

pub mod allocator; // Identifier Allocator
pub mod config;
pub mod db;
pub mod engine; // Workflow Engine
pub mod entities;
pub mod error;
pub mod references; // Reference Validator
pub mod registry; // Service layer
pub mod sequence; // Sequence Inspector
pub mod store;
pub mod workflow; // Pure state machine

// Re-export commonly used types
pub use allocator::{AllocationStore, Allocator, CodeFormat, InsertOutcome, RetryPolicy};
pub use config::{AllocationStrategy, AllocatorConfig, BackoffKind, ConfigError, DatabaseConfig, RegistryConfig};
pub use db::{
    get_events_for_entity, import_legacy, insert_event, load_legacy_csv, seed_reference,
    setup_database, Event, ImportSummary, LegacyRecord, ReferenceTable,
};
pub use engine::{
    CasOutcome, StateChange, TransitionOutcome, TransitionRecord, TransitionRequest, WorkflowEngine,
    WorkflowStore,
};
pub use entities::{Attributes, EntityKind, EntityRef, NewRegistration, Registration, StageStamp};
pub use error::RegistryError;
pub use references::{ReferenceDescriptor, ReferenceRule, ReferenceTarget, ReferenceValidator};
pub use registry::Registry;
pub use sequence::SequenceStatus;
pub use store::SqliteStore;
pub use workflow::{transition, TransitionDenied, WorkflowEvent, WorkflowProfile, WorkflowState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
