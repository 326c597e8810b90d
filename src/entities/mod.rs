// Entity Models
//
// Every Registerable Entity shares one record shape (registration.rs);
// what differs per kind (table, code format, workflow profile, references)
// is described in kind.rs.

pub mod kind;
pub mod registration;

pub use kind::{EntityKind, UnknownKind};
pub use registration::{Attributes, EntityRef, NewRegistration, Registration, StageStamp};
