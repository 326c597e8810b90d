// 🏛️ Entity Kinds - every record type that receives a registration number
//
// Each kind owns:
// - its table
// - its default code format (prefix + zero-padded number)
// - its workflow profile
// - the natural-key references it carries

use crate::allocator::CodeFormat;
use crate::references::{ReferenceDescriptor, ReferenceTarget};
use crate::workflow::WorkflowProfile;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Nuns' hermitage
    Arama,

    /// Temple
    Vihara,

    /// Monk
    Bhikku,

    /// Nun
    Silmatha,

    /// Monk identity card
    BhikkuIdCard,

    /// Ordination / registration certificate
    Certificate,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Arama,
        EntityKind::Vihara,
        EntityKind::Bhikku,
        EntityKind::Silmatha,
        EntityKind::BhikkuIdCard,
        EntityKind::Certificate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Arama => "arama",
            EntityKind::Vihara => "vihara",
            EntityKind::Bhikku => "bhikku",
            EntityKind::Silmatha => "silmatha",
            EntityKind::BhikkuIdCard => "bhikku_id_card",
            EntityKind::Certificate => "certificate",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Arama => "arama_registrations",
            EntityKind::Vihara => "vihara_registrations",
            EntityKind::Bhikku => "bhikku_registrations",
            EntityKind::Silmatha => "silmatha_registrations",
            EntityKind::BhikkuIdCard => "bhikku_id_cards",
            EntityKind::Certificate => "certificates",
        }
    }

    /// Built-in format; `[codes.<kind>]` in the config overrides it
    pub fn default_format(&self) -> CodeFormat {
        match self {
            EntityKind::Arama => CodeFormat::new("ARN", 7),
            EntityKind::Vihara => CodeFormat::new("TRN", 7),
            EntityKind::Bhikku => CodeFormat::new("BH", 6),
            EntityKind::Silmatha => CodeFormat::new("SIL", 6),
            EntityKind::BhikkuIdCard => CodeFormat::new("BIC", 7),
            EntityKind::Certificate => CodeFormat::new("CRT", 7),
        }
    }

    pub fn profile(&self) -> WorkflowProfile {
        match self {
            EntityKind::Arama | EntityKind::Vihara | EntityKind::Bhikku | EntityKind::Silmatha => {
                WorkflowProfile::PrintFirst
            }
            EntityKind::BhikkuIdCard | EntityKind::Certificate => WorkflowProfile::ApprovalFirst,
        }
    }

    /// Natural-key references checked before a record is inserted or updated
    pub fn references(&self) -> Vec<ReferenceDescriptor> {
        let division = || {
            ReferenceDescriptor::single(
                "division_code",
                ReferenceTarget::new("divisional_secretariats", "ds_code"),
            )
        };
        let status = || {
            ReferenceDescriptor::single("status_code", ReferenceTarget::new("status_codes", "st_code"))
        };
        let bhikku = |field: &str| {
            ReferenceDescriptor::single(field, ReferenceTarget::new(EntityKind::Bhikku.table(), "code"))
        };

        match self {
            EntityKind::Arama => vec![division()],
            EntityKind::Vihara => vec![
                division(),
                ReferenceDescriptor::single("nikaya_code", ReferenceTarget::new("nikayas", "nk_code")),
                bhikku("viharadhipathi"),
            ],
            EntityKind::Bhikku => vec![
                division(),
                status(),
                bhikku("viharadhipathi"),
                ReferenceDescriptor::single(
                    "residence_vihara",
                    ReferenceTarget::new(EntityKind::Vihara.table(), "code"),
                ),
                // Comma-separated registration numbers; list-aware callers
                // use ReferenceValidator::validate_delimited
                ReferenceDescriptor::excluded("senior_teachers", "comma-separated list of bhikku codes"),
            ],
            EntityKind::Silmatha => vec![
                status(),
                ReferenceDescriptor::single(
                    "arama_code",
                    ReferenceTarget::new(EntityKind::Arama.table(), "code"),
                ),
            ],
            EntityKind::BhikkuIdCard => vec![bhikku("bhikku_code")],
            EntityKind::Certificate => vec![
                bhikku("bhikku_code"),
                ReferenceDescriptor::single(
                    "issuing_vihara",
                    ReferenceTarget::new(EntityKind::Vihara.table(), "code"),
                ),
            ],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entity kind '{0}' (expected one of: {})", known_kinds())]
pub struct UnknownKind(pub String);

fn known_kinds() -> String {
    EntityKind::ALL.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
}

impl FromStr for EntityKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        EntityKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}
