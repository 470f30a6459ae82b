//! Persisted clinical entities.
//!
//! Codes and statuses are canonical rows shared by reference; observations belong to exactly one
//! clinical document; the document is the root of reachability.

use cdr_types::Mrn;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! surrogate_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

surrogate_id!(
    /// Surrogate key of a [`Code`] row.
    CodeId
);
surrogate_id!(
    /// Surrogate key of a [`Status`] row.
    StatusId
);
surrogate_id!(
    /// Surrogate key of a [`ClinicalDocument`] row. Never reused after removal.
    DocumentId
);
surrogate_id!(
    /// Surrogate key of an [`Observation`] row.
    ObservationId
);

/// Natural key of a code: display text is deliberately not part of it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CodeKey {
    pub code: String,
    pub code_system: String,
    pub code_system_name: String,
}

impl From<&ccda::CodedValue> for CodeKey {
    fn from(value: &ccda::CodedValue) -> Self {
        Self {
            code: value.code.clone(),
            code_system: value.code_system.clone(),
            code_system_name: value.code_system_name.clone(),
        }
    }
}

/// A canonical coded value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Code {
    pub id: CodeId,
    pub code: String,
    pub code_system: String,
    pub code_system_name: String,
    pub display: String,
}

impl Code {
    pub fn key(&self) -> CodeKey {
        CodeKey {
            code: self.code.clone(),
            code_system: self.code_system.clone(),
            code_system_name: self.code_system_name.clone(),
        }
    }
}

/// Natural key of a status. An absent reference only matches another absent reference.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StatusKey {
    pub status_code: String,
    pub code: Option<CodeId>,
    pub value: Option<CodeId>,
}

/// A canonical status row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub id: StatusId,
    pub status_code: String,
    pub code: Option<CodeId>,
    pub value: Option<CodeId>,
}

impl Status {
    pub fn key(&self) -> StatusKey {
        StatusKey {
            status_code: self.status_code.clone(),
            code: self.code,
            value: self.value,
        }
    }
}

/// The single current document of a patient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalDocument {
    pub id: DocumentId,
    pub mrn: Mrn,
    pub filepath: String,
    pub receipt_time: DateTime<Utc>,
    pub generation_time: Option<DateTime<Utc>>,
    pub lastvisit_time: Option<DateTime<Utc>>,
}

/// Document attributes written by an accepted ingestion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewDocument {
    pub mrn: Mrn,
    pub filepath: String,
    pub receipt_time: DateTime<Utc>,
    pub generation_time: Option<DateTime<Utc>>,
    pub lastvisit_time: Option<DateTime<Utc>>,
}

/// A stored problem observation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub id: ObservationId,
    pub document: DocumentId,
    pub code: Option<CodeId>,
    pub icd9: Option<CodeId>,
    pub icd10: Option<CodeId>,
    pub entry_date: DateTime<Utc>,
    pub onset_date: Option<DateTime<Utc>>,
    pub status: StatusId,
}

/// Parser output: an observation whose owning document is assigned at commit time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewObservation {
    pub code: Option<CodeId>,
    pub icd9: Option<CodeId>,
    pub icd10: Option<CodeId>,
    pub entry_date: DateTime<Utc>,
    pub onset_date: Option<DateTime<Utc>>,
    pub status: StatusId,
}
