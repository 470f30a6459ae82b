//! Problem-list query filter.
//!
//! Wire shape:
//!
//! ```json
//! {
//!   "filter": {"icd9": {"code": ["296.2*", "300.4"]}, "icd10": {"code": ["E78.*"]}},
//!   "status": {"value": {"code": "55561003"}, "status_code": "completed"}
//! }
//! ```
//!
//! Patterns ending in `*` match by prefix, anything else must match exactly. Any single pattern
//! in `filter` is enough (OR); every condition in `status` must hold (AND).

use crate::views::{CodeView, ObservationView};
use crate::{CdrError, CdrResult};
use ccda::OneOrMany;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;

/// A code-matching pattern: exact, or prefix when it ends in `*`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern(String);

impl Pattern {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn matches(&self, candidate: &str) -> bool {
        match self.0.strip_suffix('*') {
            Some(prefix) => candidate.starts_with(prefix),
            None => candidate == self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Code slot of an observation that a filter clause can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObservationField {
    Code,
    Icd9,
    Icd10,
}

impl FromStr for ObservationField {
    type Err = CdrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(Self::Code),
            "icd9" => Ok(Self::Icd9),
            "icd10" => Ok(Self::Icd10),
            other => Err(CdrError::InvalidInput(format!(
                "unknown filter field {other:?} (expected code, icd9 or icd10)"
            ))),
        }
    }
}

/// Code slot of a status that a status condition can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusField {
    Code,
    Value,
}

/// Attribute of a coded value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subfield {
    Code,
    CodeSystem,
    CodeSystemName,
    Display,
}

impl Subfield {
    fn select(self, code: &CodeView) -> &str {
        match self {
            Subfield::Code => &code.code,
            Subfield::CodeSystem => &code.code_system,
            Subfield::CodeSystemName => &code.code_system_name,
            Subfield::Display => &code.display,
        }
    }
}

impl FromStr for Subfield {
    type Err = CdrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(Self::Code),
            "code_system" => Ok(Self::CodeSystem),
            "code_system_name" => Ok(Self::CodeSystemName),
            "display" => Ok(Self::Display),
            other => Err(CdrError::InvalidInput(format!(
                "unknown filter subfield {other:?}"
            ))),
        }
    }
}

/// One `filter` clause: a code slot attribute and the patterns it may match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldPatterns {
    pub field: ObservationField,
    pub subfield: Subfield,
    pub patterns: Vec<Pattern>,
}

/// One `status` condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusCondition {
    StatusCode(String),
    Coded {
        field: StatusField,
        subfield: Subfield,
        expected: String,
    },
}

/// Decoded problem-list filter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawFilter")]
pub struct ProblemFilter {
    any_of: Vec<FieldPatterns>,
    status: Vec<StatusCondition>,
}

impl ProblemFilter {
    /// Decode a filter from its JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`CdrError::InvalidInput`] for malformed JSON and unknown field names.
    pub fn from_json_str(text: &str) -> CdrResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| CdrError::InvalidInput(format!("invalid problem list filter: {e}")))
    }

    pub fn matches(&self, observation: &ObservationView) -> bool {
        self.matches_codes(observation) && self.matches_status(observation)
    }

    fn matches_codes(&self, observation: &ObservationView) -> bool {
        if self.any_of.is_empty() {
            return true;
        }
        self.any_of.iter().any(|clause| {
            let slot = match clause.field {
                ObservationField::Code => observation.code.as_ref(),
                ObservationField::Icd9 => observation.icd9.as_ref(),
                ObservationField::Icd10 => observation.icd10.as_ref(),
            };
            slot.is_some_and(|code| {
                let candidate = clause.subfield.select(code);
                clause.patterns.iter().any(|p| p.matches(candidate))
            })
        })
    }

    fn matches_status(&self, observation: &ObservationView) -> bool {
        let status = &observation.status;
        self.status.iter().all(|condition| match condition {
            StatusCondition::StatusCode(expected) => status.status_code == *expected,
            StatusCondition::Coded {
                field,
                subfield,
                expected,
            } => {
                let slot = match field {
                    StatusField::Code => status.code.as_ref(),
                    StatusField::Value => status.value.as_ref(),
                };
                slot.is_some_and(|code| subfield.select(code) == expected.as_str())
            }
        })
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFilter {
    #[serde(default)]
    filter: BTreeMap<String, BTreeMap<String, OneOrMany<String>>>,
    #[serde(default)]
    status: BTreeMap<String, RawStatusCondition>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStatusCondition {
    Scalar(String),
    Coded(BTreeMap<String, String>),
}

impl TryFrom<RawFilter> for ProblemFilter {
    type Error = CdrError;

    fn try_from(raw: RawFilter) -> Result<Self, Self::Error> {
        let mut any_of = Vec::new();
        for (field, subfields) in raw.filter {
            let field: ObservationField = field.parse()?;
            for (subfield, patterns) in subfields {
                any_of.push(FieldPatterns {
                    field,
                    subfield: subfield.parse()?,
                    patterns: patterns.into_vec().into_iter().map(Pattern::new).collect(),
                });
            }
        }

        let mut status = Vec::new();
        for (field, condition) in raw.status {
            match (field.as_str(), condition) {
                ("status_code", RawStatusCondition::Scalar(expected)) => {
                    status.push(StatusCondition::StatusCode(expected));
                }
                ("code" | "value", RawStatusCondition::Coded(pairs)) => {
                    let field = if field == "code" {
                        StatusField::Code
                    } else {
                        StatusField::Value
                    };
                    for (subfield, expected) in pairs {
                        status.push(StatusCondition::Coded {
                            field,
                            subfield: subfield.parse()?,
                            expected,
                        });
                    }
                }
                (other, _) => {
                    return Err(CdrError::InvalidInput(format!(
                        "unknown or malformed status filter field {other:?}"
                    )))
                }
            }
        }

        Ok(Self { any_of, status })
    }
}
