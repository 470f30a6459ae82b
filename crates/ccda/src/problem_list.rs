//! Problem List section wire models and translation into the intermediate schema.
//!
//! Responsibilities:
//! - Define the wire structs for the converted "Problem List" section
//! - Decode JSON with `serde_path_to_error` so failures name the offending path
//! - Normalise singular-vs-list fields and apply the "last status entry wins" rule
//! - Enforce which coded values must be complete and which may be partial
//!
//! Notes:
//! - The primary `value` of a problem observation may be partial or absent (many documents only
//!   carry translations); it then translates to `None`
//! - Translation codes and status codes must carry all four code attributes

use crate::{CcdaError, CcdaResult, OneOrMany};
use serde::Deserialize;

// ============================================================================
// Public domain-level types
// ============================================================================

/// A complete coded value: the four attributes of an HL7 CD element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodedValue {
    pub code: String,
    pub code_system: String,
    pub code_system_name: String,
    pub display: String,
}

/// Raw low/high bounds of an `effectiveTime` element; either bound may be absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EffectiveTimeRange {
    pub low: Option<String>,
    pub high: Option<String>,
}

/// The status observation nested under a problem observation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusObservation {
    pub status_code: String,
    pub code: Option<CodedValue>,
    pub value: Option<CodedValue>,
}

/// One problem observation, with every sometimes-singular field already normalised.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProblemObservation {
    /// Primary diagnosis value; `None` when absent or incomplete.
    pub value: Option<CodedValue>,
    /// Alternate codings attached to the primary value, in document order.
    pub translations: Vec<CodedValue>,
    /// Raw `author.time._value`; required downstream, so its absence is preserved here.
    pub author_time: Option<String>,
    /// Raw `effectiveTime`; `None` when the element is absent.
    pub effective_time: Option<EffectiveTimeRange>,
    /// Last listed status observation; `None` when `entryRelationship` is absent or empty.
    pub status: Option<StatusObservation>,
}

/// A decoded "Problem List" section.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProblemSection {
    /// `section.code._displayName`, if present.
    pub title: Option<String>,
    /// Problem observations of every entry, in document order.
    pub observations: Vec<ProblemObservation>,
}

// ============================================================================
// Public ProblemList operations
// ============================================================================

/// Problem list decoding operations.
///
/// This is a zero-sized type used for namespacing. All methods are associated functions.
pub struct ProblemList;

impl ProblemList {
    /// Decode a problem list from an already-parsed JSON value.
    ///
    /// The value is the `problem_list` object of an ingestion request, i.e. the object holding
    /// `section`.
    ///
    /// # Errors
    ///
    /// Returns [`CcdaError::Translation`] if a known key has an unexpected type, and
    /// [`CcdaError::MissingField`] if a key required to reach or complete an observation is absent.
    pub fn parse(value: &serde_json::Value) -> CcdaResult<ProblemSection> {
        let wire = match serde_path_to_error::deserialize::<_, ProblemListWire>(value) {
            Ok(parsed) => parsed,
            Err(err) => return Err(schema_mismatch(err)),
        };
        wire_to_domain(wire)
    }
}

fn schema_mismatch(err: serde_path_to_error::Error<serde_json::Error>) -> CcdaError {
    let path = err.path().to_string();
    let source = err.into_inner();
    let path = if path.is_empty() || path == "." {
        "<root>"
    } else {
        path.as_str()
    };
    CcdaError::Translation(format!("Problem list schema mismatch at {path}: {source}"))
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Debug, Deserialize)]
struct ProblemListWire {
    section: SectionWire,
}

#[derive(Debug, Deserialize)]
struct SectionWire {
    #[serde(default)]
    code: Option<SectionCodeWire>,
    #[serde(default)]
    entry: Option<OneOrMany<EntryWire>>,
}

#[derive(Debug, Deserialize)]
struct SectionCodeWire {
    #[serde(rename = "_displayName", default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EntryWire {
    #[serde(default)]
    act: Option<ActWire>,
}

#[derive(Debug, Deserialize)]
struct ActWire {
    #[serde(rename = "_", default)]
    body: Option<ActBodyWire>,
}

#[derive(Debug, Deserialize)]
struct ActBodyWire {
    #[serde(rename = "entryRelationship", default)]
    entry_relationship: Option<OneOrMany<RelationshipWire<ProblemObservationWire>>>,
}

/// `entryRelationship` → `_` → `observation` → `_` → body.
#[derive(Debug, Deserialize)]
struct RelationshipWire<B> {
    #[serde(rename = "_", default = "Option::default")]
    body: Option<RelationshipBodyWire<B>>,
}

#[derive(Debug, Deserialize)]
struct RelationshipBodyWire<B> {
    #[serde(default = "Option::default")]
    observation: Option<ObservationWire<B>>,
}

#[derive(Debug, Deserialize)]
struct ObservationWire<B> {
    #[serde(rename = "_", default = "Option::default")]
    body: Option<B>,
}

#[derive(Debug, Deserialize)]
struct ProblemObservationWire {
    #[serde(default)]
    value: Option<ValueWire>,
    #[serde(default)]
    author: Option<AuthorWire>,
    #[serde(rename = "effectiveTime", default)]
    effective_time: Option<EffectiveTimeWire>,
    #[serde(rename = "entryRelationship", default)]
    entry_relationship: Option<OneOrMany<RelationshipWire<StatusObservationWire>>>,
}

#[derive(Debug, Default, Deserialize)]
struct CodeWire {
    #[serde(rename = "_code", default)]
    code: Option<String>,
    #[serde(rename = "_codeSystem", default)]
    code_system: Option<String>,
    #[serde(rename = "_codeSystemName", default)]
    code_system_name: Option<String>,
    #[serde(rename = "_displayName", default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValueWire {
    #[serde(flatten)]
    code: CodeWire,
    #[serde(rename = "_", default)]
    body: Option<ValueBodyWire>,
}

#[derive(Debug, Deserialize)]
struct ValueBodyWire {
    #[serde(default)]
    translation: Option<OneOrMany<CodeWire>>,
}

#[derive(Debug, Deserialize)]
struct AuthorWire {
    #[serde(default)]
    time: Option<TimeWire>,
}

#[derive(Debug, Deserialize)]
struct TimeWire {
    #[serde(rename = "_value", default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EffectiveTimeWire {
    #[serde(default)]
    low: Option<TimeWire>,
    #[serde(default)]
    high: Option<TimeWire>,
}

#[derive(Debug, Deserialize)]
struct StatusObservationWire {
    #[serde(rename = "statusCode", default)]
    status_code: Option<StatusCodeWire>,
    #[serde(default)]
    code: Option<CodeWire>,
    #[serde(default)]
    value: Option<CodeWire>,
}

#[derive(Debug, Deserialize)]
struct StatusCodeWire {
    #[serde(rename = "_code", default)]
    code: Option<String>,
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn wire_to_domain(wire: ProblemListWire) -> CcdaResult<ProblemSection> {
    let title = wire.section.code.and_then(|c| c.display_name);

    let entries = wire
        .section
        .entry
        .map(OneOrMany::into_vec)
        .unwrap_or_default();

    let mut observations = Vec::new();
    for (entry_idx, entry) in entries.into_iter().enumerate() {
        let entry_path = format!("section.entry[{entry_idx}]");
        let act = entry
            .act
            .ok_or_else(|| CcdaError::MissingField(format!("{entry_path}.act")))?;
        let relationships = act
            .body
            .and_then(|b| b.entry_relationship)
            .ok_or_else(|| {
                CcdaError::MissingField(format!("{entry_path}.act._.entryRelationship"))
            })?;

        for (rel_idx, relationship) in relationships.into_vec().into_iter().enumerate() {
            let path = format!("{entry_path}.act._.entryRelationship[{rel_idx}]");
            let body = relationship_body(relationship, &path)?;
            observations.push(observation_to_domain(body, &path)?);
        }
    }

    Ok(ProblemSection {
        title,
        observations,
    })
}

fn relationship_body<B>(relationship: RelationshipWire<B>, path: &str) -> CcdaResult<B> {
    relationship
        .body
        .and_then(|b| b.observation)
        .and_then(|o| o.body)
        .ok_or_else(|| CcdaError::MissingField(format!("{path}._.observation._")))
}

fn observation_to_domain(
    wire: ProblemObservationWire,
    path: &str,
) -> CcdaResult<ProblemObservation> {
    let (value, translations) = match wire.value {
        Some(value) => {
            let translations = value
                .body
                .and_then(|b| b.translation)
                .map(OneOrMany::into_vec)
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(idx, t)| {
                    complete_code(t, &format!("{path}._.observation._.value._.translation[{idx}]"))
                })
                .collect::<CcdaResult<Vec<_>>>()?;
            (partial_code(value.code), translations)
        }
        None => (None, Vec::new()),
    };

    let author_time = wire.author.and_then(|a| a.time).and_then(|t| t.value);

    let effective_time = wire.effective_time.map(|et| EffectiveTimeRange {
        low: et.low.and_then(|t| t.value),
        high: et.high.and_then(|t| t.value),
    });

    // Documents occasionally list several status entries; only the last one counts.
    let status = match wire.entry_relationship.and_then(OneOrMany::into_last) {
        Some(relationship) => {
            let status_path = format!("{path}._.observation._.entryRelationship");
            let body = relationship_body(relationship, &status_path)?;
            Some(status_to_domain(body, &status_path)?)
        }
        None => None,
    };

    Ok(ProblemObservation {
        value,
        translations,
        author_time,
        effective_time,
        status,
    })
}

fn status_to_domain(wire: StatusObservationWire, path: &str) -> CcdaResult<StatusObservation> {
    let status_code = wire
        .status_code
        .and_then(|s| s.code)
        .ok_or_else(|| CcdaError::MissingField(format!("{path}._.observation._.statusCode._code")))?;

    let code = wire
        .code
        .map(|c| complete_code(c, &format!("{path}._.observation._.code")))
        .transpose()?;
    let value = wire
        .value
        .map(|v| complete_code(v, &format!("{path}._.observation._.value")))
        .transpose()?;

    Ok(StatusObservation {
        status_code,
        code,
        value,
    })
}

/// All four attributes present, otherwise `None`.
fn partial_code(wire: CodeWire) -> Option<CodedValue> {
    Some(CodedValue {
        code: wire.code?,
        code_system: wire.code_system?,
        code_system_name: wire.code_system_name?,
        display: wire.display_name?,
    })
}

/// All four attributes present, otherwise an error naming the first missing one.
fn complete_code(wire: CodeWire, path: &str) -> CcdaResult<CodedValue> {
    let missing = |attr: &str| CcdaError::MissingField(format!("{path}.{attr}"));
    Ok(CodedValue {
        code: wire.code.ok_or_else(|| missing("_code"))?,
        code_system: wire.code_system.ok_or_else(|| missing("_codeSystem"))?,
        code_system_name: wire
            .code_system_name
            .ok_or_else(|| missing("_codeSystemName"))?,
        display: wire.display_name.ok_or_else(|| missing("_displayName"))?,
    })
}
