//! Problem-list parser.
//!
//! Turns a decoded Problem List section into [`NewObservation`] rows: codes and statuses are
//! canonicalised, dates are resolved to UTC, and ICD-9/ICD-10 translations are sorted into their
//! dedicated slots. Observations without a status ("no active problems" placeholders) are dropped.

use crate::canonical::Canonicalizer;
use crate::config::LocalZone;
use crate::constants::{ICD10_SYSTEM_PREFIX, ICD9_SYSTEM_PREFIX, PROBLEM_LIST_TITLE};
use crate::model::{CodeId, NewObservation};
use crate::time::{parse_datetime, resolve_effective_time};
use crate::{CdrError, CdrResult};
use ccda::{ProblemList, ProblemObservation, ProblemSection};

/// Parser bound to a store (through its canonicaliser) and a local zone.
pub struct ProblemListParser<'a> {
    canon: Canonicalizer<'a>,
    zone: LocalZone,
}

impl<'a> ProblemListParser<'a> {
    pub fn new(canon: Canonicalizer<'a>, zone: LocalZone) -> Self {
        Self { canon, zone }
    }

    /// Decode and parse the `problem_list` payload of an ingestion request.
    ///
    /// # Errors
    ///
    /// - [`CdrError::Ccda`] if the payload does not decode
    /// - [`CdrError::SchemaMismatch`] if the section title is not "Problem List" or an entry has
    ///   no author time
    /// - [`CdrError::DuplicateTranslation`] if an entry carries two codes of one ICD system
    /// - timestamp errors from [`parse_datetime`]
    pub fn parse(&self, payload: &serde_json::Value) -> CdrResult<Vec<NewObservation>> {
        let section = ProblemList::parse(payload)?;
        self.parse_section(section)
    }

    /// Parse an already-decoded section.
    pub fn parse_section(&self, section: ProblemSection) -> CdrResult<Vec<NewObservation>> {
        if section.title.as_deref() != Some(PROBLEM_LIST_TITLE) {
            return Err(CdrError::SchemaMismatch(format!(
                "expected section titled {PROBLEM_LIST_TITLE:?}, found {:?}",
                section.title
            )));
        }

        let mut parsed = Vec::with_capacity(section.observations.len());
        for (index, observation) in section.observations.into_iter().enumerate() {
            match self.parse_observation(observation)? {
                Some(observation) => parsed.push(observation),
                None => tracing::debug!("dropping problem observation {index}: no status entry"),
            }
        }
        Ok(parsed)
    }

    /// Parse one observation; `Ok(None)` when it carries no status.
    pub fn parse_observation(
        &self,
        observation: ProblemObservation,
    ) -> CdrResult<Option<NewObservation>> {
        let code = observation
            .value
            .as_ref()
            .map(|value| self.canon.code(value))
            .transpose()?
            .map(|code| code.id);

        let onset_date = resolve_effective_time(observation.effective_time.as_ref(), &self.zone)?;

        let entry_date = match observation.author_time.as_deref() {
            Some(value) => parse_datetime(value, &self.zone)?,
            None => {
                return Err(CdrError::SchemaMismatch(
                    "problem observation has no author.time".into(),
                ))
            }
        };

        let mut icd9: Option<CodeId> = None;
        let mut icd10: Option<CodeId> = None;
        for translation in &observation.translations {
            let canonical = self.canon.code(translation)?;
            let slot = if canonical.code_system_name.starts_with(ICD9_SYSTEM_PREFIX) {
                Some((&mut icd9, ICD9_SYSTEM_PREFIX))
            } else if canonical.code_system_name.starts_with(ICD10_SYSTEM_PREFIX) {
                Some((&mut icd10, ICD10_SYSTEM_PREFIX))
            } else {
                None
            };
            if let Some((slot, system)) = slot {
                if slot.replace(canonical.id).is_some() {
                    return Err(CdrError::DuplicateTranslation(system));
                }
            }
        }

        let Some(status) = observation.status.as_ref() else {
            return Ok(None);
        };
        let status = self.canon.status(status)?;

        Ok(Some(NewObservation {
            code,
            icd9,
            icd10,
            entry_date,
            onset_date,
            status: status.id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ClinicalStore, MemoryStore};
    use chrono::FixedOffset;
    use serde_json::json;

    fn zone() -> LocalZone {
        LocalZone::Fixed(FixedOffset::west_opt(7 * 3600).expect("offset"))
    }

    fn code_json(code: &str, system: &str, name: &str, display: &str) -> serde_json::Value {
        json!({
            "_code": code,
            "_codeSystem": system,
            "_codeSystemName": name,
            "_displayName": display
        })
    }

    fn observation_json(translations: serde_json::Value, with_status: bool) -> serde_json::Value {
        let mut body = json!({
            "author": {"time": {"_value": "20031112130139"}},
            "effectiveTime": {"low": {"_value": "20031111"}},
            "value": {
                "_code": "66344007",
                "_codeSystem": "2.16.840.1.113883.6.96",
                "_codeSystemName": "SNOMED CT",
                "_displayName": "Recurrent major depression",
                "_": {"translation": translations}
            }
        });
        if with_status {
            body["entryRelationship"] = json!({
                "_": {"observation": {"_": {
                    "statusCode": {"_code": "completed"},
                    "code": code_json("33999-4", "2.16.840.1.113883.6.1", "LOINC", "Status"),
                    "value": code_json("55561003", "2.16.840.1.113883.6.96", "SNOMED CT", "Active")
                }}}
            });
        }
        body
    }

    fn payload(title: &str, observations: Vec<serde_json::Value>) -> serde_json::Value {
        let entries: Vec<_> = observations
            .into_iter()
            .map(|o| json!({"act": {"_": {"entryRelationship": {"_": {"observation": {"_": o}}}}}}))
            .collect();
        json!({"section": {"code": {"_displayName": title}, "entry": entries}})
    }

    fn icd9(code: &str) -> serde_json::Value {
        code_json(code, "2.16.840.1.113883.6.103", "ICD-9-CM", "icd9 display")
    }

    fn icd10(code: &str) -> serde_json::Value {
        code_json(code, "2.16.840.1.113883.6.90", "ICD-10-CM", "icd10 display")
    }

    #[test]
    fn sorts_translations_into_icd_slots() {
        let store = MemoryStore::new();
        let parser = ProblemListParser::new(Canonicalizer::new(&store), zone());
        let parsed = parser
            .parse(&payload(
                "Problem List",
                vec![observation_json(json!([icd10("F33.9"), icd9("296.30")]), true)],
            ))
            .expect("parse");

        assert_eq!(parsed.len(), 1);
        let observation = &parsed[0];
        let icd9 = store
            .code(observation.icd9.expect("icd9 slot"))
            .unwrap()
            .expect("icd9 row");
        let icd10 = store
            .code(observation.icd10.expect("icd10 slot"))
            .unwrap()
            .expect("icd10 row");
        assert_eq!(icd9.code, "296.30");
        assert_eq!(icd10.code, "F33.9");
        assert!(observation.code.is_some());
        assert_eq!(
            observation.entry_date.to_rfc3339(),
            "2003-11-12T20:01:39+00:00"
        );
        assert_eq!(
            observation.onset_date.map(|d| d.to_rfc3339()),
            Some("2003-11-11T07:00:00+00:00".to_string())
        );
    }

    #[test]
    fn drops_observations_without_status() {
        let store = MemoryStore::new();
        let parser = ProblemListParser::new(Canonicalizer::new(&store), zone());
        let parsed = parser
            .parse(&payload(
                "Problem List",
                vec![
                    observation_json(json!(icd9("311")), true),
                    observation_json(json!(icd9("300.4")), false),
                    observation_json(json!(icd9("296.21")), true),
                ],
            ))
            .expect("parse");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn rejects_other_sections() {
        let store = MemoryStore::new();
        let parser = ProblemListParser::new(Canonicalizer::new(&store), zone());
        let err = parser
            .parse(&payload("Medications", vec![]))
            .expect_err("wrong section");
        assert!(matches!(err, CdrError::SchemaMismatch(_)));
    }

    #[test]
    fn duplicate_icd_translation_is_fatal() {
        let store = MemoryStore::new();
        let parser = ProblemListParser::new(Canonicalizer::new(&store), zone());
        let err = parser
            .parse(&payload(
                "Problem List",
                vec![observation_json(json!([icd9("311"), icd9("296.30")]), true)],
            ))
            .expect_err("duplicate icd9");
        match err {
            CdrError::DuplicateTranslation(system) => assert_eq!(system, "ICD-9"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_author_time_is_schema_mismatch() {
        let store = MemoryStore::new();
        let parser = ProblemListParser::new(Canonicalizer::new(&store), zone());
        let mut observation = observation_json(json!([]), true);
        observation
            .as_object_mut()
            .expect("object")
            .remove("author");
        let err = parser
            .parse(&payload("Problem List", vec![observation]))
            .expect_err("no author");
        assert!(matches!(err, CdrError::SchemaMismatch(_)));
    }

    #[test]
    fn missing_effective_time_and_value_are_optional() {
        let store = MemoryStore::new();
        let parser = ProblemListParser::new(Canonicalizer::new(&store), zone());
        let mut observation = observation_json(json!(icd10("E78.5")), true);
        let body = observation.as_object_mut().expect("object");
        body.remove("effectiveTime");
        body.insert(
            "value".into(),
            json!({"_nullFlavor": "OTH", "_": {"translation": icd10("E78.5")}}),
        );

        let parsed = parser
            .parse(&payload("Problem List", vec![observation]))
            .expect("parse");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].code, None);
        assert_eq!(parsed[0].onset_date, None);
        assert!(parsed[0].icd10.is_some());
    }

    #[test]
    fn non_icd_translations_are_canonicalised_but_not_slotted() {
        let store = MemoryStore::new();
        let parser = ProblemListParser::new(Canonicalizer::new(&store), zone());
        let translation = code_json("R69", "2.16.840.1.113883.6.96", "SNOMED CT", "Illness");
        let parsed = parser
            .parse(&payload(
                "Problem List",
                vec![observation_json(json!([translation]), true)],
            ))
            .expect("parse");
        assert_eq!(parsed[0].icd9, None);
        assert_eq!(parsed[0].icd10, None);
        // primary value, translation, status code and status value
        assert_eq!(store.counts().unwrap().codes, 4);
    }
}
