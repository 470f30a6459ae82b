//! Problem-list fixtures shaped like the converter's output.

#![allow(dead_code)]

use cdr_core::{CdrService, CoreConfig, IngestRequest, LocalZone, MemoryStore, Mrn};
use chrono::FixedOffset;
use serde_json::{json, Value};
use std::sync::Arc;

pub const SNOMED: &str = "2.16.840.1.113883.6.96";
pub const ICD9: &str = "2.16.840.1.113883.6.103";
pub const ICD10: &str = "2.16.840.1.113883.6.90";
pub const ACTIVE: &str = "55561003";
pub const INACTIVE: &str = "73425007";

pub fn service() -> CdrService {
    let zone = LocalZone::Fixed(FixedOffset::west_opt(7 * 3600).expect("offset"));
    CdrService::new(
        Arc::new(CoreConfig::in_memory(zone)),
        Arc::new(MemoryStore::new()),
    )
}

pub fn mrn(raw: &str) -> Mrn {
    Mrn::new(raw).expect("valid mrn")
}

/// One problem: optional ICD-9/ICD-10 translations and an optional status value code.
#[derive(Clone, Debug)]
pub struct Problem {
    pub snomed: &'static str,
    pub icd9: Option<&'static str>,
    pub icd10: Option<&'static str>,
    pub status: Option<&'static str>,
}

impl Problem {
    pub fn new(snomed: &'static str) -> Self {
        Self {
            snomed,
            icd9: None,
            icd10: None,
            status: Some(ACTIVE),
        }
    }

    pub fn icd9(mut self, code: &'static str) -> Self {
        self.icd9 = Some(code);
        self
    }

    pub fn icd10(mut self, code: &'static str) -> Self {
        self.icd10 = Some(code);
        self
    }

    pub fn status(mut self, value: Option<&'static str>) -> Self {
        self.status = value;
        self
    }

    fn to_json(&self) -> Value {
        let mut translations = Vec::new();
        if let Some(code) = self.icd9 {
            translations.push(json!({
                "_code": code,
                "_codeSystem": ICD9,
                "_codeSystemName": "ICD-9-CM",
                "_displayName": format!("ICD-9 {code}")
            }));
        }
        if let Some(code) = self.icd10 {
            translations.push(json!({
                "_code": code,
                "_codeSystem": ICD10,
                "_codeSystemName": "ICD-10-CM",
                "_displayName": format!("ICD-10 {code}")
            }));
        }

        let mut observation = json!({
            "_classCode": "OBS",
            "_moodCode": "EVN",
            "_": {
                "templateId": {"_root": "2.16.840.1.113883.10.20.22.4.4"},
                "code": {"_code": "55607006", "_codeSystem": SNOMED, "_displayName": "Problem"},
                "statusCode": {"_code": "completed"},
                "author": {"time": {"_value": "20150302101500-0700"}},
                "effectiveTime": {"low": {"_value": "20140101"}, "high": {"_nullFlavor": "UNK"}},
                "value": {
                    "_xsi:type": "CD",
                    "_code": self.snomed,
                    "_codeSystem": SNOMED,
                    "_codeSystemName": "SNOMED CT",
                    "_displayName": format!("Finding {}", self.snomed),
                    "_": {"translation": translations}
                }
            }
        });

        if let Some(value) = self.status {
            let display = if value == ACTIVE { "Active" } else { "Inactive" };
            observation["_"]["entryRelationship"] = json!({
                "_typeCode": "REFR",
                "_": {"observation": {"_classCode": "OBS", "_": {
                    "statusCode": {"_code": "completed"},
                    "code": {
                        "_code": "33999-4",
                        "_codeSystem": "2.16.840.1.113883.6.1",
                        "_codeSystemName": "LOINC",
                        "_displayName": "Status"
                    },
                    "value": {
                        "_code": value,
                        "_codeSystem": SNOMED,
                        "_codeSystemName": "SNOMED CT",
                        "_displayName": display
                    }
                }}}
            });
        }

        json!({
            "act": {"_classCode": "ACT", "_": {
                "entryRelationship": {"_typeCode": "SUBJ", "_": {"observation": observation}}
            }}
        })
    }
}

pub fn problem_list(problems: &[Problem]) -> Value {
    let entries: Vec<Value> = problems.iter().map(Problem::to_json).collect();
    json!({
        "section": {
            "templateId": {"_root": "2.16.840.1.113883.10.20.22.2.5.1"},
            "code": {"_code": "11450-4", "_codeSystem": "2.16.840.1.113883.6.1", "_displayName": "Problem List"},
            "title": "Problems",
            "entry": entries
        }
    })
}

pub fn request(generated: &str, problems: Option<&[Problem]>) -> IngestRequest {
    serde_json::from_value(json!({
        "filepath": format!("/archive/{generated}.xml"),
        "effectiveTime": generated,
        "problem_list": problems.map(problem_list)
    }))
    .expect("request fixture")
}
