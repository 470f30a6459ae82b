//! JSON response payloads.
//!
//! Stored rows reference codes and statuses by id; views resolve those references so callers see
//! complete coded values.

use crate::model::{ClinicalDocument, Code, CodeId, Observation};
use crate::store::ClinicalStore;
use crate::{CdrError, CdrResult};
use cdr_types::Mrn;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CodeView {
    pub code: String,
    pub code_system: String,
    pub code_system_name: String,
    pub display: String,
}

impl From<Code> for CodeView {
    fn from(code: Code) -> Self {
        Self {
            code: code.code,
            code_system: code.code_system,
            code_system_name: code.code_system_name,
            display: code.display,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct StatusView {
    pub status_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<CodeView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<CodeView>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ObservationView {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<CodeView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icd9: Option<CodeView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icd10: Option<CodeView>,
    pub entry_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onset_date: Option<DateTime<Utc>>,
    pub status: StatusView,
}

/// Metadata of a patient's current document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FileInfoView {
    #[schema(value_type = String)]
    pub mrn: Mrn,
    pub filepath: String,
    pub receipt_time: DateTime<Utc>,
    pub generation_time: Option<DateTime<Utc>>,
    pub lastvisit_time: Option<DateTime<Utc>>,
}

impl From<&ClinicalDocument> for FileInfoView {
    fn from(document: &ClinicalDocument) -> Self {
        Self {
            mrn: document.mrn.clone(),
            filepath: document.filepath.clone(),
            receipt_time: document.receipt_time,
            generation_time: document.generation_time,
            lastvisit_time: document.lastvisit_time,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProblemListView {
    #[schema(value_type = String)]
    pub mrn: Mrn,
    pub receipt_time: DateTime<Utc>,
    pub generation_time: Option<DateTime<Utc>>,
    pub lastvisit_time: Option<DateTime<Utc>>,
    pub problem_list: Vec<ObservationView>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CodesView {
    pub codes: Vec<CodeView>,
}

/// Patients with at least one observation matching a diagnosis code pattern.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DiagnosisPatientsView {
    pub system: String,
    pub code: String,
    #[schema(value_type = Vec<String>)]
    pub patients: Vec<Mrn>,
}

/// Resolves id references into views, reading each code at most once.
pub(crate) struct ViewResolver<'a> {
    store: &'a dyn ClinicalStore,
    codes: HashMap<CodeId, CodeView>,
}

impl<'a> ViewResolver<'a> {
    pub(crate) fn new(store: &'a dyn ClinicalStore) -> Self {
        Self {
            store,
            codes: HashMap::new(),
        }
    }

    pub(crate) fn code(&mut self, id: CodeId) -> CdrResult<CodeView> {
        if let Some(view) = self.codes.get(&id) {
            return Ok(view.clone());
        }
        let code = self
            .store
            .code(id)?
            .ok_or_else(|| CdrError::DanglingReference(format!("code {id}")))?;
        let view = CodeView::from(code);
        self.codes.insert(id, view.clone());
        Ok(view)
    }

    fn optional_code(&mut self, id: Option<CodeId>) -> CdrResult<Option<CodeView>> {
        id.map(|id| self.code(id)).transpose()
    }

    pub(crate) fn observation(&mut self, observation: &Observation) -> CdrResult<ObservationView> {
        let status = self
            .store
            .status(observation.status)?
            .ok_or_else(|| CdrError::DanglingReference(format!("status {}", observation.status)))?;

        Ok(ObservationView {
            code: self.optional_code(observation.code)?,
            icd9: self.optional_code(observation.icd9)?,
            icd10: self.optional_code(observation.icd10)?,
            entry_date: observation.entry_date,
            onset_date: observation.onset_date,
            status: StatusView {
                status_code: status.status_code,
                code: self.optional_code(status.code)?,
                value: self.optional_code(status.value)?,
            },
        })
    }
}
