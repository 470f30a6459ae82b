//! Document merge arbiter.
//!
//! Each MRN holds at most one clinical document: the one with the newest generation time seen so
//! far. An incoming document is accepted only if it is strictly newer; accepted documents replace
//! the previous document's observations in the same store commit that writes the document row.

use crate::canonical::Canonicalizer;
use crate::config::LocalZone;
use crate::model::{ClinicalDocument, NewDocument};
use crate::problem_list::ProblemListParser;
use crate::store::ClinicalStore;
use crate::sync::{IngestGate, KeyedLocks};
use crate::time::{parse_datetime, parse_optional};
use crate::CdrResult;
use cdr_types::Mrn;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

/// Ingestion request body, as submitted by the upstream converter.
#[derive(Clone, Debug, Deserialize, ToSchema)]
pub struct IngestRequest {
    /// Location of the archived source artifact.
    pub filepath: String,
    /// Generation time of the source document.
    #[serde(rename = "effectiveTime", default)]
    pub effective_time: Option<String>,
    /// When the document entered the system; defaults to the ingestion time.
    #[serde(default)]
    pub receipt_time: Option<String>,
    #[serde(default)]
    pub lastvisit_time: Option<String>,
    /// The converted Problem List section (`{"section": {...}}`); `null` or `{}` when the
    /// document has none.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub problem_list: Option<serde_json::Value>,
}

/// An incoming document with its timestamps resolved.
#[derive(Clone, Debug)]
pub struct IncomingDocument {
    pub filepath: String,
    pub generation_time: Option<DateTime<Utc>>,
    pub receipt_time: DateTime<Utc>,
    pub lastvisit_time: Option<DateTime<Utc>>,
    pub problem_list: Option<serde_json::Value>,
}

impl IngestRequest {
    /// Resolve the request's timestamps in `zone`; a missing receipt time becomes `now`.
    pub fn resolve(self, zone: &LocalZone, now: DateTime<Utc>) -> CdrResult<IncomingDocument> {
        let generation_time = parse_optional(self.effective_time.as_deref(), zone)?;
        let receipt_time = match self.receipt_time.as_deref() {
            Some(value) => parse_datetime(value, zone)?,
            None => now,
        };
        let lastvisit_time = parse_optional(self.lastvisit_time.as_deref(), zone)?;

        Ok(IncomingDocument {
            filepath: self.filepath,
            generation_time,
            receipt_time,
            lastvisit_time,
            problem_list: self.problem_list,
        })
    }
}

/// Result of an ingestion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// The document is now the patient's current document.
    Accepted {
        observations: usize,
        replaced: usize,
    },
    /// A document at least as new is already stored; nothing changed.
    Obsolete,
}

/// Whether a document generated at `incoming` supersedes one generated at `stored`.
///
/// A stored document without a generation time is superseded by anything; an incoming document
/// without one never supersedes a dated document.
pub fn supersedes(stored: Option<DateTime<Utc>>, incoming: Option<DateTime<Utc>>) -> bool {
    match (stored, incoming) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(stored), Some(incoming)) => incoming > stored,
    }
}

/// Accept/reject decisions and atomic document replacement.
pub struct MergeArbiter {
    store: Arc<dyn ClinicalStore>,
    locks: KeyedLocks<Mrn>,
    gate: Arc<IngestGate>,
    zone: LocalZone,
}

impl MergeArbiter {
    pub fn new(store: Arc<dyn ClinicalStore>, gate: Arc<IngestGate>, zone: LocalZone) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            gate,
            zone,
        }
    }

    /// Ingest a raw request for `mrn`.
    pub fn ingest(&self, mrn: &Mrn, request: IngestRequest) -> CdrResult<IngestOutcome> {
        let incoming = request.resolve(&self.zone, Utc::now())?;
        self.ingest_document(mrn, incoming)
    }

    /// Ingest a document whose timestamps are already resolved.
    ///
    /// The decision and the write happen under the MRN's lock. Parsing happens before the commit,
    /// so a parse error leaves the stored document and observations untouched.
    ///
    /// # Errors
    ///
    /// Parser and store errors are returned unchanged. An obsolete document is not an error.
    pub fn ingest_document(
        &self,
        mrn: &Mrn,
        incoming: IncomingDocument,
    ) -> CdrResult<IngestOutcome> {
        self.locks.with_lock(mrn, || {
            let existing = self.store.document(mrn)?;
            if let Some(stored) = &existing {
                if !supersedes(stored.generation_time, incoming.generation_time) {
                    tracing::info!(
                        "document for {mrn} is obsolete (stored generation {:?}, incoming {:?})",
                        stored.generation_time,
                        incoming.generation_time
                    );
                    return Ok(IngestOutcome::Obsolete);
                }
            }
            self.accept(mrn, existing.as_ref(), incoming)
        })
    }

    fn accept(
        &self,
        mrn: &Mrn,
        existing: Option<&ClinicalDocument>,
        incoming: IncomingDocument,
    ) -> CdrResult<IngestOutcome> {
        let replace = existing.is_some();
        let _ingesting = self.gate.enter();

        let observations = match &incoming.problem_list {
            // an empty mapping carries no problem list, the same as null
            Some(serde_json::Value::Object(fields)) if fields.is_empty() => Vec::new(),
            Some(payload) => {
                let parser =
                    ProblemListParser::new(Canonicalizer::new(self.store.as_ref()), self.zone);
                parser.parse(payload)?
            }
            None => Vec::new(),
        };

        let summary = self.store.commit_document(
            NewDocument {
                mrn: mrn.clone(),
                filepath: incoming.filepath,
                receipt_time: incoming.receipt_time,
                generation_time: incoming.generation_time,
                lastvisit_time: incoming.lastvisit_time,
            },
            observations,
            replace,
        )?;

        if summary.replaced > 0 {
            tracing::info!(
                "replaced {} prior observations for {mrn}",
                summary.replaced
            );
        }
        tracing::info!(
            "accepted document for {mrn} with {} observations",
            summary.inserted
        );

        Ok(IngestOutcome::Accepted {
            observations: summary.inserted,
            replaced: summary.replaced,
        })
    }
}
