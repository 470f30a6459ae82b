//! Persistence interface for clinical entities.
//!
//! The store owns uniqueness: inserting a code or status whose natural key already exists fails
//! with [`CdrError::UniqueViolation`](crate::CdrError::UniqueViolation) instead of creating a
//! second row. Deletions used by the garbage collector are conditional and re-check the orphan
//! condition at delete time.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::model::{
    ClinicalDocument, Code, CodeId, CodeKey, DocumentId, NewDocument, NewObservation, Observation,
    ObservationId, Status, StatusId, StatusKey,
};
use crate::CdrResult;
use cdr_types::Mrn;
use std::collections::HashSet;

/// Result of committing an accepted document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitSummary {
    pub document: ClinicalDocument,
    /// Observations inserted for the document.
    pub inserted: usize,
    /// Prior observations of the document deleted by the replacement.
    pub replaced: usize,
}

/// Row counts per table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub documents: usize,
    pub codes: usize,
    pub statuses: usize,
    pub observations: usize,
}

/// Synchronous persistence interface consumed by the core services.
pub trait ClinicalStore: Send + Sync {
    fn find_code(&self, key: &CodeKey) -> CdrResult<Option<Code>>;

    /// Insert a new canonical code; fails with `UniqueViolation` if the natural key exists.
    fn insert_code(&self, value: &ccda::CodedValue) -> CdrResult<Code>;

    fn code(&self, id: CodeId) -> CdrResult<Option<Code>>;

    fn find_status(&self, key: &StatusKey) -> CdrResult<Option<Status>>;

    /// Insert a new canonical status; fails with `UniqueViolation` if the natural key exists and
    /// with `DanglingReference` if a referenced code does not exist.
    fn insert_status(&self, key: &StatusKey) -> CdrResult<Status>;

    fn status(&self, id: StatusId) -> CdrResult<Option<Status>>;

    fn document(&self, mrn: &Mrn) -> CdrResult<Option<ClinicalDocument>>;

    fn documents(&self) -> CdrResult<Vec<ClinicalDocument>>;

    fn document_ids(&self) -> CdrResult<HashSet<DocumentId>>;

    /// Create or update the document for `document.mrn` and insert its observations as one unit.
    ///
    /// With `replace`, every observation previously owned by the document is deleted first. If
    /// any observation references a missing code or status nothing is written.
    fn commit_document(
        &self,
        document: NewDocument,
        observations: Vec<NewObservation>,
        replace: bool,
    ) -> CdrResult<CommitSummary>;

    /// Delete the document row only; its observations are left for garbage collection.
    fn remove_document(&self, mrn: &Mrn) -> CdrResult<Option<ClinicalDocument>>;

    fn observations_for(&self, document: DocumentId) -> CdrResult<Vec<Observation>>;

    /// Up to `limit` observations with ids greater than `after`, in id order.
    fn scan_observations(
        &self,
        after: Option<ObservationId>,
        limit: usize,
    ) -> CdrResult<Vec<Observation>>;

    /// Up to `limit` statuses with ids greater than `after`, in id order.
    fn scan_statuses(&self, after: Option<StatusId>, limit: usize) -> CdrResult<Vec<Status>>;

    /// Delete those observations whose owning document still does not exist; returns the count.
    fn delete_observations_if_orphaned(&self, ids: &[ObservationId]) -> CdrResult<usize>;

    /// Delete those statuses no observation references; returns the count.
    fn delete_statuses_if_unreferenced(&self, ids: &[StatusId]) -> CdrResult<usize>;

    fn counts(&self) -> CdrResult<StoreCounts>;

    /// Persist pending state, if the store is backed by durable storage.
    fn flush(&self) -> CdrResult<()>;
}
