//! Code/status canonicalisation.
//!
//! Documents re-transmit the same codes constantly, so every code and status is resolved to the
//! single stored row for its natural key. Lookup-or-insert relies on the store's unique index:
//! when a concurrent caller wins the insert race, the loser re-reads the winner's row.

use crate::model::{Code, CodeKey, Status, StatusKey};
use crate::store::ClinicalStore;
use crate::{CdrError, CdrResult};

/// Lookup-or-create over a [`ClinicalStore`].
#[derive(Clone, Copy)]
pub struct Canonicalizer<'a> {
    store: &'a dyn ClinicalStore,
}

impl<'a> Canonicalizer<'a> {
    pub fn new(store: &'a dyn ClinicalStore) -> Self {
        Self { store }
    }

    /// Resolve `candidate` to its canonical code row, creating it on first sight.
    ///
    /// The first-seen display text is kept; later candidates differing only in display return
    /// the existing row unchanged.
    pub fn code(&self, candidate: &ccda::CodedValue) -> CdrResult<Code> {
        let key = CodeKey::from(candidate);
        if let Some(existing) = self.store.find_code(&key)? {
            return Ok(existing);
        }
        match self.store.insert_code(candidate) {
            Ok(created) => Ok(created),
            Err(CdrError::UniqueViolation(detail)) => {
                tracing::debug!("code insert lost a race ({detail}); re-reading");
                self.store.find_code(&key)?.ok_or_else(|| {
                    CdrError::DanglingReference(format!(
                        "code {}/{} vanished after a unique violation",
                        key.code_system, key.code
                    ))
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve a parsed status observation to its canonical status row.
    ///
    /// Nested codes are canonicalised first; absent codes stay absent in the key, so they only
    /// match statuses without that reference.
    pub fn status(&self, candidate: &ccda::StatusObservation) -> CdrResult<Status> {
        let code = candidate
            .code
            .as_ref()
            .map(|c| self.code(c))
            .transpose()?
            .map(|c| c.id);
        let value = candidate
            .value
            .as_ref()
            .map(|v| self.code(v))
            .transpose()?
            .map(|v| v.id);

        self.status_for_key(&StatusKey {
            status_code: candidate.status_code.clone(),
            code,
            value,
        })
    }

    fn status_for_key(&self, key: &StatusKey) -> CdrResult<Status> {
        if let Some(existing) = self.store.find_status(key)? {
            return Ok(existing);
        }
        match self.store.insert_status(key) {
            Ok(created) => Ok(created),
            Err(CdrError::UniqueViolation(detail)) => {
                tracing::debug!("status insert lost a race ({detail}); re-reading");
                self.store.find_status(key)?.ok_or_else(|| {
                    CdrError::DanglingReference(format!(
                        "status {:?} vanished after a unique violation",
                        key.status_code
                    ))
                })
            }
            Err(e) => Err(e),
        }
    }
}
