//! Orphan garbage collector.
//!
//! Replacing a document deletes its observations, but statuses are shared and carry no reference
//! count, so replacements strand statuses (and a removed document strands its observations). The
//! collector reclaims both in bounded batches:
//!
//! 1. snapshot the ids of all current documents
//! 2. scan observations; those whose document is not in the snapshot are orphans, the statuses of
//!    the rest are reachable
//! 3. scan statuses; those not reachable are orphans
//!
//! Deletes are conditional in the store, so a record that became referenced after it was scanned
//! survives. Status deletes run under the exclusive side of the [`IngestGate`].

use crate::model::{DocumentId, StatusId};
use crate::progress::ProgressReporter;
use crate::store::ClinicalStore;
use crate::sync::IngestGate;
use crate::{CdrError, CdrResult};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// Options for one collection run.
#[derive(Clone, Copy, Debug)]
pub struct GcOptions {
    /// Count orphans without deleting anything.
    pub preview: bool,
    /// Rows examined per batch.
    pub batch_size: usize,
}

/// Counts produced by a collection run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub observations_purged: usize,
    pub statuses_purged: usize,
    pub preview: bool,
    /// The run was cancelled between batches; counts cover the completed batches only.
    pub interrupted: bool,
}

pub struct GarbageCollector<'a> {
    store: &'a dyn ClinicalStore,
    gate: &'a IngestGate,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> GarbageCollector<'a> {
    pub fn new(store: &'a dyn ClinicalStore, gate: &'a IngestGate) -> Self {
        Self {
            store,
            gate,
            cancel: None,
        }
    }

    /// Stop between batches once `flag` is set.
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Run one collection pass.
    ///
    /// # Errors
    ///
    /// Returns [`CdrError::InvalidInput`] for a zero batch size and propagates store errors.
    /// Batches deleted before an error stay deleted.
    pub fn collect(
        &self,
        options: GcOptions,
        progress: &mut ProgressReporter,
    ) -> CdrResult<GcReport> {
        if options.batch_size == 0 {
            return Err(CdrError::InvalidInput(
                "gc batch size must be greater than zero".into(),
            ));
        }

        let mut report = GcReport {
            preview: options.preview,
            ..GcReport::default()
        };

        let valid_documents = self.store.document_ids()?;
        let swept = self.sweep_observations(&valid_documents, options, progress, &mut report)?;
        let Some(reachable) = swept else {
            report.interrupted = true;
            return Ok(self.finish(report));
        };

        if !self.sweep_statuses(&reachable, options, progress, &mut report)? {
            report.interrupted = true;
        }
        Ok(self.finish(report))
    }

    /// Returns the reachable status ids, or `None` if cancelled.
    fn sweep_observations(
        &self,
        valid_documents: &HashSet<DocumentId>,
        options: GcOptions,
        progress: &mut ProgressReporter,
        report: &mut GcReport,
    ) -> CdrResult<Option<HashSet<StatusId>>> {
        let mut reachable = HashSet::new();
        let mut cursor = None;
        let mut scanned = 0usize;

        loop {
            let batch = self.store.scan_observations(cursor, options.batch_size)?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.id);
            scanned += batch.len();

            let mut orphans = Vec::new();
            for observation in &batch {
                if valid_documents.contains(&observation.document) {
                    reachable.insert(observation.status);
                } else {
                    orphans.push(observation.id);
                }
            }

            report.observations_purged += if options.preview {
                orphans.len()
            } else {
                self.store.delete_observations_if_orphaned(&orphans)?
            };

            if progress.due() {
                tracing::debug!(
                    "gc: scanned {scanned} observations, {} orphaned so far",
                    report.observations_purged
                );
            }
            if self.cancelled() {
                return Ok(None);
            }
            std::thread::yield_now();
        }

        Ok(Some(reachable))
    }

    /// Returns `false` if cancelled.
    fn sweep_statuses(
        &self,
        reachable: &HashSet<StatusId>,
        options: GcOptions,
        progress: &mut ProgressReporter,
        report: &mut GcReport,
    ) -> CdrResult<bool> {
        let mut cursor = None;
        let mut scanned = 0usize;

        loop {
            let batch = self.store.scan_statuses(cursor, options.batch_size)?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.id);
            scanned += batch.len();

            let orphans: Vec<_> = batch
                .iter()
                .filter(|status| !reachable.contains(&status.id))
                .map(|status| status.id)
                .collect();

            report.statuses_purged += if options.preview {
                orphans.len()
            } else if orphans.is_empty() {
                0
            } else {
                let _exclusive = self.gate.exclusive();
                self.store.delete_statuses_if_unreferenced(&orphans)?
            };

            if progress.due() {
                tracing::debug!(
                    "gc: scanned {scanned} statuses, {} orphaned so far",
                    report.statuses_purged
                );
            }
            if self.cancelled() {
                return Ok(false);
            }
            std::thread::yield_now();
        }

        Ok(true)
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn finish(&self, report: GcReport) -> GcReport {
        tracing::info!(
            "gc {}: {} observations and {} statuses {}{}",
            if report.preview { "preview" } else { "run" },
            report.observations_purged,
            report.statuses_purged,
            if report.preview { "would be purged" } else { "purged" },
            if report.interrupted { " (interrupted)" } else { "" }
        );
        report
    }
}
