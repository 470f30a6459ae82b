//! `CdrService`: the facade used by the REST API and the CLI.

use crate::config::CoreConfig;
use crate::filter::{Pattern, ProblemFilter};
use crate::gc::{GarbageCollector, GcOptions, GcReport};
use crate::ingest::{IngestOutcome, IngestRequest, IncomingDocument, MergeArbiter};
use crate::model::{CodeId, Observation};
use crate::progress::ProgressReporter;
use crate::store::{ClinicalStore, MemoryStore, SqliteStore};
use crate::sync::IngestGate;
use crate::views::{
    CodesView, DiagnosisPatientsView, FileInfoView, ProblemListView, ViewResolver,
};
use crate::{CdrError, CdrResult};
use cdr_types::Mrn;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Diagnosis code system addressed by the code and diagnosis queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosisSystem {
    Icd9,
    Icd10,
}

impl DiagnosisSystem {
    pub fn as_str(self) -> &'static str {
        match self {
            DiagnosisSystem::Icd9 => "icd9",
            DiagnosisSystem::Icd10 => "icd10",
        }
    }

    fn slot(self, observation: &Observation) -> Option<CodeId> {
        match self {
            DiagnosisSystem::Icd9 => observation.icd9,
            DiagnosisSystem::Icd10 => observation.icd10,
        }
    }
}

impl fmt::Display for DiagnosisSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiagnosisSystem {
    type Err = CdrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "icd9" => Ok(Self::Icd9),
            "icd10" => Ok(Self::Icd10),
            _ => Err(CdrError::InvalidInput(format!(
                "unknown diagnosis system {s:?} (expected icd9 or icd10)"
            ))),
        }
    }
}

/// Ingestion, queries and maintenance over one store.
pub struct CdrService {
    cfg: Arc<CoreConfig>,
    store: Arc<dyn ClinicalStore>,
    gate: Arc<IngestGate>,
    arbiter: MergeArbiter,
}

impl CdrService {
    pub fn new(cfg: Arc<CoreConfig>, store: Arc<dyn ClinicalStore>) -> Self {
        let gate = Arc::new(IngestGate::new());
        let arbiter = MergeArbiter::new(store.clone(), gate.clone(), cfg.local_zone());
        Self {
            cfg,
            store,
            gate,
            arbiter,
        }
    }

    /// Build a service over the configured data file.
    ///
    /// A SQLite data file opens a [`SqliteStore`]; any other file is loaded as the snapshot of a
    /// [`MemoryStore`]. Without a data file nothing is persisted.
    ///
    /// # Errors
    ///
    /// Returns loading errors from [`SqliteStore::open`] or [`MemoryStore::open`].
    pub fn open(cfg: Arc<CoreConfig>) -> CdrResult<Self> {
        let store: Arc<dyn ClinicalStore> = match cfg.data_file() {
            Some(path) if cfg.uses_sqlite() => Arc::new(SqliteStore::open(path)?),
            Some(path) => Arc::new(MemoryStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::new(cfg, store))
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    pub fn store(&self) -> &dyn ClinicalStore {
        self.store.as_ref()
    }

    /// Write pending changes after a committed operation.
    ///
    /// The commit already happened, so a failed write is logged and left for the next flush to
    /// retry rather than reported as a failure of the operation.
    fn persist(&self, after: fmt::Arguments<'_>) {
        if let Err(e) = self.store.flush() {
            tracing::error!("failed to persist store after {after}: {e}; retrying on next write");
        }
    }

    /// Ingest a request for `mrn`; accepted documents are flushed to the snapshot.
    pub fn ingest(&self, mrn: &Mrn, request: IngestRequest) -> CdrResult<IngestOutcome> {
        let outcome = self.arbiter.ingest(mrn, request)?;
        if matches!(outcome, IngestOutcome::Accepted { .. }) {
            self.persist(format_args!("ingesting {mrn}"));
        }
        Ok(outcome)
    }

    /// Ingest a document whose timestamps are already resolved.
    pub fn ingest_document(
        &self,
        mrn: &Mrn,
        incoming: IncomingDocument,
    ) -> CdrResult<IngestOutcome> {
        let outcome = self.arbiter.ingest_document(mrn, incoming)?;
        if matches!(outcome, IngestOutcome::Accepted { .. }) {
            self.persist(format_args!("ingesting {mrn}"));
        }
        Ok(outcome)
    }

    /// Metadata of the current document for `mrn`, or `None` if the MRN is unknown.
    pub fn file_info(&self, mrn: &Mrn) -> CdrResult<Option<FileInfoView>> {
        Ok(self.store.document(mrn)?.as_ref().map(FileInfoView::from))
    }

    /// The current problem list for `mrn`, restricted to observations passing `filter`.
    pub fn problem_list(
        &self,
        mrn: &Mrn,
        filter: Option<&ProblemFilter>,
    ) -> CdrResult<Option<ProblemListView>> {
        let Some(document) = self.store.document(mrn)? else {
            return Ok(None);
        };

        let mut resolver = ViewResolver::new(self.store.as_ref());
        let mut problem_list = Vec::new();
        for observation in self.store.observations_for(document.id)? {
            let view = resolver.observation(&observation)?;
            if filter.map_or(true, |f| f.matches(&view)) {
                problem_list.push(view);
            }
        }

        Ok(Some(ProblemListView {
            mrn: document.mrn,
            receipt_time: document.receipt_time,
            generation_time: document.generation_time,
            lastvisit_time: document.lastvisit_time,
            problem_list,
        }))
    }

    /// Distinct codes used in the `system` slot of any current observation, sorted by code.
    pub fn codes(&self, system: DiagnosisSystem) -> CdrResult<CodesView> {
        let mut ids = BTreeSet::new();
        for document in self.store.documents()? {
            for observation in self.store.observations_for(document.id)? {
                ids.extend(system.slot(&observation));
            }
        }

        let mut resolver = ViewResolver::new(self.store.as_ref());
        let mut codes = ids
            .into_iter()
            .map(|id| resolver.code(id))
            .collect::<CdrResult<Vec<_>>>()?;
        codes.sort_by(|a, b| {
            (&a.code, &a.code_system_name).cmp(&(&b.code, &b.code_system_name))
        });
        Ok(CodesView { codes })
    }

    /// MRNs with a current observation whose `system` code matches `pattern`.
    pub fn diagnosis_patients(
        &self,
        system: DiagnosisSystem,
        pattern: &str,
    ) -> CdrResult<DiagnosisPatientsView> {
        let pattern = Pattern::new(pattern);
        let mut resolver = ViewResolver::new(self.store.as_ref());
        let mut matches: BTreeMap<CodeId, bool> = BTreeMap::new();
        let mut patients = Vec::new();

        for document in self.store.documents()? {
            let mut found = false;
            for observation in self.store.observations_for(document.id)? {
                let Some(id) = system.slot(&observation) else {
                    continue;
                };
                let hit = match matches.get(&id) {
                    Some(hit) => *hit,
                    None => {
                        let hit = pattern.matches(&resolver.code(id)?.code);
                        matches.insert(id, hit);
                        hit
                    }
                };
                if hit {
                    found = true;
                    break;
                }
            }
            if found {
                patients.push(document.mrn);
            }
        }
        patients.sort();

        Ok(DiagnosisPatientsView {
            system: system.as_str().to_string(),
            code: pattern.as_str().to_string(),
            patients,
        })
    }

    /// Administrative removal of the document for `mrn`; its observations become orphans.
    pub fn remove_document(&self, mrn: &Mrn) -> CdrResult<bool> {
        let removed = self.store.remove_document(mrn)?.is_some();
        if removed {
            tracing::info!("removed document for {mrn}");
            self.persist(format_args!("removing {mrn}"));
        }
        Ok(removed)
    }

    /// Run the garbage collector with the configured batch size.
    pub fn collect_garbage(
        &self,
        preview: bool,
        cancel: Option<&AtomicBool>,
    ) -> CdrResult<GcReport> {
        let mut collector = GarbageCollector::new(self.store.as_ref(), &self.gate);
        if let Some(flag) = cancel {
            collector = collector.with_cancel(flag);
        }
        let mut progress = ProgressReporter::new(self.cfg.progress_interval());
        let report = collector.collect(
            GcOptions {
                preview,
                batch_size: self.cfg.gc_batch_size(),
            },
            &mut progress,
        )?;
        if !preview {
            self.persist(format_args!("garbage collection"));
        }
        Ok(report)
    }
}
