//! In-memory [`ClinicalStore`] with optional JSON snapshot persistence.
//!
//! All tables sit behind a single `RwLock`, so every trait call is atomic. Unique indexes on the
//! code and status natural keys back the canonicaliser; an observation-by-status index lets the
//! garbage collector re-check status references at delete time.
//!
//! Every mutation marks the store dirty. A flush that fails leaves it dirty, so the next flush
//! writes the full snapshot again.

use super::{ClinicalStore, CommitSummary, StoreCounts};
use crate::model::{
    ClinicalDocument, Code, CodeId, CodeKey, DocumentId, NewDocument, NewObservation, Observation,
    ObservationId, Status, StatusId, StatusKey,
};
use crate::{CdrError, CdrResult};
use cdr_types::Mrn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Next surrogate id per table. Persisted so removed ids are never handed out again.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Sequences {
    code: u64,
    status: u64,
    document: u64,
    observation: u64,
}

/// On-disk layout of the snapshot file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    sequences: Option<Sequences>,
    #[serde(default)]
    codes: Vec<Code>,
    #[serde(default)]
    statuses: Vec<Status>,
    #[serde(default)]
    documents: Vec<ClinicalDocument>,
    #[serde(default)]
    observations: Vec<Observation>,
}

#[derive(Debug, Default)]
struct Tables {
    sequences: Sequences,
    codes: BTreeMap<CodeId, Code>,
    statuses: BTreeMap<StatusId, Status>,
    documents: BTreeMap<DocumentId, ClinicalDocument>,
    observations: BTreeMap<ObservationId, Observation>,

    code_keys: HashMap<CodeKey, CodeId>,
    status_keys: HashMap<StatusKey, StatusId>,
    documents_by_mrn: HashMap<Mrn, DocumentId>,
    observations_by_document: HashMap<DocumentId, BTreeSet<ObservationId>>,
    observations_by_status: HashMap<StatusId, BTreeSet<ObservationId>>,
}

impl Tables {
    fn from_snapshot(snapshot: Snapshot) -> CdrResult<Self> {
        let mut tables = Tables::default();

        for code in snapshot.codes {
            if tables.code_keys.insert(code.key(), code.id).is_some() {
                return Err(CdrError::UniqueViolation(format!(
                    "snapshot holds duplicate code {}/{}",
                    code.code_system, code.code
                )));
            }
            tables.codes.insert(code.id, code);
        }
        for status in snapshot.statuses {
            if tables.status_keys.insert(status.key(), status.id).is_some() {
                return Err(CdrError::UniqueViolation(format!(
                    "snapshot holds duplicate status {}",
                    status.id
                )));
            }
            tables.statuses.insert(status.id, status);
        }
        for document in snapshot.documents {
            if tables
                .documents_by_mrn
                .insert(document.mrn.clone(), document.id)
                .is_some()
            {
                return Err(CdrError::UniqueViolation(format!(
                    "snapshot holds two documents for MRN {}",
                    document.mrn
                )));
            }
            tables.documents.insert(document.id, document);
        }
        for observation in snapshot.observations {
            tables.index_observation(&observation);
            tables.observations.insert(observation.id, observation);
        }

        tables.sequences = match snapshot.sequences {
            Some(sequences) => sequences,
            None => Sequences {
                code: next_after(tables.codes.keys().next_back().map(|id| id.get())),
                status: next_after(tables.statuses.keys().next_back().map(|id| id.get())),
                document: next_after(tables.documents.keys().next_back().map(|id| id.get())),
                observation: next_after(
                    tables.observations.keys().next_back().map(|id| id.get()),
                ),
            },
        };

        Ok(tables)
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            sequences: Some(self.sequences.clone()),
            codes: self.codes.values().cloned().collect(),
            statuses: self.statuses.values().cloned().collect(),
            documents: self.documents.values().cloned().collect(),
            observations: self.observations.values().cloned().collect(),
        }
    }

    fn index_observation(&mut self, observation: &Observation) {
        self.observations_by_document
            .entry(observation.document)
            .or_default()
            .insert(observation.id);
        self.observations_by_status
            .entry(observation.status)
            .or_default()
            .insert(observation.id);
    }

    fn remove_observation(&mut self, id: ObservationId) -> bool {
        let Some(observation) = self.observations.remove(&id) else {
            return false;
        };
        remove_from_index(
            &mut self.observations_by_document,
            &observation.document,
            id,
        );
        remove_from_index(&mut self.observations_by_status, &observation.status, id);
        true
    }

    fn check_references(&self, observation: &NewObservation) -> CdrResult<()> {
        for code in [observation.code, observation.icd9, observation.icd10]
            .into_iter()
            .flatten()
        {
            if !self.codes.contains_key(&code) {
                return Err(CdrError::DanglingReference(format!("code {code}")));
            }
        }
        if !self.statuses.contains_key(&observation.status) {
            return Err(CdrError::DanglingReference(format!(
                "status {}",
                observation.status
            )));
        }
        Ok(())
    }
}

fn next_after(max: Option<u64>) -> u64 {
    max.map_or(1, |id| id + 1)
}

fn take_id(counter: &mut u64) -> u64 {
    if *counter == 0 {
        *counter = 1;
    }
    let id = *counter;
    *counter += 1;
    id
}

fn remove_from_index<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, BTreeSet<ObservationId>>,
    key: &K,
    id: ObservationId,
) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(&id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

fn lower_bound<T>(after: Option<T>) -> Bound<T> {
    match after {
        Some(id) => Bound::Excluded(id),
        None => Bound::Unbounded,
    }
}

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    path: Option<PathBuf>,
    flush_lock: Mutex<()>,
    dirty: AtomicBool,
}

impl MemoryStore {
    /// An empty store that is never written to disk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store backed by a JSON snapshot at `path`.
    ///
    /// A missing file yields an empty store that will be created on the first [`flush`].
    ///
    /// # Errors
    ///
    /// Returns `FileRead`/`Deserialization` if an existing snapshot cannot be loaded, and
    /// `UniqueViolation` if it contains duplicate natural keys.
    ///
    /// [`flush`]: ClinicalStore::flush
    pub fn open(path: impl Into<PathBuf>) -> CdrResult<Self> {
        let path = path.into();
        let tables = match fs::read(&path) {
            Ok(bytes) => {
                let snapshot: Snapshot =
                    serde_json::from_slice(&bytes).map_err(CdrError::Deserialization)?;
                Tables::from_snapshot(snapshot)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(CdrError::FileRead(e)),
        };

        tracing::debug!(
            "opened store {} with {} documents",
            path.display(),
            tables.documents.len()
        );

        Ok(Self {
            tables: RwLock::new(tables),
            path: Some(path),
            flush_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
        })
    }

    /// Whether there are mutations not yet written to the snapshot.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Called with the table write guard still held.
    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn write_snapshot(&self, path: &Path) -> CdrResult<()> {
        let bytes = {
            let tables = self.read()?;
            serde_json::to_vec(&tables.to_snapshot()).map_err(CdrError::Serialization)?
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(CdrError::FileWrite)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes).map_err(CdrError::FileWrite)?;
        fs::rename(&tmp, path).map_err(CdrError::FileWrite)
    }

    fn read(&self) -> CdrResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| CdrError::LockPoisoned("store tables"))
    }

    fn write(&self) -> CdrResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| CdrError::LockPoisoned("store tables"))
    }
}

impl ClinicalStore for MemoryStore {
    fn find_code(&self, key: &CodeKey) -> CdrResult<Option<Code>> {
        let tables = self.read()?;
        Ok(tables
            .code_keys
            .get(key)
            .and_then(|id| tables.codes.get(id))
            .cloned())
    }

    fn insert_code(&self, value: &ccda::CodedValue) -> CdrResult<Code> {
        let key = CodeKey::from(value);
        let mut tables = self.write()?;
        if tables.code_keys.contains_key(&key) {
            return Err(CdrError::UniqueViolation(format!(
                "code {}/{}/{}",
                key.code, key.code_system, key.code_system_name
            )));
        }

        let code = Code {
            id: CodeId::new(take_id(&mut tables.sequences.code)),
            code: value.code.clone(),
            code_system: value.code_system.clone(),
            code_system_name: value.code_system_name.clone(),
            display: value.display.clone(),
        };
        tables.code_keys.insert(key, code.id);
        tables.codes.insert(code.id, code.clone());
        self.mark_dirty();
        Ok(code)
    }

    fn code(&self, id: CodeId) -> CdrResult<Option<Code>> {
        Ok(self.read()?.codes.get(&id).cloned())
    }

    fn find_status(&self, key: &StatusKey) -> CdrResult<Option<Status>> {
        let tables = self.read()?;
        Ok(tables
            .status_keys
            .get(key)
            .and_then(|id| tables.statuses.get(id))
            .cloned())
    }

    fn insert_status(&self, key: &StatusKey) -> CdrResult<Status> {
        let mut tables = self.write()?;
        if tables.status_keys.contains_key(key) {
            return Err(CdrError::UniqueViolation(format!(
                "status {:?}",
                key.status_code
            )));
        }
        for code in [key.code, key.value].into_iter().flatten() {
            if !tables.codes.contains_key(&code) {
                return Err(CdrError::DanglingReference(format!("code {code}")));
            }
        }

        let status = Status {
            id: StatusId::new(take_id(&mut tables.sequences.status)),
            status_code: key.status_code.clone(),
            code: key.code,
            value: key.value,
        };
        tables.status_keys.insert(key.clone(), status.id);
        tables.statuses.insert(status.id, status.clone());
        self.mark_dirty();
        Ok(status)
    }

    fn status(&self, id: StatusId) -> CdrResult<Option<Status>> {
        Ok(self.read()?.statuses.get(&id).cloned())
    }

    fn document(&self, mrn: &Mrn) -> CdrResult<Option<ClinicalDocument>> {
        let tables = self.read()?;
        Ok(tables
            .documents_by_mrn
            .get(mrn)
            .and_then(|id| tables.documents.get(id))
            .cloned())
    }

    fn documents(&self) -> CdrResult<Vec<ClinicalDocument>> {
        Ok(self.read()?.documents.values().cloned().collect())
    }

    fn document_ids(&self) -> CdrResult<HashSet<DocumentId>> {
        Ok(self.read()?.documents.keys().copied().collect())
    }

    fn commit_document(
        &self,
        document: NewDocument,
        observations: Vec<NewObservation>,
        replace: bool,
    ) -> CdrResult<CommitSummary> {
        let mut tables = self.write()?;
        for observation in &observations {
            tables.check_references(observation)?;
        }

        let existing = tables.documents_by_mrn.get(&document.mrn).copied();
        let document_id = match existing {
            Some(id) => id,
            None => DocumentId::new(take_id(&mut tables.sequences.document)),
        };

        let mut replaced = 0;
        if replace {
            let prior: Vec<ObservationId> = tables
                .observations_by_document
                .get(&document_id)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default();
            for id in prior {
                if tables.remove_observation(id) {
                    replaced += 1;
                }
            }
        }

        let stored = ClinicalDocument {
            id: document_id,
            mrn: document.mrn,
            filepath: document.filepath,
            receipt_time: document.receipt_time,
            generation_time: document.generation_time,
            lastvisit_time: document.lastvisit_time,
        };
        tables
            .documents_by_mrn
            .insert(stored.mrn.clone(), document_id);
        tables.documents.insert(document_id, stored.clone());

        let inserted = observations.len();
        for new in observations {
            let observation = Observation {
                id: ObservationId::new(take_id(&mut tables.sequences.observation)),
                document: document_id,
                code: new.code,
                icd9: new.icd9,
                icd10: new.icd10,
                entry_date: new.entry_date,
                onset_date: new.onset_date,
                status: new.status,
            };
            tables.index_observation(&observation);
            tables.observations.insert(observation.id, observation);
        }
        self.mark_dirty();

        Ok(CommitSummary {
            document: stored,
            inserted,
            replaced,
        })
    }

    fn remove_document(&self, mrn: &Mrn) -> CdrResult<Option<ClinicalDocument>> {
        let mut tables = self.write()?;
        let Some(id) = tables.documents_by_mrn.remove(mrn) else {
            return Ok(None);
        };
        self.mark_dirty();
        Ok(tables.documents.remove(&id))
    }

    fn observations_for(&self, document: DocumentId) -> CdrResult<Vec<Observation>> {
        let tables = self.read()?;
        Ok(tables
            .observations_by_document
            .get(&document)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.observations.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn scan_observations(
        &self,
        after: Option<ObservationId>,
        limit: usize,
    ) -> CdrResult<Vec<Observation>> {
        let tables = self.read()?;
        Ok(tables
            .observations
            .range((lower_bound(after), Bound::Unbounded))
            .take(limit)
            .map(|(_, observation)| observation.clone())
            .collect())
    }

    fn scan_statuses(&self, after: Option<StatusId>, limit: usize) -> CdrResult<Vec<Status>> {
        let tables = self.read()?;
        Ok(tables
            .statuses
            .range((lower_bound(after), Bound::Unbounded))
            .take(limit)
            .map(|(_, status)| status.clone())
            .collect())
    }

    fn delete_observations_if_orphaned(&self, ids: &[ObservationId]) -> CdrResult<usize> {
        let mut tables = self.write()?;
        let mut deleted = 0;
        for id in ids {
            let orphaned = tables
                .observations
                .get(id)
                .is_some_and(|o| !tables.documents.contains_key(&o.document));
            if orphaned && tables.remove_observation(*id) {
                deleted += 1;
            }
        }
        if deleted > 0 {
            self.mark_dirty();
        }
        Ok(deleted)
    }

    fn delete_statuses_if_unreferenced(&self, ids: &[StatusId]) -> CdrResult<usize> {
        let mut tables = self.write()?;
        let mut deleted = 0;
        for id in ids {
            if tables.observations_by_status.contains_key(id) {
                continue;
            }
            if let Some(status) = tables.statuses.remove(id) {
                tables.status_keys.remove(&status.key());
                deleted += 1;
            }
        }
        if deleted > 0 {
            self.mark_dirty();
        }
        Ok(deleted)
    }

    fn counts(&self) -> CdrResult<StoreCounts> {
        let tables = self.read()?;
        Ok(StoreCounts {
            documents: tables.documents.len(),
            codes: tables.codes.len(),
            statuses: tables.statuses.len(),
            observations: tables.observations.len(),
        })
    }

    fn flush(&self) -> CdrResult<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let _flushing = self
            .flush_lock
            .lock()
            .map_err(|_| CdrError::LockPoisoned("store flush"))?;

        // Cleared before the tables are read; a mutation landing after the read sets it again.
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let written = self.write_snapshot(path);
        if written.is_err() {
            self.mark_dirty();
        }
        written
    }
}
