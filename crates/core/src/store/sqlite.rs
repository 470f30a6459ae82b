//! [`ClinicalStore`] backed by a SQLite database file.
//!
//! Each trait call runs on one connection guarded by a mutex, and every write is its own
//! transaction, so a committed document is durable when the call returns and [`flush`] has nothing
//! left to do. Natural-key uniqueness is enforced by unique indexes; absent status references are
//! indexed as `0`, which no row id takes.
//!
//! [`flush`]: ClinicalStore::flush

use super::{ClinicalStore, CommitSummary, StoreCounts};
use crate::model::{
    ClinicalDocument, Code, CodeId, CodeKey, DocumentId, NewDocument, NewObservation, Observation,
    ObservationId, Status, StatusId, StatusKey,
};
use crate::{CdrError, CdrResult};
use cdr_types::Mrn;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS codes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL,
    code_system TEXT NOT NULL,
    code_system_name TEXT NOT NULL,
    display TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS codes_natural_key
    ON codes (code, code_system, code_system_name);

CREATE TABLE IF NOT EXISTS statuses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    status_code TEXT NOT NULL,
    code_id INTEGER REFERENCES codes (id),
    value_id INTEGER REFERENCES codes (id)
);
CREATE UNIQUE INDEX IF NOT EXISTS statuses_natural_key
    ON statuses (status_code, IFNULL(code_id, 0), IFNULL(value_id, 0));

CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mrn TEXT NOT NULL UNIQUE,
    filepath TEXT NOT NULL,
    receipt_time TEXT NOT NULL,
    generation_time TEXT,
    lastvisit_time TEXT
);

-- document_id has no foreign key: removing a document leaves its observations to GC
CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id INTEGER NOT NULL,
    code_id INTEGER REFERENCES codes (id),
    icd9_id INTEGER REFERENCES codes (id),
    icd10_id INTEGER REFERENCES codes (id),
    entry_date TEXT NOT NULL,
    onset_date TEXT,
    status_id INTEGER NOT NULL REFERENCES statuses (id)
);
CREATE INDEX IF NOT EXISTS observations_by_document ON observations (document_id);
CREATE INDEX IF NOT EXISTS observations_by_status ON observations (status_id);
";

const CODE_COLUMNS: &str = "id, code, code_system, code_system_name, display";
const STATUS_COLUMNS: &str = "id, status_code, code_id, value_id";
const DOCUMENT_COLUMNS: &str =
    "id, mrn, filepath, receipt_time, generation_time, lastvisit_time";
const OBSERVATION_COLUMNS: &str =
    "id, document_id, code_id, icd9_id, icd10_id, entry_date, onset_date, status_id";

// Row ids are positive i64 values in SQLite.
fn raw(id: u64) -> i64 {
    id as i64
}

fn code_from_row(row: &Row<'_>) -> rusqlite::Result<Code> {
    Ok(Code {
        id: CodeId::new(row.get::<_, i64>(0)? as u64),
        code: row.get(1)?,
        code_system: row.get(2)?,
        code_system_name: row.get(3)?,
        display: row.get(4)?,
    })
}

fn status_from_row(row: &Row<'_>) -> rusqlite::Result<Status> {
    Ok(Status {
        id: StatusId::new(row.get::<_, i64>(0)? as u64),
        status_code: row.get(1)?,
        code: row.get::<_, Option<i64>>(2)?.map(|id| CodeId::new(id as u64)),
        value: row.get::<_, Option<i64>>(3)?.map(|id| CodeId::new(id as u64)),
    })
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<ClinicalDocument> {
    let mrn: String = row.get(1)?;
    let mrn = Mrn::new(&mrn)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    Ok(ClinicalDocument {
        id: DocumentId::new(row.get::<_, i64>(0)? as u64),
        mrn,
        filepath: row.get(2)?,
        receipt_time: row.get(3)?,
        generation_time: row.get(4)?,
        lastvisit_time: row.get(5)?,
    })
}

fn observation_from_row(row: &Row<'_>) -> rusqlite::Result<Observation> {
    let code = |idx: usize| -> rusqlite::Result<Option<CodeId>> {
        Ok(row
            .get::<_, Option<i64>>(idx)?
            .map(|id| CodeId::new(id as u64)))
    };
    Ok(Observation {
        id: ObservationId::new(row.get::<_, i64>(0)? as u64),
        document: DocumentId::new(row.get::<_, i64>(1)? as u64),
        code: code(2)?,
        icd9: code(3)?,
        icd10: code(4)?,
        entry_date: row.get(5)?,
        onset_date: row.get(6)?,
        status: StatusId::new(row.get::<_, i64>(7)? as u64),
    })
}

fn find_code(conn: &Connection, key: &CodeKey) -> CdrResult<Option<Code>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {CODE_COLUMNS} FROM codes
                 WHERE code = ?1 AND code_system = ?2 AND code_system_name = ?3"
            ),
            params![key.code, key.code_system, key.code_system_name],
            code_from_row,
        )
        .optional()?)
}

fn find_status(conn: &Connection, key: &StatusKey) -> CdrResult<Option<Status>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {STATUS_COLUMNS} FROM statuses
                 WHERE status_code = ?1 AND code_id IS ?2 AND value_id IS ?3"
            ),
            params![
                key.status_code,
                key.code.map(|id| raw(id.get())),
                key.value.map(|id| raw(id.get()))
            ],
            status_from_row,
        )
        .optional()?)
}

fn code_exists(conn: &Connection, id: CodeId) -> CdrResult<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM codes WHERE id = ?1", [raw(id.get())], |_| Ok(()))
        .optional()?
        .is_some())
}

fn status_exists(conn: &Connection, id: StatusId) -> CdrResult<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM statuses WHERE id = ?1", [raw(id.get())], |_| Ok(()))
        .optional()?
        .is_some())
}

fn check_references(conn: &Connection, observation: &NewObservation) -> CdrResult<()> {
    for code in [observation.code, observation.icd9, observation.icd10]
        .into_iter()
        .flatten()
    {
        if !code_exists(conn, code)? {
            return Err(CdrError::DanglingReference(format!("code {code}")));
        }
    }
    if !status_exists(conn, observation.status)? {
        return Err(CdrError::DanglingReference(format!(
            "status {}",
            observation.status
        )));
    }
    Ok(())
}

fn count(conn: &Connection, table: &str) -> CdrResult<usize> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    Ok(n as usize)
}

/// Thread-safe SQLite store.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the file cannot be opened or the schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> CdrResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(CdrError::FileWrite)?;
        }
        let store = Self::init(Connection::open(path)?)?;
        tracing::debug!("opened sqlite store {}", path.display());
        Ok(store)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> CdrResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> CdrResult<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> CdrResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CdrError::LockPoisoned("sqlite connection"))
    }
}

impl ClinicalStore for SqliteStore {
    fn find_code(&self, key: &CodeKey) -> CdrResult<Option<Code>> {
        find_code(&*self.conn()?, key)
    }

    fn insert_code(&self, value: &ccda::CodedValue) -> CdrResult<Code> {
        let key = CodeKey::from(value);
        let conn = self.conn()?;
        if find_code(&conn, &key)?.is_some() {
            return Err(CdrError::UniqueViolation(format!(
                "code {}/{}/{}",
                key.code, key.code_system, key.code_system_name
            )));
        }

        conn.execute(
            "INSERT INTO codes (code, code_system, code_system_name, display)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                value.code,
                value.code_system,
                value.code_system_name,
                value.display
            ],
        )?;
        Ok(Code {
            id: CodeId::new(conn.last_insert_rowid() as u64),
            code: value.code.clone(),
            code_system: value.code_system.clone(),
            code_system_name: value.code_system_name.clone(),
            display: value.display.clone(),
        })
    }

    fn code(&self, id: CodeId) -> CdrResult<Option<Code>> {
        Ok(self
            .conn()?
            .query_row(
                &format!("SELECT {CODE_COLUMNS} FROM codes WHERE id = ?1"),
                [raw(id.get())],
                code_from_row,
            )
            .optional()?)
    }

    fn find_status(&self, key: &StatusKey) -> CdrResult<Option<Status>> {
        find_status(&*self.conn()?, key)
    }

    fn insert_status(&self, key: &StatusKey) -> CdrResult<Status> {
        let conn = self.conn()?;
        if find_status(&conn, key)?.is_some() {
            return Err(CdrError::UniqueViolation(format!(
                "status {:?}",
                key.status_code
            )));
        }
        for code in [key.code, key.value].into_iter().flatten() {
            if !code_exists(&conn, code)? {
                return Err(CdrError::DanglingReference(format!("code {code}")));
            }
        }

        conn.execute(
            "INSERT INTO statuses (status_code, code_id, value_id) VALUES (?1, ?2, ?3)",
            params![
                key.status_code,
                key.code.map(|id| raw(id.get())),
                key.value.map(|id| raw(id.get()))
            ],
        )?;
        Ok(Status {
            id: StatusId::new(conn.last_insert_rowid() as u64),
            status_code: key.status_code.clone(),
            code: key.code,
            value: key.value,
        })
    }

    fn status(&self, id: StatusId) -> CdrResult<Option<Status>> {
        Ok(self
            .conn()?
            .query_row(
                &format!("SELECT {STATUS_COLUMNS} FROM statuses WHERE id = ?1"),
                [raw(id.get())],
                status_from_row,
            )
            .optional()?)
    }

    fn document(&self, mrn: &Mrn) -> CdrResult<Option<ClinicalDocument>> {
        Ok(self
            .conn()?
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE mrn = ?1"),
                [mrn.as_str()],
                document_from_row,
            )
            .optional()?)
    }

    fn documents(&self) -> CdrResult<Vec<ClinicalDocument>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY id"))?;
        let rows = stmt.query_map([], document_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn document_ids(&self) -> CdrResult<HashSet<DocumentId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM documents")?;
        let rows = stmt.query_map([], |row| {
            Ok(DocumentId::new(row.get::<_, i64>(0)? as u64))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn commit_document(
        &self,
        document: NewDocument,
        observations: Vec<NewObservation>,
        replace: bool,
    ) -> CdrResult<CommitSummary> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for observation in &observations {
            check_references(&tx, observation)?;
        }

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM documents WHERE mrn = ?1",
                [document.mrn.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let document_id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE documents
                     SET filepath = ?2, receipt_time = ?3, generation_time = ?4, lastvisit_time = ?5
                     WHERE id = ?1",
                    params![
                        id,
                        document.filepath,
                        document.receipt_time,
                        document.generation_time,
                        document.lastvisit_time
                    ],
                )?;
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO documents (mrn, filepath, receipt_time, generation_time, lastvisit_time)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        document.mrn.as_str(),
                        document.filepath,
                        document.receipt_time,
                        document.generation_time,
                        document.lastvisit_time
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        let replaced = if replace {
            tx.execute(
                "DELETE FROM observations WHERE document_id = ?1",
                [document_id],
            )?
        } else {
            0
        };

        let inserted = observations.len();
        {
            let mut insert = tx.prepare(
                "INSERT INTO observations
                 (document_id, code_id, icd9_id, icd10_id, entry_date, onset_date, status_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for new in &observations {
                insert.execute(params![
                    document_id,
                    new.code.map(|id| raw(id.get())),
                    new.icd9.map(|id| raw(id.get())),
                    new.icd10.map(|id| raw(id.get())),
                    new.entry_date,
                    new.onset_date,
                    raw(new.status.get())
                ])?;
            }
        }
        tx.commit()?;

        Ok(CommitSummary {
            document: ClinicalDocument {
                id: DocumentId::new(document_id as u64),
                mrn: document.mrn,
                filepath: document.filepath,
                receipt_time: document.receipt_time,
                generation_time: document.generation_time,
                lastvisit_time: document.lastvisit_time,
            },
            inserted,
            replaced,
        })
    }

    fn remove_document(&self, mrn: &Mrn) -> CdrResult<Option<ClinicalDocument>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE mrn = ?1"),
                [mrn.as_str()],
                document_from_row,
            )
            .optional()?;
        if let Some(document) = &removed {
            tx.execute(
                "DELETE FROM documents WHERE id = ?1",
                [raw(document.id.get())],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }

    fn observations_for(&self, document: DocumentId) -> CdrResult<Vec<Observation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations WHERE document_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([raw(document.get())], observation_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn scan_observations(
        &self,
        after: Option<ObservationId>,
        limit: usize,
    ) -> CdrResult<Vec<Observation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations WHERE id > ?1 ORDER BY id LIMIT ?2"
        ))?;
        let after = after.map_or(0, |id| raw(id.get()));
        let rows = stmt.query_map(params![after, limit as i64], observation_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn scan_statuses(&self, after: Option<StatusId>, limit: usize) -> CdrResult<Vec<Status>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STATUS_COLUMNS} FROM statuses WHERE id > ?1 ORDER BY id LIMIT ?2"
        ))?;
        let after = after.map_or(0, |id| raw(id.get()));
        let rows = stmt.query_map(params![after, limit as i64], status_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn delete_observations_if_orphaned(&self, ids: &[ObservationId]) -> CdrResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut delete = tx.prepare(
                "DELETE FROM observations
                 WHERE id = ?1 AND document_id NOT IN (SELECT id FROM documents)",
            )?;
            for id in ids {
                deleted += delete.execute([raw(id.get())])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn delete_statuses_if_unreferenced(&self, ids: &[StatusId]) -> CdrResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut delete = tx.prepare(
                "DELETE FROM statuses
                 WHERE id = ?1 AND NOT EXISTS (SELECT 1 FROM observations WHERE status_id = ?1)",
            )?;
            for id in ids {
                deleted += delete.execute([raw(id.get())])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn counts(&self) -> CdrResult<StoreCounts> {
        let conn = self.conn()?;
        Ok(StoreCounts {
            documents: count(&conn, "documents")?,
            codes: count(&conn, "codes")?,
            statuses: count(&conn, "statuses")?,
            observations: count(&conn, "observations")?,
        })
    }

    fn flush(&self) -> CdrResult<()> {
        Ok(())
    }
}
