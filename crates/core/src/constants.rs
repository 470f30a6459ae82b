//! Constants used throughout the CDR core crate.
//!
//! Section titles, code-system prefixes and operational defaults live here so the parser,
//! the configuration layer and the binaries agree on them.

/// Declared title (`section.code._displayName`) of the only section this system ingests.
pub const PROBLEM_LIST_TITLE: &str = "Problem List";

/// `codeSystemName` prefix identifying an ICD-9 translation (e.g. `ICD-9-CM`).
pub const ICD9_SYSTEM_PREFIX: &str = "ICD-9";

/// `codeSystemName` prefix identifying an ICD-10 translation (e.g. `ICD-10-CM`).
pub const ICD10_SYSTEM_PREFIX: &str = "ICD-10";

/// Default number of rows examined per garbage-collection batch.
pub const DEFAULT_GC_BATCH_SIZE: usize = 500;

/// Default minimum number of seconds between two progress reports of a batch job.
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 30;

/// Default bind address of the REST server.
pub const DEFAULT_REST_ADDR: &str = "0.0.0.0:3000";

/// Environment variable naming the zone applied to timestamps without an offset.
pub const LOCAL_TIMEZONE_ENV: &str = "CDR_LOCAL_TIMEZONE";

/// Environment variable naming the data file of the store.
pub const DATA_FILE_ENV: &str = "CDR_DATA_FILE";

/// Data file extensions opened as a SQLite database; any other data file is a JSON snapshot.
pub const SQLITE_EXTENSIONS: &[&str] = &["db", "sqlite", "sqlite3"];

/// Environment variable overriding [`DEFAULT_GC_BATCH_SIZE`].
pub const GC_BATCH_SIZE_ENV: &str = "CDR_GC_BATCH_SIZE";

/// Environment variable overriding [`DEFAULT_REST_ADDR`].
pub const REST_ADDR_ENV: &str = "CDR_REST_ADDR";
