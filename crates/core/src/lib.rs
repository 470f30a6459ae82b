//! # CDR Core
//!
//! Core business logic for the clinical data repository.
//!
//! This crate turns converted CCDA Problem List sections into canonical, deduplicated entities:
//! - Effective-time resolution and timestamp normalisation to UTC
//! - Code/status canonicalisation backed by unique natural keys
//! - Problem-list parsing into observations
//! - Per-patient document arbitration (latest generation wins) with atomic replacement
//! - Batch garbage collection of orphaned observations and statuses
//! - Problem-list queries and filters
//!
//! **No API concerns**: HTTP routing and CLI parsing live in `api-rest` and `cdr-cli`.

pub mod canonical;
pub mod config;
pub mod constants;
pub mod error;
pub mod filter;
pub mod gc;
pub mod ingest;
pub mod model;
pub mod problem_list;
pub mod progress;
pub mod service;
pub mod store;
pub mod sync;
pub mod time;
pub mod views;

pub use config::{CoreConfig, LocalZone};
pub use error::{CdrError, CdrResult};
pub use filter::ProblemFilter;
pub use gc::{GcOptions, GcReport};
pub use ingest::{IngestOutcome, IngestRequest};
pub use progress::ProgressReporter;
pub use service::{CdrService, DiagnosisSystem};
pub use store::{ClinicalStore, MemoryStore, SqliteStore};

pub use cdr_types::Mrn;
