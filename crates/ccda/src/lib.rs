//! CCDA wire/boundary support for the Clinical Document Repository.
//!
//! Upstream, an integration engine converts the CCDA XML "Problem List" section into JSON.
//! That conversion has a peculiar shape:
//! - every XML attribute becomes a key with a leading underscore (`_code`, `_displayName`)
//! - element content that sits beside attributes is nested under a bare `_` key
//! - an element that occurs once is emitted as an object, several times as a list
//!
//! This crate owns that shape. It provides:
//! - strict-enough wire structs for the keys the repository reads (unknown keys are ignored,
//!   type mismatches on known keys are not)
//! - [`OneOrMany`] to coerce sometimes-singular fields into sequences at the boundary
//! - a single validating decode step ([`ProblemList::parse`]) producing an explicit intermediate
//!   schema that business logic consumes without probing dictionaries
//!
//! Interpretation (dates, canonical codes, acceptance rules) belongs to `cdr-core`.

pub mod one_or_many;
pub mod problem_list;

pub use one_or_many::OneOrMany;
pub use problem_list::{
    CodedValue, EffectiveTimeRange, ProblemList, ProblemObservation, ProblemSection,
    StatusObservation,
};

/// Errors returned by the `ccda` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum CcdaError {
    /// The JSON did not match the wire schema; the message carries the JSON path.
    #[error("translation error: {0}")]
    Translation(String),

    /// A key required by the wire schema was absent.
    #[error("missing required field: {0}")]
    MissingField(String),
}

/// Type alias for Results that can fail with a [`CcdaError`].
pub type CcdaResult<T> = Result<T, CcdaError>;
