//! Coercion of sometimes-singular JSON fields.
//!
//! The XML-to-JSON conversion emits a repeated element as a list but a lone element as a bare
//! object. Fields known to behave this way are typed as [`OneOrMany`] on the wire and turned into
//! a `Vec` before anything else looks at them.

use serde::Deserialize;

/// A wire value that is either a single item or a list of items.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    /// Normalise into a sequence, preserving document order.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }

    /// The last item in document order, if any.
    pub fn into_last(self) -> Option<T> {
        match self {
            OneOrMany::Many(items) => items.into_iter().next_back(),
            OneOrMany::One(item) => Some(item),
        }
    }
}
