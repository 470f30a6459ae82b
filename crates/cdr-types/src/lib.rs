//! Validated patient identifiers shared across the CDR crates.

/// Errors that can occur when creating a [`Mrn`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MrnError {
    #[error("MRN cannot be empty")]
    Empty,
    #[error("MRN exceeds maximum length of {max} characters")]
    TooLong { max: usize },
    #[error("MRN contains whitespace or control characters")]
    InvalidCharacters,
}

/// Patient medical record number.
///
/// The MRN is the natural key of a clinical document, so it is kept verbatim apart from
/// surrounding whitespace. Interior whitespace and control characters are rejected because
/// MRNs travel in URL paths and file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mrn(String);

impl Mrn {
    /// Column width of the MRN key in the document table.
    pub const MAX_LEN: usize = 255;

    /// Validates and wraps an MRN.
    ///
    /// # Errors
    ///
    /// Returns [`MrnError`] if the trimmed input is empty, longer than [`Mrn::MAX_LEN`], or
    /// contains whitespace/control characters.
    pub fn new(input: impl AsRef<str>) -> Result<Self, MrnError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(MrnError::Empty);
        }
        if trimmed.chars().count() > Self::MAX_LEN {
            return Err(MrnError::TooLong { max: Self::MAX_LEN });
        }
        if trimmed
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(MrnError::InvalidCharacters);
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Mrn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Mrn {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for Mrn {
    type Err = MrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mrn::new(s)
    }
}

impl serde::Serialize for Mrn {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Mrn {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Mrn::new(&s).map_err(serde::de::Error::custom)
    }
}
