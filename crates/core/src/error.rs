#[derive(Debug, thiserror::Error)]
pub enum CdrError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("invalid timestamp: {0:?}")]
    InvalidTimestamp(String),
    #[error("local time {0} is ambiguous or does not exist in the configured zone")]
    AmbiguousLocalTime(String),
    #[error("observation carries more than one {0} translation")]
    DuplicateTranslation(&'static str),
    #[error("problem list decode failed: {0}")]
    Ccda(#[from] ccda::CcdaError),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("dangling reference: {0}")]
    DanglingReference(String),
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("failed to read data file: {0}")]
    FileRead(std::io::Error),
    #[error("failed to write data file: {0}")]
    FileWrite(std::io::Error),
    #[error("failed to serialize store snapshot: {0}")]
    Serialization(serde_json::Error),
    #[error("failed to deserialize store snapshot: {0}")]
    Deserialization(serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl CdrError {
    /// Whether the error was caused by the submitted document or query rather than by the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CdrError::InvalidInput(_)
                | CdrError::SchemaMismatch(_)
                | CdrError::InvalidTimestamp(_)
                | CdrError::AmbiguousLocalTime(_)
                | CdrError::DuplicateTranslation(_)
                | CdrError::Ccda(_)
        )
    }
}

pub type CdrResult<T> = std::result::Result<T, CdrError>;
