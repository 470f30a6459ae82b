//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into core services. Core
//! code never reads process-wide environment variables while handling requests; the binaries read
//! them and hand the raw values to the `*_from_env_value` helpers below.

use crate::constants::{DEFAULT_GC_BATCH_SIZE, DEFAULT_PROGRESS_INTERVAL_SECS, SQLITE_EXTENSIONS};
use crate::{CdrError, CdrResult};
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, Offset, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Zone assumed for timestamps that carry no offset of their own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LocalZone {
    /// The host's zone, DST rules included.
    #[default]
    System,
    /// A fixed UTC offset.
    Fixed(FixedOffset),
}

impl LocalZone {
    /// Interpret a wall-clock time in this zone and convert it to UTC.
    ///
    /// # Errors
    ///
    /// Returns [`CdrError::AmbiguousLocalTime`] when the wall-clock time falls in a DST gap or
    /// overlap of the system zone.
    pub fn to_utc(&self, naive: NaiveDateTime) -> CdrResult<DateTime<Utc>> {
        let resolved = match self {
            LocalZone::System => Local
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc)),
            LocalZone::Fixed(offset) => offset
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc)),
        };
        resolved.ok_or_else(|| CdrError::AmbiguousLocalTime(naive.to_string()))
    }
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    local_zone: LocalZone,
    data_file: Option<PathBuf>,
    gc_batch_size: usize,
    progress_interval: Duration,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`CdrError::InvalidInput`] if `gc_batch_size` is zero.
    pub fn new(
        local_zone: LocalZone,
        data_file: Option<PathBuf>,
        gc_batch_size: usize,
        progress_interval: Duration,
    ) -> CdrResult<Self> {
        if gc_batch_size == 0 {
            return Err(CdrError::InvalidInput(
                "gc_batch_size must be greater than zero".into(),
            ));
        }

        Ok(Self {
            local_zone,
            data_file,
            gc_batch_size,
            progress_interval,
        })
    }

    /// Purely in-memory configuration with the given zone and default batch settings.
    pub fn in_memory(local_zone: LocalZone) -> Self {
        Self {
            local_zone,
            data_file: None,
            gc_batch_size: DEFAULT_GC_BATCH_SIZE,
            progress_interval: Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS),
        }
    }

    pub fn local_zone(&self) -> LocalZone {
        self.local_zone
    }

    pub fn data_file(&self) -> Option<&Path> {
        self.data_file.as_deref()
    }

    /// Whether the data file names a SQLite database rather than a JSON snapshot.
    pub fn uses_sqlite(&self) -> bool {
        self.data_file
            .as_deref()
            .and_then(Path::extension)
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                SQLITE_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
    }

    pub fn gc_batch_size(&self) -> usize {
        self.gc_batch_size
    }

    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }
}

/// Parse the local zone from an optional configuration value.
///
/// `None`, empty/whitespace and `system` select the host zone. `UTC`/`Z` select UTC. Offsets are
/// accepted as `+HH:MM`, `-HH:MM`, `+HHMM` or `-HHMM`.
pub fn local_zone_from_env_value(value: Option<String>) -> CdrResult<LocalZone> {
    let value = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let Some(value) = value else {
        return Ok(LocalZone::System);
    };

    if value.eq_ignore_ascii_case("system") {
        return Ok(LocalZone::System);
    }
    if value.eq_ignore_ascii_case("utc") || value.eq_ignore_ascii_case("z") {
        return Ok(LocalZone::Fixed(Utc.fix()));
    }

    parse_offset(&value)
        .map(LocalZone::Fixed)
        .ok_or_else(|| CdrError::InvalidInput(format!("unrecognised local timezone {value:?}")))
}

/// Parse the garbage-collection batch size from an optional configuration value.
///
/// If `value` is `None` or empty/whitespace, returns [`DEFAULT_GC_BATCH_SIZE`].
pub fn gc_batch_size_from_env_value(value: Option<String>) -> CdrResult<usize> {
    let value = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let Some(value) = value else {
        return Ok(DEFAULT_GC_BATCH_SIZE);
    };

    match value.parse::<usize>() {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(CdrError::InvalidInput(format!(
            "gc batch size must be a positive integer, got {value:?}"
        ))),
    }
}

/// Parse the data file location from an optional configuration value.
pub fn data_file_from_env_value(value: Option<String>) -> Option<PathBuf> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Parse a `±HH:MM` or `±HHMM` offset.
pub(crate) fn parse_offset(value: &str) -> Option<FixedOffset> {
    let (sign, rest) = match value.as_bytes().first()? {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
