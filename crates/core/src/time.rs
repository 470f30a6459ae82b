//! Timestamp parsing and the effective-time resolver.
//!
//! Documents carry HL7 TS values (`20121011000000-0400`) while request envelopes carry ISO 8601
//! strings. Both are normalised to `DateTime<Utc>`; values without an offset are read in the
//! configured [`LocalZone`].

use crate::config::{parse_offset, LocalZone};
use crate::{CdrError, CdrResult};
use ccda::EffectiveTimeRange;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

const NAIVE_ISO_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
const OFFSET_ISO_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// Parse an HL7 TS or ISO 8601 timestamp into UTC.
///
/// # Errors
///
/// - [`CdrError::InvalidTimestamp`] if the value matches none of the accepted forms
/// - [`CdrError::AmbiguousLocalTime`] if the value has no offset and its wall-clock time does not
///   map to exactly one instant in `zone`
pub fn parse_datetime(value: &str, zone: &LocalZone) -> CdrResult<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return Err(invalid(value));
    }

    if let Some(parsed) = parse_hl7(value, zone) {
        return parsed;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in OFFSET_ISO_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(value, format) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    for format in NAIVE_ISO_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return zone.to_utc(naive);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return zone.to_utc(date.and_time(NaiveTime::MIN));
    }

    Err(invalid(value))
}

/// Pick the authoritative timestamp of an effective-time range.
///
/// `low` wins over `high`; neither present is `Ok(None)`. A present but malformed value is an
/// error rather than a missing date.
pub fn resolve_effective_time(
    range: Option<&EffectiveTimeRange>,
    zone: &LocalZone,
) -> CdrResult<Option<DateTime<Utc>>> {
    let Some(range) = range else {
        return Ok(None);
    };
    match range.low.as_deref().or(range.high.as_deref()) {
        Some(value) => parse_datetime(value, zone).map(Some),
        None => Ok(None),
    }
}

/// Parse an optional timestamp, treating `None` as absent.
pub fn parse_optional(value: Option<&str>, zone: &LocalZone) -> CdrResult<Option<DateTime<Utc>>> {
    value.map(|v| parse_datetime(v, zone)).transpose()
}

fn invalid(value: &str) -> CdrError {
    CdrError::InvalidTimestamp(value.to_string())
}

/// HL7 TS: `YYYYMMDD[HHMM[SS[.fff]]][±HHMM]`.
///
/// Returns `None` when the value does not start like an HL7 TS, so ISO parsing can be tried.
fn parse_hl7(value: &str, zone: &LocalZone) -> Option<CdrResult<DateTime<Utc>>> {
    let bytes = value.as_bytes();
    if bytes.len() < 8 || !bytes[..8].iter().all(u8::is_ascii_digit) {
        return None;
    }
    if bytes.get(8).is_some_and(|b| !b.is_ascii_digit() && !b"+-.".contains(b)) {
        return None;
    }

    let (body, offset) = match value[8..].find(|c| c == '+' || c == '-') {
        Some(idx) => (&value[..8 + idx], Some(&value[8 + idx..])),
        None => (value, None),
    };

    let Some(naive) = parse_hl7_body(body) else {
        return Some(Err(invalid(value)));
    };

    Some(match offset {
        Some(offset) => parse_offset(offset)
            .and_then(|offset| offset.from_local_datetime(&naive).single())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| invalid(value)),
        None => zone.to_utc(naive),
    })
}

fn parse_hl7_body(body: &str) -> Option<NaiveDateTime> {
    let (digits, fraction) = match body.split_once('.') {
        Some((digits, fraction)) => (digits, Some(fraction)),
        None => (body, None),
    };
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let field = |range: std::ops::Range<usize>| -> Option<u32> { digits.get(range)?.parse().ok() };
    let date = NaiveDate::from_ymd_opt(digits.get(0..4)?.parse().ok()?, field(4..6)?, field(6..8)?)?;

    let (hour, minute, second) = match digits.len() {
        8 => (0, 0, 0),
        12 => (field(8..10)?, field(10..12)?, 0),
        14 => (field(8..10)?, field(10..12)?, field(12..14)?),
        _ => return None,
    };

    let nanos = match fraction {
        None => 0,
        Some(fraction) => {
            if digits.len() != 14
                || fraction.is_empty()
                || !fraction.bytes().all(|b| b.is_ascii_digit())
            {
                return None;
            }
            let mut padded: String = fraction.chars().take(9).collect();
            while padded.len() < 9 {
                padded.push('0');
            }
            padded.parse().ok()?
        }
    };

    NaiveTime::from_hms_nano_opt(hour, minute, second, nanos).map(|time| date.and_time(time))
}
