//! `Retry-After` header parsing
//!
//! The header is either a number of seconds or an HTTP-date. Both forms are
//! converted to a delay in milliseconds relative to `now`.

use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid Retry-After value: {0:?}")]
pub struct RetryAfterParseError(pub String);

/// Parses a `Retry-After` header value into milliseconds.
///
/// Dates in the past yield `0`.
pub fn parse_retry_after_header(
    value: &str,
    now: SystemTime,
) -> Result<u64, RetryAfterParseError> {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Ok(seconds.saturating_mul(1000));
    }

    let date = parse_http_date(value).ok_or_else(|| RetryAfterParseError(value.to_owned()))?;
    let now: DateTime<Utc> = now.into();

    Ok(u64::try_from((date - now).num_milliseconds()).unwrap_or(0))
}

/// Obsolete HTTP-date forms: RFC 850 and asctime.
const OBSOLETE_DATE_FORMATS: [&str; 2] = ["%A, %d-%b-%y %T GMT", "%a %b %e %T %Y"];

/// IMF-fixdate (via RFC 2822), then the obsolete forms, all read as UTC.
fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    OBSOLETE_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}
