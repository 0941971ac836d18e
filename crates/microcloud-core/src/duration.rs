//! Human-readable duration parsing.
//!
//! Session timeouts arrive as strings like `"10m"`, `"5s"` or `"1m30s"`
//! (the `?timeout=` query and the `lookupTimeout` frame field). Supported
//! units are `ms`, `s`, `m` and `h`; units may be concatenated in
//! descending order of magnitude.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("Empty duration")]
    Empty,
    #[error("Invalid duration {0:?}")]
    Invalid(String),
}

/// Parse a duration string such as `"10m"`, `"50ms"` or `"1h30m"`.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    if input.is_empty() {
        return Err(DurationError::Empty);
    }

    let invalid = || DurationError::Invalid(input.to_string());

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            return Err(invalid());
        }

        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let (part, len) = if rest.starts_with("ms") {
            (Duration::from_millis(value), 2)
        } else if rest.starts_with('s') {
            (Duration::from_secs(value), 1)
        } else if rest.starts_with('m') {
            (Duration::from_secs(value.checked_mul(60).ok_or_else(invalid)?), 1)
        } else if rest.starts_with('h') {
            (Duration::from_secs(value.checked_mul(3600).ok_or_else(invalid)?), 1)
        } else {
            return Err(invalid());
        };
        rest = &rest[len..];

        total = total.checked_add(part).ok_or_else(invalid)?;
    }

    Ok(total)
}
