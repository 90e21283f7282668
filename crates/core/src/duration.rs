//! Duration strings such as `1h30m`, `90s` or `250ms`.
//!
//! `humantime` does the parsing and formatting. On top of it, values may carry a
//! fraction (`1.5s`), `0` stands alone without a unit, and negative values are refused.

use std::fmt;
use std::time::Duration;

use serde::de::{self, IntoDeserializer};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,
    #[error("negative duration {0:?} is not allowed")]
    Negative(String),
    #[error("invalid duration {0:?}")]
    Invalid(String),
    #[error("invalid duration {input:?}: {source}")]
    Unparsable {
        input: String,
        #[source]
        source: humantime::DurationError,
    },
}

/// Parse a duration string. `0` is accepted on its own; everything else needs a unit.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let s = input.trim();
    prepass(s).unwrap_or_else(|| {
        humantime::parse_duration(s).map_err(|source| DurationError::Unparsable { input: input.to_string(), source })
    })
}

/// Inputs humantime does not take. `None` hands the string to humantime unchanged.
fn prepass(s: &str) -> Option<Result<Duration, DurationError>> {
    if s.is_empty() {
        return Some(Err(DurationError::Empty));
    }
    if let Some(rest) = s.strip_prefix('-') {
        return Some(match parse_duration(rest) {
            Ok(d) if d.is_zero() => Ok(Duration::ZERO),
            _ => Err(DurationError::Negative(s.to_string())),
        });
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Some(Ok(Duration::ZERO));
    }
    if s.contains('.') {
        return Some(fractional(s));
    }
    None
}

/// Sum of `<number><unit>` terms where numbers may be fractional; humantime prices each unit.
fn fractional(s: &str) -> Result<Duration, DurationError> {
    let invalid = || DurationError::Invalid(s.to_string());
    let mut total = Duration::ZERO;
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        let num_len = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
        let value: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        rest = rest[num_len..].trim_start();
        let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.' || c.is_whitespace()).unwrap_or(rest.len());
        if unit_len == 0 {
            return Err(invalid());
        }
        let unit = humantime::parse_duration(&format!("1{}", &rest[..unit_len]))
            .map_err(|source| DurationError::Unparsable { input: s.to_string(), source })?;
        let term = Duration::try_from_secs_f64(unit.as_secs_f64() * value).map_err(|_| invalid())?;
        total = total.checked_add(term).ok_or_else(invalid)?;
        rest = rest[unit_len..].trim_start();
    }
    Ok(total)
}

/// Render a duration for messages and serialization, e.g. `1h 30m`, `1s 500ms`.
pub fn format_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

/// A non-negative timeout carried as a duration string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timeout(pub Duration);

impl Timeout {
    pub fn from_secs(secs: u64) -> Self { Timeout(Duration::from_secs(secs)) }
    pub fn duration(self) -> Duration { self.0 }
    /// A zero timeout disables the deadline.
    pub fn is_disabled(self) -> bool { self.0.is_zero() }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self { Timeout(d) }
}

impl std::str::FromStr for Timeout {
    type Err = DurationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { parse_duration(s).map(Timeout) }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&format_duration(self.0)) }
}

impl Serialize for Timeout {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        humantime_serde::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Timeout {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let s = raw.trim();
        match prepass(s) {
            Some(parsed) => parsed.map(Timeout).map_err(de::Error::custom),
            None => {
                let text: de::value::StrDeserializer<'_, D::Error> = s.into_deserializer();
                humantime_serde::deserialize(text).map(Timeout)
            }
        }
    }
}
