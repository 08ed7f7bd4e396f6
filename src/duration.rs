//! Duration string parsing and formatting.
//!
//! Configuration durations are written as `<number><unit>`, e.g. `"30s"`,
//! `"1min"`, `"1.5h"`. A bare number is interpreted as seconds.

use std::time::Duration;

use thiserror::Error;

/// Suffix to nanoseconds multiplier (order matters: longer suffixes first,
/// so "ms" is not consumed as "m"+"s" and "min" wins over "m").
const UNITS: &[(&str, f64)] = &[
    ("days", 86_400e9),
    ("d", 86_400e9),
    ("hours", 3_600e9),
    ("h", 3_600e9),
    ("minutes", 60e9),
    ("min", 60e9),
    ("milliseconds", 1e6),
    ("ms", 1e6),
    ("microseconds", 1e3),
    ("µs", 1e3),
    ("us", 1e3),
    ("nanoseconds", 1.0),
    ("ns", 1.0),
    ("seconds", 1e9),
    ("s", 1e9),
];

/// Error parsing a duration string.
#[derive(Debug, Error)]
#[error("invalid duration {input:?}: {reason}")]
pub struct DurationParseError {
    input: String,
    reason: String,
}

impl DurationParseError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Parse duration strings like `"29.99s"`, `"1min"`, `"2h"`, `"500ms"`.
///
/// A string without a unit suffix is interpreted as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, DurationParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(DurationParseError::new(s, "empty string"));
    }

    let (value_str, multiplier) = match UNITS
        .iter()
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|v| (v, *mult)))
    {
        Some((v, mult)) => (v.trim(), mult),
        // No unit: bare seconds.
        None => (s, 1e9),
    };

    let value: f64 = value_str
        .parse()
        .map_err(|e| DurationParseError::new(s, format!("bad number {value_str:?}: {e}")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(DurationParseError::new(
            s,
            "must be a finite, non-negative number",
        ));
    }

    Ok(Duration::from_nanos((value * multiplier) as u64))
}

/// Format a duration for display in log and report messages.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        "0s".to_string()
    } else if nanos < 1_000 {
        format!("{}ns", nanos)
    } else if nanos < 1_000_000 {
        format!("{:.2}µs", nanos as f64 / 1_000.0)
    } else if nanos < 1_000_000_000 {
        format!("{:.2}ms", nanos as f64 / 1_000_000.0)
    } else if nanos < 60_000_000_000 {
        let secs = d.as_secs_f64();
        if secs.fract() == 0.0 {
            format!("{}s", secs as u64)
        } else {
            format!("{:.2}s", secs)
        }
    } else {
        let secs = d.as_secs();
        let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        match (h, s) {
            (0, 0) => format!("{m}min"),
            (0, _) => format!("{m}min {s}s"),
            (_, 0) if m == 0 => format!("{h}h"),
            _ => format!("{h}h {m}min {s}s"),
        }
    }
}

/// Serde adapter for `Option<Duration>` fields holding duration strings.
///
/// Usage: `#[serde(default, with = "duration::optional")]`.
pub mod optional {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }

    pub fn serialize<S>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Canonical form: fractional seconds. Round-trips through
        // parse_duration and keeps config fingerprints deterministic.
        match d {
            Some(d) => serializer.serialize_some(&format!("{}s", d.as_secs_f64())),
            None => serializer.serialize_none(),
        }
    }
}

/// Serde adapter for non-optional `Duration` fields holding duration strings.
///
/// Usage: `#[serde(with = "duration::exact")]`.
pub mod exact {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", d.as_secs_f64()))
    }
}
