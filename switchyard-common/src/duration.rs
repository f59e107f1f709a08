//! Time settings written either as plain seconds or with a unit suffix.
//!
//! `300`, `"300s"`, `"5m"`, `"2h"`, `"5d"` and `"1w"` are all accepted.

use std::time::Duration;

use serde::{Deserializer, Serializer, de};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("empty time value")]
    Empty,

    #[error("bad time value {0:?}")]
    Malformed(String),

    #[error("unknown time unit {unit:?} in {value:?}")]
    UnknownUnit { value: String, unit: char },

    #[error("time value {0:?} is out of range")]
    Overflow(String),
}

/// Parse a time value with an optional single-letter unit (default seconds).
pub fn parse(value: &str) -> Result<Duration, DurationError> {
    let trimmed = value.trim();
    let Some(last) = trimmed.chars().last() else {
        return Err(DurationError::Empty);
    };

    let (number, multiplier) = if last.is_ascii_digit() {
        (trimmed, 1)
    } else {
        let multiplier = match last {
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            'd' => 24 * 60 * 60,
            'w' => 7 * 24 * 60 * 60,
            unit => {
                return Err(DurationError::UnknownUnit {
                    value: value.to_string(),
                    unit,
                });
            }
        };
        (&trimmed[..trimmed.len() - last.len_utf8()], multiplier)
    };

    let count: u64 = number
        .trim()
        .parse()
        .map_err(|_| DurationError::Malformed(value.to_string()))?;

    count
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| DurationError::Overflow(value.to_string()))
}

/// Format with the largest unit that divides the value exactly.
#[must_use]
pub fn format(duration: Duration) -> String {
    let secs = duration.as_secs();
    for (unit, size) in [('w', 604_800), ('d', 86_400), ('h', 3_600), ('m', 60)] {
        if secs != 0 && secs % size == 0 {
            return format!("{}{unit}", secs / size);
        }
    }
    format!("{secs}s")
}

struct DurationVisitor;

impl de::Visitor<'_> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a number of seconds or a string such as \"300s\" or \"5d\"")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
        Ok(Duration::from_secs(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
        u64::try_from(value)
            .map(Duration::from_secs)
            .map_err(|_| E::custom(format!("negative time value {value}")))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
        parse(value).map_err(E::custom)
    }
}

/// `#[serde(with = "switchyard_common::duration")]`
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    deserializer.deserialize_any(DurationVisitor)
}

pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format(*duration))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse("300"), Ok(Duration::from_secs(300)));
        assert_eq!(parse("300s"), Ok(Duration::from_secs(300)));
        assert_eq!(parse("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse("2h"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse("5d"), Ok(Duration::from_secs(432_000)));
        assert_eq!(parse("1w"), Ok(Duration::from_secs(604_800)));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse(""), Err(DurationError::Empty));
        assert_eq!(parse("s"), Err(DurationError::Malformed("s".to_string())));
        assert_eq!(
            parse("5y"),
            Err(DurationError::UnknownUnit {
                value: "5y".to_string(),
                unit: 'y'
            })
        );
        assert!(matches!(
            parse("99999999999999999999w"),
            Err(DurationError::Malformed(_))
        ));
        assert!(matches!(
            parse("9999999999999999999w"),
            Err(DurationError::Overflow(_))
        ));
    }

    #[test]
    fn test_format() {
        assert_eq!(format(Duration::from_secs(300)), "5m");
        assert_eq!(format(Duration::from_secs(432_000)), "5d");
        assert_eq!(format(Duration::from_secs(61)), "61s");
        assert_eq!(format(Duration::ZERO), "0s");
    }

    #[test]
    fn test_deserialize_from_ron() {
        #[derive(Deserialize)]
        struct Settings {
            #[serde(with = "crate::duration")]
            first: Duration,
            #[serde(with = "crate::duration")]
            second: Duration,
        }

        let settings: Settings = ron::from_str(r#"(first: 60, second: "4000s")"#).unwrap();
        assert_eq!(settings.first, Duration::from_secs(60));
        assert_eq!(settings.second, Duration::from_secs(4000));
    }
}
