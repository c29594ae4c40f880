//! Small shared helpers: Go-style duration strings and SQL identifier checks.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serializer};

use crate::errors::{ExportError, ExportResult};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));

/// Parses `"15s"`, `"1m30s"`, `"500ms"`, `"1.5h"` or a plain number of seconds.
pub fn parse_duration(input: &str) -> ExportResult<Duration> {
    let raw = input.trim();
    let invalid = || ExportError::validation(format!("invalid duration \"{}\"", input));
    if raw.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = raw.parse::<f64>() {
        return seconds_to_duration(secs).ok_or_else(invalid);
    }

    let mut total_nanos = 0f64;
    let mut rest = raw;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_end == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_end].parse().map_err(|_| invalid())?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_end..];
        total_nanos += value * scale;
    }

    if !total_nanos.is_finite() || total_nanos < 0.0 || total_nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

fn seconds_to_duration(secs: f64) -> Option<Duration> {
    if secs.is_finite() && secs >= 0.0 && secs < u64::MAX as f64 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// Inverse of [`parse_duration`] for whole and fractional units.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{}ns", nanos);
    }
    if nanos < 1_000_000 {
        return format!("{}us", with_fraction(nanos, 1_000));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", with_fraction(nanos, 1_000_000));
    }

    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs_nanos = u128::from(total_secs % 60) * 1_000_000_000 + u128::from(d.subsec_nanos());
    let secs = with_fraction(secs_nanos, 1_000_000_000);
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

fn with_fraction(value: u128, unit: u128) -> String {
    let whole = value / unit;
    let frac = value % unit;
    if frac == 0 {
        return whole.to_string();
    }
    let width = unit.to_string().len() - 1;
    let digits = format!("{:0width$}", frac, width = width);
    format!("{}.{}", whole, digits.trim_end_matches('0'))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Text(String),
    Seconds(f64),
}

impl DurationRepr {
    fn into_duration(self) -> ExportResult<Duration> {
        match self {
            DurationRepr::Text(text) => parse_duration(&text),
            DurationRepr::Seconds(secs) => seconds_to_duration(secs)
                .ok_or_else(|| ExportError::validation(format!("invalid duration {}", secs))),
        }
    }
}

/// Serde adapter for `Duration` fields: written as `"1m30s"`, read from a string or seconds.
pub mod duration_serde {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        DurationRepr::deserialize(deserializer)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }
}

/// Same as [`duration_serde`] for `Option<Duration>`.
pub mod option_duration_serde {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<DurationRepr>::deserialize(deserializer)?
            .map(DurationRepr::into_duration)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

/// Rejects anything that is not a plain SQL identifier.
pub fn validate_identifier(identifier: &str) -> ExportResult<&str> {
    if IDENTIFIER.is_match(identifier) {
        Ok(identifier)
    } else {
        Err(ExportError::validation(format!(
            "invalid identifier \"{}\"",
            identifier
        )))
    }
}

/// Double-quoted SQL identifier with embedded quotes escaped.
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_go_style_durations() {
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("0.25").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn rejects_malformed_durations() {
        for bad in ["", "abc", "10x", "s", "-5", "1h-2m"] {
            assert!(parse_duration(bad).is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_secs(15)), "15s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h0m0s");
        let d = Duration::from_millis(3_723_250);
        assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
    }

    #[test]
    fn duration_serde_accepts_string_or_number() {
        #[derive(Deserialize)]
        struct Wrapped {
            #[serde(default, with = "option_duration_serde")]
            d: Option<Duration>,
        }
        let a: Wrapped = serde_json::from_str(r#"{"d":"15s"}"#).unwrap();
        let b: Wrapped = serde_json::from_str(r#"{"d":15}"#).unwrap();
        let c: Wrapped = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(a.d, Some(Duration::from_secs(15)));
        assert_eq!(b.d, Some(Duration::from_secs(15)));
        assert_eq!(c.d, None);
        assert!(serde_json::from_str::<Wrapped>(r#"{"d":"soon"}"#).is_err());
    }

    #[test]
    fn identifiers() {
        assert!(validate_identifier("users_2024").is_ok());
        assert!(validate_identifier("_x").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("name; drop").is_err());
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }
}
