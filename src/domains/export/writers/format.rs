//! Type-aware value coercion shared by every renderer.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::domains::export::types::{Column, ColumnType, FormatOptions, Value};
use crate::errors::{ExportError, ExportResult};

static OFFSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([+-])(\d{2}):?(\d{2})?$").expect("offset pattern")
});

const DATETIME_LAYOUTS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Parses `UTC`, `Z` or a fixed offset (`+02:00`, `-0530`, `+02`).
/// Empty input means "leave offsets as they are".
pub fn parse_timezone(raw: &str) -> ExportResult<Option<FixedOffset>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if raw.eq_ignore_ascii_case("utc") || raw == "Z" {
        return Ok(FixedOffset::east_opt(0));
    }
    let invalid = || ExportError::validation(format!("unsupported timezone: {}", raw));
    let caps = OFFSET.captures(raw).ok_or_else(invalid)?;
    let hours: i32 = caps[2].parse().map_err(|_| invalid())?;
    let minutes: i32 = caps.get(3).map(|m| m.as_str().parse::<i32>()).transpose().map_err(|_| invalid())?.unwrap_or(0);
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    let seconds = (hours * 3600 + minutes * 60) * if &caps[1] == "-" { -1 } else { 1 };
    FixedOffset::east_opt(seconds).map(Some).ok_or_else(invalid)
}

/// A value after coercion to its column type
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(DateTime<FixedOffset>),
    Time(NaiveTime),
}

impl Cell {
    pub fn to_text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Bool(b) => b.to_string(),
            Cell::Int(i) => i.to_string(),
            Cell::Float(f) => f.to_string(),
            Cell::Text(s) => s.clone(),
            Cell::Date(d) => d.format("%Y-%m-%d").to_string(),
            Cell::DateTime(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            Cell::Time(t) => t.format("%H:%M:%S").to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Cell::Empty => serde_json::Value::Null,
            Cell::Bool(b) => serde_json::Value::Bool(*b),
            Cell::Int(i) => serde_json::Value::from(*i),
            Cell::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            other => serde_json::Value::String(other.to_text()),
        }
    }
}

/// Coerces raw values to their declared column type, applying the
/// configured timezone to every time value.
#[derive(Debug, Clone, Default)]
pub struct ValueFormatter {
    timezone: Option<FixedOffset>,
}

impl ValueFormatter {
    pub fn new(options: &FormatOptions) -> ExportResult<Self> {
        let timezone = match &options.timezone {
            Some(tz) => parse_timezone(tz)?,
            None => None,
        };
        Ok(Self { timezone })
    }

    pub fn timezone(&self) -> Option<FixedOffset> {
        self.timezone
    }

    pub fn coerce(&self, column: &Column, value: &Value) -> ExportResult<Cell> {
        if value.is_null() {
            return Ok(Cell::Empty);
        }
        if column.kind != ColumnType::String {
            if let Value::String(s) = value {
                if s.trim().is_empty() {
                    return Ok(Cell::Empty);
                }
            }
        }
        let mismatch = || {
            ExportError::validation(format!(
                "column {}: cannot convert {:?} to {}",
                column.name,
                value.to_string(),
                column.kind.as_str()
            ))
        };

        let cell = match column.kind {
            ColumnType::String => match value {
                Value::String(s) => Cell::Text(s.clone()),
                Value::DateTime(dt) => Cell::Text(self.localize(*dt).to_rfc3339_opts(SecondsFormat::AutoSi, true)),
                other => Cell::Text(other.to_string()),
            },
            ColumnType::Bool => match value {
                Value::Bool(b) => Cell::Bool(*b),
                Value::Int(0) => Cell::Bool(false),
                Value::Int(1) => Cell::Bool(true),
                Value::String(s) => Cell::Bool(parse_bool(s.trim()).ok_or_else(mismatch)?),
                _ => return Err(mismatch()),
            },
            ColumnType::Int => match value {
                Value::Int(i) => Cell::Int(*i),
                Value::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Cell::Int(*f as i64),
                Value::Bool(b) => Cell::Int(i64::from(*b)),
                Value::String(s) => Cell::Int(s.trim().parse().map_err(|_| mismatch())?),
                _ => return Err(mismatch()),
            },
            ColumnType::Float => match value {
                Value::Float(f) => Cell::Float(*f),
                Value::Int(i) => Cell::Float(*i as f64),
                Value::String(s) => Cell::Float(s.trim().parse().map_err(|_| mismatch())?),
                _ => return Err(mismatch()),
            },
            ColumnType::Date => match value {
                Value::Date(d) => Cell::Date(*d),
                Value::DateTime(dt) => Cell::Date(self.localize(*dt).date_naive()),
                Value::String(s) => match parse_datetime(s.trim()) {
                    Some(Parsed::Date(d)) => Cell::Date(d),
                    Some(Parsed::DateTime(dt)) => Cell::Date(self.localize(dt).date_naive()),
                    _ => return Err(mismatch()),
                },
                _ => return Err(mismatch()),
            },
            ColumnType::Datetime => match value {
                Value::DateTime(dt) => Cell::DateTime(self.localize(*dt)),
                Value::Date(d) => Cell::DateTime(self.localize(midnight_utc(*d))),
                Value::String(s) => match parse_datetime(s.trim()) {
                    Some(Parsed::DateTime(dt)) => Cell::DateTime(self.localize(dt)),
                    Some(Parsed::Date(d)) => Cell::DateTime(self.localize(midnight_utc(d))),
                    _ => return Err(mismatch()),
                },
                _ => return Err(mismatch()),
            },
            ColumnType::Time => match value {
                Value::Time(t) => Cell::Time(*t),
                Value::DateTime(dt) => Cell::Time(self.localize(*dt).time()),
                Value::String(s) => match parse_datetime(s.trim()) {
                    Some(Parsed::Time(t)) => Cell::Time(t),
                    Some(Parsed::DateTime(dt)) => Cell::Time(self.localize(dt).time()),
                    _ => return Err(mismatch()),
                },
                _ => return Err(mismatch()),
            },
        };
        Ok(cell)
    }

    /// Coerces a whole row against `columns`.
    pub fn coerce_row(&self, columns: &[Column], row: &[Value]) -> ExportResult<Vec<Cell>> {
        columns
            .iter()
            .zip(row)
            .map(|(column, value)| self.coerce(column, value))
            .collect()
    }

    fn localize(&self, dt: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        match self.timezone {
            Some(tz) => dt.with_timezone(&tz),
            None => dt,
        }
    }
}

/// Escapes text for XML and HTML bodies, dropping characters XML 1.0 cannot carry.
pub(crate) fn escape_markup(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '\t' | '\n' | '\r' => out.push(c),
            c if (c as u32) < 0x20 => {}
            c => out.push(c),
        }
    }
    out
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn midnight_utc(date: NaiveDate) -> DateTime<FixedOffset> {
    date.and_time(NaiveTime::MIN).and_utc().fixed_offset()
}

enum Parsed {
    Date(NaiveDate),
    DateTime(DateTime<FixedOffset>),
    Time(NaiveTime),
}

/// Accepts RFC 3339, `YYYY-MM-DD[ T]HH:MM:SS` (read as UTC), `YYYY-MM-DD` and `HH:MM:SS`.
fn parse_datetime(raw: &str) -> Option<Parsed> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(Parsed::DateTime(dt));
    }
    for layout in DATETIME_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
            return Some(Parsed::DateTime(naive.and_utc().fixed_offset()));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(Parsed::Date(date));
    }
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .ok()
        .map(|t| Parsed::Time(t.with_nanosecond(0).unwrap_or(t)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn formatter(tz: Option<&str>) -> ValueFormatter {
        ValueFormatter::new(&FormatOptions {
            timezone: tz.map(str::to_string),
            locale: None,
        })
        .unwrap()
    }

    #[test]
    fn parses_fixed_offsets() {
        assert_eq!(parse_timezone("UTC").unwrap(), FixedOffset::east_opt(0));
        assert_eq!(parse_timezone("+02:00").unwrap(), FixedOffset::east_opt(7200));
        assert_eq!(parse_timezone("-0530").unwrap(), FixedOffset::west_opt(19800));
        assert_eq!(parse_timezone("").unwrap(), None);
        assert!(parse_timezone("Europe/Paris").is_err());
    }

    #[test]
    fn coerces_numeric_strings() {
        let f = formatter(None);
        let int = Column::new("n", ColumnType::Int);
        assert_eq!(f.coerce(&int, &Value::from(" 42 ")).unwrap(), Cell::Int(42));
        assert_eq!(f.coerce(&int, &Value::from("")).unwrap(), Cell::Empty);
        let float = Column::new("x", ColumnType::Float);
        assert_eq!(f.coerce(&float, &Value::Int(3)).unwrap(), Cell::Float(3.0));
        let flag = Column::new("b", ColumnType::Bool);
        assert_eq!(f.coerce(&flag, &Value::from("TRUE")).unwrap(), Cell::Bool(true));
    }

    #[test]
    fn failed_coercion_names_column() {
        let err = formatter(None)
            .coerce(&Column::new("age", ColumnType::Int), &Value::from("old"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.message().contains("age"));
    }

    #[test]
    fn parses_time_layouts() {
        let f = formatter(None);
        let dt = Column::new("at", ColumnType::Datetime);
        assert_eq!(
            f.coerce(&dt, &Value::from("2024-03-01 10:00:00")).unwrap().to_text(),
            "2024-03-01T10:00:00Z"
        );
        assert_eq!(
            f.coerce(&dt, &Value::from("2024-03-01T10:00:00.5+01:00")).unwrap().to_text(),
            "2024-03-01T10:00:00.500+01:00"
        );
        let date = Column::new("d", ColumnType::Date);
        assert_eq!(f.coerce(&date, &Value::from("2024-03-01")).unwrap(), Cell::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()));
        let time = Column::new("t", ColumnType::Time);
        assert_eq!(f.coerce(&time, &Value::from("08:30:00")).unwrap().to_text(), "08:30:00");
    }

    #[test]
    fn applies_timezone() {
        let f = formatter(Some("+02:00"));
        let dt = Column::new("at", ColumnType::Datetime);
        assert_eq!(
            f.coerce(&dt, &Value::from("2024-03-01T23:30:00Z")).unwrap().to_text(),
            "2024-03-02T01:30:00+02:00"
        );
        let date = Column::new("d", ColumnType::Date);
        assert_eq!(f.coerce(&date, &Value::from("2024-03-01T23:30:00Z")).unwrap().to_text(), "2024-03-02");
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_markup("<a href=\"x\">&'</a>\u{1}"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;&lt;/a&gt;");
    }

    #[test]
    fn json_cells() {
        assert_eq!(Cell::Float(f64::NAN).to_json(), serde_json::Value::Null);
        assert_eq!(Cell::Int(5).to_json(), serde_json::json!(5));
        assert_eq!(Cell::Text("a".into()).to_json(), serde_json::json!("a"));
    }
}
