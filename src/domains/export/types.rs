use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, SecondsFormat, Utc};
use mime::Mime;
use serde::{Deserialize, Serialize};

use crate::auth::{Actor, Scope};
use crate::errors::{ExportError, ExportResult};
use crate::utils::option_duration_serde;

/// Wire formats an export can be encoded in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Csv,
    Json,
    Ndjson,
    Xlsx,
    Sqlite,
    Template,
    Pdf,
}

impl Format {
    pub const DEFAULT_ALLOWED: [Format; 4] = [Format::Csv, Format::Json, Format::Ndjson, Format::Xlsx];

    /// Normalizes a requested format: lowercases, maps aliases, empty means csv.
    pub fn parse(raw: &str) -> ExportResult<Format> {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "" | "csv" => Ok(Format::Csv),
            "json" => Ok(Format::Json),
            "ndjson" | "jsonl" | "jsonlines" => Ok(Format::Ndjson),
            "xlsx" | "excel" | "xls" => Ok(Format::Xlsx),
            "sqlite" | "sqlite3" | "db" => Ok(Format::Sqlite),
            "template" | "html" => Ok(Format::Template),
            "pdf" => Ok(Format::Pdf),
            other => Err(ExportError::validation(format!("unsupported format: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Json => "json",
            Format::Ndjson => "ndjson",
            Format::Xlsx => "xlsx",
            Format::Sqlite => "sqlite",
            Format::Template => "template",
            Format::Pdf => "pdf",
        }
    }

    /// File extension used for filenames and artifact keys
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Template => "html",
            other => other.as_str(),
        }
    }

    pub fn content_type(&self) -> Mime {
        match self {
            Format::Csv => mime::TEXT_CSV_UTF_8,
            Format::Json => mime::APPLICATION_JSON,
            Format::Ndjson => "application/x-ndjson"
                .parse()
                .unwrap_or(mime::APPLICATION_OCTET_STREAM),
            Format::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
                .parse()
                .unwrap_or(mime::APPLICATION_OCTET_STREAM),
            Format::Sqlite => "application/vnd.sqlite3"
                .parse()
                .unwrap_or(mime::APPLICATION_OCTET_STREAM),
            Format::Template => mime::TEXT_HTML_UTF_8,
            Format::Pdf => mime::APPLICATION_PDF,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Definitions loaded from JSON may use the same aliases as requests.
impl<'de> Deserialize<'de> for Format {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Format::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Whether the artifact is streamed inline or persisted for later download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Sync,
    Async,
    #[default]
    Auto,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Sync => "sync",
            DeliveryMode::Async => "async",
            DeliveryMode::Auto => "auto",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    #[default]
    All,
    Ids,
    Query,
}

impl SelectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionMode::All => "all",
            SelectionMode::Ids => "ids",
            SelectionMode::Query => "query",
        }
    }
}

/// Reference to a named query understood by the row source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectionQuery {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Which rows of the dataset an export covers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Selection {
    /// `None` lets the definition decide
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SelectionMode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<SelectionQuery>,
}

impl Selection {
    pub fn all() -> Self {
        Self {
            mode: Some(SelectionMode::All),
            ..Default::default()
        }
    }

    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: Some(SelectionMode::Ids),
            ids: ids.into_iter().map(Into::into).collect(),
            query: None,
        }
    }

    pub fn effective_mode(&self) -> SelectionMode {
        self.mode.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonMode {
    #[default]
    Array,
    Lines,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CsvOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<char>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_headers: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<JsonMode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateRenderOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_html_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct XlsxOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_headers: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalAssets {
    #[default]
    Allow,
    Block,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PdfMargins {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottom: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PdfOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<String>,
    #[serde(default)]
    pub margins: PdfMargins,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub print_background: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_assets: Option<ExternalAssets>,
}

/// Value formatting shared by every renderer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormatOptions {
    /// `UTC`, `Z` or a fixed offset such as `+02:00`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderOptions {
    #[serde(default)]
    pub csv: CsvOptions,
    #[serde(default)]
    pub json: JsonOptions,
    #[serde(default)]
    pub template: TemplateRenderOptions,
    #[serde(default)]
    pub xlsx: XlsxOptions,
    #[serde(default)]
    pub pdf: PdfOptions,
    #[serde(default)]
    pub format: FormatOptions,
}

/// High-level request describing what should be exported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportRequest {
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_variant: Option<String>,
    #[serde(default)]
    pub format: String,
    /// Opaque to the engine; decoded by the row source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<serde_json::Value>,
    #[serde(default)]
    pub selection: Selection,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_bytes: Option<u64>,
    #[serde(
        default,
        with = "option_duration_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub estimated_duration: Option<Duration>,
    #[serde(default)]
    pub render_options: RenderOptions,
}

impl ExportRequest {
    pub fn new(definition: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            definition: definition.into(),
            format: format.into(),
            ..Default::default()
        }
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = Some(delivery);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    #[default]
    String,
    Bool,
    Int,
    Float,
    Date,
    Datetime,
    Time,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Bool => "bool",
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Date => "date",
            ColumnType::Datetime => "datetime",
            ColumnType::Time => "time",
        }
    }
}

/// One column of a definition schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: ColumnType,
    /// Spreadsheet number format, e.g. `0.00%`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            label: None,
            kind,
            format: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::String)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Header text: label when set, otherwise the name.
    pub fn header(&self) -> &str {
        match &self.label {
            Some(label) if !label.is_empty() => label,
            _ => &self.name,
        }
    }
}

/// A single cell value produced by a row source
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Date(NaiveDate),
    DateTime(DateTime<FixedOffset>),
    Time(NaiveTime),
    Json(serde_json::Value),
}

/// Positionally aligned values; length equals the schema column count
pub type Row = Vec<Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Length of the plain-text form, used to estimate buffered bytes.
    pub fn text_len(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::String(s) => s.len(),
            other => other.to_string().len(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Date(_) | Value::DateTime(_) => 3,
            Value::Time(_) => 4,
            Value::String(_) => 5,
            Value::Json(_) => 6,
        }
    }

    /// Total order used by sorting: nulls first, then by kind, then by value.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.total_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Date(a), Value::DateTime(b)) => a.cmp(&b.date_naive()).then(Ordering::Less),
            (Value::DateTime(a), Value::Date(b)) => a.date_naive().cmp(b).then(Ordering::Greater),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Json(a), Value::Json(b)) => a.to_string().cmp(&b.to_string()),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(dt) => f.write_str(&dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Value::Time(t) => write!(f, "{}", t.format("%H:%M:%S")),
            Value::Json(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Value::Time(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v.fixed_offset())
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(v: DateTime<FixedOffset>) -> Self {
        Value::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::String(s),
            other => Value::Json(other),
        }
    }
}

/// Export lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportState {
    Queued,
    Running,
    Publishing,
    Completed,
    Failed,
    Canceled,
    Deleted,
}

impl ExportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportState::Queued => "queued",
            ExportState::Running => "running",
            ExportState::Publishing => "publishing",
            ExportState::Completed => "completed",
            ExportState::Failed => "failed",
            ExportState::Canceled => "canceled",
            ExportState::Deleted => "deleted",
        }
    }

    pub fn parse(raw: &str) -> ExportResult<ExportState> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(ExportState::Queued),
            "running" => Ok(ExportState::Running),
            "publishing" => Ok(ExportState::Publishing),
            "completed" => Ok(ExportState::Completed),
            "failed" => Ok(ExportState::Failed),
            "canceled" | "cancelled" => Ok(ExportState::Canceled),
            "deleted" => Ok(ExportState::Deleted),
            other => Err(ExportError::validation(format!("unknown state: {}", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExportState::Completed | ExportState::Failed | ExportState::Canceled | ExportState::Deleted
        )
    }

    /// States that count as a live export for idempotent resubmission.
    pub fn is_reusable(&self) -> bool {
        matches!(
            self,
            ExportState::Queued | ExportState::Running | ExportState::Publishing | ExportState::Completed
        )
    }

    fn order(&self) -> u8 {
        match self {
            ExportState::Queued => 0,
            ExportState::Running => 1,
            ExportState::Publishing => 2,
            ExportState::Completed | ExportState::Failed | ExportState::Canceled => 3,
            ExportState::Deleted => 4,
        }
    }

    /// Monotonic transition rule. Re-entering the same state is a no-op.
    pub fn can_transition_to(&self, next: ExportState) -> bool {
        if *self == next {
            return true;
        }
        if next == ExportState::Deleted {
            return *self != ExportState::Deleted;
        }
        !self.is_terminal() && next.order() > self.order()
    }
}

impl fmt::Display for ExportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub processed: u64,
    pub total: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub content_type: String,
    pub size: u64,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Storage key plus metadata of a persisted artifact
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: String,
    pub meta: ArtifactMeta,
}

/// Storage key convention for async artifacts.
pub fn artifact_key(id: &str, format: Format) -> String {
    format!("exports/{}.{}", id, format.extension())
}

/// Tracked lifecycle of a single export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub id: String,
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub format: Format,
    pub delivery: DeliveryMode,
    pub state: ExportState,
    pub actor_id: String,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub counts: Counts,
    #[serde(default)]
    pub bytes_written: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ExportRecord {
    /// Fresh queued record owned by `actor`.
    pub fn queued(
        id: impl Into<String>,
        definition: impl Into<String>,
        format: Format,
        delivery: DeliveryMode,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            definition: definition.into(),
            variant: None,
            format,
            delivery,
            state: ExportState::Queued,
            actor_id: actor.id.clone(),
            scope: actor.scope.clone(),
            counts: Counts::default(),
            bytes_written: 0,
            artifact: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            expires_at: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Sets `expires_at = created_at + ttl`; zero means no expiry.
    pub fn expire_after(&mut self, ttl: Duration) {
        self.expires_at = if ttl.is_zero() {
            None
        } else {
            chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|d| self.created_at.checked_add_signed(d))
        };
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if expires <= now)
    }
}

/// Filter for `History`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ExportState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn matches(&self, record: &ExportRecord) -> bool {
        if let Some(definition) = &self.definition {
            if &record.definition != definition {
                return false;
            }
        }
        if let Some(state) = self.state {
            if record.state != state {
                return false;
            }
        }
        if let Some(format) = self.format {
            if record.format != format {
                return false;
            }
        }
        if let Some(actor_id) = &self.actor_id {
            if &record.actor_id != actor_id {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.created_at > until {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_aliases_normalize() {
        assert_eq!(Format::parse("").unwrap(), Format::Csv);
        assert_eq!(Format::parse("Excel").unwrap(), Format::Xlsx);
        assert_eq!(Format::parse("xls").unwrap(), Format::Xlsx);
        assert_eq!(Format::parse("sqlite3").unwrap(), Format::Sqlite);
        assert_eq!(Format::parse("db").unwrap(), Format::Sqlite);
        assert_eq!(Format::parse("jsonl").unwrap(), Format::Ndjson);
        assert_eq!(Format::parse("html").unwrap(), Format::Template);
        assert!(Format::parse("parquet").is_err());
    }

    #[test]
    fn template_uses_html_extension() {
        assert_eq!(Format::Template.extension(), "html");
        assert_eq!(Format::Pdf.extension(), "pdf");
        assert_eq!(artifact_key("abc", Format::Template), "exports/abc.html");
    }

    #[test]
    fn state_transitions_are_monotonic() {
        use ExportState::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Publishing));
        assert!(Publishing.can_transition_to(Completed));
        assert!(Running.can_transition_to(Canceled));
        assert!(Completed.can_transition_to(Deleted));
        assert!(Running.can_transition_to(Running));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Canceled.can_transition_to(Running));
        assert!(!Deleted.can_transition_to(Queued));
    }

    #[test]
    fn request_rejects_unknown_fields() {
        let ok: ExportRequest =
            serde_json::from_str(r#"{"definition":"users","format":"csv","estimated_duration":"15s"}"#)
                .unwrap();
        assert_eq!(ok.estimated_duration, Some(Duration::from_secs(15)));
        let numeric: ExportRequest =
            serde_json::from_str(r#"{"definition":"users","estimated_duration":2}"#).unwrap();
        assert_eq!(numeric.estimated_duration, Some(Duration::from_secs(2)));
        assert!(serde_json::from_str::<ExportRequest>(r#"{"definition":"users","bogus":1}"#).is_err());
    }

    #[test]
    fn values_compare_across_numeric_kinds() {
        assert_eq!(Value::Int(2).compare(&Value::Float(1.5)), Ordering::Greater);
        assert_eq!(Value::Null.compare(&Value::Int(0)), Ordering::Less);
        assert_eq!(Value::from("a").compare(&Value::from("b")), Ordering::Less);
    }

    #[test]
    fn expiry_is_relative_to_creation() {
        let now = Utc::now();
        let mut record =
            ExportRecord::queued("x", "users", Format::Csv, DeliveryMode::Async, &Actor::new("u"), now);
        record.expire_after(Duration::from_secs(60));
        assert!(record.expires_at.unwrap() >= record.created_at);
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + chrono::Duration::seconds(61)));
        record.expire_after(Duration::ZERO);
        assert_eq!(record.expires_at, None);
    }
}
