//! Turns a request plus a resolved definition into a validated `ResolvedExport`.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::domains::export::definition::ResolvedDefinition;
use crate::domains::export::types::{
    Column, ColumnType, DeliveryMode, ExportRequest, Format, JsonMode, Selection, SelectionMode,
};
use crate::errors::{ExportError, ExportResult};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder pattern"));

const DEFAULT_FILENAME: &str = "{definition}-{timestamp}";

#[derive(Debug, Clone)]
pub struct ResolvedExport {
    /// Request after normalization
    pub request: ExportRequest,
    pub definition: ResolvedDefinition,
    pub format: Format,
    pub selection: Selection,
    pub columns: Vec<Column>,
    pub column_names: Vec<String>,
    /// Projected position -> redaction value
    pub redact_indices: BTreeMap<usize, String>,
    pub filename: String,
}

impl ResolvedExport {
    pub fn delivery(&self) -> DeliveryMode {
        self.request.delivery.unwrap_or_default()
    }
}

/// Lowercases the format, maps aliases and fills render option defaults.
pub fn normalize_request(request: &ExportRequest) -> ExportResult<(ExportRequest, Format)> {
    let mut req = request.clone();
    let format = Format::parse(&req.format)?;
    req.definition = req.definition.trim().to_string();
    req.format = format.as_str().to_string();
    if req.delivery.is_none() {
        req.delivery = Some(DeliveryMode::Auto);
    }
    req.source_variant = req
        .source_variant
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    req.idempotency_key = req
        .idempotency_key
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty());

    let options = &mut req.render_options;
    if options.csv.delimiter.is_none() {
        options.csv.delimiter = Some(',');
    }
    if options.csv.include_headers.is_none() {
        options.csv.include_headers = Some(true);
    }
    options.json.mode = Some(match format {
        Format::Ndjson => JsonMode::Lines,
        _ => options.json.mode.unwrap_or(JsonMode::Array),
    });
    if options.format.timezone.is_none() {
        options.format.timezone = req.timezone.clone();
    }
    if options.format.locale.is_none() {
        options.format.locale = req.locale.clone();
    }
    Ok((req, format))
}

pub fn resolve_export(
    request: &ExportRequest,
    definition: &ResolvedDefinition,
    now: DateTime<Utc>,
) -> ExportResult<ResolvedExport> {
    let (req, format) = normalize_request(request)?;

    if !definition.allows(format) {
        return Err(ExportError::validation(format!(
            "format {} is not allowed for definition {}",
            format, definition.name
        )));
    }

    let selection = resolve_selection(&req, definition)?;
    let columns = project_columns(&req, definition)?;

    let policy = &definition.policy;
    let redacted: HashSet<&str> = policy.redact_columns.iter().map(String::as_str).collect();
    let mut redact_indices = BTreeMap::new();
    let columns: Vec<Column> = columns
        .into_iter()
        .enumerate()
        .map(|(index, mut column)| {
            if redacted.contains(column.name.as_str()) {
                redact_indices.insert(index, policy.redaction_value().to_string());
                // the replacement is text whatever the source type
                column.kind = ColumnType::String;
                column.format = None;
            }
            column
        })
        .collect();

    enforce_estimates(&req, definition)?;

    let filename = render_filename(definition, format, now);
    let column_names = columns.iter().map(|c| c.name.clone()).collect();

    Ok(ResolvedExport {
        request: req,
        definition: definition.clone(),
        format,
        selection,
        columns,
        column_names,
        redact_indices,
        filename,
    })
}

fn resolve_selection(req: &ExportRequest, definition: &ResolvedDefinition) -> ExportResult<Selection> {
    let mut selection = if req.selection.mode.is_some() {
        req.selection.clone()
    } else if let Some(policy) = &definition.selection_policy {
        policy
            .0
            .select(req, definition)
            .unwrap_or_else(|| definition.default_selection.clone().unwrap_or_else(Selection::all))
    } else if let Some(default) = &definition.default_selection {
        default.clone()
    } else {
        Selection::all()
    };
    if selection.mode.is_none() {
        selection.mode = Some(SelectionMode::All);
    }

    match selection.effective_mode() {
        SelectionMode::Ids if selection.ids.is_empty() => {
            Err(ExportError::validation("selection mode ids requires at least one id"))
        }
        SelectionMode::Query if selection.query.is_none() => {
            Err(ExportError::validation("selection mode query requires a query"))
        }
        _ => Ok(selection),
    }
}

fn project_columns(req: &ExportRequest, definition: &ResolvedDefinition) -> ExportResult<Vec<Column>> {
    let allowed = &definition.policy.allowed_columns;
    let requested: Vec<&str> = if !req.columns.is_empty() {
        req.columns.iter().map(|c| c.trim()).collect()
    } else if !allowed.is_empty() {
        allowed.iter().map(String::as_str).collect()
    } else {
        definition.schema.iter().map(|c| c.name.as_str()).collect()
    };

    let mut seen = HashSet::new();
    let mut columns = Vec::with_capacity(requested.len());
    for name in requested {
        if !seen.insert(name) {
            continue;
        }
        let column = definition
            .column(name)
            .ok_or_else(|| ExportError::validation(format!("unknown column: {}", name)))?;
        if !allowed.is_empty() && !allowed.iter().any(|a| a == name) {
            return Err(ExportError::validation(format!("column not allowed: {}", name)));
        }
        columns.push(column.clone());
    }

    if columns.is_empty() {
        return Err(ExportError::validation("no columns selected"));
    }
    Ok(columns)
}

fn enforce_estimates(req: &ExportRequest, definition: &ResolvedDefinition) -> ExportResult<()> {
    let policy = &definition.policy;
    if let Some(rows) = req.estimated_rows {
        if policy.max_rows > 0 && rows > policy.max_rows {
            return Err(ExportError::validation(format!(
                "estimated rows {} exceed max rows {}",
                rows, policy.max_rows
            )));
        }
    }
    if let Some(bytes) = req.estimated_bytes {
        if policy.max_bytes > 0 && bytes > policy.max_bytes {
            return Err(ExportError::validation(format!(
                "estimated bytes {} exceed max bytes {}",
                bytes, policy.max_bytes
            )));
        }
    }
    if let Some(duration) = req.estimated_duration {
        if !policy.max_duration.is_zero() && duration > policy.max_duration {
            return Err(ExportError::validation(format!(
                "estimated duration {:?} exceeds max duration {:?}",
                duration, policy.max_duration
            )));
        }
    }
    Ok(())
}

/// Expands the definition filename template and appends the format extension.
pub fn render_filename(definition: &ResolvedDefinition, format: Format, now: DateTime<Utc>) -> String {
    let template = definition
        .default_filename
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(DEFAULT_FILENAME);

    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        match &caps[1] {
            "definition" => definition.name.clone(),
            "format" => format.as_str().to_string(),
            "timestamp" => now.format("%Y%m%dT%H%M%SZ").to_string(),
            "date" => now.format("%Y-%m-%d").to_string(),
            "resource" => definition.resource.clone(),
            "variant" => definition.variant.clone().unwrap_or_default(),
            _ => caps[0].to_string(),
        }
    });

    let mut filename: String = rendered
        .chars()
        .map(|c| match c {
            '/' | '\\' | '"' | '\r' | '\n' => '_',
            other => other,
        })
        .collect();
    let suffix = format!(".{}", format.extension());
    if !filename.to_ascii_lowercase().ends_with(&suffix) {
        filename.push_str(&suffix);
    }
    filename
}
