use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domains::export::registry::Registry;
use crate::domains::export::transform::TransformerConfig;
use crate::domains::export::types::{Column, DeliveryMode, ExportRequest, Format, Selection};
use crate::errors::{ExportError, ExportResult};
use crate::utils::duration_serde;

/// Caps and column rules attached to a definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportPolicy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redact_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redaction_value: Option<String>,
    /// Zero means unlimited
    #[serde(default)]
    pub max_rows: u64,
    /// Zero means unlimited
    #[serde(default)]
    pub max_bytes: u64,
    /// Zero means unlimited
    #[serde(default, with = "duration_serde")]
    pub max_duration: Duration,
}

impl ExportPolicy {
    pub const DEFAULT_REDACTION: &'static str = "[redacted]";

    pub fn redaction_value(&self) -> &str {
        match &self.redaction_value {
            Some(value) => value,
            None => Self::DEFAULT_REDACTION,
        }
    }

    /// Field-wise overlay: any non-empty field of `over` wins.
    pub fn merge(&self, over: &ExportPolicy) -> ExportPolicy {
        ExportPolicy {
            allowed_columns: pick_vec(&self.allowed_columns, &over.allowed_columns),
            redact_columns: pick_vec(&self.redact_columns, &over.redact_columns),
            redaction_value: over.redaction_value.clone().or_else(|| self.redaction_value.clone()),
            max_rows: pick_nonzero(self.max_rows, over.max_rows),
            max_bytes: pick_nonzero(self.max_bytes, over.max_bytes),
            max_duration: if over.max_duration.is_zero() {
                self.max_duration
            } else {
                over.max_duration
            },
        }
    }
}

/// Thresholds above which `auto` delivery becomes async
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryThresholds {
    #[serde(default)]
    pub max_rows: u64,
    #[serde(default)]
    pub max_bytes: u64,
    #[serde(default, with = "duration_serde")]
    pub max_duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DeliveryMode>,
    #[serde(default)]
    pub thresholds: DeliveryThresholds,
}

impl DeliveryPolicy {
    pub fn merge(&self, over: &DeliveryPolicy) -> DeliveryPolicy {
        let default = match over.default {
            Some(DeliveryMode::Auto) | None => self.default,
            explicit => explicit,
        };
        DeliveryPolicy {
            default,
            thresholds: DeliveryThresholds {
                max_rows: pick_nonzero(self.thresholds.max_rows, over.thresholds.max_rows),
                max_bytes: pick_nonzero(self.thresholds.max_bytes, over.thresholds.max_bytes),
                max_duration: if over.thresholds.max_duration.is_zero() {
                    self.thresholds.max_duration
                } else {
                    over.thresholds.max_duration
                },
            },
        }
    }
}

/// Template defaults for HTML/PDF output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub max_html_bytes: u64,
}

impl TemplateOptions {
    pub fn merge(&self, over: &TemplateOptions) -> TemplateOptions {
        let mut data = self.data.clone();
        data.extend(over.data.iter().map(|(k, v)| (k.clone(), v.clone())));
        TemplateOptions {
            template: pick_string(&self.template, &over.template),
            title: pick_string(&self.title, &over.title),
            data,
            max_html_bytes: pick_nonzero(self.max_html_bytes, over.max_html_bytes),
        }
    }
}

fn pick_vec(base: &[String], over: &[String]) -> Vec<String> {
    if over.is_empty() {
        base.to_vec()
    } else {
        over.to_vec()
    }
}

fn pick_nonzero(base: u64, over: u64) -> u64 {
    if over == 0 {
        base
    } else {
        over
    }
}

fn pick_string(base: &Option<String>, over: &Option<String>) -> Option<String> {
    match over {
        Some(value) if !value.is_empty() => Some(value.clone()),
        _ => base.clone(),
    }
}

/// Chooses a selection when the request leaves the mode unset.
pub trait SelectionPolicy: Send + Sync {
    fn select(&self, request: &ExportRequest, definition: &ExportDefinition) -> Option<Selection>;
}

impl<F> SelectionPolicy for F
where
    F: Fn(&ExportRequest, &ExportDefinition) -> Option<Selection> + Send + Sync,
{
    fn select(&self, request: &ExportRequest, definition: &ExportDefinition) -> Option<Selection> {
        self(request, definition)
    }
}

#[derive(Clone)]
pub struct SelectionPolicyHandle(pub Arc<dyn SelectionPolicy>);

impl fmt::Debug for SelectionPolicyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SelectionPolicy")
    }
}

/// Named overlay on top of a base definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefinitionVariant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_formats: Vec<Format>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformers: Vec<TransformerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ExportPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateOptions>,
}

/// Declarative contract for an exportable dataset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportDefinition {
    pub name: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub schema: Vec<Column>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_formats: Vec<Format>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_filename: Option<String>,
    pub row_source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformers: Vec<TransformerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_selection: Option<Selection>,
    #[serde(default)]
    pub policy: ExportPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_policy: Option<DeliveryPolicy>,
    #[serde(default)]
    pub template: TemplateOptions,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variants: BTreeMap<String, DefinitionVariant>,
    #[serde(skip)]
    pub selection_policy: Option<SelectionPolicyHandle>,
}

impl ExportDefinition {
    pub fn new(name: impl Into<String>, row_source: impl Into<String>, schema: Vec<Column>) -> Self {
        let name = name.into();
        Self {
            resource: name.clone(),
            name,
            schema,
            row_source: row_source.into(),
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, policy: ExportPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_formats(mut self, formats: impl IntoIterator<Item = Format>) -> Self {
        self.allowed_formats = formats.into_iter().collect();
        self
    }

    pub fn with_selection_policy(mut self, policy: impl SelectionPolicy + 'static) -> Self {
        self.selection_policy = Some(SelectionPolicyHandle(Arc::new(policy)));
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.schema.iter().find(|c| c.name == name)
    }

    fn validate(&self) -> ExportResult<()> {
        if self.name.trim().is_empty() {
            return Err(ExportError::validation("definition name is required"));
        }
        if self.row_source.trim().is_empty() {
            return Err(ExportError::validation(format!(
                "definition {}: row source is required",
                self.name
            )));
        }
        if self.schema.is_empty() {
            return Err(ExportError::validation(format!(
                "definition {}: schema has no columns",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for column in &self.schema {
            if column.name.is_empty() {
                return Err(ExportError::validation(format!(
                    "definition {}: column name is required",
                    self.name
                )));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(ExportError::validation(format!(
                    "definition {}: duplicate column {}",
                    self.name, column.name
                )));
            }
        }
        Ok(())
    }

    /// Applies a variant overlay: non-zero fields replace, policy/template merge.
    fn overlay(&self, variant: &DefinitionVariant) -> ExportDefinition {
        let mut merged = self.clone();
        if let Some(source) = variant.row_source.as_ref().filter(|s| !s.is_empty()) {
            merged.row_source = source.clone();
        }
        if !variant.allowed_formats.is_empty() {
            merged.allowed_formats = variant.allowed_formats.clone();
        }
        if let Some(filename) = variant.default_filename.as_ref().filter(|s| !s.is_empty()) {
            merged.default_filename = Some(filename.clone());
        }
        if !variant.transformers.is_empty() {
            merged.transformers = variant.transformers.clone();
        }
        if let Some(policy) = &variant.policy {
            merged.policy = self.policy.merge(policy);
        }
        if let Some(template) = &variant.template {
            merged.template = self.template.merge(template);
        }
        merged
    }
}

/// Definition after variant overlay, produced per request
#[derive(Debug, Clone)]
pub struct ResolvedDefinition {
    pub definition: ExportDefinition,
    pub variant: Option<String>,
}

impl Deref for ResolvedDefinition {
    type Target = ExportDefinition;

    fn deref(&self) -> &ExportDefinition {
        &self.definition
    }
}

impl ResolvedDefinition {
    pub fn allows(&self, format: Format) -> bool {
        self.definition.allowed_formats.contains(&format)
    }
}

/// Catalog of definitions keyed by name
pub struct DefinitionRegistry {
    entries: Registry<Arc<ExportDefinition>>,
}

impl Default for DefinitionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Registry::new("definition"),
        }
    }

    pub fn register(&self, definition: ExportDefinition) -> ExportResult<()> {
        definition.validate()?;
        for (name, variant) in &definition.variants {
            if let Some(source) = &variant.row_source {
                if source.trim().is_empty() {
                    return Err(ExportError::validation(format!(
                        "definition {}: variant {} has an empty row source",
                        definition.name, name
                    )));
                }
            }
        }
        let name = definition.name.clone();
        self.entries.register(name, Arc::new(definition))
    }

    /// Registers every definition in a JSON array.
    pub fn load_json(&self, json: &str) -> ExportResult<usize> {
        let definitions: Vec<ExportDefinition> = serde_json::from_str(json)
            .map_err(|e| ExportError::validation(format!("invalid definitions: {}", e)))?;
        let count = definitions.len();
        for definition in definitions {
            self.register(definition)?;
        }
        Ok(count)
    }

    pub fn get(&self, name: &str) -> ExportResult<Arc<ExportDefinition>> {
        self.entries.get(name)
    }

    pub fn names(&self) -> ExportResult<Vec<String>> {
        self.entries.keys()
    }

    /// Base definition merged with the variant named by the request.
    pub fn resolve(&self, request: &ExportRequest) -> ExportResult<ResolvedDefinition> {
        let base = self.get(request.definition.trim())?;
        let variant_name = request
            .source_variant
            .as_ref()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let mut definition = match &variant_name {
            None => base.as_ref().clone(),
            Some(name) => {
                let variant = base.variants.get(name).ok_or_else(|| {
                    ExportError::not_found(format!(
                        "variant {} not found for definition {}",
                        name, base.name
                    ))
                })?;
                base.overlay(variant)
            }
        };
        if definition.allowed_formats.is_empty() {
            definition.allowed_formats = Format::DEFAULT_ALLOWED.to_vec();
        }

        Ok(ResolvedDefinition {
            definition,
            variant: variant_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn users() -> ExportDefinition {
        let mut def = ExportDefinition::new(
            "users",
            "users_source",
            vec![Column::string("id"), Column::string("name"), Column::string("email")],
        );
        def.policy = ExportPolicy {
            redact_columns: vec!["email".into()],
            max_rows: 100,
            ..Default::default()
        };
        def.template.data.insert("a".into(), serde_json::json!(1));
        def.template.title = Some("Users".into());
        def.variants.insert(
            "archive".into(),
            DefinitionVariant {
                row_source: Some("archive_source".into()),
                allowed_formats: vec![Format::Csv],
                policy: Some(ExportPolicy {
                    max_bytes: 10,
                    ..Default::default()
                }),
                template: Some(TemplateOptions {
                    data: [("b".to_string(), serde_json::json!(2))].into_iter().collect(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        def
    }

    #[test]
    fn register_once() {
        let registry = DefinitionRegistry::new();
        registry.register(users()).unwrap();
        let err = registry.register(users()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn base_resolution_defaults_formats() {
        let registry = DefinitionRegistry::new();
        registry.register(users()).unwrap();
        let resolved = registry.resolve(&ExportRequest::new("users", "csv")).unwrap();
        assert_eq!(resolved.variant, None);
        assert_eq!(resolved.row_source, "users_source");
        assert_eq!(resolved.allowed_formats, Format::DEFAULT_ALLOWED.to_vec());
    }

    #[test]
    fn variant_overlay_merges_policy_and_template() {
        let registry = DefinitionRegistry::new();
        registry.register(users()).unwrap();
        let mut req = ExportRequest::new("users", "csv");
        req.source_variant = Some("archive".into());
        let resolved = registry.resolve(&req).unwrap();

        assert_eq!(resolved.variant.as_deref(), Some("archive"));
        assert_eq!(resolved.row_source, "archive_source");
        assert_eq!(resolved.allowed_formats, vec![Format::Csv]);
        assert_eq!(resolved.policy.max_rows, 100);
        assert_eq!(resolved.policy.max_bytes, 10);
        assert_eq!(resolved.policy.redact_columns, vec!["email".to_string()]);
        assert_eq!(resolved.template.title.as_deref(), Some("Users"));
        assert_eq!(resolved.template.data.len(), 2);
    }

    #[test]
    fn unknown_definition_and_variant_are_not_found() {
        let registry = DefinitionRegistry::new();
        registry.register(users()).unwrap();
        let err = registry.resolve(&ExportRequest::new("orders", "csv")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let mut req = ExportRequest::new("users", "csv");
        req.source_variant = Some("missing".into());
        assert_eq!(registry.resolve(&req).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn rejects_invalid_definitions() {
        let registry = DefinitionRegistry::new();
        let empty = ExportDefinition::new("empty", "src", vec![]);
        assert!(registry.register(empty).is_err());
        let dup = ExportDefinition::new("dup", "src", vec![Column::string("a"), Column::string("a")]);
        assert!(registry.register(dup).is_err());
    }

    #[test]
    fn loads_definitions_from_json() {
        let registry = DefinitionRegistry::new();
        let json = r#"[{
            "name": "orders",
            "row_source": "orders",
            "schema": [{"name": "id", "type": "int"}, {"name": "total", "type": "float", "label": "Total"}],
            "allowed_formats": ["csv", "excel"],
            "policy": {"max_rows": 5, "max_duration": "30s"}
        }]"#;
        assert_eq!(registry.load_json(json).unwrap(), 1);
        let def = registry.get("orders").unwrap();
        assert_eq!(def.allowed_formats, vec![Format::Csv, Format::Xlsx]);
        assert_eq!(def.policy.max_duration, Duration::from_secs(30));
        assert_eq!(def.schema[1].header(), "Total");
    }
}
