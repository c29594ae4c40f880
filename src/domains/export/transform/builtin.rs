use async_trait::async_trait;
use serde::Deserialize;

use super::{BufferedTransformer, StreamingTransformer, TransformerConfig};
use crate::domains::export::context::ExportContext;
use crate::domains::export::source::{BoxRowIterator, RowIterator};
use crate::domains::export::types::{Column, ColumnType, Row, Value};
use crate::errors::{ExportError, ExportResult};

fn column_index(schema: &[Column], name: &str) -> ExportResult<usize> {
    schema
        .iter()
        .position(|c| c.name == name)
        .ok_or_else(|| ExportError::validation(format!("unknown column: {}", name)))
}

fn json_matches(value: &Value, expected: &serde_json::Value) -> bool {
    match (value, expected) {
        (Value::Null, serde_json::Value::Null) => true,
        (Value::String(s), serde_json::Value::String(e)) => s == e,
        (v, serde_json::Value::String(e)) => v.to_string() == *e,
        (v, e) => *v == Value::from(e.clone()),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilterOptions {
    column: String,
    #[serde(default)]
    equals: Option<serde_json::Value>,
    #[serde(default)]
    not_equals: Option<serde_json::Value>,
}

/// Keeps rows whose column equals (or does not equal) a value.
#[derive(Debug, Clone)]
pub struct FilterTransformer {
    column: String,
    expected: serde_json::Value,
    negate: bool,
}

impl FilterTransformer {
    pub fn from_config(config: &TransformerConfig) -> ExportResult<Self> {
        let options: FilterOptions = config.decode_options()?;
        let (expected, negate) = match (options.equals, options.not_equals) {
            (Some(v), None) => (v, false),
            (None, Some(v)) => (v, true),
            _ => {
                return Err(ExportError::validation(
                    "filter needs exactly one of equals or not_equals",
                ))
            }
        };
        Ok(Self {
            column: options.column,
            expected,
            negate,
        })
    }
}

struct FilterIter {
    inner: BoxRowIterator,
    index: usize,
    expected: serde_json::Value,
    negate: bool,
}

#[async_trait]
impl RowIterator for FilterIter {
    async fn next(&mut self, ctx: &ExportContext) -> ExportResult<Option<Row>> {
        while let Some(row) = self.inner.next(ctx).await? {
            let hit = row
                .get(self.index)
                .map(|v| json_matches(v, &self.expected))
                .unwrap_or(false);
            if hit != self.negate {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> ExportResult<()> {
        self.inner.close().await
    }
}

impl StreamingTransformer for FilterTransformer {
    fn wrap(&self, input: BoxRowIterator, schema: &[Column]) -> ExportResult<(BoxRowIterator, Vec<Column>)> {
        let index = column_index(schema, &self.column)?;
        let iter = FilterIter {
            inner: input,
            index,
            expected: self.expected.clone(),
            negate: self.negate,
        };
        Ok((Box::new(iter), schema.to_vec()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapOp {
    Upper,
    Lower,
    Trim,
}

impl MapOp {
    fn apply(self, value: Value) -> Value {
        match value {
            Value::String(s) => Value::String(match self {
                MapOp::Upper => s.to_uppercase(),
                MapOp::Lower => s.to_lowercase(),
                MapOp::Trim => s.trim().to_string(),
            }),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MapOptions {
    column: String,
    op: MapOp,
}

/// Rewrites a string column in place. Non-string values pass through.
#[derive(Debug, Clone)]
pub struct MapTransformer {
    column: String,
    op: MapOp,
}

impl MapTransformer {
    pub fn from_config(config: &TransformerConfig) -> ExportResult<Self> {
        let options: MapOptions = config.decode_options()?;
        Ok(Self {
            column: options.column,
            op: options.op,
        })
    }
}

struct MapIter {
    inner: BoxRowIterator,
    index: usize,
    op: MapOp,
}

#[async_trait]
impl RowIterator for MapIter {
    async fn next(&mut self, ctx: &ExportContext) -> ExportResult<Option<Row>> {
        let Some(mut row) = self.inner.next(ctx).await? else {
            return Ok(None);
        };
        if let Some(slot) = row.get_mut(self.index) {
            *slot = self.op.apply(std::mem::replace(slot, Value::Null));
        }
        Ok(Some(row))
    }

    async fn close(&mut self) -> ExportResult<()> {
        self.inner.close().await
    }
}

impl StreamingTransformer for MapTransformer {
    fn wrap(&self, input: BoxRowIterator, schema: &[Column]) -> ExportResult<(BoxRowIterator, Vec<Column>)> {
        let index = column_index(schema, &self.column)?;
        Ok((
            Box::new(MapIter {
                inner: input,
                index,
                op: self.op,
            }),
            schema.to_vec(),
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct AugmentOptions {
    name: String,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default, rename = "type")]
    kind: ColumnType,
    #[serde(default)]
    label: Option<String>,
}

/// Appends a constant column.
#[derive(Debug, Clone)]
pub struct AugmentTransformer {
    column: Column,
    value: Value,
}

impl AugmentTransformer {
    pub fn from_config(config: &TransformerConfig) -> ExportResult<Self> {
        let options: AugmentOptions = config.decode_options()?;
        if options.name.trim().is_empty() {
            return Err(ExportError::validation("augment needs a column name"));
        }
        let mut column = Column::new(options.name, options.kind);
        column.label = options.label;
        Ok(Self {
            column,
            value: Value::from(options.value),
        })
    }
}

struct AugmentIter {
    inner: BoxRowIterator,
    value: Value,
}

#[async_trait]
impl RowIterator for AugmentIter {
    async fn next(&mut self, ctx: &ExportContext) -> ExportResult<Option<Row>> {
        Ok(self.inner.next(ctx).await?.map(|mut row| {
            row.push(self.value.clone());
            row
        }))
    }

    async fn close(&mut self) -> ExportResult<()> {
        self.inner.close().await
    }
}

impl StreamingTransformer for AugmentTransformer {
    fn wrap(&self, input: BoxRowIterator, schema: &[Column]) -> ExportResult<(BoxRowIterator, Vec<Column>)> {
        if schema.iter().any(|c| c.name == self.column.name) {
            return Err(ExportError::validation(format!("duplicate column: {}", self.column.name)));
        }
        let mut widened = schema.to_vec();
        widened.push(self.column.clone());
        Ok((
            Box::new(AugmentIter {
                inner: input,
                value: self.value.clone(),
            }),
            widened,
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SortOptions {
    column: String,
    #[serde(default)]
    descending: bool,
}

/// Stable sort on one column.
#[derive(Debug, Clone)]
pub struct SortTransformer {
    column: String,
    descending: bool,
}

impl SortTransformer {
    pub fn from_config(config: &TransformerConfig) -> ExportResult<Self> {
        let options: SortOptions = config.decode_options()?;
        Ok(Self {
            column: options.column,
            descending: options.descending,
        })
    }
}

impl BufferedTransformer for SortTransformer {
    fn process(&self, mut rows: Vec<Row>, schema: &[Column]) -> ExportResult<(Vec<Row>, Vec<Column>)> {
        let index = column_index(schema, &self.column)?;
        rows.sort_by(|a, b| {
            let ord = match (a.get(index), b.get(index)) {
                (Some(x), Some(y)) => x.compare(y),
                (a, b) => a.is_some().cmp(&b.is_some()),
            };
            if self.descending {
                ord.reverse()
            } else {
                ord
            }
        });
        Ok((rows, schema.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::source::{collect_rows, VecRowIterator};
    use serde_json::json;

    fn schema() -> Vec<Column> {
        vec![Column::new("id", ColumnType::Int), Column::string("team")]
    }

    fn rows() -> Vec<Row> {
        vec![
            vec![Value::Int(1), "red".into()],
            vec![Value::Int(2), "blue".into()],
            vec![Value::Int(3), "red".into()],
        ]
    }

    async fn stream(stage: &dyn StreamingTransformer) -> (Vec<Row>, Vec<Column>) {
        let ctx = ExportContext::background();
        let (mut iter, schema) = stage.wrap(Box::new(VecRowIterator::new(rows())), &schema()).unwrap();
        (collect_rows(&ctx, iter.as_mut()).await.unwrap(), schema)
    }

    #[tokio::test]
    async fn filter_equals_and_not_equals() {
        let eq = FilterTransformer::from_config(&TransformerConfig::new("filter", json!({"column": "team", "equals": "red"}))).unwrap();
        assert_eq!(stream(&eq).await.0.len(), 2);

        let ne = FilterTransformer::from_config(&TransformerConfig::new("filter", json!({"column": "id", "not_equals": 2}))).unwrap();
        let (out, _) = stream(&ne).await;
        assert_eq!(out.iter().map(|r| r[0].clone()).collect::<Vec<_>>(), vec![Value::Int(1), Value::Int(3)]);
    }

    #[test]
    fn filter_requires_one_predicate() {
        let both = TransformerConfig::new("filter", json!({"column": "team", "equals": "a", "not_equals": "b"}));
        assert!(FilterTransformer::from_config(&both).is_err());
        let none = TransformerConfig::new("filter", json!({"column": "team"}));
        assert!(FilterTransformer::from_config(&none).is_err());
    }

    #[tokio::test]
    async fn map_uppercases() {
        let map = MapTransformer::from_config(&TransformerConfig::new("map", json!({"column": "team", "op": "upper"}))).unwrap();
        let (out, _) = stream(&map).await;
        assert_eq!(out[1][1], Value::from("BLUE"));
        assert_eq!(out[1][0], Value::Int(2));
    }

    #[tokio::test]
    async fn augment_widens_schema() {
        let augment = AugmentTransformer::from_config(&TransformerConfig::new(
            "augment",
            json!({"name": "batch", "value": 7, "type": "int", "label": "Batch"}),
        ))
        .unwrap();
        let (out, schema) = stream(&augment).await;
        assert_eq!(schema[2].header(), "Batch");
        assert_eq!(schema[2].kind, ColumnType::Int);
        assert!(out.iter().all(|r| r[2] == Value::Int(7)));
    }

    #[test]
    fn augment_rejects_existing_column() {
        let augment = AugmentTransformer::from_config(&TransformerConfig::new("augment", json!({"name": "team"}))).unwrap();
        assert!(augment.wrap(Box::new(VecRowIterator::new(vec![])), &schema()).is_err());
    }

    #[test]
    fn sort_is_stable_and_descending() {
        let sort = SortTransformer::from_config(&TransformerConfig::new("sort", json!({"column": "team"}))).unwrap();
        let (out, _) = sort.process(rows(), &schema()).unwrap();
        let ids: Vec<_> = out.iter().map(|r| r[0].clone()).collect();
        assert_eq!(ids, vec![Value::Int(2), Value::Int(1), Value::Int(3)]);

        let desc = SortTransformer::from_config(&TransformerConfig::new("sort", json!({"column": "id", "descending": true}))).unwrap();
        let (out, _) = desc.process(rows(), &schema()).unwrap();
        assert_eq!(out[0][0], Value::Int(3));
    }

    #[test]
    fn unknown_column_fails_at_wrap() {
        let sort = SortTransformer::from_config(&TransformerConfig::new("sort", json!({"column": "nope"}))).unwrap();
        assert!(sort.process(rows(), &schema()).is_err());
    }
}
