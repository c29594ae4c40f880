use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row as _, Sqlite, SqlitePool, TypeInfo, ValueRef};

use crate::domains::export::context::ExportContext;
use crate::domains::export::source::{BoxRowIterator, RowIterator, RowSource, RowSourceSpec};
use crate::domains::export::types::{Row, SelectionMode, Value};
use crate::errors::{ExportError, ExportResult};
use crate::utils::{quote_identifier, validate_identifier};

const DEFAULT_BATCH_SIZE: i64 = 500;

/// Typed query understood by [`SqliteRowSource`]: column equality filters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteQuery {
    #[serde(default)]
    pub equals: BTreeMap<String, serde_json::Value>,
}

/// Reads one table with keyset pagination on `rowid`.
#[derive(Debug, Clone)]
pub struct SqliteRowSource {
    pool: SqlitePool,
    table: String,
    id_column: String,
    batch_size: i64,
}

impl SqliteRowSource {
    pub fn new(pool: SqlitePool, table: impl Into<String>) -> ExportResult<Self> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self {
            pool,
            table,
            id_column: "id".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn with_id_column(mut self, column: impl Into<String>) -> ExportResult<Self> {
        let column = column.into();
        validate_identifier(&column)?;
        self.id_column = column;
        Ok(self)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, 10_000) as i64;
        self
    }
}

#[async_trait]
impl RowSource for SqliteRowSource {
    async fn open(&self, ctx: &ExportContext, spec: &RowSourceSpec) -> ExportResult<BoxRowIterator> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let columns = spec
            .columns
            .iter()
            .map(|c| validate_identifier(&c.name).map(str::to_string))
            .collect::<ExportResult<Vec<_>>>()?;

        let mut filters: Vec<(String, serde_json::Value)> = Vec::new();
        if let Some(raw) = &spec.query {
            let query: SqliteQuery = serde_json::from_value(raw.clone())
                .map_err(|e| ExportError::validation(format!("invalid sqlite query: {}", e)))?;
            filters.extend(query.equals);
        }

        let ids = match spec.selection.effective_mode() {
            SelectionMode::All => None,
            SelectionMode::Ids => Some(spec.selection.ids.clone()),
            SelectionMode::Query => {
                if let Some(query) = &spec.selection.query {
                    filters.extend(query.params.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                None
            }
        };
        for (column, _) in &filters {
            validate_identifier(column)?;
        }

        log::debug!(
            target: "export::source",
            "opening sqlite source table={} columns={} filters={}",
            self.table,
            columns.len(),
            filters.len()
        );

        Ok(Box::new(SqliteRowIterator {
            pool: self.pool.clone(),
            table: self.table.clone(),
            id_column: self.id_column.clone(),
            columns,
            ids,
            filters,
            batch_size: self.batch_size,
            cursor: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }))
    }
}

struct SqliteRowIterator {
    pool: SqlitePool,
    table: String,
    id_column: String,
    columns: Vec<String>,
    ids: Option<Vec<String>>,
    filters: Vec<(String, serde_json::Value)>,
    batch_size: i64,
    cursor: i64,
    buffer: VecDeque<Row>,
    exhausted: bool,
}

impl SqliteRowIterator {
    fn build_query(&self) -> QueryBuilder<'_, Sqlite> {
        let mut query = QueryBuilder::new("SELECT rowid");
        for column in &self.columns {
            query.push(", ");
            query.push(quote_identifier(column));
        }
        query.push(" FROM ");
        query.push(quote_identifier(&self.table));
        query.push(" WHERE rowid > ");
        query.push_bind(self.cursor);

        if let Some(ids) = &self.ids {
            query.push(" AND ");
            query.push(quote_identifier(&self.id_column));
            query.push(" IN (");
            let mut separated = query.separated(", ");
            for id in ids {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");
        }

        for (column, value) in &self.filters {
            query.push(" AND ");
            query.push(quote_identifier(column));
            match value {
                serde_json::Value::Null => {
                    query.push(" IS NULL");
                }
                serde_json::Value::Bool(b) => {
                    query.push(" = ");
                    query.push_bind(*b);
                }
                serde_json::Value::Number(n) => {
                    query.push(" = ");
                    match n.as_i64() {
                        Some(i) => query.push_bind(i),
                        None => query.push_bind(n.as_f64().unwrap_or_default()),
                    };
                }
                serde_json::Value::String(s) => {
                    query.push(" = ");
                    query.push_bind(s.clone());
                }
                other => {
                    query.push(" = ");
                    query.push_bind(other.to_string());
                }
            }
        }

        query.push(" ORDER BY rowid LIMIT ");
        query.push_bind(self.batch_size);
        query
    }

    async fn fetch_batch(&mut self) -> ExportResult<()> {
        let rows = {
            let mut query = self.build_query();
            query.build().fetch_all(&self.pool).await?
        };
        if (rows.len() as i64) < self.batch_size {
            self.exhausted = true;
        }
        for row in rows {
            self.cursor = row.try_get::<i64, _>(0)?;
            let values = (1..=self.columns.len())
                .map(|index| decode_value(&row, index))
                .collect::<ExportResult<Row>>()?;
            self.buffer.push_back(values);
        }
        Ok(())
    }
}

#[async_trait]
impl RowIterator for SqliteRowIterator {
    async fn next(&mut self, ctx: &ExportContext) -> ExportResult<Option<Row>> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_batch().await?;
        }
        Ok(self.buffer.pop_front())
    }

    async fn close(&mut self) -> ExportResult<()> {
        self.buffer.clear();
        self.exhausted = true;
        Ok(())
    }
}

fn decode_value(row: &SqliteRow, index: usize) -> ExportResult<Value> {
    let type_name = {
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        raw.type_info().name().to_ascii_uppercase()
    };
    let value = match type_name.as_str() {
        "INTEGER" | "INT" | "BIGINT" => Value::Int(row.try_get::<i64, _>(index)?),
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => Value::Float(row.try_get::<f64, _>(index)?),
        "BOOLEAN" | "BOOL" => Value::Bool(row.try_get::<bool, _>(index)?),
        "BLOB" => Value::String(hex::encode(row.try_get::<Vec<u8>, _>(index)?)),
        _ => Value::String(row.try_get::<String, _>(index)?),
    };
    Ok(value)
}
