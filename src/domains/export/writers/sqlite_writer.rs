use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tokio::io::AsyncWriteExt;

use super::format::{Cell, ValueFormatter};
use super::{OutputWriter, RenderSpec, RenderStats, Renderer};
use crate::domains::export::context::ExportContext;
use crate::domains::export::io::CountingWriter;
use crate::domains::export::source::RowIterator;
use crate::domains::export::tracking::next_or_done;
use crate::domains::export::types::{Column, ColumnType};
use crate::errors::ExportResult;
use crate::utils::quote_identifier;

pub const TABLE_NAME: &str = "data";

/// Writes rows into a scratch SQLite database and streams the file.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteRenderer;

fn sql_type(kind: ColumnType) -> &'static str {
    match kind {
        ColumnType::Bool | ColumnType::Int => "INTEGER",
        ColumnType::Float => "REAL",
        _ => "TEXT",
    }
}

fn create_table_sql(columns: &[Column]) -> String {
    let definitions: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", quote_identifier(&c.name), sql_type(c.kind)))
        .collect();
    format!("CREATE TABLE {} ({})", quote_identifier(TABLE_NAME), definitions.join(", "))
}

fn insert_sql(columns: &[Column]) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_identifier(&c.name)).collect();
    let params = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(TABLE_NAME),
        names.join(", "),
        params
    )
}

async fn insert_row(tx: &mut Transaction<'_, Sqlite>, sql: &str, cells: Vec<Cell>) -> ExportResult<()> {
    let mut query = sqlx::query(sql);
    for cell in cells {
        query = match cell {
            Cell::Empty => query.bind(Option::<String>::None),
            Cell::Bool(b) => query.bind(b),
            Cell::Int(i) => query.bind(i),
            Cell::Float(f) => query.bind(f),
            other => query.bind(other.to_text()),
        };
    }
    query.execute(&mut **tx).await?;
    Ok(())
}

#[async_trait]
impl Renderer for SqliteRenderer {
    async fn render(
        &self,
        ctx: &ExportContext,
        spec: &RenderSpec,
        rows: &mut dyn RowIterator,
        out: &mut OutputWriter<'_>,
    ) -> ExportResult<RenderStats> {
        let formatter = ValueFormatter::new(&spec.options.format)?;
        let scratch = tempfile::tempdir()?;
        let path = scratch.path().join("export.sqlite");

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let result = async {
            sqlx::query(&create_table_sql(&spec.columns)).execute(&pool).await?;
            let insert = insert_sql(&spec.columns);
            let mut tx = pool.begin().await?;
            let mut count = 0u64;
            while let Some(row) = next_or_done(ctx, rows).await? {
                let cells = formatter.coerce_row(&spec.columns, &row)?;
                insert_row(&mut tx, &insert, cells).await?;
                count += 1;
            }
            tx.commit().await?;
            ExportResult::Ok(count)
        }
        .await;
        pool.close().await;
        let count = result?;

        let mut file = tokio::fs::File::open(&path).await?;
        let mut out = CountingWriter::new(out);
        tokio::io::copy(&mut file, &mut out).await?;
        out.flush().await?;

        log::debug!(target: "export::sqlite", "wrote {} rows into {} bytes", count, out.bytes_written());
        Ok(RenderStats {
            rows: count,
            bytes: out.bytes_written(),
        })
    }
}
