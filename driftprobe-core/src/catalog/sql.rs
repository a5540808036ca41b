//! Probe query builders shared by the SQL catalogs.
//!
//! Identifiers are always double-quoted, so every builder emits ANSI SQL
//! that PostgreSQL and SQLite accept unchanged. Results are read by
//! position: aliases exist only to keep the statements readable in logs.

use super::OrphanProbe;
use crate::error::DriftProbeError;
use crate::models::TableId;
use crate::Result;

/// Typed column extraction with consistent error context.
pub(crate) trait RowExt: sqlx::Row {
    /// Reads a named column.
    fn get_field<'r, T>(&'r self, field: &str, table_context: Option<&str>) -> Result<T>
    where
        T: sqlx::Decode<'r, Self::Database> + sqlx::Type<Self::Database>,
        for<'a> &'a str: sqlx::ColumnIndex<Self>,
    {
        self.try_get(field)
            .map_err(|e| DriftProbeError::parse_field(field, table_context, e))
    }

    /// Reads a column by position; probe results are positional.
    fn get_at<'r, T>(&'r self, index: usize, table_context: Option<&str>) -> Result<T>
    where
        T: sqlx::Decode<'r, Self::Database> + sqlx::Type<Self::Database>,
        usize: sqlx::ColumnIndex<Self>,
    {
        self.try_get(index)
            .map_err(|e| DriftProbeError::parse_field(&format!("#{}", index), table_context, e))
    }
}

impl<R: sqlx::Row> RowExt for R {}

/// Converts a SQL count to `u64`, treating negatives as zero.
pub(crate) fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Quotes one identifier, doubling embedded quotes.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Schema-qualified, quoted table name.
pub(crate) fn qualified(table: &TableId) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.table))
}

/// Row source for a probe: the table itself, or its first `sample` rows.
fn source(table: &TableId, columns: &[&str], sample: Option<u64>) -> String {
    match sample {
        Some(limit) => {
            let projection = if columns.is_empty() {
                "1 AS one".to_string()
            } else {
                columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            format!(
                "(SELECT {} FROM {} LIMIT {}) AS src",
                projection,
                qualified(table),
                limit
            )
        }
        None => format!("{} AS src", qualified(table)),
    }
}

/// `SELECT COUNT(*), <null count per column> FROM <source>`.
pub(crate) fn null_counts(table: &TableId, columns: &[String], sample: Option<u64>) -> String {
    let mut select = vec!["COUNT(*) AS scanned_rows".to_string()];
    for (i, column) in columns.iter().enumerate() {
        select.push(format!(
            "CAST(COALESCE(SUM(CASE WHEN src.{} IS NULL THEN 1 ELSE 0 END), 0) AS BIGINT) AS n{}",
            quote_ident(column),
            i
        ));
    }
    let projected: Vec<&str> = columns.iter().map(String::as_str).collect();
    format!(
        "SELECT {} FROM {}",
        select.join(", "),
        source(table, &projected, sample)
    )
}

/// One flag per candidate: 1 when a duplicate group exists, else 0.
pub(crate) fn duplicate_flags(
    table: &TableId,
    candidates: &[Vec<String>],
    sample: Option<u64>,
) -> String {
    let flags: Vec<String> = candidates
        .iter()
        .enumerate()
        .map(|(i, columns)| {
            let projected: Vec<&str> = columns.iter().map(String::as_str).collect();
            let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
            let not_null = quoted
                .iter()
                .map(|c| format!("{} IS NOT NULL", c))
                .collect::<Vec<_>>()
                .join(" AND ");
            format!(
                "CAST(CASE WHEN EXISTS (SELECT 1 FROM {} WHERE {} GROUP BY {} HAVING COUNT(*) > 1) THEN 1 ELSE 0 END AS BIGINT) AS d{}",
                source(table, &projected, sample),
                not_null,
                quoted.join(", "),
                i
            )
        })
        .collect();
    format!("SELECT {}", flags.join(", "))
}

fn orphan_predicate(probe: &OrphanProbe) -> String {
    format!(
        "src.{col} IS NOT NULL AND NOT EXISTS (SELECT 1 FROM {target} AS tgt WHERE tgt.{target_col} = src.{col})",
        col = quote_ident(&probe.column),
        target = qualified(&probe.target),
        target_col = quote_ident(&probe.target_column),
    )
}

/// Orphan count per relationship in one scan of the source table.
pub(crate) fn orphan_counts(table: &TableId, probes: &[OrphanProbe], sample: Option<u64>) -> String {
    let select: Vec<String> = probes
        .iter()
        .enumerate()
        .map(|(i, probe)| {
            format!(
                "CAST(COALESCE(SUM(CASE WHEN {} THEN 1 ELSE 0 END), 0) AS BIGINT) AS o{}",
                orphan_predicate(probe),
                i
            )
        })
        .collect();
    let mut projected: Vec<&str> = probes.iter().map(|p| p.column.as_str()).collect();
    projected.sort_unstable();
    projected.dedup();
    format!(
        "SELECT {} FROM {}",
        select.join(", "),
        source(table, &projected, sample)
    )
}

fn key_projection(key_columns: &[String]) -> String {
    key_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("CAST(src.{} AS TEXT) AS k{}", quote_ident(c), i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Key tuples of rows where `column` is NULL.
pub(crate) fn null_row_sample(
    table: &TableId,
    column: &str,
    key_columns: &[String],
    limit: u32,
) -> String {
    format!(
        "SELECT {} FROM {} AS src WHERE src.{} IS NULL LIMIT {}",
        key_projection(key_columns),
        qualified(table),
        quote_ident(column),
        limit
    )
}

/// Key tuples plus the dangling value of orphaned rows.
pub(crate) fn orphan_row_sample(
    table: &TableId,
    probe: &OrphanProbe,
    key_columns: &[String],
    limit: u32,
) -> String {
    format!(
        "SELECT {}, CAST(src.{} AS TEXT) AS fk_value FROM {} AS src WHERE {} LIMIT {}",
        key_projection(key_columns),
        quote_ident(&probe.column),
        qualified(table),
        orphan_predicate(probe),
        limit
    )
}
