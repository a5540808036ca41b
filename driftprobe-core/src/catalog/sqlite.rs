//! SQLite catalog.
//!
//! Metadata comes from the `pragma_*` table-valued functions, one table at a
//! time. SQLite exposes a single schema, `main`; requests for other schemas
//! match nothing (use table-name mappings to reconcile them).
//!
//! # Security
//! File databases are opened read-only. Only SELECT and PRAGMA reads are
//! issued.

use super::sql::{self, RowExt, to_count};
use super::{
    CatalogColumn, CatalogForeignKey, CatalogQueryService, CatalogUniqueIndex, ForeignKeyTrust,
    NullCounts, OrphanProbe, ProbeSession, TableRowCount, metadata_error, probe_error,
};
use crate::config::ConnectionConfig;
use crate::error::{DriftProbeError, redact_database_url};
use crate::models::{OrphanRow, TableId};
use crate::Result;
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection};
use std::collections::BTreeMap;
use std::str::FromStr;

const MAIN_SCHEMA: &str = "main";

/// SQLite implementation of [`CatalogQueryService`].
#[derive(Clone)]
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCatalog")
            .field("connections", &self.pool.size())
            .finish_non_exhaustive()
    }
}

impl SqliteCatalog {
    /// Wraps an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates a lazily connecting, read-only pool.
    ///
    /// # Errors
    /// Returns a configuration error if the connection string is invalid
    pub fn connect_lazy(connection_string: &str, config: &ConnectionConfig) -> Result<Self> {
        let normalized = if connection_string.starts_with("sqlite:") {
            connection_string.to_string()
        } else {
            format!("sqlite://{}", connection_string)
        };

        let options = SqliteConnectOptions::from_str(&normalized)
            .map_err(|e| {
                DriftProbeError::configuration(format!(
                    "Invalid SQLite connection string {}: {}",
                    redact_database_url(connection_string),
                    e
                ))
            })?
            .read_only(config.read_only);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.connect_timeout())
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    /// Resolves requested tables to the catalog's own spelling.
    async fn resolve(&self, tables: &[TableId]) -> Result<Vec<TableId>> {
        let mut resolved = Vec::new();
        for table in tables {
            if !table.schema.eq_ignore_ascii_case(MAIN_SCHEMA) {
                continue;
            }
            let names: Vec<String> = sqlx::query_scalar(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND lower(name) = lower(?1)",
            )
            .bind(&table.table)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| metadata_error(format!("Failed to resolve table {}", table), e))?;
            resolved.extend(names.into_iter().map(|name| TableId::new(MAIN_SCHEMA, name)));
        }
        resolved.sort();
        resolved.dedup();
        Ok(resolved)
    }

    async fn primary_key_columns(&self, table: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name, pk FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk")
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| metadata_error(format!("Failed to load primary key of {}", table), e))?;
        rows.iter()
            .map(|row| row.get_field::<String>("name", Some(table)))
            .collect()
    }
}

async fn foreign_keys_enabled(conn: &mut SqliteConnection) -> std::result::Result<bool, sqlx::Error> {
    let enabled: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
        .fetch_one(conn)
        .await?;
    Ok(enabled != 0)
}

#[async_trait]
impl CatalogQueryService for SqliteCatalog {
    fn provider_name(&self) -> &'static str {
        "sqlite"
    }

    async fn load_columns(&self, tables: &[TableId]) -> Result<Vec<CatalogColumn>> {
        let mut columns = Vec::new();
        for table in self.resolve(tables).await? {
            let rows = sqlx::query(
                "SELECT cid, name, type, \"notnull\", dflt_value, pk, hidden FROM pragma_table_xinfo(?1)",
            )
            .bind(&table.table)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| metadata_error(format!("Failed to load columns of {}", table), e))?;

            let context = Some(table.table.as_str());
            let pk_count = rows
                .iter()
                .filter(|row| row.get_field::<i64>("pk", context).unwrap_or(0) > 0)
                .count();

            for row in &rows {
                let cid: i64 = row.get_field("cid", context)?;
                let data_type: String = row.get_field("type", context)?;
                let not_null: i64 = row.get_field("notnull", context)?;
                let pk: i64 = row.get_field("pk", context)?;
                let hidden: i64 = row.get_field("hidden", context)?;

                // INTEGER PRIMARY KEY aliases the rowid
                let is_identity =
                    pk > 0 && pk_count == 1 && data_type.eq_ignore_ascii_case("INTEGER");

                columns.push(CatalogColumn {
                    schema: table.schema.clone(),
                    table: table.table.clone(),
                    column: row.get_field("name", context)?,
                    ordinal: u32::try_from(cid + 1).unwrap_or(0),
                    is_nullable: not_null == 0 && pk == 0,
                    is_computed: hidden == 2 || hidden == 3,
                    is_identity,
                    is_primary_key: pk > 0,
                    default_definition: row.get_field("dflt_value", context)?,
                });
            }
        }
        Ok(columns)
    }

    async fn load_row_counts(&self, tables: &[TableId]) -> Result<Vec<TableRowCount>> {
        let mut counts = Vec::new();
        for table in self.resolve(tables).await? {
            let count: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {}",
                sql::qualified(&table)
            ))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| metadata_error(format!("Failed to count rows of {}", table), e))?;
            counts.push(TableRowCount {
                table,
                row_count: to_count(count),
            });
        }
        Ok(counts)
    }

    async fn load_foreign_keys(&self, tables: &[TableId]) -> Result<Vec<CatalogForeignKey>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| metadata_error("Failed to acquire SQLite connection", e))?;
        let enforced = foreign_keys_enabled(&mut conn)
            .await
            .map_err(|e| metadata_error("Failed to read foreign_keys pragma", e))?;
        drop(conn);

        let mut foreign_keys = Vec::new();
        for table in self.resolve(tables).await? {
            let rows = sqlx::query(
                "SELECT id, seq, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
            )
            .bind(&table.table)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| metadata_error(format!("Failed to load foreign keys of {}", table), e))?;

            let context = Some(table.table.as_str());
            let mut grouped: BTreeMap<i64, Vec<(String, String, Option<String>)>> = BTreeMap::new();
            for row in &rows {
                grouped.entry(row.get_field("id", context)?).or_default().push((
                    row.get_field("table", context)?,
                    row.get_field("from", context)?,
                    row.get_field("to", context)?,
                ));
            }

            for (id, columns) in grouped {
                // only single-column keys map onto one attribute
                let [(target, from_column, to_column)] = columns.as_slice() else {
                    continue;
                };
                let to_column = match to_column {
                    Some(column) => column.clone(),
                    None => match self.primary_key_columns(target).await?.as_slice() {
                        [single] => single.clone(),
                        _ => continue,
                    },
                };
                foreign_keys.push(CatalogForeignKey {
                    name: format!("fk_{}_{}", table.table, id),
                    from: table.clone(),
                    from_column: from_column.clone(),
                    to: TableId::new(MAIN_SCHEMA, target.clone()),
                    to_column,
                    is_not_trusted: !enforced,
                    is_disabled: !enforced,
                });
            }
        }
        Ok(foreign_keys)
    }

    async fn load_unique_indexes(&self, tables: &[TableId]) -> Result<Vec<CatalogUniqueIndex>> {
        let mut indexes = Vec::new();
        for table in self.resolve(tables).await? {
            let rows = sqlx::query(
                "SELECT name, origin FROM pragma_index_list(?1) WHERE \"unique\" = 1 AND partial = 0",
            )
            .bind(&table.table)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| metadata_error(format!("Failed to load indexes of {}", table), e))?;

            let context = Some(table.table.as_str());
            let mut has_pk_index = false;
            for row in &rows {
                let name: String = row.get_field("name", context)?;
                let origin: String = row.get_field("origin", context)?;
                let columns: Vec<Option<String>> = sqlx::query_scalar(
                    "SELECT name FROM pragma_index_info(?1) ORDER BY seqno",
                )
                .bind(&name)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| metadata_error(format!("Failed to load index {}", name), e))?;

                // expression indexes report NULL column names
                let Some(columns) = columns.into_iter().collect::<Option<Vec<String>>>() else {
                    continue;
                };
                has_pk_index |= origin == "pk";
                indexes.push(CatalogUniqueIndex {
                    name,
                    table: table.clone(),
                    columns,
                    is_primary_key: origin == "pk",
                });
            }

            if !has_pk_index {
                let key = self.primary_key_columns(&table.table).await?;
                if !key.is_empty() {
                    indexes.push(CatalogUniqueIndex {
                        name: format!("pk_{}", table.table),
                        table: table.clone(),
                        columns: key,
                        is_primary_key: true,
                    });
                }
            }
        }
        Ok(indexes)
    }

    async fn open_session(&self) -> Result<Box<dyn ProbeSession>> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| probe_error("Failed to acquire SQLite connection", e))?;
        Ok(Box::new(SqliteSession { conn }))
    }
}

struct SqliteSession {
    conn: PoolConnection<Sqlite>,
}

impl SqliteSession {
    fn key_tuple(row: &sqlx::sqlite::SqliteRow, width: usize, table: &str) -> Result<Vec<String>> {
        (0..width)
            .map(|i| {
                row.get_at::<Option<String>>(i, Some(table))
                    .map(|v| v.unwrap_or_else(|| "NULL".to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl ProbeSession for SqliteSession {
    async fn count_nulls(
        &mut self,
        table: &TableId,
        columns: &[String],
        sample: Option<u64>,
    ) -> Result<NullCounts> {
        let query = sql::null_counts(table, columns, sample);
        let row = sqlx::query(&query)
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| probe_error(format!("Null-count probe on {}", table), e))?;

        let context = Some(table.table.as_str());
        let scanned_rows = to_count(row.get_at(0, context)?);
        let counts = (0..columns.len())
            .map(|i| row.get_at::<i64>(i + 1, context).map(to_count))
            .collect::<Result<Vec<u64>>>()?;
        Ok(NullCounts {
            scanned_rows,
            counts,
        })
    }

    async fn detect_duplicates(
        &mut self,
        table: &TableId,
        candidates: &[Vec<String>],
        sample: Option<u64>,
    ) -> Result<Vec<bool>> {
        let query = sql::duplicate_flags(table, candidates, sample);
        let row = sqlx::query(&query)
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| probe_error(format!("Duplicate probe on {}", table), e))?;
        (0..candidates.len())
            .map(|i| row.get_at::<i64>(i, Some(&table.table)).map(|flag| flag != 0))
            .collect()
    }

    async fn count_orphans(
        &mut self,
        table: &TableId,
        probes: &[OrphanProbe],
        sample: Option<u64>,
    ) -> Result<Vec<u64>> {
        let query = sql::orphan_counts(table, probes, sample);
        let row = sqlx::query(&query)
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| probe_error(format!("Orphan probe on {}", table), e))?;
        (0..probes.len())
            .map(|i| row.get_at::<i64>(i, Some(&table.table)).map(to_count))
            .collect()
    }

    async fn foreign_key_trust(&mut self, table: &TableId) -> Result<Vec<ForeignKeyTrust>> {
        let enforced = foreign_keys_enabled(&mut self.conn)
            .await
            .map_err(|e| probe_error("Failed to read foreign_keys pragma", e))?;
        let rows = sqlx::query("SELECT \"table\", \"from\" FROM pragma_foreign_key_list(?1)")
            .bind(&table.table)
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| probe_error(format!("Foreign key trust lookup on {}", table), e))?;

        let context = Some(table.table.as_str());
        rows.iter()
            .map(|row| {
                Ok(ForeignKeyTrust {
                    from_column: row.get_field("from", context)?,
                    to: TableId::new(MAIN_SCHEMA, row.get_field::<String>("table", context)?),
                    is_not_trusted: !enforced,
                })
            })
            .collect()
    }

    async fn null_row_sample(
        &mut self,
        table: &TableId,
        column: &str,
        key_columns: &[String],
        limit: u32,
    ) -> Result<Vec<Vec<String>>> {
        let query = sql::null_row_sample(table, column, key_columns, limit);
        let rows = sqlx::query(&query)
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| probe_error(format!("Null row sample on {}", table), e))?;
        rows.iter()
            .map(|row| Self::key_tuple(row, key_columns.len(), &table.table))
            .collect()
    }

    async fn orphan_row_sample(
        &mut self,
        table: &TableId,
        probe: &OrphanProbe,
        key_columns: &[String],
        limit: u32,
    ) -> Result<Vec<OrphanRow>> {
        let query = sql::orphan_row_sample(table, probe, key_columns, limit);
        let rows = sqlx::query(&query)
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| probe_error(format!("Orphan row sample on {}", table), e))?;
        rows.iter()
            .map(|row| {
                Ok(OrphanRow {
                    key: Self::key_tuple(row, key_columns.len(), &table.table)?,
                    foreign_key_value: row
                        .get_at::<Option<String>>(key_columns.len(), Some(&table.table))?
                        .unwrap_or_default(),
                })
            })
            .collect()
    }
}
