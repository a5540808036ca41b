//! PostgreSQL catalog.
//!
//! Metadata is read from `pg_catalog` in one
//! statement per kind and batch; the requested tables are passed as two
//! parallel text arrays and matched case-insensitively.
//!
//! # Security
//! Every pooled connection runs with `default_transaction_read_only = on`
//! and the configured statement timeout. Credentials are redacted from all
//! errors.

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
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Postgres;

const REQUESTED_TABLES: &str = "JOIN UNNEST($1::text[], $2::text[]) AS req(schema_name, table_name) \
     ON lower(n.nspname) = lower(req.schema_name) AND lower(t.relname) = lower(req.table_name)";

/// PostgreSQL implementation of [`CatalogQueryService`].
#[derive(Clone)]
pub struct PostgresCatalog {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresCatalog")
            .field("connections", &self.pool.size())
            .finish_non_exhaustive()
    }
}

impl PostgresCatalog {
    /// Wraps an existing pool. Session settings are the caller's concern.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates a lazily connecting pool whose sessions are read-only.
    ///
    /// # Arguments
    /// * `connection_string` - `postgres://` URL
    /// * `config` - Pool size, timeouts and session settings
    ///
    /// # Errors
    /// Returns a configuration error if the URL cannot be parsed
    ///
    /// # Security
    /// The URL is redacted in the returned error.
    pub fn connect_lazy(connection_string: &str, config: &ConnectionConfig) -> Result<Self> {
        use sqlx::Executor;

        let setup = session_setup(config);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .test_before_acquire(true)
            .after_connect(move |conn, _meta| {
                let setup = setup.clone();
                Box::pin(async move {
                    for statement in &setup {
                        conn.execute(statement.as_str()).await?;
                    }
                    Ok(())
                })
            })
            .connect_lazy(connection_string)
            .map_err(|e| {
                DriftProbeError::configuration(format!(
                    "Invalid PostgreSQL connection string {}: {}",
                    redact_database_url(connection_string),
                    e
                ))
            })?;

        Ok(Self { pool })
    }
}

/// Statements every pooled connection runs once after connecting.
fn session_setup(config: &ConnectionConfig) -> Vec<String> {
    let mut statements = Vec::with_capacity(5);
    if let Some(secs) = config.statement_timeout_secs {
        statements.push(format!("SET statement_timeout = '{}s'", secs));
    }
    statements.push("SET lock_timeout = '30s'".to_string());
    statements.push(format!(
        "SET application_name = '{}'",
        config.application_name.replace('\'', "''")
    ));
    if config.read_only {
        statements.push("SET default_transaction_read_only = on".to_string());
    }
    statements.push("SET timezone = 'UTC'".to_string());
    statements
}

/// Splits tables into the two bind arrays of [`REQUESTED_TABLES`].
fn bind_arrays(tables: &[TableId]) -> (Vec<String>, Vec<String>) {
    tables
        .iter()
        .map(|t| (t.schema.clone(), t.table.clone()))
        .unzip()
}

fn table_of(row: &PgRow) -> Result<TableId> {
    Ok(TableId::new(
        row.get_field::<String>("schema_name", None)?,
        row.get_field::<String>("table_name", None)?,
    ))
}

#[async_trait]
impl CatalogQueryService for PostgresCatalog {
    fn provider_name(&self) -> &'static str {
        "postgresql"
    }

    async fn load_columns(&self, tables: &[TableId]) -> Result<Vec<CatalogColumn>> {
        let (schemas, names) = bind_arrays(tables);
        let query = format!(
            "SELECT n.nspname::text AS schema_name,
                    t.relname::text AS table_name,
                    a.attname::text AS column_name,
                    a.attnum::int4 AS ordinal,
                    NOT a.attnotnull AS is_nullable,
                    a.attgenerated <> '' AS is_computed,
                    (a.attidentity <> '' OR COALESCE(pg_get_expr(d.adbin, d.adrelid) LIKE 'nextval(%', false)) AS is_identity,
                    COALESCE(a.attnum = ANY(pk.conkey), false) AS is_primary_key,
                    CASE WHEN a.attgenerated = '' THEN pg_get_expr(d.adbin, d.adrelid) END AS default_definition
             FROM pg_attribute a
             JOIN pg_class t ON t.oid = a.attrelid
             JOIN pg_namespace n ON n.oid = t.relnamespace
             {}
             LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
             LEFT JOIN pg_constraint pk ON pk.conrelid = t.oid AND pk.contype = 'p'
             WHERE t.relkind IN ('r', 'p') AND a.attnum > 0 AND NOT a.attisdropped
             ORDER BY 1, 2, 4",
            REQUESTED_TABLES
        );

        let rows = sqlx::query(&query)
            .bind(&schemas)
            .bind(&names)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| metadata_error("Failed to load PostgreSQL column metadata", e))?;

        rows.iter()
            .map(|row| {
                let table = table_of(row)?;
                let context = Some(table.table.as_str());
                let ordinal: i32 = row.get_field("ordinal", context)?;
                Ok(CatalogColumn {
                    column: row.get_field("column_name", context)?,
                    ordinal: u32::try_from(ordinal).unwrap_or(0),
                    is_nullable: row.get_field("is_nullable", context)?,
                    is_computed: row.get_field("is_computed", context)?,
                    is_identity: row.get_field("is_identity", context)?,
                    is_primary_key: row.get_field("is_primary_key", context)?,
                    default_definition: row.get_field("default_definition", context)?,
                    schema: table.schema,
                    table: table.table,
                })
            })
            .collect()
    }

    async fn load_row_counts(&self, tables: &[TableId]) -> Result<Vec<TableRowCount>> {
        let (schemas, names) = bind_arrays(tables);
        // reltuples is -1 until the table is first analyzed
        let query = format!(
            "SELECT n.nspname::text AS schema_name,
                    t.relname::text AS table_name,
                    GREATEST(t.reltuples, 0)::int8 AS row_count
             FROM pg_class t
             JOIN pg_namespace n ON n.oid = t.relnamespace
             {}
             WHERE t.relkind IN ('r', 'p')",
            REQUESTED_TABLES
        );

        let rows = sqlx::query(&query)
            .bind(&schemas)
            .bind(&names)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| metadata_error("Failed to load PostgreSQL row estimates", e))?;

        rows.iter()
            .map(|row| {
                Ok(TableRowCount {
                    table: table_of(row)?,
                    row_count: to_count(row.get_field("row_count", None)?),
                })
            })
            .collect()
    }

    async fn load_foreign_keys(&self, tables: &[TableId]) -> Result<Vec<CatalogForeignKey>> {
        let (schemas, names) = bind_arrays(tables);
        let query = format!(
            "SELECT con.conname::text AS name,
                    n.nspname::text AS schema_name,
                    t.relname::text AS table_name,
                    sa.attname::text AS from_column,
                    tn.nspname::text AS to_schema,
                    tt.relname::text AS to_table,
                    ta.attname::text AS to_column,
                    NOT con.convalidated AS is_not_trusted,
                    EXISTS (SELECT 1 FROM pg_trigger tg
                            WHERE tg.tgconstraint = con.oid AND tg.tgenabled = 'D') AS is_disabled
             FROM pg_constraint con
             JOIN pg_class t ON t.oid = con.conrelid
             JOIN pg_namespace n ON n.oid = t.relnamespace
             {}
             JOIN pg_class tt ON tt.oid = con.confrelid
             JOIN pg_namespace tn ON tn.oid = tt.relnamespace
             JOIN pg_attribute sa ON sa.attrelid = con.conrelid AND sa.attnum = con.conkey[1]
             JOIN pg_attribute ta ON ta.attrelid = con.confrelid AND ta.attnum = con.confkey[1]
             WHERE con.contype = 'f' AND array_length(con.conkey, 1) = 1",
            REQUESTED_TABLES
        );

        let rows = sqlx::query(&query)
            .bind(&schemas)
            .bind(&names)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| metadata_error("Failed to load PostgreSQL foreign keys", e))?;

        rows.iter()
            .map(|row| {
                let from = table_of(row)?;
                let context = Some(from.table.as_str());
                Ok(CatalogForeignKey {
                    name: row.get_field("name", context)?,
                    from_column: row.get_field("from_column", context)?,
                    to: TableId::new(
                        row.get_field::<String>("to_schema", context)?,
                        row.get_field::<String>("to_table", context)?,
                    ),
                    to_column: row.get_field("to_column", context)?,
                    is_not_trusted: row.get_field("is_not_trusted", context)?,
                    is_disabled: row.get_field("is_disabled", context)?,
                    from,
                })
            })
            .collect()
    }

    async fn load_unique_indexes(&self, tables: &[TableId]) -> Result<Vec<CatalogUniqueIndex>> {
        let (schemas, names) = bind_arrays(tables);
        // partial and expression indexes do not prove uniqueness of a column set
        let query = format!(
            "SELECT i.relname::text AS name,
                    n.nspname::text AS schema_name,
                    t.relname::text AS table_name,
                    ix.indisprimary AS is_primary_key,
                    array_agg(a.attname::text ORDER BY k.ord) AS columns
             FROM pg_index ix
             JOIN pg_class t ON t.oid = ix.indrelid
             JOIN pg_class i ON i.oid = ix.indexrelid
             JOIN pg_namespace n ON n.oid = t.relnamespace
             {}
             CROSS JOIN LATERAL unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
             JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
             WHERE ix.indisunique AND ix.indpred IS NULL AND ix.indexprs IS NULL
               AND k.ord <= ix.indnkeyatts
             GROUP BY i.relname, n.nspname, t.relname, ix.indisprimary",
            REQUESTED_TABLES
        );

        let rows = sqlx::query(&query)
            .bind(&schemas)
            .bind(&names)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| metadata_error("Failed to load PostgreSQL unique indexes", e))?;

        rows.iter()
            .map(|row| {
                let table = table_of(row)?;
                let context = Some(table.table.as_str());
                Ok(CatalogUniqueIndex {
                    name: row.get_field("name", context)?,
                    columns: row.get_field("columns", context)?,
                    is_primary_key: row.get_field("is_primary_key", context)?,
                    table,
                })
            })
            .collect()
    }

    async fn open_session(&self) -> Result<Box<dyn ProbeSession>> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| probe_error("Failed to acquire PostgreSQL connection", e))?;
        Ok(Box::new(PostgresSession { conn }))
    }
}

struct PostgresSession {
    conn: PoolConnection<Postgres>,
}

fn key_tuple(row: &PgRow, width: usize, table: &str) -> Result<Vec<String>> {
    (0..width)
        .map(|i| {
            row.get_at::<Option<String>>(i, Some(table))
                .map(|v| v.unwrap_or_else(|| "NULL".to_string()))
        })
        .collect()
}

#[async_trait]
impl ProbeSession for PostgresSession {
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
        let counts = (0..columns.len())
            .map(|i| row.get_at::<i64>(i + 1, context).map(to_count))
            .collect::<Result<Vec<u64>>>()?;
        Ok(NullCounts {
            scanned_rows: to_count(row.get_at(0, context)?),
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
        let rows = sqlx::query(
            "SELECT sa.attname::text AS from_column,
                    tn.nspname::text AS to_schema,
                    tt.relname::text AS to_table,
                    (NOT con.convalidated OR EXISTS (
                        SELECT 1 FROM pg_trigger tg
                        WHERE tg.tgconstraint = con.oid AND tg.tgenabled = 'D')) AS is_not_trusted
             FROM pg_constraint con
             JOIN pg_class t ON t.oid = con.conrelid
             JOIN pg_namespace n ON n.oid = t.relnamespace
             JOIN pg_class tt ON tt.oid = con.confrelid
             JOIN pg_namespace tn ON tn.oid = tt.relnamespace
             JOIN pg_attribute sa ON sa.attrelid = con.conrelid AND sa.attnum = con.conkey[1]
             WHERE con.contype = 'f' AND array_length(con.conkey, 1) = 1
               AND n.nspname = $1 AND t.relname = $2",
        )
        .bind(&table.schema)
        .bind(&table.table)
        .fetch_all(&mut *self.conn)
        .await
        .map_err(|e| probe_error(format!("Foreign key trust lookup on {}", table), e))?;

        let context = Some(table.table.as_str());
        rows.iter()
            .map(|row| {
                Ok(ForeignKeyTrust {
                    from_column: row.get_field("from_column", context)?,
                    to: TableId::new(
                        row.get_field::<String>("to_schema", context)?,
                        row.get_field::<String>("to_table", context)?,
                    ),
                    is_not_trusted: row.get_field("is_not_trusted", context)?,
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
            .map(|row| key_tuple(row, key_columns.len(), &table.table))
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
                    key: key_tuple(row, key_columns.len(), &table.table)?,
                    foreign_key_value: row
                        .get_at::<Option<String>>(key_columns.len(), Some(&table.table))?
                        .unwrap_or_default(),
                })
            })
            .collect()
    }
}
