//! Catalog query service.
//!
//! The profiler reaches every database through two narrow traits:
//! [`CatalogQueryService`] loads batched metadata for a set of tables, and
//! [`ProbeSession`] runs the data probes for one table on one dedicated
//! connection. SQL dialect details stay behind these traits.
//!
//! # Security
//! Every statement issued through this module is a read. SQL sessions are
//! opened read-only and connection URLs are redacted in all errors.

use crate::config::ConnectionConfig;
use crate::error::DriftProbeError;
use crate::models::{OrphanRow, TableId};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub mod memory;
#[cfg(feature = "postgresql")]
pub mod postgres;
#[cfg(any(feature = "postgresql", feature = "sqlite"))]
pub(crate) mod sql;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{MemoryCatalog, MemoryTable};

/// Column metadata as the catalog reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogColumn {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub ordinal: u32,
    pub is_nullable: bool,
    pub is_computed: bool,
    pub is_identity: bool,
    pub is_primary_key: bool,
    pub default_definition: Option<String>,
}

impl CatalogColumn {
    /// Table this column belongs to.
    pub fn table_id(&self) -> TableId {
        TableId::new(&self.schema, &self.table)
    }
}

/// Row count (exact or estimated) for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRowCount {
    pub table: TableId,
    pub row_count: u64,
}

/// A declared single-column foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogForeignKey {
    pub name: String,
    pub from: TableId,
    pub from_column: String,
    pub to: TableId,
    pub to_column: String,
    /// Created without validating existing rows
    pub is_not_trusted: bool,
    /// Enforcement switched off
    pub is_disabled: bool,
}

/// A unique index (or primary key) over one or more columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogUniqueIndex {
    pub name: String,
    pub table: TableId,
    pub columns: Vec<String>,
    pub is_primary_key: bool,
}

/// Trust state of one foreign key, read at probe time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyTrust {
    pub from_column: String,
    pub to: TableId,
    pub is_not_trusted: bool,
}

/// One relationship to count orphans for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanProbe {
    pub column: String,
    pub target: TableId,
    pub target_column: String,
}

/// Result of a null-count probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullCounts {
    /// Rows actually scanned (the sample size when sampling)
    pub scanned_rows: u64,
    /// One count per requested column, in request order
    pub counts: Vec<u64>,
}

/// Everything the catalog reported for the tables of one environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogSnapshot {
    pub columns: Vec<CatalogColumn>,
    pub row_counts: Vec<TableRowCount>,
    pub foreign_keys: Vec<CatalogForeignKey>,
    pub unique_indexes: Vec<CatalogUniqueIndex>,
}

impl CatalogSnapshot {
    /// Appends one metadata batch.
    pub fn extend(&mut self, other: CatalogSnapshot) {
        self.columns.extend(other.columns);
        self.row_counts.extend(other.row_counts);
        self.foreign_keys.extend(other.foreign_keys);
        self.unique_indexes.extend(other.unique_indexes);
    }

    /// Physical tables that reported at least one column.
    pub fn tables(&self) -> Vec<TableId> {
        let mut tables: Vec<TableId> = self.columns.iter().map(CatalogColumn::table_id).collect();
        tables.sort();
        tables.dedup();
        tables
    }

    /// Physical tables matching `table` case-insensitively.
    pub fn matching_tables(&self, table: &TableId) -> Vec<TableId> {
        self.tables()
            .into_iter()
            .filter(|candidate| candidate.eq_ignore_case(table))
            .collect()
    }

    /// Columns of one physical table in ordinal order.
    pub fn columns_of(&self, table: &TableId) -> Vec<&CatalogColumn> {
        let mut columns: Vec<&CatalogColumn> = self
            .columns
            .iter()
            .filter(|c| c.schema == table.schema && c.table == table.table)
            .collect();
        columns.sort_by_key(|c| c.ordinal);
        columns
    }

    /// Row count of one physical table, zero when unknown.
    pub fn row_count(&self, table: &TableId) -> u64 {
        self.row_counts
            .iter()
            .find(|r| &r.table == table)
            .map_or(0, |r| r.row_count)
    }

    /// Foreign keys declared on one physical table.
    pub fn foreign_keys_from(&self, table: &TableId) -> Vec<&CatalogForeignKey> {
        self.foreign_keys.iter().filter(|fk| &fk.from == table).collect()
    }

    /// Unique indexes on one physical table.
    pub fn unique_indexes_on(&self, table: &TableId) -> Vec<&CatalogUniqueIndex> {
        self.unique_indexes
            .iter()
            .filter(|ix| &ix.table == table)
            .collect()
    }

    /// Folded-name index of tables to their physical identities.
    pub fn table_index(&self) -> HashMap<TableId, Vec<TableId>> {
        let mut index: HashMap<TableId, Vec<TableId>> = HashMap::new();
        for table in self.tables() {
            index.entry(table.folded()).or_default().push(table);
        }
        index
    }
}

/// Batched metadata access for one environment.
///
/// Lookups match schema and table names case-insensitively and report the
/// catalog's own spelling.
#[async_trait]
pub trait CatalogQueryService: Send + Sync {
    /// Short provider name for logs.
    fn provider_name(&self) -> &'static str;

    /// Column metadata for `tables`.
    async fn load_columns(&self, tables: &[TableId]) -> Result<Vec<CatalogColumn>>;

    /// Row counts for `tables`.
    async fn load_row_counts(&self, tables: &[TableId]) -> Result<Vec<TableRowCount>>;

    /// Declared single-column foreign keys originating in `tables`.
    async fn load_foreign_keys(&self, tables: &[TableId]) -> Result<Vec<CatalogForeignKey>>;

    /// Unique indexes and primary keys on `tables`.
    async fn load_unique_indexes(&self, tables: &[TableId]) -> Result<Vec<CatalogUniqueIndex>>;

    /// Opens a dedicated session for probing one table.
    async fn open_session(&self) -> Result<Box<dyn ProbeSession>>;

    /// Loads all metadata for one batch of tables.
    async fn load_batch(&self, tables: &[TableId]) -> Result<CatalogSnapshot> {
        Ok(CatalogSnapshot {
            columns: self.load_columns(tables).await?,
            row_counts: self.load_row_counts(tables).await?,
            foreign_keys: self.load_foreign_keys(tables).await?,
            unique_indexes: self.load_unique_indexes(tables).await?,
        })
    }
}

/// Data probes for one table over one dedicated connection.
///
/// `sample` caps the rows scanned; `None` reads the whole table.
#[async_trait]
pub trait ProbeSession: Send {
    /// Counts NULLs in every column with one query.
    async fn count_nulls(
        &mut self,
        table: &TableId,
        columns: &[String],
        sample: Option<u64>,
    ) -> Result<NullCounts>;

    /// Reports, per candidate, whether a duplicate group exists.
    ///
    /// Rows where any candidate column is NULL are ignored.
    async fn detect_duplicates(
        &mut self,
        table: &TableId,
        candidates: &[Vec<String>],
        sample: Option<u64>,
    ) -> Result<Vec<bool>>;

    /// Counts non-null source values with no matching target row.
    async fn count_orphans(
        &mut self,
        table: &TableId,
        probes: &[OrphanProbe],
        sample: Option<u64>,
    ) -> Result<Vec<u64>>;

    /// Trust state of the foreign keys declared on `table`. Never sampled.
    async fn foreign_key_trust(&mut self, table: &TableId) -> Result<Vec<ForeignKeyTrust>>;

    /// Primary-key tuples of rows where `column` is NULL.
    async fn null_row_sample(
        &mut self,
        table: &TableId,
        column: &str,
        key_columns: &[String],
        limit: u32,
    ) -> Result<Vec<Vec<String>>>;

    /// Primary-key tuples and dangling values of orphaned rows.
    async fn orphan_row_sample(
        &mut self,
        table: &TableId,
        probe: &OrphanProbe,
        key_columns: &[String],
        limit: u32,
    ) -> Result<Vec<OrphanRow>>;
}

/// Supported SQL engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    PostgreSql,
    Sqlite,
}

/// Detects the engine from a connection URL.
///
/// # Errors
/// Returns a configuration error for unrecognized schemes
pub fn detect_database_kind(connection_string: &str) -> Result<DatabaseKind> {
    if connection_string.starts_with("postgres://") || connection_string.starts_with("postgresql://")
    {
        Ok(DatabaseKind::PostgreSql)
    } else if connection_string.starts_with("sqlite:")
        || connection_string.ends_with(".db")
        || connection_string.ends_with(".sqlite")
        || connection_string.ends_with(".sqlite3")
    {
        Ok(DatabaseKind::Sqlite)
    } else {
        Err(DriftProbeError::configuration(
            "Unrecognized database connection string format",
        ))
    }
}

/// Creates the catalog service for a connection URL.
///
/// Pools are created lazily, so this does not touch the network.
///
/// # Errors
/// Returns an error for unsupported engines or invalid URLs
pub fn create_catalog(
    connection_string: &str,
    config: &ConnectionConfig,
) -> Result<Arc<dyn CatalogQueryService>> {
    config.validate()?;
    match detect_database_kind(connection_string)? {
        #[cfg(feature = "postgresql")]
        DatabaseKind::PostgreSql => Ok(Arc::new(postgres::PostgresCatalog::connect_lazy(
            connection_string,
            config,
        )?)),
        #[cfg(not(feature = "postgresql"))]
        DatabaseKind::PostgreSql => Err(DriftProbeError::unsupported_feature(
            "PostgreSQL catalog",
            "Compile with --features postgresql to enable PostgreSQL support",
        )),
        #[cfg(feature = "sqlite")]
        DatabaseKind::Sqlite => Ok(Arc::new(sqlite::SqliteCatalog::connect_lazy(
            connection_string,
            config,
        )?)),
        #[cfg(not(feature = "sqlite"))]
        DatabaseKind::Sqlite => Err(DriftProbeError::unsupported_feature(
            "SQLite catalog",
            "Compile with --features sqlite to enable SQLite support",
        )),
    }
}

/// Maps a driver error raised while loading metadata.
#[cfg(any(feature = "postgresql", feature = "sqlite"))]
pub(crate) fn metadata_error(context: impl Into<String>, error: sqlx::Error) -> DriftProbeError {
    let context = context.into();
    match classify_sqlx_error(&error) {
        SqlxErrorClass::Transient => DriftProbeError::transient(context, error),
        SqlxErrorClass::Timeout => DriftProbeError::query_timeout(context, None),
        SqlxErrorClass::Other => DriftProbeError::catalog_failed(context, error),
    }
}

/// Maps a driver error raised by a probe.
#[cfg(any(feature = "postgresql", feature = "sqlite"))]
pub(crate) fn probe_error(context: impl Into<String>, error: sqlx::Error) -> DriftProbeError {
    let context = context.into();
    match classify_sqlx_error(&error) {
        SqlxErrorClass::Timeout => DriftProbeError::query_timeout(context, None),
        SqlxErrorClass::Transient => DriftProbeError::transient(context, error),
        SqlxErrorClass::Other => DriftProbeError::query_failed(format!("{}: {}", context, error)),
    }
}

#[cfg(any(feature = "postgresql", feature = "sqlite"))]
#[derive(Debug, PartialEq, Eq)]
enum SqlxErrorClass {
    Timeout,
    Transient,
    Other,
}

#[cfg(any(feature = "postgresql", feature = "sqlite"))]
fn classify_sqlx_error(error: &sqlx::Error) -> SqlxErrorClass {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => SqlxErrorClass::Transient,
        sqlx::Error::Database(db) => classify_sql_state(db.code().as_deref()),
        _ => SqlxErrorClass::Other,
    }
}

/// Classifies a PostgreSQL SQLSTATE or SQLite result code.
#[cfg(any(feature = "postgresql", feature = "sqlite"))]
fn classify_sql_state(code: Option<&str>) -> SqlxErrorClass {
    match code {
        // query_canceled: raised when statement_timeout fires
        Some("57014") => SqlxErrorClass::Timeout,
        // connection exceptions, serialization failures, deadlocks,
        // too many connections, admin shutdown
        Some(code) if code.starts_with("08") => SqlxErrorClass::Transient,
        Some("40001" | "40P01" | "53300" | "57P01") => SqlxErrorClass::Transient,
        // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
        Some("5" | "6" | "261" | "262" | "517") => SqlxErrorClass::Transient,
        _ => SqlxErrorClass::Other,
    }
}
