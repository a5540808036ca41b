//! In-memory catalog for tests and dry runs.
//!
//! Tables hold JSON rows; `null` (or a missing key) is a SQL NULL. Probe
//! latency and metadata failures can be injected to exercise the timeout,
//! cancellation and retry paths without a database.

use super::{
    CatalogColumn, CatalogForeignKey, CatalogQueryService, CatalogUniqueIndex, ForeignKeyTrust,
    NullCounts, OrphanProbe, ProbeSession, TableRowCount,
};
use crate::error::DriftProbeError;
use crate::models::{OrphanRow, TableId};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One in-memory table.
#[derive(Debug, Clone)]
pub struct MemoryTable {
    id: TableId,
    columns: Vec<CatalogColumn>,
    rows: Vec<serde_json::Map<String, Value>>,
    row_count_estimate: Option<u64>,
}

impl MemoryTable {
    /// Creates an empty table.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            id: TableId::new(schema, table),
            columns: Vec::new(),
            rows: Vec::new(),
            row_count_estimate: None,
        }
    }

    fn push_column(mut self, name: &str, is_nullable: bool, is_primary_key: bool) -> Self {
        let ordinal = self.columns.len() as u32 + 1;
        self.columns.push(CatalogColumn {
            schema: self.id.schema.clone(),
            table: self.id.table.clone(),
            column: name.to_string(),
            ordinal,
            is_nullable,
            is_computed: false,
            is_identity: false,
            is_primary_key,
            default_definition: None,
        });
        self
    }

    /// Adds a nullable column.
    pub fn column(self, name: &str) -> Self {
        self.push_column(name, true, false)
    }

    /// Adds a physically NOT NULL column.
    pub fn not_null_column(self, name: &str) -> Self {
        self.push_column(name, false, false)
    }

    /// Adds a primary-key column.
    pub fn primary_key(self, name: &str) -> Self {
        self.push_column(name, false, true)
    }

    /// Appends rows; each must be a JSON object.
    pub fn with_rows(mut self, rows: impl IntoIterator<Item = Value>) -> Self {
        self.rows.extend(rows.into_iter().filter_map(|row| match row {
            Value::Object(map) => Some(map),
            _ => None,
        }));
        self
    }

    /// Overrides the row count the catalog reports, as a stale estimate would.
    pub fn with_row_count_estimate(mut self, estimate: u64) -> Self {
        self.row_count_estimate = Some(estimate);
        self
    }

    /// Physical identity.
    pub fn id(&self) -> &TableId {
        &self.id
    }

    fn value(&self, row: &serde_json::Map<String, Value>, column: &str) -> Value {
        row.get(column).cloned().unwrap_or(Value::Null)
    }

    fn rows_sampled(&self, sample: Option<u64>) -> &[serde_json::Map<String, Value>] {
        match sample {
            Some(limit) => &self.rows[..self.rows.len().min(limit as usize)],
            None => &self.rows,
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default)]
struct CatalogData {
    tables: Vec<MemoryTable>,
    foreign_keys: Vec<CatalogForeignKey>,
    unique_indexes: Vec<CatalogUniqueIndex>,
    permanent_metadata_failure: bool,
    probe_delay: Option<Duration>,
    session_delay: Option<Duration>,
    probe_timeout_tables: HashSet<TableId>,
}

#[derive(Debug, Default)]
struct Counters {
    transient_metadata_failures: AtomicU32,
    metadata_calls: AtomicU32,
    active_sessions: AtomicUsize,
    peak_sessions: AtomicUsize,
}

/// In-memory [`CatalogQueryService`].
///
/// # Example
/// ```rust
/// use driftprobe_core::catalog::{MemoryCatalog, MemoryTable};
/// use serde_json::json;
///
/// let catalog = MemoryCatalog::new().with_table(
///     MemoryTable::new("dbo", "Orders")
///         .primary_key("Id")
///         .column("Email")
///         .with_rows(vec![json!({"Id": 1, "Email": null})]),
/// );
/// # let _ = catalog;
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    data: Arc<CatalogData>,
    counters: Arc<Counters>,
}

impl MemoryCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    fn data_mut(&mut self) -> &mut CatalogData {
        Arc::make_mut(&mut self.data)
    }

    /// Adds a table.
    pub fn with_table(mut self, table: MemoryTable) -> Self {
        self.data_mut().tables.push(table);
        self
    }

    /// Declares a foreign key.
    pub fn with_foreign_key(
        mut self,
        from: TableId,
        from_column: &str,
        to: TableId,
        to_column: &str,
        is_not_trusted: bool,
    ) -> Self {
        let name = format!("FK_{}_{}", from.table, from_column);
        self.data_mut().foreign_keys.push(CatalogForeignKey {
            name,
            from,
            from_column: from_column.to_string(),
            to,
            to_column: to_column.to_string(),
            is_not_trusted,
            is_disabled: false,
        });
        self
    }

    /// Declares a unique index.
    pub fn with_unique_index(mut self, table: TableId, columns: &[&str]) -> Self {
        let name = format!("UX_{}_{}", table.table, columns.join("_"));
        self.data_mut().unique_indexes.push(CatalogUniqueIndex {
            name,
            table,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            is_primary_key: false,
        });
        self
    }

    /// Fails the next `count` metadata calls with a transient error.
    pub fn with_transient_metadata_failures(self, count: u32) -> Self {
        self.counters
            .transient_metadata_failures
            .store(count, Ordering::SeqCst);
        self
    }

    /// Fails every metadata call with a non-transient error.
    pub fn with_permanent_metadata_failure(mut self) -> Self {
        self.data_mut().permanent_metadata_failure = true;
        self
    }

    /// Delays every probe, to trip command or table timeouts.
    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.data_mut().probe_delay = Some(delay);
        self
    }

    /// Delays every session open, as a busy connection pool would.
    pub fn with_session_delay(mut self, delay: Duration) -> Self {
        self.data_mut().session_delay = Some(delay);
        self
    }

    /// Makes every probe on `table` fail with a driver command timeout.
    pub fn with_probe_timeouts_on(mut self, table: TableId) -> Self {
        self.data_mut().probe_timeout_tables.insert(table);
        self
    }

    /// Number of metadata calls served, failures included.
    pub fn metadata_calls(&self) -> u32 {
        self.counters.metadata_calls.load(Ordering::SeqCst)
    }

    /// Highest number of sessions open at the same time.
    pub fn peak_sessions(&self) -> usize {
        self.counters.peak_sessions.load(Ordering::SeqCst)
    }

    fn check_metadata(&self, what: &str) -> Result<()> {
        self.counters.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if self.data.permanent_metadata_failure {
            return Err(DriftProbeError::catalog_failed(
                format!("Failed to load {}", what),
                std::io::Error::other("catalog unavailable"),
            ));
        }
        let consumed = self
            .counters
            .transient_metadata_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(DriftProbeError::transient(
                format!("Failed to load {}", what),
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset"),
            ));
        }
        Ok(())
    }

    fn matching<'a>(&'a self, tables: &'a [TableId]) -> impl Iterator<Item = &'a MemoryTable> + 'a {
        self.data
            .tables
            .iter()
            .filter(move |t| tables.iter().any(|requested| requested.eq_ignore_case(&t.id)))
    }
}

#[async_trait]
impl CatalogQueryService for MemoryCatalog {
    fn provider_name(&self) -> &'static str {
        "memory"
    }

    async fn load_columns(&self, tables: &[TableId]) -> Result<Vec<CatalogColumn>> {
        self.check_metadata("columns")?;
        Ok(self
            .matching(tables)
            .flat_map(|t| t.columns.iter().cloned())
            .collect())
    }

    async fn load_row_counts(&self, tables: &[TableId]) -> Result<Vec<TableRowCount>> {
        self.check_metadata("row counts")?;
        Ok(self
            .matching(tables)
            .map(|t| TableRowCount {
                table: t.id.clone(),
                row_count: t.row_count_estimate.unwrap_or(t.rows.len() as u64),
            })
            .collect())
    }

    async fn load_foreign_keys(&self, tables: &[TableId]) -> Result<Vec<CatalogForeignKey>> {
        self.check_metadata("foreign keys")?;
        Ok(self
            .data
            .foreign_keys
            .iter()
            .filter(|fk| tables.iter().any(|t| t.eq_ignore_case(&fk.from)))
            .cloned()
            .collect())
    }

    async fn load_unique_indexes(&self, tables: &[TableId]) -> Result<Vec<CatalogUniqueIndex>> {
        self.check_metadata("unique indexes")?;
        let mut indexes: Vec<CatalogUniqueIndex> = self
            .data
            .unique_indexes
            .iter()
            .filter(|ix| tables.iter().any(|t| t.eq_ignore_case(&ix.table)))
            .cloned()
            .collect();
        for table in self.matching(tables) {
            let key: Vec<String> = table
                .columns
                .iter()
                .filter(|c| c.is_primary_key)
                .map(|c| c.column.clone())
                .collect();
            if !key.is_empty() {
                indexes.push(CatalogUniqueIndex {
                    name: format!("PK_{}", table.id.table),
                    table: table.id.clone(),
                    columns: key,
                    is_primary_key: true,
                });
            }
        }
        Ok(indexes)
    }

    async fn open_session(&self) -> Result<Box<dyn ProbeSession>> {
        if let Some(delay) = self.data.session_delay {
            tokio::time::sleep(delay).await;
        }
        let active = self.counters.active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_sessions.fetch_max(active, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            catalog: self.clone(),
        }))
    }
}

struct MemorySession {
    catalog: MemoryCatalog,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.catalog
            .counters
            .active_sessions
            .fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemorySession {
    async fn before_probe(&self, table: &TableId) -> Result<&MemoryTable> {
        let data = &self.catalog.data;
        if let Some(delay) = data.probe_delay {
            tokio::time::sleep(delay).await;
        }
        if data
            .probe_timeout_tables
            .iter()
            .any(|t| t.eq_ignore_case(table))
        {
            return Err(DriftProbeError::query_timeout(
                format!("probe on {}", table),
                None,
            ));
        }
        self.table(table)
    }

    fn table(&self, table: &TableId) -> Result<&MemoryTable> {
        self.catalog
            .data
            .tables
            .iter()
            .find(|t| &t.id == table)
            .ok_or_else(|| DriftProbeError::query_failed(format!("no such table {}", table)))
    }

    fn target_values(&self, probe: &OrphanProbe) -> Result<HashSet<String>> {
        let target = self.table(&probe.target)?;
        Ok(target
            .rows
            .iter()
            .map(|row| target.value(row, &probe.target_column))
            .filter(|v| !v.is_null())
            .map(|v| render(&v))
            .collect())
    }
}

#[async_trait]
impl ProbeSession for MemorySession {
    async fn count_nulls(
        &mut self,
        table: &TableId,
        columns: &[String],
        sample: Option<u64>,
    ) -> Result<NullCounts> {
        let data = self.before_probe(table).await?;
        let rows = data.rows_sampled(sample);
        let counts = columns
            .iter()
            .map(|c| rows.iter().filter(|row| data.value(row, c).is_null()).count() as u64)
            .collect();
        Ok(NullCounts {
            scanned_rows: rows.len() as u64,
            counts,
        })
    }

    async fn detect_duplicates(
        &mut self,
        table: &TableId,
        candidates: &[Vec<String>],
        sample: Option<u64>,
    ) -> Result<Vec<bool>> {
        let data = self.before_probe(table).await?;
        let rows = data.rows_sampled(sample);
        Ok(candidates
            .iter()
            .map(|columns| {
                let mut seen = HashSet::new();
                rows.iter()
                    .filter_map(|row| {
                        let values: Vec<Value> =
                            columns.iter().map(|c| data.value(row, c)).collect();
                        (!values.iter().any(Value::is_null)).then(|| Value::Array(values).to_string())
                    })
                    .any(|key| !seen.insert(key))
            })
            .collect())
    }

    async fn count_orphans(
        &mut self,
        table: &TableId,
        probes: &[OrphanProbe],
        sample: Option<u64>,
    ) -> Result<Vec<u64>> {
        let data = self.before_probe(table).await?;
        let rows = data.rows_sampled(sample);
        let mut counts = Vec::with_capacity(probes.len());
        for probe in probes {
            let targets = self.target_values(probe)?;
            let orphans = rows
                .iter()
                .map(|row| data.value(row, &probe.column))
                .filter(|v| !v.is_null() && !targets.contains(&render(v)))
                .count();
            counts.push(orphans as u64);
        }
        Ok(counts)
    }

    async fn foreign_key_trust(&mut self, table: &TableId) -> Result<Vec<ForeignKeyTrust>> {
        self.before_probe(table).await?;
        Ok(self
            .catalog
            .data
            .foreign_keys
            .iter()
            .filter(|fk| &fk.from == table)
            .map(|fk| ForeignKeyTrust {
                from_column: fk.from_column.clone(),
                to: fk.to.clone(),
                is_not_trusted: fk.is_not_trusted || fk.is_disabled,
            })
            .collect())
    }

    async fn null_row_sample(
        &mut self,
        table: &TableId,
        column: &str,
        key_columns: &[String],
        limit: u32,
    ) -> Result<Vec<Vec<String>>> {
        let data = self.before_probe(table).await?;
        Ok(data
            .rows
            .iter()
            .filter(|row| data.value(row, column).is_null())
            .take(limit as usize)
            .map(|row| key_columns.iter().map(|k| render(&data.value(row, k))).collect())
            .collect())
    }

    async fn orphan_row_sample(
        &mut self,
        table: &TableId,
        probe: &OrphanProbe,
        key_columns: &[String],
        limit: u32,
    ) -> Result<Vec<OrphanRow>> {
        let data = self.before_probe(table).await?;
        let targets = self.target_values(probe)?;
        Ok(data
            .rows
            .iter()
            .filter_map(|row| {
                let value = data.value(row, &probe.column);
                (!value.is_null() && !targets.contains(&render(&value))).then(|| OrphanRow {
                    key: key_columns.iter().map(|k| render(&data.value(row, k))).collect(),
                    foreign_key_value: render(&value),
                })
            })
            .take(limit as usize)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> MemoryCatalog {
        MemoryCatalog::new()
            .with_table(
                MemoryTable::new("dbo", "Customers")
                    .primary_key("Id")
                    .with_rows(vec![json!({"Id": 1}), json!({"Id": 2})]),
            )
            .with_table(
                MemoryTable::new("dbo", "Orders")
                    .primary_key("Id")
                    .column("Email")
                    .column("CustomerId")
                    .with_rows(vec![
                        json!({"Id": 1, "Email": "a@x", "CustomerId": 1}),
                        json!({"Id": 2, "Email": null, "CustomerId": 9}),
                        json!({"Id": 3, "Email": "a@x", "CustomerId": null}),
                    ]),
            )
            .with_foreign_key(
                TableId::new("dbo", "Orders"),
                "CustomerId",
                TableId::new("dbo", "Customers"),
                "Id",
                true,
            )
    }

    fn orphan_probe() -> OrphanProbe {
        OrphanProbe {
            column: "CustomerId".to_string(),
            target: TableId::new("dbo", "Customers"),
            target_column: "Id".to_string(),
        }
    }

    #[tokio::test]
    async fn test_metadata_is_case_insensitive() {
        let catalog = catalog();
        let columns = catalog
            .load_columns(&[TableId::new("DBO", "orders")])
            .await
            .expect("columns");
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0].table, "Orders");

        let indexes = catalog
            .load_unique_indexes(&[TableId::new("dbo", "Orders")])
            .await
            .expect("indexes");
        assert!(indexes.iter().any(|ix| ix.is_primary_key && ix.columns == vec!["Id"]));
    }

    #[tokio::test]
    async fn test_probes() {
        let catalog = catalog();
        let orders = TableId::new("dbo", "Orders");
        let mut session = catalog.open_session().await.expect("session");

        let nulls = session
            .count_nulls(&orders, &["Email".to_string(), "Id".to_string()], None)
            .await
            .expect("nulls");
        assert_eq!(nulls.scanned_rows, 3);
        assert_eq!(nulls.counts, vec![1, 0]);

        let sampled = session
            .count_nulls(&orders, &["Email".to_string()], Some(1))
            .await
            .expect("nulls");
        assert_eq!(sampled.scanned_rows, 1);
        assert_eq!(sampled.counts, vec![0]);

        let dups = session
            .detect_duplicates(&orders, &[vec!["Email".to_string()], vec!["Id".to_string()]], None)
            .await
            .expect("dups");
        assert_eq!(dups, vec![true, false]);

        let orphans = session
            .count_orphans(&orders, &[orphan_probe()], None)
            .await
            .expect("orphans");
        assert_eq!(orphans, vec![1]);

        let rows = session
            .orphan_row_sample(&orders, &orphan_probe(), &["Id".to_string()], 10)
            .await
            .expect("sample");
        assert_eq!(
            rows,
            vec![OrphanRow {
                key: vec!["2".to_string()],
                foreign_key_value: "9".to_string()
            }]
        );

        let null_rows = session
            .null_row_sample(&orders, "Email", &["Id".to_string()], 10)
            .await
            .expect("sample");
        assert_eq!(null_rows, vec![vec!["2".to_string()]]);

        let trust = session.foreign_key_trust(&orders).await.expect("trust");
        assert_eq!(trust.len(), 1);
        assert!(trust[0].is_not_trusted);
    }

    #[tokio::test]
    async fn test_transient_failures_are_consumed() {
        let catalog = catalog().with_transient_metadata_failures(1);
        let tables = [TableId::new("dbo", "Orders")];
        let err = catalog.load_columns(&tables).await.expect_err("first call fails");
        assert!(err.is_transient());
        assert!(catalog.load_columns(&tables).await.is_ok());
        assert_eq!(catalog.metadata_calls(), 2);
    }

    #[tokio::test]
    async fn test_session_tracking() {
        let catalog = catalog();
        let a = catalog.open_session().await.expect("session");
        let b = catalog.open_session().await.expect("session");
        drop(a);
        drop(b);
        let _c = catalog.open_session().await.expect("session");
        assert_eq!(catalog.peak_sessions(), 2);
    }
}
