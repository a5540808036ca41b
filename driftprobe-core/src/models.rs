//! Core data models for profiling results.
//!
//! Every profile is keyed by the logical identity the model assigns it
//! (schema, table and column names as the logical model spells them), never
//! by raw catalog rows, so snapshots from different environments line up
//! even when an environment stores a table under a different name.
//!
//! Snapshots are immutable once produced; merges build new values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Schema-qualified table identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId {
    pub schema: String,
    pub table: String,
}

impl TableId {
    /// Creates a new table identity.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Case-insensitive comparison, matching how catalogs are searched.
    pub fn eq_ignore_case(&self, other: &TableId) -> bool {
        self.schema.eq_ignore_ascii_case(&other.schema)
            && self.table.eq_ignore_ascii_case(&other.table)
    }

    /// Lower-cased copy used as a lookup key.
    pub fn folded(&self) -> TableId {
        TableId::new(self.schema.to_lowercase(), self.table.to_lowercase())
    }
}

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Logical identity of one column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnKey {
    pub schema: String,
    pub table: String,
    pub column: String,
}

impl ColumnKey {
    /// Creates a new column key.
    pub fn new(
        schema: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            column: column.into(),
        }
    }

    /// The table this column belongs to.
    pub fn table_id(&self) -> TableId {
        TableId::new(&self.schema, &self.table)
    }
}

impl std::fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.schema, self.table, self.column)
    }
}

/// Logical identity of a (possibly multi-column) unique candidate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CandidateKey {
    pub schema: String,
    pub table: String,
    pub columns: Vec<String>,
}

impl std::fmt::Display for CandidateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}({})", self.schema, self.table, self.columns.join(", "))
    }
}

/// Logical identity of a foreign-key relationship.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ForeignKeyKey {
    pub from_schema: String,
    pub from_table: String,
    pub from_column: String,
    pub to_schema: String,
    pub to_table: String,
}

impl std::fmt::Display for ForeignKeyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{} -> {}.{}",
            self.from_schema, self.from_table, self.from_column, self.to_schema, self.to_table
        )
    }
}

/// Outcome of one probing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// The probe ran to completion
    Succeeded,
    /// Skipped because the engine already enforces the constraint
    TrustedConstraint,
    /// The probe hit a command timeout; the value is the conservative fallback
    FallbackTimeout,
    /// The per-table deadline fired; the value is the conservative fallback
    Cancelled,
    /// The relationship target could not be resolved uniquely; never probed
    AmbiguousMapping,
    /// No probe ran
    #[default]
    Unknown,
}

impl ProbeOutcome {
    /// Rank used by the conservative merge: higher is worse.
    pub fn severity_rank(&self) -> u8 {
        match self {
            ProbeOutcome::Succeeded | ProbeOutcome::TrustedConstraint => 0,
            ProbeOutcome::FallbackTimeout => 1,
            ProbeOutcome::Cancelled => 2,
            ProbeOutcome::AmbiguousMapping => 3,
            ProbeOutcome::Unknown => 4,
        }
    }

    /// True when the evidence is complete enough to judge a constraint.
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            ProbeOutcome::Succeeded | ProbeOutcome::TrustedConstraint
        )
    }
}

impl std::fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ProbeOutcome::Succeeded => "succeeded",
            ProbeOutcome::TrustedConstraint => "trusted constraint",
            ProbeOutcome::FallbackTimeout => "fallback (timeout)",
            ProbeOutcome::Cancelled => "cancelled",
            ProbeOutcome::AmbiguousMapping => "ambiguous mapping",
            ProbeOutcome::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Outcome of a probe plus the sample size used and when it was captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeStatus {
    pub outcome: ProbeOutcome,
    /// Row cap applied to the scan, `None` when the whole table was read
    pub sample_size: Option<u64>,
    pub captured_at: DateTime<Utc>,
}

impl Default for ProbeStatus {
    fn default() -> Self {
        Self::unknown()
    }
}

impl ProbeStatus {
    /// Creates a status captured now.
    pub fn new(outcome: ProbeOutcome, sample_size: Option<u64>) -> Self {
        Self {
            outcome,
            sample_size,
            captured_at: Utc::now(),
        }
    }

    /// Status used when no probe ran.
    pub fn unknown() -> Self {
        Self {
            outcome: ProbeOutcome::Unknown,
            sample_size: None,
            captured_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Probe completed.
    pub fn succeeded(sample_size: Option<u64>) -> Self {
        Self::new(ProbeOutcome::Succeeded, sample_size)
    }

    /// Probe skipped because the database already enforces the constraint.
    pub fn trusted() -> Self {
        Self::new(ProbeOutcome::TrustedConstraint, None)
    }

    /// Relationship target is ambiguous; nothing was probed.
    pub fn ambiguous() -> Self {
        Self::new(ProbeOutcome::AmbiguousMapping, None)
    }

    /// True when the probe produced usable evidence.
    pub fn is_complete(&self) -> bool {
        self.outcome.is_complete()
    }

    /// True when the evidence covers only part of the table.
    pub fn is_sampled(&self) -> bool {
        self.sample_size.is_some()
    }

    /// Conservative merge: the worse outcome wins, carrying its sample size;
    /// the timestamp is the latest of the two.
    pub fn merge(&self, other: &ProbeStatus) -> ProbeStatus {
        let worst = if other.outcome.severity_rank() > self.outcome.severity_rank() {
            other
        } else {
            self
        };
        ProbeStatus {
            outcome: worst.outcome,
            sample_size: worst.sample_size,
            captured_at: self.captured_at.max(other.captured_at),
        }
    }
}

/// Bounded sample of primary-key tuples for rows holding NULL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullRowSample {
    pub key_columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Total offending rows observed (at least `rows.len()`)
    pub total_count: u64,
}

/// One orphaned row: its primary key and the dangling foreign-key value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrphanRow {
    pub key: Vec<String>,
    pub foreign_key_value: String,
}

/// Bounded sample of orphaned rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanRowSample {
    pub key_columns: Vec<String>,
    pub rows: Vec<OrphanRow>,
    /// Total orphans observed (at least `rows.len()`)
    pub total_count: u64,
}

/// Profile of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub schema: String,
    pub table: String,
    pub column: String,
    /// Physical nullability reported by the catalog
    pub is_nullable: bool,
    pub is_computed: bool,
    pub is_identity: bool,
    pub is_primary_key: bool,
    /// The column alone is covered by a unique index
    pub is_single_unique: bool,
    pub default_definition: Option<String>,
    pub row_count: u64,
    pub null_count: u64,
    pub null_probe: ProbeStatus,
    pub null_rows: Option<NullRowSample>,
}

impl ColumnProfile {
    /// Logical identity of this column.
    pub fn key(&self) -> ColumnKey {
        ColumnKey::new(&self.schema, &self.table, &self.column)
    }

    /// True when at least one NULL was observed.
    pub fn has_nulls(&self) -> bool {
        self.null_count > 0
    }
}

/// Profile of a single-column unique candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniqueCandidateProfile {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub has_duplicate: bool,
    pub probe: ProbeStatus,
}

impl UniqueCandidateProfile {
    /// Logical identity of this candidate.
    pub fn key(&self) -> ColumnKey {
        ColumnKey::new(&self.schema, &self.table, &self.column)
    }
}

/// Profile of a multi-column unique candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeUniqueCandidateProfile {
    pub schema: String,
    pub table: String,
    pub columns: Vec<String>,
    pub has_duplicate: bool,
}

impl CompositeUniqueCandidateProfile {
    /// Logical identity of this candidate.
    pub fn key(&self) -> CandidateKey {
        CandidateKey {
            schema: self.schema.clone(),
            table: self.table.clone(),
            columns: self.columns.clone(),
        }
    }
}

/// Immutable description of one foreign-key relationship.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ForeignKeyReference {
    pub from_schema: String,
    pub from_table: String,
    pub from_column: String,
    pub to_schema: String,
    pub to_table: String,
    pub to_column: String,
    /// The logical model declares a database-enforced constraint
    pub has_db_constraint: bool,
}

impl ForeignKeyReference {
    /// Logical identity of this relationship.
    pub fn key(&self) -> ForeignKeyKey {
        ForeignKeyKey {
            from_schema: self.from_schema.clone(),
            from_table: self.from_table.clone(),
            from_column: self.from_column.clone(),
            to_schema: self.to_schema.clone(),
            to_table: self.to_table.clone(),
        }
    }

    /// Source column identity.
    pub fn from_key(&self) -> ColumnKey {
        ColumnKey::new(&self.from_schema, &self.from_table, &self.from_column)
    }
}

/// Observed state of a foreign-key relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyReality {
    pub reference: ForeignKeyReference,
    pub orphan_count: u64,
    pub has_orphans: bool,
    /// The existing database constraint is not trusted or is disabled
    pub is_not_trusted: bool,
    pub probe: ProbeStatus,
    pub orphan_rows: Option<OrphanRowSample>,
}

impl ForeignKeyReality {
    /// Logical identity of this relationship.
    pub fn key(&self) -> ForeignKeyKey {
        self.reference.key()
    }
}

/// All profiles captured for one environment, or one merged view.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub columns: Vec<ColumnProfile>,
    pub unique_candidates: Vec<UniqueCandidateProfile>,
    pub composite_unique_candidates: Vec<CompositeUniqueCandidateProfile>,
    pub foreign_keys: Vec<ForeignKeyReality>,
    /// Physical table names the catalog reported for the profiled tables
    #[serde(default)]
    pub catalog_tables: Vec<TableId>,
}

impl ProfileSnapshot {
    /// Builds a snapshot with every collection sorted by logical identity.
    pub fn new(
        mut columns: Vec<ColumnProfile>,
        mut unique_candidates: Vec<UniqueCandidateProfile>,
        mut composite_unique_candidates: Vec<CompositeUniqueCandidateProfile>,
        mut foreign_keys: Vec<ForeignKeyReality>,
        mut catalog_tables: Vec<TableId>,
    ) -> Self {
        columns.sort_by_key(ColumnProfile::key);
        unique_candidates.sort_by_key(UniqueCandidateProfile::key);
        composite_unique_candidates.sort_by_key(CompositeUniqueCandidateProfile::key);
        foreign_keys.sort_by_key(ForeignKeyReality::key);
        catalog_tables.sort();
        catalog_tables.dedup();
        Self {
            columns,
            unique_candidates,
            composite_unique_candidates,
            foreign_keys,
            catalog_tables,
        }
    }

    /// Looks up a column profile by logical identity.
    pub fn column(&self, key: &ColumnKey) -> Option<&ColumnProfile> {
        self.columns.iter().find(|c| {
            c.schema == key.schema && c.table == key.table && c.column == key.column
        })
    }

    /// Looks up a single-column unique candidate by logical identity.
    pub fn unique_candidate(&self, key: &ColumnKey) -> Option<&UniqueCandidateProfile> {
        self.unique_candidates.iter().find(|c| {
            c.schema == key.schema && c.table == key.table && c.column == key.column
        })
    }

    /// Looks up a foreign key by logical identity.
    pub fn foreign_key(&self, key: &ForeignKeyKey) -> Option<&ForeignKeyReality> {
        self.foreign_keys.iter().find(|fk| &fk.key() == key)
    }

    /// Logical tables that have at least one profiled column.
    pub fn tables(&self) -> BTreeSet<TableId> {
        self.columns
            .iter()
            .map(|c| TableId::new(&c.schema, &c.table))
            .collect()
    }

    /// True when nothing was profiled.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
            && self.unique_candidates.is_empty()
            && self.composite_unique_candidates.is_empty()
            && self.foreign_keys.is_empty()
    }
}

/// Reconciles a table that one environment stores under a different name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableNameMapping {
    /// Identity used by the logical model
    pub model: TableId,
    /// Identity the environment's catalog actually uses
    pub actual: TableId,
}

/// Where an environment's display label came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelSource {
    /// Set explicitly in the environment configuration
    Configured,
    /// Derived from the environment name
    Derived,
}

/// A named, labeled, timed wrapper around one environment's snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilingEnvironmentSnapshot {
    pub name: String,
    pub label: String,
    pub label_source: LabelSource,
    pub is_primary: bool,
    pub captured_at: DateTime<Utc>,
    pub capture_duration_ms: u64,
    pub snapshot: ProfileSnapshot,
    pub table_mappings: Vec<TableNameMapping>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_outcome_ranking() {
        assert!(ProbeOutcome::Unknown.severity_rank() > ProbeOutcome::AmbiguousMapping.severity_rank());
        assert!(ProbeOutcome::AmbiguousMapping.severity_rank() > ProbeOutcome::Cancelled.severity_rank());
        assert!(ProbeOutcome::Cancelled.severity_rank() > ProbeOutcome::FallbackTimeout.severity_rank());
        assert!(ProbeOutcome::FallbackTimeout.severity_rank() > ProbeOutcome::Succeeded.severity_rank());
        assert_eq!(
            ProbeOutcome::Succeeded.severity_rank(),
            ProbeOutcome::TrustedConstraint.severity_rank()
        );
    }

    #[test]
    fn test_probe_status_default_is_unknown() {
        let status = ProbeStatus::default();
        assert_eq!(status.outcome, ProbeOutcome::Unknown);
        assert!(!status.is_complete());
    }

    #[test]
    fn test_probe_status_merge_keeps_worst() {
        let ok = ProbeStatus::succeeded(Some(10_000));
        let timeout = ProbeStatus::new(ProbeOutcome::FallbackTimeout, None);

        let merged = ok.merge(&timeout);
        assert_eq!(merged.outcome, ProbeOutcome::FallbackTimeout);
        assert_eq!(merged.sample_size, None);

        let merged = timeout.merge(&ok);
        assert_eq!(merged.outcome, ProbeOutcome::FallbackTimeout);
        assert!(merged.captured_at >= ok.captured_at.min(timeout.captured_at));
    }

    #[test]
    fn test_snapshot_sorts_by_key() {
        let column = |name: &str| ColumnProfile {
            schema: "dbo".to_string(),
            table: "Orders".to_string(),
            column: name.to_string(),
            is_nullable: true,
            is_computed: false,
            is_identity: false,
            is_primary_key: false,
            is_single_unique: false,
            default_definition: None,
            row_count: 10,
            null_count: 0,
            null_probe: ProbeStatus::succeeded(None),
            null_rows: None,
        };

        let snapshot = ProfileSnapshot::new(
            vec![column("Total"), column("Email")],
            vec![],
            vec![],
            vec![],
            vec![TableId::new("dbo", "Orders"), TableId::new("dbo", "Orders")],
        );

        assert_eq!(snapshot.columns[0].column, "Email");
        assert_eq!(snapshot.catalog_tables.len(), 1);
        assert!(
            snapshot
                .column(&ColumnKey::new("dbo", "Orders", "Total"))
                .is_some()
        );
        assert_eq!(snapshot.tables().len(), 1);
    }

    #[test]
    fn test_table_id_case_folding() {
        let a = TableId::new("dbo", "Orders");
        let b = TableId::new("DBO", "ORDERS");
        assert!(a.eq_ignore_case(&b));
        assert_eq!(a.folded(), b.folded());
        assert_eq!(a.to_string(), "dbo.Orders");
    }
}
