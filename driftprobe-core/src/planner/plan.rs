//! Per-table profiling plans and the accumulator that builds them.

use crate::models::{ForeignKeyReference, TableId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One column to probe.
///
/// `column` is the logical spelling used as the snapshot key; `physical` is
/// the catalog's spelling used in queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedColumn {
    pub column: String,
    pub physical: String,
    pub is_nullable: bool,
    pub is_computed: bool,
    pub is_identity: bool,
    pub is_primary_key: bool,
    pub is_single_unique: bool,
    pub default_definition: Option<String>,
}

/// One unique candidate (one or more columns).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueCandidatePlan {
    pub columns: Vec<String>,
    pub physical: Vec<String>,
    /// A unique index already covers exactly these columns
    pub is_enforced: bool,
}

impl UniqueCandidatePlan {
    /// True for single-column candidates.
    pub fn is_single(&self) -> bool {
        self.columns.len() == 1
    }
}

/// One relationship to check for orphans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyPlan {
    /// Logical identity, keyed by the model's names
    pub reference: ForeignKeyReference,
    pub source_physical: String,
    pub target_physical: TableId,
    pub target_column_physical: String,
    /// The catalog reports a database constraint for this relationship
    pub has_catalog_constraint: bool,
}

/// Immutable probing plan for one table in one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProfilingPlan {
    /// Logical identity (the snapshot key)
    pub table: TableId,
    /// Physical identity when it differs from the logical one
    pub resolved_alias: Option<TableId>,
    pub row_count: u64,
    pub columns: Vec<PlannedColumn>,
    pub unique_candidates: Vec<UniqueCandidatePlan>,
    pub foreign_keys: Vec<ForeignKeyPlan>,
    /// References whose target could not be resolved uniquely; never probed
    pub ambiguous_references: Vec<ForeignKeyReference>,
    /// Physical primary-key columns, in key order
    pub primary_key: Vec<String>,
}

impl TableProfilingPlan {
    /// The table queries run against.
    pub fn physical_table(&self) -> &TableId {
        self.resolved_alias.as_ref().unwrap_or(&self.table)
    }

    /// Looks up a planned column by logical name.
    pub fn column(&self, column: &str) -> Option<&PlannedColumn> {
        self.columns.iter().find(|c| c.column == column)
    }

    /// True when nothing needs a database round trip.
    pub fn is_trivial(&self) -> bool {
        self.columns.is_empty() && self.unique_candidates.is_empty() && self.foreign_keys.is_empty()
    }
}

/// Owned, mutable per-table state used only while planning.
///
/// Several entities may share one table; the accumulator merges them and
/// drops repeats, keeping first-seen order so plans stay deterministic.
#[derive(Debug)]
pub(crate) struct PlanAccumulator {
    table: TableId,
    physical: TableId,
    row_count: u64,
    primary_key: Vec<String>,
    columns: Vec<PlannedColumn>,
    unique_candidates: Vec<UniqueCandidatePlan>,
    foreign_keys: Vec<ForeignKeyPlan>,
    ambiguous_references: Vec<ForeignKeyReference>,
    seen_columns: HashSet<String>,
    seen_candidates: HashSet<Vec<String>>,
    seen_references: HashSet<String>,
}

impl PlanAccumulator {
    pub(crate) fn new(
        table: TableId,
        physical: TableId,
        row_count: u64,
        primary_key: Vec<String>,
    ) -> Self {
        Self {
            table,
            physical,
            row_count,
            primary_key,
            columns: Vec::new(),
            unique_candidates: Vec::new(),
            foreign_keys: Vec::new(),
            ambiguous_references: Vec::new(),
            seen_columns: HashSet::new(),
            seen_candidates: HashSet::new(),
            seen_references: HashSet::new(),
        }
    }

    pub(crate) fn physical(&self) -> &TableId {
        &self.physical
    }

    pub(crate) fn add_column(&mut self, column: PlannedColumn) {
        if self.seen_columns.insert(column.physical.to_lowercase()) {
            self.columns.push(column);
        }
    }

    pub(crate) fn add_unique_candidate(&mut self, candidate: UniqueCandidatePlan) {
        let mut key: Vec<String> = candidate.physical.iter().map(|c| c.to_lowercase()).collect();
        key.sort();
        if self.seen_candidates.insert(key) {
            self.unique_candidates.push(candidate);
        }
    }

    pub(crate) fn add_foreign_key(&mut self, plan: ForeignKeyPlan) {
        if self.seen_references.insert(plan.source_physical.to_lowercase()) {
            self.foreign_keys.push(plan);
        }
    }

    pub(crate) fn add_ambiguous(&mut self, reference: ForeignKeyReference) {
        if self.seen_references.insert(reference.from_column.to_lowercase()) {
            self.ambiguous_references.push(reference);
        }
    }

    /// Freezes the accumulated state.
    pub(crate) fn build(self) -> TableProfilingPlan {
        let resolved_alias = (self.physical != self.table).then_some(self.physical);
        TableProfilingPlan {
            table: self.table,
            resolved_alias,
            row_count: self.row_count,
            columns: self.columns,
            unique_candidates: self.unique_candidates,
            foreign_keys: self.foreign_keys,
            ambiguous_references: self.ambiguous_references,
            primary_key: self.primary_key,
        }
    }
}
