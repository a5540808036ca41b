//! Conservative merge of per-environment snapshots.
//!
//! The merged view is never safer than the least-safe environment: counts
//! take the maximum, flags take "any", probe statuses take the worst outcome
//! and evidence samples are unioned. Profiles present in only one snapshot
//! pass through unchanged.

use crate::models::{
    ColumnProfile, CompositeUniqueCandidateProfile, ForeignKeyReality, NullRowSample,
    OrphanRowSample, ProfileSnapshot, UniqueCandidateProfile,
};
use std::collections::BTreeMap;

/// Folds any number of snapshots into one merged snapshot.
pub fn merge_all<'a>(snapshots: impl IntoIterator<Item = &'a ProfileSnapshot>) -> ProfileSnapshot {
    snapshots
        .into_iter()
        .fold(ProfileSnapshot::default(), |acc, next| merge_snapshots(&acc, next))
}

/// Merges two snapshots pairwise.
pub fn merge_snapshots(left: &ProfileSnapshot, right: &ProfileSnapshot) -> ProfileSnapshot {
    let columns = fold_by_key(&left.columns, &right.columns, ColumnProfile::key, merge_column);
    let unique_candidates = fold_by_key(
        &left.unique_candidates,
        &right.unique_candidates,
        UniqueCandidateProfile::key,
        merge_unique,
    );
    let composite_unique_candidates = fold_by_key(
        &left.composite_unique_candidates,
        &right.composite_unique_candidates,
        CompositeUniqueCandidateProfile::key,
        |a, b| CompositeUniqueCandidateProfile {
            has_duplicate: a.has_duplicate || b.has_duplicate,
            ..a.clone()
        },
    );
    let foreign_keys = fold_by_key(
        &left.foreign_keys,
        &right.foreign_keys,
        ForeignKeyReality::key,
        merge_foreign_key,
    );
    let catalog_tables = left
        .catalog_tables
        .iter()
        .chain(&right.catalog_tables)
        .cloned()
        .collect();

    ProfileSnapshot::new(
        columns,
        unique_candidates,
        composite_unique_candidates,
        foreign_keys,
        catalog_tables,
    )
}

fn fold_by_key<T, K, F, M>(left: &[T], right: &[T], key: F, merge: M) -> Vec<T>
where
    T: Clone,
    K: Ord,
    F: Fn(&T) -> K,
    M: Fn(&T, &T) -> T,
{
    let mut merged: BTreeMap<K, T> = BTreeMap::new();
    for item in left.iter().chain(right) {
        let k = key(item);
        let value = match merged.remove(&k) {
            Some(existing) => merge(&existing, item),
            None => item.clone(),
        };
        merged.insert(k, value);
    }
    merged.into_values().collect()
}

fn merge_column(a: &ColumnProfile, b: &ColumnProfile) -> ColumnProfile {
    let null_count = a.null_count.max(b.null_count);
    let row_count = a.row_count.max(b.row_count).max(null_count);
    ColumnProfile {
        schema: a.schema.clone(),
        table: a.table.clone(),
        column: a.column.clone(),
        is_nullable: a.is_nullable || b.is_nullable,
        is_computed: a.is_computed || b.is_computed,
        is_identity: a.is_identity && b.is_identity,
        is_primary_key: a.is_primary_key && b.is_primary_key,
        is_single_unique: a.is_single_unique && b.is_single_unique,
        default_definition: a
            .default_definition
            .clone()
            .or_else(|| b.default_definition.clone()),
        row_count,
        null_count,
        null_probe: a.null_probe.merge(&b.null_probe),
        null_rows: union_option(&a.null_rows, &b.null_rows, union_null_rows),
    }
}

fn merge_unique(a: &UniqueCandidateProfile, b: &UniqueCandidateProfile) -> UniqueCandidateProfile {
    UniqueCandidateProfile {
        has_duplicate: a.has_duplicate || b.has_duplicate,
        probe: a.probe.merge(&b.probe),
        ..a.clone()
    }
}

fn merge_foreign_key(a: &ForeignKeyReality, b: &ForeignKeyReality) -> ForeignKeyReality {
    let orphan_count = a.orphan_count.max(b.orphan_count);
    let mut reference = a.reference.clone();
    reference.has_db_constraint = a.reference.has_db_constraint || b.reference.has_db_constraint;
    ForeignKeyReality {
        reference,
        orphan_count,
        has_orphans: orphan_count > 0,
        is_not_trusted: a.is_not_trusted || b.is_not_trusted,
        probe: a.probe.merge(&b.probe),
        orphan_rows: union_option(&a.orphan_rows, &b.orphan_rows, union_orphan_rows),
    }
}

fn union_option<T: Clone>(a: &Option<T>, b: &Option<T>, union: fn(&T, &T) -> T) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(union(a, b)),
        (Some(only), None) | (None, Some(only)) => Some(only.clone()),
        (None, None) => None,
    }
}

fn union_null_rows(a: &NullRowSample, b: &NullRowSample) -> NullRowSample {
    let mut rows = a.rows.clone();
    for row in &b.rows {
        if !rows.contains(row) {
            rows.push(row.clone());
        }
    }
    let total_count = a.total_count.max(b.total_count).max(rows.len() as u64);
    NullRowSample {
        key_columns: a.key_columns.clone(),
        rows,
        total_count,
    }
}

fn union_orphan_rows(a: &OrphanRowSample, b: &OrphanRowSample) -> OrphanRowSample {
    let mut rows = a.rows.clone();
    for row in &b.rows {
        if !rows.contains(row) {
            rows.push(row.clone());
        }
    }
    let total_count = a.total_count.max(b.total_count).max(rows.len() as u64);
    OrphanRowSample {
        key_columns: a.key_columns.clone(),
        rows,
        total_count,
    }
}
