//! Query executor.
//!
//! Runs one table's plan against a probe session: one round trip per
//! concern (null counts, duplicate existence, orphan counts), a non-sampled
//! foreign-key trust lookup, and bounded evidence samples for offending
//! rows. Every probe goes through the [`ProbePolicy`], so a slow table
//! degrades to conservative values instead of failing the run.
//!
//! Conservative fallbacks:
//! - null count = row count
//! - duplicate = true
//! - orphan count = row count
//! - not trusted = true
//!
//! Row counts come from catalog estimates, which read 0 for tables the
//! server has never analyzed. Fallback counts are therefore at least 1, so
//! a degraded probe never reports a clean column or relationship.

use crate::cancellation::TableScope;
use crate::catalog::{NullCounts, OrphanProbe, ProbeSession};
use crate::config::ProfilingOptions;
use crate::models::{
    ColumnProfile, CompositeUniqueCandidateProfile, ForeignKeyReality, NullRowSample,
    OrphanRowSample, ProbeOutcome, ProbeStatus, TableId, UniqueCandidateProfile,
};
use crate::planner::{ForeignKeyPlan, TableProfilingPlan};
use crate::probe::{ProbePolicy, Probed};
use crate::recorder::{ProfilingEvent, SharedRecorder, record};
use crate::Result;

/// Everything observed for one table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableProfile {
    pub columns: Vec<ColumnProfile>,
    pub unique_candidates: Vec<UniqueCandidateProfile>,
    pub composite_unique_candidates: Vec<CompositeUniqueCandidateProfile>,
    pub foreign_keys: Vec<ForeignKeyReality>,
}

/// Executes table plans for one environment.
pub struct QueryExecutor<'a> {
    environment: &'a str,
    options: &'a ProfilingOptions,
    recorder: Option<&'a SharedRecorder>,
}

impl<'a> QueryExecutor<'a> {
    /// Creates an executor.
    pub fn new(
        environment: &'a str,
        options: &'a ProfilingOptions,
        recorder: Option<&'a SharedRecorder>,
    ) -> Self {
        Self {
            environment,
            options,
            recorder,
        }
    }

    /// Profiles one table.
    ///
    /// # Errors
    /// Returns an error when the enclosing scope is cancelled or a probe
    /// fails with anything other than a timeout.
    pub async fn execute(
        &self,
        plan: &TableProfilingPlan,
        session: &mut dyn ProbeSession,
        scope: &TableScope,
    ) -> Result<TableProfile> {
        let policy = ProbePolicy::new(scope, self.options.command_timeout());
        let physical = plan.physical_table().clone();
        let sample = self.options.sample_cap(plan.row_count);

        let (row_count, columns) = self
            .profile_columns(plan, &physical, sample, session, &policy)
            .await?;
        let (unique_candidates, composite_unique_candidates) = self
            .profile_unique_candidates(plan, &physical, sample, session, &policy)
            .await?;
        let foreign_keys = self
            .profile_foreign_keys(plan, &physical, row_count, sample, session, &policy)
            .await?;

        Ok(TableProfile {
            columns,
            unique_candidates,
            composite_unique_candidates,
            foreign_keys,
        })
    }

    async fn profile_columns(
        &self,
        plan: &TableProfilingPlan,
        physical: &TableId,
        sample: Option<u64>,
        session: &mut dyn ProbeSession,
        policy: &ProbePolicy<'_>,
    ) -> Result<(u64, Vec<ColumnProfile>)> {
        let probed: Vec<&str> = plan
            .columns
            .iter()
            .filter(|c| c.is_nullable)
            .map(|c| c.physical.as_str())
            .collect();

        let mut row_count = plan.row_count;
        let nulls = if probed.is_empty() {
            None
        } else {
            let names: Vec<String> = probed.iter().map(|c| (*c).to_string()).collect();
            let fallback = NullCounts {
                scanned_rows: plan.row_count,
                counts: vec![fallback_count(plan.row_count); names.len()],
            };
            let result = policy
                .run(
                    &format!("null counts on {}", physical),
                    sample,
                    fallback,
                    session.count_nulls(physical, &names, sample),
                )
                .await?;
            self.note_degraded(plan, "null counts", &result);
            // an unsampled scan is exact; estimates must not under-report it
            if sample.is_none() && result.status.outcome == ProbeOutcome::Succeeded {
                row_count = row_count.max(result.value.scanned_rows);
            }
            Some(result)
        };

        let mut profiles = Vec::with_capacity(plan.columns.len());
        for column in &plan.columns {
            let position = probed.iter().position(|p| *p == column.physical);
            let (null_count, status) = match (&nulls, position) {
                (Some(result), Some(i)) => (
                    result
                        .value
                        .counts
                        .get(i)
                        .copied()
                        .unwrap_or_else(|| fallback_count(row_count)),
                    result.status.clone(),
                ),
                _ => (0, ProbeStatus::trusted()),
            };

            let null_rows = if null_count > 0 && status.outcome == ProbeOutcome::Succeeded {
                self.null_evidence(plan, physical, &column.physical, null_count, session, policy)
                    .await?
            } else {
                None
            };

            profiles.push(ColumnProfile {
                schema: plan.table.schema.clone(),
                table: plan.table.table.clone(),
                column: column.column.clone(),
                is_nullable: column.is_nullable,
                is_computed: column.is_computed,
                is_identity: column.is_identity,
                is_primary_key: column.is_primary_key,
                is_single_unique: column.is_single_unique,
                default_definition: column.default_definition.clone(),
                row_count: row_count.max(null_count),
                null_count,
                null_probe: status,
                null_rows,
            });
        }
        Ok((row_count, profiles))
    }

    async fn profile_unique_candidates(
        &self,
        plan: &TableProfilingPlan,
        physical: &TableId,
        sample: Option<u64>,
        session: &mut dyn ProbeSession,
        policy: &ProbePolicy<'_>,
    ) -> Result<(Vec<UniqueCandidateProfile>, Vec<CompositeUniqueCandidateProfile>)> {
        let probed: Vec<Vec<String>> = plan
            .unique_candidates
            .iter()
            .filter(|c| !c.is_enforced)
            .map(|c| c.physical.clone())
            .collect();

        let duplicates = if probed.is_empty() {
            None
        } else {
            let result = policy
                .run(
                    &format!("duplicate detection on {}", physical),
                    sample,
                    vec![true; probed.len()],
                    session.detect_duplicates(physical, &probed, sample),
                )
                .await?;
            self.note_degraded(plan, "duplicate detection", &result);
            Some(result)
        };

        let mut singles = Vec::new();
        let mut composites = Vec::new();
        let mut next = 0;
        for candidate in &plan.unique_candidates {
            let (has_duplicate, status) = if candidate.is_enforced {
                (false, ProbeStatus::trusted())
            } else {
                let index = next;
                next += 1;
                match &duplicates {
                    Some(result) => (
                        result.value.get(index).copied().unwrap_or(true),
                        result.status.clone(),
                    ),
                    None => (true, ProbeStatus::unknown()),
                }
            };

            if let [column] = candidate.columns.as_slice() {
                singles.push(UniqueCandidateProfile {
                    schema: plan.table.schema.clone(),
                    table: plan.table.table.clone(),
                    column: column.clone(),
                    has_duplicate,
                    probe: status,
                });
            } else {
                // composite candidates carry no status; a degraded probe
                // already reports the conservative duplicate = true
                composites.push(CompositeUniqueCandidateProfile {
                    schema: plan.table.schema.clone(),
                    table: plan.table.table.clone(),
                    columns: candidate.columns.clone(),
                    has_duplicate,
                });
            }
        }
        Ok((singles, composites))
    }

    async fn profile_foreign_keys(
        &self,
        plan: &TableProfilingPlan,
        physical: &TableId,
        row_count: u64,
        sample: Option<u64>,
        session: &mut dyn ProbeSession,
        policy: &ProbePolicy<'_>,
    ) -> Result<Vec<ForeignKeyReality>> {
        let mut realities = Vec::with_capacity(plan.foreign_keys.len());

        // trust state is read live and never sampled
        let trusted: Vec<bool> = if plan.foreign_keys.iter().any(|fk| fk.has_catalog_constraint) {
            let result = policy
                .run(
                    &format!("foreign key trust on {}", physical),
                    None,
                    Vec::new(),
                    session.foreign_key_trust(physical),
                )
                .await?;
            self.note_degraded(plan, "foreign key trust", &result);
            plan.foreign_keys
                .iter()
                .map(|fk| {
                    fk.has_catalog_constraint
                        && result.status.outcome == ProbeOutcome::Succeeded
                        && result.value.iter().any(|t| {
                            t.from_column.eq_ignore_ascii_case(&fk.source_physical)
                                && t.to.eq_ignore_case(&fk.target_physical)
                                && !t.is_not_trusted
                        })
                })
                .collect()
        } else {
            vec![false; plan.foreign_keys.len()]
        };

        let probed: Vec<&ForeignKeyPlan> = plan
            .foreign_keys
            .iter()
            .zip(&trusted)
            .filter(|(_, trusted)| !**trusted)
            .map(|(fk, _)| fk)
            .collect();
        let orphans = if probed.is_empty() {
            None
        } else {
            let probes: Vec<OrphanProbe> = probed.iter().map(|fk| orphan_probe(fk)).collect();
            let result = policy
                .run(
                    &format!("orphan detection on {}", physical),
                    sample,
                    vec![fallback_count(row_count); probes.len()],
                    session.count_orphans(physical, &probes, sample),
                )
                .await?;
            self.note_degraded(plan, "orphan detection", &result);
            Some(result)
        };

        let mut next = 0;
        for (fk, is_trusted) in plan.foreign_keys.iter().zip(trusted) {
            if is_trusted {
                realities.push(ForeignKeyReality {
                    reference: fk.reference.clone(),
                    orphan_count: 0,
                    has_orphans: false,
                    is_not_trusted: false,
                    probe: ProbeStatus::trusted(),
                    orphan_rows: None,
                });
                continue;
            }

            let index = next;
            next += 1;
            let (orphan_count, status) = match &orphans {
                Some(result) => (
                    result
                        .value
                        .get(index)
                        .copied()
                        .unwrap_or_else(|| fallback_count(row_count)),
                    result.status.clone(),
                ),
                None => (fallback_count(row_count), ProbeStatus::unknown()),
            };

            let orphan_rows = if orphan_count > 0 && status.outcome == ProbeOutcome::Succeeded {
                self.orphan_evidence(plan, physical, fk, orphan_count, session, policy)
                    .await?
            } else {
                None
            };

            realities.push(ForeignKeyReality {
                reference: fk.reference.clone(),
                orphan_count,
                has_orphans: orphan_count > 0,
                is_not_trusted: fk.has_catalog_constraint,
                probe: status,
                orphan_rows,
            });
        }

        for reference in &plan.ambiguous_references {
            record(self.recorder, || ProfilingEvent::RelationshipAmbiguous {
                environment: self.environment.to_string(),
                relationship: format!(
                    "{}.{}.{} -> {}",
                    reference.from_schema,
                    reference.from_table,
                    reference.from_column,
                    reference.to_table
                ),
            });
            realities.push(ForeignKeyReality {
                reference: reference.clone(),
                orphan_count: 0,
                has_orphans: false,
                is_not_trusted: false,
                probe: ProbeStatus::ambiguous(),
                orphan_rows: None,
            });
        }

        Ok(realities)
    }

    async fn null_evidence(
        &self,
        plan: &TableProfilingPlan,
        physical: &TableId,
        column: &str,
        null_count: u64,
        session: &mut dyn ProbeSession,
        policy: &ProbePolicy<'_>,
    ) -> Result<Option<NullRowSample>> {
        let limit = self.options.evidence_sample_size;
        if limit == 0 {
            return Ok(None);
        }
        let rows = if plan.primary_key.is_empty() {
            Vec::new()
        } else {
            let result = policy
                .run(
                    &format!("null row sample on {}.{}", physical, column),
                    None,
                    Vec::new(),
                    session.null_row_sample(physical, column, &plan.primary_key, limit),
                )
                .await;
            evidence_or_empty(result, physical)?
        };
        Ok(Some(NullRowSample {
            key_columns: plan.primary_key.clone(),
            total_count: null_count.max(rows.len() as u64),
            rows,
        }))
    }

    async fn orphan_evidence(
        &self,
        plan: &TableProfilingPlan,
        physical: &TableId,
        fk: &ForeignKeyPlan,
        orphan_count: u64,
        session: &mut dyn ProbeSession,
        policy: &ProbePolicy<'_>,
    ) -> Result<Option<OrphanRowSample>> {
        let limit = self.options.evidence_sample_size;
        if limit == 0 {
            return Ok(None);
        }
        let rows = if plan.primary_key.is_empty() {
            Vec::new()
        } else {
            let probe = orphan_probe(fk);
            let result = policy
                .run(
                    &format!("orphan row sample on {}.{}", physical, fk.source_physical),
                    None,
                    Vec::new(),
                    session.orphan_row_sample(physical, &probe, &plan.primary_key, limit),
                )
                .await;
            evidence_or_empty(result, physical)?
        };
        Ok(Some(OrphanRowSample {
            key_columns: plan.primary_key.clone(),
            total_count: orphan_count.max(rows.len() as u64),
            rows,
        }))
    }

    fn note_degraded<T>(&self, plan: &TableProfilingPlan, probe: &str, result: &Probed<T>) {
        if result.is_fallback() {
            record(self.recorder, || ProfilingEvent::ProbeDegraded {
                environment: self.environment.to_string(),
                table: plan.table.to_string(),
                probe: probe.to_string(),
                outcome: result.status.outcome,
            });
        }
    }
}

/// Count reported when a probe gives no answer: the row count, never 0.
fn fallback_count(row_count: u64) -> u64 {
    row_count.max(1)
}

fn orphan_probe(fk: &ForeignKeyPlan) -> OrphanProbe {
    OrphanProbe {
        column: fk.source_physical.clone(),
        target: fk.target_physical.clone(),
        target_column: fk.target_column_physical.clone(),
    }
}

/// Evidence is best effort: only cancellation of the run propagates.
fn evidence_or_empty<T: Default>(result: Result<Probed<T>>, table: &TableId) -> Result<T> {
    match result {
        Ok(probed) if !probed.is_fallback() => Ok(probed.value),
        Ok(_) => Ok(T::default()),
        Err(e) if e.is_cancellation() => Err(e),
        Err(e) => {
            tracing::debug!(table = %table, error = %e, "Evidence sample failed, leaving it empty");
            Ok(T::default())
        }
    }
}
