//! Cross-environment consensus and drift validation.
//!
//! Consensus works on the individual environment snapshots, not the merged
//! view: a candidate constraint is safe only when every environment observed
//! it and the share of environments where it is individually safe reaches
//! the configured threshold.

mod report;
mod validation;

pub use report::{ConsensusReport, ConsensusStatistics, KindStatistics};
pub use validation::{IssueCategory, Severity, ValidationIssue, Validator};

use crate::config::{ConsensusConfig, ValidationConfig};
use crate::models::{
    ColumnProfile, CompositeUniqueCandidateProfile, ForeignKeyReality, ProbeOutcome, ProbeStatus,
    ProfileSnapshot, ProfilingEnvironmentSnapshot, TableId, UniqueCandidateProfile,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of constraint a candidate would add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    NotNull,
    Unique,
    CompositeUnique,
    ForeignKey,
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConstraintKind::NotNull => "NOT NULL",
            ConstraintKind::Unique => "UNIQUE",
            ConstraintKind::CompositeUnique => "UNIQUE (composite)",
            ConstraintKind::ForeignKey => "FOREIGN KEY",
        };
        f.write_str(label)
    }
}

/// Why one environment does not support a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DisagreementReason {
    /// The environment has no profile for the candidate
    Missing,
    HasNulls { null_count: u64, row_count: u64 },
    HasDuplicates,
    HasOrphans { orphan_count: u64 },
    /// Evidence is a fallback or was never gathered
    IncompleteProbe { outcome: ProbeOutcome },
    /// Evidence covers only a sample and full scans are required
    SampledOnly { sample_size: u64 },
}

impl std::fmt::Display for DisagreementReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisagreementReason::Missing => f.write_str("is missing it"),
            DisagreementReason::HasNulls {
                null_count,
                row_count,
            } => write!(f, "has nulls ({} of {} rows)", null_count, row_count),
            DisagreementReason::HasDuplicates => f.write_str("has duplicates"),
            DisagreementReason::HasOrphans { orphan_count } => {
                write!(f, "has orphans ({})", orphan_count)
            }
            DisagreementReason::IncompleteProbe { outcome } => {
                write!(f, "has an incomplete probe ({})", outcome)
            }
            DisagreementReason::SampledOnly { sample_size } => {
                write!(f, "was only sampled ({} rows)", sample_size)
            }
        }
    }
}

/// One environment that does not support a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDisagreement {
    pub environment: String,
    #[serde(flatten)]
    pub reason: DisagreementReason,
}

/// Consensus for one candidate constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintConsensusResult {
    pub kind: ConstraintKind,
    /// Human-readable identity, e.g. `dbo.Orders.Email`
    pub descriptor: String,
    pub table: TableId,
    pub columns: Vec<String>,
    /// Referenced table, for foreign keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<TableId>,
    pub is_safe_to_apply: bool,
    pub safe_environments: usize,
    pub observed_environments: usize,
    pub total_environments: usize,
    pub safe_ratio: f64,
    pub disagreements: Vec<EnvironmentDisagreement>,
    pub recommendation: String,
}

/// Computes consensus and validation findings for a set of environments.
#[derive(Debug, Clone, Default)]
pub struct ConsensusAnalyzer {
    consensus: ConsensusConfig,
    validation: ValidationConfig,
}

impl ConsensusAnalyzer {
    pub fn new(consensus: ConsensusConfig, validation: ValidationConfig) -> Self {
        Self {
            consensus,
            validation,
        }
    }

    /// Builds the full report over `environments`.
    pub fn analyze(&self, environments: &[ProfilingEnvironmentSnapshot]) -> ConsensusReport {
        let mut results = Vec::new();
        results.extend(self.evaluate(
            environments,
            ConstraintKind::NotNull,
            |s| s.columns.as_slice(),
            ColumnProfile::key,
            |c| Target {
                table: TableId::new(&c.schema, &c.table),
                columns: vec![c.column.clone()],
                references: None,
                descriptor: c.key().to_string(),
            },
            |c| self.not_null_verdict(c),
        ));
        results.extend(self.evaluate(
            environments,
            ConstraintKind::Unique,
            |s| s.unique_candidates.as_slice(),
            UniqueCandidateProfile::key,
            |c| Target {
                table: TableId::new(&c.schema, &c.table),
                columns: vec![c.column.clone()],
                references: None,
                descriptor: c.key().to_string(),
            },
            |c| {
                self.probe_verdict(&c.probe)
                    .or_else(|| c.has_duplicate.then_some(DisagreementReason::HasDuplicates))
            },
        ));
        results.extend(self.evaluate(
            environments,
            ConstraintKind::CompositeUnique,
            |s| s.composite_unique_candidates.as_slice(),
            CompositeUniqueCandidateProfile::key,
            |c| Target {
                table: TableId::new(&c.schema, &c.table),
                columns: c.columns.clone(),
                references: None,
                descriptor: c.key().to_string(),
            },
            |c| c.has_duplicate.then_some(DisagreementReason::HasDuplicates),
        ));
        results.extend(self.evaluate(
            environments,
            ConstraintKind::ForeignKey,
            |s| s.foreign_keys.as_slice(),
            ForeignKeyReality::key,
            |fk| Target {
                table: TableId::new(&fk.reference.from_schema, &fk.reference.from_table),
                columns: vec![fk.reference.from_column.clone()],
                references: Some(TableId::new(
                    &fk.reference.to_schema,
                    &fk.reference.to_table,
                )),
                descriptor: fk.key().to_string(),
            },
            |fk| {
                self.probe_verdict(&fk.probe).or_else(|| {
                    (fk.orphan_count > 0).then_some(DisagreementReason::HasOrphans {
                        orphan_count: fk.orphan_count,
                    })
                })
            },
        ));

        let findings = Validator::new(&self.validation).validate(environments);
        let report = ConsensusReport::new(&self.consensus, environments, results, findings);
        tracing::info!(
            environments = environments.len(),
            candidates = report.statistics.total,
            safe = report.statistics.safe,
            findings = report.findings.len(),
            "Consensus analysis complete"
        );
        report
    }

    fn not_null_verdict(&self, column: &ColumnProfile) -> Option<DisagreementReason> {
        if !column.null_probe.is_complete() {
            return Some(DisagreementReason::IncompleteProbe {
                outcome: column.null_probe.outcome,
            });
        }
        if column.null_count > 0 {
            return Some(DisagreementReason::HasNulls {
                null_count: column.null_count,
                row_count: column.row_count,
            });
        }
        self.full_scan_verdict(&column.null_probe)
    }

    fn probe_verdict(&self, status: &ProbeStatus) -> Option<DisagreementReason> {
        if !status.is_complete() {
            return Some(DisagreementReason::IncompleteProbe {
                outcome: status.outcome,
            });
        }
        self.full_scan_verdict(status)
    }

    fn full_scan_verdict(&self, status: &ProbeStatus) -> Option<DisagreementReason> {
        match status.sample_size {
            Some(sample_size) if self.consensus.require_full_scan => {
                Some(DisagreementReason::SampledOnly { sample_size })
            }
            _ => None,
        }
    }

    /// Groups one kind of profile by key and scores every group.
    fn evaluate<'a, T, K>(
        &self,
        environments: &'a [ProfilingEnvironmentSnapshot],
        kind: ConstraintKind,
        items: impl Fn(&'a ProfileSnapshot) -> &'a [T],
        key: impl Fn(&T) -> K,
        target: impl Fn(&T) -> Target,
        verdict: impl Fn(&T) -> Option<DisagreementReason>,
    ) -> Vec<ConstraintConsensusResult>
    where
        T: 'a,
        K: Ord,
    {
        let mut grouped: BTreeMap<K, Vec<Option<&'a T>>> = BTreeMap::new();
        for (index, environment) in environments.iter().enumerate() {
            for item in items(&environment.snapshot) {
                let slots = grouped
                    .entry(key(item))
                    .or_insert_with(|| vec![None; environments.len()]);
                if slots[index].is_none() {
                    slots[index] = Some(item);
                }
            }
        }

        grouped
            .into_values()
            .filter_map(|slots| {
                let first = slots.iter().flatten().next()?;
                let mut disagreements = Vec::new();
                let mut safe = 0;
                for (environment, slot) in environments.iter().zip(&slots) {
                    let reason = match slot {
                        Some(profile) => verdict(profile),
                        None => Some(DisagreementReason::Missing),
                    };
                    match reason {
                        Some(reason) => disagreements.push(EnvironmentDisagreement {
                            environment: environment.name.clone(),
                            reason,
                        }),
                        None => safe += 1,
                    }
                }
                let observed = slots.iter().filter(|s| s.is_some()).count();
                Some(self.score(
                    kind,
                    target(first),
                    safe,
                    observed,
                    environments.len(),
                    disagreements,
                ))
            })
            .collect()
    }

    fn score(
        &self,
        kind: ConstraintKind,
        target: Target,
        safe: usize,
        observed: usize,
        total: usize,
        disagreements: Vec<EnvironmentDisagreement>,
    ) -> ConstraintConsensusResult {
        let safe_ratio = if total == 0 {
            0.0
        } else {
            safe as f64 / total as f64
        };
        // a candidate missing anywhere cannot be judged safe there
        let is_safe_to_apply =
            total > 0 && observed == total && safe_ratio + 1e-9 >= self.consensus.threshold;

        let recommendation = if is_safe_to_apply && disagreements.is_empty() {
            format!(
                "Apply {} on {}: safe in all {} environments",
                kind, target.descriptor, total
            )
        } else if is_safe_to_apply {
            format!(
                "Apply {} on {}: safe in {}/{} environments, meeting the threshold; review {}",
                kind,
                target.descriptor,
                safe,
                total,
                describe(&disagreements)
            )
        } else {
            format!(
                "Do not apply {} on {}: {}",
                kind,
                target.descriptor,
                describe(&disagreements)
            )
        };

        ConstraintConsensusResult {
            kind,
            descriptor: target.descriptor,
            table: target.table,
            columns: target.columns,
            references: target.references,
            is_safe_to_apply,
            safe_environments: safe,
            observed_environments: observed,
            total_environments: total,
            safe_ratio,
            disagreements,
            recommendation,
        }
    }
}

/// What a candidate constrains, taken from its first observation.
struct Target {
    table: TableId,
    columns: Vec<String>,
    references: Option<TableId>,
    descriptor: String,
}

fn describe(disagreements: &[EnvironmentDisagreement]) -> String {
    disagreements
        .iter()
        .map(|d| format!("{} {}", d.environment, d.reason))
        .collect::<Vec<_>>()
        .join("; ")
}
