//! Cross-environment drift findings.

use crate::config::ValidationConfig;
use crate::models::{ColumnKey, ProbeOutcome, ProfilingEnvironmentSnapshot, TableId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How urgently a finding needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Advisory,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Severity::Info => "INFO",
            Severity::Advisory => "ADVISORY",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// What kind of drift a finding describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    MissingTable,
    MissingColumn,
    NullVariance,
    InconsistentDuplicates,
    CaseOnlyNaming,
    IncompleteProbe,
    AmbiguousRelationship,
}

/// One severity-tagged drift finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub category: IssueCategory,
    /// Table, column or relationship the finding is about
    pub subject: String,
    /// Environments the finding names
    pub environments: Vec<String>,
    pub message: String,
    pub remediation: String,
}

/// Runs every validation rule over a set of environment snapshots.
#[derive(Debug, Clone)]
pub struct Validator<'a> {
    config: &'a ValidationConfig,
}

impl<'a> Validator<'a> {
    pub fn new(config: &'a ValidationConfig) -> Self {
        Self { config }
    }

    /// Findings ordered by severity (most severe first), then category and
    /// subject.
    pub fn validate(&self, environments: &[ProfilingEnvironmentSnapshot]) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if environments.len() > 1 {
            issues.extend(missing_tables(environments));
            issues.extend(missing_columns(environments));
            issues.extend(self.null_variance(environments));
            issues.extend(inconsistent_duplicates(environments));
        }
        issues.extend(case_only_names(environments));
        issues.extend(incomplete_probes(environments));
        issues.extend(ambiguous_relationships(environments));

        issues.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.category.cmp(&b.category))
                .then_with(|| a.subject.cmp(&b.subject))
        });
        issues
    }

    fn null_variance(&self, environments: &[ProfilingEnvironmentSnapshot]) -> Vec<ValidationIssue> {
        let mut observed: BTreeMap<ColumnKey, Vec<(&str, u64, u64)>> = BTreeMap::new();
        for environment in environments {
            for column in &environment.snapshot.columns {
                if !column.null_probe.is_complete() {
                    continue;
                }
                observed.entry(column.key()).or_default().push((
                    environment.name.as_str(),
                    column.null_count,
                    column.row_count,
                ));
            }
        }

        observed
            .into_iter()
            .filter(|(_, counts)| counts.len() > 1)
            .filter_map(|(key, counts)| {
                let min = counts.iter().map(|(_, nulls, _)| *nulls).min()?;
                let max = counts.iter().map(|(_, nulls, _)| *nulls).max()?;
                let ratios: Vec<f64> = counts
                    .iter()
                    .map(|(_, nulls, rows)| ratio(*nulls, *rows))
                    .collect();
                let ratio_spread = ratios.iter().cloned().fold(f64::MIN, f64::max)
                    - ratios.iter().cloned().fold(f64::MAX, f64::min);

                let exceeds = max - min > self.config.null_variance_abs_threshold
                    && ratio_spread > self.config.null_variance_rel_threshold;
                exceeds.then(|| ValidationIssue {
                    severity: Severity::Advisory,
                    category: IssueCategory::NullVariance,
                    subject: key.to_string(),
                    environments: counts.iter().map(|(env, _, _)| env.to_string()).collect(),
                    message: format!(
                        "Null counts for {} vary across environments: {}",
                        key,
                        counts
                            .iter()
                            .map(|(env, nulls, rows)| format!("{} {}/{}", env, nulls, rows))
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                    remediation: "Check whether data loads or application paths differ between \
                                  environments before relying on this column's nullability"
                        .to_string(),
                })
            })
            .collect()
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 { "" } else { "s" }
}

fn missing_tables(environments: &[ProfilingEnvironmentSnapshot]) -> Vec<ValidationIssue> {
    let per_environment: Vec<BTreeSet<TableId>> = environments
        .iter()
        .map(|e| e.snapshot.tables())
        .collect();
    let all: BTreeSet<&TableId> = per_environment.iter().flatten().collect();

    all.into_iter()
        .filter_map(|table| {
            let missing: Vec<&ProfilingEnvironmentSnapshot> = environments
                .iter()
                .zip(&per_environment)
                .filter(|(_, tables)| !tables.contains(table))
                .map(|(env, _)| env)
                .collect();
            if missing.is_empty() {
                return None;
            }
            let severity = if missing.iter().any(|e| e.is_primary) {
                Severity::Error
            } else {
                Severity::Warning
            };
            let names: Vec<String> = missing.iter().map(|e| e.name.clone()).collect();
            Some(ValidationIssue {
                severity,
                category: IssueCategory::MissingTable,
                subject: table.to_string(),
                message: format!(
                    "Table {} missing from {} environment{}: {}",
                    table,
                    names.len(),
                    plural(names.len()),
                    names.join(", ")
                ),
                environments: names,
                remediation: "Create the table in every environment, or add a table-name \
                              mapping if it exists under another name"
                    .to_string(),
            })
        })
        .collect()
}

fn missing_columns(environments: &[ProfilingEnvironmentSnapshot]) -> Vec<ValidationIssue> {
    let tables: Vec<BTreeSet<TableId>> = environments
        .iter()
        .map(|e| e.snapshot.tables())
        .collect();
    let columns: Vec<BTreeSet<ColumnKey>> = environments
        .iter()
        .map(|e| e.snapshot.columns.iter().map(|c| c.key()).collect())
        .collect();
    let all: BTreeSet<&ColumnKey> = columns.iter().flatten().collect();

    all.into_iter()
        .filter_map(|column| {
            let table = column.table_id();
            // missing tables are reported once, not per column
            let names: Vec<String> = environments
                .iter()
                .enumerate()
                .filter(|(i, _)| tables[*i].contains(&table) && !columns[*i].contains(column))
                .map(|(_, env)| env.name.clone())
                .collect();
            if names.is_empty() {
                return None;
            }
            Some(ValidationIssue {
                severity: Severity::Warning,
                category: IssueCategory::MissingColumn,
                subject: column.to_string(),
                message: format!(
                    "Column {} missing from {} environment{}: {}",
                    column,
                    names.len(),
                    plural(names.len()),
                    names.join(", ")
                ),
                environments: names,
                remediation: "Apply the pending schema migration to the listed environments"
                    .to_string(),
            })
        })
        .collect()
}

fn inconsistent_duplicates(environments: &[ProfilingEnvironmentSnapshot]) -> Vec<ValidationIssue> {
    let mut observed: BTreeMap<String, Vec<(&str, bool)>> = BTreeMap::new();
    for environment in environments {
        for candidate in &environment.snapshot.unique_candidates {
            if candidate.probe.outcome != ProbeOutcome::Succeeded {
                continue;
            }
            observed
                .entry(candidate.key().to_string())
                .or_default()
                .push((environment.name.as_str(), candidate.has_duplicate));
        }
        for candidate in &environment.snapshot.composite_unique_candidates {
            observed
                .entry(candidate.key().to_string())
                .or_default()
                .push((environment.name.as_str(), candidate.has_duplicate));
        }
    }

    observed
        .into_iter()
        .filter_map(|(subject, flags)| {
            let with: Vec<String> = flags
                .iter()
                .filter(|(_, dup)| *dup)
                .map(|(env, _)| env.to_string())
                .collect();
            if with.is_empty() || with.len() == flags.len() {
                return None;
            }
            Some(ValidationIssue {
                severity: Severity::Warning,
                category: IssueCategory::InconsistentDuplicates,
                message: format!(
                    "Unique candidate {} has duplicates in {} but not elsewhere",
                    subject,
                    with.join(", ")
                ),
                subject,
                environments: with,
                remediation: "Deduplicate the listed environments before adding the unique \
                              constraint"
                    .to_string(),
            })
        })
        .collect()
}

fn case_only_names(environments: &[ProfilingEnvironmentSnapshot]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for environment in environments {
        let mut groups: BTreeMap<TableId, Vec<&TableId>> = BTreeMap::new();
        for table in &environment.snapshot.catalog_tables {
            groups.entry(table.folded()).or_default().push(table);
        }
        for (folded, names) in groups {
            if names.len() < 2 {
                continue;
            }
            let spelled: Vec<String> = names.iter().map(|t| t.to_string()).collect();
            issues.push(ValidationIssue {
                severity: Severity::Advisory,
                category: IssueCategory::CaseOnlyNaming,
                subject: folded.to_string(),
                environments: vec![environment.name.clone()],
                message: format!(
                    "Environment {} has tables differing only by case: {}",
                    environment.name,
                    spelled.join(", ")
                ),
                remediation: "Rename or drop the duplicate spelling; case-insensitive \
                              collations will treat them as one table"
                    .to_string(),
            });
        }
    }
    issues
}

fn incomplete_probes(environments: &[ProfilingEnvironmentSnapshot]) -> Vec<ValidationIssue> {
    let mut observed: BTreeMap<TableId, BTreeMap<&str, usize>> = BTreeMap::new();
    for environment in environments {
        let snapshot = &environment.snapshot;
        let outcomes = snapshot
            .columns
            .iter()
            .map(|c| (TableId::new(&c.schema, &c.table), c.null_probe.outcome))
            .chain(
                snapshot
                    .unique_candidates
                    .iter()
                    .map(|c| (TableId::new(&c.schema, &c.table), c.probe.outcome)),
            )
            .chain(snapshot.foreign_keys.iter().map(|fk| {
                (
                    TableId::new(&fk.reference.from_schema, &fk.reference.from_table),
                    fk.probe.outcome,
                )
            }));
        for (table, outcome) in outcomes {
            if matches!(
                outcome,
                ProbeOutcome::FallbackTimeout | ProbeOutcome::Cancelled | ProbeOutcome::Unknown
            ) {
                *observed
                    .entry(table)
                    .or_default()
                    .entry(environment.name.as_str())
                    .or_default() += 1;
            }
        }
    }

    observed
        .into_iter()
        .map(|(table, per_environment)| ValidationIssue {
            severity: Severity::Advisory,
            category: IssueCategory::IncompleteProbe,
            subject: table.to_string(),
            message: format!(
                "Probes on {} did not complete: {}",
                table,
                per_environment
                    .iter()
                    .map(|(env, count)| format!("{} ({} probe{})", env, count, plural(*count)))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            environments: per_environment.keys().map(|env| env.to_string()).collect(),
            remediation: "Raise command_timeout_secs or table_timeout_secs, or lower \
                          sample_size, and profile again"
                .to_string(),
        })
        .collect()
}

fn ambiguous_relationships(environments: &[ProfilingEnvironmentSnapshot]) -> Vec<ValidationIssue> {
    let mut observed: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
    for environment in environments {
        for fk in &environment.snapshot.foreign_keys {
            if fk.probe.outcome == ProbeOutcome::AmbiguousMapping {
                observed
                    .entry(format!(
                        "{}.{}.{} -> {}",
                        fk.reference.from_schema,
                        fk.reference.from_table,
                        fk.reference.from_column,
                        fk.reference.to_table
                    ))
                    .or_default()
                    .insert(environment.name.as_str());
            }
        }
    }

    observed
        .into_iter()
        .map(|(subject, envs)| ValidationIssue {
            severity: Severity::Info,
            category: IssueCategory::AmbiguousRelationship,
            message: format!(
                "Relationship {} matches several tables and was not probed",
                subject
            ),
            subject,
            environments: envs.into_iter().map(str::to_string).collect(),
            remediation: "Add a naming override or a physical table hint for the target entity"
                .to_string(),
        })
        .collect()
}
