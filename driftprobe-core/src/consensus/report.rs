//! Consensus report and its human-readable summary.

use super::{ConstraintConsensusResult, ConstraintKind, Severity, ValidationIssue};
use crate::config::ConsensusConfig;
use crate::models::ProfilingEnvironmentSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Safe and unsafe counts for one constraint kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindStatistics {
    pub safe: usize,
    #[serde(rename = "unsafe")]
    pub not_safe: usize,
}

/// Aggregate counters over a report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusStatistics {
    pub environments: usize,
    pub total: usize,
    pub safe: usize,
    #[serde(rename = "unsafe")]
    pub not_safe: usize,
    pub by_kind: BTreeMap<ConstraintKind, KindStatistics>,
    pub findings_by_severity: BTreeMap<Severity, usize>,
}

/// Machine-readable consensus output consumed by DDL generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusReport {
    pub threshold: f64,
    pub require_full_scan: bool,
    /// Environment names, in run order
    pub environments: Vec<String>,
    pub results: Vec<ConstraintConsensusResult>,
    pub statistics: ConsensusStatistics,
    pub findings: Vec<ValidationIssue>,
}

impl ConsensusReport {
    pub(crate) fn new(
        config: &ConsensusConfig,
        environments: &[ProfilingEnvironmentSnapshot],
        results: Vec<ConstraintConsensusResult>,
        findings: Vec<ValidationIssue>,
    ) -> Self {
        let mut statistics = ConsensusStatistics {
            environments: environments.len(),
            total: results.len(),
            ..ConsensusStatistics::default()
        };
        for result in &results {
            let kind = statistics.by_kind.entry(result.kind).or_default();
            if result.is_safe_to_apply {
                kind.safe += 1;
                statistics.safe += 1;
            } else {
                kind.not_safe += 1;
                statistics.not_safe += 1;
            }
        }
        for finding in &findings {
            *statistics
                .findings_by_severity
                .entry(finding.severity)
                .or_default() += 1;
        }

        Self {
            threshold: config.threshold,
            require_full_scan: config.require_full_scan,
            environments: environments.iter().map(|e| e.name.clone()).collect(),
            results,
            statistics,
            findings,
        }
    }

    /// Candidates that may be scripted.
    pub fn safe_results(&self) -> impl Iterator<Item = &ConstraintConsensusResult> {
        self.results.iter().filter(|r| r.is_safe_to_apply)
    }

    /// Candidates that must not be scripted.
    pub fn unsafe_results(&self) -> impl Iterator<Item = &ConstraintConsensusResult> {
        self.results.iter().filter(|r| !r.is_safe_to_apply)
    }

    /// Looks up one candidate by kind and descriptor.
    pub fn result(&self, kind: ConstraintKind, descriptor: &str) -> Option<&ConstraintConsensusResult> {
        self.results
            .iter()
            .find(|r| r.kind == kind && r.descriptor == descriptor)
    }

    /// True when any finding has `Error` severity.
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    /// Human-formatted summary for operators.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Constraint consensus across {} environment{} ({}), threshold {:.0}%{}",
            self.statistics.environments,
            if self.statistics.environments == 1 { "" } else { "s" },
            self.environments.join(", "),
            self.threshold * 100.0,
            if self.require_full_scan {
                ", full scans required"
            } else {
                ""
            }
        );
        for (kind, stats) in &self.statistics.by_kind {
            let _ = writeln!(
                out,
                "  {:<20} {:>5} safe {:>5} unsafe",
                kind.to_string(),
                stats.safe,
                stats.not_safe
            );
        }

        let unsafe_results: Vec<_> = self.unsafe_results().collect();
        if !unsafe_results.is_empty() {
            let _ = writeln!(out, "\nUnsafe constraints:");
            for result in unsafe_results {
                let _ = writeln!(out, "  - {}", result.recommendation);
            }
        }

        if !self.findings.is_empty() {
            let _ = writeln!(out, "\nFindings:");
            for finding in &self.findings {
                let _ = writeln!(out, "  [{}] {}", finding.severity, finding.message);
                let _ = writeln!(out, "      remediation: {}", finding.remediation);
            }
        }
        out
    }
}

impl std::fmt::Display for ConsensusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.summary())
    }
}
