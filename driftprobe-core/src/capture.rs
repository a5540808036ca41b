//! Run entry point: capture every environment, merge, and analyze.

use crate::config::{CaptureOptions, EnvironmentConfig};
use crate::consensus::{ConsensusAnalyzer, ConsensusReport};
use crate::model::LogicalModelProvider;
use crate::models::{ProfileSnapshot, ProfilingEnvironmentSnapshot};
use crate::orchestrator::MultiEnvironmentOrchestrator;
use crate::recorder::SharedRecorder;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything one run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub options: CaptureOptions,
    pub environments: Vec<ProfilingEnvironmentSnapshot>,
    /// Conservative merge of every environment's snapshot
    pub merged: ProfileSnapshot,
    pub consensus: ConsensusReport,
}

impl CaptureReport {
    /// Wall-clock duration of the run in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds()
    }

    /// The primary environment's snapshot.
    pub fn primary(&self) -> Option<&ProfilingEnvironmentSnapshot> {
        self.environments.iter().find(|e| e.is_primary)
    }

    /// Operator summary: one line per environment, then the consensus.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Run {} ({} ms)", self.run_id, self.duration_ms());
        for environment in &self.environments {
            let _ = writeln!(
                out,
                "  {:<24} {:>6} columns {:>6} foreign keys {:>8} ms",
                environment.label,
                environment.snapshot.columns.len(),
                environment.snapshot.foreign_keys.len(),
                environment.capture_duration_ms
            );
        }
        let _ = writeln!(out);
        out.push_str(&self.consensus.summary());
        out
    }
}

/// Captures `environments` against the model from `model`.
///
/// # Errors
/// Returns a configuration error for invalid options or environments, a
/// model error when the model cannot be loaded, or the first environment
/// failure
///
/// # Example
/// ```rust,no_run
/// use driftprobe_core::capture::capture;
/// use driftprobe_core::config::{CaptureOptions, EnvironmentConfig, ProviderConfig};
/// use driftprobe_core::model::JsonModelProvider;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> driftprobe_core::Result<()> {
/// let environments = vec![
///     EnvironmentConfig::new("dev", ProviderConfig::Fixture { snapshot_path: "dev.json".into() })
///         .primary(),
/// ];
/// let report = capture(
///     &environments,
///     &JsonModelProvider::new("model.json"),
///     &CaptureOptions::default(),
///     None,
///     &CancellationToken::new(),
/// )
/// .await?;
/// println!("{}", report.summary());
/// # Ok(())
/// # }
/// ```
pub async fn capture(
    environments: &[EnvironmentConfig],
    model: &dyn LogicalModelProvider,
    options: &CaptureOptions,
    recorder: Option<SharedRecorder>,
    cancel: &CancellationToken,
) -> Result<CaptureReport> {
    options.validate()?;
    let orchestrator =
        MultiEnvironmentOrchestrator::from_configs(environments, options.clone(), recorder)?;
    capture_with(&orchestrator, model, cancel).await
}

/// Runs a capture through a prepared orchestrator.
///
/// # Errors
/// Same as [`capture`]
pub async fn capture_with(
    orchestrator: &MultiEnvironmentOrchestrator,
    model: &dyn LogicalModelProvider,
    cancel: &CancellationToken,
) -> Result<CaptureReport> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    orchestrator.validate()?;

    let model = model.load().await?;
    tracing::info!(%run_id, modules = model.modules.len(), "Starting capture run");

    let run = orchestrator.run(&model, cancel).await?;

    let options = orchestrator.options().clone();
    let consensus = ConsensusAnalyzer::new(options.consensus.clone(), options.validation.clone())
        .analyze(&run.environments);

    let completed_at = Utc::now();
    tracing::info!(
        %run_id,
        safe = consensus.statistics.safe,
        unsafe_count = consensus.statistics.not_safe,
        findings = consensus.findings.len(),
        "Capture run complete"
    );
    Ok(CaptureReport {
        run_id,
        started_at,
        completed_at,
        options,
        environments: run.environments,
        merged: run.merged,
        consensus,
    })
}
