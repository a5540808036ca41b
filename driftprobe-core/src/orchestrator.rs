//! Multi-environment capture with fail-fast sibling cancellation.
//!
//! Environments are captured concurrently through
//! `futures::stream::buffer_unordered`, so at most `effective_parallelism`
//! environments query their databases at once. The first failing capture
//! cancels the run scope; the other captures observe it and report
//! `ENVIRONMENT_CANCELLED_BY_SIBLING`. The caller's own token is never
//! cancelled by the orchestrator.

use crate::cancellation::{CancelSource, RunScope};
use crate::config::{CaptureOptions, EnvironmentConfig};
use crate::error::{DriftProbeError, ErrorCode};
use crate::merge::merge_all;
use crate::model::LogicalModel;
use crate::models::{ProfileSnapshot, ProfilingEnvironmentSnapshot};
use crate::profiler::{SnapshotCapture, create_capture};
use crate::recorder::{ProfilingEvent, SharedRecorder, record};
use crate::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// One environment paired with the capture that produces its snapshot.
#[derive(Clone)]
pub struct EnvironmentCapture {
    pub config: EnvironmentConfig,
    pub capture: Arc<dyn SnapshotCapture>,
}

impl std::fmt::Debug for EnvironmentCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentCapture")
            .field("config", &self.config)
            .field("capture", &self.capture.kind())
            .finish()
    }
}

/// Snapshots of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratedCapture {
    /// Per-environment snapshots, in configuration order
    pub environments: Vec<ProfilingEnvironmentSnapshot>,
    /// Conservative merge of every environment
    pub merged: ProfileSnapshot,
}

/// Runs every environment capture of one run.
pub struct MultiEnvironmentOrchestrator {
    environments: Vec<EnvironmentCapture>,
    options: CaptureOptions,
    recorder: Option<SharedRecorder>,
}

impl std::fmt::Debug for MultiEnvironmentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiEnvironmentOrchestrator")
            .field("environments", &self.environments)
            .field("options", &self.options)
            .field("recorder", &self.recorder.is_some())
            .finish()
    }
}

impl MultiEnvironmentOrchestrator {
    /// Creates an orchestrator over prepared captures.
    pub fn new(environments: Vec<EnvironmentCapture>, options: CaptureOptions) -> Self {
        Self {
            environments,
            options,
            recorder: None,
        }
    }

    /// Builds captures for `configs` through the provider factory.
    ///
    /// # Errors
    /// Returns a configuration error for invalid environments or providers
    pub fn from_configs(
        configs: &[EnvironmentConfig],
        options: CaptureOptions,
        recorder: Option<SharedRecorder>,
    ) -> Result<Self> {
        let environments = configs
            .iter()
            .map(|config| {
                config.validate()?;
                let capture = create_capture(config, &options.profiling, recorder.clone())
                    .map_err(|e| e.in_environment(&config.name))?;
                Ok(EnvironmentCapture {
                    config: config.clone(),
                    capture,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(environments, options).with_recorder(recorder))
    }

    /// Options the run uses.
    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    /// Attaches an event recorder.
    pub fn with_recorder(mut self, recorder: Option<SharedRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Checks the environment set before anything is captured.
    ///
    /// # Errors
    /// Returns a configuration error unless there is exactly one primary
    /// environment and every name is unique
    pub fn validate(&self) -> Result<()> {
        if self.environments.is_empty() {
            return Err(DriftProbeError::configuration(
                "at least one environment is required",
            ));
        }
        let primaries = self
            .environments
            .iter()
            .filter(|e| e.config.is_primary)
            .count();
        if primaries != 1 {
            return Err(DriftProbeError::configuration(format!(
                "exactly one primary environment is required, found {}",
                primaries
            )));
        }
        let mut names = HashSet::new();
        for environment in &self.environments {
            if !names.insert(environment.config.name.to_lowercase()) {
                return Err(DriftProbeError::configuration(format!(
                    "duplicate environment name '{}'",
                    environment.config.name
                )));
            }
        }
        self.options.validate()
    }

    /// Captures every environment and merges the snapshots.
    ///
    /// # Errors
    /// Returns the first environment failure (wrapped with its environment
    /// name), or a cancellation error when `cancel` fires
    pub async fn run(
        &self,
        model: &LogicalModel,
        cancel: &CancellationToken,
    ) -> Result<OrchestratedCapture> {
        self.validate()?;

        let scope = RunScope::new(cancel);
        let parallelism = self.options.effective_parallelism(self.environments.len());
        tracing::info!(
            environments = self.environments.len(),
            parallelism,
            "Starting multi-environment capture"
        );

        let scope_ref = &scope;
        let mut captures = stream::iter(self.environments.iter().enumerate())
            .map(|(index, environment)| async move {
                (index, self.capture_one(environment, model, scope_ref).await)
            })
            .buffer_unordered(parallelism);

        let mut completed: Vec<(usize, ProfilingEnvironmentSnapshot)> = Vec::new();
        let mut root_failure: Option<DriftProbeError> = None;
        while let Some((index, result)) = captures.next().await {
            match result {
                Ok(snapshot) => completed.push((index, snapshot)),
                Err(e) => {
                    let name = &self.environments[index].config.name;
                    record(self.recorder.as_ref(), || ProfilingEvent::EnvironmentFailed {
                        environment: name.clone(),
                        code: e.code().to_string(),
                        message: e.to_string(),
                    });
                    // sibling-cancelled captures never hide the root cause
                    let replaces = match &root_failure {
                        None => true,
                        Some(existing) => {
                            existing.code() == ErrorCode::CancelledBySibling
                                && e.code() != ErrorCode::CancelledBySibling
                        }
                    };
                    if replaces {
                        root_failure = Some(e);
                    } else {
                        tracing::debug!(environment = %name, error = %e, "Additional capture failure");
                    }
                }
            }
        }
        drop(captures);

        if let Some(error) = root_failure {
            tracing::error!(error = %error, "Multi-environment capture failed");
            return Err(error);
        }

        completed.sort_by_key(|(index, _)| *index);
        let environments: Vec<ProfilingEnvironmentSnapshot> =
            completed.into_iter().map(|(_, snapshot)| snapshot).collect();
        let merged = merge_all(environments.iter().map(|e| &e.snapshot));
        Ok(OrchestratedCapture {
            environments,
            merged,
        })
    }

    async fn capture_one(
        &self,
        environment: &EnvironmentCapture,
        model: &LogicalModel,
        scope: &RunScope,
    ) -> Result<ProfilingEnvironmentSnapshot> {
        let config = &environment.config;
        let captured_at = Utc::now();
        let start = Instant::now();

        if let Some(source) = scope.source() {
            return Err(cancellation_error(source, &config.name));
        }

        record(self.recorder.as_ref(), || ProfilingEvent::EnvironmentStarted {
            environment: config.name.clone(),
            provider: environment.capture.kind().to_string(),
        });
        tracing::info!(environment = %config.name, provider = environment.capture.kind(), "Capturing environment");

        let snapshot = match environment.capture.capture(model, scope.token()).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_cancellation() => {
                let source = scope.source().unwrap_or(CancelSource::Caller);
                return Err(cancellation_error(source, &config.name));
            }
            Err(e) => {
                tracing::warn!(environment = %config.name, error = %e, "Capture failed, cancelling siblings");
                scope.cancel_siblings();
                return Err(e.in_environment(&config.name));
            }
        };

        let capture_duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        record(self.recorder.as_ref(), || ProfilingEvent::EnvironmentCompleted {
            environment: config.name.clone(),
            duration_ms: capture_duration_ms,
        });
        tracing::info!(
            environment = %config.name,
            duration_ms = capture_duration_ms,
            columns = snapshot.columns.len(),
            "Environment captured"
        );

        let (label, label_source) = config.resolved_label();
        Ok(ProfilingEnvironmentSnapshot {
            name: config.name.clone(),
            label,
            label_source,
            is_primary: config.is_primary,
            captured_at,
            capture_duration_ms,
            snapshot,
            table_mappings: config.table_mappings.clone(),
        })
    }
}

fn cancellation_error(source: CancelSource, environment: &str) -> DriftProbeError {
    match source {
        CancelSource::SiblingFailure => DriftProbeError::CancelledBySibling {
            environment: environment.to_string(),
        },
        CancelSource::Caller | CancelSource::TableDeadline => DriftProbeError::cancelled(format!(
            "capture of environment '{}' cancelled by the caller",
            environment
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryCatalog, MemoryTable};
    use crate::config::{ProfilingOptions, ProviderConfig};
    use crate::profiler::EnvironmentProfiler;
    use crate::recorder::MemoryRecorder;
    use serde_json::json;
    use std::time::Duration;

    fn model() -> LogicalModel {
        serde_json::from_value(json!({
            "modules": [{
                "name": "Sales",
                "entities": [{
                    "name": "Order", "schema": "dbo", "table": "Orders",
                    "attributes": [
                        {"name": "Id", "column": "Id", "is_identifier": true},
                        {"name": "Email", "column": "Email"}
                    ]
                }]
            }]
        }))
        .expect("valid model")
    }

    fn orders(rows: Vec<serde_json::Value>) -> MemoryCatalog {
        MemoryCatalog::new().with_table(
            MemoryTable::new("dbo", "Orders")
                .primary_key("Id")
                .column("Email")
                .with_rows(rows),
        )
    }

    fn environment(name: &str, primary: bool, catalog: MemoryCatalog) -> EnvironmentCapture {
        let mut config = EnvironmentConfig::new(
            name,
            ProviderConfig::Fixture {
                snapshot_path: format!("{}.json", name).into(),
            },
        );
        config.is_primary = primary;
        EnvironmentCapture {
            config,
            capture: Arc::new(EnvironmentProfiler::new(
                name,
                Arc::new(catalog),
                ProfilingOptions::default(),
            )),
        }
    }

    fn options() -> CaptureOptions {
        CaptureOptions::default().with_max_parallel_environments(2)
    }

    #[test]
    fn test_debug_hides_recorder_internals() {
        let recorder: SharedRecorder = Arc::new(MemoryRecorder::new());
        let orchestrator = MultiEnvironmentOrchestrator::new(
            vec![environment("dev", true, orders(Vec::new()))],
            options(),
        )
        .with_recorder(Some(recorder));
        let rendered = format!("{:?}", orchestrator);
        assert!(rendered.contains("MultiEnvironmentOrchestrator"));
        assert!(rendered.contains("recorder: true"));
    }

    #[tokio::test]
    async fn test_run_merges_all_environments() {
        let orchestrator = MultiEnvironmentOrchestrator::new(
            vec![
                environment("dev", true, orders(vec![json!({"Id": 1, "Email": "a"})])),
                environment(
                    "prod",
                    false,
                    orders(vec![json!({"Id": 1, "Email": null}), json!({"Id": 2, "Email": "b"})]),
                ),
            ],
            options(),
        );

        let run = orchestrator
            .run(&model(), &CancellationToken::new())
            .await
            .expect("run succeeds");
        assert_eq!(run.environments.len(), 2);
        assert_eq!(run.environments[0].name, "dev");
        assert!(run.environments[0].is_primary);
        assert_eq!(run.environments[1].label, "prod (secondary)");

        let email = run
            .merged
            .columns
            .iter()
            .find(|c| c.column == "Email")
            .expect("merged email");
        assert_eq!(email.null_count, 1);
        assert_eq!(email.row_count, 2);
    }

    #[tokio::test]
    async fn test_exactly_one_primary_required() {
        let none = MultiEnvironmentOrchestrator::new(
            vec![environment("dev", false, orders(vec![]))],
            options(),
        );
        let err = none
            .run(&model(), &CancellationToken::new())
            .await
            .expect_err("no primary");
        assert_eq!(err.code(), ErrorCode::Configuration);

        let two = MultiEnvironmentOrchestrator::new(
            vec![
                environment("dev", true, orders(vec![])),
                environment("prod", true, orders(vec![])),
            ],
            options(),
        );
        assert!(two.validate().is_err());

        let duplicate = MultiEnvironmentOrchestrator::new(
            vec![
                environment("dev", true, orders(vec![])),
                environment("DEV", false, orders(vec![])),
            ],
            options(),
        );
        assert!(duplicate.validate().is_err());
    }

    #[tokio::test]
    async fn test_failure_cancels_siblings() {
        let recorder = Arc::new(MemoryRecorder::new());
        let shared: SharedRecorder = recorder.clone();
        let caller = CancellationToken::new();

        let orchestrator = MultiEnvironmentOrchestrator::new(
            vec![
                environment(
                    "dev",
                    true,
                    orders(vec![json!({"Id": 1, "Email": "a"})])
                        .with_probe_delay(Duration::from_secs(30)),
                ),
                environment("prod", false, orders(vec![]).with_permanent_metadata_failure()),
            ],
            options(),
        )
        .with_recorder(Some(shared));

        let err = orchestrator
            .run(&model(), &caller)
            .await
            .expect_err("run fails");
        assert_eq!(err.code(), ErrorCode::EnvironmentFailed);
        assert_eq!(err.environment(), Some("prod"));
        assert!(!caller.is_cancelled());

        let sibling_codes: Vec<String> = recorder
            .events()
            .into_iter()
            .filter_map(|e| match e.event {
                ProfilingEvent::EnvironmentFailed {
                    environment, code, ..
                } if environment == "dev" => Some(code),
                _ => None,
            })
            .collect();
        assert_eq!(sibling_codes, vec!["ENVIRONMENT_CANCELLED_BY_SIBLING".to_string()]);
    }

    #[tokio::test]
    async fn test_caller_cancellation_reports_cancelled() {
        let caller = CancellationToken::new();
        caller.cancel();
        let orchestrator = MultiEnvironmentOrchestrator::new(
            vec![
                environment("dev", true, orders(vec![])),
                environment("prod", false, orders(vec![])),
            ],
            options(),
        );
        let err = orchestrator
            .run(&model(), &caller)
            .await
            .expect_err("cancelled");
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }
}
