//! Single-environment profiler over a catalog query service.

use super::SnapshotCapture;
use crate::cancellation::TableScope;
use crate::catalog::{CatalogQueryService, CatalogSnapshot};
use crate::config::ProfilingOptions;
use crate::error::DriftProbeError;
use crate::executor::{QueryExecutor, TableProfile};
use crate::model::LogicalModel;
use crate::models::{ProfileSnapshot, TableId, TableNameMapping};
use crate::planner::{QueryPlanner, TableProfilingPlan};
use crate::recorder::{ProfilingEvent, SharedRecorder, record};
use crate::retry::retry_transient;
use crate::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Profiles one environment: metadata load, planning, per-table execution.
pub struct EnvironmentProfiler {
    name: String,
    catalog: Arc<dyn CatalogQueryService>,
    options: ProfilingOptions,
    mappings: Vec<TableNameMapping>,
    recorder: Option<SharedRecorder>,
}

impl std::fmt::Debug for EnvironmentProfiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentProfiler")
            .field("name", &self.name)
            .field("provider", &self.catalog.provider_name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl EnvironmentProfiler {
    /// Creates a profiler for the environment `name`.
    pub fn new(
        name: impl Into<String>,
        catalog: Arc<dyn CatalogQueryService>,
        options: ProfilingOptions,
    ) -> Self {
        Self {
            name: name.into(),
            catalog,
            options,
            mappings: Vec::new(),
            recorder: None,
        }
    }

    /// Sets the table-name mappings for this environment.
    pub fn with_table_mappings(mut self, mappings: Vec<TableNameMapping>) -> Self {
        self.mappings = mappings;
        self
    }

    /// Attaches an event recorder.
    pub fn with_recorder(mut self, recorder: Option<SharedRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Tables to request from the catalog: model names plus mapped and
    /// overridden names.
    fn requested_tables(&self, model: &LogicalModel) -> Vec<TableId> {
        let mut tables = model.tables();
        let extra = self
            .mappings
            .iter()
            .map(|mapping| mapping.actual.clone())
            .chain(
                self.options
                    .naming_overrides
                    .iter()
                    .map(|o| TableId::new(&o.schema, &o.table)),
            );
        for table in extra {
            if !tables.iter().any(|t| t.eq_ignore_case(&table)) {
                tables.push(table);
            }
        }
        tables
    }

    /// Loads metadata in batches, retrying transient batch failures.
    async fn load_metadata(
        &self,
        tables: &[TableId],
        cancel: &CancellationToken,
    ) -> Result<CatalogSnapshot> {
        let mut snapshot = CatalogSnapshot::default();
        let batch_size = self.options.metadata_batch_size.max(1);
        let mut batches = 0;
        for batch in tables.chunks(batch_size) {
            let load = retry_transient(&self.options.retry, cancel, "metadata batch", || {
                self.catalog.load_batch(batch)
            });
            let loaded = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(DriftProbeError::cancelled(format!(
                        "metadata load for '{}' cancelled",
                        self.name
                    )));
                }
                loaded = load => loaded?,
            };
            snapshot.extend(loaded);
            batches += 1;
        }

        tracing::debug!(
            environment = %self.name,
            tables = tables.len(),
            batches,
            columns = snapshot.columns.len(),
            "Loaded catalog metadata"
        );
        record(self.recorder.as_ref(), || ProfilingEvent::MetadataLoaded {
            environment: self.name.clone(),
            tables: tables.len(),
            batches,
        });
        Ok(snapshot)
    }

    /// Profiles one table in its own session and deadline scope.
    async fn profile_table(
        &self,
        plan: &TableProfilingPlan,
        cancel: &CancellationToken,
    ) -> Result<TableProfile> {
        let mut session = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(DriftProbeError::cancelled(format!(
                    "profiling of {} cancelled",
                    plan.table
                )));
            }
            session = self.catalog.open_session() => session?,
        };
        // the table budget covers probing only, not waiting for a connection
        let start = Instant::now();
        let scope = TableScope::new(cancel, self.options.table_timeout());

        let executor = QueryExecutor::new(&self.name, &self.options, self.recorder.as_ref());
        let profile = executor
            .execute(plan, session.as_mut(), &scope)
            .await
            .inspect_err(|e| {
                if !e.is_cancellation() {
                    tracing::error!(environment = %self.name, table = %plan.table, error = %e, "Table profiling failed");
                }
            })?;

        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::debug!(
            environment = %self.name,
            table = %plan.table,
            duration_ms,
            "Profiled table"
        );
        record(self.recorder.as_ref(), || ProfilingEvent::TableProfiled {
            environment: self.name.clone(),
            table: plan.table.to_string(),
            duration_ms,
            sample_size: self.options.sample_cap(plan.row_count),
        });
        Ok(profile)
    }

    async fn profile_keyed(
        &self,
        plan: &TableProfilingPlan,
        cancel: &CancellationToken,
    ) -> (TableId, Result<TableProfile>) {
        (plan.table.folded(), self.profile_table(plan, cancel).await)
    }
}

#[async_trait]
impl SnapshotCapture for EnvironmentProfiler {
    fn kind(&self) -> &'static str {
        "sql"
    }

    async fn capture(
        &self,
        model: &LogicalModel,
        cancel: &CancellationToken,
    ) -> Result<ProfileSnapshot> {
        let tables = self.requested_tables(model);
        let catalog = self.load_metadata(&tables, cancel).await?;

        let plans = QueryPlanner::new(model, &catalog, &self.options, &self.mappings).plan()?;
        for table in &plans.skipped_tables {
            record(self.recorder.as_ref(), || ProfilingEvent::TableSkipped {
                environment: self.name.clone(),
                table: table.to_string(),
            });
        }

        let workers = self.options.max_parallel_tables.max(1);
        tracing::info!(
            environment = %self.name,
            tables = plans.plans.len(),
            skipped = plans.skipped_tables.len(),
            workers,
            "Profiling tables"
        );

        let pending: Vec<_> = plans
            .plans
            .iter()
            .filter(|plan| !plan.is_trivial())
            .map(|plan| self.profile_keyed(plan, cancel))
            .collect();
        let mut results = stream::iter(pending).buffer_unordered(workers);

        // each table is written exactly once
        let mut profiles: HashMap<TableId, TableProfile> = HashMap::new();
        while let Some((key, result)) = results.next().await {
            let profile = result?;
            match profiles.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(profile);
                }
                Entry::Occupied(slot) => {
                    return Err(DriftProbeError::invalid_model(format!(
                        "table {} planned twice",
                        slot.key()
                    )));
                }
            }
        }

        let mut snapshot = TableProfile::default();
        for profile in profiles.into_values() {
            snapshot.columns.extend(profile.columns);
            snapshot.unique_candidates.extend(profile.unique_candidates);
            snapshot
                .composite_unique_candidates
                .extend(profile.composite_unique_candidates);
            snapshot.foreign_keys.extend(profile.foreign_keys);
        }

        Ok(ProfileSnapshot::new(
            snapshot.columns,
            snapshot.unique_candidates,
            snapshot.composite_unique_candidates,
            snapshot.foreign_keys,
            catalog.tables(),
        ))
    }
}
