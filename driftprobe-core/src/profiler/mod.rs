//! Single-environment snapshot capture.
//!
//! [`SnapshotCapture`] is the one interface the orchestrator drives. Two
//! implementations exist: [`EnvironmentProfiler`] profiles a live catalog and
//! [`FixtureCapture`] replays a snapshot from disk. [`create_capture`] selects
//! one from an environment's [`ProviderConfig`].

mod environment;
mod fixture;

pub use environment::EnvironmentProfiler;
pub use fixture::FixtureCapture;

use crate::config::{EnvironmentConfig, ProfilingOptions, ProviderConfig};
use crate::model::LogicalModel;
use crate::models::ProfileSnapshot;
use crate::recorder::SharedRecorder;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Produces one environment's [`ProfileSnapshot`].
#[async_trait]
pub trait SnapshotCapture: Send + Sync {
    /// Provider name used in logs and events.
    fn kind(&self) -> &'static str;

    /// Captures the snapshot for `model`.
    ///
    /// # Errors
    /// Returns an error when metadata cannot be loaded, the model does not
    /// match the catalog in strict mode, a probe fails with a non-timeout
    /// error, or `cancel` fires
    async fn capture(
        &self,
        model: &LogicalModel,
        cancel: &CancellationToken,
    ) -> Result<ProfileSnapshot>;
}

/// Builds the capture implementation for `environment`.
///
/// SQL pools are created lazily, so this does not touch the network.
///
/// # Errors
/// Returns an error for invalid URLs or engines not compiled in
pub fn create_capture(
    environment: &EnvironmentConfig,
    options: &ProfilingOptions,
    recorder: Option<SharedRecorder>,
) -> Result<Arc<dyn SnapshotCapture>> {
    match &environment.provider {
        ProviderConfig::Sql { url, connection } => {
            let connection = connection.for_profiling(options)?;
            let catalog = crate::catalog::create_catalog(url, &connection)?;
            Ok(Arc::new(
                EnvironmentProfiler::new(&environment.name, catalog, options.clone())
                    .with_table_mappings(environment.table_mappings.clone())
                    .with_recorder(recorder),
            ))
        }
        ProviderConfig::Fixture { snapshot_path } => {
            Ok(Arc::new(FixtureCapture::new(snapshot_path.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryCatalog, MemoryTable};
    use crate::config::ConnectionConfig;
    use crate::error::ErrorCode;
    use crate::models::{ColumnKey, ProbeOutcome, TableId};
    use crate::recorder::{MemoryRecorder, ProfilingEvent};
    use serde_json::json;
    use std::time::Duration;

    fn model() -> LogicalModel {
        serde_json::from_value(json!({
            "modules": [{
                "name": "Sales",
                "entities": [
                    {
                        "name": "Customer", "schema": "dbo", "table": "Customers",
                        "attributes": [
                            {"name": "Id", "column": "Id", "is_identifier": true},
                            {"name": "Name", "column": "Name"}
                        ]
                    },
                    {
                        "name": "Order", "schema": "dbo", "table": "Orders",
                        "attributes": [
                            {"name": "Id", "column": "Id", "is_identifier": true},
                            {"name": "Email", "column": "Email"},
                            {"name": "Customer", "column": "CustomerId",
                             "reference": {"target_entity": "Customer"}}
                        ],
                        "indexes": [
                            {"name": "UX_Email", "is_unique": true, "attributes": ["Email"]}
                        ]
                    }
                ]
            }]
        }))
        .expect("valid model")
    }

    fn catalog() -> MemoryCatalog {
        MemoryCatalog::new()
            .with_table(
                MemoryTable::new("dbo", "Customers")
                    .primary_key("Id")
                    .column("Name")
                    .with_rows(vec![
                        json!({"Id": 1, "Name": "Ada"}),
                        json!({"Id": 2, "Name": "Grace"}),
                    ]),
            )
            .with_table(
                MemoryTable::new("dbo", "Orders")
                    .primary_key("Id")
                    .column("Email")
                    .column("CustomerId")
                    .with_rows(vec![
                        json!({"Id": 1, "Email": "a@x", "CustomerId": 1}),
                        json!({"Id": 2, "Email": null, "CustomerId": 7}),
                        json!({"Id": 3, "Email": "a@x", "CustomerId": 2}),
                    ]),
            )
    }

    fn profiler(catalog: MemoryCatalog, options: ProfilingOptions) -> EnvironmentProfiler {
        EnvironmentProfiler::new("dev", Arc::new(catalog), options)
    }

    #[tokio::test]
    async fn test_profiles_every_concern() {
        let snapshot = profiler(catalog(), ProfilingOptions::default())
            .capture(&model(), &CancellationToken::new())
            .await
            .expect("capture succeeds");

        let email = snapshot
            .column(&ColumnKey::new("dbo", "Orders", "Email"))
            .expect("email profiled");
        assert_eq!(email.null_count, 1);
        assert_eq!(email.row_count, 3);
        assert_eq!(email.null_probe.outcome, ProbeOutcome::Succeeded);
        let rows = email.null_rows.as_ref().expect("null evidence");
        assert_eq!(rows.rows, vec![vec!["2".to_string()]]);

        let unique = snapshot
            .unique_candidate(&ColumnKey::new("dbo", "Orders", "Email"))
            .expect("unique candidate");
        assert!(unique.has_duplicate);

        assert_eq!(snapshot.foreign_keys.len(), 1);
        let fk = &snapshot.foreign_keys[0];
        assert_eq!(fk.orphan_count, 1);
        assert!(fk.has_orphans);
        assert!(!fk.is_not_trusted);
        let orphans = fk.orphan_rows.as_ref().expect("orphan evidence");
        assert_eq!(orphans.rows[0].foreign_key_value, "7");

        assert_eq!(
            snapshot.catalog_tables,
            vec![TableId::new("dbo", "Customers"), TableId::new("dbo", "Orders")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_metadata_failures_are_retried() {
        let catalog = catalog().with_transient_metadata_failures(2);
        let counter = catalog.clone();
        let snapshot = profiler(catalog, ProfilingOptions::default())
            .capture(&model(), &CancellationToken::new())
            .await
            .expect("retries recover");
        assert!(!snapshot.is_empty());
        assert!(counter.metadata_calls() > 4);
    }

    #[tokio::test]
    async fn test_permanent_metadata_failure_fails_capture() {
        let err = profiler(
            catalog().with_permanent_metadata_failure(),
            ProfilingOptions::default(),
        )
        .capture(&model(), &CancellationToken::new())
        .await
        .expect_err("capture fails");
        assert_eq!(err.code(), ErrorCode::CatalogLoadFailed);
    }

    #[tokio::test]
    async fn test_probe_timeouts_degrade_instead_of_failing() {
        let catalog = catalog().with_probe_timeouts_on(TableId::new("dbo", "Orders"));
        let snapshot = profiler(catalog, ProfilingOptions::default())
            .capture(&model(), &CancellationToken::new())
            .await
            .expect("capture succeeds");

        let email = snapshot
            .column(&ColumnKey::new("dbo", "Orders", "Email"))
            .expect("email profiled");
        assert_eq!(email.null_probe.outcome, ProbeOutcome::FallbackTimeout);
        assert_eq!(email.null_count, email.row_count);
        assert!(email.null_rows.is_none());

        let unique = snapshot
            .unique_candidate(&ColumnKey::new("dbo", "Orders", "Email"))
            .expect("unique candidate");
        assert!(unique.has_duplicate);
        assert_eq!(unique.probe.outcome, ProbeOutcome::FallbackTimeout);
        assert_eq!(snapshot.foreign_keys[0].orphan_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_table_deadline_excludes_connection_wait() {
        let catalog = catalog().with_session_delay(Duration::from_secs(5));
        let snapshot = profiler(catalog, ProfilingOptions::default().with_table_timeout_secs(2))
            .capture(&model(), &CancellationToken::new())
            .await
            .expect("capture succeeds");

        let email = snapshot
            .column(&ColumnKey::new("dbo", "Orders", "Email"))
            .expect("email profiled");
        assert_eq!(email.null_probe.outcome, ProbeOutcome::Succeeded);
        assert_eq!(email.null_count, 1);
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded() {
        let catalog = catalog().with_probe_delay(Duration::from_millis(20));
        let counter = catalog.clone();
        profiler(
            catalog,
            ProfilingOptions::default().with_max_parallel_tables(2),
        )
        .capture(&model(), &CancellationToken::new())
        .await
        .expect("capture succeeds");
        assert!(counter.peak_sessions() <= 2);
        assert!(counter.peak_sessions() >= 1);
    }

    #[tokio::test]
    async fn test_caller_cancellation_fails_capture() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = profiler(catalog(), ProfilingOptions::default())
            .capture(&model(), &cancel)
            .await
            .expect_err("cancelled");
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn test_events_are_recorded() {
        let recorder = Arc::new(MemoryRecorder::new());
        let shared: SharedRecorder = recorder.clone();
        profiler(catalog(), ProfilingOptions::default())
            .with_recorder(Some(shared))
            .capture(&model(), &CancellationToken::new())
            .await
            .expect("capture succeeds");

        let events = recorder.events();
        assert!(
            events
                .iter()
                .any(|e| matches!(e.event, ProfilingEvent::MetadataLoaded { tables: 2, .. }))
        );
        let profiled = events
            .iter()
            .filter(|e| matches!(e.event, ProfilingEvent::TableProfiled { .. }))
            .count();
        assert_eq!(profiled, 2);
    }

    #[test]
    fn test_create_capture_dispatches_on_provider() {
        let fixture = EnvironmentConfig::new(
            "qa",
            ProviderConfig::Fixture {
                snapshot_path: "qa.json".into(),
            },
        );
        let capture =
            create_capture(&fixture, &ProfilingOptions::default(), None).expect("fixture");
        assert_eq!(capture.kind(), "fixture");

        let unknown = EnvironmentConfig::new(
            "prod",
            ProviderConfig::Sql {
                url: "oracle://db/prod".to_string(),
                connection: Default::default(),
            },
        );
        assert!(create_capture(&unknown, &ProfilingOptions::default(), None).is_err());
    }

    #[test]
    fn test_create_capture_rejects_pool_smaller_than_workers() {
        let environment = EnvironmentConfig::new(
            "prod",
            ProviderConfig::Sql {
                url: "sqlite://prod.db".to_string(),
                connection: ConnectionConfig::new().with_max_connections(2),
            },
        );
        let options = ProfilingOptions::default().with_max_parallel_tables(3);
        let err = create_capture(&environment, &options, None).err().expect("pool too small");
        assert_eq!(err.code(), ErrorCode::Configuration);
    }
}
