//! Multi-environment scenarios over in-memory catalogs.
//!
//! Covers:
//! - A NULL hidden in one environment's sample blocking NOT NULL everywhere
//! - Lenient mode and missing-table findings
//! - Ambiguous relationship targets excluded from orphan probing
//! - Deterministic planning
//! - Conservative fallbacks when probes time out

use driftprobe_core::catalog::{CatalogQueryService, MemoryCatalog, MemoryTable};
use driftprobe_core::consensus::{DisagreementReason, IssueCategory};
use driftprobe_core::models::ColumnKey;
use driftprobe_core::planner::QueryPlanner;
use driftprobe_core::{
    CaptureOptions, CaptureReport, ConstraintKind, EnvironmentCapture, EnvironmentConfig,
    EnvironmentProfiler, LogicalModel, MultiEnvironmentOrchestrator, ProbeOutcome,
    ProfilingOptions, ProviderConfig, Severity, TableId, capture_with,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn sales_model() -> LogicalModel {
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
                        {"name": "UX_Orders_Email", "is_unique": true, "attributes": ["Email"]}
                    ]
                }
            ]
        }]
    }))
    .expect("valid model")
}

fn customers() -> MemoryTable {
    MemoryTable::new("dbo", "Customers")
        .primary_key("Id")
        .column("Name")
        .with_rows((1..=3).map(|id| json!({"Id": id, "Name": format!("customer {}", id)})))
}

fn orders(rows: impl IntoIterator<Item = Value>) -> MemoryTable {
    MemoryTable::new("dbo", "Orders")
        .primary_key("Id")
        .column("Email")
        .column("CustomerId")
        .with_rows(rows)
}

fn clean_orders(count: u64) -> impl Iterator<Item = Value> {
    (1..=count).map(|id| {
        json!({"Id": id, "Email": format!("order{}@example.com", id), "CustomerId": 1 + id % 3})
    })
}

fn environment(
    name: &str,
    catalog: MemoryCatalog,
    options: &ProfilingOptions,
    primary: bool,
) -> EnvironmentCapture {
    let mut config = EnvironmentConfig::new(
        name,
        ProviderConfig::Fixture {
            snapshot_path: format!("{}.json", name).into(),
        },
    );
    if primary {
        config = config.primary();
    }
    EnvironmentCapture {
        config,
        capture: Arc::new(EnvironmentProfiler::new(
            name,
            Arc::new(catalog),
            options.clone(),
        )),
    }
}

async fn run(
    environments: Vec<(&str, MemoryCatalog)>,
    model: &LogicalModel,
    options: CaptureOptions,
) -> CaptureReport {
    let captures = environments
        .into_iter()
        .enumerate()
        .map(|(i, (name, catalog))| environment(name, catalog, &options.profiling, i == 0))
        .collect();
    let orchestrator = MultiEnvironmentOrchestrator::new(captures, options);
    capture_with(&orchestrator, model, &CancellationToken::new())
        .await
        .expect("capture succeeds")
}

#[tokio::test]
async fn test_null_beyond_estimate_blocks_not_null() {
    let dev = MemoryCatalog::new()
        .with_table(customers())
        .with_table(orders(clean_orders(100)));

    // a stale estimate pushes prod into sampling; one NULL sits inside the
    // sample and one beyond it
    let prod_rows = (1..=12_000u64).map(|id| {
        let email = if id == 6 || id == 11_000 {
            Value::Null
        } else {
            json!(format!("order{}@example.com", id))
        };
        json!({"Id": id, "Email": email, "CustomerId": 1 + id % 3})
    });
    let prod = MemoryCatalog::new()
        .with_table(customers())
        .with_table(orders(prod_rows).with_row_count_estimate(1_000_000));

    let report = run(
        vec![("dev", dev), ("prod", prod)],
        &sales_model(),
        CaptureOptions::default(),
    )
    .await;

    let key = ColumnKey::new("dbo", "Orders", "Email");
    let prod_email = report.environments[1]
        .snapshot
        .column(&key)
        .expect("prod email profiled");
    assert_eq!(prod_email.null_count, 1);
    assert_eq!(prod_email.row_count, 1_000_000);
    assert_eq!(prod_email.null_probe.sample_size, Some(10_000));

    let merged = report.merged.column(&key).expect("merged email");
    assert!(merged.null_count >= 1);
    assert!(merged.row_count >= merged.null_count);
    assert_eq!(merged.null_probe.outcome, ProbeOutcome::Succeeded);

    let result = report
        .consensus
        .result(ConstraintKind::NotNull, "dbo.Orders.Email")
        .expect("email candidate");
    assert!(!result.is_safe_to_apply);
    assert_eq!(result.safe_environments, 1);
    assert_eq!(result.disagreements[0].environment, "prod");
    assert_eq!(
        result.disagreements[0].reason,
        DisagreementReason::HasNulls {
            null_count: 1,
            row_count: 1_000_000
        }
    );
    assert!(result.recommendation.contains("prod"));

    let name = report
        .consensus
        .result(ConstraintKind::NotNull, "dbo.Customers.Name")
        .expect("name candidate");
    assert!(name.is_safe_to_apply);
}

#[tokio::test]
async fn test_lenient_mode_reports_missing_table() {
    let mut model = sales_model();
    model.modules[0].entities.push(
        serde_json::from_value(json!({
            "name": "Legacy", "schema": "dbo", "table": "Legacy",
            "attributes": [{"name": "Id", "column": "Id", "is_identifier": true}]
        }))
        .expect("valid entity"),
    );

    let dev = MemoryCatalog::new()
        .with_table(customers())
        .with_table(orders(clean_orders(10)))
        .with_table(MemoryTable::new("dbo", "Legacy").primary_key("Id"));
    let prod = MemoryCatalog::new()
        .with_table(customers())
        .with_table(orders(clean_orders(10)));

    let options = CaptureOptions::default()
        .with_profiling(ProfilingOptions::default().with_lenient(true));
    let report = run(vec![("dev", dev), ("prod", prod)], &model, options).await;

    let finding = report
        .consensus
        .findings
        .iter()
        .find(|f| f.category == IssueCategory::MissingTable)
        .expect("missing table finding");
    assert_eq!(finding.severity, Severity::Warning);
    assert_eq!(finding.subject, "dbo.Legacy");
    assert_eq!(finding.environments, vec!["prod".to_string()]);
    assert!(!report.consensus.has_errors());
}

fn ambiguous_model() -> LogicalModel {
    let customer = |schema: &str| {
        json!({
            "name": "Customer", "schema": schema, "table": "Customers",
            "attributes": [{"name": "Id", "column": "Id", "is_identifier": true}]
        })
    };
    serde_json::from_value(json!({
        "modules": [
            {"name": "Crm", "entities": [customer("crm")]},
            {"name": "Billing", "entities": [customer("billing")]},
            {
                "name": "Sales",
                "entities": [{
                    "name": "Order", "schema": "sales", "table": "Orders",
                    "attributes": [
                        {"name": "Id", "column": "Id", "is_identifier": true},
                        {"name": "Customer", "column": "CustomerId",
                         "reference": {"target_entity": "Customer"}}
                    ]
                }]
            }
        ]
    }))
    .expect("valid model")
}

fn ambiguous_catalog() -> MemoryCatalog {
    MemoryCatalog::new()
        .with_table(MemoryTable::new("crm", "Customers").primary_key("Id"))
        .with_table(MemoryTable::new("billing", "Customers").primary_key("Id"))
        .with_table(
            MemoryTable::new("sales", "Orders")
                .primary_key("Id")
                .column("CustomerId")
                .with_rows(vec![json!({"Id": 1, "CustomerId": 99})]),
        )
}

#[tokio::test]
async fn test_ambiguous_target_is_never_probed() {
    let model = ambiguous_model();
    let catalog = ambiguous_catalog();
    let metadata = catalog
        .load_batch(&model.tables())
        .await
        .expect("metadata loads");
    let options = ProfilingOptions::default();
    let plans = QueryPlanner::new(&model, &metadata, &options, &[])
        .plan()
        .expect("plans");
    let orders = plans
        .plans
        .iter()
        .find(|p| p.table == TableId::new("sales", "Orders"))
        .expect("orders plan");
    assert!(orders.foreign_keys.is_empty());
    assert_eq!(orders.ambiguous_references.len(), 1);

    let report = run(vec![("dev", catalog)], &model, CaptureOptions::default()).await;
    let fk = &report.merged.foreign_keys[0];
    assert_eq!(fk.probe.outcome, ProbeOutcome::AmbiguousMapping);
    assert_eq!(fk.orphan_count, 0);

    let consensus = report
        .consensus
        .results
        .iter()
        .find(|r| r.kind == ConstraintKind::ForeignKey)
        .expect("foreign key candidate");
    assert!(!consensus.is_safe_to_apply);
    assert_eq!(
        consensus.disagreements[0].reason,
        DisagreementReason::IncompleteProbe {
            outcome: ProbeOutcome::AmbiguousMapping
        }
    );
    assert!(
        report
            .consensus
            .findings
            .iter()
            .any(|f| f.category == IssueCategory::AmbiguousRelationship
                && f.severity == Severity::Info)
    );
}

#[tokio::test]
async fn test_database_foreign_key_disambiguates_target() {
    let model = ambiguous_model();
    let catalog = ambiguous_catalog().with_foreign_key(
        TableId::new("sales", "Orders"),
        "CustomerId",
        TableId::new("crm", "Customers"),
        "Id",
        true,
    );
    let metadata = catalog
        .load_batch(&model.tables())
        .await
        .expect("metadata loads");
    let options = ProfilingOptions::default();
    let plans = QueryPlanner::new(&model, &metadata, &options, &[])
        .plan()
        .expect("plans");
    let orders = plans
        .plans
        .iter()
        .find(|p| p.table == TableId::new("sales", "Orders"))
        .expect("orders plan");
    assert!(orders.ambiguous_references.is_empty());
    assert_eq!(orders.foreign_keys.len(), 1);
    assert_eq!(orders.foreign_keys[0].reference.to_schema, "crm");
    assert!(orders.foreign_keys[0].has_catalog_constraint);
}

#[tokio::test]
async fn test_planning_is_deterministic() {
    let model = sales_model();
    let catalog = MemoryCatalog::new()
        .with_table(customers())
        .with_table(orders(clean_orders(5)))
        .with_unique_index(TableId::new("dbo", "Orders"), &["Email"]);
    let options = ProfilingOptions::default();

    let first = catalog.load_batch(&model.tables()).await.expect("metadata");
    let second = catalog.load_batch(&model.tables()).await.expect("metadata");
    let a = QueryPlanner::new(&model, &first, &options, &[])
        .plan()
        .expect("plans");
    let b = QueryPlanner::new(&model, &second, &options, &[])
        .plan()
        .expect("plans");
    assert_eq!(a, b);
    assert_eq!(a.plans.len(), 2);
    assert!(
        a.plans[1]
            .unique_candidates
            .iter()
            .all(|candidate| candidate.is_enforced)
    );
}

#[tokio::test]
async fn test_probe_timeouts_degrade_to_fallbacks() {
    let rows = vec![
        json!({"Id": 1, "Email": "a@x", "CustomerId": 1}),
        json!({"Id": 2, "Email": "b@x", "CustomerId": 2}),
        json!({"Id": 3, "Email": "c@x", "CustomerId": 3}),
    ];
    let dev = MemoryCatalog::new()
        .with_table(customers())
        .with_table(orders(rows.clone()));
    let prod = MemoryCatalog::new()
        .with_table(customers())
        .with_table(orders(rows))
        .with_probe_timeouts_on(TableId::new("dbo", "Orders"));

    let report = run(
        vec![("dev", dev), ("prod", prod)],
        &sales_model(),
        CaptureOptions::default(),
    )
    .await;

    let prod = &report.environments[1].snapshot;
    let email = prod
        .column(&ColumnKey::new("dbo", "Orders", "Email"))
        .expect("email profiled");
    assert_eq!(email.null_probe.outcome, ProbeOutcome::FallbackTimeout);
    assert_eq!(email.null_count, 3);
    assert!(email.null_rows.is_none());

    assert!(prod.unique_candidates[0].has_duplicate);
    assert_eq!(prod.foreign_keys[0].orphan_count, 3);
    assert_eq!(prod.foreign_keys[0].probe.outcome, ProbeOutcome::FallbackTimeout);

    let merged = report
        .merged
        .column(&ColumnKey::new("dbo", "Orders", "Email"))
        .expect("merged email");
    assert_eq!(merged.null_probe.outcome, ProbeOutcome::FallbackTimeout);

    let result = report
        .consensus
        .result(ConstraintKind::NotNull, "dbo.Orders.Email")
        .expect("email candidate");
    assert!(!result.is_safe_to_apply);
    assert_eq!(
        result.disagreements[0].reason,
        DisagreementReason::IncompleteProbe {
            outcome: ProbeOutcome::FallbackTimeout
        }
    );
    assert!(
        report
            .consensus
            .findings
            .iter()
            .any(|f| f.category == IssueCategory::IncompleteProbe)
    );
}

#[tokio::test]
async fn test_fallbacks_stay_unsafe_when_estimate_is_zero() {
    let rows = vec![
        json!({"Id": 1, "Email": null, "CustomerId": 9}),
        json!({"Id": 2, "Email": null, "CustomerId": 8}),
    ];
    let dev = MemoryCatalog::new()
        .with_table(customers())
        .with_table(orders(clean_orders(3)));
    let prod = MemoryCatalog::new()
        .with_table(customers())
        .with_table(orders(rows).with_row_count_estimate(0))
        .with_probe_timeouts_on(TableId::new("dbo", "Orders"));

    let report = run(
        vec![("dev", dev), ("prod", prod)],
        &sales_model(),
        CaptureOptions::default(),
    )
    .await;

    let prod = &report.environments[1].snapshot;
    let email = prod
        .column(&ColumnKey::new("dbo", "Orders", "Email"))
        .expect("email profiled");
    assert_eq!(email.null_probe.outcome, ProbeOutcome::FallbackTimeout);
    assert!(email.null_count > 0);
    assert!(email.row_count >= email.null_count);

    let fk = &prod.foreign_keys[0];
    assert_eq!(fk.probe.outcome, ProbeOutcome::FallbackTimeout);
    assert!(fk.orphan_count > 0);
    assert!(fk.has_orphans);

    let merged = report
        .merged
        .column(&ColumnKey::new("dbo", "Orders", "Email"))
        .expect("merged email");
    assert!(merged.null_count > 0);
    assert!(report.merged.foreign_keys[0].has_orphans);

    for (kind, descriptor) in [
        (ConstraintKind::NotNull, "dbo.Orders.Email"),
        (ConstraintKind::ForeignKey, "dbo.Orders.CustomerId -> dbo.Customers"),
    ] {
        let result = report
            .consensus
            .result(kind, descriptor)
            .expect("candidate reported");
        assert!(!result.is_safe_to_apply, "{} reported safe", descriptor);
    }
}
