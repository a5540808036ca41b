//! Query planner.
//!
//! Turns the logical model plus one environment's catalog metadata into a
//! [`TableProfilingPlan`] per table. Physical reality governs: a column is
//! planned only if the catalog has it, and primary-key membership comes from
//! the catalog rather than from the model.
//!
//! Planning is synchronous and deterministic: the same model, catalog and
//! options always produce equal plans.

mod plan;
mod resolve;

pub use plan::{ForeignKeyPlan, PlannedColumn, TableProfilingPlan, UniqueCandidatePlan};

use crate::catalog::{CatalogColumn, CatalogSnapshot};
use crate::config::ProfilingOptions;
use crate::error::DriftProbeError;
use crate::model::{Entity, LogicalModel, ModelModule};
use crate::models::{ForeignKeyReference, TableId, TableNameMapping};
use crate::Result;
use plan::PlanAccumulator;
use resolve::{ReferenceResolver, Resolution};
use std::collections::HashMap;

pub(crate) use resolve::locate_table;

/// Plans for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlanSet {
    /// One plan per distinct table, in model declaration order
    pub plans: Vec<TableProfilingPlan>,
    /// Model tables absent from the catalog (lenient mode only)
    pub skipped_tables: Vec<TableId>,
}

/// Builds profiling plans for one environment.
pub struct QueryPlanner<'a> {
    model: &'a LogicalModel,
    catalog: &'a CatalogSnapshot,
    options: &'a ProfilingOptions,
    mappings: &'a [TableNameMapping],
}

impl<'a> QueryPlanner<'a> {
    /// Creates a planner over one environment's metadata.
    pub fn new(
        model: &'a LogicalModel,
        catalog: &'a CatalogSnapshot,
        options: &'a ProfilingOptions,
        mappings: &'a [TableNameMapping],
    ) -> Self {
        Self {
            model,
            catalog,
            options,
            mappings,
        }
    }

    /// Builds every plan.
    ///
    /// # Errors
    /// In strict mode, returns a schema-mismatch error for the first table or
    /// column the model names that the catalog does not have.
    pub fn plan(&self) -> Result<PlanSet> {
        let resolver = ReferenceResolver::new(
            self.model,
            self.catalog,
            &self.options.naming_overrides,
            self.mappings,
        );

        let mut accumulators: Vec<PlanAccumulator> = Vec::new();
        let mut by_table: HashMap<TableId, usize> = HashMap::new();
        let mut skipped_tables: Vec<TableId> = Vec::new();

        for (module, entity) in self.model.entities() {
            let table = entity.table_id();
            let Some(physical) = locate_table(self.catalog, self.mappings, &table) else {
                if self.options.lenient {
                    tracing::info!(table = %table, "Table missing from catalog, skipping");
                    if !skipped_tables.iter().any(|t| t.eq_ignore_case(&table)) {
                        skipped_tables.push(table);
                    }
                    continue;
                }
                return Err(DriftProbeError::schema_mismatch(format!(
                    "table {} (entity '{}') does not exist",
                    table, entity.name
                )));
            };

            let index = *by_table.entry(table.folded()).or_insert_with(|| {
                accumulators.push(PlanAccumulator::new(
                    table.clone(),
                    physical.clone(),
                    self.catalog.row_count(&physical),
                    self.primary_key(&physical),
                ));
                accumulators.len() - 1
            });
            self.plan_entity(&resolver, module, entity, &mut accumulators[index])?;
        }

        Ok(PlanSet {
            plans: accumulators.into_iter().map(PlanAccumulator::build).collect(),
            skipped_tables,
        })
    }

    fn plan_entity(
        &self,
        resolver: &ReferenceResolver<'_>,
        module: &ModelModule,
        entity: &Entity,
        acc: &mut PlanAccumulator,
    ) -> Result<()> {
        let physical = acc.physical().clone();
        let catalog_columns = self.catalog.columns_of(&physical);
        let unique_indexes = self.catalog.unique_indexes_on(&physical);

        for attribute in &entity.attributes {
            let Some(found) = self.find_column(&catalog_columns, entity, &attribute.column)? else {
                continue;
            };

            let is_single_unique = unique_indexes
                .iter()
                .any(|ix| matches!(ix.columns.as_slice(), [only] if only.eq_ignore_ascii_case(&found.column)));
            acc.add_column(PlannedColumn {
                column: attribute.column.clone(),
                physical: found.column.clone(),
                is_nullable: found.is_nullable,
                is_computed: found.is_computed,
                is_identity: found.is_identity,
                is_primary_key: found.is_primary_key,
                is_single_unique,
                default_definition: found.default_definition.clone(),
            });

            let Some(reference) = &attribute.reference else {
                continue;
            };
            match resolver.resolve(module, &physical, &found.column, reference) {
                Resolution::Resolved(target) => acc.add_foreign_key(ForeignKeyPlan {
                    reference: ForeignKeyReference {
                        from_schema: entity.schema.clone(),
                        from_table: entity.table.clone(),
                        from_column: attribute.column.clone(),
                        to_schema: target.table.schema,
                        to_table: target.table.table,
                        to_column: target.column,
                        has_db_constraint: reference.has_database_constraint,
                    },
                    source_physical: found.column.clone(),
                    target_physical: target.physical_table,
                    target_column_physical: target.physical_column,
                    has_catalog_constraint: target.has_catalog_constraint,
                }),
                Resolution::Ambiguous(candidates) => {
                    tracing::info!(
                        entity = %entity.name,
                        attribute = %attribute.name,
                        target = %reference.target_entity,
                        candidates,
                        "Ambiguous relationship target, not probing"
                    );
                    // the unresolved logical name stands in for the target
                    acc.add_ambiguous(ForeignKeyReference {
                        from_schema: entity.schema.clone(),
                        from_table: entity.table.clone(),
                        from_column: attribute.column.clone(),
                        to_schema: String::new(),
                        to_table: reference.target_entity.clone(),
                        to_column: String::new(),
                        has_db_constraint: reference.has_database_constraint,
                    });
                }
                Resolution::Excluded(reason) => {
                    tracing::debug!(
                        entity = %entity.name,
                        attribute = %attribute.name,
                        target = %reference.target_entity,
                        reason,
                        "Relationship excluded from probing"
                    );
                }
            }
        }

        for index in entity.indexes.iter().filter(|ix| ix.is_unique) {
            let mut columns = Vec::with_capacity(index.attributes.len());
            let mut physical_columns = Vec::with_capacity(index.attributes.len());
            let mut complete = true;
            for name in &index.attributes {
                let Some(attribute) = entity.attribute(name) else {
                    complete = false;
                    break;
                };
                match self.find_column(&catalog_columns, entity, &attribute.column)? {
                    Some(found) => {
                        columns.push(attribute.column.clone());
                        physical_columns.push(found.column.clone());
                    }
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                tracing::debug!(index = %index.name, "Unique candidate mentions a missing column, skipping");
                continue;
            }

            let is_enforced = unique_indexes
                .iter()
                .any(|ix| same_column_set(&ix.columns, &physical_columns));
            acc.add_unique_candidate(UniqueCandidatePlan {
                columns,
                physical: physical_columns,
                is_enforced,
            });
        }

        Ok(())
    }

    /// Case-insensitive catalog lookup; a miss is fatal unless lenient.
    fn find_column<'c>(
        &self,
        catalog_columns: &[&'c CatalogColumn],
        entity: &Entity,
        column: &str,
    ) -> Result<Option<&'c CatalogColumn>> {
        let found = catalog_columns
            .iter()
            .find(|c| c.column == column)
            .or_else(|| catalog_columns.iter().find(|c| c.column.eq_ignore_ascii_case(column)))
            .copied();
        match found {
            Some(found) => Ok(Some(found)),
            None if self.options.lenient => {
                tracing::info!(
                    table = %entity.table_id(),
                    column,
                    "Column missing from catalog, skipping"
                );
                Ok(None)
            }
            None => Err(DriftProbeError::schema_mismatch(format!(
                "column {}.{} (entity '{}') does not exist",
                entity.table_id(),
                column,
                entity.name
            ))),
        }
    }

    fn primary_key(&self, physical: &TableId) -> Vec<String> {
        self.catalog
            .columns_of(physical)
            .into_iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.column.clone())
            .collect()
    }
}

fn same_column_set(left: &[String], right: &[String]) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .all(|l| right.iter().any(|r| r.eq_ignore_ascii_case(l)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogForeignKey, CatalogUniqueIndex, TableRowCount};
    use crate::error::ErrorCode;
    use crate::model::{Attribute, AttributeReference, EntityIndex};

    fn attribute(name: &str) -> Attribute {
        Attribute {
            name: name.to_string(),
            column: name.to_string(),
            is_identifier: name == "Id",
            is_mandatory: false,
            reference: None,
        }
    }

    fn reference(name: &str, target: &str) -> Attribute {
        Attribute {
            reference: Some(AttributeReference {
                target_entity: target.to_string(),
                target_module: None,
                target_table: None,
                has_database_constraint: true,
            }),
            ..attribute(name)
        }
    }

    fn catalog_column(table: &str, name: &str, ordinal: u32) -> CatalogColumn {
        CatalogColumn {
            schema: "dbo".to_string(),
            table: table.to_string(),
            column: name.to_string(),
            ordinal,
            is_nullable: name != "Id",
            is_computed: false,
            is_identity: name == "Id",
            is_primary_key: name == "Id",
            default_definition: None,
        }
    }

    fn model() -> LogicalModel {
        LogicalModel {
            modules: vec![ModelModule {
                name: "Sales".to_string(),
                entities: vec![
                    Entity {
                        name: "Order".to_string(),
                        schema: "dbo".to_string(),
                        table: "Orders".to_string(),
                        attributes: vec![
                            attribute("Id"),
                            attribute("Email"),
                            reference("CustomerId", "Customer"),
                        ],
                        indexes: vec![
                            EntityIndex {
                                name: "UX_Email".to_string(),
                                is_unique: true,
                                attributes: vec!["Email".to_string()],
                            },
                            EntityIndex {
                                name: "UX_Customer_Email".to_string(),
                                is_unique: true,
                                attributes: vec!["CustomerId".to_string(), "Email".to_string()],
                            },
                        ],
                    },
                    Entity {
                        name: "Customer".to_string(),
                        schema: "dbo".to_string(),
                        table: "Customers".to_string(),
                        attributes: vec![attribute("Id")],
                        indexes: Vec::new(),
                    },
                    Entity {
                        name: "Legacy".to_string(),
                        schema: "dbo".to_string(),
                        table: "Legacy".to_string(),
                        attributes: vec![attribute("Id")],
                        indexes: Vec::new(),
                    },
                ],
            }],
        }
    }

    fn catalog() -> CatalogSnapshot {
        CatalogSnapshot {
            columns: vec![
                catalog_column("Orders", "Id", 1),
                catalog_column("Orders", "email", 2),
                catalog_column("Orders", "CustomerId", 3),
                catalog_column("Customers", "Id", 1),
            ],
            row_counts: vec![TableRowCount {
                table: TableId::new("dbo", "Orders"),
                row_count: 1_000,
            }],
            foreign_keys: vec![CatalogForeignKey {
                name: "FK_Orders_Customers".to_string(),
                from: TableId::new("dbo", "Orders"),
                from_column: "CustomerId".to_string(),
                to: TableId::new("dbo", "Customers"),
                to_column: "Id".to_string(),
                is_not_trusted: true,
                is_disabled: false,
            }],
            unique_indexes: vec![CatalogUniqueIndex {
                name: "UX_Email".to_string(),
                table: TableId::new("dbo", "Orders"),
                columns: vec!["email".to_string()],
                is_primary_key: false,
            }],
        }
    }

    #[test]
    fn test_lenient_plan_skips_missing_table() {
        let model = model();
        let catalog = catalog();
        let options = ProfilingOptions::default().with_lenient(true);
        let plans = QueryPlanner::new(&model, &catalog, &options, &[])
            .plan()
            .expect("plans");

        assert_eq!(plans.skipped_tables, vec![TableId::new("dbo", "Legacy")]);
        assert_eq!(plans.plans.len(), 2);

        let orders = &plans.plans[0];
        assert_eq!(orders.row_count, 1_000);
        assert_eq!(orders.primary_key, vec!["Id".to_string()]);
        let email = orders.column("Email").expect("email planned");
        assert_eq!(email.physical, "email");
        assert!(email.is_single_unique);

        assert_eq!(orders.unique_candidates.len(), 2);
        assert!(orders.unique_candidates[0].is_enforced);
        assert!(!orders.unique_candidates[1].is_enforced);

        assert_eq!(orders.foreign_keys.len(), 1);
        let fk = &orders.foreign_keys[0];
        assert_eq!(fk.reference.to_table, "Customers");
        assert!(fk.has_catalog_constraint);
    }

    #[test]
    fn test_strict_plan_fails_on_missing_table() {
        let model = model();
        let catalog = catalog();
        let options = ProfilingOptions::default();
        let err = QueryPlanner::new(&model, &catalog, &options, &[])
            .plan()
            .expect_err("Legacy is missing");
        assert_eq!(err.code(), ErrorCode::SchemaMismatch);
        assert!(err.to_string().contains("Legacy"));
    }

    #[test]
    fn test_strict_plan_fails_on_missing_column() {
        let mut model = model();
        model.modules[0].entities.pop();
        model.modules[0].entities[1].attributes.push(attribute("Name"));
        let catalog = catalog();
        let options = ProfilingOptions::default();
        let err = QueryPlanner::new(&model, &catalog, &options, &[])
            .plan()
            .expect_err("Name is missing");
        assert_eq!(err.code(), ErrorCode::SchemaMismatch);
    }

    #[test]
    fn test_lenient_plan_drops_candidates_with_missing_columns() {
        let model = model();
        let mut catalog = catalog();
        catalog.columns.retain(|c| c.column != "email");
        let options = ProfilingOptions::default().with_lenient(true);
        let plans = QueryPlanner::new(&model, &catalog, &options, &[])
            .plan()
            .expect("plans");
        let orders = &plans.plans[0];
        assert!(orders.column("Email").is_none());
        assert!(orders.unique_candidates.is_empty());
    }

    #[test]
    fn test_table_mapping_sets_alias() {
        let model = model();
        let mut catalog = catalog();
        for column in catalog.columns.iter_mut().filter(|c| c.table == "Orders") {
            column.table = "tbl_orders".to_string();
        }
        catalog.foreign_keys.clear();
        let mappings = [TableNameMapping {
            model: TableId::new("dbo", "Orders"),
            actual: TableId::new("dbo", "tbl_orders"),
        }];
        let options = ProfilingOptions::default().with_lenient(true);
        let plans = QueryPlanner::new(&model, &catalog, &options, &mappings)
            .plan()
            .expect("plans");
        let orders = &plans.plans[0];
        assert_eq!(orders.table, TableId::new("dbo", "Orders"));
        assert_eq!(orders.physical_table(), &TableId::new("dbo", "tbl_orders"));
    }

    #[test]
    fn test_planning_is_deterministic() {
        let model = model();
        let catalog = catalog();
        let options = ProfilingOptions::default().with_lenient(true);
        let planner = QueryPlanner::new(&model, &catalog, &options, &[]);
        let first = planner.plan().expect("plans");
        let second = planner.plan().expect("plans");
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first.plans).expect("json"),
            serde_json::to_string(&second.plans).expect("json")
        );
    }
}
