//! Relationship target resolution.
//!
//! A reference attribute names its target loosely (a logical entity name,
//! maybe a module prefix, maybe a physical table hint). Resolution tries, in
//! order:
//!
//! 1. an observed database foreign key from the source column whose target
//!    table belongs to exactly one entity;
//! 2. a naming override for the target entity, scoped to its module;
//! 3. a unique entity on the physical table hint;
//! 4. a unique entity by logical name, narrowed by the declared module
//!    prefix and then by same-module preference.
//!
//! Several candidates and no database foreign key to disambiguate them means
//! the reference is ambiguous: probing a guessed target could report orphans
//! that do not exist, so it is never probed.

use crate::catalog::{CatalogForeignKey, CatalogSnapshot};
use crate::config::NamingOverride;
use crate::model::{AttributeReference, Entity, LogicalModel, ModelModule};
use crate::models::{TableId, TableNameMapping};

/// Finds the catalog's table for a logical table, applying name mappings.
///
/// An exact-case match wins over case-insensitive ones.
pub(crate) fn locate_table(
    catalog: &CatalogSnapshot,
    mappings: &[TableNameMapping],
    table: &TableId,
) -> Option<TableId> {
    let actual = mappings
        .iter()
        .find(|m| m.model.eq_ignore_case(table))
        .map_or(table, |m| &m.actual);
    let matches = catalog.matching_tables(actual);
    matches
        .iter()
        .find(|candidate| *candidate == actual)
        .or_else(|| matches.first())
        .cloned()
}

/// A uniquely resolved relationship target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedTarget {
    pub(crate) table: TableId,
    pub(crate) physical_table: TableId,
    pub(crate) column: String,
    pub(crate) physical_column: String,
    pub(crate) has_catalog_constraint: bool,
}

/// Result of resolving one reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolution {
    Resolved(ResolvedTarget),
    /// More than one plausible target and no database constraint
    Ambiguous(usize),
    /// No usable target; the reason is logged
    Excluded(&'static str),
}

/// Resolves reference attributes against one environment's catalog.
pub(crate) struct ReferenceResolver<'a> {
    model: &'a LogicalModel,
    catalog: &'a CatalogSnapshot,
    overrides: &'a [NamingOverride],
    mappings: &'a [TableNameMapping],
}

impl<'a> ReferenceResolver<'a> {
    pub(crate) fn new(
        model: &'a LogicalModel,
        catalog: &'a CatalogSnapshot,
        overrides: &'a [NamingOverride],
        mappings: &'a [TableNameMapping],
    ) -> Self {
        Self {
            model,
            catalog,
            overrides,
            mappings,
        }
    }

    /// Resolves `reference`, declared on a column of `source_table`.
    pub(crate) fn resolve(
        &self,
        module: &ModelModule,
        source_table: &TableId,
        source_column: &str,
        reference: &AttributeReference,
    ) -> Resolution {
        let database_fk = self
            .catalog
            .foreign_keys_from(source_table)
            .into_iter()
            .find(|fk| fk.from_column.eq_ignore_ascii_case(source_column));

        if let Some(fk) = database_fk {
            let owners: Vec<&Entity> = self
                .model
                .entities()
                .map(|(_, entity)| entity)
                .filter(|entity| self.physical_of(entity).is_some_and(|t| t.eq_ignore_case(&fk.to)))
                .collect();
            if let [owner] = owners.as_slice() {
                return self.target(owner, Some(fk));
            }
        }

        if let Some(resolution) = self.by_override(module, reference, database_fk) {
            return resolution;
        }

        if let Some(hint) = reference.target_table.as_deref() {
            let hinted: Vec<&Entity> = self
                .model
                .entities()
                .map(|(_, entity)| entity)
                .filter(|entity| matches_hint(entity, hint))
                .collect();
            if let [entity] = hinted.as_slice() {
                return self.target(entity, database_fk);
            }
        }

        let mut named: Vec<(&ModelModule, &Entity)> = self
            .model
            .entities()
            .filter(|(_, entity)| entity.name.eq_ignore_ascii_case(&reference.target_entity))
            .collect();
        if let Some(prefix) = reference.target_module.as_deref() {
            named.retain(|(owner, _)| owner.name.eq_ignore_ascii_case(prefix));
        }
        if named.len() > 1 && named.iter().any(|(owner, _)| owner.name == module.name) {
            named.retain(|(owner, _)| owner.name == module.name);
        }

        match named.as_slice() {
            [] => Resolution::Excluded("target entity not found"),
            [(_, entity)] => self.target(entity, database_fk),
            candidates => {
                // a database constraint pins the physical target
                if let Some(fk) = database_fk {
                    let backed: Vec<&Entity> = candidates
                        .iter()
                        .map(|(_, entity)| *entity)
                        .filter(|entity| {
                            self.physical_of(entity).is_some_and(|t| t.eq_ignore_case(&fk.to))
                        })
                        .collect();
                    if let [entity] = backed.as_slice() {
                        return self.target(entity, Some(fk));
                    }
                }
                Resolution::Ambiguous(candidates.len())
            }
        }
    }

    fn by_override(
        &self,
        module: &ModelModule,
        reference: &AttributeReference,
        database_fk: Option<&CatalogForeignKey>,
    ) -> Option<Resolution> {
        let mut matching: Vec<&NamingOverride> = self
            .overrides
            .iter()
            .filter(|o| o.entity.eq_ignore_ascii_case(&reference.target_entity))
            .filter(|o| {
                reference
                    .target_module
                    .as_deref()
                    .is_none_or(|prefix| o.module.eq_ignore_ascii_case(prefix))
            })
            .collect();
        if matching.len() > 1 {
            matching.retain(|o| o.module == module.name);
        }
        let [naming] = matching.as_slice() else {
            return None;
        };

        let table = TableId::new(&naming.schema, &naming.table);
        let owner = self
            .model
            .modules
            .iter()
            .filter(|m| m.name.eq_ignore_ascii_case(&naming.module))
            .flat_map(|m| m.entities.iter())
            .find(|e| e.name.eq_ignore_ascii_case(&naming.entity));

        let Some(physical) = locate_table(self.catalog, self.mappings, &table) else {
            return Some(Resolution::Excluded("override target missing from catalog"));
        };
        let identifier = owner
            .and_then(Entity::identifier)
            .map(|a| a.column.clone())
            .or_else(|| self.single_primary_key(&physical));
        Some(self.finish(table, physical, identifier, database_fk))
    }

    fn target(&self, entity: &Entity, database_fk: Option<&CatalogForeignKey>) -> Resolution {
        let table = entity.table_id();
        let Some(physical) = self.physical_of(entity) else {
            return Resolution::Excluded("target table missing from catalog");
        };

        // the constraint's own target column wins over the declared identifier
        let identifier = match database_fk.filter(|fk| fk.to.eq_ignore_case(&physical)) {
            Some(fk) => Some(
                entity
                    .attributes
                    .iter()
                    .find(|a| a.column.eq_ignore_ascii_case(&fk.to_column))
                    .map_or_else(|| fk.to_column.clone(), |a| a.column.clone()),
            ),
            None => entity
                .identifier()
                .map(|a| a.column.clone())
                .or_else(|| self.single_primary_key(&physical)),
        };
        self.finish(table, physical, identifier, database_fk)
    }

    fn finish(
        &self,
        table: TableId,
        physical: TableId,
        identifier: Option<String>,
        database_fk: Option<&CatalogForeignKey>,
    ) -> Resolution {
        let Some(column) = identifier else {
            return Resolution::Excluded("target has no identifier");
        };
        let Some(physical_column) = self
            .catalog
            .columns_of(&physical)
            .into_iter()
            .find(|c| c.column.eq_ignore_ascii_case(&column))
            .map(|c| c.column.clone())
        else {
            return Resolution::Excluded("target identifier missing from catalog");
        };

        Resolution::Resolved(ResolvedTarget {
            has_catalog_constraint: database_fk.is_some_and(|fk| fk.to.eq_ignore_case(&physical)),
            table,
            physical_table: physical,
            column,
            physical_column,
        })
    }

    fn physical_of(&self, entity: &Entity) -> Option<TableId> {
        locate_table(self.catalog, self.mappings, &entity.table_id())
    }

    fn single_primary_key(&self, table: &TableId) -> Option<String> {
        let key: Vec<&str> = self
            .catalog
            .columns_of(table)
            .into_iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.column.as_str())
            .collect();
        match key.as_slice() {
            [single] => Some((*single).to_string()),
            _ => None,
        }
    }
}

/// Matches `table` or `schema.table` hints, ignoring case.
fn matches_hint(entity: &Entity, hint: &str) -> bool {
    match hint.split_once('.') {
        Some((schema, table)) => {
            entity.schema.eq_ignore_ascii_case(schema) && entity.table.eq_ignore_ascii_case(table)
        }
        None => entity.table.eq_ignore_ascii_case(hint),
    }
}
