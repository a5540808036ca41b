//! Logical model consumed by the planner.
//!
//! The model enumerates modules, entities, attributes, relationships and
//! indexes. It states declared intent only; physical reality comes from the
//! catalog of each environment.

mod provider;

pub use provider::{JsonModelProvider, LogicalModelProvider};

use crate::error::DriftProbeError;
use crate::models::TableId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The full logical model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogicalModel {
    pub modules: Vec<ModelModule>,
}

/// A named group of entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelModule {
    pub name: String,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

/// One logical entity backed by a physical table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub indexes: Vec<EntityIndex>,
}

/// One attribute backed by a physical column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub column: String,
    #[serde(default)]
    pub is_identifier: bool,
    #[serde(default)]
    pub is_mandatory: bool,
    #[serde(default)]
    pub reference: Option<AttributeReference>,
}

/// Declared relationship from an attribute to another entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeReference {
    /// Logical name of the target entity
    pub target_entity: String,
    /// Declared module prefix of the target, for cross-module references
    #[serde(default)]
    pub target_module: Option<String>,
    /// Physical table hint for the target
    #[serde(default)]
    pub target_table: Option<String>,
    /// The model expects a database-enforced constraint
    #[serde(default)]
    pub has_database_constraint: bool,
}

/// Declared index over one or more attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityIndex {
    pub name: String,
    #[serde(default)]
    pub is_unique: bool,
    /// Attribute names, in index order
    pub attributes: Vec<String>,
}

impl Entity {
    /// Physical table identity.
    pub fn table_id(&self) -> TableId {
        TableId::new(&self.schema, &self.table)
    }

    /// Looks up an attribute by logical name.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// The identifier attribute, if one is declared.
    pub fn identifier(&self) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.is_identifier)
    }
}

impl LogicalModel {
    /// Every entity paired with its owning module, in declaration order.
    pub fn entities(&self) -> impl Iterator<Item = (&ModelModule, &Entity)> {
        self.modules
            .iter()
            .flat_map(|module| module.entities.iter().map(move |entity| (module, entity)))
    }

    /// Distinct physical tables named by the model, in declaration order.
    pub fn tables(&self) -> Vec<TableId> {
        let mut seen = HashSet::new();
        self.entities()
            .map(|(_, entity)| entity.table_id())
            .filter(|table| seen.insert(table.folded()))
            .collect()
    }

    /// Checks structural consistency.
    ///
    /// # Errors
    /// Returns an invalid-model error for empty or duplicate names and for
    /// indexes that mention unknown attributes
    pub fn validate(&self) -> crate::Result<()> {
        let mut module_names = HashSet::new();
        for module in &self.modules {
            if module.name.trim().is_empty() {
                return Err(DriftProbeError::invalid_model("module name cannot be empty"));
            }
            if !module_names.insert(module.name.as_str()) {
                return Err(DriftProbeError::invalid_model(format!(
                    "duplicate module '{}'",
                    module.name
                )));
            }

            let mut entity_names = HashSet::new();
            for entity in &module.entities {
                validate_entity(&module.name, entity)?;
                if !entity_names.insert(entity.name.as_str()) {
                    return Err(DriftProbeError::invalid_model(format!(
                        "duplicate entity '{}' in module '{}'",
                        entity.name, module.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn validate_entity(module: &str, entity: &Entity) -> crate::Result<()> {
    if entity.name.trim().is_empty() || entity.table.trim().is_empty() {
        return Err(DriftProbeError::invalid_model(format!(
            "entity in module '{}' needs a name and a table",
            module
        )));
    }

    let mut attribute_names = HashSet::new();
    for attribute in &entity.attributes {
        if attribute.column.trim().is_empty() {
            return Err(DriftProbeError::invalid_model(format!(
                "attribute '{}.{}' has no column",
                entity.name, attribute.name
            )));
        }
        if !attribute_names.insert(attribute.name.as_str()) {
            return Err(DriftProbeError::invalid_model(format!(
                "duplicate attribute '{}.{}'",
                entity.name, attribute.name
            )));
        }
    }

    for index in &entity.indexes {
        if index.attributes.is_empty() {
            return Err(DriftProbeError::invalid_model(format!(
                "index '{}' on '{}' has no attributes",
                index.name, entity.name
            )));
        }
        if let Some(missing) = index
            .attributes
            .iter()
            .find(|name| entity.attribute(name).is_none())
        {
            return Err(DriftProbeError::invalid_model(format!(
                "index '{}' on '{}' references unknown attribute '{}'",
                index.name, entity.name, missing
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attribute(name: &str) -> Attribute {
        Attribute {
            name: name.to_string(),
            column: name.to_string(),
            is_identifier: name == "Id",
            is_mandatory: false,
            reference: None,
        }
    }

    fn model() -> LogicalModel {
        LogicalModel {
            modules: vec![ModelModule {
                name: "Sales".to_string(),
                entities: vec![Entity {
                    name: "Order".to_string(),
                    schema: "dbo".to_string(),
                    table: "Orders".to_string(),
                    attributes: vec![attribute("Id"), attribute("Email")],
                    indexes: vec![EntityIndex {
                        name: "IX_Email".to_string(),
                        is_unique: true,
                        attributes: vec!["Email".to_string()],
                    }],
                }],
            }],
        }
    }

    #[test]
    fn test_valid_model() {
        let model = model();
        assert!(model.validate().is_ok());
        assert_eq!(model.tables(), vec![TableId::new("dbo", "Orders")]);
        let (module, entity) = model.entities().next().expect("one entity");
        assert_eq!(module.name, "Sales");
        assert_eq!(entity.identifier().map(|a| a.name.as_str()), Some("Id"));
    }

    #[test]
    fn test_index_with_unknown_attribute_rejected() {
        let mut model = model();
        model.modules[0].entities[0].indexes[0]
            .attributes
            .push("Missing".to_string());
        let err = model.validate().expect_err("unknown attribute");
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidModel);
    }

    #[test]
    fn test_duplicate_entity_rejected() {
        let mut model = model();
        let entity = model.modules[0].entities[0].clone();
        model.modules[0].entities.push(entity);
        assert!(model.validate().is_err());
    }
}
