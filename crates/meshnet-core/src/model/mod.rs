//! Model base - registry of mesh types
//!
//! The model base resolves type identifiers carried by mesh objects and
//! changes. Model definitions are untrusted input: every cross reference is
//! checked when the model is loaded, and nothing about specific types is
//! hard-coded.

mod types;
mod value;

pub use types::{
    EntityType, EntityTypeDefinition, ModelDefinition, PropertyType, PropertyTypeDefinition,
    RelationshipType, RelationshipTypeDefinition, RoleEnd, RoleType, role_identifier,
};
pub use value::{DataType, PropertyValue};

use crate::identifier::MeshTypeIdentifier;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};

/// Registry of entity, property, relationship and role types
#[derive(Debug, Clone, Default)]
pub struct ModelBase {
    entity_types: HashMap<MeshTypeIdentifier, EntityType>,
    property_types: HashMap<MeshTypeIdentifier, PropertyType>,
    relationship_types: HashMap<MeshTypeIdentifier, RelationshipType>,
    role_types: HashMap<MeshTypeIdentifier, RoleType>,
}

impl ModelBase {
    /// Create an empty model base
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a model from its JSON definition
    pub fn from_json(json: &str) -> Result<Self> {
        let definition: ModelDefinition = serde_json::from_str(json)
            .map_err(|e| Error::model(format!("Invalid model definition: {}", e)))?;
        Self::from_definition(definition)
    }

    /// Build and validate a model from its definition
    pub fn from_definition(definition: ModelDefinition) -> Result<Self> {
        let mut model = Self::new();

        for def in &definition.entity_types {
            let identifier = MeshTypeIdentifier::parse(&def.identifier)
                .map_err(|_| Error::model(format!("Bad entity type identifier {:?}", def.identifier)))?;
            if model.entity_types.contains_key(&identifier) {
                return Err(Error::model(format!("Duplicate entity type {}", identifier)));
            }

            let mut property_types = Vec::with_capacity(def.property_types.len());
            for prop in &def.property_types {
                let prop_id = MeshTypeIdentifier::parse(&prop.identifier).map_err(|_| {
                    Error::model(format!("Bad property type identifier {:?}", prop.identifier))
                })?;
                if model.property_types.contains_key(&prop_id) {
                    return Err(Error::model(format!("Duplicate property type {}", prop_id)));
                }
                if let Some(default) = &prop.default_value {
                    if !prop.data_type.accepts(default) {
                        return Err(Error::model(format!(
                            "Default value of {} does not match {:?}",
                            prop_id, prop.data_type
                        )));
                    }
                }
                if !prop.optional && prop.default_value.is_none() {
                    return Err(Error::model(format!(
                        "Mandatory property {} needs a default value",
                        prop_id
                    )));
                }
                model.property_types.insert(
                    prop_id.clone(),
                    PropertyType {
                        identifier: prop_id.clone(),
                        entity_type: identifier.clone(),
                        data_type: prop.data_type,
                        default_value: prop.default_value.clone(),
                        optional: prop.optional,
                    },
                );
                property_types.push(prop_id);
            }

            model.entity_types.insert(
                identifier.clone(),
                EntityType {
                    identifier,
                    supertypes: def
                        .supertypes
                        .iter()
                        .map(|s| MeshTypeIdentifier::from(s.as_str()))
                        .collect(),
                    is_abstract: def.is_abstract,
                    property_types,
                },
            );
        }

        for entity in model.entity_types.values() {
            for supertype in &entity.supertypes {
                if !model.entity_types.contains_key(supertype) {
                    return Err(Error::model(format!(
                        "Entity type {} names unknown supertype {}",
                        entity.identifier, supertype
                    )));
                }
            }
        }
        model.check_supertype_cycles()?;

        for def in &definition.relationship_types {
            let identifier = MeshTypeIdentifier::parse(&def.identifier).map_err(|_| {
                Error::model(format!("Bad relationship type identifier {:?}", def.identifier))
            })?;
            if model.relationship_types.contains_key(&identifier) {
                return Err(Error::model(format!("Duplicate relationship type {}", identifier)));
            }
            let source = model.resolve_end(&identifier, def.source.as_deref())?;
            let destination = model.resolve_end(&identifier, def.destination.as_deref())?;

            let source = RoleType::for_relationship(&identifier, RoleEnd::Source, source);
            let destination =
                RoleType::for_relationship(&identifier, RoleEnd::Destination, destination);
            model.role_types.insert(source.identifier.clone(), source.clone());
            model
                .role_types
                .insert(destination.identifier.clone(), destination.clone());
            model.relationship_types.insert(
                identifier.clone(),
                RelationshipType {
                    identifier,
                    source,
                    destination,
                },
            );
        }

        tracing::debug!(
            "Loaded model with {} entity types, {} relationship types",
            model.entity_types.len(),
            model.relationship_types.len()
        );

        Ok(model)
    }

    fn resolve_end(
        &self,
        relationship: &MeshTypeIdentifier,
        entity_type: Option<&str>,
    ) -> Result<Option<MeshTypeIdentifier>> {
        match entity_type {
            None => Ok(None),
            Some(name) => {
                let id = MeshTypeIdentifier::from(name);
                if self.entity_types.contains_key(&id) {
                    Ok(Some(id))
                } else {
                    Err(Error::model(format!(
                        "Relationship type {} names unknown entity type {}",
                        relationship, id
                    )))
                }
            }
        }
    }

    fn check_supertype_cycles(&self) -> Result<()> {
        for start in self.entity_types.keys() {
            let mut seen = HashSet::new();
            let mut queue: VecDeque<&MeshTypeIdentifier> = VecDeque::new();
            queue.extend(&self.entity_types[start].supertypes);
            while let Some(current) = queue.pop_front() {
                if current == start {
                    return Err(Error::model(format!("Supertype cycle through {}", start)));
                }
                if seen.insert(current) {
                    if let Some(entity) = self.entity_types.get(current) {
                        queue.extend(&entity.supertypes);
                    }
                }
            }
        }
        Ok(())
    }

    /// Look up an entity type
    pub fn entity_type(&self, id: &MeshTypeIdentifier) -> Result<&EntityType> {
        self.entity_types
            .get(id)
            .ok_or_else(|| Error::unresolved(format!("entity type {}", id)))
    }

    /// Look up a property type
    pub fn property_type(&self, id: &MeshTypeIdentifier) -> Result<&PropertyType> {
        self.property_types
            .get(id)
            .ok_or_else(|| Error::unresolved(format!("property type {}", id)))
    }

    /// Look up a relationship type
    pub fn relationship_type(&self, id: &MeshTypeIdentifier) -> Result<&RelationshipType> {
        self.relationship_types
            .get(id)
            .ok_or_else(|| Error::unresolved(format!("relationship type {}", id)))
    }

    /// Look up a role type
    pub fn role_type(&self, id: &MeshTypeIdentifier) -> Result<&RoleType> {
        self.role_types
            .get(id)
            .ok_or_else(|| Error::unresolved(format!("role type {}", id)))
    }

    /// The role at the other end of the same relationship type
    pub fn inverse_role(&self, id: &MeshTypeIdentifier) -> Result<&RoleType> {
        let role = self.role_type(id)?;
        self.role_type(&role.inverse_identifier())
    }

    /// Whether `sub` equals `sup` or inherits from it, transitively
    pub fn is_subtype_of(&self, sub: &MeshTypeIdentifier, sup: &MeshTypeIdentifier) -> bool {
        if sub == sup {
            return true;
        }
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([sub]);
        while let Some(current) = queue.pop_front() {
            let Some(entity) = self.entity_types.get(current) else {
                continue;
            };
            for supertype in &entity.supertypes {
                if supertype == sup {
                    return true;
                }
                if seen.insert(supertype) {
                    queue.push_back(supertype);
                }
            }
        }
        false
    }

    /// Whether any of `types` is `required` or one of its subtypes
    pub fn satisfies<'a>(
        &self,
        types: impl IntoIterator<Item = &'a MeshTypeIdentifier>,
        required: &MeshTypeIdentifier,
    ) -> bool {
        types.into_iter().any(|t| self.is_subtype_of(t, required))
    }

    /// All property types of an entity type, including inherited ones
    pub fn all_property_types(&self, id: &MeshTypeIdentifier) -> Vec<&PropertyType> {
        let mut result = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(entity) = self.entity_types.get(current) {
                result.extend(
                    entity
                        .property_types
                        .iter()
                        .filter_map(|p| self.property_types.get(p)),
                );
                queue.extend(&entity.supertypes);
            }
        }
        result
    }

    /// Number of registered entity types
    pub fn entity_type_count(&self) -> usize {
        self.entity_types.len()
    }
}
