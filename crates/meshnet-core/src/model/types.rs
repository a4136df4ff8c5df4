//! Mesh types: entity types, property types, relationship types and role types

use super::value::{DataType, PropertyValue};
use crate::identifier::MeshTypeIdentifier;
use serde::{Deserialize, Serialize};

/// Abstract type a mesh object can be blessed with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityType {
    /// Type identifier
    pub identifier: MeshTypeIdentifier,
    /// Direct supertypes
    pub supertypes: Vec<MeshTypeIdentifier>,
    /// Abstract types cannot be blessed directly
    pub is_abstract: bool,
    /// Property types declared locally (not inherited)
    pub property_types: Vec<MeshTypeIdentifier>,
}

/// Typed property declared by an entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyType {
    /// Type identifier
    pub identifier: MeshTypeIdentifier,
    /// Declaring entity type
    pub entity_type: MeshTypeIdentifier,
    /// Data type of values
    pub data_type: DataType,
    /// Value returned when unset
    pub default_value: Option<PropertyValue>,
    /// Whether the property may be unset
    pub optional: bool,
}

/// End of a relationship type a role type stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleEnd {
    /// Source end
    Source,
    /// Destination end
    Destination,
}

impl RoleEnd {
    /// The opposite end
    pub fn opposite(self) -> Self {
        match self {
            Self::Source => Self::Destination,
            Self::Destination => Self::Source,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::Source => "-S",
            Self::Destination => "-D",
        }
    }
}

/// One end of a relationship type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleType {
    /// Role identifier, derived from the relationship type
    pub identifier: MeshTypeIdentifier,
    /// Relationship type this role belongs to
    pub relationship_type: MeshTypeIdentifier,
    /// Which end this is
    pub end: RoleEnd,
    /// Entity type a mesh object must carry to play this role
    pub entity_type: Option<MeshTypeIdentifier>,
}

impl RoleType {
    pub(crate) fn for_relationship(
        relationship_type: &MeshTypeIdentifier,
        end: RoleEnd,
        entity_type: Option<MeshTypeIdentifier>,
    ) -> Self {
        Self {
            identifier: role_identifier(relationship_type, end),
            relationship_type: relationship_type.clone(),
            end,
            entity_type,
        }
    }

    /// Identifier of the opposite role
    pub fn inverse_identifier(&self) -> MeshTypeIdentifier {
        role_identifier(&self.relationship_type, self.end.opposite())
    }
}

/// Relationship type between two entity types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipType {
    /// Type identifier
    pub identifier: MeshTypeIdentifier,
    /// Source role
    pub source: RoleType,
    /// Destination role
    pub destination: RoleType,
}

/// Identifier of the role at `end` of a relationship type
pub fn role_identifier(relationship_type: &MeshTypeIdentifier, end: RoleEnd) -> MeshTypeIdentifier {
    MeshTypeIdentifier::new(format!("{}{}", relationship_type, end.suffix()))
}

/// Serialized model definition, as loaded from untrusted input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelDefinition {
    /// Entity types
    #[serde(default)]
    pub entity_types: Vec<EntityTypeDefinition>,
    /// Relationship types
    #[serde(default)]
    pub relationship_types: Vec<RelationshipTypeDefinition>,
}

/// Serialized entity type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityTypeDefinition {
    /// Type identifier
    pub identifier: String,
    /// Direct supertypes
    #[serde(default)]
    pub supertypes: Vec<String>,
    /// Abstract flag
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    /// Declared properties
    #[serde(default)]
    pub property_types: Vec<PropertyTypeDefinition>,
}

/// Serialized property type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyTypeDefinition {
    /// Type identifier
    pub identifier: String,
    /// Data type
    pub data_type: DataType,
    /// Default value
    #[serde(default)]
    pub default_value: Option<PropertyValue>,
    /// Optional flag
    #[serde(default = "default_optional")]
    pub optional: bool,
}

fn default_optional() -> bool {
    true
}

/// Serialized relationship type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipTypeDefinition {
    /// Type identifier
    pub identifier: String,
    /// Entity type required at the source end
    #[serde(default)]
    pub source: Option<String>,
    /// Entity type required at the destination end
    #[serde(default)]
    pub destination: Option<String>,
}
