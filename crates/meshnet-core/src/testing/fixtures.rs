//! Test model
//!
//! `AA` is a concrete entity type with a string and an integer property,
//! `BB` a subtype of `AA` adding a float. `AR1A` relates `AA` to `AA`; `RR`
//! relates anything to anything.

/// Concrete entity type
pub const AA: &str = "test/AA";
/// Subtype of [`AA`]
pub const BB: &str = "test/BB";
/// Abstract entity type
pub const ABSTRACT: &str = "test/Abstract";

/// String property of [`AA`]
pub const AA_X: &str = "test/AA_X";
/// Integer property of [`AA`], defaults to 0
pub const AA_Y: &str = "test/AA_Y";
/// Float property of [`BB`]
pub const BB_Z: &str = "test/BB_Z";

/// Relationship type from [`AA`] to [`AA`]
pub const AR1A: &str = "test/AR1A";
/// Source role of [`AR1A`]
pub const AR1A_S: &str = "test/AR1A-S";
/// Destination role of [`AR1A`]
pub const AR1A_D: &str = "test/AR1A-D";

/// Relationship type without entity type requirements
pub const RR: &str = "test/RR";
/// Source role of [`RR`]
pub const RR_S: &str = "test/RR-S";
/// Destination role of [`RR`]
pub const RR_D: &str = "test/RR-D";

/// JSON definition of the test model
pub const MODEL_JSON: &str = r#"{
    "entity_types": [
        { "identifier": "test/Abstract", "abstract": true },
        {
            "identifier": "test/AA",
            "property_types": [
                { "identifier": "test/AA_X", "data_type": "String" },
                { "identifier": "test/AA_Y", "data_type": "Integer",
                  "default_value": { "Integer": 0 } }
            ]
        },
        {
            "identifier": "test/BB",
            "supertypes": ["test/AA"],
            "property_types": [
                { "identifier": "test/BB_Z", "data_type": "Float" }
            ]
        }
    ],
    "relationship_types": [
        { "identifier": "test/AR1A", "source": "test/AA", "destination": "test/AA" },
        { "identifier": "test/RR" }
    ]
}"#;
