//! Stable identifiers for mesh objects, mesh bases and mesh types
//!
//! Nodes never hold references to each other. Relationships, proxies and
//! type memberships all name their target by identifier and are resolved
//! through the owning mesh base or model base.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! identifier_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create from an external form
            pub fn new(external_form: impl Into<String>) -> Self {
                Self(external_form.into())
            }

            /// Parse an external form, rejecting empty and whitespace-padded input
            pub fn parse(external_form: &str) -> Result<Self> {
                if external_form.is_empty() || external_form.trim() != external_form {
                    return Err(Error::unresolved(format!(
                        "invalid {} external form: {:?}",
                        stringify!($name),
                        external_form
                    )));
                }
                Ok(Self(external_form.to_string()))
            }

            /// External form of this identifier
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

identifier_type!(
    /// Identifies a mesh object across every mesh base holding a replica of it
    MeshObjectIdentifier
);

identifier_type!(
    /// Identifies a mesh base (one peer store)
    MeshBaseIdentifier
);

identifier_type!(
    /// Identifies an entity type, role type, relationship type or property type
    MeshTypeIdentifier
);

impl MeshObjectIdentifier {
    /// Generate a fresh, random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}
