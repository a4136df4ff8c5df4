//! Error types for MeshNet Core

use crate::identifier::{MeshBaseIdentifier, MeshObjectIdentifier, MeshTypeIdentifier};
use thiserror::Error;

/// Result type alias using MeshNet Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the replicated mesh store
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from storage operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// LMDB/heed database errors
    #[error("Database error: {0}")]
    Database(#[from] heed::Error),

    /// A transaction is already active on this mesh base
    #[error("Transaction already active on mesh base {0}")]
    TransactionAlreadyActive(String),

    /// A proxy's outbound queue is at its bound
    #[error("Outbound queue {owner} -> {partner} is full")]
    OutboundQueueFull {
        /// Mesh base owning the proxy
        owner: MeshBaseIdentifier,
        /// Partner the messages are waiting for
        partner: MeshBaseIdentifier,
    },

    /// Misuse of a transaction that is no longer active
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A change could not be applied to a replica
    #[error("Cannot apply change to {object}: {reason}")]
    CannotApplyChange {
        /// Affected mesh object
        object: MeshObjectIdentifier,
        /// Why the change was rejected
        reason: String,
    },

    /// The two mesh objects are not related
    #[error("{object} is not related to {neighbor}")]
    NotRelated {
        /// Mesh object
        object: MeshObjectIdentifier,
        /// Expected neighbor
        neighbor: MeshObjectIdentifier,
    },

    /// The two mesh objects are related already
    #[error("{object} is already related to {neighbor}")]
    RelatedAlready {
        /// Mesh object
        object: MeshObjectIdentifier,
        /// Existing neighbor
        neighbor: MeshObjectIdentifier,
    },

    /// A mesh object cannot be related to itself
    #[error("{0} cannot be related to itself")]
    CannotRelateToItself(MeshObjectIdentifier),

    /// Store key was not found
    #[error("Store key does not exist: {0}")]
    StoreKeyDoesNotExist(String),

    /// Store key is taken already
    #[error("Store key exists already: {0}")]
    StoreKeyExistsAlready(String),

    /// An identifier could not be resolved to a mesh object or mesh type
    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),

    /// A mesh object with this identifier exists already
    #[error("Mesh object exists already: {0}")]
    MeshObjectExistsAlready(MeshObjectIdentifier),

    /// The operation requires the replica to hold the lock
    #[error("Replica of {0} does not hold the lock")]
    NotLockOwner(MeshObjectIdentifier),

    /// The operation is not allowed on the lock-holding replica
    #[error("Replica of {0} holds the lock")]
    ReplicaIsLockOwner(MeshObjectIdentifier),

    /// Mesh object is not blessed with the type
    #[error("{object} is not blessed with {mesh_type}")]
    NotBlessed {
        /// Mesh object
        object: MeshObjectIdentifier,
        /// Missing type
        mesh_type: MeshTypeIdentifier,
    },

    /// Mesh object is blessed with the type already
    #[error("{object} is already blessed with {mesh_type}")]
    BlessedAlready {
        /// Mesh object
        object: MeshObjectIdentifier,
        /// Existing type
        mesh_type: MeshTypeIdentifier,
    },

    /// A role type needs the mesh object to carry an entity type
    #[error("Role type {role_type} requires {object} to be blessed with {entity_type}")]
    RoleTypeRequiresEntityType {
        /// Mesh object
        object: MeshObjectIdentifier,
        /// Role type
        role_type: MeshTypeIdentifier,
        /// Required entity type
        entity_type: MeshTypeIdentifier,
    },

    /// Property type does not apply to this mesh object
    #[error("Property type {property} does not apply to {object}")]
    IllegalPropertyType {
        /// Mesh object
        object: MeshObjectIdentifier,
        /// Property type
        property: MeshTypeIdentifier,
    },

    /// Value does not fit the property type
    #[error("Illegal value for property {property}: {reason}")]
    IllegalPropertyValue {
        /// Property type
        property: MeshTypeIdentifier,
        /// Why the value was rejected
        reason: String,
    },

    /// Model definition errors
    #[error("Model error: {0}")]
    Model(String),

    /// Encoding or decoding of persisted data failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Proxy wire frame errors
    #[error("Wire error: {0}")]
    Wire(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a transaction error
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Create a change application error
    pub fn cannot_apply(object: &MeshObjectIdentifier, reason: impl Into<String>) -> Self {
        Self::CannotApplyChange {
            object: object.clone(),
            reason: reason.into(),
        }
    }

    /// Create an unresolved reference error
    pub fn unresolved(what: impl Into<String>) -> Self {
        Self::UnresolvedReference(what.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a wire error
    pub fn wire(msg: impl Into<String>) -> Self {
        Self::Wire(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error only reports that the target state is reached already.
    ///
    /// Replica application swallows these instead of surfacing them.
    pub fn is_tolerable(&self) -> bool {
        matches!(self, Self::NotRelated { .. } | Self::RelatedAlready { .. })
    }
}
