use super::types::{Id, Lease, Pointer, Version};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cannot resolve type from envelope headers: {0}")]
    CannotResolveType(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Entity {0} is already known to this transaction")]
    EntityAlreadyKnown(Id),

    #[error("Entity {0} was never loaded into this transaction")]
    UnknownEntity(Id),

    #[error("Entity not found at {0}")]
    EntityNotFound(Pointer),

    #[error("Version gap for entity {id}: expected {expected}, found {found}")]
    VersionGap {
        id: Id,
        expected: Version,
        found: Version,
    },

    #[error("Read-only session rejected write: {0}")]
    ReadOnly(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Deserialization(err.to_string())
    }
}

/// Why a backend rejected a whole `Source`.
///
/// A conflict is an expected outcome of optimistic concurrency, not an error:
/// it travels inside [`crate::session::CommitOutcome`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// Another writer already committed this `(entity, version)` pair.
    VersionTaken(Pointer),
    /// The lease is held by another message.
    LeaseTaken(Lease),
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionTaken(pointer) => write!(f, "version_taken({pointer})"),
            Self::LeaseTaken(lease) => write!(f, "lease_taken({lease})"),
        }
    }
}
