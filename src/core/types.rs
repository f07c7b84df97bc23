use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque 128-bit identifier for entities, messages and sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(Uuid);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for Id {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position in an entity's delta sequence.
///
/// `Version::ZERO` is reserved: in a stored entity it means "nothing applied yet",
/// in a requested [`Pointer`] it means "latest".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    pub const ZERO: Version = Version(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Next version. Saturates instead of wrapping so versions never decrease.
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Previous version, or `None` at zero.
    pub const fn previous(&self) -> Option<Self> {
        match self.0 {
            0 => None,
            v => Some(Self(v - 1)),
        }
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entity at one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pointer {
    pub id: Id,
    pub version: Version,
}

impl Pointer {
    pub const fn new(id: Id, version: Version) -> Self {
        Self { id, version }
    }

    /// Pointer to whatever version of `id` is current.
    pub const fn latest(id: Id) -> Self {
        Self {
            id,
            version: Version::ZERO,
        }
    }

    pub const fn next(&self) -> Self {
        Self {
            id: self.id,
            version: self.version.next(),
        }
    }

    pub const fn is_latest(&self) -> bool {
        self.version.is_zero()
    }

    /// A zero-version pointer accepts any version of the same id.
    pub fn is_satisfied_by(&self, actual: &Pointer) -> bool {
        self.id == actual.id && (self.version.is_zero() || self.version == actual.version)
    }
}

impl From<Id> for Pointer {
    fn from(id: Id) -> Self {
        Self::latest(id)
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Globally unique `(scope, label, value)` claim.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lease {
    pub scope: String,
    pub label: String,
    pub value: String,
}

impl Lease {
    pub fn new(
        scope: impl Into<String>,
        label: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            scope: scope.into(),
            label: label.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}={}", self.scope, self.label, self.value)
    }
}

/// Non-unique `(label, value)` metadata attached at a version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub label: String,
    pub value: String,
}

impl Tag {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.label, self.value)
    }
}
