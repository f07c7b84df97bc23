//! Backend contract.
//!
//! The core never talks to storage directly. It opens sessions through a
//! [`SessionFactory`] and relies on [`SourceSession::commit`] being a single
//! all-or-nothing write that rejects the whole source when any
//! `(entity, version)` pair or lease is already taken.

pub mod memory;

pub use memory::InMemoryBackend;

use crate::core::{ConflictKind, Id, Lease, Pointer, Result, Tag, Version};
use crate::envelope::Envelope;
use crate::source::{MessageRecord, Source};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    Conflict(ConflictKind),
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Message filter. Empty filters match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageQuery {
    pub entity_ids: Vec<Id>,
    /// Exclusive lower bound.
    pub after: Option<Version>,
    /// Inclusive upper bound.
    pub up_to: Option<Version>,
    /// Messages that added this lease.
    pub lease: Option<Lease>,
    /// Messages that added this tag.
    pub tag: Option<Tag>,
    pub source_ids: Vec<Id>,
}

impl MessageQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_entity(id: Id) -> Self {
        Self {
            entity_ids: vec![id],
            ..Self::default()
        }
    }

    pub fn with_entity(mut self, id: Id) -> Self {
        self.entity_ids.push(id);
        self
    }

    pub fn after(mut self, version: Version) -> Self {
        self.after = Some(version);
        self
    }

    pub fn up_to(mut self, version: Version) -> Self {
        self.up_to = Some(version);
        self
    }

    pub fn with_lease(mut self, lease: Lease) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn from_source(mut self, source_id: Id) -> Self {
        self.source_ids.push(source_id);
        self
    }

    pub fn matches(&self, record: &MessageRecord) -> bool {
        let message = &record.message;
        let version = message.state_pointer.version;
        (self.entity_ids.is_empty() || self.entity_ids.contains(&message.state_pointer.id))
            && self.after.is_none_or(|after| version > after)
            && self.up_to.is_none_or(|up_to| version <= up_to)
            && self
                .lease
                .as_ref()
                .is_none_or(|lease| message.add_leases.contains(lease))
            && self.tag.as_ref().is_none_or(|tag| message.add_tags.contains(tag))
            && (self.source_ids.is_empty() || self.source_ids.contains(&record.source_id))
    }
}

#[async_trait]
pub trait SourceSession: Send + Sync {
    fn is_read_only(&self) -> bool;

    /// Atomically persists every message of `source`, or none of them.
    async fn commit(&self, source: &Source) -> Result<CommitOutcome>;

    /// Matching messages. Ordered by `(entity, version)` when the query names
    /// entities, otherwise in commit order.
    async fn messages(&self, query: &MessageQuery) -> Result<Vec<MessageRecord>>;

    /// Pointer of the message currently holding `lease`.
    async fn lease(&self, lease: &Lease) -> Result<Option<Pointer>>;

    async fn tagged(&self, tag: &Tag) -> Result<Vec<Pointer>>;

    async fn latest_version(&self, id: Id) -> Result<Option<Version>>;

    async fn source(&self, id: Id) -> Result<Option<Source>>;
}

/// Which slot a snapshot occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotSlot {
    /// The single mutable slot per entity, keyed by `Pointer::latest(id)`.
    Latest,
    /// Kept at its own pointer for point-in-time reads.
    Versioned,
}

impl SnapshotSlot {
    pub fn key(self, pointer: Pointer) -> Pointer {
        match self {
            Self::Latest => Pointer::latest(pointer.id),
            Self::Versioned => pointer,
        }
    }
}

/// Materialized entity. `pointer` is the entity's own version, never zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub pointer: Pointer,
    pub value: Envelope,
}

#[async_trait]
pub trait SnapshotSession: Send + Sync {
    fn is_read_only(&self) -> bool;

    /// Snapshot stored under `key`. A zero-version key reads the latest slot.
    async fn get(&self, key: Pointer) -> Result<Option<Snapshot>>;

    /// Highest versioned snapshot of `id` at or below `version`.
    async fn nearest(&self, id: Id, version: Version) -> Result<Option<Snapshot>>;

    async fn put(&self, slot: SnapshotSlot, snapshot: Snapshot) -> Result<()>;

    async fn delete(&self, key: Pointer) -> Result<bool>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionOptions {
    pub read_only: bool,
    pub label: Option<String>,
}

impl SessionOptions {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Opens sessions. Each session holds its backend resources until dropped.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn source_session(&self, options: &SessionOptions) -> Result<Box<dyn SourceSession>>;

    async fn snapshot_session(&self, options: &SessionOptions)
    -> Result<Box<dyn SnapshotSession>>;
}
