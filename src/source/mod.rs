//! The append-only record: messages grouped into atomically committed sources.

pub mod agent;

pub use agent::{AgentAccessor, FixedAgentAccessor, ProcessAgentAccessor, ProcessSignature};

use crate::core::{Id, Lease, Pointer, Tag};
use crate::envelope::Envelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One committed delta against one entity.
///
/// `state_pointer.version` is the entity's version right after `delta` is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Id,
    pub state_pointer: Pointer,
    pub delta: Envelope,
    #[serde(default)]
    pub add_leases: Vec<Lease>,
    #[serde(default)]
    pub add_tags: Vec<Tag>,
    #[serde(default)]
    pub delete_leases: Vec<Lease>,
    #[serde(default)]
    pub delete_tags: Vec<Tag>,
}

impl Message {
    pub fn new(state_pointer: Pointer, delta: Envelope) -> Self {
        Self {
            id: Id::new(),
            state_pointer,
            delta,
            add_leases: Vec::new(),
            add_tags: Vec::new(),
            delete_leases: Vec::new(),
            delete_tags: Vec::new(),
        }
    }

    pub fn with_add_lease(mut self, lease: Lease) -> Self {
        self.add_leases.push(lease);
        self
    }

    pub fn with_add_tag(mut self, tag: Tag) -> Self {
        self.add_tags.push(tag);
        self
    }

    pub fn with_delete_lease(mut self, lease: Lease) -> Self {
        self.delete_leases.push(lease);
        self
    }

    pub fn with_delete_tag(mut self, tag: Tag) -> Self {
        self.delete_tags.push(tag);
        self
    }

    pub fn entity_id(&self) -> Id {
        self.state_pointer.id
    }
}

/// Atomic, ordered batch of messages stamped with the committing agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Id,
    pub timestamp: DateTime<Utc>,
    pub agent_signature: Envelope,
    pub messages: Vec<Message>,
}

impl Source {
    pub fn new(id: Id, stamp: AgentStamp, messages: Vec<Message>) -> Self {
        Self {
            id,
            timestamp: stamp.timestamp,
            agent_signature: stamp.signature,
            messages,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn messages_for(&self, id: Id) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .filter(move |message| message.state_pointer.id == id)
    }
}

/// A message as read back, annotated with the source that committed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub source_id: Id,
    pub source_timestamp: DateTime<Utc>,
    pub message: Message,
}

impl MessageRecord {
    pub fn pointer(&self) -> Pointer {
        self.message.state_pointer
    }
}

/// Who is committing, and when.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStamp {
    pub timestamp: DateTime<Utc>,
    pub signature: Envelope,
}
