use super::{DeltaEffects, Entity, reduce};
use crate::core::{Id, Lease, Pointer, Result, StoreError, Tag};
use crate::envelope::EnvelopeService;
use crate::source::{AgentAccessor, Message, Source};
use std::collections::HashMap;
use std::sync::Arc;

struct Step<E: Entity> {
    pointer: Pointer,
    delta: E::Delta,
    add_leases: Vec<Lease>,
    add_tags: Vec<Tag>,
    delete_leases: Vec<Lease>,
    delete_tags: Vec<Tag>,
}

/// Stages deltas against a private working set of entities and freezes them
/// into one [`Source`].
///
/// One builder per unit of work. It is `&mut self` throughout and is not meant
/// to be shared between tasks.
pub struct TransactionBuilder<E: Entity> {
    envelopes: EnvelopeService,
    agent: Arc<dyn AgentAccessor>,
    known: HashMap<Id, E>,
    steps: Vec<Step<E>>,
}

impl<E: Entity> std::fmt::Debug for TransactionBuilder<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionBuilder")
            .field("known", &self.known.len())
            .field("steps", &self.steps.len())
            .finish_non_exhaustive()
    }
}

impl<E: Entity> TransactionBuilder<E> {
    pub fn new(envelopes: EnvelopeService, agent: Arc<dyn AgentAccessor>) -> Self {
        Self {
            envelopes,
            agent,
            known: HashMap::new(),
            steps: Vec::new(),
        }
    }

    /// Adds an entity read from the store to the working set.
    pub fn load(&mut self, entity: E) -> Result<&mut Self> {
        let id = entity.id();
        if self.known.contains_key(&id) {
            return Err(StoreError::EntityAlreadyKnown(id));
        }
        self.known.insert(id, entity);
        Ok(self)
    }

    /// Reduces `delta` against `id`, constructing a fresh entity if `id` is not
    /// in the working set yet.
    pub fn append(&mut self, id: Id, delta: E::Delta) -> Result<&E> {
        let current = self
            .known
            .remove(&id)
            .unwrap_or_else(|| E::construct(id));
        Ok(self.record(current, delta))
    }

    /// Like [`append`](Self::append) but requires `id` to be loaded or appended before.
    pub fn update(&mut self, id: Id, delta: E::Delta) -> Result<&E> {
        let current = self
            .known
            .remove(&id)
            .ok_or(StoreError::UnknownEntity(id))?;
        Ok(self.record(current, delta))
    }

    fn record(&mut self, current: E, delta: E::Delta) -> &E {
        let id = current.id();
        let next = reduce(current, &delta);
        self.steps.push(Step {
            pointer: Pointer::new(id, next.version()),
            add_leases: delta.add_leases(&next),
            add_tags: delta.add_tags(&next),
            delete_leases: delta.delete_leases(&next),
            delete_tags: delta.delete_tags(&next),
            delta,
        });
        self.known.entry(id).or_insert(next)
    }

    pub fn entity(&self, id: Id) -> Option<&E> {
        self.known.get(&id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Freezes the recorded steps into a source and resets the builder.
    ///
    /// On error the builder is left untouched.
    pub fn build(&mut self, source_id: Id) -> Result<Source> {
        let stamp = self.agent.current(&self.envelopes)?;
        let messages = self
            .steps
            .iter()
            .map(|step| {
                Ok(Message {
                    id: Id::new(),
                    state_pointer: step.pointer,
                    delta: self.envelopes.serialize(&step.delta)?,
                    add_leases: step.add_leases.clone(),
                    add_tags: step.add_tags.clone(),
                    delete_leases: step.delete_leases.clone(),
                    delete_tags: step.delete_tags.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.known.clear();
        self.steps.clear();
        Ok(Source::new(source_id, stamp, messages))
    }
}
