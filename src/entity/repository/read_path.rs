impl<E: Entity> EntityRepository<E> {
    /// Entity at `pointer`. A zero-version pointer reads the latest state.
    pub async fn get(&self, pointer: impl Into<Pointer>) -> Result<E> {
        Ok(self.load(pointer.into()).await?.entity)
    }

    /// Like [`get`](Self::get) but maps "not found" to `None`.
    pub async fn try_get(&self, pointer: impl Into<Pointer>) -> Result<Option<E>> {
        match self.load(pointer.into()).await {
            Ok(loaded) => Ok(Some(loaded.entity)),
            Err(StoreError::EntityNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Latest state of whichever entity holds `lease`.
    pub async fn get_by_lease(&self, lease: &Lease) -> Result<Option<E>> {
        match self.sources.lease(lease).await? {
            Some(pointer) => self.try_get(Pointer::latest(pointer.id)).await,
            None => Ok(None),
        }
    }

    /// Pointers at which `tag` is currently attached.
    pub async fn tagged(&self, tag: &Tag) -> Result<Vec<Pointer>> {
        self.sources.tagged(tag).await
    }

    /// Every committed delta of `id`, in version order.
    pub async fn history(&self, id: Id) -> Result<Vec<HistoryEntry<E::Delta>>> {
        let records = self.sources.messages(&MessageQuery::for_entity(id)).await?;
        records
            .iter()
            .map(|record| {
                Ok(HistoryEntry {
                    source_id: record.source_id,
                    timestamp: record.source_timestamp,
                    pointer: record.pointer(),
                    delta: self.envelopes.deserialize(&record.message.delta)?,
                })
            })
            .collect()
    }

    /// Materializes `pointer` from the nearest usable snapshot plus the message
    /// tail, then lets the snapshot strategy cache the result.
    pub async fn load(&self, pointer: Pointer) -> Result<Loaded<E>> {
        let span = info_span!(
            "entity.load",
            entity_type = E::TYPE_NAME,
            entity_id = %pointer.id,
            version = %pointer.version
        );
        async move {
            let (loaded, latest_slot) = self.materialize(pointer).await?;
            if loaded.replayed > 0 && !self.is_read_only() {
                self.cache_loaded(&loaded, latest_slot.as_ref(), pointer.is_latest())
                    .await;
            }
            Ok(loaded)
        }
        .instrument(span)
        .await
    }

    /// Pure read: never writes snapshots. Also returns the latest-slot entity
    /// when the latest state was requested.
    async fn materialize(&self, pointer: Pointer) -> Result<(Loaded<E>, Option<E>)> {
        let id = pointer.id;
        let latest = self
            .sources
            .latest_version(id)
            .await?
            .ok_or(StoreError::EntityNotFound(pointer))?;
        let target = if pointer.is_latest() {
            latest
        } else {
            pointer.version
        };
        if target > latest {
            return Err(StoreError::EntityNotFound(pointer));
        }

        let latest_slot = if pointer.is_latest() {
            self.latest_slot(id).await?
        } else {
            None
        };
        let loaded = self.rebuild(id, target, latest_slot.clone()).await?;
        Ok((loaded, latest_slot))
    }

    async fn latest_slot(&self, id: Id) -> Result<Option<E>> {
        match self.snapshots.get(Pointer::latest(id)).await? {
            Some(snapshot) => Ok(Some(self.decode_snapshot(&snapshot)?)),
            None => Ok(None),
        }
    }

    /// Rebuilds `id` at `target` from the best of `candidate` and the nearest
    /// versioned snapshot, replaying only the messages after that baseline.
    async fn rebuild(&self, id: Id, target: Version, candidate: Option<E>) -> Result<Loaded<E>> {
        let usable_slot = candidate.filter(|entity| entity.version() <= target);

        let versioned = match usable_slot.as_ref() {
            Some(slot) if slot.version() == target => None,
            _ => match self.snapshots.nearest(id, target).await? {
                Some(snapshot) => Some(self.decode_snapshot(&snapshot)?),
                None => None,
            },
        };

        let base = [usable_slot, versioned]
            .into_iter()
            .flatten()
            .max_by_key(|entity| entity.version());
        let snapshot_version = base.as_ref().map(|entity| entity.version());
        let mut entity = base.unwrap_or_else(|| E::construct(id));

        let mut replayed = 0;
        if entity.version() < target {
            let query = MessageQuery::for_entity(id)
                .after(entity.version())
                .up_to(target);
            for record in self.sources.messages(&query).await? {
                entity = self.replay(entity, &record)?;
                replayed += 1;
            }
        }
        if entity.version() != target {
            return Err(StoreError::VersionGap {
                id,
                expected: target,
                found: entity.version(),
            });
        }

        event!(
            Level::DEBUG,
            snapshot_version = ?snapshot_version.map(|v| v.value()),
            replayed,
            "entity materialized"
        );
        Ok(Loaded {
            entity,
            snapshot_version,
            replayed,
        })
    }

    fn replay(&self, entity: E, record: &MessageRecord) -> Result<E> {
        let expected = entity.version().next();
        let found = record.pointer().version;
        if found != expected {
            return Err(StoreError::VersionGap {
                id: entity.id(),
                expected,
                found,
            });
        }
        let delta: E::Delta = self.envelopes.deserialize(&record.message.delta)?;
        Ok(reduce(entity, &delta))
    }

    async fn cache_loaded(&self, loaded: &Loaded<E>, latest_slot: Option<&E>, latest_read: bool) {
        let entity = &loaded.entity;
        let mut slots = Vec::new();
        if self.strategy.should_record(entity) && loaded.snapshot_version != Some(entity.version())
        {
            slots.push(SnapshotSlot::Versioned);
        }
        if latest_read
            && self.strategy.should_record_as_latest(latest_slot, entity)
            && !self.latest_slot_is_newer(entity).await
        {
            slots.push(SnapshotSlot::Latest);
        }
        if slots.is_empty() {
            return;
        }

        let result = match self.snapshot_of(entity) {
            Ok(snapshot) => {
                let writes = slots
                    .into_iter()
                    .map(|slot| (slot, snapshot.clone()))
                    .collect();
                self.write_snapshots(writes).await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            log::warn!(
                "Failed to cache snapshot of {}@{}: {}",
                entity.id(),
                entity.version(),
                err
            );
        }
    }

    /// A commit may have advanced the latest slot while this read was replaying.
    async fn latest_slot_is_newer(&self, entity: &E) -> bool {
        match self.snapshots.get(Pointer::latest(entity.id())).await {
            Ok(Some(slot)) => slot.pointer.version >= entity.version(),
            Ok(None) => false,
            Err(err) => {
                log::warn!("Failed to re-read latest slot of {}: {}", entity.id(), err);
                true
            }
        }
    }
}
