impl<E: Entity> EntityRepository<E> {
    /// Commits `source` atomically.
    ///
    /// Returns `false` when the backend rejects it for a version or lease
    /// conflict; nothing was persisted in that case. After a successful commit
    /// the snapshot strategy runs over every produced version of this entity
    /// type. Snapshot failures at that point are logged, not returned.
    pub async fn commit(&self, source: &Source) -> Result<bool> {
        self.ensure_writable("commit")?;
        let span = info_span!(
            "entity.commit",
            entity_type = E::TYPE_NAME,
            source_id = %source.id,
            messages = source.len()
        );
        async move {
            match self.sources.commit(source).await? {
                CommitOutcome::Conflict(conflict) => {
                    event!(Level::INFO, conflict = %conflict, "source rejected");
                    Ok(false)
                }
                CommitOutcome::Committed => {
                    match self.record_snapshots(source).await {
                        Ok(written) => {
                            event!(Level::DEBUG, written, "source committed");
                        }
                        Err(err) => {
                            log::warn!(
                                "Source {} committed but snapshot processing failed: {}",
                                source.id,
                                err
                            );
                        }
                    }
                    Ok(true)
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn delete_snapshots(&self, keys: &[Pointer]) -> Result<usize> {
        self.ensure_writable("snapshot delete")?;
        let mut deleted = 0;
        for key in keys {
            if self.snapshots.delete(*key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn record_snapshots(&self, source: &Source) -> Result<usize> {
        let mut per_entity: Vec<(Id, Vec<(Pointer, E::Delta)>)> = Vec::new();
        for message in &source.messages {
            if !self.envelopes.resolves_to::<E::Delta>(&message.delta) {
                continue;
            }
            let delta: E::Delta = self.envelopes.deserialize(&message.delta)?;
            let id = message.entity_id();
            match per_entity.iter_mut().find(|(known, _)| *known == id) {
                Some((_, steps)) => steps.push((message.state_pointer, delta)),
                None => per_entity.push((id, vec![(message.state_pointer, delta)])),
            }
        }

        let mut writes = Vec::new();
        for (id, steps) in per_entity {
            writes.extend(self.plan_snapshots(id, steps).await?);
        }
        self.write_snapshots(writes).await
    }

    /// Replays one entity's new versions from the state just before them and
    /// asks the strategy about each.
    async fn plan_snapshots(
        &self,
        id: Id,
        steps: Vec<(Pointer, E::Delta)>,
    ) -> Result<Vec<(SnapshotSlot, Snapshot)>> {
        let Some((first, _)) = steps.first() else {
            return Ok(Vec::new());
        };
        // The latest slot usually sits right before this source's first version.
        let mut previous_latest = self.latest_slot(id).await?;
        let mut entity = match first.version.previous() {
            Some(previous) if !previous.is_zero() => {
                self.rebuild(id, previous, previous_latest.clone()).await?.entity
            }
            _ => E::construct(id),
        };

        let mut writes = Vec::new();
        let mut latest_changed = false;
        for (pointer, delta) in steps {
            entity = reduce(entity, &delta);
            if entity.version() != pointer.version {
                return Err(StoreError::VersionGap {
                    id,
                    expected: entity.version(),
                    found: pointer.version,
                });
            }
            if self.strategy.should_record(&entity) {
                writes.push((SnapshotSlot::Versioned, self.snapshot_of(&entity)?));
            }
            if self
                .strategy
                .should_record_as_latest(previous_latest.as_ref(), &entity)
            {
                previous_latest = Some(entity.clone());
                latest_changed = true;
            }
        }
        if latest_changed {
            if let Some(latest) = previous_latest.as_ref() {
                writes.push((SnapshotSlot::Latest, self.snapshot_of(latest)?));
            }
        }

        event!(
            Level::DEBUG,
            entity_id = %id,
            version = entity.version().value(),
            snapshots = writes.len(),
            "snapshot plan"
        );
        Ok(writes)
    }
}
