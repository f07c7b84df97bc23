#[derive(Default)]
struct MemoryState {
    sources: HashMap<Id, Source>,
    /// Commit order.
    records: Vec<MessageRecord>,
    by_pointer: BTreeMap<Pointer, usize>,
    leases: HashMap<Lease, Pointer>,
    tags: HashMap<Tag, BTreeSet<Pointer>>,
    /// Latest slots live under zero-version keys.
    snapshots: BTreeMap<Pointer, Snapshot>,
}

impl MemoryState {
    /// Checks every uniqueness constraint against the committed state plus the
    /// earlier messages of the same source. Nothing is written here.
    fn find_conflict(&self, source: &Source) -> Result<Option<ConflictKind>> {
        if self.sources.contains_key(&source.id) {
            return Err(StoreError::Storage(format!(
                "source {} was already committed",
                source.id
            )));
        }

        let mut pending_versions = HashSet::new();
        let mut released: HashSet<&Lease> = HashSet::new();
        let mut claimed: HashSet<&Lease> = HashSet::new();

        for message in &source.messages {
            let pointer = message.state_pointer;
            if pointer.is_latest() {
                return Err(StoreError::Storage(format!(
                    "message {} targets version zero of {}",
                    message.id, pointer.id
                )));
            }
            if self.by_pointer.contains_key(&pointer) || !pending_versions.insert(pointer) {
                return Ok(Some(ConflictKind::VersionTaken(pointer)));
            }

            for lease in &message.delete_leases {
                if !claimed.remove(lease) {
                    released.insert(lease);
                }
            }
            for lease in &message.add_leases {
                let held = claimed.contains(lease)
                    || (self.leases.contains_key(lease) && !released.contains(lease));
                if held {
                    return Ok(Some(ConflictKind::LeaseTaken(lease.clone())));
                }
                claimed.insert(lease);
            }
        }
        Ok(None)
    }

    fn apply(&mut self, source: &Source) {
        for message in &source.messages {
            let pointer = message.state_pointer;

            for lease in &message.delete_leases {
                self.leases.remove(lease);
            }
            for lease in &message.add_leases {
                self.leases.insert(lease.clone(), pointer);
            }
            for tag in &message.delete_tags {
                if let Some(pointers) = self.tags.get_mut(tag) {
                    pointers.retain(|tagged| tagged.id != pointer.id);
                    if pointers.is_empty() {
                        self.tags.remove(tag);
                    }
                }
            }
            for tag in &message.add_tags {
                self.tags.entry(tag.clone()).or_default().insert(pointer);
            }

            self.by_pointer.insert(pointer, self.records.len());
            self.records.push(MessageRecord {
                source_id: source.id,
                source_timestamp: source.timestamp,
                message: message.clone(),
            });
        }
        self.sources.insert(source.id, source.clone());
    }

    fn query(&self, query: &MessageQuery) -> Vec<MessageRecord> {
        if query.entity_ids.is_empty() {
            return self
                .records
                .iter()
                .filter(|record| query.matches(record))
                .cloned()
                .collect();
        }

        let lower = query.after.map_or(Version::new(1), |after| after.next());
        let upper = query.up_to.unwrap_or(Version::new(u64::MAX));
        if lower > upper {
            return Vec::new();
        }

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for id in &query.entity_ids {
            if !seen.insert(*id) {
                continue;
            }
            let range = Pointer::new(*id, lower)..=Pointer::new(*id, upper);
            found.extend(
                self.by_pointer
                    .range(range)
                    .map(|(_, index)| &self.records[*index])
                    .filter(|record| query.matches(record))
                    .cloned(),
            );
        }
        found
    }

    fn latest_version(&self, id: Id) -> Option<Version> {
        self.by_pointer
            .range(Pointer::new(id, Version::new(1))..=Pointer::new(id, Version::new(u64::MAX)))
            .next_back()
            .map(|(pointer, _)| pointer.version)
    }

    fn nearest_snapshot(&self, id: Id, version: Version) -> Option<Snapshot> {
        if version.is_zero() {
            return None;
        }
        self.snapshots
            .range(Pointer::new(id, Version::new(1))..=Pointer::new(id, version))
            .next_back()
            .map(|(_, snapshot)| snapshot.clone())
    }
}
