#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use sourcedb::{
    DeltaEffects, Entity, Id, InMemoryBackend, Lease, SourceStore, StoreConfig, Tag, Version,
};

pub const NAME_SCOPE: &str = "numbers";
pub const NAME_LABEL: &str = "name";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberBox {
    pub id: Id,
    pub version: Version,
    pub value: i64,
    pub writes: u32,
    pub name: Option<String>,
}

sourcedb::resolvable!(NumberBox);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NumberDelta {
    StoreNumber(i64),
    Add(i64),
    Claim(String),
    Release(String),
}

sourcedb::resolvable!(NumberDelta);

pub fn name_lease(name: &str) -> Lease {
    Lease::new(NAME_SCOPE, NAME_LABEL, name)
}

impl DeltaEffects<NumberBox> for NumberDelta {
    fn add_leases(&self, _entity: &NumberBox) -> Vec<Lease> {
        match self {
            Self::Claim(name) => vec![name_lease(name)],
            _ => Vec::new(),
        }
    }

    fn delete_leases(&self, _entity: &NumberBox) -> Vec<Lease> {
        match self {
            Self::Release(name) => vec![name_lease(name)],
            _ => Vec::new(),
        }
    }

    fn add_tags(&self, entity: &NumberBox) -> Vec<Tag> {
        match self {
            Self::StoreNumber(_) => vec![Tag::new("stored", entity.value.to_string())],
            _ => Vec::new(),
        }
    }
}

impl Entity for NumberBox {
    type Delta = NumberDelta;

    fn construct(id: Id) -> Self {
        Self {
            id,
            version: Version::ZERO,
            value: 0,
            writes: 0,
            name: None,
        }
    }

    fn id(&self) -> Id {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    fn apply(mut self, delta: &NumberDelta) -> Self {
        match delta {
            NumberDelta::StoreNumber(value) => self.value = *value,
            NumberDelta::Add(amount) => self.value += amount,
            NumberDelta::Claim(name) => self.name = Some(name.clone()),
            NumberDelta::Release(name) => {
                if self.name.as_deref() == Some(name.as_str()) {
                    self.name = None;
                }
            }
        }
        self.writes += 1;
        self
    }
}

pub fn store_with(config: StoreConfig) -> (InMemoryBackend, SourceStore) {
    let backend = InMemoryBackend::new();
    let store = SourceStore::builder(backend.clone())
        .config(config)
        .register_entity::<NumberBox>()
        .build()
        .unwrap();
    (backend, store)
}

pub fn store() -> (InMemoryBackend, SourceStore) {
    store_with(StoreConfig::default())
}
