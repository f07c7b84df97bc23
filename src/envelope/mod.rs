//! Type-tagged payload containers.
//!
//! Every delta, entity snapshot and agent signature is stored as an
//! [`Envelope`]: a small header map naming the runtime type plus a value
//! encoded with one of the [`EnvelopeCodec`]s. Reading an envelope runs its
//! headers through a [`TypeResolverChain`] and decodes only once a type has
//! been identified.

pub mod registry;
pub mod resolve;

pub use registry::{RegisteredType, Resolvable, TypeKey, TypeRegistry, member_name_of};
pub use resolve::{
    AliasTypeResolver, MemberNameTypeResolver, RegistryTypeResolver, TypeResolver,
    TypeResolverChain,
};

use crate::core::{Result, StoreError};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Platform written by this crate. Built-in resolvers decline anything else.
pub const PLATFORM: &str = "rust";

/// Header names.
pub mod headers {
    pub const PLATFORM: &str = "platform";
    pub const ASSEMBLY: &str = "assembly";
    pub const TYPE: &str = "type";
    pub const MEMBER: &str = "member";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeHeaders(BTreeMap<String, String>);

impl EnvelopeHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_type<T: Resolvable>() -> Self {
        let mut map = Self::new();
        map.insert(headers::PLATFORM, PLATFORM);
        map.insert(headers::ASSEMBLY, T::ASSEMBLY);
        map.insert(headers::TYPE, T::TYPE_NAME);
        map.insert(headers::MEMBER, T::member_name());
        map
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn platform(&self) -> Option<&str> {
        self.get(headers::PLATFORM)
    }

    pub fn assembly(&self) -> Option<&str> {
        self.get(headers::ASSEMBLY)
    }

    pub fn type_name(&self) -> Option<&str> {
        self.get(headers::TYPE)
    }

    pub fn member_name(&self) -> Option<&str> {
        self.get(headers::MEMBER)
    }

    pub fn is_native_platform(&self) -> bool {
        self.platform() == Some(PLATFORM)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for EnvelopeHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str("}")
    }
}

/// Value encoding. JSON suits document backends, MessagePack suits key-value ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeCodec {
    #[default]
    Json,
    MessagePack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "codec", content = "data", rename_all = "snake_case")]
pub enum EnvelopeValue {
    Json(serde_json::Value),
    MessagePack(Vec<u8>),
}

impl EnvelopeValue {
    pub fn encode<T: Serialize>(codec: EnvelopeCodec, value: &T) -> Result<Self> {
        Ok(match codec {
            EnvelopeCodec::Json => Self::Json(
                serde_json::to_value(value)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            ),
            EnvelopeCodec::MessagePack => Self::MessagePack(rmp_serde::to_vec_named(value)?),
        })
    }

    /// A null value only decodes into unit-like types; anything else is a
    /// `Deserialization` error.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Self::Json(value) => {
                T::deserialize(value).map_err(|e| StoreError::Deserialization(e.to_string()))
            }
            Self::MessagePack(bytes) => Ok(rmp_serde::from_slice(bytes)?),
        }
    }

    pub fn codec(&self) -> EnvelopeCodec {
        match self {
            Self::Json(_) => EnvelopeCodec::Json,
            Self::MessagePack(_) => EnvelopeCodec::MessagePack,
        }
    }
}

/// Headers plus encoded value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub headers: EnvelopeHeaders,
    pub value: EnvelopeValue,
}

/// A payload decoded without knowing its type up front.
pub struct ResolvedValue {
    key: TypeKey,
    value: Box<dyn Any + Send + Sync>,
}

impl ResolvedValue {
    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    pub fn is<T: Resolvable>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast_ref<T: Resolvable>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    pub fn downcast<T: Resolvable>(self) -> std::result::Result<T, Self> {
        match self.value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Self {
                key: self.key,
                value,
            }),
        }
    }
}

impl fmt::Debug for ResolvedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedValue")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Wraps and unwraps payloads. Cheap to clone; shared by every repository of a store.
#[derive(Clone)]
pub struct EnvelopeService {
    codec: EnvelopeCodec,
    registry: Arc<TypeRegistry>,
    resolvers: Arc<TypeResolverChain>,
}

impl EnvelopeService {
    pub fn new(
        codec: EnvelopeCodec,
        registry: Arc<TypeRegistry>,
        resolvers: Arc<TypeResolverChain>,
    ) -> Self {
        Self {
            codec,
            registry,
            resolvers,
        }
    }

    /// JSON codec and the built-in resolver chain.
    pub fn with_registry(registry: TypeRegistry) -> Self {
        let registry = Arc::new(registry);
        let resolvers = Arc::new(TypeResolverChain::with_defaults(registry.clone()));
        Self::new(EnvelopeCodec::Json, registry, resolvers)
    }

    pub fn codec(&self) -> EnvelopeCodec {
        self.codec
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn resolvers(&self) -> &TypeResolverChain {
        &self.resolvers
    }

    pub fn serialize<T: Resolvable>(&self, value: &T) -> Result<Envelope> {
        Ok(Envelope {
            headers: EnvelopeHeaders::for_type::<T>(),
            value: EnvelopeValue::encode(self.codec, value)?,
        })
    }

    pub fn resolve(&self, envelope: &Envelope) -> Result<TypeKey> {
        self.resolvers.resolve(&envelope.headers)
    }

    /// Decodes as `T`. Fails if the headers resolve to some other type.
    pub fn deserialize<T: Resolvable>(&self, envelope: &Envelope) -> Result<T> {
        let key = self.resolve(envelope)?;
        let expected = T::type_key();
        if key != expected {
            return Err(StoreError::Deserialization(format!(
                "envelope holds {key}, not {expected}"
            )));
        }
        envelope.value.decode()
    }

    pub fn resolves_to<T: Resolvable>(&self, envelope: &Envelope) -> bool {
        matches!(self.resolve(envelope), Ok(key) if key == T::type_key())
    }

    /// Decodes into whatever registered type the headers resolve to.
    pub fn deserialize_any(&self, envelope: &Envelope) -> Result<ResolvedValue> {
        let key = self.resolve(envelope)?;
        let registered = self.registry.get(&key).ok_or_else(|| {
            StoreError::CannotResolveType(format!("{key} resolved but is not registered"))
        })?;
        let value = registered.decode(&envelope.value)?;
        Ok(ResolvedValue { key, value })
    }
}

impl fmt::Debug for EnvelopeService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeService")
            .field("codec", &self.codec)
            .field("registered_types", &self.registry.len())
            .field("resolvers", &self.resolvers.len())
            .finish()
    }
}
