use super::EnvelopeValue;
use crate::core::Result;
use serde::{Serialize, de::DeserializeOwned};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// A payload type that can travel inside an [`super::Envelope`].
///
/// `ASSEMBLY` names the package that owns the type and `TYPE_NAME` its
/// fully-qualified path. Together they form the [`TypeKey`] written into the
/// envelope headers. The short member name is the last path segment.
///
/// Use the [`crate::resolvable!`] macro instead of implementing this by hand.
pub trait Resolvable: Serialize + DeserializeOwned + Send + Sync + 'static {
    const ASSEMBLY: &'static str;
    const TYPE_NAME: &'static str;

    fn type_key() -> TypeKey {
        TypeKey::new(Self::ASSEMBLY, Self::TYPE_NAME)
    }

    fn member_name() -> &'static str {
        member_name_of(Self::TYPE_NAME)
    }
}

/// Implements [`Resolvable`] for a type.
///
/// ```ignore
/// resolvable!(Deposit);                               // this crate, module path + ident
/// resolvable!(Deposit => "bank");                     // explicit assembly
/// resolvable!(Deposit => "bank", "bank::v2::Deposit"); // explicit assembly and type name
/// ```
#[macro_export]
macro_rules! resolvable {
    ($ty:ty => $assembly:expr, $type_name:expr) => {
        impl $crate::envelope::Resolvable for $ty {
            const ASSEMBLY: &'static str = $assembly;
            const TYPE_NAME: &'static str = $type_name;
        }
    };
    ($ty:ident => $assembly:expr) => {
        $crate::resolvable!($ty => $assembly, concat!(module_path!(), "::", stringify!($ty)));
    };
    ($ty:ident) => {
        $crate::resolvable!($ty => env!("CARGO_PKG_NAME"));
    };
}

pub fn member_name_of(type_name: &str) -> &str {
    type_name.rsplit("::").next().unwrap_or(type_name)
}

/// Identity of a runtime type: owning assembly plus fully-qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey {
    pub assembly: String,
    pub type_name: String,
}

impl TypeKey {
    pub fn new(assembly: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            assembly: assembly.into(),
            type_name: type_name.into(),
        }
    }

    pub fn of<T: Resolvable>() -> Self {
        T::type_key()
    }

    pub fn member_name(&self) -> &str {
        member_name_of(&self.type_name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.assembly, self.type_name)
    }
}

type BoxedDecoder = fn(&EnvelopeValue) -> Result<Box<dyn Any + Send + Sync>>;

/// A type known to the registry, with the decoder used for polymorphic reads.
#[derive(Clone)]
pub struct RegisteredType {
    key: TypeKey,
    member_name: String,
    decode: BoxedDecoder,
}

impl RegisteredType {
    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    pub fn member_name(&self) -> &str {
        &self.member_name
    }

    pub fn decode(&self, value: &EnvelopeValue) -> Result<Box<dyn Any + Send + Sync>> {
        (self.decode)(value)
    }
}

impl fmt::Debug for RegisteredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredType")
            .field("key", &self.key)
            .field("member_name", &self.member_name)
            .finish()
    }
}

fn decode_boxed<T: Resolvable>(value: &EnvelopeValue) -> Result<Box<dyn Any + Send + Sync>> {
    let decoded: T = value.decode()?;
    Ok(Box::new(decoded))
}

/// Explicit startup-time registry of payload types.
///
/// Built once, then shared behind an `Arc`; it is never mutated after the
/// store is constructed.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    by_key: HashMap<TypeKey, RegisteredType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Resolvable>(&mut self) -> &mut Self {
        let key = T::type_key();
        self.by_key.insert(
            key.clone(),
            RegisteredType {
                member_name: T::member_name().to_string(),
                key,
                decode: decode_boxed::<T>,
            },
        );
        self
    }

    pub fn with<T: Resolvable>(mut self) -> Self {
        self.register::<T>();
        self
    }

    pub fn contains(&self, key: &TypeKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &TypeKey) -> Option<&RegisteredType> {
        self.by_key.get(key)
    }

    pub fn find(&self, assembly: &str, type_name: &str) -> Option<&RegisteredType> {
        self.by_key.get(&TypeKey::new(assembly, type_name))
    }

    pub fn by_member_name<'a>(
        &'a self,
        member_name: &'a str,
    ) -> impl Iterator<Item = &'a RegisteredType> + 'a {
        self.by_key
            .values()
            .filter(move |registered| registered.member_name == member_name)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
