use super::EnvelopeHeaders;
use super::registry::{TypeKey, TypeRegistry};
use crate::core::{Result, StoreError};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// One strategy for turning envelope headers into a [`TypeKey`].
///
/// `Ok(None)` declines and lets the next resolver try. An `Err` or a panic is
/// treated as a faulty resolver: it is logged and skipped.
pub trait TypeResolver: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn resolve(&self, headers: &EnvelopeHeaders) -> anyhow::Result<Option<TypeKey>>;
}

impl<F> TypeResolver for F
where
    F: Fn(&EnvelopeHeaders) -> anyhow::Result<Option<TypeKey>> + Send + Sync,
{
    fn resolve(&self, headers: &EnvelopeHeaders) -> anyhow::Result<Option<TypeKey>> {
        self(headers)
    }
}

/// Ordered resolver list. The most recently pushed resolver is asked first.
#[derive(Clone, Default)]
pub struct TypeResolverChain {
    resolvers: Vec<Arc<dyn TypeResolver>>,
}

impl TypeResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in chain: exact registry lookup first, then unambiguous member name.
    pub fn with_defaults(registry: Arc<TypeRegistry>) -> Self {
        let mut chain = Self::new();
        chain
            .push(MemberNameTypeResolver::new(registry.clone()))
            .push(RegistryTypeResolver::new(registry));
        chain
    }

    pub fn push<R: TypeResolver + 'static>(&mut self, resolver: R) -> &mut Self {
        self.resolvers.push(Arc::new(resolver));
        self
    }

    pub fn push_shared(&mut self, resolver: Arc<dyn TypeResolver>) -> &mut Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    pub fn resolve(&self, headers: &EnvelopeHeaders) -> Result<TypeKey> {
        for resolver in self.resolvers.iter().rev() {
            match panic::catch_unwind(AssertUnwindSafe(|| resolver.resolve(headers))) {
                Ok(Ok(Some(key))) => return Ok(key),
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    log::warn!(
                        "Type resolver '{}' failed for {}, trying next: {:#}",
                        resolver.name(),
                        headers,
                        err
                    );
                }
                Err(_) => {
                    log::warn!(
                        "Type resolver '{}' panicked for {}, trying next",
                        resolver.name(),
                        headers
                    );
                }
            }
        }
        Err(StoreError::CannotResolveType(headers.to_string()))
    }
}

/// Exact `(assembly, type)` lookup against the registry.
pub struct RegistryTypeResolver {
    registry: Arc<TypeRegistry>,
}

impl RegistryTypeResolver {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }
}

impl TypeResolver for RegistryTypeResolver {
    fn name(&self) -> &str {
        "registry"
    }

    fn resolve(&self, headers: &EnvelopeHeaders) -> anyhow::Result<Option<TypeKey>> {
        if !headers.is_native_platform() {
            return Ok(None);
        }
        let (Some(assembly), Some(type_name)) = (headers.assembly(), headers.type_name()) else {
            return Ok(None);
        };
        Ok(self
            .registry
            .find(assembly, type_name)
            .map(|registered| registered.key().clone()))
    }
}

/// Falls back to the short member name when it names exactly one registered type.
///
/// Covers payload types that moved between modules.
pub struct MemberNameTypeResolver {
    registry: Arc<TypeRegistry>,
}

impl MemberNameTypeResolver {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }
}

impl TypeResolver for MemberNameTypeResolver {
    fn name(&self) -> &str {
        "member-name"
    }

    fn resolve(&self, headers: &EnvelopeHeaders) -> anyhow::Result<Option<TypeKey>> {
        if !headers.is_native_platform() {
            return Ok(None);
        }
        let Some(member) = headers.member_name() else {
            return Ok(None);
        };
        let mut candidates = self.registry.by_member_name(member);
        match (candidates.next(), candidates.next()) {
            (Some(only), None) => Ok(Some(only.key().clone())),
            _ => Ok(None),
        }
    }
}

/// Maps renamed `(assembly, type)` pairs onto their current key.
#[derive(Default)]
pub struct AliasTypeResolver {
    aliases: HashMap<TypeKey, TypeKey>,
}

impl AliasTypeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alias(mut self, old: TypeKey, current: TypeKey) -> Self {
        self.aliases.insert(old, current);
        self
    }
}

impl TypeResolver for AliasTypeResolver {
    fn name(&self) -> &str {
        "alias"
    }

    fn resolve(&self, headers: &EnvelopeHeaders) -> anyhow::Result<Option<TypeKey>> {
        if !headers.is_native_platform() {
            return Ok(None);
        }
        let (Some(assembly), Some(type_name)) = (headers.assembly(), headers.type_name()) else {
            return Ok(None);
        };
        Ok(self.aliases.get(&TypeKey::new(assembly, type_name)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::headers;

    fn headers_for(assembly: &str, type_name: &str) -> EnvelopeHeaders {
        let mut map = EnvelopeHeaders::new();
        map.insert(headers::PLATFORM, crate::envelope::PLATFORM);
        map.insert(headers::ASSEMBLY, assembly);
        map.insert(headers::TYPE, type_name);
        map.insert(
            headers::MEMBER,
            crate::envelope::registry::member_name_of(type_name),
        );
        map
    }

    #[test]
    fn empty_chain_cannot_resolve() {
        let chain = TypeResolverChain::new();
        let err = chain.resolve(&headers_for("a", "a::B")).unwrap_err();
        assert!(matches!(err, StoreError::CannotResolveType(_)));
    }

    #[test]
    fn last_pushed_resolver_wins() {
        let mut chain = TypeResolverChain::new();
        chain
            .push(|_: &EnvelopeHeaders| -> anyhow::Result<Option<TypeKey>> {
                Ok(Some(TypeKey::new("first", "First")))
            })
            .push(|_: &EnvelopeHeaders| -> anyhow::Result<Option<TypeKey>> {
                Ok(Some(TypeKey::new("second", "Second")))
            });
        let key = chain.resolve(&headers_for("x", "x::Y")).unwrap();
        assert_eq!(key, TypeKey::new("second", "Second"));
    }

    #[test]
    fn faulty_resolvers_are_skipped() {
        let mut chain = TypeResolverChain::new();
        chain
            .push(|_: &EnvelopeHeaders| -> anyhow::Result<Option<TypeKey>> {
                Ok(Some(TypeKey::new("good", "Good")))
            })
            .push(|_: &EnvelopeHeaders| -> anyhow::Result<Option<TypeKey>> {
                anyhow::bail!("broken resolver")
            })
            .push(|_: &EnvelopeHeaders| -> anyhow::Result<Option<TypeKey>> {
                panic!("resolver blew up")
            });
        let key = chain.resolve(&headers_for("x", "x::Y")).unwrap();
        assert_eq!(key, TypeKey::new("good", "Good"));
    }

    #[test]
    fn alias_maps_old_names() {
        let mut chain = TypeResolverChain::new();
        chain.push(
            AliasTypeResolver::new()
                .alias(TypeKey::new("old", "old::Thing"), TypeKey::new("new", "new::Thing")),
        );
        let key = chain.resolve(&headers_for("old", "old::Thing")).unwrap();
        assert_eq!(key, TypeKey::new("new", "new::Thing"));
        assert!(chain.resolve(&headers_for("old", "old::Other")).is_err());
    }

    #[test]
    fn foreign_platform_is_declined_by_builtins() {
        let registry = Arc::new(TypeRegistry::new());
        let chain = TypeResolverChain::with_defaults(registry);
        let mut foreign = headers_for("a", "a::B");
        foreign.insert(headers::PLATFORM, "dotnet");
        assert!(chain.resolve(&foreign).is_err());
    }
}
