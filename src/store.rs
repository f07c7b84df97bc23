use crate::config::StoreConfig;
use crate::core::Result;
use crate::entity::{Entity, EntityRepository, SnapshotStrategy};
use crate::envelope::{EnvelopeService, Resolvable, TypeRegistry, TypeResolver, TypeResolverChain};
use crate::session::{SessionFactory, SessionOptions};
use crate::source::{AgentAccessor, ProcessAgentAccessor, ProcessSignature};
use crate::stream::StreamRepository;
use std::sync::Arc;

/// Everything fixed at startup: backend, registered types, resolvers, agent, policies.
///
/// Cheap to clone. Repositories opened from it own their sessions.
#[derive(Clone)]
pub struct SourceStore {
    factory: Arc<dyn SessionFactory>,
    config: StoreConfig,
    envelopes: EnvelopeService,
    agent: Arc<dyn AgentAccessor>,
}

impl SourceStore {
    pub fn builder(factory: impl SessionFactory + 'static) -> SourceStoreBuilder {
        SourceStoreBuilder::new(Arc::new(factory))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn envelopes(&self) -> &EnvelopeService {
        &self.envelopes
    }

    pub fn agent(&self) -> Arc<dyn AgentAccessor> {
        self.agent.clone()
    }

    /// Repository using the configured session options and snapshot policy.
    pub async fn entity_repository<E: Entity>(&self) -> Result<EntityRepository<E>> {
        self.entity_repository_with(self.config.session.clone(), self.config.snapshot)
            .await
    }

    pub async fn entity_repository_with<E, S>(
        &self,
        options: SessionOptions,
        strategy: S,
    ) -> Result<EntityRepository<E>>
    where
        E: Entity,
        S: SnapshotStrategy<E> + 'static,
    {
        let sources = self.factory.source_session(&options).await?;
        let snapshots = self.factory.snapshot_session(&options).await?;
        Ok(EntityRepository::new(
            self.envelopes.clone(),
            self.agent.clone(),
            Arc::new(strategy),
            sources,
            snapshots,
            options,
        ))
    }

    pub async fn stream_repository(&self) -> Result<StreamRepository> {
        self.stream_repository_with(self.config.session.clone()).await
    }

    pub async fn stream_repository_with(
        &self,
        options: SessionOptions,
    ) -> Result<StreamRepository> {
        let session = self.factory.source_session(&options).await?;
        Ok(StreamRepository::new(
            self.envelopes.clone(),
            self.agent.clone(),
            session,
            self.config.stream,
        ))
    }
}

pub struct SourceStoreBuilder {
    factory: Arc<dyn SessionFactory>,
    config: StoreConfig,
    registry: TypeRegistry,
    resolvers: Vec<Arc<dyn TypeResolver>>,
    agent: Option<Arc<dyn AgentAccessor>>,
}

impl SourceStoreBuilder {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            config: StoreConfig::default(),
            registry: TypeRegistry::new(),
            resolvers: Vec::new(),
            agent: None,
        }
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register<T: Resolvable>(mut self) -> Self {
        self.registry.register::<T>();
        self
    }

    /// Registers an entity together with its delta type.
    pub fn register_entity<E: Entity>(mut self) -> Self {
        self.registry.register::<E>().register::<E::Delta>();
        self
    }

    /// Adds a resolver consulted before the built-ins and before any resolver
    /// added earlier.
    pub fn resolver<R: TypeResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolvers.push(Arc::new(resolver));
        self
    }

    pub fn agent<A: AgentAccessor + 'static>(mut self, agent: A) -> Self {
        self.agent = Some(Arc::new(agent));
        self
    }

    pub fn build(mut self) -> Result<SourceStore> {
        self.config.validate()?;
        self.registry.register::<ProcessSignature>();

        let registry = Arc::new(self.registry);
        let mut chain = TypeResolverChain::with_defaults(registry.clone());
        for resolver in self.resolvers {
            chain.push_shared(resolver);
        }
        let envelopes =
            EnvelopeService::new(self.config.envelope.codec, registry, Arc::new(chain));
        let agent = self
            .agent
            .unwrap_or_else(|| Arc::new(ProcessAgentAccessor::default()));

        Ok(SourceStore {
            factory: self.factory,
            config: self.config,
            envelopes,
            agent,
        })
    }
}
