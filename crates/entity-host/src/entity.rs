use crate::error::EntityError;
use crate::types::{ClientDescriptor, ConcurrencyKey, EntityType, MessageId};
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Converts between wire payloads and an entity's decoded message/response types.
pub trait MessageCodec<M, R>: Send + Sync {
    fn serialize(&self, response: &R) -> Result<Vec<u8>, EntityError>;
    fn deserialize(&self, payload: &[u8]) -> Result<M, EntityError>;
}

/// Assigns each decoded message the concurrency key it retires under.
pub trait ConcurrencyStrategy<M>: Send + Sync {
    fn concurrency_key(&self, message: &M) -> ConcurrencyKey;
}

/// Strategy that places every message on [`ConcurrencyKey::UNIVERSAL`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UniversalConcurrency;

impl<M> ConcurrencyStrategy<M> for UniversalConcurrency {
    fn concurrency_key(&self, _message: &M) -> ConcurrencyKey {
        ConcurrencyKey::UNIVERSAL
    }
}

/// Lets a running invocation schedule further invocations against its own entity.
pub trait EntityMessenger: Send + Sync {
    /// Schedule `payload` as a new invocation of this entity.
    fn message_self(
        &self,
        source: &ClientDescriptor,
        payload: Vec<u8>,
    ) -> Result<MessageId, EntityError>;

    /// Schedule `payload` as a new invocation and hold the retirement of `original`
    /// until that invocation completes.
    ///
    /// `original` must still be running, so this is only valid from inside its `invoke`.
    fn message_self_and_defer_retirement(
        &self,
        original: MessageId,
        source: &ClientDescriptor,
        payload: Vec<u8>,
    ) -> Result<MessageId, EntityError>;
}

/// Per-invocation context handed to [`ActiveServerEntity::invoke`].
#[derive(Clone)]
pub struct InvokeContext {
    client: ClientDescriptor,
    message_id: MessageId,
    messenger: Arc<dyn EntityMessenger>,
}

impl InvokeContext {
    pub fn new(
        client: ClientDescriptor,
        message_id: MessageId,
        messenger: Arc<dyn EntityMessenger>,
    ) -> Self {
        Self {
            client,
            message_id,
            messenger,
        }
    }

    /// The client this invocation was issued by.
    pub fn client(&self) -> &ClientDescriptor {
        &self.client
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn message_self(&self, payload: Vec<u8>) -> Result<MessageId, EntityError> {
        self.messenger.message_self(&self.client, payload)
    }

    /// Schedule a follow-up invocation; this invocation's reply is withheld until the
    /// follow-up has completed.
    pub fn message_self_and_defer_retirement(
        &self,
        payload: Vec<u8>,
    ) -> Result<MessageId, EntityError> {
        self.messenger
            .message_self_and_defer_retirement(self.message_id, &self.client, payload)
    }
}

/// Replica-side instance of an entity. Holds replicated state but serves no clients.
#[async_trait]
pub trait PassiveServerEntity: Send + Sync {
    /// First-time construction hook.
    async fn create_new(&self) -> Result<(), EntityError> {
        Ok(())
    }

    async fn destroy(&self) -> Result<(), EntityError> {
        Ok(())
    }
}

/// Primary instance of an entity, serving connected clients.
///
/// One instance exists per managed entity at a time. Invocations may execute
/// concurrently when the concurrency strategy assigns them different keys, so
/// implementations must be safe for shared access.
#[async_trait]
pub trait ActiveServerEntity<M, R>: Send + Sync
where
    M: Send + 'static,
    R: Send + 'static,
{
    /// First-time construction hook.
    async fn create_new(&self) -> Result<(), EntityError> {
        Ok(())
    }

    /// Promotion hook: rebuild in-memory state from what was replicated to this server.
    async fn load_existing(&self) -> Result<(), EntityError> {
        Ok(())
    }

    async fn connected(&self, _client: &ClientDescriptor) {}

    async fn disconnected(&self, _client: &ClientDescriptor) {}

    async fn invoke(&self, context: &InvokeContext, message: M) -> Result<R, EntityError>;

    async fn destroy(&self) -> Result<(), EntityError> {
        Ok(())
    }

    /// Configuration bytes the instance was created from, returned to fetching clients.
    fn config(&self) -> Vec<u8>;

    fn message_codec(&self) -> &dyn MessageCodec<M, R>;

    fn concurrency_strategy(&self) -> &dyn ConcurrencyStrategy<M>;
}

/// Factory for the instances of one entity type.
///
/// Construction must be deterministic given identical config bytes: the passive and
/// active servers build their instances independently from the same config.
pub trait ServerEntityService: Send + Sync + 'static {
    type Message: Send + 'static;
    type Response: Send + 'static;

    fn entity_type(&self) -> EntityType;

    /// Entity version this service implements. Requests must name the same version.
    fn version(&self) -> u64;

    fn create_active_entity(
        &self,
        registry: &ServiceRegistry,
        config: &[u8],
    ) -> Result<Arc<dyn ActiveServerEntity<Self::Message, Self::Response>>, EntityError>;

    fn create_passive_entity(
        &self,
        registry: &ServiceRegistry,
        config: &[u8],
    ) -> Result<Arc<dyn PassiveServerEntity>, EntityError>;
}

/// Shared platform services available to entity factories, looked up by type.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`ServiceRegistry::register`].
    pub fn with<T: Any + Send + Sync>(mut self, service: Arc<T>) -> Self {
        self.register(service);
        self
    }

    /// Register a service, returning true if it replaced one of the same type.
    pub fn register<T: Any + Send + Sync>(&mut self, service: Arc<T>) -> bool {
        self.services.insert(TypeId::of::<T>(), service).is_some()
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }
}
