//! In-memory doubles for unit and integration testing.
//!
//! [`ManualRequestProcessor`] queues jobs instead of running them so a test decides the
//! exact execution order. [`RecordingService`] is an entity service whose instances log
//! every callback into a shared [`EventLog`] and understand [`TestMessage`].

use crate::client_state::ClientEntityStateTracker;
use crate::entity::{
    ActiveServerEntity, ConcurrencyStrategy, InvokeContext, MessageCodec, PassiveServerEntity,
    ServerEntityService, ServiceRegistry,
};
use crate::error::EntityError;
use crate::managed_entity::{EntityRole, HostContext, ManagedEntity};
use crate::metrics::HostMetrics;
use crate::request::{ReplyReceiver, ServerEntityAction, ServerEntityRequest};
use crate::request_processor::{RequestJob, RequestProcessor};
use crate::types::{
    ClientDescriptor, ClientInstanceId, ClientNodeId, ConcurrencyKey, EntityDescriptor, EntityId,
    EntityType, MessageId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// A job held by [`ManualRequestProcessor`].
pub struct QueuedJob {
    pub entity_id: EntityId,
    pub key: ConcurrencyKey,
    pub request: Arc<ServerEntityRequest>,
    job: RequestJob,
}

/// [`RequestProcessor`] that runs nothing until the test asks it to.
#[derive(Default)]
pub struct ManualRequestProcessor {
    queue: Mutex<VecDeque<QueuedJob>>,
}

impl ManualRequestProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Keys of the queued jobs, oldest first.
    pub fn keys(&self) -> Vec<ConcurrencyKey> {
        self.queue.lock().iter().map(|queued| queued.key).collect()
    }

    /// Run the job at `index` (0 is the oldest). Panics if there is no such job.
    pub async fn run(&self, index: usize) {
        let queued = self.queue.lock().remove(index);
        let Some(queued) = queued else {
            panic!("no queued job at index {index}");
        };
        queued.job.await;
    }

    /// Run the oldest job, returning false if the queue was empty.
    pub async fn run_next(&self) -> bool {
        let queued = self.queue.lock().pop_front();
        match queued {
            Some(queued) => {
                queued.job.await;
                true
            }
            None => false,
        }
    }

    /// Run jobs oldest first until the queue is empty, including jobs scheduled meanwhile.
    pub async fn run_all(&self) {
        while self.run_next().await {}
    }
}

impl RequestProcessor for ManualRequestProcessor {
    fn schedule_request(
        &self,
        entity_id: &EntityId,
        key: ConcurrencyKey,
        request: Arc<ServerEntityRequest>,
        job: RequestJob,
    ) {
        self.queue.lock().push_back(QueuedJob {
            entity_id: entity_id.clone(),
            key,
            request,
            job,
        });
    }
}

/// Messages understood by [`RecordingService`] instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestMessage {
    /// Respond with `value`.
    Echo { key: i32, value: Vec<u8> },
    /// Fail with [`EntityError::InvocationFailed`].
    Fail { key: i32, reason: String },
    Panic { key: i32 },
    /// Schedule `next` as a self-message, deferring this invocation's retirement on it.
    FollowUp { key: i32, next: Box<TestMessage> },
    /// Schedule `next` as an independent self-message.
    Spawn { key: i32, next: Box<TestMessage> },
    /// Defer this invocation's retirement twice, which the retirement graph forbids.
    DoubleFollowUp { key: i32, next: Box<TestMessage> },
}

impl TestMessage {
    pub fn key(&self) -> ConcurrencyKey {
        match self {
            TestMessage::Echo { key, .. }
            | TestMessage::Fail { key, .. }
            | TestMessage::Panic { key }
            | TestMessage::FollowUp { key, .. }
            | TestMessage::Spawn { key, .. }
            | TestMessage::DoubleFollowUp { key, .. } => ConcurrencyKey::new(*key),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        rmp_serde::to_vec(self).expect("test message encodes")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResponse {
    pub message_id: MessageId,
    pub value: Vec<u8>,
}

impl TestResponse {
    pub fn decode(bytes: &[u8]) -> Self {
        rmp_serde::from_slice(bytes).expect("test response decodes")
    }
}

/// MessagePack codec for [`TestMessage`] / [`TestResponse`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgpackCodec;

impl MessageCodec<TestMessage, TestResponse> for MsgpackCodec {
    fn serialize(&self, response: &TestResponse) -> Result<Vec<u8>, EntityError> {
        rmp_serde::to_vec(response).map_err(|e| EntityError::malformed("encode response", e))
    }

    fn deserialize(&self, payload: &[u8]) -> Result<TestMessage, EntityError> {
        rmp_serde::from_slice(payload).map_err(|e| EntityError::malformed("decode message", e))
    }
}

/// Keys each [`TestMessage`] by its own `key` field.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageKeyStrategy;

impl ConcurrencyStrategy<TestMessage> for MessageKeyStrategy {
    fn concurrency_key(&self, message: &TestMessage) -> ConcurrencyKey {
        message.key()
    }
}

/// Callback observed by a [`RecordingService`] instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityEvent {
    ActiveBuilt { config: Vec<u8> },
    PassiveBuilt { config: Vec<u8> },
    CreateNew { role: EntityRole },
    LoadExisting,
    Connected { client: ClientDescriptor },
    Disconnected { client: ClientDescriptor },
    Invoked { message_id: MessageId, message: TestMessage },
    Destroyed { role: EntityRole },
}

/// Shared, ordered log of [`EntityEvent`]s.
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<EntityEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: EntityEvent) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<EntityEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&EntityEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }

    pub fn contains(&self, event: &EntityEvent) -> bool {
        self.events.lock().contains(event)
    }

    /// Message ids of every invocation, in execution order.
    pub fn invocations(&self) -> Vec<MessageId> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                EntityEvent::Invoked { message_id, .. } => Some(*message_id),
                _ => None,
            })
            .collect()
    }
}

/// Entity service whose instances record their callbacks.
pub struct RecordingService {
    entity_type: EntityType,
    version: u64,
    log: EventLog,
}

impl RecordingService {
    pub const ENTITY_TYPE: &'static str = "Recording";

    pub fn new(version: u64, log: EventLog) -> Self {
        Self {
            entity_type: EntityType::new(Self::ENTITY_TYPE),
            version,
            log,
        }
    }
}

impl ServerEntityService for RecordingService {
    type Message = TestMessage;
    type Response = TestResponse;

    fn entity_type(&self) -> EntityType {
        self.entity_type.clone()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn create_active_entity(
        &self,
        _registry: &ServiceRegistry,
        config: &[u8],
    ) -> Result<Arc<dyn ActiveServerEntity<TestMessage, TestResponse>>, EntityError> {
        self.log.record(EntityEvent::ActiveBuilt {
            config: config.to_vec(),
        });
        Ok(Arc::new(RecordingActive {
            config: config.to_vec(),
            log: self.log.clone(),
        }))
    }

    fn create_passive_entity(
        &self,
        _registry: &ServiceRegistry,
        config: &[u8],
    ) -> Result<Arc<dyn PassiveServerEntity>, EntityError> {
        self.log.record(EntityEvent::PassiveBuilt {
            config: config.to_vec(),
        });
        Ok(Arc::new(RecordingPassive {
            log: self.log.clone(),
        }))
    }
}

struct RecordingActive {
    config: Vec<u8>,
    log: EventLog,
}

#[async_trait]
impl ActiveServerEntity<TestMessage, TestResponse> for RecordingActive {
    async fn create_new(&self) -> Result<(), EntityError> {
        self.log.record(EntityEvent::CreateNew {
            role: EntityRole::Active,
        });
        Ok(())
    }

    async fn load_existing(&self) -> Result<(), EntityError> {
        self.log.record(EntityEvent::LoadExisting);
        Ok(())
    }

    async fn connected(&self, client: &ClientDescriptor) {
        self.log.record(EntityEvent::Connected {
            client: client.clone(),
        });
    }

    async fn disconnected(&self, client: &ClientDescriptor) {
        self.log.record(EntityEvent::Disconnected {
            client: client.clone(),
        });
    }

    async fn invoke(
        &self,
        context: &InvokeContext,
        message: TestMessage,
    ) -> Result<TestResponse, EntityError> {
        let message_id = context.message_id();
        self.log.record(EntityEvent::Invoked {
            message_id,
            message: message.clone(),
        });
        match message {
            TestMessage::Echo { value, .. } => Ok(TestResponse { message_id, value }),
            TestMessage::Fail { reason, .. } => Err(EntityError::invocation(reason)),
            TestMessage::Panic { .. } => panic!("test entity asked to panic"),
            TestMessage::FollowUp { next, .. } => {
                let follow_up = context.message_self_and_defer_retirement(next.encode())?;
                Ok(TestResponse {
                    message_id,
                    value: follow_up.0.to_be_bytes().to_vec(),
                })
            }
            TestMessage::Spawn { next, .. } => {
                let spawned = context.message_self(next.encode())?;
                Ok(TestResponse {
                    message_id,
                    value: spawned.0.to_be_bytes().to_vec(),
                })
            }
            TestMessage::DoubleFollowUp { next, .. } => {
                context.message_self_and_defer_retirement(next.encode())?;
                let second = context.message_self_and_defer_retirement(next.encode())?;
                Ok(TestResponse {
                    message_id,
                    value: second.0.to_be_bytes().to_vec(),
                })
            }
        }
    }

    async fn destroy(&self) -> Result<(), EntityError> {
        self.log.record(EntityEvent::Destroyed {
            role: EntityRole::Active,
        });
        Ok(())
    }

    fn config(&self) -> Vec<u8> {
        self.config.clone()
    }

    fn message_codec(&self) -> &dyn MessageCodec<TestMessage, TestResponse> {
        &MsgpackCodec
    }

    fn concurrency_strategy(&self) -> &dyn ConcurrencyStrategy<TestMessage> {
        &MessageKeyStrategy
    }
}

struct RecordingPassive {
    log: EventLog,
}

#[async_trait]
impl PassiveServerEntity for RecordingPassive {
    async fn create_new(&self) -> Result<(), EntityError> {
        self.log.record(EntityEvent::CreateNew {
            role: EntityRole::Passive,
        });
        Ok(())
    }

    async fn destroy(&self) -> Result<(), EntityError> {
        self.log.record(EntityEvent::Destroyed {
            role: EntityRole::Passive,
        });
        Ok(())
    }
}

/// A single managed entity wired to a [`ManualRequestProcessor`] and a
/// [`RecordingService`].
pub struct TestHost {
    pub processor: Arc<ManualRequestProcessor>,
    pub client_state: Arc<ClientEntityStateTracker>,
    pub metrics: Arc<HostMetrics>,
    pub log: EventLog,
    pub entity: Arc<ManagedEntity<RecordingService>>,
}

impl TestHost {
    pub const VERSION: u64 = 1;

    /// Create a host whose entity starts in the given state (active or not yet decided).
    pub fn new(is_in_active_state: bool) -> Self {
        let processor = Arc::new(ManualRequestProcessor::new());
        let client_state = Arc::new(ClientEntityStateTracker::new());
        let metrics = Arc::new(HostMetrics::unregistered());
        let log = EventLog::new();
        let context = HostContext {
            registry: Arc::new(ServiceRegistry::new()),
            processor: processor.clone(),
            client_state: client_state.clone(),
            metrics: metrics.clone(),
        };
        let entity = ManagedEntity::new(
            Self::entity_id(),
            Self::VERSION,
            Arc::new(RecordingService::new(Self::VERSION, log.clone())),
            context,
            is_in_active_state,
        );
        Self {
            processor,
            client_state,
            metrics,
            log,
            entity,
        }
    }

    pub fn entity_id() -> EntityId {
        EntityId::new(RecordingService::ENTITY_TYPE, "test")
    }

    pub fn client(node: u64) -> ClientDescriptor {
        Self::client_with_version(node, Self::VERSION)
    }

    pub fn client_with_version(node: u64, version: u64) -> ClientDescriptor {
        ClientDescriptor::new(
            ClientNodeId(node),
            EntityDescriptor::new(Self::entity_id(), ClientInstanceId(node), version),
        )
    }

    /// Submit a lifecycle request from `node`.
    pub fn lifecycle(
        &self,
        action: ServerEntityAction,
        node: u64,
        payload: Vec<u8>,
    ) -> ReplyReceiver {
        let (request, reply_rx) = ServerEntityRequest::new(action, Self::client(node), payload);
        self.entity.add_lifecycle_request(request);
        reply_rx
    }

    /// Submit an invocation of `message` from `node`.
    pub fn invoke(&self, node: u64, message: &TestMessage) -> ReplyReceiver {
        let (request, reply_rx) = ServerEntityRequest::new(
            ServerEntityAction::InvokeAction,
            Self::client(node),
            message.encode(),
        );
        self.entity.add_invoke_request(request);
        reply_rx
    }

    /// CREATE with `config`, then PROMOTE, running both to completion.
    pub async fn create_and_promote(&self, config: &[u8]) {
        let created = self.lifecycle(ServerEntityAction::CreateEntity, 1, config.to_vec());
        let promoted = self.lifecycle(ServerEntityAction::PromoteEntityToActive, 1, vec![]);
        self.processor.run_all().await;
        assert!(created.await.expect("create completed").is_success());
        assert!(promoted.await.expect("promote completed").is_success());
    }
}
