//! Per-entity request handling.
//!
//! A [`ManagedEntity`] owns the lifecycle of one entity on this server: it creates the
//! passive or active instance, promotes it, tracks fetches and releases, and routes
//! invocations to the instance. Lifecycle requests run on the management concurrency key
//! so they are serialized against each other; invocations run on whatever key the
//! instance's concurrency strategy assigns and are signalled back through the
//! [`RetirementManager`].
//!
//! Lifecycle requests hold the entity's gate exclusively while invocations share it, so an
//! instance is never created, promoted or destroyed while one of its invocations runs.

use crate::client_state::ClientEntityStateManager;
use crate::entity::{
    ActiveServerEntity, EntityMessenger, InvokeContext, PassiveServerEntity, ServerEntityService,
    ServiceRegistry,
};
use crate::error::EntityError;
use crate::metrics::HostMetrics;
use crate::request::{RequestOutcome, ServerEntityAction, ServerEntityRequest};
use crate::request_processor::{panic_message, RequestProcessor};
use crate::retirement::RetirementManager;
use crate::types::{ClientDescriptor, ConcurrencyKey, EntityId, MessageId, MessageIdGenerator};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tracing::{debug, instrument};

/// Role of a managed entity on this server.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EntityRole {
    /// No role decided yet; a CREATE in this role builds a passive instance.
    Uninitialized,
    Passive,
    Active,
}

/// Collaborators shared by every managed entity on a host.
#[derive(Clone)]
pub struct HostContext {
    pub registry: Arc<ServiceRegistry>,
    pub processor: Arc<dyn RequestProcessor>,
    pub client_state: Arc<dyn ClientEntityStateManager>,
    pub metrics: Arc<HostMetrics>,
}

type ActiveInstance<S> = Arc<
    dyn ActiveServerEntity<
        <S as ServerEntityService>::Message,
        <S as ServerEntityService>::Response,
    >,
>;

enum EntityInstance<S: ServerEntityService> {
    Active(ActiveInstance<S>),
    Passive(Arc<dyn PassiveServerEntity>),
}

impl<S: ServerEntityService> Clone for EntityInstance<S> {
    fn clone(&self) -> Self {
        match self {
            EntityInstance::Active(active) => EntityInstance::Active(Arc::clone(active)),
            EntityInstance::Passive(passive) => EntityInstance::Passive(Arc::clone(passive)),
        }
    }
}

struct EntityState<S: ServerEntityService> {
    role: EntityRole,
    instance: Option<EntityInstance<S>>,
    /// Config bytes the current instance was created from.
    config: Vec<u8>,
}

/// Server-side record of one entity and its request handling.
///
/// The record outlives its instance: DESTROY drops the instance but keeps the record, so a
/// later CREATE with the same id reuses it.
pub struct ManagedEntity<S: ServerEntityService> {
    id: EntityId,
    version: u64,
    service: Arc<S>,
    context: HostContext,
    retirement: RetirementManager,
    message_ids: MessageIdGenerator,
    state: parking_lot::Mutex<EntityState<S>>,
    /// Written for the whole of a lifecycle operation, including its instance callbacks;
    /// read for the whole of an invocation.
    lifecycle: tokio::sync::RwLock<()>,
    /// Serializes retire-and-deliver so outcomes reach originators in retirement order.
    delivery: parking_lot::Mutex<()>,
    this: Weak<Self>,
}

impl<S: ServerEntityService> ManagedEntity<S> {
    pub fn new(
        id: EntityId,
        version: u64,
        service: Arc<S>,
        context: HostContext,
        is_in_active_state: bool,
    ) -> Arc<Self> {
        let role = if is_in_active_state {
            EntityRole::Active
        } else {
            EntityRole::Uninitialized
        };
        Arc::new_cyclic(|this| Self {
            id,
            version,
            service,
            context,
            retirement: RetirementManager::new(),
            message_ids: MessageIdGenerator::new(),
            state: parking_lot::Mutex::new(EntityState {
                role,
                instance: None,
                config: Vec::new(),
            }),
            lifecycle: tokio::sync::RwLock::new(()),
            delivery: parking_lot::Mutex::new(()),
            this: this.clone(),
        })
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn role(&self) -> EntityRole {
        self.state.lock().role
    }

    /// Whether an instance currently exists (created and not destroyed).
    pub fn has_instance(&self) -> bool {
        self.state.lock().instance.is_some()
    }

    /// Invocations registered for retirement and not yet retired.
    pub fn pending_retirements(&self) -> usize {
        self.retirement.pending()
    }

    fn this(&self) -> Arc<Self> {
        match self.this.upgrade() {
            Some(this) => this,
            None => panic!("managed entity {} used after release", self.id),
        }
    }

    /// Queue a lifecycle request on the management key.
    #[instrument(skip(self, request), fields(entity_id = %self.id, action = %request.action()))]
    pub fn add_lifecycle_request(&self, request: Arc<ServerEntityRequest>) {
        assert!(
            request.action().is_lifecycle(),
            "{} is not a lifecycle action",
            request.action()
        );
        let this = self.this();
        let job_request = Arc::clone(&request);
        self.context.processor.schedule_request(
            &self.id,
            ConcurrencyKey::MANAGEMENT,
            request,
            async move { this.process_lifecycle(job_request).await }.boxed(),
        );
    }

    /// Admit an invocation: decode it, register it for retirement and schedule it on the
    /// key its message maps to.
    ///
    /// Validation is synchronous. With no instance the request fails with
    /// [`EntityError::NotFound`] and nothing is registered or scheduled.
    #[instrument(skip(self, request), fields(entity_id = %self.id))]
    pub fn add_invoke_request(&self, request: Arc<ServerEntityRequest>) {
        assert_eq!(
            request.action(),
            ServerEntityAction::InvokeAction,
            "only invocations are admitted here"
        );
        if let Err(err) = self.check_version(&request) {
            request.failure(err);
            return;
        }

        match self.invoke_target() {
            Some(active) => self.admit_invoke(request, active),
            None => {
                debug!(entity_id = %self.id, "invocation against missing instance");
                request.failure(self.not_found());
            }
        }
    }

    fn not_found(&self) -> EntityError {
        EntityError::NotFound {
            entity_id: self.id.clone(),
        }
    }

    fn check_version(&self, request: &ServerEntityRequest) -> Result<(), EntityError> {
        // Promotion is issued by the server for whatever version it hosts.
        if request.action() == ServerEntityAction::PromoteEntityToActive {
            return Ok(());
        }
        let actual = request.entity_descriptor().version;
        if actual != self.version {
            return Err(EntityError::VersionMismatch {
                entity_id: self.id.clone(),
                expected: self.version,
                actual,
            });
        }
        Ok(())
    }

    /// The instance invocations should run against, if one exists.
    fn invoke_target(&self) -> Option<ActiveInstance<S>> {
        let state = self.state.lock();
        match &state.instance {
            None => None,
            Some(EntityInstance::Active(active)) => Some(Arc::clone(active)),
            Some(EntityInstance::Passive(_)) => {
                panic!("invocation routed to passive entity {}", self.id)
            }
        }
    }

    /// Whether `active` is still the instance this entity holds.
    fn is_current(&self, active: &ActiveInstance<S>) -> bool {
        match &self.state.lock().instance {
            Some(EntityInstance::Active(current)) => Arc::ptr_eq(current, active),
            _ => false,
        }
    }

    fn admit_invoke(&self, request: Arc<ServerEntityRequest>, active: ActiveInstance<S>) {
        let message = match active.message_codec().deserialize(request.payload()) {
            Ok(message) => message,
            Err(err) => {
                debug!(entity_id = %self.id, error = %err, "rejecting undecodable invocation");
                request.failure(err);
                return;
            }
        };
        let message_id = self.message_ids.next_id();
        self.dispatch(request, active, message_id, message);
    }

    fn dispatch(
        &self,
        request: Arc<ServerEntityRequest>,
        active: ActiveInstance<S>,
        message_id: MessageId,
        message: S::Message,
    ) {
        let key = active.concurrency_strategy().concurrency_key(&message);
        self.retirement
            .register_with_message(Arc::clone(&request), message_id, key);
        self.context.metrics.inflight_invocations.inc();
        debug!(entity_id = %self.id, message_id = %message_id, key = %key, "invocation admitted");

        let this = self.this();
        let job_request = Arc::clone(&request);
        self.context.processor.schedule_request(
            &self.id,
            key,
            request,
            async move {
                this.execute_invoke(job_request, active, message_id, message)
                    .await
            }
            .boxed(),
        );
    }

    async fn execute_invoke(
        &self,
        request: Arc<ServerEntityRequest>,
        active: ActiveInstance<S>,
        message_id: MessageId,
        message: S::Message,
    ) {
        let _running = self.lifecycle.read().await;
        if !self.is_current(&active) {
            debug!(
                entity_id = %self.id,
                message_id = %message_id,
                "instance was replaced before the invocation ran"
            );
            request.hold(RequestOutcome::Failed(self.not_found()));
            self.retire(message_id);
            return;
        }

        let messenger = Arc::new(InvocationMessenger {
            entity: self.this(),
            fault: parking_lot::Mutex::new(None),
        });
        let context = InvokeContext::new(request.source().clone(), message_id, messenger.clone());

        let result = AssertUnwindSafe(active.invoke(&context, message))
            .catch_unwind()
            .await;
        let fault = messenger.fault.lock().take();
        if let Some(fault) = fault {
            tracing::error!(
                entity_id = %self.id,
                message_id = %message_id,
                panic = %panic_message(&*fault),
                "retirement invariant violated during invocation"
            );
            std::panic::resume_unwind(fault);
        }
        let outcome = match result {
            Ok(Ok(response)) => match active.message_codec().serialize(&response) {
                Ok(bytes) => RequestOutcome::Completed(Some(bytes)),
                Err(err) => RequestOutcome::Failed(err),
            },
            Ok(Err(err)) => RequestOutcome::Failed(err),
            Err(panic_payload) => {
                let info = panic_message(&*panic_payload);
                tracing::error!(
                    entity_id = %self.id,
                    message_id = %message_id,
                    panic = %info,
                    "entity invocation panicked"
                );
                RequestOutcome::Failed(EntityError::invocation(format!(
                    "entity panicked: {info}"
                )))
            }
        };

        request.hold(outcome);
        self.retire(message_id);
    }

    fn retire(&self, message_id: MessageId) {
        let _delivery = self.delivery.lock();
        let retired = self.retirement.retire_for_completion(message_id);
        self.context
            .metrics
            .inflight_invocations
            .sub(retired.len() as i64);
        self.context
            .metrics
            .retired_requests
            .inc_by(retired.len() as u64);
        for request in retired {
            request.release_held();
        }
    }

    fn schedule_self_message(
        &self,
        defer_from: Option<MessageId>,
        source: &ClientDescriptor,
        payload: Vec<u8>,
    ) -> Result<MessageId, EntityError> {
        let active = self.invoke_target().ok_or_else(|| self.not_found())?;
        let message = active.message_codec().deserialize(&payload)?;
        let message_id = self.message_ids.next_id();
        if let Some(original) = defer_from {
            self.retirement.defer_retirement(original, message_id);
        }
        let (request, _reply_rx) = ServerEntityRequest::server_originated(
            ServerEntityAction::InvokeAction,
            source.entity_descriptor.clone(),
            payload,
        );
        self.dispatch(request, active, message_id, message);
        Ok(message_id)
    }

    async fn process_lifecycle(&self, request: Arc<ServerEntityRequest>) {
        let _lifecycle = self.lifecycle.write().await;
        self.context.metrics.lifecycle_requests.inc();

        if let Err(err) = self.check_version(&request) {
            request.failure(err);
            return;
        }

        let result = match request.action() {
            ServerEntityAction::CreateEntity => {
                self.create_entity(request.payload()).await.map(|()| None)
            }
            ServerEntityAction::PromoteEntityToActive => {
                self.promote_entity_to_active().await.map(|()| None)
            }
            ServerEntityAction::FetchEntity => self.fetch_entity(request.source()).await,
            ServerEntityAction::ReleaseEntity => {
                self.release_entity(request.source()).await.map(|()| None)
            }
            ServerEntityAction::DestroyEntity => self.destroy_entity().await.map(|()| None),
            ServerEntityAction::InvokeAction => {
                unreachable!("invocations are never scheduled as lifecycle requests")
            }
        };

        match result {
            Ok(None) => request.complete(),
            Ok(Some(bytes)) => request.complete_with(bytes),
            Err(err) => {
                debug!(
                    entity_id = %self.id,
                    action = %request.action(),
                    error = %err,
                    "lifecycle request failed"
                );
                request.failure(err);
            }
        }
    }

    async fn create_entity(&self, config: &[u8]) -> Result<(), EntityError> {
        let role = {
            let state = self.state.lock();
            if state.instance.is_some() {
                return Err(EntityError::AlreadyExists {
                    entity_id: self.id.clone(),
                });
            }
            state.role
        };

        let registry = &self.context.registry;
        let instance = match role {
            EntityRole::Active => {
                let active = self.service.create_active_entity(registry, config)?;
                active.create_new().await?;
                EntityInstance::Active(active)
            }
            EntityRole::Uninitialized | EntityRole::Passive => {
                let passive = self.service.create_passive_entity(registry, config)?;
                passive.create_new().await?;
                EntityInstance::Passive(passive)
            }
        };

        let mut state = self.state.lock();
        state.instance = Some(instance);
        state.config = config.to_vec();
        if state.role == EntityRole::Uninitialized {
            state.role = EntityRole::Passive;
        }
        debug!(entity_id = %self.id, role = ?state.role, "entity created");
        Ok(())
    }

    async fn promote_entity_to_active(&self) -> Result<(), EntityError> {
        let config = {
            let mut state = self.state.lock();
            if state.role == EntityRole::Active {
                debug!(entity_id = %self.id, "already active, ignoring promotion");
                return Ok(());
            }
            let passive_config = match &state.instance {
                None => None,
                Some(EntityInstance::Active(_)) => {
                    panic!(
                        "entity {} holds an active instance while {:?}",
                        self.id, state.role
                    )
                }
                Some(EntityInstance::Passive(_)) => Some(state.config.clone()),
            };
            let Some(config) = passive_config else {
                state.role = EntityRole::Active;
                debug!(entity_id = %self.id, "promoted without an instance");
                return Ok(());
            };
            config
        };

        let active = self
            .service
            .create_active_entity(&self.context.registry, &config)?;
        active.load_existing().await?;

        let mut state = self.state.lock();
        state.instance = Some(EntityInstance::Active(active));
        state.role = EntityRole::Active;
        debug!(entity_id = %self.id, "passive instance promoted");
        Ok(())
    }

    /// The active instance for FETCH or RELEASE. Both are only valid in the active role.
    fn client_target(&self, action: ServerEntityAction) -> Option<ActiveInstance<S>> {
        let state = self.state.lock();
        assert_eq!(
            state.role,
            EntityRole::Active,
            "{action} for entity {} requires the active role",
            self.id
        );
        match &state.instance {
            None => None,
            Some(EntityInstance::Active(active)) => Some(Arc::clone(active)),
            Some(EntityInstance::Passive(_)) => {
                panic!("active entity {} holds a passive instance", self.id)
            }
        }
    }

    async fn fetch_entity(
        &self,
        client: &ClientDescriptor,
    ) -> Result<Option<Vec<u8>>, EntityError> {
        let Some(active) = self.client_target(ServerEntityAction::FetchEntity) else {
            // Nothing to connect to: the fetch succeeds without a reference or config.
            return Ok(None);
        };
        self.context
            .client_state
            .add_reference(client.node_id, client.entity_descriptor.clone());
        active.connected(client).await;
        Ok(Some(active.config()))
    }

    async fn release_entity(&self, client: &ClientDescriptor) -> Result<(), EntityError> {
        let Some(active) = self.client_target(ServerEntityAction::ReleaseEntity) else {
            return Err(self.not_found());
        };
        active.disconnected(client).await;
        self.context
            .client_state
            .remove_reference(client.node_id, &client.entity_descriptor);
        Ok(())
    }

    async fn destroy_entity(&self) -> Result<(), EntityError> {
        let instance = self.state.lock().instance.clone();
        match instance {
            None => return Err(self.not_found()),
            Some(EntityInstance::Active(active)) => active.destroy().await?,
            Some(EntityInstance::Passive(passive)) => passive.destroy().await?,
        }

        let mut state = self.state.lock();
        state.instance = None;
        state.config.clear();
        debug!(entity_id = %self.id, "entity destroyed");
        Ok(())
    }
}

/// Messenger handed to a single running invocation.
///
/// A panic raised by the retirement graph while scheduling a self-message is stored in
/// `fault` and rethrown once the invocation returns, outside the guard that turns entity
/// panics into failed requests.
struct InvocationMessenger<S: ServerEntityService> {
    entity: Arc<ManagedEntity<S>>,
    fault: parking_lot::Mutex<Option<Box<dyn Any + Send>>>,
}

impl<S: ServerEntityService> InvocationMessenger<S> {
    fn schedule(
        &self,
        defer_from: Option<MessageId>,
        source: &ClientDescriptor,
        payload: Vec<u8>,
    ) -> Result<MessageId, EntityError> {
        let scheduled = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.entity
                .schedule_self_message(defer_from, source, payload)
        }));
        match scheduled {
            Ok(result) => result,
            Err(fault) => {
                let info = panic_message(&*fault);
                *self.fault.lock() = Some(fault);
                std::panic::resume_unwind(Box::new(info))
            }
        }
    }
}

impl<S: ServerEntityService> EntityMessenger for InvocationMessenger<S> {
    fn message_self(
        &self,
        source: &ClientDescriptor,
        payload: Vec<u8>,
    ) -> Result<MessageId, EntityError> {
        self.schedule(None, source, payload)
    }

    fn message_self_and_defer_retirement(
        &self,
        original: MessageId,
        source: &ClientDescriptor,
        payload: Vec<u8>,
    ) -> Result<MessageId, EntityError> {
        self.schedule(Some(original), source, payload)
    }
}

/// Type-erased view of a [`ManagedEntity`], used by the host's entity registry.
pub trait ManagedEntityHandle: Send + Sync {
    fn entity_id(&self) -> &EntityId;
    fn version(&self) -> u64;
    fn role(&self) -> EntityRole;
    fn has_instance(&self) -> bool;
    fn add_lifecycle_request(&self, request: Arc<ServerEntityRequest>);
    fn add_invoke_request(&self, request: Arc<ServerEntityRequest>);

    /// Route a request by its action.
    fn submit(&self, request: Arc<ServerEntityRequest>) {
        if request.action().is_lifecycle() {
            self.add_lifecycle_request(request);
        } else {
            self.add_invoke_request(request);
        }
    }
}

impl<S: ServerEntityService> ManagedEntityHandle for ManagedEntity<S> {
    fn entity_id(&self) -> &EntityId {
        ManagedEntity::entity_id(self)
    }

    fn version(&self) -> u64 {
        ManagedEntity::version(self)
    }

    fn role(&self) -> EntityRole {
        ManagedEntity::role(self)
    }

    fn has_instance(&self) -> bool {
        ManagedEntity::has_instance(self)
    }

    fn add_lifecycle_request(&self, request: Arc<ServerEntityRequest>) {
        ManagedEntity::add_lifecycle_request(self, request)
    }

    fn add_invoke_request(&self, request: Arc<ServerEntityRequest>) {
        ManagedEntity::add_invoke_request(self, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_state::ClientEntityStateManager;
    use crate::request::ReplyReceiver;
    use crate::testing::{EntityEvent, TestHost, TestMessage, TestResponse};
    use crate::types::ClientNodeId;

    fn echo(key: i32, value: &[u8]) -> TestMessage {
        TestMessage::Echo {
            key,
            value: value.to_vec(),
        }
    }

    async fn outcome(reply_rx: ReplyReceiver) -> RequestOutcome {
        reply_rx.await.expect("request completed")
    }

    fn response(outcome: RequestOutcome) -> TestResponse {
        let bytes = outcome.into_result().unwrap().expect("response bytes");
        TestResponse::decode(&bytes)
    }

    #[tokio::test]
    async fn create_in_active_role_builds_active_instance() {
        let host = TestHost::new(true);
        let created = host.lifecycle(ServerEntityAction::CreateEntity, 1, b"foo".to_vec());
        host.processor.run_all().await;

        assert!(outcome(created).await.is_success());
        assert_eq!(
            host.log.events(),
            vec![
                EntityEvent::ActiveBuilt {
                    config: b"foo".to_vec()
                },
                EntityEvent::CreateNew {
                    role: EntityRole::Active
                },
            ]
        );
        assert!(host.entity.has_instance());
        assert_eq!(host.entity.role(), EntityRole::Active);
        assert_eq!(host.metrics.lifecycle_requests.get(), 1);
    }

    #[tokio::test]
    async fn create_before_promotion_builds_passive_instance() {
        let host = TestHost::new(false);
        assert_eq!(host.entity.role(), EntityRole::Uninitialized);
        let created = host.lifecycle(ServerEntityAction::CreateEntity, 1, b"foo".to_vec());
        assert_eq!(host.processor.keys(), vec![ConcurrencyKey::MANAGEMENT]);
        host.processor.run_all().await;

        assert!(outcome(created).await.is_success());
        assert_eq!(
            host.log.events(),
            vec![
                EntityEvent::PassiveBuilt {
                    config: b"foo".to_vec()
                },
                EntityEvent::CreateNew {
                    role: EntityRole::Passive
                },
            ]
        );
        assert_eq!(host.entity.role(), EntityRole::Passive);
    }

    #[tokio::test]
    async fn second_create_fails_and_keeps_first_instance() {
        let host = TestHost::new(false);
        let first = host.lifecycle(ServerEntityAction::CreateEntity, 1, b"one".to_vec());
        let second = host.lifecycle(ServerEntityAction::CreateEntity, 2, b"two".to_vec());
        host.processor.run_all().await;

        assert!(outcome(first).await.is_success());
        assert!(matches!(
            outcome(second).await,
            RequestOutcome::Failed(EntityError::AlreadyExists { .. })
        ));
        assert_eq!(
            host.log
                .count(|event| matches!(event, EntityEvent::PassiveBuilt { .. })),
            1
        );
    }

    #[tokio::test]
    async fn fetch_without_instance_completes_empty() {
        let host = TestHost::new(true);
        let fetched = host.lifecycle(ServerEntityAction::FetchEntity, 3, vec![]);
        host.processor.run_all().await;

        assert!(matches!(
            outcome(fetched).await,
            RequestOutcome::Completed(None)
        ));
        assert!(host.client_state.references_for(ClientNodeId(3)).is_empty());
        assert!(host.log.events().is_empty());
    }

    #[tokio::test]
    async fn fetch_and_release_track_the_client() {
        let host = TestHost::new(true);
        host.lifecycle(ServerEntityAction::CreateEntity, 1, b"cfg".to_vec());
        let fetched = host.lifecycle(ServerEntityAction::FetchEntity, 3, vec![]);
        host.processor.run_all().await;

        assert_eq!(
            outcome(fetched).await.into_result().unwrap(),
            Some(b"cfg".to_vec())
        );
        let client = TestHost::client(3);
        assert_eq!(
            host.client_state.references_for(ClientNodeId(3)),
            vec![client.entity_descriptor.clone()]
        );
        assert!(host.log.contains(&EntityEvent::Connected {
            client: client.clone()
        }));

        let released = host.lifecycle(ServerEntityAction::ReleaseEntity, 3, vec![]);
        host.processor.run_all().await;
        assert!(outcome(released).await.is_success());
        assert!(host.log.contains(&EntityEvent::Disconnected { client }));
        assert!(host.client_state.references_for(ClientNodeId(3)).is_empty());
    }

    #[tokio::test]
    async fn release_without_instance_fails() {
        let host = TestHost::new(true);
        let released = host.lifecycle(ServerEntityAction::ReleaseEntity, 3, vec![]);
        host.processor.run_all().await;
        assert!(matches!(
            outcome(released).await,
            RequestOutcome::Failed(EntityError::NotFound { .. })
        ));
    }

    #[tokio::test]
    #[should_panic(expected = "requires the active role")]
    async fn fetch_in_passive_role_panics() {
        let host = TestHost::new(false);
        host.lifecycle(ServerEntityAction::CreateEntity, 1, vec![]);
        host.lifecycle(ServerEntityAction::FetchEntity, 3, vec![]);
        host.processor.run_all().await;
    }

    #[tokio::test]
    async fn promotion_rebuilds_passive_instance_as_active() {
        let host = TestHost::new(false);
        host.create_and_promote(b"cfg").await;

        assert_eq!(
            host.log.events(),
            vec![
                EntityEvent::PassiveBuilt {
                    config: b"cfg".to_vec()
                },
                EntityEvent::CreateNew {
                    role: EntityRole::Passive
                },
                EntityEvent::ActiveBuilt {
                    config: b"cfg".to_vec()
                },
                EntityEvent::LoadExisting,
            ]
        );
        assert_eq!(host.entity.role(), EntityRole::Active);

        let recreated = host.lifecycle(ServerEntityAction::CreateEntity, 2, b"cfg".to_vec());
        let fetched = host.lifecycle(ServerEntityAction::FetchEntity, 2, vec![]);
        host.processor.run_all().await;
        assert!(matches!(
            outcome(recreated).await,
            RequestOutcome::Failed(EntityError::AlreadyExists { .. })
        ));
        assert_eq!(
            outcome(fetched).await.into_result().unwrap(),
            Some(b"cfg".to_vec())
        );
    }

    #[tokio::test]
    async fn repeated_promotion_is_ignored() {
        let host = TestHost::new(false);
        host.create_and_promote(b"cfg").await;
        let again = host.lifecycle(ServerEntityAction::PromoteEntityToActive, 1, vec![]);
        host.processor.run_all().await;

        assert!(outcome(again).await.is_success());
        assert_eq!(
            host.log
                .count(|event| matches!(event, EntityEvent::ActiveBuilt { .. })),
            1
        );
        assert_eq!(
            host.log
                .count(|event| matches!(event, EntityEvent::LoadExisting)),
            1
        );
    }

    #[tokio::test]
    async fn invoke_without_instance_fails_not_found() {
        let host = TestHost::new(true);
        let mut invoked = host.invoke(1, &echo(1, b"x"));

        assert!(matches!(
            invoked.try_recv().unwrap(),
            RequestOutcome::Failed(EntityError::NotFound { .. })
        ));
        assert_eq!(host.processor.pending(), 0);
        assert!(host.log.invocations().is_empty());
        assert_eq!(host.entity.pending_retirements(), 0);
        assert_eq!(host.metrics.inflight_invocations.get(), 0);
    }

    #[tokio::test]
    async fn invoke_ahead_of_a_queued_create_is_not_found() {
        let host = TestHost::new(true);
        host.lifecycle(ServerEntityAction::CreateEntity, 1, vec![]);
        let mut early = host.invoke(1, &echo(4, b"early"));
        assert!(matches!(
            early.try_recv().unwrap(),
            RequestOutcome::Failed(EntityError::NotFound { .. })
        ));
        assert_eq!(host.processor.keys(), vec![ConcurrencyKey::MANAGEMENT]);

        host.processor.run_all().await;
        let late = host.invoke(1, &echo(4, b"late"));
        host.processor.run_all().await;
        assert_eq!(response(outcome(late).await).value, b"late".to_vec());
        assert_eq!(host.log.invocations().len(), 1);
    }

    #[tokio::test]
    async fn queued_invoke_does_not_reach_a_replaced_instance() {
        let host = TestHost::new(true);
        host.lifecycle(ServerEntityAction::CreateEntity, 1, b"old".to_vec());
        host.processor.run_all().await;

        let invoked = host.invoke(1, &echo(5, b"stale"));
        let destroyed = host.lifecycle(ServerEntityAction::DestroyEntity, 1, vec![]);
        let recreated = host.lifecycle(ServerEntityAction::CreateEntity, 1, b"new".to_vec());
        assert_eq!(
            host.processor.keys(),
            vec![
                ConcurrencyKey::new(5),
                ConcurrencyKey::MANAGEMENT,
                ConcurrencyKey::MANAGEMENT
            ]
        );

        host.processor.run(1).await;
        host.processor.run(1).await;
        assert!(outcome(destroyed).await.is_success());
        assert!(outcome(recreated).await.is_success());

        host.processor.run(0).await;
        assert!(matches!(
            outcome(invoked).await,
            RequestOutcome::Failed(EntityError::NotFound { .. })
        ));
        assert!(host.log.invocations().is_empty());
        assert_eq!(host.entity.pending_retirements(), 0);
        assert_eq!(host.metrics.inflight_invocations.get(), 0);
        assert_eq!(host.metrics.retired_requests.get(), 1);

        let fresh = host.invoke(1, &echo(5, b"fresh"));
        host.processor.run_all().await;
        assert_eq!(response(outcome(fresh).await).value, b"fresh".to_vec());
    }

    #[tokio::test]
    async fn invoke_runs_on_message_key() {
        let host = TestHost::new(false);
        host.create_and_promote(b"").await;
        let invoked = host.invoke(1, &echo(7, b"hi"));
        assert_eq!(host.processor.keys(), vec![ConcurrencyKey::new(7)]);
        assert_eq!(host.entity.pending_retirements(), 1);
        host.processor.run_all().await;

        assert_eq!(response(outcome(invoked).await).value, b"hi".to_vec());
        assert_eq!(host.entity.pending_retirements(), 0);
        assert_eq!(host.metrics.retired_requests.get(), 1);
        assert_eq!(host.metrics.inflight_invocations.get(), 0);
    }

    #[tokio::test]
    async fn same_key_outcomes_are_delivered_in_arrival_order() {
        let host = TestHost::new(true);
        host.lifecycle(ServerEntityAction::CreateEntity, 1, vec![]);
        host.processor.run_all().await;

        let mut r1 = host.invoke(1, &echo(5, b"1"));
        let mut r2 = host.invoke(1, &echo(5, b"2"));
        let mut r3 = host.invoke(1, &echo(5, b"3"));
        assert_eq!(host.processor.pending(), 3);

        host.processor.run(2).await;
        assert_eq!(host.log.invocations().len(), 1);
        assert!(r3.try_recv().is_err());
        assert_eq!(host.entity.pending_retirements(), 3);

        host.processor.run(0).await;
        assert_eq!(response(r1.try_recv().unwrap()).value, b"1".to_vec());
        assert!(r2.try_recv().is_err());
        assert!(r3.try_recv().is_err());

        host.processor.run(0).await;
        assert_eq!(response(r2.try_recv().unwrap()).value, b"2".to_vec());
        assert_eq!(response(r3.try_recv().unwrap()).value, b"3".to_vec());
        assert_eq!(host.entity.pending_retirements(), 0);
    }

    #[tokio::test]
    async fn different_keys_retire_independently() {
        let host = TestHost::new(true);
        host.lifecycle(ServerEntityAction::CreateEntity, 1, vec![]);
        host.processor.run_all().await;

        let mut first = host.invoke(1, &echo(1, b"a"));
        let mut second = host.invoke(1, &echo(2, b"b"));
        host.processor.run(1).await;
        assert_eq!(response(second.try_recv().unwrap()).value, b"b".to_vec());
        assert!(first.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_invocation_still_retires_in_order() {
        let host = TestHost::new(true);
        host.lifecycle(ServerEntityAction::CreateEntity, 1, vec![]);
        host.processor.run_all().await;

        let mut failing = host.invoke(
            1,
            &TestMessage::Fail {
                key: 3,
                reason: "no such counter".to_string(),
            },
        );
        let mut next = host.invoke(1, &echo(3, b"ok"));
        host.processor.run(1).await;
        assert!(next.try_recv().is_err());

        host.processor.run(0).await;
        assert!(matches!(
            failing.try_recv().unwrap(),
            RequestOutcome::Failed(EntityError::InvocationFailed { .. })
        ));
        assert!(next.try_recv().unwrap().is_success());
    }

    #[tokio::test]
    async fn panicking_invocation_fails_its_request() {
        let host = TestHost::new(true);
        host.lifecycle(ServerEntityAction::CreateEntity, 1, vec![]);
        host.processor.run_all().await;

        let panicking = host.invoke(1, &TestMessage::Panic { key: 2 });
        let next = host.invoke(1, &echo(2, b"after"));
        host.processor.run_all().await;

        match outcome(panicking).await {
            RequestOutcome::Failed(EntityError::InvocationFailed { reason, .. }) => {
                assert!(reason.contains("panicked"), "got: {reason}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(response(outcome(next).await).value, b"after".to_vec());
    }

    #[tokio::test]
    async fn undecodable_invocation_is_rejected_before_registration() {
        let host = TestHost::new(true);
        host.lifecycle(ServerEntityAction::CreateEntity, 1, vec![]);
        host.processor.run_all().await;

        let (request, reply_rx) = ServerEntityRequest::new(
            ServerEntityAction::InvokeAction,
            TestHost::client(1),
            vec![0xc1],
        );
        host.entity.add_invoke_request(request);

        assert!(matches!(
            outcome(reply_rx).await,
            RequestOutcome::Failed(EntityError::MalformedMessage { .. })
        ));
        assert_eq!(host.processor.pending(), 0);
        assert_eq!(host.entity.pending_retirements(), 0);
    }

    #[tokio::test]
    async fn version_mismatch_fails_before_dispatch() {
        let host = TestHost::new(true);
        host.lifecycle(ServerEntityAction::CreateEntity, 1, vec![]);
        host.processor.run_all().await;

        let (invoke, invoked) = ServerEntityRequest::new(
            ServerEntityAction::InvokeAction,
            TestHost::client_with_version(1, 9),
            echo(1, b"x").encode(),
        );
        host.entity.add_invoke_request(invoke);
        assert!(matches!(
            outcome(invoked).await,
            RequestOutcome::Failed(EntityError::VersionMismatch {
                expected: 1,
                actual: 9,
                ..
            })
        ));
        assert_eq!(host.processor.pending(), 0);

        let (destroy, destroyed) = ServerEntityRequest::new(
            ServerEntityAction::DestroyEntity,
            TestHost::client_with_version(1, 9),
            vec![],
        );
        host.entity.add_lifecycle_request(destroy);
        host.processor.run_all().await;
        assert!(matches!(
            outcome(destroyed).await,
            RequestOutcome::Failed(EntityError::VersionMismatch { .. })
        ));
        assert!(host.entity.has_instance());
    }

    #[tokio::test]
    async fn follow_up_holds_back_the_original_reply() {
        let host = TestHost::new(true);
        host.lifecycle(ServerEntityAction::CreateEntity, 1, vec![]);
        host.processor.run_all().await;

        let mut original = host.invoke(
            1,
            &TestMessage::FollowUp {
                key: 1,
                next: Box::new(echo(2, b"follow")),
            },
        );
        host.processor.run(0).await;
        assert_eq!(host.processor.keys(), vec![ConcurrencyKey::new(2)]);
        assert!(original.try_recv().is_err());
        assert_eq!(host.entity.pending_retirements(), 2);

        host.processor.run(0).await;
        let reply = response(original.try_recv().unwrap());
        let invoked = host.log.invocations();
        assert_eq!(invoked.len(), 2);
        assert_eq!(reply.value, invoked[1].0.to_be_bytes().to_vec());
        assert_eq!(host.entity.pending_retirements(), 0);
    }

    #[tokio::test]
    async fn follow_up_on_same_key_retires_both() {
        let host = TestHost::new(true);
        host.lifecycle(ServerEntityAction::CreateEntity, 1, vec![]);
        host.processor.run_all().await;

        let original = host.invoke(
            1,
            &TestMessage::FollowUp {
                key: 6,
                next: Box::new(echo(6, b"same")),
            },
        );
        let behind = host.invoke(1, &echo(6, b"behind"));
        host.processor.run_all().await;

        assert!(outcome(original).await.is_success());
        assert_eq!(response(outcome(behind).await).value, b"behind".to_vec());
        assert_eq!(host.entity.pending_retirements(), 0);
        assert_eq!(host.metrics.retired_requests.get(), 3);
    }

    #[tokio::test]
    async fn spawned_self_message_retires_independently() {
        let host = TestHost::new(true);
        host.lifecycle(ServerEntityAction::CreateEntity, 1, vec![]);
        host.processor.run_all().await;

        let mut original = host.invoke(
            1,
            &TestMessage::Spawn {
                key: 1,
                next: Box::new(echo(2, b"spawned")),
            },
        );
        host.processor.run(0).await;

        let reply = response(original.try_recv().unwrap());
        assert_eq!(host.processor.keys(), vec![ConcurrencyKey::new(2)]);
        assert_eq!(host.entity.pending_retirements(), 1);

        host.processor.run(0).await;
        let invoked = host.log.invocations();
        assert_eq!(invoked.len(), 2);
        assert_eq!(reply.value, invoked[1].0.to_be_bytes().to_vec());
        assert_eq!(host.entity.pending_retirements(), 0);
        assert_eq!(host.metrics.retired_requests.get(), 2);
    }

    #[tokio::test]
    async fn spawned_self_message_queues_behind_its_key() {
        let host = TestHost::new(true);
        host.lifecycle(ServerEntityAction::CreateEntity, 1, vec![]);
        host.processor.run_all().await;

        let mut ahead = host.invoke(1, &echo(2, b"ahead"));
        let mut original = host.invoke(
            1,
            &TestMessage::Spawn {
                key: 1,
                next: Box::new(echo(2, b"spawned")),
            },
        );
        host.processor.run(1).await;
        assert!(original.try_recv().unwrap().is_success());

        // The spawned message registered behind `ahead` on key 2.
        host.processor.run(1).await;
        assert_eq!(host.entity.pending_retirements(), 2);
        assert!(ahead.try_recv().is_err());

        host.processor.run(0).await;
        assert_eq!(response(ahead.try_recv().unwrap()).value, b"ahead".to_vec());
        assert_eq!(host.entity.pending_retirements(), 0);
    }

    #[tokio::test]
    async fn second_defer_from_one_invocation_is_not_reported_as_a_failure() {
        let host = TestHost::new(true);
        host.lifecycle(ServerEntityAction::CreateEntity, 1, vec![]);
        host.processor.run_all().await;

        let mut invoked = host.invoke(
            1,
            &TestMessage::DoubleFollowUp {
                key: 1,
                next: Box::new(echo(2, b"next")),
            },
        );
        let fault = AssertUnwindSafe(host.processor.run(0))
            .catch_unwind()
            .await
            .err()
            .expect("retirement violation escapes the invocation");
        assert!(
            panic_message(&*fault).contains("already deferred its retirement"),
            "got: {}",
            panic_message(&*fault)
        );
        assert!(invoked.try_recv().is_err());
        assert_eq!(host.metrics.retired_requests.get(), 0);
    }

    #[tokio::test]
    async fn destroyed_entity_can_be_recreated() {
        let host = TestHost::new(false);
        host.create_and_promote(b"cfg").await;
        let destroyed = host.lifecycle(ServerEntityAction::DestroyEntity, 1, vec![]);
        host.processor.run_all().await;

        assert!(outcome(destroyed).await.is_success());
        assert!(host.log.contains(&EntityEvent::Destroyed {
            role: EntityRole::Active
        }));
        assert!(!host.entity.has_instance());

        let invoked = host.invoke(1, &echo(1, b"gone"));
        host.processor.run_all().await;
        assert!(matches!(
            outcome(invoked).await,
            RequestOutcome::Failed(EntityError::NotFound { .. })
        ));

        let recreated = host.lifecycle(ServerEntityAction::CreateEntity, 1, b"new".to_vec());
        let fetched = host.lifecycle(ServerEntityAction::FetchEntity, 1, vec![]);
        host.processor.run_all().await;
        assert!(outcome(recreated).await.is_success());
        assert_eq!(
            outcome(fetched).await.into_result().unwrap(),
            Some(b"new".to_vec())
        );
    }

    #[tokio::test]
    async fn destroy_without_instance_fails() {
        let host = TestHost::new(true);
        let destroyed = host.lifecycle(ServerEntityAction::DestroyEntity, 1, vec![]);
        host.processor.run_all().await;
        assert!(matches!(
            outcome(destroyed).await,
            RequestOutcome::Failed(EntityError::NotFound { .. })
        ));
    }
}
