use crate::config::HostConfig;
use crate::entity::ServerEntityService;
use crate::error::EntityError;
use crate::managed_entity::{HostContext, ManagedEntity, ManagedEntityHandle};
use crate::request::{ReplyReceiver, ServerEntityAction, ServerEntityRequest};
use crate::types::{
    ClientDescriptor, ClientInstanceId, ClientNodeId, EntityDescriptor, EntityId, EntityType,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::instrument;

type ManagedEntityFactory =
    Box<dyn Fn(EntityId, bool) -> Arc<dyn ManagedEntityHandle> + Send + Sync>;

struct RegisteredService {
    version: u64,
    factory: ManagedEntityFactory,
}

/// Host-wide registry of managed entities.
///
/// Creates a [`ManagedEntity`] the first time a request names an unseen entity id, routes
/// requests to it, and drives the passive to active transition for every entity.
pub struct EntityManager {
    context: HostContext,
    services: DashMap<EntityType, Arc<RegisteredService>>,
    entities: DashMap<EntityId, Arc<dyn ManagedEntityHandle>>,
    active: AtomicBool,
}

impl EntityManager {
    pub fn new(config: &HostConfig, context: HostContext) -> Result<Self, EntityError> {
        config.validate()?;
        Ok(Self {
            context,
            services: DashMap::new(),
            entities: DashMap::new(),
            active: AtomicBool::new(config.start_active),
        })
    }

    /// Register the service for its entity type, replacing any earlier registration.
    pub fn register_service<S: ServerEntityService>(&self, service: S) {
        let entity_type = service.entity_type();
        let version = service.version();
        let service = Arc::new(service);
        let context = self.context.clone();
        let factory: ManagedEntityFactory = Box::new(move |entity_id, is_active| {
            let entity: Arc<dyn ManagedEntityHandle> = ManagedEntity::new(
                entity_id,
                version,
                Arc::clone(&service),
                context.clone(),
                is_active,
            );
            entity
        });

        let registered = Arc::new(RegisteredService { version, factory });
        if self
            .services
            .insert(entity_type.clone(), registered)
            .is_some()
        {
            tracing::warn!(entity_type = %entity_type, "replaced entity service registration");
        } else {
            tracing::debug!(entity_type = %entity_type, version, "registered entity service");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<Arc<dyn ManagedEntityHandle>> {
        self.entities
            .get(entity_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Number of managed entity records.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Look up the managed entity for `entity_id`, creating the record on first use.
    pub fn get_or_create(
        &self,
        entity_id: &EntityId,
        version: u64,
    ) -> Result<Arc<dyn ManagedEntityHandle>, EntityError> {
        if let Some(existing) = self.get(entity_id) {
            return check_version(existing, version);
        }

        let service = self
            .services
            .get(&entity_id.entity_type)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EntityError::UnknownEntityType {
                entity_type: entity_id.entity_type.clone(),
            })?;
        if service.version != version {
            return Err(EntityError::VersionMismatch {
                entity_id: entity_id.clone(),
                expected: service.version,
                actual: version,
            });
        }

        // The active flag is read under the shard lock, so a concurrent
        // `enter_active_state` either sees this record or it was created active.
        let entity = self
            .entities
            .entry(entity_id.clone())
            .or_insert_with(|| {
                self.context.metrics.managed_entities.inc();
                tracing::debug!(entity_id = %entity_id, "creating managed entity");
                (service.factory)(entity_id.clone(), self.is_active())
            })
            .value()
            .clone();
        check_version(entity, version)
    }

    /// Route a request to its managed entity. Failures to resolve the entity are reported
    /// through the request itself.
    #[instrument(
        skip(self, request),
        fields(
            action = %request.action(),
            entity_id = %request.entity_descriptor().entity_id,
        )
    )]
    pub fn submit(&self, request: Arc<ServerEntityRequest>) {
        let descriptor = request.entity_descriptor();
        match self.get_or_create(&descriptor.entity_id, descriptor.version) {
            Ok(entity) => entity.submit(request),
            Err(err) => {
                tracing::debug!(error = %err, "request rejected before dispatch");
                request.failure(err);
            }
        }
    }

    /// Switch this host to the active role and promote every known entity.
    ///
    /// Returns the promotion receivers; calling again once active is a no-op.
    pub fn enter_active_state(&self) -> Vec<ReplyReceiver> {
        if self.active.swap(true, Ordering::AcqRel) {
            tracing::debug!("host already active");
            return Vec::new();
        }

        let entities: Vec<_> = self
            .entities
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        tracing::info!(entities = entities.len(), "entering active state");

        entities
            .into_iter()
            .map(|entity| {
                let descriptor = EntityDescriptor::new(
                    entity.entity_id().clone(),
                    ClientInstanceId(0),
                    entity.version(),
                );
                let (request, reply_rx) = ServerEntityRequest::server_originated(
                    ServerEntityAction::PromoteEntityToActive,
                    descriptor,
                    Vec::new(),
                );
                entity.add_lifecycle_request(request);
                reply_rx
            })
            .collect()
    }

    /// Release every entity reference held by a departed client node.
    pub fn release_client(&self, node: ClientNodeId) -> Vec<ReplyReceiver> {
        let descriptors = self.context.client_state.references_for(node);
        tracing::debug!(node = %node, references = descriptors.len(), "releasing client");

        descriptors
            .into_iter()
            .map(|descriptor| {
                let (request, reply_rx) = ServerEntityRequest::new(
                    ServerEntityAction::ReleaseEntity,
                    ClientDescriptor::new(node, descriptor),
                    Vec::new(),
                );
                self.submit(request);
                reply_rx
            })
            .collect()
    }
}

fn check_version(
    entity: Arc<dyn ManagedEntityHandle>,
    version: u64,
) -> Result<Arc<dyn ManagedEntityHandle>, EntityError> {
    if entity.version() != version {
        return Err(EntityError::VersionMismatch {
            entity_id: entity.entity_id().clone(),
            expected: entity.version(),
            actual: version,
        });
    }
    Ok(entity)
}
