use crate::error::EntityError;
use crate::types::{ClientDescriptor, ClientNodeId, EntityDescriptor};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Channel types for outcome delivery to a request's originator.
pub type ReplySender = oneshot::Sender<RequestOutcome>;
pub type ReplyReceiver = oneshot::Receiver<RequestOutcome>;

/// Kind of work a request asks of a managed entity.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum ServerEntityAction {
    CreateEntity,
    InvokeAction,
    FetchEntity,
    ReleaseEntity,
    PromoteEntityToActive,
    DestroyEntity,
}

impl ServerEntityAction {
    /// Every action except invocation is serialized on the entity's lifecycle lane.
    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, ServerEntityAction::InvokeAction)
    }
}

impl fmt::Display for ServerEntityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerEntityAction::CreateEntity => "CREATE_ENTITY",
            ServerEntityAction::InvokeAction => "INVOKE_ACTION",
            ServerEntityAction::FetchEntity => "FETCH_ENTITY",
            ServerEntityAction::ReleaseEntity => "RELEASE_ENTITY",
            ServerEntityAction::PromoteEntityToActive => "PROMOTE_ENTITY_TO_ACTIVE",
            ServerEntityAction::DestroyEntity => "DESTROY_ENTITY",
        };
        f.write_str(name)
    }
}

/// Final result delivered to a request's originator.
#[derive(Debug)]
pub enum RequestOutcome {
    /// Success, optionally carrying response bytes.
    Completed(Option<Vec<u8>>),
    Failed(EntityError),
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Completed(_))
    }

    pub fn into_result(self) -> Result<Option<Vec<u8>>, EntityError> {
        match self {
            RequestOutcome::Completed(bytes) => Ok(bytes),
            RequestOutcome::Failed(err) => Err(err),
        }
    }
}

/// A single unit of client-originated work against one entity.
///
/// The completion sink fires exactly once. Invocation outcomes are first *held* on the
/// request and only delivered when the retirement manager retires it; lifecycle
/// requests complete directly.
#[derive(Debug)]
pub struct ServerEntityRequest {
    action: ServerEntityAction,
    source: ClientDescriptor,
    payload: Vec<u8>,
    reply_tx: Mutex<Option<ReplySender>>,
    held: Mutex<Option<RequestOutcome>>,
}

impl ServerEntityRequest {
    /// Create a request and the receiver its originator waits on.
    pub fn new(
        action: ServerEntityAction,
        source: ClientDescriptor,
        payload: Vec<u8>,
    ) -> (Arc<Self>, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        let request = Arc::new(Self {
            action,
            source,
            payload,
            reply_tx: Mutex::new(Some(tx)),
            held: Mutex::new(None),
        });
        (request, rx)
    }

    /// Create a request issued by the server itself (promotion, self-messaging).
    pub fn server_originated(
        action: ServerEntityAction,
        entity_descriptor: EntityDescriptor,
        payload: Vec<u8>,
    ) -> (Arc<Self>, ReplyReceiver) {
        Self::new(
            action,
            ClientDescriptor::new(ClientNodeId::NULL, entity_descriptor),
            payload,
        )
    }

    pub fn action(&self) -> ServerEntityAction {
        self.action
    }

    pub fn source(&self) -> &ClientDescriptor {
        &self.source
    }

    pub fn node_id(&self) -> ClientNodeId {
        self.source.node_id
    }

    pub fn entity_descriptor(&self) -> &EntityDescriptor {
        &self.source.entity_descriptor
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Complete successfully with no response bytes.
    pub fn complete(&self) {
        self.deliver(RequestOutcome::Completed(None));
    }

    /// Complete successfully with response bytes.
    pub fn complete_with(&self, bytes: Vec<u8>) {
        self.deliver(RequestOutcome::Completed(Some(bytes)));
    }

    pub fn failure(&self, error: EntityError) {
        self.deliver(RequestOutcome::Failed(error));
    }

    /// Whether the completion sink has already fired.
    pub fn is_completed(&self) -> bool {
        self.reply_tx.lock().is_none()
    }

    /// Record an invocation's outcome until the request retires.
    pub(crate) fn hold(&self, outcome: RequestOutcome) {
        let mut held = self.held.lock();
        assert!(
            held.is_none() && !self.is_completed(),
            "{} request from {} finished more than once",
            self.action,
            self.source
        );
        *held = Some(outcome);
    }

    /// Deliver the held outcome. Called once the request has retired.
    pub(crate) fn release_held(&self) {
        let outcome = self.held.lock().take();
        match outcome {
            Some(outcome) => self.deliver(outcome),
            None => panic!(
                "{} request from {} retired before its outcome was recorded",
                self.action, self.source
            ),
        }
    }

    fn deliver(&self, outcome: RequestOutcome) {
        let tx = self.reply_tx.lock().take();
        let Some(tx) = tx else {
            panic!(
                "{} request from {} completed more than once",
                self.action, self.source
            );
        };
        if tx.send(outcome).is_err() {
            tracing::debug!(
                action = %self.action,
                source = %self.source,
                "reply channel closed (originator dropped its receiver)"
            );
        }
    }
}
