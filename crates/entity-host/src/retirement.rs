//! Retirement ordering for in-flight invocations.
//!
//! An invocation may finish executing long before its originator is allowed to see the
//! result. Two kinds of edges decide when a completed invocation may *retire*:
//!
//! 1. **Key order**: invocations registered under the same concurrency key retire in
//!    registration order.
//! 2. **Explicit defer**: `defer_retirement(a, b)` holds `a` until the later message `b`
//!    has completed, and holds `b` until `a` has retired.
//!
//! Each retirement can release the next invocation in its key as well as anything waiting
//! on it through a defer edge, so one completion may retire an arbitrarily long chain. The
//! graph is walked with an explicit worklist rather than recursion.

use crate::request::{ServerEntityAction, ServerEntityRequest};
use crate::types::{ConcurrencyKey, MessageId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Arena handle for a [`LogicalSequence`].
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
struct SequenceId(u64);

/// Retirement state of one registered invocation.
struct LogicalSequence {
    request: Arc<ServerEntityRequest>,
    message: MessageId,
    /// Next invocation registered under the same key; released when this one retires.
    next_in_key: Option<SequenceId>,
    /// Invocation that deferred its retirement on this one; released when this one completes.
    defer_notify: Option<SequenceId>,
    /// Later half of a defer this invocation made; released when this one retires.
    deferred_successor: Option<SequenceId>,
    is_waiting_for_previous_in_key: bool,
    is_waiting_for_explicit_defer: bool,
    is_waiting_for_deferred_predecessor: bool,
    is_completed: bool,
}

impl LogicalSequence {
    fn new(request: Arc<ServerEntityRequest>, message: MessageId) -> Self {
        Self {
            request,
            message,
            next_in_key: None,
            defer_notify: None,
            deferred_successor: None,
            is_waiting_for_previous_in_key: false,
            is_waiting_for_explicit_defer: false,
            is_waiting_for_deferred_predecessor: false,
            is_completed: false,
        }
    }

    fn is_retirable(&self) -> bool {
        self.is_completed
            && !self.is_waiting_for_previous_in_key
            && !self.is_waiting_for_explicit_defer
            && !self.is_waiting_for_deferred_predecessor
    }
}

#[derive(Default)]
struct Inner {
    /// Every registered, not yet retired sequence. Retiring removes the record.
    sequences: HashMap<SequenceId, LogicalSequence>,
    next_sequence: u64,
    /// Registered and not yet completed.
    currently_running: HashMap<MessageId, SequenceId>,
    /// Later message of a defer → the sequence that deferred on it.
    waiting_for_deferred_registration: HashMap<MessageId, SequenceId>,
    most_recent_registered_to_key: HashMap<ConcurrencyKey, SequenceId>,
}

/// Decides which completed invocations may be signalled back to their originators.
///
/// All operations are linearized by one mutex and never block on request execution.
/// Contract violations (double registration, completing an unknown message, deferring on
/// a message that is not running) corrupt the ordering graph and panic.
#[derive(Default)]
pub struct RetirementManager {
    inner: Mutex<Inner>,
}

impl RetirementManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an invocation before it is dispatched.
    ///
    /// Chains it behind the most recent unretired invocation of the same key (unless the
    /// key is universal) and completes any defer that named `message` as its later half.
    pub fn register_with_message(
        &self,
        request: Arc<ServerEntityRequest>,
        message: MessageId,
        key: ConcurrencyKey,
    ) {
        assert_eq!(
            request.action(),
            ServerEntityAction::InvokeAction,
            "only invocations are registered for retirement"
        );

        let mut inner = self.inner.lock();
        assert!(
            !inner.currently_running.contains_key(&message),
            "{message} is already registered for retirement"
        );

        let id = SequenceId(inner.next_sequence);
        inner.next_sequence += 1;
        let mut sequence = LogicalSequence::new(request, message);

        if !key.is_universal() {
            if let Some(last) = inner.most_recent_registered_to_key.remove(&key) {
                // A retired predecessor has already left the arena.
                if let Some(last) = inner.sequences.get_mut(&last) {
                    last.next_in_key = Some(id);
                    sequence.is_waiting_for_previous_in_key = true;
                }
            }
            inner.most_recent_registered_to_key.insert(key, id);
        }

        if let Some(earlier) = inner.waiting_for_deferred_registration.remove(&message) {
            let earlier_sequence = inner.sequence_mut(earlier);
            assert!(
                earlier_sequence.is_waiting_for_explicit_defer,
                "{} deferred on {message} but is not waiting",
                earlier_sequence.message
            );
            earlier_sequence.deferred_successor = Some(id);
            sequence.defer_notify = Some(earlier);
            sequence.is_waiting_for_deferred_predecessor = true;
        }

        inner.currently_running.insert(message, id);
        inner.sequences.insert(id, sequence);
    }

    /// Hold the retirement of the running invocation `earlier` until `later` (which must
    /// register in the future) completes. `later` in turn will not retire before `earlier`.
    ///
    /// If `later` never registers, `earlier` never retires.
    pub fn defer_retirement(&self, earlier: MessageId, later: MessageId) {
        let mut inner = self.inner.lock();
        let Some(&id) = inner.currently_running.get(&earlier) else {
            panic!("cannot defer retirement of {earlier}: it is not running");
        };
        assert!(
            !inner.currently_running.contains_key(&later),
            "cannot defer retirement of {earlier} on {later}: {later} is already registered"
        );

        let sequence = inner.sequence_mut(id);
        assert!(
            !sequence.is_waiting_for_explicit_defer,
            "{earlier} has already deferred its retirement"
        );
        sequence.is_waiting_for_explicit_defer = true;

        let previous = inner.waiting_for_deferred_registration.insert(later, id);
        assert!(
            previous.is_none(),
            "a retirement is already deferred on {later}"
        );
    }

    /// Mark `completed` as finished and return every request that may now retire, in a
    /// valid retirement order.
    ///
    /// The list may contain earlier requests that were blocked on this one, and their own
    /// key successors and defer partners, transitively.
    pub fn retire_for_completion(&self, completed: MessageId) -> Vec<Arc<ServerEntityRequest>> {
        let mut inner = self.inner.lock();
        let Some(id) = inner.currently_running.remove(&completed) else {
            panic!("{completed} completed but is not registered for retirement");
        };
        inner.sequence_mut(id).is_completed = true;
        inner.traverse_dependency_graph(id)
    }

    /// Number of registered invocations that have not retired.
    pub fn pending(&self) -> usize {
        self.inner.lock().sequences.len()
    }

    /// Whether `message` is registered and has not completed.
    pub fn is_running(&self, message: MessageId) -> bool {
        self.inner.lock().currently_running.contains_key(&message)
    }
}

impl Inner {
    fn sequence_mut(&mut self, id: SequenceId) -> &mut LogicalSequence {
        match self.sequences.get_mut(&id) {
            Some(sequence) => sequence,
            None => panic!("retirement graph references retired sequence {id:?}"),
        }
    }

    fn traverse_dependency_graph(&mut self, root: SequenceId) -> Vec<Arc<ServerEntityRequest>> {
        let mut retired = Vec::new();
        let mut stack = vec![root];
        // A queued node is evaluated against its flags at pop time, so it never needs to
        // be on the stack twice.
        let mut queued = HashSet::from([root]);

        while let Some(id) = stack.pop() {
            queued.remove(&id);
            let sequence = self.sequence_mut(id);
            if !sequence.is_completed {
                continue;
            }

            let mut released = Vec::with_capacity(3);

            // Completion alone releases whoever deferred on this message.
            if let Some(target) = sequence.defer_notify.take() {
                released.push(target);
                self.sequence_mut(target).is_waiting_for_explicit_defer = false;
            }

            let sequence = self.sequence_mut(id);
            if sequence.is_retirable() {
                let next_in_key = sequence.next_in_key.take();
                let deferred_successor = sequence.deferred_successor.take();
                if let Some(done) = self.sequences.remove(&id) {
                    tracing::trace!(message_id = %done.message, "retiring");
                    retired.push(done.request);
                }
                if let Some(next) = next_in_key {
                    self.sequence_mut(next).is_waiting_for_previous_in_key = false;
                    released.push(next);
                }
                if let Some(next) = deferred_successor {
                    self.sequence_mut(next).is_waiting_for_deferred_predecessor = false;
                    released.push(next);
                }
            }

            for next in released {
                if queued.insert(next) {
                    stack.push(next);
                }
            }
        }

        retired
    }
}
