use crate::config::HostConfig;
use crate::error::EntityError;
use crate::request::ServerEntityRequest;
use crate::types::{ConcurrencyKey, EntityId};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Work scheduled against a managed entity.
pub type RequestJob = BoxFuture<'static, ()>;

/// Executes request jobs under per-key ordering.
///
/// Jobs scheduled with the same non-universal key run one at a time in scheduling
/// order. Jobs on different keys, and jobs on the universal key, carry no ordering
/// guarantee relative to each other.
pub trait RequestProcessor: Send + Sync {
    /// Queue `job` for execution. `request` is the request the job works on; if the
    /// processor can no longer execute work it fails `request` with
    /// [`EntityError::ShuttingDown`] instead of running the job.
    fn schedule_request(
        &self,
        entity_id: &EntityId,
        key: ConcurrencyKey,
        request: Arc<ServerEntityRequest>,
        job: RequestJob,
    );
}

struct ScheduledJob {
    entity_id: EntityId,
    key: ConcurrencyKey,
    request: Arc<ServerEntityRequest>,
    job: RequestJob,
}

/// Lane-based [`RequestProcessor`] running on the tokio runtime.
///
/// Each lane is a spawned task draining an unbounded mailbox. Non-universal keys are
/// pinned to lane `key mod lanes`; universal work is spread round-robin.
///
/// A job that panics halts the whole processor. Every lane stops, the panicking job's request
/// and all queued work are failed with [`EntityError::ShuttingDown`], and later scheduling is
/// refused.
pub struct KeyedRequestProcessor {
    lanes: Vec<mpsc::UnboundedSender<ScheduledJob>>,
    next_universal_lane: AtomicUsize,
    halted: Arc<AtomicBool>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl KeyedRequestProcessor {
    /// Spawn the lanes. Must be called from within a tokio runtime.
    pub fn new(config: &HostConfig) -> Result<Self, EntityError> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let halted = Arc::new(AtomicBool::new(false));
        let mut lanes = Vec::with_capacity(config.processor_lanes);
        let mut handles = Vec::with_capacity(config.processor_lanes);
        for lane in 0..config.processor_lanes {
            let (tx, rx) = mpsc::unbounded_channel();
            lanes.push(tx);
            handles.push(tokio::spawn(run_lane(
                lane,
                rx,
                cancel.clone(),
                Arc::clone(&halted),
            )));
        }

        Ok(Self {
            lanes,
            next_universal_lane: AtomicUsize::new(0),
            halted,
            cancel,
            handles: Mutex::new(handles),
        })
    }

    /// Whether a job panic has halted the processor.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Stop accepting work and tell the lanes to fail whatever is still queued.
    /// A job already executing runs to completion.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// [`close`](Self::close) and wait for every lane to exit.
    pub async fn shutdown(&self) {
        self.close();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "request processor lane ended abnormally");
            }
        }
    }

    fn lane_for(&self, key: ConcurrencyKey) -> usize {
        let lanes = self.lanes.len();
        if key.is_universal() {
            self.next_universal_lane.fetch_add(1, Ordering::Relaxed) % lanes
        } else {
            i64::from(key.value()).rem_euclid(lanes as i64) as usize
        }
    }
}

impl RequestProcessor for KeyedRequestProcessor {
    fn schedule_request(
        &self,
        entity_id: &EntityId,
        key: ConcurrencyKey,
        request: Arc<ServerEntityRequest>,
        job: RequestJob,
    ) {
        if self.is_halted() || self.cancel.is_cancelled() {
            tracing::debug!(
                entity_id = %entity_id,
                key = %key,
                action = %request.action(),
                "request processor is stopped, refusing request"
            );
            request.failure(EntityError::ShuttingDown);
            return;
        }

        let lane = self.lane_for(key);
        let scheduled = ScheduledJob {
            entity_id: entity_id.clone(),
            key,
            request,
            job,
        };
        if let Err(mpsc::error::SendError(rejected)) = self.lanes[lane].send(scheduled) {
            rejected.request.failure(EntityError::ShuttingDown);
        }
    }
}

impl Drop for KeyedRequestProcessor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_lane(
    lane: usize,
    mut mailbox_rx: mpsc::UnboundedReceiver<ScheduledJob>,
    cancel: CancellationToken,
    halted: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            scheduled = mailbox_rx.recv() => {
                let Some(scheduled) = scheduled else { break };
                let ScheduledJob { entity_id, key, request, job } = scheduled;

                // Job state after a panic is never observed: the processor halts.
                if let Err(panic_payload) = AssertUnwindSafe(job).catch_unwind().await {
                    tracing::error!(
                        lane,
                        entity_id = %entity_id,
                        key = %key,
                        action = %request.action(),
                        panic = %panic_message(&*panic_payload),
                        "request job panicked, halting request processor"
                    );
                    halted.store(true, Ordering::Release);
                    cancel.cancel();
                    if !request.is_completed() {
                        request.failure(EntityError::ShuttingDown);
                    }
                    break;
                }
            }
        }
    }

    mailbox_rx.close();
    while let Some(scheduled) = mailbox_rx.recv().await {
        if !scheduled.request.is_completed() {
            scheduled.request.failure(EntityError::ShuttingDown);
        }
    }
    tracing::debug!(lane, "request processor lane stopped");
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
