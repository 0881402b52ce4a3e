use crate::error::ApplyError;
use crate::manifest::ManifestRef;
use crate::payload::Payload;
use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use std::sync::Arc;

/// Default number of snapshots retained by [`QueueStatusSink`].
pub const STATUS_QUEUE_CAPACITY: usize = 64;

/// Stage of a running sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncPhase {
    /// First pass over the payload; opted-in failures are deferred.
    Lenient,
    /// Single retry cycle over deferred manifests.
    Deferred,
    Completed,
    Failed,
    Cancelled,
}

/// Progress record of one sync invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub source_id: String,
    pub version: String,
    pub total: usize,
    /// Apply attempts made so far, including failed retries.
    pub attempted: u64,
    /// Manifests that reached terminal success.
    pub succeeded: usize,
    /// Manifests deferred by the lenient pass.
    pub deferred: usize,
    pub phase: SyncPhase,
    pub current_manifest: Option<ManifestRef>,
    pub last_error: Option<ApplyError>,
}

impl EngineStatus {
    pub fn new(payload: &Payload) -> Self {
        Self {
            source_id: payload.source_id().to_string(),
            version: payload.version().to_string(),
            total: payload.len(),
            attempted: 0,
            succeeded: 0,
            deferred: 0,
            phase: SyncPhase::Lenient,
            current_manifest: None,
            last_error: None,
        }
    }

    /// Share of manifests applied, in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.succeeded as f64 / self.total as f64
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.phase,
            SyncPhase::Completed | SyncPhase::Failed | SyncPhase::Cancelled
        )
    }
}

/// Receiver of progress snapshots; implementations must return promptly.
pub trait StatusSink: Send + Sync {
    fn report(&self, status: &EngineStatus);
}

impl<F> StatusSink for F
where
    F: Fn(&EngineStatus) + Send + Sync,
{
    fn report(&self, status: &EngineStatus) {
        self(status)
    }
}

/// Sink discarding every snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusSink;

impl StatusSink for NoopStatusSink {
    fn report(&self, _status: &EngineStatus) {}
}

/// Bounded lock-free buffer of snapshots; when full the oldest is dropped.
#[derive(Debug, Clone)]
pub struct QueueStatusSink {
    queue: Arc<ArrayQueue<EngineStatus>>,
}

impl Default for QueueStatusSink {
    fn default() -> Self {
        Self::new(STATUS_QUEUE_CAPACITY)
    }
}

impl QueueStatusSink {
    /// Creates a sink retaining at most `capacity` snapshots (minimum one).
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Removes and returns every buffered snapshot, oldest first.
    pub fn drain(&self) -> Vec<EngineStatus> {
        let mut drained = Vec::with_capacity(self.queue.len());
        while let Some(status) = self.queue.pop() {
            drained.push(status);
        }
        drained
    }

    /// Returns the most recent snapshot, discarding older ones.
    pub fn latest(&self) -> Option<EngineStatus> {
        self.drain().pop()
    }
}

impl StatusSink for QueueStatusSink {
    fn report(&self, status: &EngineStatus) {
        self.queue.force_push(status.clone());
    }
}
