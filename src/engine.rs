use crate::backoff::BackoffPolicy;
use crate::builder::ManifestApplier;
use crate::cancel::CancelToken;
use crate::error::{ApplyError, SyncError};
use crate::manifest::Manifest;
use crate::payload::Payload;
use crate::requeue::RequeuePolicy;
use crate::status::{EngineStatus, NoopStatusSink, StatusSink, SyncPhase};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Totals of a successful sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub attempts: u64,
    pub applied: usize,
    /// Manifests that failed the lenient pass and succeeded when retried.
    pub recovered: usize,
}

/// Applies payloads manifest by manifest, deferring opted-in failures to a
/// single retry pass.
///
/// Manifests are applied strictly in payload order. Each manifest gets up to
/// `backoff.max_attempts` attempts; when they are exhausted the final error
/// either defers the manifest (per [`RequeuePolicy`]) or aborts the sync.
/// Deferred manifests are retried once, in the order they were deferred,
/// after the whole payload has been walked; a second failure is fatal.
///
/// The engine keeps no state between invocations and must not be driven
/// concurrently for the same target.
pub struct SyncEngine<A> {
    applier: A,
    backoff: BackoffPolicy,
    requeue: RequeuePolicy,
    sink: Arc<dyn StatusSink>,
}

impl<A: ManifestApplier> SyncEngine<A> {
    pub fn new(applier: A) -> Self {
        Self {
            applier,
            backoff: BackoffPolicy::default(),
            requeue: RequeuePolicy::default(),
            sink: Arc::new(NoopStatusSink),
        }
    }

    /// Sets the retry schedule. A policy failing validation is clamped into
    /// range so every delay stays bounded.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = match backoff.validate() {
            Ok(()) => backoff,
            Err(err) => {
                warn!(error = %err, "clamping invalid backoff policy");
                backoff.clamped()
            }
        };
        self
    }

    pub fn with_requeue_policy(mut self, requeue: RequeuePolicy) -> Self {
        self.requeue = requeue;
        self
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn requeue_policy(&self) -> &RequeuePolicy {
        &self.requeue
    }

    pub fn applier(&self) -> &A {
        &self.applier
    }

    /// Applies every manifest of `payload`, returning the first fatal error.
    pub fn apply_payload(
        &self,
        payload: &Payload,
        cancel: &CancelToken,
    ) -> Result<SyncSummary, SyncError> {
        let mut status = EngineStatus::new(payload);
        info!(
            source = %payload.source_id(),
            version = %payload.version(),
            manifests = payload.len(),
            "starting payload sync"
        );
        self.sink.report(&status);
        let result = self.run(payload, cancel, &mut status);
        match &result {
            Ok(()) => {
                status.phase = SyncPhase::Completed;
                status.current_manifest = None;
                info!(
                    attempts = status.attempted,
                    applied = status.succeeded,
                    recovered = status.deferred,
                    "payload sync completed"
                );
            }
            Err(SyncError::Cancelled) => {
                status.phase = SyncPhase::Cancelled;
                warn!(attempts = status.attempted, "payload sync cancelled");
            }
            Err(SyncError::Apply(err)) => {
                status.phase = SyncPhase::Failed;
                status.last_error = Some(err.clone());
                warn!(manifest = %err.manifest(), error = %err, "payload sync failed");
            }
        }
        self.sink.report(&status);
        result.map(|()| SyncSummary {
            attempts: status.attempted,
            applied: status.succeeded,
            recovered: status.deferred,
        })
    }

    fn run(
        &self,
        payload: &Payload,
        cancel: &CancelToken,
        status: &mut EngineStatus,
    ) -> Result<(), SyncError> {
        let mut deferred: Vec<(&Manifest, ApplyError)> = Vec::new();
        for manifest in payload.manifests() {
            match self.apply_with_backoff(manifest, cancel, status) {
                Ok(()) => self.record_success(status),
                Err(SyncError::Apply(err)) if self.requeue.should_requeue(Some(&err), manifest) => {
                    warn!(
                        manifest = %err.manifest(),
                        cause = %err.cause().kind(),
                        error = %err.cause(),
                        "deferring manifest to the retry pass"
                    );
                    status.deferred += 1;
                    status.last_error = Some(err.clone());
                    self.sink.report(status);
                    deferred.push((manifest, err));
                }
                Err(err) => return Err(err),
            }
        }
        if deferred.is_empty() {
            return Ok(());
        }
        status.phase = SyncPhase::Deferred;
        info!(deferred = deferred.len(), "retrying deferred manifests");
        for (manifest, previous) in deferred {
            debug!(manifest = %previous.manifest(), previous = %previous.cause(), "retrying");
            self.apply_with_backoff(manifest, cancel, status)?;
            self.record_success(status);
        }
        Ok(())
    }

    /// Runs the bounded attempt loop for one manifest.
    fn apply_with_backoff(
        &self,
        manifest: &Manifest,
        cancel: &CancelToken,
        status: &mut EngineStatus,
    ) -> Result<(), SyncError> {
        let reference = manifest.reference();
        let mut schedule = self.backoff.schedule();
        let mut attempt = 0u32;
        loop {
            cancel.check()?;
            attempt += 1;
            status.attempted += 1;
            status.current_manifest = Some(reference.clone());
            self.sink.report(status);
            let cause = match self.applier.apply(manifest) {
                Ok(()) => {
                    debug!(manifest = %reference, attempt, "applied");
                    return Ok(());
                }
                Err(cause) => cause,
            };
            debug!(
                manifest = %reference,
                attempt,
                cause = %cause.kind(),
                error = %cause,
                "apply attempt failed"
            );
            let err = ApplyError::new(reference.clone(), attempt, cause);
            status.last_error = Some(err.clone());
            self.sink.report(status);
            match schedule.next() {
                Some(delay) => cancel.sleep(delay)?,
                None => return Err(err.into()),
            }
        }
    }

    fn record_success(&self, status: &mut EngineStatus) {
        status.succeeded += 1;
        self.sink.report(status);
    }
}
