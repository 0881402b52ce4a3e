//! Manifest application engine for cluster release payloads.
//!
//! A [`SyncEngine`] walks a [`Payload`] in order, applying each manifest
//! through a [`ManifestApplier`] with bounded backoff. Failures that a
//! manifest opts into through its requeue annotation, or that a strategy
//! reports as retry-later, are deferred to one retry pass at the end.

pub mod app;
pub mod backoff;
pub mod builder;
pub mod cancel;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod payload;
pub mod requeue;
pub mod status;

pub use backoff::{BackoffError, BackoffPolicy, BackoffSchedule};
pub use builder::{
    annotation_modifier, crd_kind, label_modifier, BuilderFactory, ClusterApplier,
    CustomResourceDefinitionBuilder, GenericBuilder, ManifestApplier, ObjectModifier,
    ResourceBuilder, ResourceMapper,
};
pub use cancel::{CancelToken, Cancelled};
pub use client::{
    ApiResource, ClusterAction, ClusterConfig, ClusterConfigError, ClusterVerb, DynamicClient,
    HttpDynamicClient, InMemoryCluster, IN_CLUSTER_SERVICE_ACCOUNT_DIR,
};
pub use config::{BackoffSettings, ClusterSettings, ConfigError, LogSettings, SyncConfig};
pub use engine::{SyncEngine, SyncSummary};
pub use error::{ApplyError, CauseKind, Classified, ClusterError, SyncError};
pub use logging::{JournalLimits, JournalStatusSink, LogLevel, LoggingError, StatusJournal};
pub use manifest::{Manifest, ManifestError, ManifestRef, ObjectMeta, ResourceKindId};
pub use payload::{load_manifest_file, load_payload_dir, Payload, PayloadError};
pub use requeue::{
    unknown_matchers, RequeuePolicy, DEFAULT_REQUEUE_ANNOTATION_KEY, KNOWN_REQUEUE_MATCHERS,
};
pub use status::{
    EngineStatus, NoopStatusSink, QueueStatusSink, StatusSink, SyncPhase, STATUS_QUEUE_CAPACITY,
};
