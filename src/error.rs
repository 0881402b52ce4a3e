use crate::cancel::Cancelled;
use crate::manifest::ManifestRef;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Classification of an apply failure, fixed where the cause is first observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CauseKind {
    /// The addressed API resource type is not served by the cluster.
    NoMatch,
    /// The named object or its namespace does not exist.
    NotFound,
    /// The strategy knows the operation will succeed on a later cycle.
    RetryLater,
    Other,
}

impl CauseKind {
    /// Requeue matcher name for this cause, when one exists.
    pub fn matcher_name(self) -> Option<&'static str> {
        match self {
            CauseKind::NoMatch => Some("NoMatch"),
            CauseKind::NotFound => Some("NotFound"),
            CauseKind::RetryLater | CauseKind::Other => None,
        }
    }
}

impl fmt::Display for CauseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CauseKind::NoMatch => "NoMatch",
            CauseKind::NotFound => "NotFound",
            CauseKind::RetryLater => "RetryLater",
            CauseKind::Other => "Other",
        };
        f.write_str(label)
    }
}

/// Failure reported by the cluster API, discovery, or a resource builder.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{message}")]
pub struct ClusterError {
    kind: CauseKind,
    message: String,
    status_code: Option<u16>,
}

impl ClusterError {
    pub fn new(kind: CauseKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn no_match(message: impl Into<String>) -> Self {
        Self::new(CauseKind::NoMatch, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CauseKind::NotFound, message)
    }

    pub fn retry_later(message: impl Into<String>) -> Self {
        Self::new(CauseKind::RetryLater, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(CauseKind::Other, message)
    }

    /// Attaches the HTTP status code returned by the API server.
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn kind(&self) -> CauseKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }
}

/// Final error for one manifest once its attempt budget is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("could not apply {manifest} after {attempts} attempt(s): {cause}")]
pub struct ApplyError {
    manifest: ManifestRef,
    attempts: u32,
    #[source]
    cause: ClusterError,
}

impl ApplyError {
    pub fn new(manifest: ManifestRef, attempts: u32, cause: ClusterError) -> Self {
        Self {
            manifest,
            attempts,
            cause,
        }
    }

    pub fn manifest(&self) -> &ManifestRef {
        &self.manifest
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn cause(&self) -> &ClusterError {
        &self.cause
    }
}

/// Errors whose cause kind can be read without walking a wrapper chain.
pub trait Classified {
    fn cause_kind(&self) -> CauseKind;
}

impl Classified for ClusterError {
    fn cause_kind(&self) -> CauseKind {
        self.kind
    }
}

impl Classified for ApplyError {
    fn cause_kind(&self) -> CauseKind {
        self.cause.kind
    }
}

/// Outcome of a failed `apply_payload` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("sync cancelled")]
    Cancelled,
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

impl From<Cancelled> for SyncError {
    fn from(_: Cancelled) -> Self {
        SyncError::Cancelled
    }
}

impl SyncError {
    /// Returns the apply error when the invocation aborted on a manifest.
    pub fn apply_error(&self) -> Option<&ApplyError> {
        match self {
            SyncError::Apply(err) => Some(err),
            SyncError::Cancelled => None,
        }
    }
}
