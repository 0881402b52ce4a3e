//! Schema-agnostic access to the cluster API.
//!
//! Builders talk to the cluster only through [`DynamicClient`]; the HTTP
//! implementation targets the Kubernetes REST surface while
//! [`InMemoryCluster`] keeps everything in-process for dry runs.

mod config;
mod http;
mod memory;

pub use config::{ClusterConfig, ClusterConfigError, IN_CLUSTER_SERVICE_ACCOUNT_DIR};
pub use http::HttpDynamicClient;
pub use memory::{ClusterAction, ClusterVerb, InMemoryCluster};

use crate::error::ClusterError;
use crate::manifest::ResourceKindId;
use serde_json::Value;

/// Served API resource resolved from a kind triple through discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApiResource {
    pub kind: ResourceKindId,
    /// Lower-case plural resource name (`deployments`).
    pub plural: String,
    pub namespaced: bool,
}

impl ApiResource {
    pub fn new(kind: ResourceKindId, plural: impl Into<String>, namespaced: bool) -> Self {
        Self {
            kind,
            plural: plural.into(),
            namespaced,
        }
    }

    /// `/api/v1` for the core group, `/apis/{group}/{version}` otherwise.
    pub fn group_version_path(&self) -> String {
        group_version_path(&self.kind)
    }

    /// Collection path, scoped to `namespace` when the resource is namespaced.
    pub fn collection_path(&self, namespace: Option<&str>) -> String {
        match namespace.filter(|ns| self.namespaced && !ns.is_empty()) {
            Some(namespace) => format!(
                "{}/namespaces/{}/{}",
                self.group_version_path(),
                namespace,
                self.plural
            ),
            None => format!("{}/{}", self.group_version_path(), self.plural),
        }
    }

    /// Path of a single named object.
    pub fn object_path(&self, namespace: Option<&str>, name: &str) -> String {
        format!("{}/{}", self.collection_path(namespace), name)
    }
}

pub(crate) fn group_version_path(kind: &ResourceKindId) -> String {
    if kind.group.is_empty() {
        format!("/api/{}", kind.version)
    } else {
        format!("/apis/{}/{}", kind.group, kind.version)
    }
}

/// Dynamic cluster client used by resource builders.
///
/// Implementations classify failures at the source: unknown resource types
/// surface as `NoMatch`, missing objects or namespaces on write as `NotFound`.
pub trait DynamicClient: Send + Sync {
    /// Maps a kind triple to the served resource.
    fn resolve(&self, kind: &ResourceKindId) -> Result<ApiResource, ClusterError>;

    /// Reads an object, returning `None` when it does not exist.
    fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, ClusterError>;

    fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &Value,
    ) -> Result<Value, ClusterError>;

    fn update(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &Value,
    ) -> Result<Value, ClusterError>;
}
