use super::{ApiResource, DynamicClient};
use crate::error::ClusterError;
use crate::manifest::{ObjectMeta, ResourceKindId};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Verb recorded for every call made against an [`InMemoryCluster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterVerb {
    Get,
    Create,
    Update,
}

/// One call observed by the in-memory cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterAction {
    pub verb: ClusterVerb,
    pub kind: ResourceKindId,
    pub namespace: String,
    pub name: String,
    /// Submitted object for create and update calls.
    pub object: Option<Value>,
}

type ObjectKey = (ResourceKindId, String, String);

#[derive(Debug, Default)]
struct State {
    kinds: HashMap<ResourceKindId, ApiResource>,
    objects: BTreeMap<ObjectKey, Value>,
    namespaces: BTreeSet<String>,
    write_errors: HashMap<ObjectKey, ClusterError>,
    actions: Vec<ClusterAction>,
    resource_version: u64,
}

/// In-process cluster used for dry runs and tests.
///
/// Only registered kinds are served; everything else resolves to `NoMatch`.
/// Namespaced writes require the namespace to exist, either pre-seeded or
/// created through a `v1/Namespace` object. Stored
/// `CustomResourceDefinition`s register the kind they define and are marked
/// established immediately.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<State>,
}

const CORE_KINDS: &[(&str, &str, &str, &str, bool)] = &[
    ("", "v1", "Namespace", "namespaces", false),
    ("", "v1", "ConfigMap", "configmaps", true),
    ("", "v1", "Secret", "secrets", true),
    ("", "v1", "Service", "services", true),
    ("", "v1", "ServiceAccount", "serviceaccounts", true),
    ("apps", "v1", "Deployment", "deployments", true),
    ("apps", "v1", "DaemonSet", "daemonsets", true),
    ("batch", "v1", "Job", "jobs", true),
    ("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", false),
    ("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding", "clusterrolebindings", false),
    ("rbac.authorization.k8s.io", "v1", "Role", "roles", true),
    ("rbac.authorization.k8s.io", "v1", "RoleBinding", "rolebindings", true),
    (
        "apiextensions.k8s.io",
        "v1",
        "CustomResourceDefinition",
        "customresourcedefinitions",
        false,
    ),
];

impl InMemoryCluster {
    /// Empty cluster with only the `default` namespace.
    pub fn new() -> Self {
        let cluster = Self::default();
        cluster.add_namespace("default");
        cluster
    }

    /// Cluster serving the common built-in kinds.
    pub fn with_builtin_kinds() -> Self {
        let cluster = Self::new();
        for (group, version, kind, plural, namespaced) in CORE_KINDS {
            cluster.register_kind(ApiResource::new(
                ResourceKindId::new(*group, *version, *kind),
                *plural,
                *namespaced,
            ));
        }
        cluster
    }

    pub fn register_kind(&self, resource: ApiResource) {
        self.lock().kinds.insert(resource.kind.clone(), resource);
    }

    pub fn add_namespace(&self, namespace: impl Into<String>) {
        self.lock().namespaces.insert(namespace.into());
    }

    /// Makes every create or update of the named object fail with `err`.
    pub fn inject_write_error(
        &self,
        kind: ResourceKindId,
        namespace: impl Into<String>,
        name: impl Into<String>,
        err: ClusterError,
    ) {
        self.lock()
            .write_errors
            .insert((kind, namespace.into(), name.into()), err);
    }

    pub fn clear_write_errors(&self) {
        self.lock().write_errors.clear();
    }

    /// Calls observed so far, in order.
    pub fn actions(&self) -> Vec<ClusterAction> {
        self.lock().actions.clone()
    }

    /// Stored copy of an object.
    pub fn object(&self, kind: &ResourceKindId, namespace: &str, name: &str) -> Option<Value> {
        self.lock()
            .objects
            .get(&(kind.clone(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Replaces the `status` block of a stored object.
    pub fn set_status(&self, kind: &ResourceKindId, namespace: &str, name: &str, status: Value) {
        let mut state = self.lock();
        let key = (kind.clone(), namespace.to_string(), name.to_string());
        if let Some(Value::Object(object)) = state.objects.get_mut(&key) {
            object.insert("status".into(), status);
        }
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    fn record(&mut self, verb: ClusterVerb, key: &ObjectKey, object: Option<&Value>) {
        self.actions.push(ClusterAction {
            verb,
            kind: key.0.clone(),
            namespace: key.1.clone(),
            name: key.2.clone(),
            object: object.cloned(),
        });
    }

    fn served(&self, resource: &ApiResource) -> Result<(), ClusterError> {
        if self.kinds.contains_key(&resource.kind) {
            Ok(())
        } else {
            Err(no_match(&resource.kind))
        }
    }

    fn check_namespace(&self, resource: &ApiResource, namespace: &str) -> Result<(), ClusterError> {
        if !resource.namespaced || self.namespaces.contains(namespace) {
            return Ok(());
        }
        Err(ClusterError::not_found(format!("namespaces {namespace:?} not found")).with_status(404))
    }

    fn store(&mut self, resource: &ApiResource, key: ObjectKey, object: &Value) -> Value {
        self.resource_version += 1;
        let mut stored = object.clone();
        if let Value::Object(map) = &mut stored {
            ObjectMeta::of(map).set_resource_version(self.resource_version.to_string());
        }
        if resource.kind == ResourceKindId::new("", "v1", "Namespace") {
            self.namespaces.insert(key.2.clone());
        }
        if resource.kind.group == "apiextensions.k8s.io"
            && resource.kind.kind == "CustomResourceDefinition"
        {
            self.register_definition(&mut stored);
        }
        self.objects.insert(key, stored.clone());
        stored
    }

    fn register_definition(&mut self, definition: &mut Value) {
        let spec = definition.get("spec").cloned().unwrap_or(Value::Null);
        let group = spec.get("group").and_then(Value::as_str).unwrap_or_default();
        let kind = spec
            .pointer("/names/kind")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let plural = spec
            .pointer("/names/plural")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let namespaced = spec.get("scope").and_then(Value::as_str) == Some("Namespaced");
        let versions = spec
            .get("versions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if group.is_empty() || kind.is_empty() || plural.is_empty() {
            return;
        }
        for version in versions
            .iter()
            .filter_map(|version| version.get("name").and_then(Value::as_str))
        {
            let id = ResourceKindId::new(group, version, kind);
            self.kinds
                .insert(id.clone(), ApiResource::new(id, plural, namespaced));
        }
        if let Value::Object(map) = definition {
            map.insert(
                "status".into(),
                json!({"conditions": [{"type": "Established", "status": "True"}]}),
            );
        }
    }

    fn injected(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        match self.write_errors.get(key) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn no_match(kind: &ResourceKindId) -> ClusterError {
    ClusterError::no_match(format!(
        "no matches for kind {:?} in version {:?}",
        kind.kind,
        kind.api_version()
    ))
}

fn object_key(resource: &ApiResource, namespace: Option<&str>, name: &str) -> ObjectKey {
    let namespace = if resource.namespaced {
        namespace.unwrap_or_default().to_string()
    } else {
        String::new()
    };
    (resource.kind.clone(), namespace, name.to_string())
}

fn object_name(object: &Value) -> Result<&str, ClusterError> {
    object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .ok_or_else(|| ClusterError::other("object has no metadata.name"))
}

impl DynamicClient for InMemoryCluster {
    fn resolve(&self, kind: &ResourceKindId) -> Result<ApiResource, ClusterError> {
        self.lock()
            .kinds
            .get(kind)
            .cloned()
            .ok_or_else(|| no_match(kind))
    }

    fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, ClusterError> {
        let mut state = self.lock();
        let key = object_key(resource, namespace, name);
        state.record(ClusterVerb::Get, &key, None);
        state.served(resource)?;
        Ok(state.objects.get(&key).cloned())
    }

    fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &Value,
    ) -> Result<Value, ClusterError> {
        let mut state = self.lock();
        let key = object_key(resource, namespace, object_name(object)?);
        state.record(ClusterVerb::Create, &key, Some(object));
        state.served(resource)?;
        state.injected(&key)?;
        state.check_namespace(resource, &key.1)?;
        if state.objects.contains_key(&key) {
            return Err(ClusterError::other(format!(
                "{} {:?} already exists",
                resource.plural, key.2
            ))
            .with_status(409));
        }
        Ok(state.store(resource, key, object))
    }

    fn update(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &Value,
    ) -> Result<Value, ClusterError> {
        let mut state = self.lock();
        let key = object_key(resource, namespace, object_name(object)?);
        state.record(ClusterVerb::Update, &key, Some(object));
        state.served(resource)?;
        state.injected(&key)?;
        state.check_namespace(resource, &key.1)?;
        let Some(current) = state.objects.get(&key) else {
            return Err(ClusterError::not_found(format!(
                "{} {:?} not found",
                resource.plural, key.2
            ))
            .with_status(404));
        };
        let current_version = current.pointer("/metadata/resourceVersion").cloned();
        let submitted_version = object.pointer("/metadata/resourceVersion").cloned();
        if submitted_version.is_some() && submitted_version != current_version {
            return Err(ClusterError::other(format!(
                "{} {:?} was modified concurrently",
                resource.plural, key.2
            ))
            .with_status(409));
        }
        Ok(state.store(resource, key, object))
    }
}
