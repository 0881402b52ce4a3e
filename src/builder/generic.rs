use super::{ObjectModifier, ResourceBuilder};
use crate::client::{ApiResource, DynamicClient};
use crate::error::ClusterError;
use crate::manifest::{Manifest, ObjectMeta};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Create-or-update strategy driven purely through the dynamic client.
///
/// The target path is derived from the manifest's kind via discovery; an
/// existing object is replaced with the declared body, carrying over the
/// live `resourceVersion`.
pub struct GenericBuilder {
    client: Arc<dyn DynamicClient>,
    manifest: Manifest,
    modifiers: Vec<ObjectModifier>,
}

impl GenericBuilder {
    pub fn new(client: Arc<dyn DynamicClient>, manifest: &Manifest) -> Self {
        Self {
            client,
            manifest: manifest.clone(),
            modifiers: Vec::new(),
        }
    }

    /// Body that will be submitted, with every modifier applied.
    pub fn desired_object(&self) -> Map<String, Value> {
        let mut object = self.manifest.object().clone();
        if !self.modifiers.is_empty() {
            let mut meta = ObjectMeta::of(&mut object);
            for modifier in &self.modifiers {
                modifier(&mut meta);
            }
        }
        object
    }

    /// Writes the object and returns the resolved resource with the stored copy.
    pub(crate) fn create_or_update(&self) -> Result<(ApiResource, Value), ClusterError> {
        let resource = self.client.resolve(self.manifest.kind())?;
        let namespace = if resource.namespaced {
            Some(self.manifest.namespace())
        } else {
            None
        };
        let mut object = self.desired_object();
        let existing = self
            .client
            .get(&resource, namespace, self.manifest.name())?;
        let stored = match existing {
            None => {
                debug!(manifest = %self.manifest.reference(), "creating object");
                self.client
                    .create(&resource, namespace, &Value::Object(object))?
            }
            Some(current) => {
                if let Some(version) = current
                    .pointer("/metadata/resourceVersion")
                    .and_then(Value::as_str)
                {
                    ObjectMeta::of(&mut object).set_resource_version(version);
                }
                debug!(manifest = %self.manifest.reference(), "updating object");
                self.client
                    .update(&resource, namespace, &Value::Object(object))?
            }
        };
        Ok((resource, stored))
    }

    pub(crate) fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub(crate) fn client(&self) -> &Arc<dyn DynamicClient> {
        &self.client
    }
}

impl ResourceBuilder for GenericBuilder {
    fn with_modifier(&mut self, modifier: ObjectModifier) {
        self.modifiers.push(modifier);
    }

    fn commit(self: Box<Self>) -> Result<(), ClusterError> {
        self.create_or_update().map(|_| ())
    }
}
