use super::{BuilderFactory, GenericBuilder, ObjectModifier, ResourceBuilder};
use crate::client::DynamicClient;
use crate::error::ClusterError;
use crate::manifest::{Manifest, ResourceKindId};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Kind handled by [`CustomResourceDefinitionBuilder`].
pub fn crd_kind() -> ResourceKindId {
    ResourceKindId::new("apiextensions.k8s.io", "v1", "CustomResourceDefinition")
}

/// Applies a CustomResourceDefinition and waits for the API server to serve it.
///
/// Until the `Established` condition reports `True` the commit fails with a
/// retry-later cause, so the definition is revisited in the deferred pass
/// after the rest of the payload has been applied.
pub struct CustomResourceDefinitionBuilder {
    inner: GenericBuilder,
}

impl CustomResourceDefinitionBuilder {
    pub fn new(client: Arc<dyn DynamicClient>, manifest: &Manifest) -> Self {
        Self {
            inner: GenericBuilder::new(client, manifest),
        }
    }

    pub fn factory() -> BuilderFactory {
        Arc::new(|client, manifest| Box::new(Self::new(client, manifest)))
    }
}

impl ResourceBuilder for CustomResourceDefinitionBuilder {
    fn with_modifier(&mut self, modifier: ObjectModifier) {
        self.inner.with_modifier(modifier);
    }

    fn commit(self: Box<Self>) -> Result<(), ClusterError> {
        let (resource, stored) = self.inner.create_or_update()?;
        if established(&stored) {
            return Ok(());
        }
        let manifest = self.inner.manifest();
        let current = self
            .inner
            .client()
            .get(&resource, None, manifest.name())?;
        if current.as_ref().is_some_and(established) {
            return Ok(());
        }
        debug!(manifest = %manifest.reference(), "definition not yet established");
        Err(ClusterError::retry_later(format!(
            "CustomResourceDefinition {} is not yet established",
            manifest.name()
        )))
    }
}

fn established(object: &Value) -> bool {
    object
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|condition| {
                condition.get("type").and_then(Value::as_str) == Some("Established")
                    && condition.get("status").and_then(Value::as_str) == Some("True")
            })
        })
}
