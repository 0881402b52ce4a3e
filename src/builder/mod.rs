//! Per-kind application strategies and the dispatcher that selects them.

mod crd;
mod generic;

pub use crd::{crd_kind, CustomResourceDefinitionBuilder};
pub use generic::GenericBuilder;

use crate::client::DynamicClient;
use crate::error::ClusterError;
use crate::manifest::{Manifest, ObjectMeta, ResourceKindId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Mutation applied to the metadata of an object before it is submitted.
pub type ObjectModifier = Arc<dyn Fn(&mut ObjectMeta<'_>) + Send + Sync>;

/// Constructor for a kind-specific strategy.
pub type BuilderFactory =
    Arc<dyn Fn(Arc<dyn DynamicClient>, &Manifest) -> Box<dyn ResourceBuilder> + Send + Sync>;

/// Strategy applying one manifest to the cluster.
pub trait ResourceBuilder {
    /// Adds a metadata modifier; modifiers run in the order they were added.
    fn with_modifier(&mut self, modifier: ObjectModifier);

    /// Performs the cluster mutation once and reports the unclassified outcome.
    fn commit(self: Box<Self>) -> Result<(), ClusterError>;
}

/// Applies a single manifest; the seam between the sync engine and the cluster.
pub trait ManifestApplier {
    fn apply(&self, manifest: &Manifest) -> Result<(), ClusterError>;
}

impl<A: ManifestApplier + ?Sized> ManifestApplier for Arc<A> {
    fn apply(&self, manifest: &Manifest) -> Result<(), ClusterError> {
        (**self).apply(manifest)
    }
}

impl<A: ManifestApplier + ?Sized> ManifestApplier for Box<A> {
    fn apply(&self, manifest: &Manifest) -> Result<(), ClusterError> {
        (**self).apply(manifest)
    }
}

/// Registry from resource kind to its strategy constructor.
#[derive(Clone, Default)]
pub struct ResourceMapper {
    factories: HashMap<ResourceKindId, BuilderFactory>,
}

impl fmt::Debug for ResourceMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.factories.keys().map(ToString::to_string).collect();
        kinds.sort();
        f.debug_struct("ResourceMapper").field("kinds", &kinds).finish()
    }
}

impl ResourceMapper {
    /// Creates an empty mapper; unregistered kinds use [`GenericBuilder`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Mapper with the built-in kind-specific builders registered.
    pub fn with_defaults() -> Self {
        let mut mapper = Self::new();
        mapper.register(crd_kind(), CustomResourceDefinitionBuilder::factory());
        mapper
    }

    /// Registers `factory` for `kind`, replacing any previous registration.
    pub fn register(&mut self, kind: ResourceKindId, factory: BuilderFactory) -> &mut Self {
        self.factories.insert(kind, factory);
        self
    }

    /// Copies every registration of `other` into this mapper.
    pub fn merge(&mut self, other: &ResourceMapper) {
        for (kind, factory) in &other.factories {
            self.factories.insert(kind.clone(), factory.clone());
        }
    }

    pub fn get(&self, kind: &ResourceKindId) -> Option<&BuilderFactory> {
        self.factories.get(kind)
    }

    pub fn contains(&self, kind: &ResourceKindId) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// Dispatches manifests to registered strategies, falling back to the generic builder.
#[derive(Clone)]
pub struct ClusterApplier {
    client: Arc<dyn DynamicClient>,
    mapper: ResourceMapper,
    modifiers: Vec<ObjectModifier>,
}

impl fmt::Debug for ClusterApplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterApplier")
            .field("mapper", &self.mapper)
            .field("modifiers", &self.modifiers.len())
            .finish()
    }
}

impl ClusterApplier {
    pub fn new(client: Arc<dyn DynamicClient>, mapper: ResourceMapper) -> Self {
        Self {
            client,
            mapper,
            modifiers: Vec::new(),
        }
    }

    /// Appends a modifier applied to every submitted object.
    pub fn with_modifier(mut self, modifier: ObjectModifier) -> Self {
        self.modifiers.push(modifier);
        self
    }

    pub fn mapper(&self) -> &ResourceMapper {
        &self.mapper
    }

    fn builder_for(&self, manifest: &Manifest) -> Box<dyn ResourceBuilder> {
        match self.mapper.get(manifest.kind()) {
            Some(factory) => {
                debug!(kind = %manifest.kind(), "using registered builder");
                factory(self.client.clone(), manifest)
            }
            None => Box::new(GenericBuilder::new(self.client.clone(), manifest)),
        }
    }
}

impl ManifestApplier for ClusterApplier {
    fn apply(&self, manifest: &Manifest) -> Result<(), ClusterError> {
        let mut builder = self.builder_for(manifest);
        for modifier in &self.modifiers {
            builder.with_modifier(modifier.clone());
        }
        builder.commit()
    }
}

/// Modifier setting a label on every submitted object.
pub fn label_modifier(key: impl Into<String>, value: impl Into<String>) -> ObjectModifier {
    let key = key.into();
    let value = value.into();
    Arc::new(move |meta: &mut ObjectMeta<'_>| {
        let mut labels = meta.labels();
        labels.insert(key.clone(), value.clone());
        meta.set_labels(labels);
    })
}

/// Modifier setting an annotation on every submitted object.
pub fn annotation_modifier(key: impl Into<String>, value: impl Into<String>) -> ObjectModifier {
    let key = key.into();
    let value = value.into();
    Arc::new(move |meta: &mut ObjectMeta<'_>| {
        let mut annotations = meta.annotations();
        annotations.insert(key.clone(), value.clone());
        meta.set_annotations(annotations);
    })
}
