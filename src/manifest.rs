use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// API resource type addressed by a manifest (`group`, `version`, `kind`).
///
/// The core API group is represented by an empty `group`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceKindId {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKindId {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Splits an `apiVersion` (`v1`, `apps/v1`) and pairs it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Result<Self, ManifestError> {
        let api_version = api_version.trim();
        if api_version.is_empty() {
            return Err(ManifestError::MissingField("apiVersion"));
        }
        if kind.trim().is_empty() {
            return Err(ManifestError::MissingField("kind"));
        }
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        let empty_group = group.is_empty() && api_version.contains('/');
        if version.is_empty() || version.contains('/') || empty_group {
            return Err(ManifestError::InvalidApiVersion(api_version.to_string()));
        }
        Ok(Self::new(group, version, kind.trim()))
    }

    /// Returns the `apiVersion` string for this kind.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceKindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Identity of a manifest used in errors, status and logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ManifestRef {
    pub kind: ResourceKindId,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(
                f,
                "{} {} ({})",
                self.kind.kind,
                self.name,
                self.kind.api_version()
            )
        } else {
            write!(
                f,
                "{} {}/{} ({})",
                self.kind.kind,
                self.namespace,
                self.name,
                self.kind.api_version()
            )
        }
    }
}

/// One declared desired resource. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    kind: ResourceKindId,
    namespace: String,
    name: String,
    annotations: BTreeMap<String, String>,
    object: Map<String, Value>,
}

impl Manifest {
    /// Builds a manifest from a decoded object body.
    pub fn from_value(value: Value) -> Result<Self, ManifestError> {
        let object = match value {
            Value::Object(object) => object,
            _ => return Err(ManifestError::NotAnObject),
        };
        let api_version = string_field(&object, "apiVersion")?;
        let kind = string_field(&object, "kind")?;
        let kind = ResourceKindId::from_api_version(api_version, kind)?;
        let metadata = match object.get("metadata") {
            Some(Value::Object(metadata)) => metadata,
            Some(_) => return Err(ManifestError::InvalidMetadata("metadata must be an object")),
            None => return Err(ManifestError::MissingField("metadata.name")),
        };
        let name = match metadata.get("name") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            _ => return Err(ManifestError::MissingField("metadata.name")),
        };
        let namespace = match metadata.get("namespace") {
            Some(Value::String(namespace)) => namespace.clone(),
            None | Some(Value::Null) => String::new(),
            Some(_) => {
                return Err(ManifestError::InvalidMetadata(
                    "metadata.namespace must be a string",
                ))
            }
        };
        let annotations = match metadata.get("annotations") {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(key, value)| match value {
                    Value::String(value) => Ok((key.clone(), value.clone())),
                    _ => Err(ManifestError::InvalidMetadata(
                        "annotation values must be strings",
                    )),
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?,
            None | Some(Value::Null) => BTreeMap::new(),
            Some(_) => {
                return Err(ManifestError::InvalidMetadata(
                    "metadata.annotations must be an object",
                ))
            }
        };
        Ok(Self {
            kind,
            namespace,
            name,
            annotations,
            object,
        })
    }

    /// Decodes a single JSON document.
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        let value: Value = serde_json::from_str(json).map_err(ManifestError::Decode)?;
        Self::from_value(value)
    }

    pub fn kind(&self) -> &ResourceKindId {
        &self.kind
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    /// Object body as declared in the payload.
    pub fn object(&self) -> &Map<String, Value> {
        &self.object
    }

    /// Identity of this manifest.
    pub fn reference(&self) -> ManifestRef {
        ManifestRef {
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

fn string_field<'a>(
    object: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ManifestError> {
    match object.get(field) {
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(value.as_str()),
        _ => Err(ManifestError::MissingField(field)),
    }
}

/// Mutable view over the `metadata` block of an object about to be submitted.
#[derive(Debug)]
pub struct ObjectMeta<'a> {
    metadata: &'a mut Map<String, Value>,
}

impl<'a> ObjectMeta<'a> {
    /// Borrows the metadata of `object`, creating an empty block when absent.
    pub fn of(object: &'a mut Map<String, Value>) -> Self {
        let entry = object
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let metadata = match entry {
            Value::Object(metadata) => metadata,
            _ => unreachable!("metadata normalized to an object above"),
        };
        Self { metadata }
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata.get("name").and_then(Value::as_str)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata.get("namespace").and_then(Value::as_str)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        string_map(self.metadata.get("labels"))
    }

    pub fn set_labels(&mut self, labels: BTreeMap<String, String>) {
        self.set_string_map("labels", labels);
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        string_map(self.metadata.get("annotations"))
    }

    pub fn set_annotations(&mut self, annotations: BTreeMap<String, String>) {
        self.set_string_map("annotations", annotations);
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.get("resourceVersion").and_then(Value::as_str)
    }

    pub fn set_resource_version(&mut self, resource_version: impl Into<String>) {
        self.metadata.insert(
            "resourceVersion".into(),
            Value::String(resource_version.into()),
        );
    }

    fn set_string_map(&mut self, key: &str, values: BTreeMap<String, String>) {
        let map: Map<String, Value> = values
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        self.metadata.insert(key.to_string(), Value::Object(map));
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(key, value)| value.as_str().map(|value| (key.clone(), value.to_string())))
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// Errors raised while decoding a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("manifest body must be an object")]
    NotAnObject,
    #[error("manifest is missing {0}")]
    MissingField(&'static str),
    #[error("invalid apiVersion {0:?}")]
    InvalidApiVersion(String),
    #[error("invalid manifest metadata: {0}")]
    InvalidMetadata(&'static str),
}
