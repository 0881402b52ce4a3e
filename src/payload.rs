use crate::manifest::{Manifest, ManifestError};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Ordered set of manifests describing one desired-state version.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    source_id: String,
    version: String,
    manifests: Vec<Manifest>,
}

impl Payload {
    pub fn new(
        source_id: impl Into<String>,
        version: impl Into<String>,
        manifests: Vec<Manifest>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            version: version.into(),
            manifests,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Manifests in payload order.
    pub fn manifests(&self) -> &[Manifest] {
        &self.manifests
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    /// Hex SHA-256 over the manifests' canonical JSON, in order.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for manifest in &self.manifests {
            // serde_json maps are ordered by key, so the encoding is stable.
            let encoded = serde_json::to_vec(manifest.object()).unwrap_or_default();
            hasher.update((encoded.len() as u64).to_be_bytes());
            hasher.update(&encoded);
        }
        hex::encode(hasher.finalize())
    }
}

/// Loads every `.json`, `.yaml` and `.yml` file directly under `dir`.
///
/// Files are read in lexical filename order; YAML files may hold several
/// documents, which keep their in-file order. Empty documents are skipped.
pub fn load_payload_dir(
    dir: &Path,
    source_id: impl Into<String>,
    version: impl Into<String>,
) -> Result<Payload, PayloadError> {
    let entries = fs::read_dir(dir).map_err(|source| PayloadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| PayloadError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && manifest_extension(&path).is_some() {
            files.push(path);
        }
    }
    files.sort();
    let mut manifests = Vec::new();
    for path in files {
        manifests.extend(load_manifest_file(&path)?);
    }
    Ok(Payload::new(source_id, version, manifests))
}

/// Decodes all manifests contained in a single file.
pub fn load_manifest_file(path: &Path) -> Result<Vec<Manifest>, PayloadError> {
    let contents = fs::read_to_string(path).map_err(|source| PayloadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let documents = match manifest_extension(path) {
        Some(FileFormat::Json) => {
            let value: Value =
                serde_json::from_str(&contents).map_err(|err| PayloadError::Decode {
                    path: path.to_path_buf(),
                    message: err.to_string(),
                })?;
            vec![value]
        }
        Some(FileFormat::Yaml) => yaml_documents(path, &contents)?,
        None => return Err(PayloadError::UnsupportedFile(path.to_path_buf())),
    };
    documents
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            Manifest::from_value(value).map_err(|source| PayloadError::Manifest {
                path: path.to_path_buf(),
                index,
                source,
            })
        })
        .collect()
}

fn yaml_documents(path: &Path, contents: &str) -> Result<Vec<Value>, PayloadError> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(contents) {
        let value = Value::deserialize(document).map_err(|err| PayloadError::Decode {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

enum FileFormat {
    Json,
    Yaml,
}

fn manifest_extension(path: &Path) -> Option<FileFormat> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Some(FileFormat::Json),
        Some("yaml") | Some("yml") => Some(FileFormat::Yaml),
        _ => None,
    }
}

/// Errors surfaced while loading a payload from disk.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("unable to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is not a manifest file", .0.display())]
    UnsupportedFile(PathBuf),
    #[error("{} could not be decoded: {message}", path.display())]
    Decode { path: PathBuf, message: String },
    #[error("{} document {index}: {source}", path.display())]
    Manifest {
        path: PathBuf,
        index: usize,
        #[source]
        source: ManifestError,
    },
}
