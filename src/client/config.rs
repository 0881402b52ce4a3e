use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Mount point of the pod service account credentials.
pub const IN_CLUSTER_SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Connection settings for the target cluster API server.
#[derive(Clone, Default)]
pub struct ClusterConfig {
    pub server: String,
    pub bearer_token: Option<String>,
    /// PEM bundle trusted for the API server certificate.
    pub ca_pem: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
}

impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("server", &self.server)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("ca_pem", &self.ca_pem.as_ref().map(Vec::len))
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .finish()
    }
}

impl ClusterConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_ca_pem(mut self, pem: Vec<u8>) -> Self {
        self.ca_pem = Some(pem);
        self
    }

    /// Builds the configuration from the pod environment and service account mount.
    pub fn in_cluster() -> Result<Self, ClusterConfigError> {
        Self::in_cluster_from(Path::new(IN_CLUSTER_SERVICE_ACCOUNT_DIR))
    }

    /// As [`ClusterConfig::in_cluster`], reading credentials from `account_dir`.
    pub fn in_cluster_from(account_dir: &Path) -> Result<Self, ClusterConfigError> {
        let host = env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| ClusterConfigError::NotInCluster("KUBERNETES_SERVICE_HOST"))?;
        let port = env::var("KUBERNETES_SERVICE_PORT")
            .map_err(|_| ClusterConfigError::NotInCluster("KUBERNETES_SERVICE_PORT"))?;
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        let token = read_file(&account_dir.join("token"))?;
        let ca = read_bytes(&account_dir.join("ca.crt"))?;
        Ok(Self::new(format!("https://{host}:{port}"))
            .with_bearer_token(token.trim())
            .with_ca_pem(ca))
    }

    /// Loads the current context of a kubeconfig file.
    ///
    /// Only token authentication and inline or file-based CA bundles are
    /// understood; client certificates and exec plugins are rejected.
    pub fn from_kubeconfig(path: &Path) -> Result<Self, ClusterConfigError> {
        let contents = read_file(path)?;
        let kubeconfig: Kubeconfig =
            serde_yaml::from_str(&contents).map_err(|err| ClusterConfigError::Kubeconfig {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        let invalid = |message: String| ClusterConfigError::Kubeconfig {
            path: path.to_path_buf(),
            message,
        };
        let context_name = kubeconfig
            .current_context
            .clone()
            .ok_or_else(|| invalid("current-context is not set".into()))?;
        let context = kubeconfig
            .contexts
            .iter()
            .find(|entry| entry.name == context_name)
            .map(|entry| &entry.context)
            .ok_or_else(|| invalid(format!("context {context_name} not found")))?;
        let cluster = kubeconfig
            .clusters
            .iter()
            .find(|entry| entry.name == context.cluster)
            .map(|entry| &entry.cluster)
            .ok_or_else(|| invalid(format!("cluster {} not found", context.cluster)))?;
        let mut config = Self::new(cluster.server.clone());
        config.insecure_skip_tls_verify = cluster.insecure_skip_tls_verify;
        if let Some(data) = &cluster.certificate_authority_data {
            let pem = general_purpose::STANDARD
                .decode(data.trim())
                .map_err(|err| invalid(format!("certificate-authority-data: {err}")))?;
            config.ca_pem = Some(pem);
        } else if let Some(ca_path) = &cluster.certificate_authority {
            let ca_path = resolve_relative(path, ca_path);
            config.ca_pem = Some(read_bytes(&ca_path)?);
        }
        if let Some(user_name) = &context.user {
            let user = kubeconfig
                .users
                .iter()
                .find(|entry| &entry.name == user_name)
                .map(|entry| &entry.user)
                .ok_or_else(|| invalid(format!("user {user_name} not found")))?;
            if let Some(token) = &user.token {
                config.bearer_token = Some(token.clone());
            } else if let Some(token_file) = &user.token_file {
                let token_path = resolve_relative(path, token_file);
                config.bearer_token = Some(read_file(&token_path)?.trim().to_string());
            } else if user.client_certificate_data.is_some() || user.exec.is_some() {
                return Err(invalid(format!(
                    "user {user_name} uses an unsupported authentication method"
                )));
            }
        }
        Ok(config)
    }
}

fn resolve_relative(kubeconfig: &Path, target: &str) -> PathBuf {
    let target = PathBuf::from(target);
    if target.is_absolute() {
        return target;
    }
    kubeconfig
        .parent()
        .map(|dir| dir.join(&target))
        .unwrap_or(target)
}

fn read_file(path: &Path) -> Result<String, ClusterConfigError> {
    fs::read_to_string(path).map_err(|source| ClusterConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, ClusterConfigError> {
    fs::read(path).map_err(|source| ClusterConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(rename = "current-context")]
    current_context: Option<String>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: KubeconfigCluster,
}

#[derive(Debug, Deserialize)]
struct KubeconfigCluster {
    server: String,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
    #[serde(rename = "certificate-authority")]
    certificate_authority: Option<String>,
    #[serde(rename = "insecure-skip-tls-verify", default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: KubeconfigContext,
}

#[derive(Debug, Deserialize)]
struct KubeconfigContext {
    cluster: String,
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: KubeconfigUser,
}

#[derive(Debug, Default, Deserialize)]
struct KubeconfigUser {
    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<String>,
    #[serde(rename = "client-certificate-data")]
    client_certificate_data: Option<String>,
    exec: Option<serde_yaml::Value>,
}

/// Errors raised while assembling cluster connection settings.
#[derive(Debug, Error)]
pub enum ClusterConfigError {
    #[error("not running in a cluster: {0} is unset")]
    NotInCluster(&'static str),
    #[error("unable to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid kubeconfig {}: {message}", path.display())]
    Kubeconfig { path: PathBuf, message: String },
    #[error("unable to build http client: {0}")]
    Client(String),
}
