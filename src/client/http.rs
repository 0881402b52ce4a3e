use super::{group_version_path, ApiResource, ClusterConfig, ClusterConfigError, DynamicClient};
use crate::error::{CauseKind, ClusterError};
use crate::manifest::ResourceKindId;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Certificate, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocking client for the Kubernetes REST API.
///
/// Discovery documents are cached per group-version; a kind missing from the
/// cached document triggers one refresh so that newly registered types are
/// picked up by the deferred pass.
#[derive(Debug)]
pub struct HttpDynamicClient {
    client: Client,
    server: String,
    bearer_token: Option<String>,
    discovery: Mutex<HashMap<String, Vec<DiscoveredResource>>>,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscoveredResource {
    name: String,
    kind: String,
    #[serde(default)]
    namespaced: bool,
}

#[derive(Debug, Deserialize)]
struct ApiResourceList {
    #[serde(default)]
    resources: Vec<DiscoveredResource>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    reason: String,
}

impl HttpDynamicClient {
    pub fn new(config: &ClusterConfig) -> Result<Self, ClusterConfigError> {
        if config.server.trim().is_empty() {
            return Err(ClusterConfigError::Client(
                "cluster server must not be empty".into(),
            ));
        }
        let mut builder = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify);
        if let Some(pem) = &config.ca_pem {
            for cert in Certificate::from_pem_bundle(pem)
                .map_err(|err| ClusterConfigError::Client(format!("invalid CA bundle: {err}")))?
            {
                builder = builder.add_root_certificate(cert);
            }
        }
        let client = builder
            .build()
            .map_err(|err| ClusterConfigError::Client(err.to_string()))?;
        Ok(Self {
            client,
            server: config.server.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token.clone(),
            discovery: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, ClusterError> {
        self.authorize(request)
            .header("Accept", "application/json")
            .send()
            .map_err(|err| ClusterError::other(format!("request failed: {err}")))
    }

    fn discover(&self, kind: &ResourceKindId) -> Result<Vec<DiscoveredResource>, ClusterError> {
        let path = group_version_path(kind);
        debug!(group_version = %kind.api_version(), "refreshing discovery");
        let response = self.send(self.client.get(self.url(&path)))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ClusterError::no_match(format!(
                "no matches for kind {:?} in version {:?}",
                kind.kind,
                kind.api_version()
            ))
            .with_status(status.as_u16()));
        }
        if !status.is_success() {
            return Err(error_from_response(response, CauseKind::Other));
        }
        let list: ApiResourceList = response
            .json()
            .map_err(|err| ClusterError::other(format!("discovery decode failed: {err}")))?;
        let resources: Vec<DiscoveredResource> = list
            .resources
            .into_iter()
            .filter(|resource| !resource.name.contains('/'))
            .collect();
        self.discovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path, resources.clone());
        Ok(resources)
    }

    fn cached(&self, kind: &ResourceKindId) -> Option<ApiResource> {
        let cache = self
            .discovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        cache
            .get(&group_version_path(kind))
            .and_then(|resources| find_kind(resources, kind))
    }
}

fn find_kind(resources: &[DiscoveredResource], kind: &ResourceKindId) -> Option<ApiResource> {
    resources
        .iter()
        .find(|resource| resource.kind == kind.kind)
        .map(|resource| ApiResource::new(kind.clone(), resource.name.clone(), resource.namespaced))
}

fn error_from_response(response: Response, kind: CauseKind) -> ClusterError {
    let status = response.status();
    let body: StatusBody = response.json().unwrap_or_default();
    let message = if body.message.is_empty() {
        format!("api server returned {status}")
    } else if body.reason.is_empty() {
        body.message
    } else {
        format!("{} ({})", body.message, body.reason)
    };
    ClusterError::new(kind, message).with_status(status.as_u16())
}

fn write_error(response: Response) -> ClusterError {
    let kind = if response.status() == StatusCode::NOT_FOUND {
        CauseKind::NotFound
    } else {
        CauseKind::Other
    };
    error_from_response(response, kind)
}

impl DynamicClient for HttpDynamicClient {
    fn resolve(&self, kind: &ResourceKindId) -> Result<ApiResource, ClusterError> {
        if let Some(resource) = self.cached(kind) {
            return Ok(resource);
        }
        let resources = self.discover(kind)?;
        find_kind(&resources, kind).ok_or_else(|| {
            ClusterError::no_match(format!(
                "no matches for kind {:?} in version {:?}",
                kind.kind,
                kind.api_version()
            ))
        })
    }

    fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, ClusterError> {
        let path = resource.object_path(namespace, name);
        debug!(%path, "get");
        let response = self.send(self.client.get(self.url(&path)))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json()
                .map(Some)
                .map_err(|err| ClusterError::other(format!("decode {path} failed: {err}"))),
            _ => Err(error_from_response(response, CauseKind::Other)),
        }
    }

    fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &Value,
    ) -> Result<Value, ClusterError> {
        let path = resource.collection_path(namespace);
        debug!(%path, "create");
        let response = self.send(self.client.post(self.url(&path)).json(object))?;
        if !response.status().is_success() {
            return Err(write_error(response));
        }
        response
            .json()
            .map_err(|err| ClusterError::other(format!("decode {path} failed: {err}")))
    }

    fn update(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &Value,
    ) -> Result<Value, ClusterError> {
        let name = object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| ClusterError::other("object has no metadata.name"))?;
        let path = resource.object_path(namespace, name);
        debug!(%path, "update");
        let response = self.send(self.client.put(self.url(&path)).json(object))?;
        if !response.status().is_success() {
            return Err(write_error(response));
        }
        response
            .json()
            .map_err(|err| ClusterError::other(format!("decode {path} failed: {err}")))
    }
}
