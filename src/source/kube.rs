//! EndpointSlice listing from the Kubernetes API
//!
//! Lists `discovery.k8s.io/v1` EndpointSlices carrying the label
//! `kubernetes.io/service-name=<service>`. The service account token is
//! re-read on every list since the kubelet rotates it.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use async_trait::async_trait;
use reqwest::{Certificate, Client};

use super::{EndpointSlice, EndpointSliceList, SliceLister};
use crate::error::{SyncError, SyncResult};

/// Label every EndpointSlice of a service carries
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Lists a service's slices through the Kubernetes REST API
#[derive(Debug, Clone)]
pub struct KubeLister {
    http: Client,
    api_server: String,
    namespace: String,
    service: String,
    token_path: Option<PathBuf>,
}

impl KubeLister {
    pub fn new(
        api_server: impl Into<String>,
        namespace: impl Into<String>,
        service: impl Into<String>,
        token_path: Option<PathBuf>,
        ca_path: Option<PathBuf>,
        request_timeout: Duration,
    ) -> SyncResult<Self> {
        let mut builder = Client::builder().timeout(request_timeout);
        if let Some(ca_path) = &ca_path {
            let pem = std::fs::read(ca_path).map_err(|e| {
                SyncError::Config(format!("cannot read CA bundle {}: {}", ca_path.display(), e))
            })?;
            let cert = Certificate::from_pem(&pem)
                .map_err(|e| SyncError::Config(format!("invalid CA bundle: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_server: api_server.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            service: service.into(),
            token_path,
        })
    }

    pub fn url(&self) -> String {
        format!(
            "{}/apis/discovery.k8s.io/v1/namespaces/{}/endpointslices",
            self.api_server, self.namespace
        )
    }

    pub fn label_selector(&self) -> String {
        format!("{}={}", SERVICE_NAME_LABEL, self.service)
    }

    async fn token(&self) -> SyncResult<Option<String>> {
        let path = match &self.token_path {
            Some(path) => path,
            None => return Ok(None),
        };
        match tokio::fs::read_to_string(path).await {
            Ok(token) => Ok(Some(token.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Io(e)),
        }
    }
}

#[async_trait]
impl SliceLister for KubeLister {
    async fn list(&self) -> SyncResult<Vec<EndpointSlice>> {
        let mut request = self
            .http
            .get(self.url())
            .query(&[("labelSelector", self.label_selector())]);
        if let Some(token) = self.token().await? {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Source(format!("listing endpoint slices: {}", e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SyncError::Source(format!("reading endpoint slices: {}", e)))?;
        if !status.is_success() {
            return Err(SyncError::Source(format!(
                "listing endpoint slices: status {}: {}",
                status.as_u16(),
                body
            )));
        }
        let list: EndpointSliceList = serde_json::from_str(&body)
            .map_err(|e| SyncError::Source(format!("invalid endpoint slice list: {}", e)))?;
        Ok(list.items)
    }

    fn describe(&self) -> String {
        format!("service {}/{} via {}", self.namespace, self.service, self.api_server)
    }
}
