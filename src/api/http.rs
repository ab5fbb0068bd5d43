//! REST client for the configuration API
//!
//! Paths are relative to the API base URL, e.g.
//! `http://127.0.0.1:5555/v2/services/haproxy`. Every call carries HTTP
//! basic credentials.

use std::fmt;
use std::time::Duration;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use tracing::debug;

use super::schema::{self, PeerEntry, PeerSectionRequest, TransactionId};
use super::{CommitStatus, ConfigApi, EntryStatus, SectionStatus};
use crate::error::{ApiError, ApiResult, ApiStep, SyncError, SyncResult};

/// Basic auth credentials
#[derive(Clone, Default)]
pub struct ApiCredentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Configuration API client over HTTP
#[derive(Debug, Clone)]
pub struct DataPlaneClient {
    http: Client,
    base_url: String,
    credentials: ApiCredentials,
}

impl DataPlaneClient {
    /// Create a client; `request_timeout` bounds every single request
    pub fn new(
        base_url: impl Into<String>,
        credentials: ApiCredentials,
        request_timeout: Duration,
    ) -> SyncResult<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build HTTP client: {}", e)))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url)
            .map_err(|e| SyncError::Config(format!("invalid API url '{}': {}", base_url, e)))?;

        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(&self.credentials.user, Some(&self.credentials.password))
            .header("Content-Type", "application/json")
    }

    /// Send a request and return the status with the full body text
    async fn send(
        &self,
        step: ApiStep,
        request: RequestBuilder,
    ) -> ApiResult<(StatusCode, String)> {
        let response = request.send().await.map_err(|e| transport(step, e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| transport(step, e))?;
        debug!(step = %step, status = status.as_u16(), "configuration API answered");
        Ok((status, body))
    }
}

fn transport(step: ApiStep, err: reqwest::Error) -> ApiError {
    ApiError::Transport {
        step,
        message: err.to_string(),
        timed_out: err.is_timeout(),
    }
}

fn unexpected(step: ApiStep, status: StatusCode, body: String) -> ApiError {
    ApiError::Status {
        step,
        status: status.as_u16(),
        body,
    }
}

#[async_trait]
impl ConfigApi for DataPlaneClient {
    async fn configuration_version(&self) -> ApiResult<u64> {
        let step = ApiStep::Version;
        let (status, body) = self
            .send(step, self.request(Method::GET, "/configuration/version"))
            .await?;
        if status != StatusCode::OK {
            return Err(unexpected(step, status, body));
        }
        schema::decode_version(&body)
    }

    async fn open_transaction(&self, version: u64) -> ApiResult<TransactionId> {
        let step = ApiStep::OpenTransaction;
        let request = self
            .request(Method::POST, "/transactions")
            .query(&[("version", version)]);
        let (status, body) = self.send(step, request).await?;
        match status {
            StatusCode::OK | StatusCode::CREATED => {
                Ok(schema::decode_transaction(step, &body)?.id)
            }
            _ => Err(unexpected(step, status, body)),
        }
    }

    async fn ensure_peer_section(
        &self,
        transaction: &TransactionId,
        section: &str,
    ) -> ApiResult<SectionStatus> {
        let step = ApiStep::EnsureSection;
        let request = self
            .request(Method::POST, "/configuration/peer_section")
            .query(&[("transaction_id", transaction.as_str())])
            .json(&PeerSectionRequest {
                name: section.to_string(),
            });
        let (status, body) = self.send(step, request).await?;
        match status {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => {
                Ok(SectionStatus::Created)
            }
            StatusCode::CONFLICT => Ok(SectionStatus::AlreadyExists),
            _ => Err(unexpected(step, status, body)),
        }
    }

    async fn create_peer_entry(
        &self,
        transaction: &TransactionId,
        section: &str,
        entry: &PeerEntry,
    ) -> ApiResult<EntryStatus> {
        let step = ApiStep::AddEntry;
        let request = self
            .request(Method::POST, "/configuration/peer_entries")
            .query(&[("peer_section", section), ("transaction_id", transaction.as_str())])
            .json(entry);
        let (status, body) = self.send(step, request).await?;
        match status {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => Ok(EntryStatus::Applied),
            StatusCode::CONFLICT => Ok(EntryStatus::AlreadyPresent),
            _ => Err(unexpected(step, status, body)),
        }
    }

    async fn delete_peer_entry(
        &self,
        transaction: &TransactionId,
        section: &str,
        name: &str,
    ) -> ApiResult<EntryStatus> {
        let step = ApiStep::DeleteEntry;
        let request = self
            .request(Method::DELETE, &format!("/configuration/peer_entries/{}", name))
            .query(&[("peer_section", section), ("transaction_id", transaction.as_str())]);
        let (status, body) = self.send(step, request).await?;
        match status {
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => {
                Ok(EntryStatus::Applied)
            }
            StatusCode::NOT_FOUND => Ok(EntryStatus::AlreadyAbsent),
            _ => Err(unexpected(step, status, body)),
        }
    }

    async fn commit_transaction(&self, transaction: &TransactionId) -> ApiResult<CommitStatus> {
        let step = ApiStep::Commit;
        let request = self.request(Method::PUT, &format!("/transactions/{}", transaction));
        let (status, body) = self.send(step, request).await?;
        let committed = match status {
            StatusCode::OK => CommitStatus::Committed,
            StatusCode::ACCEPTED => CommitStatus::ReloadPending,
            _ => return Err(unexpected(step, status, body)),
        };
        let tx = schema::decode_transaction(step, &body)?;
        if &tx.id != transaction {
            return Err(ApiError::Malformed {
                step,
                detail: format!("commit answered for transaction '{}'", tx.id),
                body,
            });
        }
        Ok(committed)
    }
}
