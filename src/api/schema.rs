//! Typed request and response bodies for the configuration API
//!
//! Responses are decoded strictly: a missing or empty required field is a
//! [`ApiError::Malformed`], never a default.

use std::fmt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult, ApiStep};

/// Identifier of an open transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Body returned by the transaction open and commit calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub id: TransactionId,
    #[serde(rename = "_version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Body of the peer section create call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSectionRequest {
    pub name: String,
}

/// A peer entry as the configuration API stores it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerEntry {
    pub name: String,
    pub address: String,
    pub port: u16,
}

impl fmt::Display for PeerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer {} {}:{}", self.name, self.address, self.port)
    }
}

fn malformed(step: ApiStep, detail: impl Into<String>, body: &str) -> ApiError {
    ApiError::Malformed {
        step,
        detail: detail.into(),
        body: body.to_string(),
    }
}

/// Decode a JSON body into `T`, mapping failures to [`ApiError::Malformed`]
pub fn decode<T: DeserializeOwned>(step: ApiStep, body: &str) -> ApiResult<T> {
    serde_json::from_str(body).map_err(|e| malformed(step, e.to_string(), body))
}

/// The version endpoint answers with a bare integer
pub fn decode_version(body: &str) -> ApiResult<u64> {
    decode::<u64>(ApiStep::Version, body.trim())
}

/// Decode a transaction body and require a non-empty id
pub fn decode_transaction(step: ApiStep, body: &str) -> ApiResult<TransactionResponse> {
    let tx: TransactionResponse = decode(step, body)?;
    if tx.id.as_str().is_empty() {
        return Err(malformed(step, "empty transaction id", body));
    }
    Ok(tx)
}
