//! Error types for peersync

use std::fmt;
use thiserror::Error;

/// Result type for reconciliation operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for a single configuration API call
pub type ApiResult<T> = Result<T, ApiError>;

/// Steps of the transactional configuration protocol, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiStep {
    /// Read the configuration version counter
    Version,
    /// Open a transaction against a version
    OpenTransaction,
    /// Create the peer section if absent
    EnsureSection,
    /// Create one peer entry
    AddEntry,
    /// Delete one peer entry
    DeleteEntry,
    /// Commit the transaction
    Commit,
}

impl ApiStep {
    /// Stable name used in logs and error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiStep::Version => "version",
            ApiStep::OpenTransaction => "open-transaction",
            ApiStep::EnsureSection => "ensure-section",
            ApiStep::AddEntry => "add-entry",
            ApiStep::DeleteEntry => "delete-entry",
            ApiStep::Commit => "commit",
        }
    }
}

impl fmt::Display for ApiStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single call against the configuration API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The request never produced a response (connect, I/O, client timeout)
    #[error("{step}: request failed: {message}")]
    Transport {
        step: ApiStep,
        message: String,
        timed_out: bool,
    },

    /// The API answered with a status code the step does not accept
    #[error("{step}: unexpected status {status}: {body}")]
    Status {
        step: ApiStep,
        status: u16,
        body: String,
    },

    /// The API answered successfully but the body has the wrong shape
    #[error("{step}: malformed response ({detail}): {body}")]
    Malformed {
        step: ApiStep,
        detail: String,
        body: String,
    },
}

impl ApiError {
    /// Step that produced this error
    pub fn step(&self) -> ApiStep {
        match self {
            ApiError::Transport { step, .. }
            | ApiError::Status { step, .. }
            | ApiError::Malformed { step, .. } => *step,
        }
    }

    /// HTTP status code, when the API answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether a later attempt of the whole reconciliation may succeed.
    ///
    /// 409 and 406 are how a versioned API reports that the version moved
    /// under an open transaction.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport { .. } => true,
            ApiError::Status { status, .. } => {
                *status >= 500 || matches!(*status, 406 | 409 | 429)
            }
            ApiError::Malformed { .. } => false,
        }
    }
}

/// A raw peer that cannot become part of a desired set
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    /// No stable identity was reported for the member
    #[error("peer with addresses {addresses:?} has no identity")]
    MissingIdentity { addresses: Vec<String> },

    /// The member was reported without any address
    #[error("peer '{identity}' has no addresses")]
    NoAddresses { identity: String },

    /// The identity already appears earlier in the same snapshot
    #[error("peer '{identity}' appears more than once in the snapshot")]
    DuplicateIdentity { identity: String },
}

/// Failure to determine this process's own identity or address
#[derive(Error, Debug)]
pub enum ResolutionError {
    /// No interface with that name exists
    #[error("interface '{0}' not found")]
    InterfaceNotFound(String),

    /// The interface exists but carries no IPv4 address
    #[error("interface '{0}' has no ipv4 address")]
    NoIpv4Address(String),

    /// No hostname was configured and none is available from the environment
    #[error("local identity unknown: set --hostname or HOSTNAME")]
    MissingIdentity,

    /// Interface inspection is not available on this platform
    #[error("interface inspection is not supported on this platform")]
    Unsupported,

    /// The operating system refused the query
    #[error("interface query failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Main error type for peersync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network failure, 5xx or version conflict; safe to retry the run
    #[error("transient API error: {0}")]
    TransientApi(ApiError),

    /// The API refused a required step in a way retrying will not fix
    #[error("API rejected request: {0}")]
    RejectedApi(ApiError),

    /// The API answered with a body of unexpected shape
    #[error("malformed API response: {0}")]
    MalformedResponse(ApiError),

    /// A peer entry change failed while the abort policy is active
    #[error("peer entry '{identity}' failed: {source}")]
    EntryFailed {
        identity: String,
        #[source]
        source: ApiError,
    },

    /// Shutdown was requested while a call was in flight
    #[error("cancelled during {step}")]
    Cancelled { step: ApiStep },

    /// The caller's deadline expired while a call was in flight
    #[error("deadline exceeded during {step}")]
    DeadlineExceeded { step: ApiStep },

    /// Malformed membership input
    #[error("input error: {0}")]
    Input(#[from] InputError),

    /// Self identity could not be resolved
    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// The membership source could not be read
    #[error("membership source error: {0}")]
    Source(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether the worker should retry the reconciliation after a backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::TransientApi(_) | SyncError::DeadlineExceeded { .. } => true,
            SyncError::EntryFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Step of the protocol the failure happened in, if any
    pub fn step(&self) -> Option<ApiStep> {
        match self {
            SyncError::TransientApi(e)
            | SyncError::RejectedApi(e)
            | SyncError::MalformedResponse(e) => Some(e.step()),
            SyncError::EntryFailed { source, .. } => Some(source.step()),
            SyncError::Cancelled { step } | SyncError::DeadlineExceeded { step } => Some(*step),
            _ => None,
        }
    }
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Malformed { .. } => SyncError::MalformedResponse(err),
            _ if err.is_retryable() => SyncError::TransientApi(err),
            _ => SyncError::RejectedApi(err),
        }
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}
