//! Error types for remote calls and sync flows.

use reqwest::StatusCode;
use snipsync_core::StoreError;

/// Failure of a call to the remote snippet service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    /// 401. Never retried.
    #[error("Authentication required")]
    Unauthorized,

    #[error("Remote object not found")]
    NotFound,

    /// 400. The delta endpoint uses this to signal it cannot serve the request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Remote returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Map a non-success HTTP status to an error.
    pub fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => RemoteError::Unauthorized,
            StatusCode::NOT_FOUND => RemoteError::NotFound,
            StatusCode::BAD_REQUEST => RemoteError::BadRequest(body),
            _ => RemoteError::Status {
                status: status.as_u16(),
                body,
            },
        }
    }

    /// Worth retrying with backoff: transport failures, timeouts, 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout => true,
            RemoteError::Status { status, .. } => *status == 429 || (500..=599).contains(status),
            _ => false,
        }
    }

    /// The request never reached the service.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Timeout)
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, RemoteError::Unauthorized)
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout
        } else if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            RemoteError::from_status(status, e.to_string())
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

/// Errors surfaced by the sync engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Not signed in")]
    NotAuthenticated,
}

impl SyncError {
    /// The session is missing or was rejected. Retrying will not help.
    pub fn is_auth(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_auth(),
            SyncError::NotAuthenticated => true,
            SyncError::Store(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
