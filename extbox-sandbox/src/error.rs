//! Error types for the extension sandbox.

use crate::capability::NetworkDenial;
use crate::host_abi::AbiStatus;
use extbox_store::StoreError;
use std::fmt;
use thiserror::Error;

pub type SandboxResult<T> = Result<T, SandboxError>;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("script load failed: {0}")]
    Load(String),

    #[error("isolate setup failed: {0}")]
    Setup(String),

    #[error("wasm engine error: {0}")]
    Engine(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("storage limit exceeded: {0}")]
    StorageLimit(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// Status code handed to a script when a storage call fails.
    pub fn abi_status(&self) -> AbiStatus {
        match self {
            SandboxError::StorageLimit(_) => AbiStatus::LimitExceeded,
            SandboxError::Serialization(_) => AbiStatus::InvalidArgument,
            _ => AbiStatus::StorageFailure,
        }
    }
}

/// Which side of an HTTP exchange overflowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyDirection {
    Request,
    Response,
}

impl fmt::Display for BodyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BodyDirection::Request => "request",
            BodyDirection::Response => "response",
        })
    }
}

/// Failure of a mediated fetch. Returned to the script as a value, never
/// raised inside the isolate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("network access denied: {0}")]
    Denied(#[from] NetworkDenial),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("{direction} body exceeds {limit} bytes")]
    BodyTooLarge { direction: BodyDirection, limit: u64 },

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl NetworkError {
    /// Stable kind string carried in the error JSON scripts receive.
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkError::Denied(_) => "network_denied",
            NetworkError::RateLimited { .. } => "rate_limited",
            NetworkError::BodyTooLarge { .. } => "body_too_large",
            NetworkError::Timeout(_) => "network_timeout",
            NetworkError::Transport(_) => "transport",
            NetworkError::InvalidRequest(_) => "invalid_request",
        }
    }

    pub fn abi_status(&self) -> AbiStatus {
        match self {
            NetworkError::Denied(_) => AbiStatus::NetworkDenied,
            NetworkError::RateLimited { .. } => AbiStatus::RateLimited,
            NetworkError::BodyTooLarge { .. } => AbiStatus::BodyTooLarge,
            NetworkError::Timeout(_) => AbiStatus::NetworkTimeout,
            NetworkError::Transport(_) => AbiStatus::TransportFailure,
            NetworkError::InvalidRequest(_) => AbiStatus::InvalidArgument,
        }
    }

    /// JSON document written to the script's last-result buffer.
    pub fn to_script_json(&self) -> serde_json::Value {
        let mut doc = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        if let NetworkError::RateLimited { retry_after_ms } = self {
            doc["retry_after_ms"] = serde_json::json!(retry_after_ms);
        }
        doc
    }
}
