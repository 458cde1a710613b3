//! Core type definitions for extbox.
//!
//! This crate defines the plain data that flows between the platform
//! dispatcher and the extension sandbox:
//! - Tenant, extension, channel and invocation identifiers
//! - The read-only extension descriptor and its network capability level
//! - The per-trigger execution context
//! - The tagged execution result returned by the engine
//!
//! Nothing in here performs I/O; the sandbox crate owns all behavior.

mod context;
mod descriptor;
mod ids;
mod result;

pub use context::{ExecutionContext, TriggerEvent};
pub use descriptor::{
    AuthorizationLevel, ChannelScope, ExtensionDescriptor, NetworkCapabilityLevel, RateKey,
    TriggerShape, DEFAULT_TIMEOUT_MS,
};
pub use ids::{ChannelId, CodeRef, ExtensionId, InvocationId, TenantId, UserId};
pub use result::{Diagnostics, ExecutionResult, OutcomeKind};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}
