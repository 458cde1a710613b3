//! The tagged outcome of one execution.
//!
//! Every failure path in the engine ends up as one of these variants; the
//! dispatcher never sees a raw error.

use crate::ids::{ChannelId, ExtensionId, InvocationId, TenantId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Diagnostic metadata attached to every result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub invocation_id: InvocationId,
    pub tenant_id: TenantId,
    pub extension_id: ExtensionId,
    pub channel_id: Option<ChannelId>,
    pub elapsed_ms: u64,
}

/// Outcome of `ExecutionEngine::run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// The script ran to completion. `replies` are the messages it emitted.
    Completed {
        diagnostics: Diagnostics,
        replies: Vec<String>,
    },
    /// The script raised an uncaught error or trapped.
    RuntimeError {
        diagnostics: Diagnostics,
        message: String,
    },
    /// The script exceeded its wall-clock budget and was terminated.
    TimeoutError {
        diagnostics: Diagnostics,
        timeout_ms: u64,
    },
    /// The script tried to grow past the isolate memory ceiling.
    MemoryLimitError {
        diagnostics: Diagnostics,
        limit_bytes: u64,
    },
    /// The script source could not be fetched, parsed or validated.
    LoadError {
        diagnostics: Diagnostics,
        reason: String,
    },
    /// The isolate could not be constructed.
    SetupError {
        diagnostics: Diagnostics,
        reason: String,
    },
}

/// Discriminant of [`ExecutionResult`], used in logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Completed,
    RuntimeError,
    TimeoutError,
    MemoryLimitError,
    LoadError,
    SetupError,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::RuntimeError => "runtime_error",
            Self::TimeoutError => "timeout_error",
            Self::MemoryLimitError => "memory_limit_error",
            Self::LoadError => "load_error",
            Self::SetupError => "setup_error",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ExecutionResult {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Completed { .. } => OutcomeKind::Completed,
            Self::RuntimeError { .. } => OutcomeKind::RuntimeError,
            Self::TimeoutError { .. } => OutcomeKind::TimeoutError,
            Self::MemoryLimitError { .. } => OutcomeKind::MemoryLimitError,
            Self::LoadError { .. } => OutcomeKind::LoadError,
            Self::SetupError { .. } => OutcomeKind::SetupError,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        match self {
            Self::Completed { diagnostics, .. }
            | Self::RuntimeError { diagnostics, .. }
            | Self::TimeoutError { diagnostics, .. }
            | Self::MemoryLimitError { diagnostics, .. }
            | Self::LoadError { diagnostics, .. }
            | Self::SetupError { diagnostics, .. } => diagnostics,
        }
    }

    /// Replies emitted by a completed script; empty for every other outcome.
    pub fn replies(&self) -> &[String] {
        match self {
            Self::Completed { replies, .. } => replies,
            _ => &[],
        }
    }

    /// Human-readable failure detail, `None` for `Completed`.
    pub fn failure_detail(&self) -> Option<String> {
        match self {
            Self::Completed { .. } => None,
            Self::RuntimeError { message, .. } => Some(message.clone()),
            Self::TimeoutError { timeout_ms, .. } => {
                Some(format!("exceeded {timeout_ms}ms execution budget"))
            }
            Self::MemoryLimitError { limit_bytes, .. } => {
                Some(format!("exceeded {limit_bytes} byte memory ceiling"))
            }
            Self::LoadError { reason, .. } | Self::SetupError { reason, .. } => {
                Some(reason.clone())
            }
        }
    }
}
