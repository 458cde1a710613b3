//! The triggering event for one execution.

use crate::ids::{ChannelId, TenantId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What caused the extension to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerEvent {
    /// A command invocation; `args` is everything after the command name.
    Command { args: String },
    /// A keyword match inside a message.
    Keyword { matched: String, message: String },
    /// A scheduler tick for interval extensions.
    ScheduledTick { at: DateTime<Utc> },
}

/// Per-trigger context handed to the script. Created for one run and discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub event: TriggerEvent,
}

impl ExecutionContext {
    pub fn command(
        tenant_id: TenantId,
        channel_id: ChannelId,
        user_id: UserId,
        args: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            channel_id: Some(channel_id),
            user_id: Some(user_id),
            event: TriggerEvent::Command { args: args.into() },
        }
    }

    pub fn keyword(
        tenant_id: TenantId,
        channel_id: ChannelId,
        user_id: UserId,
        matched: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            channel_id: Some(channel_id),
            user_id: Some(user_id),
            event: TriggerEvent::Keyword {
                matched: matched.into(),
                message: message.into(),
            },
        }
    }

    /// Scheduled ticks have no user; the channel is the extension's target, if any.
    pub fn scheduled(tenant_id: TenantId, channel_id: Option<ChannelId>, at: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            channel_id,
            user_id: None,
            event: TriggerEvent::ScheduledTick { at },
        }
    }

    /// Serializes the context to the JSON document scripts read.
    pub fn to_json_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
