//! The extension descriptor: immutable per-invocation configuration.
//!
//! Descriptors are written by the platform's configuration path and are
//! read-only from the sandbox's point of view.

use crate::ids::{ChannelId, CodeRef, ExtensionId, TenantId};
use serde::{Deserialize, Serialize};

/// Execution timeout applied when a descriptor does not set one.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Identifies one extension's rate window. Kept structured so ids containing
/// `:` cannot collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub tenant_id: TenantId,
    pub extension_id: ExtensionId,
}

/// Breadth of outbound network access granted to an extension.
///
/// Variants are ordered by breadth, not by trust: every level, including
/// `NetworkAdvanced`, still goes through the mandatory SSRF check.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum NetworkCapabilityLevel {
    #[default]
    None,
    AllowlistOnly,
    Network,
    NetworkAdvanced,
}

impl NetworkCapabilityLevel {
    /// Returns the configuration name for this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::AllowlistOnly => "allowlist_only",
            Self::Network => "network",
            Self::NetworkAdvanced => "network_advanced",
        }
    }

    /// Whether this level needs the operator approval flag to reach any host.
    pub fn requires_approval(&self) -> bool {
        matches!(self, Self::Network | Self::NetworkAdvanced)
    }
}

/// Minimum role a user needs to invoke the extension.
///
/// Enforced by the dispatcher; carried here so the descriptor is complete.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationLevel {
    #[default]
    Everyone,
    Moderator,
    Admin,
    Owner,
}

/// How the extension is triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerShape {
    Command {
        name: String,
    },
    Keyword {
        pattern: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    Interval {
        every_ms: u64,
    },
}

/// Channels in which the extension is enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "channels", rename_all = "snake_case")]
pub enum ChannelScope {
    #[default]
    All,
    Only(Vec<ChannelId>),
}

impl ChannelScope {
    pub fn allows(&self, channel: &ChannelId) -> bool {
        match self {
            Self::All => true,
            Self::Only(channels) => channels.contains(channel),
        }
    }
}

/// Immutable configuration for one extension, as read from the config store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionDescriptor {
    pub tenant_id: TenantId,
    pub extension_id: ExtensionId,
    pub code_ref: CodeRef,
    pub trigger: TriggerShape,
    #[serde(default)]
    pub required_auth: AuthorizationLevel,
    /// Wall-clock budget for one execution. Zero means "use the host default".
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub network: NetworkCapabilityLevel,
    /// Operator approval for `network` / `network_advanced`.
    #[serde(default)]
    pub network_approved: bool,
    /// Tenant-specific hostnames added to the default allowlist.
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub channels: ChannelScope,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl ExtensionDescriptor {
    /// Creates a descriptor with defaults for everything but identity and trigger.
    pub fn new(
        tenant_id: TenantId,
        extension_id: ExtensionId,
        code_ref: CodeRef,
        trigger: TriggerShape,
    ) -> Self {
        Self {
            tenant_id,
            extension_id,
            code_ref,
            trigger,
            required_auth: AuthorizationLevel::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            network: NetworkCapabilityLevel::default(),
            network_approved: false,
            allowlist: Vec::new(),
            channels: ChannelScope::default(),
        }
    }

    /// Resolves the timeout against host defaults: zero falls back to
    /// `default_ms`, anything above `max_ms` is clamped.
    pub fn effective_timeout_ms(&self, default_ms: u64, max_ms: u64) -> u64 {
        let requested = if self.timeout_ms == 0 {
            default_ms
        } else {
            self.timeout_ms
        };
        requested.min(max_ms)
    }

    pub fn allows_channel(&self, channel: &ChannelId) -> bool {
        self.channels.allows(channel)
    }

    /// Key shared by every invocation of this extension, used for rate limiting.
    pub fn rate_key(&self) -> RateKey {
        RateKey {
            tenant_id: self.tenant_id.clone(),
            extension_id: self.extension_id.clone(),
        }
    }
}
