//! Input loading and engine wiring for the extbox runner.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use extbox_sandbox::{ExecutionEngine, SandboxConfig};
use extbox_store::{DescriptorSource, FsDescriptorSource, FsScriptSource, SqliteDocumentStore};
use extbox_types::{
    ChannelId, ExecutionContext, ExecutionResult, ExtensionDescriptor, ExtensionId, TenantId,
    TriggerShape, UserId,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Where the descriptor comes from.
#[derive(Debug, Clone)]
pub enum DescriptorInput {
    /// A single TOML file.
    File(PathBuf),
    /// `<root>/<tenant>/<extension>.toml`.
    Lookup {
        root: PathBuf,
        tenant_id: TenantId,
        extension_id: ExtensionId,
    },
}

impl DescriptorInput {
    /// Builds a lookup from untrusted identifiers.
    pub fn lookup(root: PathBuf, tenant: &str, extension: &str) -> Result<Self> {
        Ok(Self::Lookup {
            root,
            tenant_id: TenantId::new(tenant)?,
            extension_id: ExtensionId::new(extension)?,
        })
    }
}

/// Where the execution context comes from.
#[derive(Debug, Clone)]
pub enum ContextInput {
    /// A JSON-encoded `ExecutionContext`.
    File(PathBuf),
    /// Built from the descriptor's trigger shape.
    Synthesize {
        args: String,
        channel_id: ChannelId,
        user_id: UserId,
    },
}

pub async fn load_descriptor(input: &DescriptorInput) -> Result<ExtensionDescriptor> {
    match input {
        DescriptorInput::File(path) => FsDescriptorSource::load_file(path)
            .await
            .with_context(|| format!("Failed to load descriptor {}", path.display())),
        DescriptorInput::Lookup {
            root,
            tenant_id,
            extension_id,
        } => FsDescriptorSource::new(root.clone())
            .descriptor(tenant_id, extension_id)
            .await
            .with_context(|| format!("Failed to look up {tenant_id}/{extension_id}")),
    }
}

pub async fn load_context(
    input: &ContextInput,
    descriptor: &ExtensionDescriptor,
) -> Result<ExecutionContext> {
    let context = match input {
        ContextInput::File(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read context {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid context JSON in {}", path.display()))?
        }
        ContextInput::Synthesize {
            args,
            channel_id,
            user_id,
        } => synthesize_context(descriptor, args, channel_id.clone(), user_id.clone(), Utc::now()),
    };

    if let Some(channel) = &context.channel_id {
        if !descriptor.allows_channel(channel) {
            bail!(
                "Extension {}/{} is not enabled in channel {channel}",
                descriptor.tenant_id,
                descriptor.extension_id
            );
        }
    }
    Ok(context)
}

/// Builds the context the dispatcher would send for this descriptor's trigger.
pub fn synthesize_context(
    descriptor: &ExtensionDescriptor,
    args: &str,
    channel_id: ChannelId,
    user_id: UserId,
    now: DateTime<Utc>,
) -> ExecutionContext {
    let tenant_id = descriptor.tenant_id.clone();
    match &descriptor.trigger {
        TriggerShape::Command { .. } => ExecutionContext::command(tenant_id, channel_id, user_id, args),
        TriggerShape::Keyword { pattern, .. } => {
            ExecutionContext::keyword(tenant_id, channel_id, user_id, pattern.clone(), args)
        }
        TriggerShape::Interval { .. } => ExecutionContext::scheduled(tenant_id, Some(channel_id), now),
    }
}

/// Wires an engine over `scripts_dir`, with SQLite storage at `db` or an
/// in-memory store.
pub fn build_engine(
    config: SandboxConfig,
    scripts_dir: &Path,
    db: Option<&Path>,
) -> Result<ExecutionEngine> {
    let mut builder =
        ExecutionEngine::builder(config).scripts(Arc::new(FsScriptSource::new(scripts_dir)));
    if let Some(path) = db {
        let store = SqliteDocumentStore::open(path)
            .with_context(|| format!("Failed to open storage {}", path.display()))?;
        info!("Using SQLite storage at {:?}", path);
        builder = builder.documents(Arc::new(store));
    }
    builder.build().context("Failed to start execution engine")
}

pub fn render_result(result: &ExecutionResult) -> Result<String> {
    Ok(serde_json::to_string_pretty(result)?)
}
