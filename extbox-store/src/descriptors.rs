//! Extension descriptor sources.
//!
//! Descriptors are owned by the platform's configuration path; the sandbox
//! only ever reads them.

use crate::error::{StoreError, StoreResult};
use crate::scripts::validate_path_component;
use async_trait::async_trait;
use extbox_types::{ExtensionDescriptor, ExtensionId, TenantId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Looks up the descriptor for `(tenant, extension)`.
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    async fn descriptor(
        &self,
        tenant_id: &TenantId,
        extension_id: &ExtensionId,
    ) -> StoreResult<ExtensionDescriptor>;
}

/// In-memory descriptor source.
#[derive(Default)]
pub struct MemoryDescriptorSource {
    descriptors: RwLock<HashMap<(TenantId, ExtensionId), ExtensionDescriptor>>,
}

impl MemoryDescriptorSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, descriptor: ExtensionDescriptor) {
        let key = (descriptor.tenant_id.clone(), descriptor.extension_id.clone());
        self.descriptors
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key, descriptor);
    }
}

#[async_trait]
impl DescriptorSource for MemoryDescriptorSource {
    async fn descriptor(
        &self,
        tenant_id: &TenantId,
        extension_id: &ExtensionId,
    ) -> StoreResult<ExtensionDescriptor> {
        self.descriptors
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(tenant_id.clone(), extension_id.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("extension {tenant_id}/{extension_id}")))
    }
}

/// Reads TOML descriptors from `<root>/<tenant>/<extension>.toml`.
#[derive(Debug, Clone)]
pub struct FsDescriptorSource {
    root: PathBuf,
}

impl FsDescriptorSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Parses a single descriptor file.
    pub async fn load_file(path: &Path) -> StoreResult<ExtensionDescriptor> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(format!("descriptor {}", path.display()))
            } else {
                StoreError::Io(e)
            }
        })?;
        toml::from_str(&raw).map_err(|e| StoreError::InvalidDescriptor {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl DescriptorSource for FsDescriptorSource {
    async fn descriptor(
        &self,
        tenant_id: &TenantId,
        extension_id: &ExtensionId,
    ) -> StoreResult<ExtensionDescriptor> {
        validate_path_component(tenant_id.as_str())?;
        validate_path_component(extension_id.as_str())?;

        let path = self
            .root
            .join(tenant_id.as_str())
            .join(format!("{}.toml", extension_id.as_str()));
        let descriptor = Self::load_file(&path).await?;

        // The path is authoritative for identity.
        if &descriptor.tenant_id != tenant_id || &descriptor.extension_id != extension_id {
            return Err(StoreError::InvalidDescriptor {
                path: path.display().to_string(),
                message: format!(
                    "declares {}/{}, expected {tenant_id}/{extension_id}",
                    descriptor.tenant_id, descriptor.extension_id
                ),
            });
        }
        Ok(descriptor)
    }
}
