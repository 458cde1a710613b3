//! Scoped key/value gateway exposed to sandboxed code.
//!
//! A gateway is bound to one namespace at construction and offers no way to
//! name another, so a script can only ever touch its own extension's data.

use crate::error::{SandboxError, SandboxResult};
use extbox_store::{DocumentStore, Namespace};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageLimits {
    pub max_key_bytes: usize,
    pub max_value_bytes: usize,
}

impl Default for StorageLimits {
    fn default() -> Self {
        Self {
            max_key_bytes: 256,
            max_value_bytes: 64 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct StorageGateway {
    store: Arc<dyn DocumentStore>,
    namespace: Namespace,
    limits: StorageLimits,
}

impl StorageGateway {
    pub fn new(store: Arc<dyn DocumentStore>, namespace: Namespace, limits: StorageLimits) -> Self {
        Self {
            store,
            namespace,
            limits,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn check_key(&self, key: &str) -> SandboxResult<()> {
        if key.is_empty() {
            return Err(SandboxError::StorageLimit("key is empty".into()));
        }
        if key.len() > self.limits.max_key_bytes {
            return Err(SandboxError::StorageLimit(format!(
                "key is {} bytes, limit {}",
                key.len(),
                self.limits.max_key_bytes
            )));
        }
        Ok(())
    }

    pub async fn write(&self, key: &str, value: Value) -> SandboxResult<()> {
        self.check_key(key)?;
        let size = serde_json::to_vec(&value)?.len();
        if size > self.limits.max_value_bytes {
            return Err(SandboxError::StorageLimit(format!(
                "value is {size} bytes, limit {}",
                self.limits.max_value_bytes
            )));
        }
        debug!(
            tenant_id = %self.namespace.tenant_id,
            extension_id = %self.namespace.extension_id,
            key,
            size,
            "Storage write"
        );
        Ok(self.store.put(&self.namespace, key, value).await?)
    }

    pub async fn get(&self, key: &str) -> SandboxResult<Option<Value>> {
        self.check_key(key)?;
        Ok(self.store.get(&self.namespace, key).await?)
    }

    /// Returns whether the key existed.
    pub async fn delete(&self, key: &str) -> SandboxResult<bool> {
        self.check_key(key)?;
        Ok(self.store.delete(&self.namespace, key).await?)
    }

    /// Removes every entry of this extension; returns how many were removed.
    pub async fn clear(&self) -> SandboxResult<u64> {
        Ok(self.store.clear(&self.namespace).await?)
    }
}
