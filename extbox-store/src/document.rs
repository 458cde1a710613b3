//! Namespaced document store abstraction.
//!
//! Every entry lives under a `(tenant, extension)` namespace. Implementations
//! must make each individual write atomic; concurrent writers to the same key
//! resolve last-write-wins.

use crate::error::StoreResult;
use async_trait::async_trait;
use extbox_types::{ExtensionDescriptor, ExtensionId, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// The `(tenant, extension)` pair that scopes a set of entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub tenant_id: TenantId,
    pub extension_id: ExtensionId,
}

impl Namespace {
    pub fn new(tenant_id: TenantId, extension_id: ExtensionId) -> Self {
        Self {
            tenant_id,
            extension_id,
        }
    }

    /// The namespace owned by an extension.
    pub fn of(descriptor: &ExtensionDescriptor) -> Self {
        Self::new(
            descriptor.tenant_id.clone(),
            descriptor.extension_id.clone(),
        )
    }
}

/// CRUD-shaped document store used underneath the storage gateway.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns the store's name, for logs.
    fn backend_name(&self) -> &'static str;

    async fn get(&self, ns: &Namespace, key: &str) -> StoreResult<Option<Value>>;

    /// Inserts or replaces the value under `key` atomically.
    async fn put(&self, ns: &Namespace, key: &str, value: Value) -> StoreResult<()>;

    /// Removes `key`, returning whether it existed.
    async fn delete(&self, ns: &Namespace, key: &str) -> StoreResult<bool>;

    /// Removes every entry in the namespace, returning how many were removed.
    async fn clear(&self, ns: &Namespace) -> StoreResult<u64>;

    /// Number of entries in the namespace.
    async fn count(&self, ns: &Namespace) -> StoreResult<u64>;
}

/// Process-local document store. Used in tests and single-node deployments.
#[derive(Default)]
pub struct MemoryDocumentStore {
    entries: RwLock<HashMap<Namespace, HashMap<String, Value>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, ns: &Namespace, key: &str) -> StoreResult<Option<Value>> {
        let entries = self.entries.read().await;
        Ok(entries.get(ns).and_then(|m| m.get(key)).cloned())
    }

    async fn put(&self, ns: &Namespace, key: &str, value: Value) -> StoreResult<()> {
        let mut entries = self.entries.write().await;
        entries
            .entry(ns.clone())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, ns: &Namespace, key: &str) -> StoreResult<bool> {
        let mut entries = self.entries.write().await;
        let removed = entries
            .get_mut(ns)
            .map(|m| m.remove(key).is_some())
            .unwrap_or(false);
        if entries.get(ns).is_some_and(|m| m.is_empty()) {
            entries.remove(ns);
        }
        Ok(removed)
    }

    async fn clear(&self, ns: &Namespace) -> StoreResult<u64> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(ns).map(|m| m.len() as u64).unwrap_or(0))
    }

    async fn count(&self, ns: &Namespace) -> StoreResult<u64> {
        let entries = self.entries.read().await;
        Ok(entries.get(ns).map(|m| m.len() as u64).unwrap_or(0))
    }
}
