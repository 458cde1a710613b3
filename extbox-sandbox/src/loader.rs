//! Script loading and validation.
//!
//! Source bytes come from a [`ScriptSource`] by code reference. Compiled
//! modules are immutable and cached by the SHA-256 of their source; the
//! per-execution `Store` never is.

use crate::error::{SandboxError, SandboxResult};
use extbox_store::{ScriptSource, StoreError};
use extbox_types::CodeRef;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};
use wasmtime::{Engine, ExternType, Module, ValType};

/// Name of the entry point every extension must export.
pub const ENTRY_POINT: &str = "run";

/// A compiled, validated extension module.
#[derive(Clone)]
pub struct LoadedModule {
    pub module: Module,
    /// Hex SHA-256 of the source bytes.
    pub digest: String,
    /// Whether `run` returns an i32 status (non-zero means failure).
    pub returns_status: bool,
}

/// Bounded cache of compiled modules keyed by source digest.
/// Evicts the least recently inserted or used entry when full.
pub struct ModuleCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    modules: HashMap<String, LoadedModule>,
    order: VecDeque<String>,
}

impl ModuleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn get(&self, digest: &str) -> Option<LoadedModule> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let hit = inner.modules.get(digest).cloned()?;
        inner.order.retain(|d| d != digest);
        inner.order.push_back(digest.to_string());
        Some(hit)
    }

    pub fn insert(&self, loaded: LoadedModule) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let digest = loaded.digest.clone();
        if inner.modules.insert(digest.clone(), loaded).is_some() {
            inner.order.retain(|d| d != &digest);
        }
        inner.order.push_back(digest);
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.modules.remove(&evicted);
                debug!(digest = %evicted, "Evicted compiled module");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .modules
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ExtensionLoader {
    engine: Engine,
    source: Arc<dyn ScriptSource>,
    cache: ModuleCache,
}

impl ExtensionLoader {
    pub fn new(engine: Engine, source: Arc<dyn ScriptSource>, cache_capacity: usize) -> Self {
        Self {
            engine,
            source,
            cache: ModuleCache::new(cache_capacity),
        }
    }

    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    /// Fetches, compiles and validates the script behind `code_ref`.
    /// Every failure is a [`SandboxError::Load`].
    pub async fn load(&self, code_ref: &CodeRef) -> SandboxResult<LoadedModule> {
        let bytes = self.source.fetch(code_ref).await.map_err(|e| match e {
            StoreError::NotFound(_) => SandboxError::Load(format!("unknown code ref '{code_ref}'")),
            other => SandboxError::Load(format!("failed to read '{code_ref}': {other}")),
        })?;
        let digest = hex::encode(Sha256::digest(&bytes));

        if let Some(hit) = self.cache.get(&digest) {
            debug!(code_ref = %code_ref, digest = %digest, "Compiled module cache hit");
            return Ok(hit);
        }

        let engine = self.engine.clone();
        let size_bytes = bytes.len();
        let compile_start = std::time::Instant::now();
        let module = tokio::task::spawn_blocking(move || Module::new(&engine, &bytes))
            .await
            .map_err(|e| SandboxError::Load(format!("compiler task failed: {e}")))?
            .map_err(|e| SandboxError::Load(format!("invalid module '{code_ref}': {e:#}")))?;
        info!(
            code_ref = %code_ref,
            size_bytes,
            elapsed_ms = compile_start.elapsed().as_millis() as u64,
            "Compiled extension module"
        );

        let returns_status = validate_entry_point(&module)
            .map_err(|reason| SandboxError::Load(format!("'{code_ref}': {reason}")))?;

        let loaded = LoadedModule {
            module,
            digest,
            returns_status,
        };
        self.cache.insert(loaded.clone());
        Ok(loaded)
    }
}

/// Checks that `run` exists with type `() -> ()` or `() -> i32`.
/// Returns whether it yields a status code.
fn validate_entry_point(module: &Module) -> Result<bool, String> {
    let Some(ExternType::Func(ty)) = module.get_export(ENTRY_POINT) else {
        return Err(format!("module does not export a function named '{ENTRY_POINT}'"));
    };
    if ty.params().len() != 0 {
        return Err(format!("'{ENTRY_POINT}' must take no parameters"));
    }
    let results: Vec<ValType> = ty.results().collect();
    match results.as_slice() {
        [] => Ok(false),
        [ValType::I32] => Ok(true),
        _ => Err(format!("'{ENTRY_POINT}' must return nothing or an i32")),
    }
}
