//! Read-only script sources, addressed by [`CodeRef`].

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use extbox_types::CodeRef;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Extensions supported by [`FsScriptSource`], in lookup order.
const SCRIPT_EXTENSIONS: [&str; 2] = ["wasm", "wat"];

/// Fetches script bytes by code reference.
#[async_trait]
pub trait ScriptSource: Send + Sync {
    /// Returns the script bytes, or [`StoreError::NotFound`].
    async fn fetch(&self, code_ref: &CodeRef) -> StoreResult<Vec<u8>>;
}

/// In-memory script source.
#[derive(Default)]
pub struct MemoryScriptSource {
    scripts: RwLock<HashMap<CodeRef, Vec<u8>>>,
}

impl MemoryScriptSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores (or replaces) the script under `code_ref`.
    pub fn insert(&self, code_ref: CodeRef, bytes: impl Into<Vec<u8>>) {
        let mut scripts = self
            .scripts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        scripts.insert(code_ref, bytes.into());
    }

    pub fn with_script(self, code_ref: CodeRef, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(code_ref, bytes);
        self
    }
}

#[async_trait]
impl ScriptSource for MemoryScriptSource {
    async fn fetch(&self, code_ref: &CodeRef) -> StoreResult<Vec<u8>> {
        let scripts = self
            .scripts
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        scripts
            .get(code_ref)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("script {code_ref}")))
    }
}

/// Script source backed by a directory: `<root>/<code_ref>.wasm`, then
/// `<root>/<code_ref>.wat`.
#[derive(Debug, Clone)]
pub struct FsScriptSource {
    root: PathBuf,
}

impl FsScriptSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Rejects references that would escape the source root.
pub(crate) fn validate_path_component(reference: &str) -> StoreResult<()> {
    if reference.is_empty()
        || reference == "."
        || reference.contains("..")
        || reference.contains('/')
        || reference.contains('\\')
        || reference.contains('\0')
    {
        return Err(StoreError::InvalidReference(reference.to_string()));
    }
    Ok(())
}

#[async_trait]
impl ScriptSource for FsScriptSource {
    async fn fetch(&self, code_ref: &CodeRef) -> StoreResult<Vec<u8>> {
        validate_path_component(code_ref.as_str())?;

        for ext in SCRIPT_EXTENSIONS {
            let path = self.root.join(format!("{}.{ext}", code_ref.as_str()));
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    debug!(path = %path.display(), size = bytes.len(), "Read script");
                    return Ok(bytes);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::NotFound(format!("script {code_ref}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_components_reject_traversal() {
        for bad in ["", ".", "..", "../etc/passwd", "a/b", "a\\b", "x..y"] {
            assert!(validate_path_component(bad).is_err(), "{bad:?}");
        }
        assert!(validate_path_component("weather-v3").is_ok());
        assert!(validate_path_component("sha256.abc123").is_ok());
    }
}
