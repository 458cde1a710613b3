//! Storage backends consumed by the extbox sandbox.
//!
//! Two external collaborators live here behind traits so the sandbox can be
//! tested without real infrastructure:
//! - [`DocumentStore`]: CRUD by namespaced key, the backing store of the
//!   script-facing storage gateway. In-memory and SQLite implementations.
//! - [`ScriptSource`] / [`DescriptorSource`]: read-only access to extension
//!   code and configuration, addressed by code reference or identity.

mod descriptors;
mod document;
mod error;
mod scripts;
mod sqlite;

pub use descriptors::{DescriptorSource, FsDescriptorSource, MemoryDescriptorSource};
pub use document::{DocumentStore, MemoryDocumentStore, Namespace};
pub use error::{StoreError, StoreResult};
pub use scripts::{FsScriptSource, MemoryScriptSource, ScriptSource};
pub use sqlite::SqliteDocumentStore;
