//! Wasmtime-based extension sandbox for extbox.
//!
//! Runs untrusted, tenant-submitted extension scripts in single-shot
//! isolates with a memory ceiling and a wall-clock budget, and mediates the
//! one network primitive they get through an SSRF-safe capability policy
//! and a per-extension rate limiter.
//!
//! Each execution owns its own `wasmtime::Store`, created for one
//! [`ExecutionEngine::run`] call and dropped before it returns.

mod capability;
mod config;
mod engine;
mod error;
mod fetch;
mod host_abi;
mod isolate;
mod loader;
mod pool;
mod rate_limit;
mod ssrf;
mod storage;

pub use capability::{
    CapabilityPolicy, HostAllowlist, HostResolver, NetworkDenial, StaticResolver, SystemResolver,
    ValidatedUrl,
};
pub use config::{SandboxConfig, BUILTIN_ALLOWLIST, ENV_DEFAULT_ALLOWLIST};
pub use engine::{ExecutionEngine, ExecutionEngineBuilder};
pub use error::{BodyDirection, NetworkError, SandboxError, SandboxResult};
pub use fetch::{
    FetchLimits, FetchRequest, FetchResponse, HttpMethod, HttpTransport, MediatedFetch,
    ReqwestTransport, ResponseBody, TransportRequest, TransportResponse,
};
pub use host_abi::{AbiStatus, IMPORT_MODULE};
pub use isolate::IsolateTracker;
pub use loader::{ExtensionLoader, LoadedModule, ModuleCache, ENTRY_POINT};
pub use pool::{IsolatePool, PoolSaturated};
pub use rate_limit::{RateDecision, RateLimiter};
pub use ssrf::{is_blocked_ip, is_metadata_host};
pub use storage::{StorageGateway, StorageLimits};
