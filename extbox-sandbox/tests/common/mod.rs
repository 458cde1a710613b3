//! Shared test helpers for sandbox tests.

#![allow(dead_code)]

use async_trait::async_trait;
use extbox_sandbox::{
    ExecutionEngine, HttpTransport, NetworkError, ResponseBody, SandboxConfig, StaticResolver,
    TransportRequest, TransportResponse,
};
use extbox_store::{MemoryDocumentStore, MemoryScriptSource};
use extbox_types::{
    ChannelId, CodeRef, ExecutionContext, ExtensionDescriptor, ExtensionId,
    NetworkCapabilityLevel, TenantId, TriggerShape, UserId,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PUBLIC_IP: &str = "93.184.215.14";
pub const EVIL_IP: &str = "104.16.0.1";

/// Resolver used by every test: public names, a private name, and a name
/// with one public and one private record.
pub fn test_resolver() -> StaticResolver {
    let public: IpAddr = PUBLIC_IP.parse().unwrap();
    StaticResolver::new()
        .with_host("api.example.com", &[public])
        .with_host("slow.example.com", &[public])
        .with_host("big.example.com", &[public])
        .with_host("evil.com", &[EVIL_IP.parse().unwrap()])
        .with_host("internal.example.com", &["10.0.0.7".parse().unwrap()])
        .with_host(
            "mixed.example.com",
            &[public, "192.168.0.10".parse().unwrap()],
        )
        .with_host("en.wikipedia.org", &["198.35.26.96".parse().unwrap()])
}

// ── Mock transport ───────────────────────────────────────────────

/// Canned response for one host.
#[derive(Debug, Clone)]
pub struct Route {
    pub status: u16,
    pub chunks: Vec<Vec<u8>>,
    pub content_length: Option<u64>,
    pub delay: Duration,
}

impl Route {
    pub fn ok(body: &str) -> Self {
        Self {
            status: 200,
            chunks: vec![body.as_bytes().to_vec()],
            content_length: Some(body.len() as u64),
            delay: Duration::ZERO,
        }
    }

    /// Body delivered in chunks with no declared length.
    pub fn streamed(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            status: 200,
            chunks,
            content_length: None,
            delay: Duration::ZERO,
        }
    }

    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

struct ChunkBody(VecDeque<Vec<u8>>);

#[async_trait]
impl ResponseBody for ChunkBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, NetworkError> {
        Ok(self.0.pop_front())
    }
}

/// Sets the flag if dropped while still armed, i.e. while a send was in flight.
struct InFlight {
    dropped: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.armed {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }
}

/// Records every request and answers from a per-host route table.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<TransportRequest>>,
    dropped_in_flight: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, host: &str, route: Route) {
        self.routes.lock().unwrap().insert(host.to_string(), route);
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// True once a send future was dropped before it finished.
    pub fn was_cancelled(&self) -> bool {
        self.dropped_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, NetworkError> {
        let route = self.routes.lock().unwrap().get(&request.host).cloned();
        self.requests.lock().unwrap().push(request.clone());
        let route =
            route.ok_or_else(|| NetworkError::Transport(format!("no route to {}", request.host)))?;

        let mut guard = InFlight {
            dropped: Arc::clone(&self.dropped_in_flight),
            armed: true,
        };
        if !route.delay.is_zero() {
            tokio::time::sleep(route.delay).await;
        }
        guard.armed = false;

        Ok(TransportResponse {
            status: route.status,
            headers: BTreeMap::new(),
            content_length: route.content_length,
            body: Box::new(ChunkBody(route.chunks.into())),
        })
    }
}

// ── Descriptors and contexts ─────────────────────────────────────

pub fn descriptor(tenant: &str, extension: &str, code_ref: &str) -> ExtensionDescriptor {
    ExtensionDescriptor::new(
        TenantId::from(tenant),
        ExtensionId::from(extension),
        CodeRef::from(code_ref),
        TriggerShape::Command {
            name: extension.into(),
        },
    )
}

pub fn networked(
    mut descriptor: ExtensionDescriptor,
    level: NetworkCapabilityLevel,
    approved: bool,
    allowlist: &[&str],
) -> ExtensionDescriptor {
    descriptor.network = level;
    descriptor.network_approved = approved;
    descriptor.allowlist = allowlist.iter().map(|h| h.to_string()).collect();
    descriptor
}

pub fn command_context(tenant: &str, args: &str) -> ExecutionContext {
    ExecutionContext::command(
        TenantId::from(tenant),
        ChannelId::from("general"),
        UserId::from("user-1"),
        args,
    )
}

// ── Engine harness ───────────────────────────────────────────────

/// Defaults trimmed for fast tests.
pub fn test_config() -> SandboxConfig {
    SandboxConfig {
        isolate_memory_limit_mb: 4,
        default_timeout_ms: 2_000,
        max_timeout_ms: 5_000,
        network_timeout_ms: 1_000,
        queue_timeout_ms: 200,
        epoch_tick_ms: 5,
        default_allowlist: Vec::new(),
        ..SandboxConfig::default()
    }
}

pub struct Harness {
    pub engine: Arc<ExecutionEngine>,
    pub scripts: Arc<MemoryScriptSource>,
    pub documents: Arc<MemoryDocumentStore>,
    pub transport: Arc<MockTransport>,
}

impl Harness {
    pub fn add_script(&self, code_ref: &str, source: impl Into<Vec<u8>>) {
        self.scripts.insert(CodeRef::from(code_ref), source.into());
    }
}

pub fn harness(config: SandboxConfig) -> Harness {
    let scripts = Arc::new(MemoryScriptSource::new());
    let documents = Arc::new(MemoryDocumentStore::new());
    let transport = Arc::new(MockTransport::new());
    let engine = ExecutionEngine::builder(config)
        .scripts(scripts.clone())
        .documents(documents.clone())
        .transport(transport.clone())
        .resolver(Arc::new(test_resolver()))
        .build()
        .unwrap();
    Harness {
        engine: Arc::new(engine),
        scripts,
        documents,
        transport,
    }
}

// ── WAT builders ─────────────────────────────────────────────────

/// Escapes `s` for a WAT string literal.
pub fn wat_str(s: &str) -> String {
    let mut out = String::new();
    for b in s.bytes() {
        match b {
            b'"' | b'\\' => out.push_str(&format!("\\{b:02x}")),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\{b:02x}")),
        }
    }
    out
}

const IMPORTS: &str = r#"
  (import "extbox" "context_len" (func $context_len (result i32)))
  (import "extbox" "context_read" (func $context_read (param i32 i32) (result i32)))
  (import "extbox" "last_len" (func $last_len (result i32)))
  (import "extbox" "last_read" (func $last_read (param i32 i32) (result i32)))
  (import "extbox" "reply" (func $reply (param i32 i32) (result i32)))
  (import "extbox" "fetch" (func $fetch (param i32 i32) (result i32)))
"#;

/// Replies once with `text`.
pub fn reply_script(text: &str) -> String {
    format!(
        r#"(module {IMPORTS}
  (memory (export "memory") 1)
  (data (i32.const 0) "{data}")
  (func (export "run")
    (drop (call $reply (i32.const 0) (i32.const {len})))))"#,
        data = wat_str(text),
        len = text.len(),
    )
}

/// Replies with the JSON context it was given.
pub fn echo_context_script() -> String {
    format!(
        r#"(module {IMPORTS}
  (memory (export "memory") 1)
  (func (export "run")
    (local $n i32)
    (local.set $n (call $context_read (i32.const 0) (i32.const 8192)))
    (drop (call $reply (i32.const 0) (local.get $n)))))"#
    )
}

/// Issues one fetch with `request` (a URL or a JSON request) and replies with
/// whatever the host left in the result buffer: the body, or the error JSON.
pub fn fetch_and_reply_script(request: &str) -> String {
    format!(
        r#"(module {IMPORTS}
  (memory (export "memory") 1)
  (data (i32.const 0) "{data}")
  (func (export "run")
    (local $n i32)
    (drop (call $fetch (i32.const 0) (i32.const {len})))
    (local.set $n (call $last_read (i32.const 1024) (i32.const 8192)))
    (drop (call $reply (i32.const 1024) (local.get $n)))))"#,
        data = wat_str(request),
        len = request.len(),
    )
}

/// Writes `key = value` into extension storage.
pub fn storage_write_script(key: &str, value: &str) -> String {
    format!(
        r#"(module
  (import "extbox" "storage_write" (func $write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "{key}")
  (data (i32.const 512) "{value}")
  (func (export "run") (result i32)
    (call $write (i32.const 0) (i32.const {klen}) (i32.const 512) (i32.const {vlen}))))"#,
        key = wat_str(key),
        value = wat_str(value),
        klen = key.len(),
        vlen = value.len(),
    )
}

/// Replies with the stored value for `key`, or "missing".
pub fn storage_read_script(key: &str) -> String {
    format!(
        r#"(module {IMPORTS}
  (import "extbox" "storage_get" (func $get (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "{key}")
  (data (i32.const 512) "missing")
  (func (export "run")
    (local $n i32)
    (local.set $n (call $get (i32.const 0) (i32.const {klen})))
    (if (i32.lt_s (local.get $n) (i32.const 0))
      (then (drop (call $reply (i32.const 512) (i32.const 7))))
      (else
        (local.set $n (call $last_read (i32.const 1024) (i32.const 8192)))
        (drop (call $reply (i32.const 1024) (local.get $n)))))))"#,
        key = wat_str(key),
        klen = key.len(),
    )
}

/// Spins forever without calling the host.
pub const INFINITE_LOOP: &str = r#"(module
  (func (export "run")
    (loop $l (br $l))))"#;

/// Grows memory one 64 KiB page at a time until the host refuses.
pub const MEMORY_HOG: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "run")
    (loop $l
      (drop (memory.grow (i32.const 1)))
      (br $l))))"#;

/// Declares 100 initial pages (6.25 MiB) of memory.
pub const LARGE_INITIAL_MEMORY: &str = r#"(module
  (memory (export "memory") 100)
  (func (export "run")))"#;

pub const UNREACHABLE: &str = r#"(module
  (func (export "run")
    unreachable))"#;

pub const NONZERO_STATUS: &str = r#"(module
  (func (export "run") (result i32)
    (i32.const 3)))"#;

pub const NO_ENTRY_POINT: &str = r#"(module
  (func (export "main")))"#;

pub const UNKNOWN_IMPORT: &str = r#"(module
  (import "env" "launch_missiles" (func))
  (func (export "run")))"#;

/// Calls `fail` with "boom".
pub const FAILING: &str = r#"(module
  (import "extbox" "fail" (func $fail (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "boom")
  (func (export "run")
    (call $fail (i32.const 0) (i32.const 4))))"#;
