//! Top-level orchestrator: load, admit, isolate, run, classify, tear down.
//!
//! `ExecutionEngine::run` never fails and never panics outward. Every exit
//! path is mapped to an [`ExecutionResult`] variant, and the isolate guard
//! is dropped before the result is returned.

use crate::capability::{CapabilityPolicy, HostAllowlist, HostResolver, SystemResolver};
use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::fetch::{FetchLimits, HttpTransport, MediatedFetch, ReqwestTransport};
use crate::host_abi::{self, ScriptFailure};
use crate::isolate::{Isolate, IsolateState, IsolateTracker, TrackingLimiter, LOG_LINES_PER_ISOLATE};
use crate::loader::{ExtensionLoader, LoadedModule, ENTRY_POINT};
use crate::pool::IsolatePool;
use crate::rate_limit::RateLimiter;
use crate::storage::{StorageGateway, StorageLimits};
use extbox_store::{DocumentStore, MemoryDocumentStore, Namespace, ScriptSource};
use extbox_types::{Diagnostics, ExecutionContext, ExecutionResult, ExtensionDescriptor, InvocationId};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wasmtime::{Engine, Linker, Store, Trap};

/// Creates the wasmtime engine shared by every isolate.
fn create_shared_engine() -> SandboxResult<Engine> {
    let mut config = wasmtime::Config::new();
    config.async_support(true);
    config.epoch_interruption(true);
    Engine::new(&config).map_err(|e| SandboxError::Engine(e.to_string()))
}

/// Advances the engine epoch on a background thread so running guests
/// reach a yield point every tick.
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine, interval: Duration) -> SandboxResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("extbox-epoch-ticker".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    engine.increment_epoch();
                }
            })
            .map_err(|e| SandboxError::Engine(format!("failed to spawn epoch ticker: {e}")))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Terminal state of one execution, before diagnostics are attached.
enum Outcome {
    Completed(Vec<String>),
    Runtime(String),
    Timeout(u64),
    MemoryLimit(u64),
    Load(String),
    Setup(String),
}

impl Outcome {
    fn into_result(self, diagnostics: Diagnostics) -> ExecutionResult {
        match self {
            Outcome::Completed(replies) => ExecutionResult::Completed {
                diagnostics,
                replies,
            },
            Outcome::Runtime(message) => ExecutionResult::RuntimeError {
                diagnostics,
                message,
            },
            Outcome::Timeout(timeout_ms) => ExecutionResult::TimeoutError {
                diagnostics,
                timeout_ms,
            },
            Outcome::MemoryLimit(limit_bytes) => ExecutionResult::MemoryLimitError {
                diagnostics,
                limit_bytes,
            },
            Outcome::Load(reason) => ExecutionResult::LoadError {
                diagnostics,
                reason,
            },
            Outcome::Setup(reason) => ExecutionResult::SetupError {
                diagnostics,
                reason,
            },
        }
    }
}

enum InvokeError {
    Instantiate(wasmtime::Error),
    Guest(wasmtime::Error),
}

/// Builds an [`ExecutionEngine`]. Only the script source is mandatory.
pub struct ExecutionEngineBuilder {
    config: SandboxConfig,
    scripts: Option<Arc<dyn ScriptSource>>,
    documents: Option<Arc<dyn DocumentStore>>,
    transport: Option<Arc<dyn HttpTransport>>,
    resolver: Option<Arc<dyn HostResolver>>,
}

impl ExecutionEngineBuilder {
    pub fn scripts(mut self, scripts: Arc<dyn ScriptSource>) -> Self {
        self.scripts = Some(scripts);
        self
    }

    pub fn documents(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> SandboxResult<ExecutionEngine> {
        let config = self.config;
        let scripts = self
            .scripts
            .ok_or_else(|| SandboxError::Setup("no script source configured".into()))?;
        let documents: Arc<dyn DocumentStore> = match self.documents {
            Some(documents) => documents,
            None => Arc::new(MemoryDocumentStore::new()),
        };
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()),
        };
        let resolver: Arc<dyn HostResolver> = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(SystemResolver),
        };

        let engine = create_shared_engine()?;
        let mut linker = Linker::new(&engine);
        host_abi::add_to_linker(&mut linker)
            .map_err(|e| SandboxError::Engine(format!("failed to register host imports: {e}")))?;

        let policy = Arc::new(CapabilityPolicy::new(
            HostAllowlist::from_entries(&config.default_allowlist),
            resolver,
        ));
        let limiter = Arc::new(RateLimiter::new(config.rate_max_requests, config.rate_window()));
        let fetch = Arc::new(MediatedFetch::new(
            policy,
            limiter,
            transport,
            FetchLimits::from(&config),
        ));

        let loader = ExtensionLoader::new(
            engine.clone(),
            scripts,
            usize::try_from(config.module_cache_capacity).unwrap_or(usize::MAX),
        );
        let pool = IsolatePool::new(
            usize::try_from(config.max_concurrent_isolates).unwrap_or(usize::MAX),
            config.queue_timeout(),
        );
        let ticker = EpochTicker::start(engine.clone(), config.epoch_tick())?;

        info!(
            memory_limit_mb = config.isolate_memory_limit_mb,
            max_concurrent = config.max_concurrent_isolates,
            default_allowlist = config.default_allowlist.len(),
            storage = documents.backend_name(),
            "Execution engine ready"
        );

        Ok(ExecutionEngine {
            config,
            engine,
            linker,
            loader,
            fetch,
            documents,
            pool,
            tracker: IsolateTracker::new(),
            _ticker: ticker,
        })
    }
}

/// Runs extensions in single-shot isolates.
pub struct ExecutionEngine {
    config: SandboxConfig,
    engine: Engine,
    linker: Linker<IsolateState>,
    loader: ExtensionLoader,
    fetch: Arc<MediatedFetch>,
    documents: Arc<dyn DocumentStore>,
    pool: IsolatePool,
    tracker: IsolateTracker,
    _ticker: EpochTicker,
}

impl ExecutionEngine {
    pub fn builder(config: SandboxConfig) -> ExecutionEngineBuilder {
        ExecutionEngineBuilder {
            config,
            scripts: None,
            documents: None,
            transport: None,
            resolver: None,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Isolate accounting, shared with every isolate this engine creates.
    pub fn tracker(&self) -> &IsolateTracker {
        &self.tracker
    }

    pub fn pool(&self) -> &IsolatePool {
        &self.pool
    }

    pub fn loader(&self) -> &ExtensionLoader {
        &self.loader
    }

    /// Executes one extension for one trigger.
    pub async fn run(
        &self,
        descriptor: &ExtensionDescriptor,
        context: &ExecutionContext,
    ) -> ExecutionResult {
        let invocation_id = InvocationId::new();
        let started = Instant::now();

        let outcome = AssertUnwindSafe(self.execute(descriptor, context))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Outcome::Setup(format!("host panic: {}", panic_message(panic.as_ref())))
            });

        let diagnostics = Diagnostics {
            invocation_id,
            tenant_id: descriptor.tenant_id.clone(),
            extension_id: descriptor.extension_id.clone(),
            channel_id: context.channel_id.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        let result = outcome.into_result(diagnostics);

        let d = result.diagnostics();
        if result.is_completed() {
            debug!(
                invocation_id = %d.invocation_id,
                tenant_id = %d.tenant_id,
                extension_id = %d.extension_id,
                elapsed_ms = d.elapsed_ms,
                replies = result.replies().len(),
                "Extension completed"
            );
        } else {
            warn!(
                invocation_id = %d.invocation_id,
                tenant_id = %d.tenant_id,
                extension_id = %d.extension_id,
                channel_id = d.channel_id.as_ref().map(|c| c.as_str()).unwrap_or("-"),
                outcome = %result.kind(),
                detail = %result.failure_detail().unwrap_or_default(),
                elapsed_ms = d.elapsed_ms,
                "Extension did not complete"
            );
        }
        result
    }

    async fn execute(&self, descriptor: &ExtensionDescriptor, context: &ExecutionContext) -> Outcome {
        if context.tenant_id != descriptor.tenant_id {
            return Outcome::Setup(format!(
                "context tenant '{}' does not own extension '{}/{}'",
                context.tenant_id, descriptor.tenant_id, descriptor.extension_id
            ));
        }

        let loaded = match self.loader.load(&descriptor.code_ref).await {
            Ok(loaded) => loaded,
            Err(e) => return Outcome::Load(e.to_string()),
        };
        let context_json = match context.to_json_bytes() {
            Ok(json) => json,
            Err(e) => return Outcome::Setup(format!("failed to encode context: {e}")),
        };

        let _slot = match self.pool.admit().await {
            Ok(slot) => slot,
            Err(e) => return Outcome::Setup(e.to_string()),
        };

        let timeout_ms = descriptor
            .effective_timeout_ms(self.config.default_timeout_ms, self.config.max_timeout_ms);
        let memory_limit = self.config.memory_limit_bytes();

        let state = IsolateState {
            limiter: TrackingLimiter::new(memory_limit),
            descriptor: Arc::new(descriptor.clone()),
            context_json,
            storage: StorageGateway::new(
                Arc::clone(&self.documents),
                Namespace::of(descriptor),
                StorageLimits {
                    max_key_bytes: self.config.max_storage_key_bytes as usize,
                    max_value_bytes: self.config.max_storage_value_bytes as usize,
                },
            ),
            fetch: Arc::clone(&self.fetch),
            replies: Vec::new(),
            output_bytes: 0,
            max_output_bytes: self.config.max_output_bytes as usize,
            last_result: Vec::new(),
            log_budget: LOG_LINES_PER_ISOLATE,
        };
        let mut isolate = Isolate::new(&self.engine, state, &self.tracker);

        // Dropping the invocation future on timeout unwinds the guest and
        // any in-flight host call with it.
        let invocation = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            invoke(&self.linker, isolate.store_mut(), &loaded),
        )
        .await;

        let store = isolate.store_mut();
        match invocation {
            Err(_elapsed) => Outcome::Timeout(timeout_ms),
            Ok(Ok(0)) => Outcome::Completed(std::mem::take(&mut store.data_mut().replies)),
            Ok(Ok(status)) => Outcome::Runtime(format!("'{ENTRY_POINT}' returned status {status}")),
            Ok(Err(InvokeError::Instantiate(e))) => {
                if store.data().limiter.ceiling_hit() {
                    Outcome::MemoryLimit(memory_limit as u64)
                } else {
                    Outcome::Setup(format!("instantiation failed: {e:#}"))
                }
            }
            Ok(Err(InvokeError::Guest(e))) => classify_guest_error(&e, store, memory_limit),
        }
    }
}

async fn invoke(
    linker: &Linker<IsolateState>,
    store: &mut Store<IsolateState>,
    loaded: &LoadedModule,
) -> Result<i32, InvokeError> {
    let instance = linker
        .instantiate_async(&mut *store, &loaded.module)
        .await
        .map_err(InvokeError::Instantiate)?;

    if loaded.returns_status {
        let run = instance
            .get_typed_func::<(), i32>(&mut *store, ENTRY_POINT)
            .map_err(InvokeError::Instantiate)?;
        run.call_async(&mut *store, ()).await.map_err(InvokeError::Guest)
    } else {
        let run = instance
            .get_typed_func::<(), ()>(&mut *store, ENTRY_POINT)
            .map_err(InvokeError::Instantiate)?;
        run.call_async(&mut *store, ())
            .await
            .map(|()| 0)
            .map_err(InvokeError::Guest)
    }
}

fn classify_guest_error(
    e: &wasmtime::Error,
    store: &Store<IsolateState>,
    memory_limit: usize,
) -> Outcome {
    if store.data().limiter.ceiling_hit() {
        return Outcome::MemoryLimit(memory_limit as u64);
    }
    if let Some(failure) = e.downcast_ref::<ScriptFailure>() {
        return Outcome::Runtime(failure.to_string());
    }
    if let Some(trap) = e.downcast_ref::<Trap>() {
        return Outcome::Runtime(format!("wasm trap: {trap}"));
    }
    Outcome::Runtime(format!("{e:#}"))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
