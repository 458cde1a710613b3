//! One isolate = one `wasmtime::Store`, created for a single execution.
//!
//! The [`Isolate`] guard owns the store and reports its disposal to the
//! [`IsolateTracker`] from `Drop`, so every exit path (success, trap,
//! timeout, failed instantiation, panic unwinding) releases it exactly once.

use crate::fetch::MediatedFetch;
use crate::storage::StorageGateway;
use extbox_types::ExtensionDescriptor;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use wasmtime::{Engine, ResourceLimiter, Store};

/// A resource limiter that tracks memory usage and remembers whether the
/// ceiling was hit, so a failed grow can be told apart from other traps.
pub struct TrackingLimiter {
    /// Maximum linear memory in bytes.
    max_memory: usize,
    current_memory: usize,
    ceiling_hit: bool,
    max_tables: usize,
    max_table_elements: usize,
    max_instances: usize,
    max_memories: usize,
}

impl TrackingLimiter {
    pub fn new(max_memory: usize) -> Self {
        Self {
            max_memory,
            current_memory: 0,
            ceiling_hit: false,
            max_tables: 10,
            max_table_elements: 10_000,
            max_instances: 10,
            max_memories: 1,
        }
    }

    pub fn current_memory_bytes(&self) -> usize {
        self.current_memory
    }

    pub fn ceiling_hit(&self) -> bool {
        self.ceiling_hit
    }
}

/// Raised from the limiter when a grow would pass the ceiling.
#[derive(Debug)]
pub struct MemoryCeilingExceeded {
    pub desired: usize,
    pub limit: usize,
}

impl fmt::Display for MemoryCeilingExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory growth to {} bytes exceeds the {} byte ceiling",
            self.desired, self.limit
        )
    }
}

impl std::error::Error for MemoryCeilingExceeded {}

impl ResourceLimiter for TrackingLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired <= self.max_memory {
            self.current_memory = desired;
            return Ok(true);
        }
        debug!(
            current,
            desired,
            max = self.max_memory,
            "Memory growth denied - would exceed limit"
        );
        self.ceiling_hit = true;
        // An error (not `Ok(false)`) makes `memory.grow` trap instead of
        // returning -1 to the guest.
        Err(wasmtime::Error::new(MemoryCeilingExceeded {
            desired,
            limit: self.max_memory,
        }))
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= self.max_table_elements)
    }

    fn instances(&self) -> usize {
        self.max_instances
    }

    fn tables(&self) -> usize {
        self.max_tables
    }

    fn memories(&self) -> usize {
        self.max_memories
    }
}

/// Data stored in each isolate's `Store`. Everything the host ABI can
/// reach is scoped to the one descriptor it was built for.
pub struct IsolateState {
    pub limiter: TrackingLimiter,
    pub descriptor: Arc<ExtensionDescriptor>,
    pub context_json: Vec<u8>,
    pub storage: StorageGateway,
    pub fetch: Arc<MediatedFetch>,
    pub replies: Vec<String>,
    pub output_bytes: usize,
    pub max_output_bytes: usize,
    /// Payload of the most recent fetch or storage read.
    pub last_result: Vec<u8>,
    /// Remaining `log` calls before further lines are dropped.
    pub log_budget: u32,
}

/// Per-isolate `log` allowance.
pub const LOG_LINES_PER_ISOLATE: u32 = 100;

#[derive(Default)]
struct TrackerCounts {
    created: AtomicU64,
    disposed: AtomicU64,
}

/// Counts isolates created and disposed across the engine's lifetime.
#[derive(Clone, Default)]
pub struct IsolateTracker {
    counts: Arc<TrackerCounts>,
}

impl IsolateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> u64 {
        self.counts.created.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> u64 {
        self.counts.disposed.load(Ordering::SeqCst)
    }

    /// Isolates currently alive.
    pub fn live(&self) -> u64 {
        self.created().saturating_sub(self.disposed())
    }
}

/// RAII owner of one isolate's store.
pub struct Isolate {
    store: Store<IsolateState>,
    tracker: IsolateTracker,
}

impl Isolate {
    /// Allocates a fresh store with the memory limiter and epoch yielding
    /// installed.
    pub fn new(engine: &Engine, state: IsolateState, tracker: &IsolateTracker) -> Self {
        let mut store = Store::new(engine, state);
        store.limiter(|s| &mut s.limiter);
        // Yield back to the executor at every epoch tick so the wall-clock
        // timeout can preempt guest code that never calls the host.
        store.set_epoch_deadline(1);
        store.epoch_deadline_async_yield_and_update(1);

        tracker.counts.created.fetch_add(1, Ordering::SeqCst);
        Self {
            store,
            tracker: tracker.clone(),
        }
    }

    pub fn store_mut(&mut self) -> &mut Store<IsolateState> {
        &mut self.store
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        self.tracker.counts.disposed.fetch_add(1, Ordering::SeqCst);
        debug!(
            extension_id = %self.store.data().descriptor.extension_id,
            memory_bytes = self.store.data().limiter.current_memory_bytes(),
            "Isolate disposed"
        );
    }
}
