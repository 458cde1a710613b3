//! Admission control for concurrent isolates.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

/// Caps live isolates. Callers queue for a slot up to `queue_timeout`.
#[derive(Clone)]
pub struct IsolatePool {
    slots: Arc<Semaphore>,
    capacity: usize,
    queue_timeout: Duration,
}

/// Held for the lifetime of one isolate.
pub struct PoolSlot {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("isolate pool saturated ({capacity} slots, waited {waited_ms}ms)")]
pub struct PoolSaturated {
    pub capacity: usize,
    pub waited_ms: u64,
}

impl IsolatePool {
    pub fn new(capacity: usize, queue_timeout: Duration) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            queue_timeout,
        }
    }

    pub async fn admit(&self) -> Result<PoolSlot, PoolSaturated> {
        let saturated = PoolSaturated {
            capacity: self.capacity,
            waited_ms: self.queue_timeout.as_millis() as u64,
        };
        match tokio::time::timeout(self.queue_timeout, Arc::clone(&self.slots).acquire_owned()).await
        {
            Ok(Ok(permit)) => Ok(PoolSlot { _permit: permit }),
            // The semaphore is never closed; treat it like saturation anyway.
            Ok(Err(_)) | Err(_) => {
                warn!(capacity = self.capacity, "Isolate pool saturated");
                Err(saturated)
            }
        }
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
