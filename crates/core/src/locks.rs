use crate::error::{EngineError, EngineResult};
use crate::types::WorkflowId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = Arc<Mutex<HashMap<WorkflowId, Arc<AsyncMutex<()>>>>>;

/// One async mutex per workflow, acquired with a bounded wait.
///
/// Entries live only while someone holds or waits for them.
pub struct WorkflowLocks {
    locks: LockMap,
    wait: Duration,
}

/// Exclusive access to one workflow; released on drop
pub struct WorkflowGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
    id: WorkflowId,
}

impl Drop for WorkflowGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        forget_if_idle(&self.locks, &self.id);
    }
}

/// Remove the entry of `id` when the map holds the only reference
fn forget_if_idle(locks: &LockMap, id: &WorkflowId) {
    let mut locks = locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
        locks.remove(id);
    }
}

impl WorkflowLocks {
    pub fn new(wait: Duration) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            wait,
        }
    }

    fn lock_for(&self, id: WorkflowId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(id).or_default().clone()
    }

    /// Wait up to the configured duration; a zero wait only tries once
    pub async fn acquire(&self, id: WorkflowId) -> EngineResult<WorkflowGuard> {
        let lock = self.lock_for(id);
        let acquired = if self.wait.is_zero() {
            lock.try_lock_owned().ok()
        } else {
            tokio::time::timeout(self.wait, lock.lock_owned()).await.ok()
        };

        match acquired {
            Some(guard) => Ok(WorkflowGuard {
                guard: Some(guard),
                locks: Arc::clone(&self.locks),
                id,
            }),
            None => {
                forget_if_idle(&self.locks, &id);
                Err(EngineError::Busy(id))
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}
